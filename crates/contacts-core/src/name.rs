use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

const DEFAULT_PREFIXES: [&str; 9] = ["mr", "mrs", "ms", "miss", "mx", "dr", "prof", "rev", "sir"];
const DEFAULT_SUFFIXES: [&str; 8] = ["jr", "sr", "ii", "iii", "iv", "phd", "md", "esq"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Name {
    pub prefix: Option<String>,
    pub given_names: Option<String>,
    pub middle_name: Option<String>,
    pub family_name: Option<String>,
    pub suffix: Option<String>,
    pub phonetic_given_name: Option<String>,
    pub phonetic_middle_name: Option<String>,
    pub phonetic_family_name: Option<String>,
}

impl Name {
    pub fn is_empty(&self) -> bool {
        [
            &self.prefix,
            &self.given_names,
            &self.middle_name,
            &self.family_name,
            &self.suffix,
            &self.phonetic_given_name,
            &self.phonetic_middle_name,
            &self.phonetic_family_name,
        ]
        .iter()
        .all(|part| non_empty(part.as_deref()).is_none())
    }

    pub fn has_structured_parts(&self) -> bool {
        [
            &self.prefix,
            &self.given_names,
            &self.middle_name,
            &self.family_name,
            &self.suffix,
        ]
        .iter()
        .any(|part| non_empty(part.as_deref()).is_some())
    }
}

/// Splits free-form names into structured components and joins them back.
pub trait NameSplitter: Send + Sync {
    fn split(&self, full_name: &str) -> Name;

    fn join(&self, name: &Name, given_name_first: bool, include_prefix: bool) -> Option<String>;

    fn join_phonetic(&self, name: &Name) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct SimpleNameSplitter {
    prefixes: BTreeSet<String>,
    suffixes: BTreeSet<String>,
}

impl Default for SimpleNameSplitter {
    fn default() -> Self {
        Self {
            prefixes: DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect(),
            suffixes: DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SimpleNameSplitter {
    fn is_prefix(&self, token: &str) -> bool {
        self.prefixes.contains(&fold_token(token))
    }

    fn is_suffix(&self, token: &str) -> bool {
        self.suffixes.contains(&fold_token(token))
    }

    /// Peels a leading prefix and a trailing suffix, leaving at least one token.
    fn take_affixes(&self, tokens: &mut Vec<&str>, name: &mut Name) {
        if tokens.len() > 1 && self.is_prefix(tokens[0]) {
            name.prefix = Some(tokens.remove(0).to_string());
        }
        if tokens.len() > 1 && self.is_suffix(tokens[tokens.len() - 1]) {
            name.suffix = tokens.pop().map(str::to_string);
        }
    }

    fn split_given_first(&self, full_name: &str) -> Name {
        let mut tokens = full_name.split_whitespace().collect::<Vec<_>>();
        let mut name = Name::default();
        if tokens.is_empty() {
            return name;
        }
        self.take_affixes(&mut tokens, &mut name);

        match tokens.len() {
            0 => {}
            1 => name.given_names = Some(tokens[0].to_string()),
            count => {
                name.given_names = Some(tokens[0].to_string());
                name.family_name = Some(tokens[count - 1].to_string());
                if count > 2 {
                    name.middle_name = Some(tokens[1..count - 1].join(" "));
                }
            }
        }
        name
    }

    fn split_family_first(&self, family: &str, rest: &str) -> Name {
        let mut tokens = rest.split_whitespace().collect::<Vec<_>>();
        let mut name = Name {
            family_name: Some(family.split_whitespace().collect::<Vec<_>>().join(" ")),
            ..Name::default()
        };
        self.take_affixes(&mut tokens, &mut name);

        if let Some((given, middle)) = tokens.split_first() {
            name.given_names = Some(given.to_string());
            if !middle.is_empty() {
                name.middle_name = Some(middle.join(" "));
            }
        }
        name
    }
}

impl NameSplitter for SimpleNameSplitter {
    /// Accepts "Given Middle Family" and the family-first "Family, Given Middle".
    /// A comma followed only by a suffix ("Ada Lovelace, Jr.") is not family-first.
    fn split(&self, full_name: &str) -> Name {
        if let Some((family, rest)) = full_name.split_once(',') {
            let (family, rest) = (family.trim(), rest.trim());
            if !family.is_empty() && !rest.is_empty() {
                if self.is_suffix(rest) {
                    let mut name = self.split_given_first(family);
                    name.suffix = Some(rest.to_string());
                    return name;
                }
                return self.split_family_first(family, rest);
            }
        }
        self.split_given_first(full_name)
    }

    fn join(&self, name: &Name, given_name_first: bool, include_prefix: bool) -> Option<String> {
        let prefix = if include_prefix {
            non_empty(name.prefix.as_deref())
        } else {
            None
        };
        let given = non_empty(name.given_names.as_deref());
        let middle = non_empty(name.middle_name.as_deref());
        let family = non_empty(name.family_name.as_deref());
        let suffix = non_empty(name.suffix.as_deref());

        let joined = if given_name_first {
            join_parts(&[prefix, given, middle, family, suffix])
        } else {
            let rest = join_parts(&[prefix, given, middle, suffix]);
            match (family, rest) {
                (Some(family), Some(rest)) => Some(format!("{family}, {rest}")),
                (Some(family), None) => Some(family.to_string()),
                (None, rest) => rest,
            }
        };
        joined.filter(|value| !value.is_empty())
    }

    fn join_phonetic(&self, name: &Name) -> Option<String> {
        join_parts(&[
            non_empty(name.phonetic_given_name.as_deref()),
            non_empty(name.phonetic_middle_name.as_deref()),
            non_empty(name.phonetic_family_name.as_deref()),
        ])
    }
}

/// Collation key used for name lookup and lookup-key display-name segments.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|ch| ch.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Local part of an email address, used as an implicit nickname.
pub fn email_handle(address: &str) -> Option<String> {
    static HANDLE: OnceLock<Regex> = OnceLock::new();
    let pattern = HANDLE
        .get_or_init(|| Regex::new(r"<?([^<>@\s]+)@[^<>@\s]+>?\s*$").expect("valid regex"));
    pattern
        .captures(address.trim())
        .and_then(|captures| captures.get(1))
        .map(|handle| handle.as_str().to_string())
}

fn fold_token(token: &str) -> String {
    token
        .trim_matches(|ch: char| ch == '.' || ch == ',')
        .to_lowercase()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn join_parts(parts: &[Option<&str>]) -> Option<String> {
    let joined = parts.iter().flatten().copied().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
