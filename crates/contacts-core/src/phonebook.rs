pub const EMPTY_BUCKET: i64 = 0;
pub const OTHER_LETTER_BUCKET: i64 = 27;
pub const NUMBER_AND_SYMBOL_BUCKET: i64 = 28;
pub const NUMBER_AND_SYMBOL_LABEL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhonebookBucket {
    pub index: i64,
    pub label: String,
}

impl PhonebookBucket {
    fn empty() -> Self {
        Self {
            index: EMPTY_BUCKET,
            label: String::new(),
        }
    }
}

pub fn bucket_for(sort_key: Option<&str>) -> PhonebookBucket {
    let Some(first) = sort_key.and_then(|key| key.trim_start().chars().next()) else {
        return PhonebookBucket::empty();
    };

    if first.is_ascii_alphabetic() {
        let upper = first.to_ascii_uppercase();
        return PhonebookBucket {
            index: i64::from(upper as u8 - b'A') + 1,
            label: upper.to_string(),
        };
    }
    if first.is_alphabetic() {
        return PhonebookBucket {
            index: OTHER_LETTER_BUCKET,
            label: first.to_uppercase().collect(),
        };
    }
    PhonebookBucket {
        index: NUMBER_AND_SYMBOL_BUCKET,
        label: NUMBER_AND_SYMBOL_LABEL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_letters_map_to_alphabet_buckets() {
        assert_eq!(
            bucket_for(Some("ada")),
            PhonebookBucket {
                index: 1,
                label: "A".to_string()
            }
        );
        assert_eq!(bucket_for(Some("Zed")).index, 26);
    }

    #[test]
    fn non_letters_and_empty_keys_have_dedicated_buckets() {
        assert_eq!(bucket_for(Some("42")).label, "#");
        assert_eq!(bucket_for(Some("+1 555")).index, NUMBER_AND_SYMBOL_BUCKET);
        assert_eq!(bucket_for(None), PhonebookBucket::empty());
        assert_eq!(bucket_for(Some("   ")), PhonebookBucket::empty());
    }

    #[test]
    fn other_scripts_use_their_uppercase_letter() {
        let bucket = bucket_for(Some("élodie"));
        assert_eq!(bucket.index, OTHER_LETTER_BUCKET);
        assert_eq!(bucket.label, "É");
    }
}
