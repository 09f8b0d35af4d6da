use crate::{name::normalize, Account, RawContactId};
use std::fmt;

pub const PROFILE_SEGMENT: &str = "profile";
pub const SEGMENT_DELIMITER: char = ';';

const ACCOUNT_HASH_MASK: u32 = 0xFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentKind {
    SourceId,
    RawContactId,
    DisplayName,
    Profile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupKeySegment {
    pub kind: SegmentKind,
    pub account_hash: u32,
    /// Source id for `SourceId`, normalized display name for the other kinds.
    pub key: String,
    pub raw_contact_id: Option<RawContactId>,
}

impl LookupKeySegment {
    fn encode(&self, out: &mut String) {
        match self.kind {
            SegmentKind::Profile => out.push_str(PROFILE_SEGMENT),
            SegmentKind::SourceId => {
                out.push_str(&self.account_hash.to_string());
                if needs_escaping(&self.key) {
                    out.push('e');
                    out.push_str(&urlencoding::encode(&self.key));
                } else {
                    out.push('i');
                    out.push_str(&self.key);
                }
            }
            SegmentKind::RawContactId => {
                out.push_str(&self.account_hash.to_string());
                out.push('r');
                if let Some(raw_contact_id) = self.raw_contact_id {
                    out.push_str(&raw_contact_id.0.to_string());
                }
                out.push('-');
                out.push_str(&self.key);
            }
            SegmentKind::DisplayName => {
                out.push_str(&self.account_hash.to_string());
                out.push('n');
                out.push_str(&self.key);
            }
        }
    }

    fn decode(segment: &str) -> Option<Self> {
        if segment == PROFILE_SEGMENT {
            return Some(Self {
                kind: SegmentKind::Profile,
                account_hash: 0,
                key: String::new(),
                raw_contact_id: None,
            });
        }

        let digits = segment
            .char_indices()
            .find(|(_, ch)| !ch.is_ascii_digit())
            .map(|(index, _)| index)?;
        if digits == 0 {
            return None;
        }
        let account_hash = segment[..digits].parse::<u32>().ok()?;
        let mut rest = segment[digits..].chars();
        let type_char = rest.next()?;
        let payload = rest.as_str();

        match type_char {
            'i' if !payload.is_empty() => Some(Self {
                kind: SegmentKind::SourceId,
                account_hash,
                key: payload.to_string(),
                raw_contact_id: None,
            }),
            'e' => {
                let decoded = urlencoding::decode(payload).ok()?;
                if decoded.is_empty() {
                    return None;
                }
                Some(Self {
                    kind: SegmentKind::SourceId,
                    account_hash,
                    key: decoded.into_owned(),
                    raw_contact_id: None,
                })
            }
            'r' => {
                let (id, display_name) = payload.split_once('-')?;
                let raw_contact_id = id.parse::<i64>().ok()?;
                Some(Self {
                    kind: SegmentKind::RawContactId,
                    account_hash,
                    key: display_name.to_string(),
                    raw_contact_id: Some(RawContactId(raw_contact_id)),
                })
            }
            'n' if !payload.is_empty() => Some(Self {
                kind: SegmentKind::DisplayName,
                account_hash,
                key: payload.to_string(),
                raw_contact_id: None,
            }),
            _ => None,
        }
    }
}

/// A portable contact identity: the ordered segments contributed by the
/// raw contacts of one aggregate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupKey {
    segments: Vec<LookupKeySegment>,
}

impl LookupKey {
    /// Never fails: malformed segments are skipped, so an entirely
    /// unreadable key parses to an empty key that resolves to nothing.
    pub fn parse(input: &str) -> Self {
        let segments = input
            .split(SEGMENT_DELIMITER)
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .filter_map(LookupKeySegment::decode)
            .collect();
        Self { segments }
    }

    pub fn profile() -> Self {
        Self {
            segments: vec![LookupKeySegment {
                kind: SegmentKind::Profile,
                account_hash: 0,
                key: String::new(),
                raw_contact_id: None,
            }],
        }
    }

    pub fn segments(&self) -> &[LookupKeySegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn has_kind(&self, kind: SegmentKind) -> bool {
        self.segments.iter().any(|segment| segment.kind == kind)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                out.push(SEGMENT_DELIMITER);
            }
            segment.encode(&mut out);
        }
        f.write_str(&out)
    }
}

#[derive(Debug, Default)]
pub struct LookupKeyBuilder {
    segments: Vec<LookupKeySegment>,
}

impl LookupKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_source_id(&mut self, account: Option<&Account>, source_id: &str) -> &mut Self {
        self.segments.push(LookupKeySegment {
            kind: SegmentKind::SourceId,
            account_hash: account_hash(account),
            key: source_id.to_string(),
            raw_contact_id: None,
        });
        self
    }

    pub fn push_raw_contact(
        &mut self,
        account: Option<&Account>,
        raw_contact_id: RawContactId,
        display_name: Option<&str>,
    ) -> &mut Self {
        self.segments.push(LookupKeySegment {
            kind: SegmentKind::RawContactId,
            account_hash: account_hash(account),
            key: display_name.map(normalize).unwrap_or_default(),
            raw_contact_id: Some(raw_contact_id),
        });
        self
    }

    pub fn push_display_name(&mut self, account: Option<&Account>, display_name: &str) -> &mut Self {
        let key = normalize(display_name);
        if !key.is_empty() {
            self.segments.push(LookupKeySegment {
                kind: SegmentKind::DisplayName,
                account_hash: account_hash(account),
                key,
                raw_contact_id: None,
            });
        }
        self
    }

    pub fn build(&mut self) -> LookupKey {
        LookupKey {
            segments: std::mem::take(&mut self.segments),
        }
    }
}

pub fn account_hash(account: Option<&Account>) -> u32 {
    match account {
        None => 0,
        Some(account) => {
            let type_hash = java_string_hash(&account.account_type_with_data_set());
            let name_hash = java_string_hash(&account.account_name);
            (type_hash ^ name_hash) as u32 & ACCOUNT_HASH_MASK
        }
    }
}

fn java_string_hash(value: &str) -> i32 {
    value
        .encode_utf16()
        .fold(0_i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

fn needs_escaping(source_id: &str) -> bool {
    source_id
        .chars()
        .any(|ch| ch == SEGMENT_DELIMITER || ch == '%' || ch.is_control() || ch.is_whitespace())
}
