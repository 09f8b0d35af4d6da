pub mod lookup_key;
pub mod name;
pub mod operation;
pub mod phonebook;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown context: {0}")]
    UnknownContext(String),
    #[error("unknown aggregation mode: {0}")]
    UnknownAggregationMode(i64),
    #[error("unknown entity kind: {0}")]
    UnknownEntityKind(String),
    #[error("invalid attribute {key}: {reason}")]
    InvalidAttribute { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawContactId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncStateId(pub i64);

macro_rules! impl_id_display {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

impl_id_display!(ContactId, RawContactId, DataId, AccountId, SyncStateId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Main,
    Profile,
}

impl Default for ContextKind {
    fn default() -> Self {
        Self::Main
    }
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Main => "main",
            ContextKind::Profile => "profile",
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextKind {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "main" | "contacts" => Ok(ContextKind::Main),
            "profile" | "me" => Ok(ContextKind::Profile),
            other => Err(ContractError::UnknownContext(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Account {
    pub account_type: String,
    pub account_name: String,
    #[serde(default)]
    pub data_set: Option<String>,
}

impl Account {
    pub fn new(account_type: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            account_type: account_type.into(),
            account_name: account_name.into(),
            data_set: None,
        }
    }

    pub fn with_data_set(mut self, data_set: impl Into<String>) -> Self {
        self.data_set = Some(data_set.into());
        self
    }

    pub fn account_type_with_data_set(&self) -> String {
        match self.data_set.as_deref() {
            Some(data_set) if !data_set.is_empty() => {
                format!("{}/{}", self.account_type, data_set)
            }
            _ => self.account_type.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    Default,
    Immediate,
    Suspended,
    Disabled,
}

impl Default for AggregationMode {
    fn default() -> Self {
        Self::Default
    }
}

impl AggregationMode {
    pub fn code(&self) -> i64 {
        match self {
            AggregationMode::Default => 0,
            AggregationMode::Immediate => 1,
            AggregationMode::Suspended => 2,
            AggregationMode::Disabled => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ContractError> {
        match code {
            0 => Ok(AggregationMode::Default),
            1 => Ok(AggregationMode::Immediate),
            2 => Ok(AggregationMode::Suspended),
            3 => Ok(AggregationMode::Disabled),
            other => Err(ContractError::UnknownAggregationMode(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    StructuredName,
    Phone,
    Email,
    Nickname,
    Organization,
    Photo,
    GroupMembership,
    StructuredPostal,
    Im,
    Note,
    Website,
    Event,
    Custom(String),
}

impl AttributeKind {
    pub const BUILT_IN: [AttributeKind; 12] = [
        AttributeKind::StructuredName,
        AttributeKind::Phone,
        AttributeKind::Email,
        AttributeKind::Nickname,
        AttributeKind::Organization,
        AttributeKind::Photo,
        AttributeKind::GroupMembership,
        AttributeKind::StructuredPostal,
        AttributeKind::Im,
        AttributeKind::Note,
        AttributeKind::Website,
        AttributeKind::Event,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            AttributeKind::StructuredName => "name",
            AttributeKind::Phone => "phone",
            AttributeKind::Email => "email",
            AttributeKind::Nickname => "nickname",
            AttributeKind::Organization => "organization",
            AttributeKind::Photo => "photo",
            AttributeKind::GroupMembership => "group_membership",
            AttributeKind::StructuredPostal => "postal",
            AttributeKind::Im => "im",
            AttributeKind::Note => "note",
            AttributeKind::Website => "website",
            AttributeKind::Event => "event",
            AttributeKind::Custom(mimetype) => mimetype.as_str(),
        }
    }

    pub fn parse(input: &str) -> Self {
        match input.trim() {
            "name" | "structured_name" => AttributeKind::StructuredName,
            "phone" => AttributeKind::Phone,
            "email" => AttributeKind::Email,
            "nickname" => AttributeKind::Nickname,
            "organization" => AttributeKind::Organization,
            "photo" => AttributeKind::Photo,
            "group_membership" => AttributeKind::GroupMembership,
            "postal" | "structured_postal" => AttributeKind::StructuredPostal,
            "im" => AttributeKind::Im,
            "note" => AttributeKind::Note,
            "website" => AttributeKind::Website,
            "event" => AttributeKind::Event,
            other => AttributeKind::Custom(other.to_string()),
        }
    }

    pub fn display_name_source(&self) -> DisplayNameSource {
        match self {
            AttributeKind::StructuredName => DisplayNameSource::StructuredName,
            AttributeKind::Nickname => DisplayNameSource::Nickname,
            AttributeKind::Organization => DisplayNameSource::Organization,
            AttributeKind::Phone => DisplayNameSource::Phone,
            AttributeKind::Email => DisplayNameSource::Email,
            _ => DisplayNameSource::Undefined,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayNameSource {
    Undefined,
    Email,
    Phone,
    Organization,
    Nickname,
    StructuredName,
}

impl DisplayNameSource {
    pub fn code(&self) -> i64 {
        match self {
            DisplayNameSource::Undefined => 0,
            DisplayNameSource::Email => 10,
            DisplayNameSource::Phone => 20,
            DisplayNameSource::Organization => 30,
            DisplayNameSource::Nickname => 35,
            DisplayNameSource::StructuredName => 40,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            10 => DisplayNameSource::Email,
            20 => DisplayNameSource::Phone,
            30 => DisplayNameSource::Organization,
            35 => DisplayNameSource::Nickname,
            40 => DisplayNameSource::StructuredName,
            _ => DisplayNameSource::Undefined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameLookupType {
    NameExact,
    NameVariant,
    NameCollationKey,
    Nickname,
    EmailBasedNickname,
}

impl NameLookupType {
    pub fn code(&self) -> i64 {
        match self {
            NameLookupType::NameExact => 0,
            NameLookupType::NameVariant => 1,
            NameLookupType::NameCollationKey => 2,
            NameLookupType::Nickname => 3,
            NameLookupType::EmailBasedNickname => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(NameLookupType::NameExact),
            1 => Some(NameLookupType::NameVariant),
            2 => Some(NameLookupType::NameCollationKey),
            3 => Some(NameLookupType::Nickname),
            4 => Some(NameLookupType::EmailBasedNickname),
            _ => None,
        }
    }

    pub fn is_based_on_structured_name(&self) -> bool {
        matches!(
            self,
            NameLookupType::NameExact
                | NameLookupType::NameVariant
                | NameLookupType::NameCollationKey
        )
    }
}
