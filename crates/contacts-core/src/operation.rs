use crate::{ContactId, ContractError, RawContactId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type AttributeMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    RawContact,
    Data,
    Contact,
    SyncState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationAction {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum Selection {
    LookupKey(String),
    Contact(ContactId),
    RawContact(RawContactId),
}

/// A resolved request: what to touch, with which values, on whose behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub entity_kind: EntityKind,
    pub action: OperationAction,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(default)]
    pub selection: Option<Selection>,
    #[serde(default)]
    pub caller_is_sync_adapter: bool,
}

impl OperationDescriptor {
    pub fn new(entity_kind: EntityKind, action: OperationAction) -> Self {
        Self {
            entity_kind,
            action,
            id: None,
            attributes: AttributeMap::new(),
            selection: None,
            caller_is_sync_adapter: false,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }

    pub fn from_sync_adapter(mut self) -> Self {
        self.caller_is_sync_adapter = true;
        self
    }
}

pub fn attr_string(attributes: &AttributeMap, key: &str) -> Result<Option<String>, ContractError> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(Value::Bool(value)) => Ok(Some(if *value { "1" } else { "0" }.to_string())),
        Some(_) => Err(invalid(key, "expected scalar value")),
    }
}

pub fn attr_i64(attributes: &AttributeMap, key: &str) -> Result<Option<i64>, ContractError> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(value)) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| invalid(key, "expected integer")),
        Some(Value::String(value)) => value
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(key, "expected integer")),
        Some(Value::Bool(value)) => Ok(Some(i64::from(*value))),
        Some(_) => Err(invalid(key, "expected integer")),
    }
}

pub fn attr_bool(attributes: &AttributeMap, key: &str) -> Result<Option<bool>, ContractError> {
    match attributes.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(value)) => Ok(Some(*value)),
        Some(Value::Number(value)) => value
            .as_i64()
            .map(|value| Some(value != 0))
            .ok_or_else(|| invalid(key, "expected boolean")),
        Some(Value::String(value)) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(Some(true)),
            "0" | "false" | "no" => Ok(Some(false)),
            _ => Err(invalid(key, "expected boolean")),
        },
        Some(_) => Err(invalid(key, "expected boolean")),
    }
}

fn invalid(key: &str, reason: &str) -> ContractError {
    ContractError::InvalidAttribute {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
