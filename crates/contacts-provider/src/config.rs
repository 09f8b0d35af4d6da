use crate::ProviderError;
use contacts_core::ContextKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "CONTACTS_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub data_dir: PathBuf,
    pub main_db_file: String,
    pub profile_db_file: String,
    pub log_level: String,
    pub fast_index_cache: bool,
    /// Attribute kind name to sub-type codes, best first.
    pub type_rank: BTreeMap<String, Vec<i64>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            main_db_file: "contacts2.db".to_string(),
            profile_db_file: "profile.db".to_string(),
            log_level: "info".to_string(),
            fast_index_cache: true,
            type_rank: BTreeMap::new(),
        }
    }
}

impl ProviderConfig {
    /// Reads the TOML file when present, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ProviderError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|err| {
                    ProviderError::Config(format!("read {}: {err}", path.display()))
                })?;
                Self::from_toml_str(&contents)?
            }
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ProviderError> {
        toml::from_str(contents).map_err(|err| ProviderError::Config(err.to_string()))
    }

    pub fn config_path_from_env() -> Option<PathBuf> {
        env::var(CONFIG_PATH_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }

    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ProviderError> {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = read("CONTACTS_DATA_DIR") {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = read("CONTACTS_MAIN_DB") {
            self.main_db_file = value;
        }
        if let Some(value) = read("CONTACTS_PROFILE_DB") {
            self.profile_db_file = value;
        }
        if let Some(value) = read("CONTACTS_LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = read("CONTACTS_FAST_INDEX_CACHE") {
            self.fast_index_cache = parse_flag("CONTACTS_FAST_INDEX_CACHE", &value)?;
        }
        Ok(())
    }

    pub fn db_path(&self, kind: ContextKind) -> PathBuf {
        match kind {
            ContextKind::Main => self.data_dir.join(&self.main_db_file),
            ContextKind::Profile => self.data_dir.join(&self.profile_db_file),
        }
    }

    pub fn type_rank_for(&self, kind: &str) -> Option<&[i64]> {
        self.type_rank.get(kind).map(Vec::as_slice)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ProviderError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ProviderError::Config(format!(
            "{key}: expected boolean, got {other:?}"
        ))),
    }
}
