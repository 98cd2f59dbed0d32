use crate::{error::CalcError, query::DEFAULT_PAGE_SIZE};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

/// Global static variable to hold the config provider.
pub static CONFIG_PROVIDER: OnceCell<Mutex<Arc<dyn ConfigProvider>>> = OnceCell::new();

const CALC_SECTION: &str = "calc";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalcConfig {
    /// Records per page when loading records or paging a whole table.
    pub chunk_size: usize,
    /// Timezone handed to the evaluator for formulas without one of their own.
    pub default_timezone: String,
    /// Upper bound on edge expansion rounds when loading a subgraph.
    pub max_graph_rounds: usize,
}

impl Default for CalcConfig {
    fn default() -> Self {
        CalcConfig {
            chunk_size: DEFAULT_PAGE_SIZE,
            default_timezone: "UTC".to_string(),
            max_graph_rounds: 64,
        }
    }
}

impl CalcConfig {
    pub fn from_toml_str(content: &str) -> Result<CalcConfig, CalcError> {
        let mut config: BTreeMap<String, CalcConfig> = toml::from_str(content)?;
        config
            .remove(CALC_SECTION)
            .ok_or_else(|| CalcError::NotFound("calc section not found in config".to_string()))
    }
}

pub trait ConfigProvider: Send + Sync {
    fn get_calc_config(&self) -> Result<CalcConfig, CalcError>;
    fn set_calc_config(&self, config: &CalcConfig) -> Result<(), CalcError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn get_calc_config(&self) -> Result<CalcConfig, CalcError> {
        tracing::debug!("Attempting to read calc config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using default calc config.");
            return Ok(CalcConfig::default());
        }
        let content = read_to_string(&self.path)?;
        CalcConfig::from_toml_str(&content)
    }

    fn set_calc_config(&self, config: &CalcConfig) -> Result<(), CalcError> {
        tracing::debug!("Attempting to write calc config to: {:?}", &self.path);
        let mut sections = BTreeMap::new();
        sections.insert(CALC_SECTION.to_string(), config);
        let toml_string = toml::to_string(&sections)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

/// Config from the global provider, or defaults when none is installed.
pub fn global_calc_config() -> Result<CalcConfig, CalcError> {
    let Some(provider) = CONFIG_PROVIDER.get() else {
        return Ok(CalcConfig::default());
    };
    let provider = provider
        .lock()
        .map_err(|e| CalcError::Cache(format!("config provider lock poisoned: {e}")))?
        .clone();
    provider.get_calc_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_log::test;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("absent.toml"));
        assert_eq!(provider.get_calc_config().unwrap(), CalcConfig::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("recalc.toml"));
        let config = CalcConfig {
            chunk_size: 2,
            default_timezone: "Asia/Tokyo".to_string(),
            max_graph_rounds: 8,
        };
        provider.set_calc_config(&config).unwrap();
        assert_eq!(provider.get_calc_config().unwrap(), config);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let config = CalcConfig::from_toml_str("[calc]\nchunk_size = 100\n").unwrap();
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.default_timezone, "UTC");
        assert!(matches!(
            CalcConfig::from_toml_str("[other]\n"),
            Err(CalcError::NotFound(_)) | Err(CalcError::Serialization(_))
        ));
    }
}
