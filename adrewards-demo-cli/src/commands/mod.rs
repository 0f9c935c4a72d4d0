//! CLI command implementations

pub mod simulate;
pub mod status;
pub mod verify_proof;

use adrewards_confirmations::{ConfirmationsConfig, ConfirmationsStateStore};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// Load engine settings, falling back to defaults when no file is given
pub fn load_config(path: Option<&Path>) -> Result<ConfirmationsConfig> {
    let Some(path) = path else {
        return Ok(ConfirmationsConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: ConfirmationsConfig = serde_json::from_str(&json)
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid settings in {}", path.display()))?;
    Ok(config)
}

/// Open the state file, or an in-memory store when none is given
pub fn open_store(path: Option<&Path>) -> Result<Arc<ConfirmationsStateStore>> {
    let store = match path {
        Some(path) => ConfirmationsStateStore::open(path)
            .with_context(|| format!("Failed to open state file {}", path.display()))?,
        None => ConfirmationsStateStore::in_memory(),
    };
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        assert_eq!(load_config(None).unwrap(), ConfirmationsConfig::default());
    }

    #[test]
    fn test_partial_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"minimum_unblinded_tokens": 5, "maximum_unblinded_tokens": 8}"#)
            .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.minimum_unblinded_tokens, 5);
        assert_eq!(config.maximum_unblinded_tokens, 8);
        assert_eq!(config.retry_delay_secs, 15);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"minimum_unblinded_tokens": 90}"#).unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("minimum_unblinded_tokens"));
    }

    #[test]
    fn test_open_store_in_memory_without_path() {
        let store = open_store(None).unwrap();
        assert!(store.path().is_none());
    }
}
