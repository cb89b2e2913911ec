use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

/// Tunables for a ratchet session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Upper bound on cached out-of-order message keys per session.
    pub skipped_key_capacity: usize,
    /// Most chain steps a single received header may force us to walk.
    pub max_skip: u32,
    /// Remote ratchet keys remembered for replay rejection. Older keys are
    /// forgotten once this many peer turns have passed.
    pub consumed_key_capacity: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            skipped_key_capacity: 1000,
            max_skip: 1000,
            consumed_key_capacity: 1000,
        }
    }
}

impl RatchetConfig {
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.skipped_key_capacity == 0 {
            return Err(CryptoError::Config("skipped_key_capacity must be at least 1".into()));
        }
        if self.max_skip == 0 {
            return Err(CryptoError::Config("max_skip must be at least 1".into()));
        }
        if self.consumed_key_capacity == 0 {
            return Err(CryptoError::Config("consumed_key_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, CryptoError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = RatchetConfig::from_json_str(r#"{ "max_skip": 50 }"#).unwrap();
        assert_eq!(config.max_skip, 50);
        assert_eq!(config.skipped_key_capacity, 1000);
        assert_eq!(config.consumed_key_capacity, 1000);
    }

    #[test]
    fn rejects_zero_bounds() {
        assert!(matches!(
            RatchetConfig::from_json_str(r#"{ "skipped_key_capacity": 0 }"#),
            Err(CryptoError::Config(_))
        ));
        assert!(matches!(
            RatchetConfig::from_json_str(r#"{ "max_skip": 0 }"#),
            Err(CryptoError::Config(_))
        ));
        assert!(matches!(
            RatchetConfig::from_json_str(r#"{ "consumed_key_capacity": 0 }"#),
            Err(CryptoError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratchet.json");
        std::fs::write(&path, r#"{ "skipped_key_capacity": 8, "max_skip": 4 }"#).unwrap();

        let config = RatchetConfig::load(&path).unwrap();
        assert_eq!(
            config,
            RatchetConfig {
                skipped_key_capacity: 8,
                max_skip: 4,
                ..RatchetConfig::default()
            }
        );
        assert!(matches!(
            RatchetConfig::load(&dir.path().join("missing.json")),
            Err(CryptoError::Io(_))
        ));
    }
}
