//! TOML configuration file for the runtime.
//!
//! Every section and key is optional; missing values take their defaults.

use std::fs;
use std::path::Path;

use mnemo_core::RuntimeConfig;

use crate::error::{Result, StoreError};

pub fn parse_config(content: &str) -> Result<RuntimeConfig> {
    toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))
}

/// Read and parse `path`.
pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| StoreError::Config(format!("failed to read {}: {e}", path.display())))?;
    let config = parse_config(&content)?;
    validate(&config)?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: &Path) -> Result<RuntimeConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(RuntimeConfig::default())
    }
}

pub fn to_toml(config: &RuntimeConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| StoreError::Config(e.to_string()))
}

fn validate(config: &RuntimeConfig) -> Result<()> {
    let invalid = config.channels.invalid_names();
    if !invalid.is_empty() {
        return Err(StoreError::Config(format!(
            "invalid channel names: {}",
            invalid.join(", ")
        )));
    }
    if config.scope.trim().is_empty() {
        return Err(StoreError::Config("scope must not be empty".into()));
    }
    if config.decay.cycle_interval_ms == 0 {
        return Err(StoreError::Config("decay.cycle_interval_ms must be positive".into()));
    }
    if !(0.0..=1.0).contains(&config.decay.significance_threshold) {
        return Err(StoreError::Config(
            "decay.significance_threshold must be within [0, 1]".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_core::{DecayTiming, Phase};

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(parse_config("").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = parse_config(
            r#"
scope = "tab-7"

[decay]
decay_timing = "exponential"
overflow_threshold = 64

[phase]
cooldown_ms = 1000

[[phase.thresholds]]
from = "calm"
to = "consumed"
intensity = 8.0

[bridge]
allowed_origins = ["https://*.ward.example"]
"#,
        )
        .unwrap();
        assert_eq!(config.scope, "tab-7");
        assert_eq!(config.decay.decay_timing, DecayTiming::Exponential);
        assert_eq!(config.decay.overflow_threshold, 64);
        assert_eq!(config.decay.cycle_interval_ms, 5_000);
        assert_eq!(config.phase.cooldown_ms, 1_000);
        assert_eq!(config.phase.thresholds.len(), 1);
        assert_eq!(config.phase.threshold(Phase::Calm, Phase::Consumed), Some(8.0));
        assert_eq!(config.bridge.allowed_origins.len(), 1);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let text = to_toml(&RuntimeConfig::default()).unwrap();
        assert!(text.contains("[decay]"));
        assert_eq!(parse_config(&text).unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_unknown_timing_rejected() {
        let err = parse_config("[decay]\ndecay_timing = \"geometric\"\n").unwrap_err();
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn test_load_validates_channels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[channels]\nsystem_error = \"has space\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("has space"));
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert!(load_config(&dir.path().join("absent.toml")).is_err());
    }
}
