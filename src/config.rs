use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlotwatchError};
use crate::registry::{OwnerId, RegistryLimits};
use crate::scanner::ScannerConfig;

pub(crate) const DEFAULT_BIND: &str = "127.0.0.1";
pub(crate) const DEFAULT_PORT: u16 = 3080;
pub(crate) const DEFAULT_HISTORY_DB: &str = "slotwatch.sqlite";
pub(crate) const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServiceConfig {
    #[serde(default = "default_bind")]
    pub(crate) bind: String,
    #[serde(default = "default_port")]
    pub(crate) port: u16,
    #[serde(default = "default_history_db")]
    pub(crate) history_db: PathBuf,
    #[serde(default)]
    pub(crate) admin_ids: Vec<OwnerId>,
    #[serde(default = "default_log_filter")]
    pub(crate) log_filter: String,
    #[serde(default)]
    pub(crate) limits: RegistryLimits,
    #[serde(default)]
    pub(crate) scanner: ScannerConfig,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_history_db() -> PathBuf {
    PathBuf::from(DEFAULT_HISTORY_DB)
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: DEFAULT_PORT,
            history_db: default_history_db(),
            admin_ids: Vec::new(),
            log_filter: default_log_filter(),
            limits: RegistryLimits::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.limits.global_slots == 0 || self.limits.owner_slots == 0 {
            return Err(SlotwatchError::invalid_config("slot limits must be positive"));
        }
        if self.limits.owner_slots > self.limits.global_slots {
            return Err(SlotwatchError::invalid_config(
                "limits.owner_slots cannot exceed limits.global_slots",
            ));
        }
        if self.scanner.interval_secs == 0 {
            return Err(SlotwatchError::invalid_config(
                "scanner.interval_secs must be positive",
            ));
        }
        Ok(())
    }

    /// Apply `SLOTWATCH_*` environment overrides on top of the file values.
    pub(crate) fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(env_optional)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(bind) = lookup("SLOTWATCH_BIND") {
            self.bind = bind;
        }
        if let Some(port) = lookup("SLOTWATCH_PORT") {
            self.port = port.parse().map_err(|_| {
                SlotwatchError::invalid_config(format!("SLOTWATCH_PORT is not a port: {port}"))
            })?;
        }
        if let Some(db) = lookup("SLOTWATCH_HISTORY_DB") {
            self.history_db = PathBuf::from(db);
        }
        if let Some(ids) = lookup("SLOTWATCH_ADMIN_IDS") {
            self.admin_ids = parse_id_list(&ids)?;
        }
        Ok(())
    }
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_id_list(raw: &str) -> Result<Vec<OwnerId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<OwnerId>().map_err(|_| {
                SlotwatchError::invalid_config(format!("invalid admin id: {part}"))
            })
        })
        .collect()
}

/// Load config from `path`. A missing file yields defaults; a malformed one is an error.
pub(crate) fn load_config(path: &Path) -> Result<ServiceConfig> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ServiceConfig::default());
        }
        Err(err) => return Err(SlotwatchError::io_at(err, path)),
    };
    let config: ServiceConfig = serde_json::from_str(&data)?;
    config.validate()?;
    Ok(config)
}

pub(crate) fn save_config(path: &Path, config: &ServiceConfig) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SlotwatchError::io_at(e, parent))?;
    }
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| SlotwatchError::io_at(e, &tmp))?;
    std::fs::rename(&tmp, path).map_err(|e| SlotwatchError::io_at(e, path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.limits.global_slots, 1000);
        assert_eq!(config.limits.owner_slots, 50);
        assert_eq!(config.scanner.interval_secs, 600);
        assert_eq!(config.scanner.threshold, 5);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 9000, "admin_ids": [1, 2], "scanner": {"threshold": 8}}"#,
        )
        .unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.admin_ids, vec![1, 2]);
        assert_eq!(config.scanner.threshold, 8);
        assert_eq!(config.scanner.window_secs, 600);
        assert_eq!(config.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(&path), Err(SlotwatchError::Json(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        config.limits.owner_slots = 2_000;
        assert!(matches!(
            config.validate(),
            Err(SlotwatchError::InvalidConfig { .. })
        ));
        config.limits.owner_slots = 10;
        config.scanner.interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg").join("config.json");
        let mut config = ServiceConfig::default();
        config.admin_ids = vec![7];
        config.limits.owner_slots = 20;
        save_config(&path, &config).unwrap();
        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SLOTWATCH_BIND", "0.0.0.0"),
            ("SLOTWATCH_PORT", "8123"),
            ("SLOTWATCH_ADMIN_IDS", "3, 4,,9"),
        ]);
        let mut config = ServiceConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 8123);
        assert_eq!(config.admin_ids, vec![3, 4, 9]);
        assert_eq!(config.history_db, PathBuf::from(DEFAULT_HISTORY_DB));

        let bad: HashMap<&str, &str> = HashMap::from([("SLOTWATCH_PORT", "nope")]);
        assert!(
            ServiceConfig::default()
                .apply_overrides(|name| bad.get(name).map(|v| v.to_string()))
                .is_err()
        );
    }
}
