//! Config schema, loading, and persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::queue::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Queue used when a submission names none.
    pub default_queue: String,
    /// Wait applied before each queued item executes, in milliseconds.
    pub request_wait_ms: u64,
    /// Per-queue overrides of `request_wait_ms`.
    pub queue_wait_ms: BTreeMap<String, u64>,
    /// Default backoff for submissions without an explicit retry policy.
    pub backoff: Backoff,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            request_wait_ms: 0,
            queue_wait_ms: BTreeMap::new(),
            backoff: Backoff::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: None,
        }
    }
}

pub fn load(path: &Path) -> crate::Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

/// Load the config at `path`, falling back to (and writing) defaults when
/// it is missing or unreadable.
pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }
    let cfg = Config::default();
    if let Err(e) = write_config(path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> crate::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| config_error(format!("failed to create {}: {e}", dir.display())))?;
    }
    let contents = toml::to_string_pretty(cfg)
        .map_err(|e| config_error(format!("failed to render config: {e}")))?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> crate::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| config_error("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| {
        config_error(format!(
            "failed to create temp file in {}: {e}",
            dir.display()
        ))
    })?;
    fs::write(temp.path(), data)
        .map_err(|e| config_error(format!("failed to write config temp file: {e}")))?;
    temp.persist(path).map_err(|e| {
        config_error(format!(
            "failed to persist config to {}: {e}",
            path.display()
        ))
    })?;
    Ok(())
}

fn config_error(reason: String) -> crate::Error {
    crate::Error::Config(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut queue_wait_ms = BTreeMap::new();
        queue_wait_ms.insert("slow".to_string(), 500);
        let cfg = Config {
            default_queue: "main".to_string(),
            request_wait_ms: 50,
            queue_wait_ms,
            backoff: Backoff {
                delay_ms: 2_000,
                multiplier: 1.5,
                jitter_start: Some(0.1),
                jitter_end: None,
            },
            logging: LoggingConfig {
                stdout: false,
                filter: Some("silentq=debug".to_string()),
            },
        };
        write_config(&path, &cfg).expect("write config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded.default_queue, "main");
        assert_eq!(loaded.request_wait_ms, 50);
        assert_eq!(loaded.queue_wait_ms.get("slow"), Some(&500));
        assert_eq!(loaded.backoff.delay_ms, 2_000);
        assert_eq!(loaded.backoff.jitter_start, Some(0.1));
        assert!(!loaded.logging.stdout);
    }

    #[test]
    fn load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let cfg = load_or_init(&path);
        assert_eq!(cfg.default_queue, "default");
        assert!(path.exists());
        // second call reads what the first wrote
        let again = load_or_init(&path);
        assert_eq!(again.request_wait_ms, 0);
    }
}
