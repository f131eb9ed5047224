use directories::{BaseDirs, ProjectDirs};
use eyre::{bail, eyre, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checksum::ChecksumType;

pub const MIB: u64 = 1024 * 1024;
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * MIB;
pub const DEFAULT_MAX_WORKERS: usize = 10;
pub const DEFAULT_WAIT_INTERVAL_SECS: u64 = 2;
pub const CONFIG_FILE_NAME: &str = "fetchtree.toml";

static CONFIG_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

/// Override the configuration directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_config_dir<P: AsRef<Path>>(path: P) {
    *CONFIG_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_config_dir_override() {
    CONFIG_DIR_OVERRIDE.write().take();
}

/// Resolve the configuration directory.
/// Priority: explicit override -> platform standard -> ~/.config/fetchtree
pub fn config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(proj) = ProjectDirs::from("com", "Fetchtree", "Fetchtree") {
        return Ok(proj.config_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".config").join("fetchtree"));
    }

    Err(eyre!(
        "unable to determine configuration directory for fetchtree (no override and no platform default)"
    ))
}

/// Tuning knobs for the walk/download pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total walker + coordinator thread budget, split evenly across the two roles.
    pub max_workers: usize,
    /// Fixed span of every chunk except possibly the last.
    pub chunk_size_bytes: u64,
    /// How often `wait_workers` re-checks the queue counters.
    pub worker_wait_interval_secs: u64,
    /// Chunk threads owned by each coordinator.
    pub chunk_workers: usize,
    /// In-place retries for chunks failing with a retryable error.
    pub chunk_retries: u8,
    /// Entity tag algorithm used by the bundled sinks.
    pub entity_tag: ChecksumType,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            worker_wait_interval_secs: DEFAULT_WAIT_INTERVAL_SECS,
            chunk_workers: num_cpus::get().clamp(2, 8),
            chunk_retries: 0,
            entity_tag: ChecksumType::default(),
        }
    }
}

impl FetchConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: FetchConfig = toml::from_str(raw).wrap_err("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load `<config dir>/fetchtree.toml` if it exists, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        let path = config_dir()?.join(CONFIG_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).wrap_err("failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        if self.chunk_size_bytes == 0 {
            bail!("chunk_size_bytes must be greater than zero");
        }
        if self.chunk_workers == 0 {
            bail!("chunk_workers must be at least 1");
        }
        Ok(())
    }

    /// Threads per worker class when the budget is split across `classes` roles.
    pub fn workers_per_class(&self, classes: usize) -> usize {
        (self.max_workers / classes.max(1)).max(1)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.worker_wait_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = FetchConfig::default();
        assert_eq!(cfg.max_workers, 10);
        assert_eq!(cfg.chunk_size_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.worker_wait_interval_secs, 2);
        assert_eq!(cfg.chunk_retries, 0);
        assert!((2..=8).contains(&cfg.chunk_workers));
        assert_eq!(cfg.workers_per_class(2), 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = FetchConfig::from_toml_str("max_workers = 4\nentity_tag = \"md5\"\n").unwrap();
        assert_eq!(cfg.max_workers, 4);
        assert_eq!(cfg.entity_tag, ChecksumType::Md5);
        assert_eq!(cfg.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        assert!(FetchConfig::from_toml_str("chunk_size_bytes = 0").is_err());
    }

    #[test]
    fn odd_budget_rounds_down_but_never_to_zero() {
        let cfg = FetchConfig {
            max_workers: 1,
            ..FetchConfig::default()
        };
        assert_eq!(cfg.workers_per_class(2), 1);
        let cfg = FetchConfig {
            max_workers: 7,
            ..FetchConfig::default()
        };
        assert_eq!(cfg.workers_per_class(2), 3);
    }

    #[test]
    fn toml_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let cfg = FetchConfig {
            chunk_retries: 3,
            ..FetchConfig::default()
        };
        std::fs::write(&path, cfg.to_toml_string().unwrap()).unwrap();
        assert_eq!(FetchConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn config_dir_honours_override() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path());
        assert_eq!(config_dir().unwrap(), dir.path());
        clear_config_dir_override();
    }
}
