use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the configured data directory.
pub const DATA_DIR_ENV: &str = "POSTVAULT_DATA_DIR";

/// Runtime configuration for the document store and dedup engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one JSON file per logical document
    pub data_dir: PathBuf,
    /// How long `acquire_lock` retries before giving up
    pub lock_timeout_ms: u64,
    /// Age after which a lock file is treated as abandoned
    pub lock_stale_ms: u64,
    /// Threshold seeded into a fresh content-graph document
    pub similarity_threshold: f32,
    /// Keep the raw text of content nodes (hash and vector are always kept)
    pub retain_content: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_timeout_ms: 5_000,
            lock_stale_ms: 10_000,
            similarity_threshold: 0.85,
            retain_content: true,
        }
    }
}

impl StoreConfig {
    /// Config rooted at an explicit data directory, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_millis(self.lock_stale_ms)
    }

    /// Apply `POSTVAULT_DATA_DIR` if it is set and non-empty.
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        self
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.similarity_threshold.is_finite() || !(0.0..=1.0).contains(&self.similarity_threshold) {
            anyhow::bail!(
                "similarity_threshold must be within 0.0..=1.0, got {}",
                self.similarity_threshold
            );
        }
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir must not be empty");
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("postvault.toml")
}

/// Per-user application directory, falling back to `./.postvault`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("postvault"))
        .unwrap_or_else(|| PathBuf::from(".postvault"))
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<StoreConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: StoreConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(Some(config))
}

/// Load the config file if present, else defaults; then apply the environment.
pub fn resolve_config(path: Option<&Path>) -> anyhow::Result<StoreConfig> {
    let config = load_config(path)?.unwrap_or_default();
    Ok(config.apply_env())
}

pub fn write_config(path: &Path, config: &StoreConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postvault.toml");
        std::fs::write(&path, "data_dir = \"/tmp/pv\"\nlock_timeout_ms = 250\n").unwrap();

        let config = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/pv"));
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.lock_stale_ms, 10_000);
        assert!(config.retain_content);
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postvault.toml");
        std::fs::write(&path, "similarity_threshold = 1.5\n").unwrap();

        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_write_config_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("postvault.toml");
        let config = StoreConfig::with_data_dir(dir.path());

        write_config(&path, &config, false).unwrap();
        assert!(write_config(&path, &config, false).is_err());
        write_config(&path, &config, true).unwrap();

        let reloaded = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(reloaded.data_dir, dir.path());
    }
}
