use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::metrics::process::SAMPLE_SIZE;

pub const DEFAULT_INTERVAL_MS: u64 = 50;
pub const BUFFER_PAGE_SIZE: usize = 4096;
pub const BUFFER_NUM_PAGES: usize = 128;
pub const DEFAULT_BUFFER_BYTES: usize = BUFFER_PAGE_SIZE * BUFFER_NUM_PAGES;
pub const DEFAULT_SHM_NAME: &str = "profring";
/// Largest accepted `buffer_bytes`, 1 GiB.
pub const MAX_BUFFER_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)] // missing keys fall back to the compiled-in defaults
#[serde(deny_unknown_fields)]
pub struct ProfilerConfig {
    /// Time between two sampler ticks.
    pub interval_ms: u64,
    /// Bytes reserved for samples; capacity is `buffer_bytes / 32`.
    pub buffer_bytes: usize,
    /// Name given to the memfd backing the sample buffer.
    pub shm_name: String,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            shm_name: DEFAULT_SHM_NAME.to_string(),
        }
    }
}

impl ProfilerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be > 0".into()));
        }
        if self.buffer_bytes < SAMPLE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer_bytes must hold at least one {SAMPLE_SIZE}-byte sample, got {}",
                self.buffer_bytes
            )));
        }
        if self.buffer_bytes > MAX_BUFFER_BYTES {
            return Err(ConfigError::Invalid(format!(
                "buffer_bytes must be at most {MAX_BUFFER_BYTES}, got {}",
                self.buffer_bytes
            )));
        }
        if self.shm_name.is_empty() || self.shm_name.contains('\0') {
            return Err(ConfigError::Invalid(
                "shm_name must be non-empty and free of NUL bytes".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn capacity(&self) -> usize {
        self.buffer_bytes / SAMPLE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_match_the_page_budget() {
        let config = ProfilerConfig::default();
        assert_eq!(config.interval(), Duration::from_millis(50));
        assert_eq!(config.buffer_bytes, 524_288);
        assert_eq!(config.capacity(), 16_384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ProfilerConfig::from_toml_str("interval_ms = 10\n").unwrap();
        assert_eq!(
            config,
            ProfilerConfig {
                interval_ms: 10,
                ..Default::default()
            }
        );
    }

    #[test]
    fn rejects_degenerate_values() {
        assert!(matches!(
            ProfilerConfig::from_toml_str("interval_ms = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ProfilerConfig::from_toml_str("buffer_bytes = 31"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ProfilerConfig::from_toml_str("bogus = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_oversized_buffers() {
        let config = ProfilerConfig {
            buffer_bytes: usize::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            ProfilerConfig::from_toml_str("buffer_bytes = 1073741825"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(ProfilerConfig::from_toml_str("buffer_bytes = 1073741824").is_ok());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "buffer_bytes = 96\nshm_name = \"test-ring\"").unwrap();
        let config = ProfilerConfig::load(file.path()).unwrap();
        assert_eq!(config.capacity(), 3);
        assert_eq!(config.shm_name, "test-ring");

        assert!(matches!(
            ProfilerConfig::load("/nonexistent/profring.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
