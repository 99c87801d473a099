//! Repository configuration.
//!
//! The `config` file uses a minimal `key=value` format:
//!
//! ```text
//! version=1
//! algo=blake3-256
//! gc.concurrency=256
//! gc.result_buffer=64
//! ```
//!
//! Blank lines and `#` comments are ignored, as are unknown keys.

use crate::error::{Error, Result};
use crate::hash::Algorithm;

/// Default number of deletes a sweep keeps in flight.
pub const DEFAULT_GC_CONCURRENCY: usize = 256;

/// Default number of completed results buffered ahead of the consumer.
pub const DEFAULT_GC_RESULT_BUFFER: usize = 64;

/// Environment variable overriding `gc.concurrency`.
pub const GC_CONCURRENCY_ENV: &str = "BLOCKGC_GC_CONCURRENCY";

/// Environment variable overriding `gc.result_buffer`.
pub const GC_RESULT_BUFFER_ENV: &str = "BLOCKGC_GC_RESULT_BUFFER";

/// Garbage collection settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Maximum concurrent delete operations.
    ///
    /// Default: 256.
    pub concurrency: usize,

    /// Maximum completed results waiting for the consumer.
    ///
    /// Default: 64.
    pub result_buffer: usize,

    /// Decide what to delete without deleting anything.
    ///
    /// Default: false.
    pub dry_run: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl GcConfig {
    /// Creates the default GC configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            concurrency: DEFAULT_GC_CONCURRENCY,
            result_buffer: DEFAULT_GC_RESULT_BUFFER,
            dry_run: false,
        }
    }

    /// Applies environment variable overrides.
    ///
    /// | Variable | Description | Default |
    /// |----------|-------------|---------|
    /// | `BLOCKGC_GC_CONCURRENCY` | Max in-flight deletes | 256 |
    /// | `BLOCKGC_GC_RESULT_BUFFER` | Buffered results | 64 |
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var(GC_CONCURRENCY_ENV)
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.concurrency = parsed.max(1);
        }
        if let Ok(v) = std::env::var(GC_RESULT_BUFFER_ENV)
            && let Ok(parsed) = v.parse::<usize>()
        {
            self.result_buffer = parsed.max(1);
        }
        self
    }

    /// Sets the maximum concurrent deletes.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the result buffer size.
    #[must_use]
    pub const fn with_result_buffer(mut self, result_buffer: usize) -> Self {
        self.result_buffer = result_buffer;
        self
    }

    /// Sets dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// Contents of a repository's `config` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoConfig {
    /// Hash algorithm for new blocks.
    pub algorithm: Algorithm,
    /// Garbage collection settings.
    pub gc: GcConfig,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Blake3,
            gc: GcConfig::default(),
        }
    }
}

impl RepoConfig {
    /// Parse the config file contents.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut algo = None;
        let mut gc = GcConfig::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim();
                match key.trim() {
                    "version" => version = Some(value),
                    "algo" => algo = Some(value),
                    "gc.concurrency" => gc.concurrency = parse_positive(key, value)?,
                    "gc.result_buffer" => gc.result_buffer = parse_positive(key, value)?,
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_config(format!(
                "Unsupported config version: {:?}",
                version
            )));
        }

        let algo_str = algo.ok_or_else(|| Error::invalid_config("Missing algo in config"))?;
        Ok(Self {
            algorithm: Algorithm::parse(algo_str)?,
            gc,
        })
    }

    /// Render the config file contents.
    pub fn render(&self) -> String {
        format!(
            "version=1\nalgo={}\ngc.concurrency={}\ngc.result_buffer={}\n",
            self.algorithm.as_str(),
            self.gc.concurrency,
            self.gc.result_buffer
        )
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(Error::invalid_config(format!(
            "{} must be a positive integer, got {:?}",
            key.trim(),
            value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = RepoConfig::parse("version=1\nalgo=blake3-256\n").unwrap();
        assert_eq!(config.algorithm, Algorithm::Blake3);
        assert_eq!(config.gc, GcConfig::default());
    }

    #[test]
    fn test_parse_config_with_comments_and_gc() {
        let content = "# repo\nversion=1\n\nalgo=blake3-256\ngc.concurrency = 8\ngc.result_buffer=2\nother=x\n";
        let config = RepoConfig::parse(content).unwrap();
        assert_eq!(config.gc.concurrency, 8);
        assert_eq!(config.gc.result_buffer, 2);
    }

    #[test]
    fn test_parse_config_invalid_version() {
        assert!(RepoConfig::parse("version=2\nalgo=blake3-256\n").is_err());
        assert!(RepoConfig::parse("algo=blake3-256\n").is_err());
    }

    #[test]
    fn test_parse_config_missing_algo() {
        assert!(RepoConfig::parse("version=1\n").is_err());
    }

    #[test]
    fn test_parse_config_rejects_zero_concurrency() {
        let err = RepoConfig::parse("version=1\nalgo=blake3-256\ngc.concurrency=0\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_render_parses_back() {
        let config = RepoConfig {
            algorithm: Algorithm::Blake3,
            gc: GcConfig::new().with_concurrency(4).with_result_buffer(16),
        };
        assert_eq!(RepoConfig::parse(&config.render()).unwrap(), config);
    }

    #[test]
    fn test_builders() {
        let gc = GcConfig::new().with_dry_run(true).with_concurrency(3);
        assert!(gc.dry_run);
        assert_eq!(gc.concurrency, 3);
        assert_eq!(gc.result_buffer, DEFAULT_GC_RESULT_BUFFER);
    }
}
