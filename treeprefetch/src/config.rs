//! Engine configuration.
//!
//! [`PrefetcherConfig`] holds the engine tunables. [`ConfigFile`] loads
//! them, together with the logging settings, from an INI file:
//!
//! ```text
//! [prefetch]
//! node_timeout_secs = 86400
//! status_interval_ms = 1000
//! low_space_threshold = 1GB
//! backoff_initial_ms = 500
//! backoff_max_ms = 60000
//! backoff_max_elapsed_secs = 900
//! backoff_multiplier = 1.5
//!
//! [logging]
//! level = info
//! directory = /var/log/treeprefetch
//! ```
//!
//! Unknown keys are ignored. Malformed values are reported as
//! [`PrefetchError::Config`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;

use crate::error::PrefetchError;
use crate::logging::LoggingConfig;

// =============================================================================
// Defaults
// =============================================================================

/// Absolute deadline of a node's request scope (24 hours).
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest accepted node deadline (one year).
pub const MAX_NODE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Minimum gap between two aggregate status publications.
pub const DEFAULT_OVERALL_STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Low-space notification threshold for the sync cache (1 GiB).
pub const DEFAULT_LOW_SPACE_THRESHOLD_BYTES: u64 = 1024 * 1024 * 1024;

pub const DEFAULT_BACKOFF_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_BACKOFF_RANDOMIZATION_FACTOR: f64 = 0.5;
pub const DEFAULT_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MAX_ELAPSED: Duration = Duration::from_secs(15 * 60);

/// File name looked up under the user configuration directory.
pub const CONFIG_FILE_NAME: &str = "config.ini";

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff used to reschedule top-level prefetches when the
/// cache is full.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each interval is randomized within `±randomization_factor`.
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// Rescheduling stops once this much time has passed since the first
    /// attempt. Zero means never stop.
    pub max_elapsed: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_BACKOFF_INITIAL_INTERVAL,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            randomization_factor: DEFAULT_BACKOFF_RANDOMIZATION_FACTOR,
            max_interval: DEFAULT_BACKOFF_MAX_INTERVAL,
            max_elapsed: DEFAULT_BACKOFF_MAX_ELAPSED,
        }
    }
}

// =============================================================================
// Prefetcher
// =============================================================================

/// Tunables of the prefetch engine.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use treeprefetch::config::PrefetcherConfig;
///
/// let config = PrefetcherConfig::default()
///     .with_overall_status_interval(Duration::from_millis(250))
///     .with_low_space_threshold(512 * 1024 * 1024);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct PrefetcherConfig {
    pub node_timeout: Duration,
    pub overall_status_interval: Duration,
    /// Used when the settings store has no per-volume threshold.
    pub low_space_threshold_bytes: u64,
    pub backoff: BackoffConfig,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            node_timeout: DEFAULT_NODE_TIMEOUT,
            overall_status_interval: DEFAULT_OVERALL_STATUS_INTERVAL,
            low_space_threshold_bytes: DEFAULT_LOW_SPACE_THRESHOLD_BYTES,
            backoff: BackoffConfig::default(),
        }
    }
}

impl PrefetcherConfig {
    /// Sets the node deadline, capped at [`MAX_NODE_TIMEOUT`].
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout.min(MAX_NODE_TIMEOUT);
        self
    }

    pub fn with_overall_status_interval(mut self, interval: Duration) -> Self {
        self.overall_status_interval = interval;
        self
    }

    pub fn with_low_space_threshold(mut self, bytes: u64) -> Self {
        self.low_space_threshold_bytes = bytes;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

// =============================================================================
// Config File
// =============================================================================

/// Settings loaded from an INI file.
#[derive(Clone, Debug, Default)]
pub struct ConfigFile {
    pub prefetch: PrefetcherConfig,
    pub logging: LoggingConfig,
}

impl ConfigFile {
    /// Loads a config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, PrefetchError> {
        let ini = Ini::load_from_file(path)
            .map_err(|e| PrefetchError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_ini(&ini)
    }

    /// Parses config text in INI syntax.
    pub fn parse(text: &str) -> Result<Self, PrefetchError> {
        let ini = Ini::load_from_str(text).map_err(|e| PrefetchError::Config(e.to_string()))?;
        Self::from_ini(&ini)
    }

    /// Loads the file at the default location, or returns defaults when
    /// there is no such file.
    pub fn load_default() -> Result<Self, PrefetchError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    fn from_ini(ini: &Ini) -> Result<Self, PrefetchError> {
        let mut config = ConfigFile::default();

        if let Some(section) = ini.section(Some("prefetch")) {
            let prefetch = &mut config.prefetch;
            if let Some(v) = section.get("node_timeout_secs") {
                let timeout = Duration::from_secs(parse_value("node_timeout_secs", v)?);
                if timeout > MAX_NODE_TIMEOUT {
                    return Err(PrefetchError::Config(format!(
                        "node_timeout_secs must be at most {}, got {}",
                        MAX_NODE_TIMEOUT.as_secs(),
                        timeout.as_secs()
                    )));
                }
                prefetch.node_timeout = timeout;
            }
            if let Some(v) = section.get("status_interval_ms") {
                prefetch.overall_status_interval =
                    Duration::from_millis(parse_value("status_interval_ms", v)?);
            }
            if let Some(v) = section.get("low_space_threshold") {
                prefetch.low_space_threshold_bytes = parse_size(v).ok_or_else(|| {
                    PrefetchError::Config(format!("invalid low_space_threshold: {}", v))
                })?;
            }
            if let Some(v) = section.get("backoff_initial_ms") {
                prefetch.backoff.initial_interval =
                    Duration::from_millis(parse_value("backoff_initial_ms", v)?);
            }
            if let Some(v) = section.get("backoff_max_ms") {
                prefetch.backoff.max_interval =
                    Duration::from_millis(parse_value("backoff_max_ms", v)?);
            }
            if let Some(v) = section.get("backoff_max_elapsed_secs") {
                prefetch.backoff.max_elapsed =
                    Duration::from_secs(parse_value("backoff_max_elapsed_secs", v)?);
            }
            if let Some(v) = section.get("backoff_multiplier") {
                let multiplier: f64 = parse_value("backoff_multiplier", v)?;
                if !multiplier.is_finite() || multiplier < 1.0 {
                    return Err(PrefetchError::Config(format!(
                        "backoff_multiplier must be a finite number of at least 1.0, got {}",
                        multiplier
                    )));
                }
                prefetch.backoff.multiplier = multiplier;
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            if let Some(v) = section.get("level") {
                config.logging.level = v.trim().to_string();
            }
            if let Some(v) = section.get("directory") {
                let v = v.trim();
                config.logging.directory = (!v.is_empty()).then(|| PathBuf::from(v));
            }
        }

        Ok(config)
    }
}

/// `<config_dir>/treeprefetch/config.ini`, when a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("treeprefetch").join(CONFIG_FILE_NAME))
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, PrefetchError> {
    value
        .trim()
        .parse()
        .map_err(|_| PrefetchError::Config(format!("invalid {}: {}", key, value)))
}

/// Parses a byte size such as `4096`, `512MB` or `1GB` (binary units).
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PrefetcherConfig::default();
        assert_eq!(config.node_timeout, Duration::from_secs(86_400));
        assert_eq!(config.overall_status_interval, Duration::from_secs(1));
        assert_eq!(config.low_space_threshold_bytes, 1 << 30);
        assert_eq!(config.backoff.initial_interval, Duration::from_millis(500));
        assert_eq!(config.backoff.max_elapsed, Duration::from_secs(900));
    }

    #[test]
    fn test_builder_methods() {
        let config = PrefetcherConfig::default()
            .with_node_timeout(Duration::from_secs(5))
            .with_low_space_threshold(42);
        assert_eq!(config.node_timeout, Duration::from_secs(5));
        assert_eq!(config.low_space_threshold_bytes, 42);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("2KB"), Some(2048));
        assert_eq!(parse_size("1 GB"), Some(1 << 30));
        assert_eq!(parse_size("512m"), Some(512 << 20));
        assert_eq!(parse_size("12XB"), None);
        assert_eq!(parse_size("GB"), None);
    }

    #[test]
    fn test_parse_config_text() {
        let config = ConfigFile::parse(
            "[prefetch]\n\
             status_interval_ms = 250\n\
             low_space_threshold = 10MB\n\
             backoff_multiplier = 2.0\n\
             unknown_key = whatever\n\
             [logging]\n\
             level = debug\n",
        )
        .unwrap();
        assert_eq!(
            config.prefetch.overall_status_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.prefetch.low_space_threshold_bytes, 10 << 20);
        assert_eq!(config.prefetch.backoff.multiplier, 2.0);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.directory, None);
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let err = ConfigFile::parse("[prefetch]\nnode_timeout_secs = soon\n").unwrap_err();
        assert!(matches!(err, PrefetchError::Config(_)));

        let err = ConfigFile::parse("[prefetch]\nbackoff_multiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, PrefetchError::Config(_)));
    }

    #[test]
    fn test_non_finite_multiplier_is_config_error() {
        for value in ["NaN", "inf", "-inf"] {
            let text = format!("[prefetch]\nbackoff_multiplier = {}\n", value);
            let err = ConfigFile::parse(&text).unwrap_err();
            assert!(matches!(err, PrefetchError::Config(_)), "accepted {}", value);
        }
    }

    #[test]
    fn test_oversized_node_timeout_is_rejected() {
        let text = format!("[prefetch]\nnode_timeout_secs = {}\n", u64::MAX);
        let err = ConfigFile::parse(&text).unwrap_err();
        assert!(matches!(err, PrefetchError::Config(_)));

        let config = PrefetcherConfig::default().with_node_timeout(Duration::MAX);
        assert_eq!(config.node_timeout, MAX_NODE_TIMEOUT);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[prefetch]\nnode_timeout_secs = 60\n[logging]\ndirectory = /tmp/tp-logs").unwrap();

        let config = ConfigFile::load(file.path()).unwrap();
        assert_eq!(config.prefetch.node_timeout, Duration::from_secs(60));
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/tmp/tp-logs"))
        );
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigFile::load(&dir.path().join("absent.ini")).unwrap_err();
        assert!(matches!(err, PrefetchError::Config(_)));
    }
}
