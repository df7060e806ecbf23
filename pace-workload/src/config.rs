//! Driver configuration and built-in profiles.
//!
//! A configuration can be built in code, loaded from TOML, or taken from one
//! of the named profiles and then adjusted.
//!
//! # Example
//!
//! ```ignore
//! use pace_workload::config::{load_profile, DriverConfig};
//!
//! let config = load_profile("readback")?;
//! let custom = DriverConfig::from_file("soak.toml")?;
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::document::{DOCUMENT_SIZE_MAX, DOCUMENT_SIZE_MIN};
use crate::keys::KeyPolicy;

/// Endpoint selecting the in-process store.
pub const MEMORY_ENDPOINT: &str = "mem://";

/// Workload variant driven on top of the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadMode {
    /// Query the consistency view, then write a batch once it reports the
    /// expected row count.
    #[default]
    Consistency,
    /// Write a batch, read it back, verify every digest, repeat.
    Readback,
    /// Store one raw pattern value per cycle on a rotating key.
    SoakWrite,
    /// Fetch one key per cycle and compare it with its raw pattern.
    SoakCheck,
    /// Fetch one key and dump whatever comes back.
    SoakCapture,
}

impl WorkloadMode {
    /// Returns true for the single-key soak variants.
    #[must_use]
    pub const fn is_soak(self) -> bool {
        matches!(self, Self::SoakWrite | Self::SoakCheck | Self::SoakCapture)
    }
}

/// Distribution for document blob sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeDistribution {
    /// Fixed size for all documents.
    Fixed(usize),
    /// Uniform distribution between min and max.
    Uniform {
        /// Minimum size.
        min: usize,
        /// Maximum size.
        max: usize,
    },
}

impl SizeDistribution {
    /// Samples a size from the distribution.
    #[must_use]
    pub fn sample<R: Rng>(&self, rng: &mut R) -> usize {
        match self {
            Self::Fixed(size) => *size,
            Self::Uniform { min, max } => rng.gen_range(*min..=*max),
        }
    }

    /// Smallest size the distribution can produce.
    #[must_use]
    pub const fn min(&self) -> usize {
        match self {
            Self::Fixed(size) => *size,
            Self::Uniform { min, .. } => *min,
        }
    }

    /// Largest size the distribution can produce.
    #[must_use]
    pub const fn max(&self) -> usize {
        match self {
            Self::Fixed(size) => *size,
            Self::Uniform { max, .. } => *max,
        }
    }
}

impl Default for SizeDistribution {
    fn default() -> Self {
        Self::Fixed(16 * 1024 - 1)
    }
}

/// Fixed per-kind timeouts, applied when a connection is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Connect / configuration timeout in milliseconds.
    pub connect_ms: u64,
    /// Store timeout in milliseconds.
    pub store_ms: u64,
    /// Fetch timeout in milliseconds.
    pub fetch_ms: u64,
    /// View query timeout in milliseconds.
    pub view_ms: u64,
}

impl Timeouts {
    /// Uses the same timeout for every kind.
    #[must_use]
    pub const fn uniform(ms: u64) -> Self {
        Self {
            connect_ms: ms,
            store_ms: ms,
            fetch_ms: ms,
            view_ms: ms,
        }
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Store timeout.
    #[must_use]
    pub const fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    /// Fetch timeout.
    #[must_use]
    pub const fn fetch(&self) -> Duration {
        Duration::from_millis(self.fetch_ms)
    }

    /// View query timeout.
    #[must_use]
    pub const fn view(&self) -> Duration {
        Duration::from_millis(self.view_ms)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::uniform(3_000)
    }
}

/// Complete driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Profile name.
    pub name: String,
    /// Store endpoint: `host:port` of a memcached listener, or `mem://`.
    pub endpoint: String,
    /// HTTP `host:port` serving view queries.
    pub view_endpoint: Option<String>,
    /// Bucket the view path is resolved against.
    pub bucket: String,
    /// View path, including the query string.
    pub view_path: String,
    /// Workload variant.
    pub mode: WorkloadMode,
    /// Prefix prepended to every key serial.
    pub key_prefix: String,
    /// Key assignment policy.
    pub keys: KeyPolicy,
    /// Operations per batch (batch modes only).
    pub batch_size: u64,
    /// Document blob size.
    pub document_size: SizeDistribution,
    /// Seed for generated documents.
    pub seed: u64,
    /// Row count the consistency view must report before writing.
    pub expected_rows: u64,
    /// Stop cleanly after this many cycles. Runs until interrupted if unset.
    pub cycles: Option<u64>,
    /// Reconnect after a transport failure instead of exiting.
    pub reconnect: bool,
    /// Fixed pause before each reconnect, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Directory receiving captured payloads. Capture is disabled if unset.
    pub capture_dir: Option<PathBuf>,
    /// Log failed stores at `warn` instead of `debug`.
    pub log_store_failures: bool,
    /// Minimum interval between `info` status lines, in milliseconds.
    pub status_interval_ms: u64,
    /// Per-kind timeouts.
    pub timeouts: Timeouts,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "consistency".to_string(),
            endpoint: "127.0.0.1:11211".to_string(),
            view_endpoint: None,
            bucket: "default".to_string(),
            view_path: "/_design/check/_view/check?stale=false&connection_timeout=60000"
                .to_string(),
            mode: WorkloadMode::Consistency,
            key_prefix: "key:".to_string(),
            keys: KeyPolicy::Cyclic { pool_size: 10_000 },
            batch_size: 10_000,
            document_size: SizeDistribution::default(),
            seed: 0,
            expected_rows: 0,
            cycles: None,
            reconnect: true,
            reconnect_delay_ms: 500,
            capture_dir: None,
            log_store_failures: false,
            status_interval_ms: 1_000,
            timeouts: Timeouts::default(),
        }
    }
}

impl DriverConfig {
    /// Pause before each reconnect.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Minimum interval between `info` status lines.
    #[must_use]
    pub const fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Creates a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Serialize the configuration to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.is_empty() {
            return Err(invalid("endpoint must not be empty"));
        }
        if self.key_prefix.is_empty() {
            return Err(invalid("key_prefix must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size must be positive"));
        }

        let (min, max) = (self.document_size.min(), self.document_size.max());
        if min > max {
            return Err(invalid("document_size min must be <= max"));
        }
        if min < DOCUMENT_SIZE_MIN || max > DOCUMENT_SIZE_MAX {
            return Err(invalid(format!(
                "document_size must lie within {DOCUMENT_SIZE_MIN}..={DOCUMENT_SIZE_MAX}"
            )));
        }

        if let KeyPolicy::Cyclic { pool_size } = self.keys {
            if pool_size == 0 {
                return Err(invalid("pool_size must be positive"));
            }
            // A batch must not touch the same key twice.
            if !self.mode.is_soak() && pool_size < self.batch_size {
                return Err(invalid(format!(
                    "pool_size {pool_size} is smaller than batch_size {}",
                    self.batch_size
                )));
            }
        }

        if self.mode == WorkloadMode::Consistency {
            if self.view_path.is_empty() {
                return Err(invalid("consistency mode needs a view_path"));
            }
            if self.view_endpoint.is_none() && self.endpoint != MEMORY_ENDPOINT {
                return Err(invalid("consistency mode needs a view_endpoint"));
            }
        }

        if self.mode == WorkloadMode::SoakCapture && self.capture_dir.is_none() {
            return Err(invalid("soak-capture mode needs a capture_dir"));
        }

        let t = &self.timeouts;
        if t.connect_ms == 0 || t.store_ms == 0 || t.fetch_ms == 0 || t.view_ms == 0 {
            return Err(invalid("timeouts must be positive"));
        }

        if self.cycles == Some(0) {
            return Err(invalid("cycles must be positive when set"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Builder for [`DriverConfig`].
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// Sets the store endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Sets the view endpoint.
    #[must_use]
    pub fn view_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.view_endpoint = Some(endpoint.into());
        self
    }

    /// Sets the workload mode.
    #[must_use]
    pub const fn mode(mut self, mode: WorkloadMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Sets the key policy.
    #[must_use]
    pub const fn keys(mut self, keys: KeyPolicy) -> Self {
        self.config.keys = keys;
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub const fn batch_size(mut self, batch_size: u64) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Sets the document size distribution.
    #[must_use]
    pub const fn document_size(mut self, size: SizeDistribution) -> Self {
        self.config.document_size = size;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Sets the row count the consistency view must report.
    #[must_use]
    pub const fn expected_rows(mut self, rows: u64) -> Self {
        self.config.expected_rows = rows;
        self
    }

    /// Bounds the run to a number of cycles.
    #[must_use]
    pub const fn cycles(mut self, cycles: u64) -> Self {
        self.config.cycles = Some(cycles);
        self
    }

    /// Sets whether to reconnect after transport failures.
    #[must_use]
    pub const fn reconnect(mut self, reconnect: bool) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    /// Sets the pause before each reconnect.
    #[must_use]
    pub const fn reconnect_delay_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_delay_ms = ms;
        self
    }

    /// Sets whether failed stores are logged at `warn`.
    #[must_use]
    pub const fn log_store_failures(mut self, enabled: bool) -> Self {
        self.config.log_store_failures = enabled;
        self
    }

    /// Sets or clears the capture directory.
    #[must_use]
    pub fn capture_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.config.capture_dir = dir;
        self
    }

    /// Sets the per-kind timeouts.
    #[must_use]
    pub const fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

/// Error type for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading a configuration file.
    #[error("failed to read config from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parse error in TOML.
    #[error("failed to parse config: {message}")]
    Parse {
        /// Error message.
        message: String,
    },
    /// Profile not found.
    #[error("profile not found: {name}")]
    NotFound {
        /// Profile name.
        name: String,
    },
    /// A setting is out of range.
    #[error("invalid config: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
    },
}

/// Built-in profiles for the three workload families.
#[must_use]
pub fn builtin_profiles() -> HashMap<&'static str, DriverConfig> {
    let consistency = DriverConfig {
        view_endpoint: Some("127.0.0.1:8092".to_string()),
        capture_dir: Some(PathBuf::from(".")),
        ..DriverConfig::default()
    };

    let readback = DriverConfig {
        name: "readback".to_string(),
        mode: WorkloadMode::Readback,
        keys: KeyPolicy::Unique,
        batch_size: 1_000,
        document_size: SizeDistribution::Uniform { min: 64, max: 4096 },
        capture_dir: Some(PathBuf::from(".")),
        ..DriverConfig::default()
    };

    let soak = DriverConfig {
        name: "soak".to_string(),
        mode: WorkloadMode::SoakWrite,
        keys: KeyPolicy::Cyclic { pool_size: 100 },
        batch_size: 1,
        document_size: SizeDistribution::Fixed(19 * 1024 * 1024),
        capture_dir: Some(PathBuf::from(".")),
        reconnect: false,
        timeouts: Timeouts::uniform(10_000),
        ..DriverConfig::default()
    };

    HashMap::from([
        ("consistency", consistency),
        ("readback", readback),
        ("soak", soak),
    ])
}

/// Load a built-in profile by name.
///
/// # Errors
///
/// Returns an error if the profile name is not found.
pub fn load_profile(name: &str) -> Result<DriverConfig, ConfigError> {
    builtin_profiles()
        .remove(name)
        .ok_or_else(|| ConfigError::NotFound {
            name: name.to_string(),
        })
}

/// List all available built-in profile names.
#[must_use]
pub fn list_profiles() -> Vec<&'static str> {
    let mut names: Vec<_> = builtin_profiles().keys().copied().collect();
    names.sort_unstable();
    names
}
