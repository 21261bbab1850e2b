//! Repository configuration.
//!
//! Configuration is read from a TOML file and passed explicitly to every
//! component that needs it. Every section and field has a default:
//!
//! ```toml
//! [database]
//! path = "data/arkive.sqlite"
//!
//! [storage]
//! root = "data/payloads"
//! tmp_dir = "data/tmp"
//! shard_depth = 2
//! dir_mode = "0770"
//! hash_algorithm = "sha256"
//!
//! [transactions]
//! timeout_ms = 30000
//!
//! [coordinator]
//! listen = "unix:/run/arkive/coordinator.sock"
//! ```

use crate::error::{CoreError, CoreResult};
pub use arkive_storage::PayloadConfig;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Complete repository configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct RepoConfig {
    /// Database settings.
    pub database: DatabaseConfig,
    /// Payload store settings.
    pub storage: PayloadConfig,
    /// Property names used for system triples.
    pub schema: SchemaConfig,
    /// Transaction timing settings.
    pub transactions: TransactionConfig,
    /// Coordinator socket settings.
    pub coordinator: CoordinatorConfig,
}

impl RepoConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parses the configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the text is not valid.
    pub fn from_toml(text: &str) -> CoreResult<Self> {
        toml::from_str(text).map_err(|e| CoreError::config(e.to_string()))
    }

    /// Creates a configuration with database and payloads below `dir`.
    #[must_use]
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            database: DatabaseConfig::new(dir.join("arkive.sqlite")),
            storage: PayloadConfig::new(dir.join("payloads")).with_tmp_dir(dir.join("tmp")),
            coordinator: CoordinatorConfig {
                listen: Endpoint::Unix(dir.join("coordinator.sock")),
            },
            ..Self::default()
        }
    }

    /// Sets the transaction settings.
    #[must_use]
    pub fn with_transactions(mut self, transactions: TransactionConfig) -> Self {
        self.transactions = transactions;
        self
    }

    /// Sets the coordinator endpoint.
    #[must_use]
    pub fn with_listen(mut self, listen: Endpoint) -> Self {
        self.coordinator.listen = listen;
        self
    }
}

/// Database settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,
    /// How long a connection waits for the database write lock.
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Creates database settings for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Returns the busy timeout.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/arkive.sqlite"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Property names of triples the repository writes itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Property under which identifiers appear in the history table.
    pub id_property: String,
    /// Property holding the payload digest.
    pub hash_property: String,
    /// Property holding the payload size.
    pub size_property: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            id_property: "urn:arkive:identifier".to_string(),
            hash_property: "urn:arkive:binaryHash".to_string(),
            size_property: "urn:arkive:binarySize".to_string(),
        }
    }
}

/// Transaction timing settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Heartbeat age after which an active transaction is rolled back.
    pub timeout_ms: u64,
    /// Interval between state polls of a coordinator worker.
    pub poll_interval_ms: u64,
    /// Upper bound of the poll backoff applied while the database fails.
    pub max_poll_backoff_ms: u64,
    /// Interval of the orphan sweeper.
    pub sweep_interval_ms: u64,
    /// How long a client waits for the coordinator to report an id.
    pub registration_timeout_ms: u64,
}

impl TransactionConfig {
    /// Returns the heartbeat timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the poll interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Returns the maximum poll backoff.
    #[must_use]
    pub fn max_poll_backoff(&self) -> Duration {
        Duration::from_millis(self.max_poll_backoff_ms.max(self.poll_interval_ms))
    }

    /// Returns the sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Returns the registration timeout.
    #[must_use]
    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }

    /// Sets the heartbeat timeout.
    #[must_use]
    pub const fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Sets the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            poll_interval_ms: 500,
            max_poll_backoff_ms: 10_000,
            sweep_interval_ms: 60_000,
            registration_timeout_ms: 10_000,
        }
    }
}

/// Coordinator socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Where the coordinator listens.
    pub listen: Endpoint,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: Endpoint::Tcp("127.0.0.1:5433".to_string()),
        }
    }
}

/// A coordinator socket address.
///
/// Written as `unix:/path/to.sock`, `tcp:host:port` or a bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Endpoint {
    /// TCP socket address.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(CoreError::config("empty unix socket path"));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        let addr = s.strip_prefix("tcp:").unwrap_or(s);
        if addr.rsplit_once(':').map_or(true, |(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(CoreError::config(format!("invalid tcp endpoint: {s}")));
        }
        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        value.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}
