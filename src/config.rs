use crate::core::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_STAND_COUNT: u32 = 4;

/// Backoff applied to reconnect-triggered replays of the pending queue.
///
/// An entry that failed `attempts` times is not retried before
/// `min(initial_backoff_ms * 2^(attempts - 1), max_backoff_ms)` has elapsed
/// since its last attempt. There is no cap on the number of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayPolicy {
    /// Delay after the first failure in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 2_000,
            max_backoff_ms: 5 * 60_000,
        }
    }
}

impl ReplayPolicy {
    /// Retry on every signal.
    pub fn immediate() -> Self {
        Self {
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn backoff_ms(&self, attempts: u32) -> u64 {
        if attempts == 0 || self.initial_backoff_ms == 0 {
            return 0;
        }
        let max = self.max_backoff_ms.max(self.initial_backoff_ms);
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
        self.initial_backoff_ms.saturating_mul(factor).min(max)
    }
}

/// Stand tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Remote collector endpoint (`GET ?action=newAnon`, `POST` reports)
    pub collector_url: String,

    /// Number of stands a visitor must collect (N)
    pub stand_count: u32,

    /// Directory holding the durable state file
    pub data_dir: PathBuf,

    /// Per-request timeout for collector calls
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,

    /// Interval between connectivity probes in `watch` mode
    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,

    /// Backoff for reconnect-triggered replays
    pub replay: ReplayPolicy,
}

impl TrackerConfig {
    pub fn new(collector_url: &str) -> Self {
        Self {
            collector_url: collector_url.to_string(),
            stand_count: DEFAULT_STAND_COUNT,
            data_dir: PathBuf::from(".stand-tracker"),
            request_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_secs(15),
            replay: ReplayPolicy::default(),
        }
    }

    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::Config(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            TrackerError::Config(format!("Failed to parse config '{}': {}", path.display(), e))
        })
    }

    /// Set the collector URL
    pub fn collector_url(mut self, url: &str) -> Self {
        self.collector_url = url.to_string();
        self
    }

    /// Set the number of stands
    pub fn stand_count(mut self, count: u32) -> Self {
        self.stand_count = count;
        self
    }

    /// Set the data directory
    pub fn data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the connectivity probe interval
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the replay backoff policy
    pub fn replay(mut self, policy: ReplayPolicy) -> Self {
        self.replay = policy;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = self.collector_url.trim();
        if url.is_empty() {
            return Err(TrackerError::Config("collector_url cannot be empty".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TrackerError::Config(
                "collector_url must start with http:// or https://".to_string(),
            ));
        }
        if self.stand_count == 0 {
            return Err(TrackerError::Config("stand_count must be > 0".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(TrackerError::Config("request_timeout must be > 0".to_string()));
        }
        if self.probe_interval.is_zero() {
            return Err(TrackerError::Config("probe_interval must be > 0".to_string()));
        }
        if self.replay.max_backoff_ms < self.replay.initial_backoff_ms {
            return Err(TrackerError::Config(
                "replay.max_backoff_ms cannot be below replay.initial_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new("http://localhost:8080/exec")
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
