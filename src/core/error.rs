use thiserror::Error;

/// Reasons a completion report did not reach an acknowledged state.
///
/// None of these are fatal: the delivery engine turns every variant into a
/// queued report for later replay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Collector answered HTTP {0}")]
    HttpStatus(u16),

    #[error("Malformed collector response: {0}")]
    Malformed(String),

    #[error("Collector did not acknowledge the report")]
    Rejected,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Identity assignment failed: {0}")]
    IdentityAssignment(String),

    #[error("Checkpoint {checkpoint} is outside 1..={max}")]
    InvalidCheckpoint { checkpoint: i64, max: u32 },

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryFailure),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

impl<T> From<std::sync::PoisonError<T>> for TrackerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Storage(format!("lock poisoned: {}", err))
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
