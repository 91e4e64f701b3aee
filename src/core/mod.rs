pub mod error;
pub mod types;

pub use error::{DeliveryFailure, Result, TrackerError};
pub use types::{AnonymousIdentity, PendingReport, ProgressView, ScanOutcome, SkipReason, Visit};
