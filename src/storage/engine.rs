use crate::core::Result;

/// Durable string key/value store - allows pluggable persistence backends.
///
/// Every value is a plain string; structured values are JSON-encoded by the
/// caller. A successful `set`/`remove`/`clear` must survive a process restart
/// for backends that claim durability.
pub trait DurableStore: Send + Sync {
    /// Read the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`; removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key
    fn clear(&self) -> Result<()>;

    /// List all stored keys
    fn keys(&self) -> Result<Vec<String>>;
}
