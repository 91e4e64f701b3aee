use super::DurableStore;
use crate::core::Result;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Process-local store. Nothing survives a restart; used by tests and by
/// sessions that only need the state machine.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read()?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write()?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write()?;
        entries.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self.entries.write()?;
        entries.clear();
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.read()?;
        Ok(entries.keys().cloned().collect())
    }
}
