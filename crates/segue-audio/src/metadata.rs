//! Established-gain storage consumed by the decode worker.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use segue_core::Result;

/// The narrow slice of the track database the engine reads and writes.
pub trait MetadataStore: Send + Sync {
    fn established_gain(&self, key: &str) -> Option<f32>;

    fn set_established_gain(&self, key: &str, gain: f32) -> Result<()>;
}

/// Process-local store; cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataStore {
    gains: Arc<RwLock<HashMap<String, f32>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.gains.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.gains.read().is_empty()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn established_gain(&self, key: &str) -> Option<f32> {
        self.gains.read().get(key).copied()
    }

    fn set_established_gain(&self, key: &str, gain: f32) -> Result<()> {
        self.gains.write().insert(key.to_string(), gain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

    use super::*;

    #[test]
    fn test_clones_share_table() {
        let store = MemoryMetadataStore::new();
        let other = store.clone();
        other.set_established_gain("a", 0.5).unwrap();
        assert_eq!(store.established_gain("a"), Some(0.5));
        assert_eq!(store.established_gain("b"), None);
        assert_eq!(store.len(), 1);
    }
}
