use std::sync::Mutex;

use super::{RegistrySnapshot, RegistryStore};

/// In-memory snapshot holder; a drop-in for sessions that need no durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<RegistrySnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn load(&self) -> anyhow::Result<Option<RegistrySnapshot>> {
        let guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
        let mut guard = self
            .snapshot
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *guard = Some(snapshot.clone());
        Ok(())
    }
}
