mod json_file;
mod memory;

use serde::{Deserialize, Serialize};

use crate::images::{GridCacheEntry, ImageId, RegisteredImage};

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

/// Full registry state: the `images` and `gridCache` tables plus the id counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    pub next_id: ImageId,
    #[serde(default)]
    pub images: Vec<(ImageId, RegisteredImage)>,
    #[serde(default)]
    pub grid_cache: Vec<(String, GridCacheEntry)>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            next_id: 1,
            images: Vec::new(),
            grid_cache: Vec::new(),
        }
    }
}

/// Durable home of a registry snapshot. Every mutation is flushed through
/// `save` as a whole snapshot, so implementations never see partial state.
pub trait RegistryStore: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> anyhow::Result<Option<RegistrySnapshot>>;
    fn save(&self, snapshot: &RegistrySnapshot) -> anyhow::Result<()>;
}
