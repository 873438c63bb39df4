use std::path::{Path, PathBuf};

use anyhow::Context;

use super::{RegistrySnapshot, RegistryStore};

/// Snapshot stored as one pretty-printed JSON document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonFileStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> anyhow::Result<Option<RegistrySnapshot>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", self.path.display()))
            }
        };
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("invalid registry document {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_string_pretty(snapshot)?)
            .with_context(|| format!("failed writing {}", staging.display()))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed replacing {}", self.path.display()))?;
        Ok(())
    }
}
