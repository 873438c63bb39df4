use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use muse_contracts::events::{EventWriter, SessionEvent};
use muse_contracts::store::JsonFileStore;
use tracing::info;
use uuid::Uuid;

use crate::config::SelectorConfig;
use crate::emit_event;
use crate::grid::GridCompositor;
use crate::oracle::{SelectionOracle, VisionJudge};
use crate::registry::ImageRegistry;
use crate::select::Selector;
use crate::sources::SourceRegistry;

/// On-disk layout of one session root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    root: PathBuf,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    pub fn grids_dir(&self) -> PathBuf {
        self.root.join("grids")
    }

    pub fn reference_dir(&self) -> PathBuf {
        self.root.join("reference")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.metadata_dir().join("image-registry.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.metadata_dir().join("events.jsonl")
    }

    /// Removes downloaded references and rendered grids. Both are named by
    /// registry ids, which restart with a cleared registry.
    fn reset_artifacts(&self) -> Result<()> {
        for dir in [self.grids_dir(), self.reference_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed clearing {}", dir.display()))
                }
            }
        }
        Ok(())
    }

    fn ensure(&self) -> Result<()> {
        for dir in [self.metadata_dir(), self.grids_dir(), self.reference_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed creating {}", dir.display()))?;
        }
        Ok(())
    }
}

/// The registry, event log and compositor shared by everything in one run.
pub struct Session {
    id: String,
    layout: SessionLayout,
    registry: Arc<ImageRegistry>,
    events: EventWriter,
    compositor: Arc<GridCompositor>,
}

impl Session {
    /// Opens `root` with a cleared registry, dropping the previous session's
    /// references and grids.
    pub fn start(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(SessionLayout::new(root), false)
    }

    /// Opens `root` keeping whatever the registry file already holds.
    pub fn resume(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(SessionLayout::new(root), true)
    }

    fn open(layout: SessionLayout, resume: bool) -> Result<Self> {
        if !resume {
            layout.reset_artifacts()?;
        }
        layout.ensure()?;
        let store = Box::new(JsonFileStore::new(layout.registry_path()));
        let http = reqwest::Client::new();
        let registry = Arc::new(if resume {
            ImageRegistry::load(store, layout.reference_dir(), http)
        } else {
            ImageRegistry::new(store, layout.reference_dir(), http)
        });

        let id = Uuid::new_v4().to_string();
        let events = EventWriter::new(layout.events_path(), id.clone());
        let compositor = Arc::new(
            GridCompositor::new(registry.clone(), layout.grids_dir()).with_events(events.clone()),
        );

        info!(session = %id, root = %layout.root().display(), resume, "session opened");
        emit_event(
            Some(&events),
            SessionEvent::SessionStarted {
                root: layout.root().display().to_string(),
                resumed: resume,
                images: registry.len(),
            },
        );

        Ok(Self {
            id,
            layout,
            registry,
            events,
            compositor,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    pub fn registry(&self) -> &Arc<ImageRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn compositor(&self) -> &Arc<GridCompositor> {
        &self.compositor
    }

    /// A selector wired to this session's compositor and event log.
    pub fn selector(
        &self,
        judge: Arc<dyn VisionJudge>,
        sources: SourceRegistry,
        config: SelectorConfig,
    ) -> Selector {
        let oracle = SelectionOracle::new(judge).with_events(self.events.clone());
        Selector::new(self.compositor.clone(), oracle, config)
            .with_sources(sources)
            .with_events(self.events.clone())
    }
}
