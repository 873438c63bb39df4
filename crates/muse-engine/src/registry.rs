use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{SecondsFormat, Utc};
use muse_contracts::images::{
    grid_content_hash, is_remote_ref, sorted_id_set, GridCacheEntry, ImageCategory, ImageId,
    ImageKind, RegisteredImage,
};
use muse_contracts::store::{RegistrySnapshot, RegistryStore};
use tracing::{debug, info, warn};

use crate::download::{copy_reference, download_reference};
use crate::error::RegistryError;

/// Session-scoped identity map for every image the pipeline touches.
///
/// Ids start at 1 and only grow. A reference string maps to exactly one id;
/// a downloaded remote reference answers to both its URL and its local path.
/// Every mutation flushes the whole snapshot to the store; store failures are
/// logged and the registry keeps working from memory.
pub struct ImageRegistry {
    store: Box<dyn RegistryStore>,
    reference_dir: PathBuf,
    http: reqwest::Client,
    state: Mutex<RegistryState>,
    /// Revision of the last snapshot the store accepted. Held while writing,
    /// never together with `state`.
    saved_revision: Mutex<u64>,
}

#[derive(Debug)]
struct RegistryState {
    next_id: ImageId,
    images: BTreeMap<ImageId, RegisteredImage>,
    ref_to_id: HashMap<String, ImageId>,
    grid_cache: BTreeMap<String, GridCacheEntry>,
    revision: u64,
}

impl RegistryState {
    fn fresh() -> Self {
        Self {
            next_id: 1,
            images: BTreeMap::new(),
            ref_to_id: HashMap::new(),
            grid_cache: BTreeMap::new(),
            revision: 0,
        }
    }

    fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let mut state = Self::fresh();
        for (id, image) in snapshot.images {
            state.ref_to_id.insert(image.path.clone(), id);
            if let Some(original) = &image.original_ref {
                state.ref_to_id.insert(original.clone(), id);
            }
            state.images.insert(id, image);
        }
        state.grid_cache = snapshot.grid_cache.into_iter().collect();
        let floor = state.images.keys().next_back().map_or(1, |max| max + 1);
        state.next_id = snapshot.next_id.max(floor);
        state
    }

    fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            next_id: self.next_id,
            images: self
                .images
                .iter()
                .map(|(id, image)| (*id, image.clone()))
                .collect(),
            grid_cache: self
                .grid_cache
                .iter()
                .map(|(hash, entry)| (hash.clone(), entry.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdValidation {
    pub valid: Vec<ImageId>,
    pub invalid: Vec<ImageId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalizeReport {
    pub downloaded: usize,
    pub failed: usize,
}

impl ImageRegistry {
    /// Starts an empty registry for a new session and persists the reset.
    pub fn new(
        store: Box<dyn RegistryStore>,
        reference_dir: impl Into<PathBuf>,
        http: reqwest::Client,
    ) -> Self {
        let registry = Self {
            store,
            reference_dir: reference_dir.into(),
            http,
            state: Mutex::new(RegistryState::fresh()),
            saved_revision: Mutex::new(0),
        };
        registry.clear();
        registry
    }

    /// Reopens whatever the store holds; an unreadable store starts empty.
    pub fn load(
        store: Box<dyn RegistryStore>,
        reference_dir: impl Into<PathBuf>,
        http: reqwest::Client,
    ) -> Self {
        let state = match store.load() {
            Ok(Some(snapshot)) => {
                let state = RegistryState::from_snapshot(snapshot);
                info!(
                    images = state.images.len(),
                    store = %store.describe(),
                    "loaded image registry"
                );
                state
            }
            Ok(None) => RegistryState::fresh(),
            Err(err) => {
                warn!(store = %store.describe(), "failed to load image registry: {err:#}");
                RegistryState::fresh()
            }
        };
        Self {
            store,
            reference_dir: reference_dir.into(),
            http,
            state: Mutex::new(state),
            saved_revision: Mutex::new(0),
        }
    }

    pub fn reference_dir(&self) -> &Path {
        &self.reference_dir
    }

    /// Registers `reference` and, for references, keeps a copy under the
    /// reference dir: remote URLs are downloaded and local files copied.
    ///
    /// The id and record exist before any I/O starts, so a concurrent
    /// registration of the same string gets the same id and one of a
    /// different string gets the next one.
    pub async fn register_image(
        &self,
        reference: &str,
        kind: ImageKind,
        category: ImageCategory,
        title: Option<&str>,
    ) -> Result<ImageId, RegistryError> {
        let (id, created) = self.reserve(reference, kind, category, title)?;
        if !created || kind != ImageKind::Reference {
            return Ok(id);
        }

        if is_remote_ref(reference) {
            match download_reference(&self.http, reference, &self.reference_dir, id).await {
                Ok(local_path) => self.attach_local_path(id, &local_path, reference),
                Err(err) => warn!(id, "keeping remote reference: {err}"),
            }
        } else if let Some(source) = self.foreign_local_file(reference).await {
            match copy_reference(&source, &self.reference_dir, id).await {
                Ok(local_path) => self.attach_local_path(id, &local_path, reference),
                Err(err) => warn!(id, "keeping local reference in place: {err}"),
            }
        }
        Ok(id)
    }

    /// An existing file outside the reference dir.
    async fn foreign_local_file(&self, reference: &str) -> Option<PathBuf> {
        if reference.starts_with("data:") || reference.contains("://") {
            return None;
        }
        let path = PathBuf::from(reference);
        if path.starts_with(&self.reference_dir) {
            return None;
        }
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        metadata.is_file().then_some(path)
    }

    /// Same contract as [`ImageRegistry::register_image`] without any download.
    pub fn register_image_sync(
        &self,
        reference: &str,
        kind: ImageKind,
        category: ImageCategory,
        title: Option<&str>,
    ) -> Result<ImageId, RegistryError> {
        self.reserve(reference, kind, category, title)
            .map(|(id, _)| id)
    }

    fn reserve(
        &self,
        reference: &str,
        kind: ImageKind,
        category: ImageCategory,
        title: Option<&str>,
    ) -> Result<(ImageId, bool), RegistryError> {
        if reference.trim().is_empty() {
            return Err(RegistryError::EmptyReference);
        }
        let mut state = self.lock();
        if let Some(id) = state.ref_to_id.get(reference).copied() {
            if let Some(existing) = state.images.get(&id) {
                if existing.category != category {
                    warn!(
                        id,
                        registered = %existing.category,
                        requested = %category,
                        "reference already registered under another category; keeping the first"
                    );
                }
            }
            return Ok((id, false));
        }

        let id = state.next_id;
        state.next_id += 1;
        state.images.insert(
            id,
            RegisteredImage {
                id,
                path: reference.to_string(),
                kind,
                category,
                title: title.map(str::to_string),
                original_ref: None,
                timestamp: now_utc_iso(),
            },
        );
        state.ref_to_id.insert(reference.to_string(), id);
        self.commit(state);
        debug!(id, kind = ?kind, %category, reference, "registered image");
        Ok((id, true))
    }

    fn attach_local_path(&self, id: ImageId, local_path: &Path, original: &str) {
        let local = local_path.to_string_lossy().to_string();
        let mut state = self.lock();
        let Some(image) = state.images.get_mut(&id) else {
            return;
        };
        image.path = local.clone();
        image.original_ref = Some(original.to_string());
        state.ref_to_id.insert(local, id);
        self.commit(state);
    }

    pub fn image(&self, id: ImageId) -> Option<RegisteredImage> {
        self.lock().images.get(&id).cloned()
    }

    pub fn id_by_ref(&self, reference: &str) -> Option<ImageId> {
        self.lock().ref_to_id.get(reference).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images_by_category(&self, category: ImageCategory) -> Vec<RegisteredImage> {
        self.lock()
            .images
            .values()
            .filter(|image| image.category == category)
            .cloned()
            .collect()
    }

    pub fn ids_for_category(&self, category: ImageCategory) -> Vec<ImageId> {
        self.images_by_category(category)
            .into_iter()
            .map(|image| image.id)
            .collect()
    }

    /// 1-based grid position to id over a category, in id order.
    pub fn grid_mapping(&self, category: ImageCategory) -> BTreeMap<usize, ImageId> {
        self.ids_for_category(category)
            .into_iter()
            .enumerate()
            .map(|(idx, id)| (idx + 1, id))
            .collect()
    }

    pub fn resolve(
        &self,
        id: ImageId,
        expected: ImageCategory,
    ) -> Result<RegisteredImage, RegistryError> {
        match self.image(id) {
            Some(image) if image.category == expected => Ok(image),
            other => Err(RegistryError::InvalidIdentity {
                id,
                expected,
                actual: other.map(|image| image.category),
                valid_ids: self.ids_for_category(expected),
            }),
        }
    }

    pub fn resolve_many(
        &self,
        ids: &[ImageId],
        expected: ImageCategory,
    ) -> Result<Vec<RegisteredImage>, RegistryError> {
        ids.iter().map(|id| self.resolve(*id, expected)).collect()
    }

    pub fn validate_ids(&self, ids: &[ImageId], expected: ImageCategory) -> IdValidation {
        let mut validation = IdValidation::default();
        for id in ids {
            if self.resolve(*id, expected).is_ok() {
                validation.valid.push(*id);
            } else {
                validation.invalid.push(*id);
            }
        }
        validation
    }

    /// Render path for this id set under `grid_label`, if its file still exists.
    pub fn cached_grid(&self, ids: &[ImageId], grid_label: &str) -> Option<GridCacheEntry> {
        let hash = grid_content_hash(grid_label, ids);
        let entry = self.lock().grid_cache.get(&hash).cloned()?;
        if !Path::new(&entry.render_path).exists() {
            debug!(grid_label, path = %entry.render_path, "cached grid file is gone");
            return None;
        }
        Some(entry)
    }

    /// Records a render. `drawn_ids` is the row-major order of the cells.
    pub fn cache_grid(&self, render_path: &Path, drawn_ids: &[ImageId], grid_label: &str) {
        let content_hash = grid_content_hash(grid_label, drawn_ids);
        let entry = GridCacheEntry {
            render_path: render_path.to_string_lossy().to_string(),
            source_image_ids: sorted_id_set(drawn_ids),
            grid_label: grid_label.to_string(),
            content_hash: content_hash.clone(),
            timestamp: now_utc_iso(),
            cell_order: drawn_ids.to_vec(),
        };
        let mut state = self.lock();
        state.grid_cache.insert(content_hash, entry);
        self.commit(state);
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        let revision = state.revision;
        *state = RegistryState::fresh();
        state.revision = revision;
        self.commit(state);
    }

    /// Retries the download of every reference that still points at a URL.
    pub async fn localize_references(&self) -> LocalizeReport {
        let pending: Vec<(ImageId, String)> = self
            .lock()
            .images
            .values()
            .filter(|image| image.kind == ImageKind::Reference && image.is_remote())
            .map(|image| (image.id, image.path.clone()))
            .collect();

        let mut report = LocalizeReport::default();
        for (id, url) in pending {
            match download_reference(&self.http, &url, &self.reference_dir, id).await {
                Ok(local_path) => {
                    self.attach_local_path(id, &local_path, &url);
                    report.downloaded += 1;
                }
                Err(err) => {
                    warn!(id, "reference still remote: {err}");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub fn summary(&self) -> String {
        let mut summary = String::from("=== Image Registry Summary ===\n");
        for category in ImageCategory::ALL {
            let images = self.images_by_category(category);
            if images.is_empty() {
                continue;
            }
            summary.push_str(&format!(
                "\n{} ({} images):\n",
                category.as_str().to_ascii_uppercase(),
                images.len()
            ));
            for image in images {
                let name = Path::new(&image.path)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| image.path.clone());
                summary.push_str(&format!("  #{}: {name}", image.id));
                if let Some(title) = &image.title {
                    summary.push_str(&format!(" - \"{title}\""));
                }
                summary.push('\n');
            }
        }
        summary
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bumps the revision and hands a snapshot to the store after releasing
    /// the state lock. A snapshot older than one already saved is skipped.
    fn commit(&self, mut state: MutexGuard<'_, RegistryState>) {
        state.revision += 1;
        let revision = state.revision;
        let snapshot = state.snapshot();
        drop(state);

        let mut saved = self
            .saved_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *saved >= revision {
            return;
        }
        match self.store.save(&snapshot) {
            Ok(()) => *saved = revision,
            Err(err) => {
                warn!(store = %self.store.describe(), "failed to persist image registry: {err:#}")
            }
        }
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use futures::future::join_all;
    use muse_contracts::store::{JsonFileStore, MemoryStore};

    use super::*;
    use crate::test_support::{png_bytes, write_png, FailingStore, StaticServer};

    fn memory_registry(reference_dir: &Path) -> ImageRegistry {
        ImageRegistry::new(
            Box::new(MemoryStore::new()),
            reference_dir,
            reqwest::Client::new(),
        )
    }

    fn generated(
        registry: &ImageRegistry,
        path: &str,
        category: ImageCategory,
        title: Option<&str>,
    ) -> anyhow::Result<ImageId> {
        Ok(registry.register_image_sync(path, ImageKind::Generated, category, title)?)
    }

    fn inspiration(registry: &ImageRegistry, reference: &str) -> anyhow::Result<ImageId> {
        let kind = ImageKind::Reference;
        Ok(registry.register_image_sync(reference, kind, ImageCategory::Inspiration, None)?)
    }

    #[tokio::test]
    async fn registering_same_ref_twice_returns_same_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        let first = registry
            .register_image("/tmp/a.png", ImageKind::Generated, ImageCategory::Draft, None)
            .await?;
        let second = registry
            .register_image("/tmp/a.png", ImageKind::Generated, ImageCategory::Draft, None)
            .await?;
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn ids_start_at_one_and_restart_after_clear() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        let ids: Vec<ImageId> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                registry.register_image_sync(
                    &format!("/tmp/{name}.png"),
                    ImageKind::Generated,
                    ImageCategory::Draft,
                    None,
                )
            })
            .collect::<Result<_, _>>()?;
        assert_eq!(ids, vec![1, 2, 3]);

        registry.clear();
        assert!(registry.is_empty());
        let after = registry.register_image_sync(
            "/tmp/a.png",
            ImageKind::Generated,
            ImageCategory::Draft,
            None,
        )?;
        assert_eq!(after, 1);
        Ok(())
    }

    #[test]
    fn blank_reference_is_rejected() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        let result =
            registry.register_image_sync("  ", ImageKind::Generated, ImageCategory::Draft, None);
        assert!(matches!(result, Err(RegistryError::EmptyReference)));
        Ok(())
    }

    #[tokio::test]
    async fn cross_category_registration_keeps_first_category() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        let url = "http://127.0.0.1:9/poster.png";
        let first = registry
            .register_image(url, ImageKind::Reference, ImageCategory::Inspiration, None)
            .await?;
        let second = registry
            .register_image(url, ImageKind::Reference, ImageCategory::Draft, None)
            .await?;

        assert_eq!(first, second);
        let image = registry.image(first).ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(image.category, ImageCategory::Inspiration);
        // Unreachable host: the remote URL stays the working path.
        assert_eq!(image.path, url);
        assert_eq!(image.original_ref, None);
        Ok(())
    }

    #[tokio::test]
    async fn remote_reference_is_downloaded_under_its_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let server =
            StaticServer::start(vec![("/shots/a.png", png_bytes(4, 4, [9, 9, 9])?)]).await?;
        let registry = memory_registry(&temp.path().join("reference"));
        generated(&registry, "/tmp/local.png", ImageCategory::Draft, None)?;

        let url = server.url("/shots/a.png");
        let id = registry
            .register_image(&url, ImageKind::Reference, ImageCategory::Inspiration, Some("A"))
            .await?;

        assert_eq!(id, 2);
        let image = registry.image(id).ok_or_else(|| anyhow::anyhow!("missing"))?;
        let expected = temp.path().join("reference").join("2.png");
        assert_eq!(image.path, expected.to_string_lossy());
        assert_eq!(image.original_ref.as_deref(), Some(url.as_str()));
        assert!(expected.exists());
        assert_eq!(registry.id_by_ref(&url), Some(2));
        assert_eq!(registry.id_by_ref(&image.path), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_registrations_get_distinct_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = Arc::new(memory_registry(temp.path()));
        let refs: Vec<String> = (0..6).map(|idx| format!("http://127.0.0.1:9/{idx}.jpg")).collect();
        let kind = ImageKind::Reference;
        let results = join_all(refs.iter().map(|reference| {
            registry.register_image(reference, kind, ImageCategory::Inspiration, None)
        }))
        .await;
        let ids: BTreeSet<ImageId> = results.into_iter().collect::<Result<_, _>>()?;
        assert_eq!(ids, (1..=6).collect());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_registration_of_one_ref_yields_one_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        let url = "http://127.0.0.1:9/same.jpg";
        let results = join_all((0..4).map(|_| {
            registry.register_image(url, ImageKind::Reference, ImageCategory::Inspiration, None)
        }))
        .await;
        let ids: BTreeSet<ImageId> = results.into_iter().collect::<Result<_, _>>()?;
        assert_eq!(ids.len(), 1);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn cached_grid_misses_once_file_is_deleted() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        let render = temp.path().join("grid.png");
        std::fs::write(&render, b"png")?;

        registry.cache_grid(&render, &[29, 6, 26], "smart_round1_group1");
        let hit = registry
            .cached_grid(&[6, 26, 29], "smart_round1_group1")
            .ok_or_else(|| anyhow::anyhow!("expected cache hit"))?;
        assert_eq!(hit.render_path, render.to_string_lossy());
        assert_eq!(hit.source_image_ids, vec![6, 26, 29]);
        assert_eq!(hit.cell_order, vec![29, 6, 26]);
        assert!(registry.cached_grid(&[6, 26, 29], "smart_round1_group2").is_none());

        std::fs::remove_file(&render)?;
        assert!(registry.cached_grid(&[6, 26, 29], "smart_round1_group1").is_none());
        Ok(())
    }

    #[test]
    fn every_mutation_is_persisted_and_reloadable() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("metadata").join("image-registry.json");
        let registry = ImageRegistry::new(
            Box::new(JsonFileStore::new(&path)),
            temp.path(),
            reqwest::Client::new(),
        );
        generated(&registry, "/tmp/a.png", ImageCategory::Draft, Some("A"))?;
        generated(&registry, "/tmp/b.png", ImageCategory::Final, None)?;

        let reloaded = ImageRegistry::load(
            Box::new(JsonFileStore::new(&path)),
            temp.path(),
            reqwest::Client::new(),
        );
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.id_by_ref("/tmp/b.png"), Some(2));
        let next = generated(&reloaded, "/tmp/c.png", ImageCategory::Draft, None)?;
        assert_eq!(next, 3);

        let fresh = ImageRegistry::new(
            Box::new(JsonFileStore::new(&path)),
            temp.path(),
            reqwest::Client::new(),
        );
        assert!(fresh.is_empty());
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["nextId"], 1);
        Ok(())
    }

    #[test]
    fn store_failures_do_not_stop_registration() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry =
            ImageRegistry::new(Box::new(FailingStore), temp.path(), reqwest::Client::new());
        let id = generated(&registry, "/tmp/a.png", ImageCategory::Draft, None)?;
        assert_eq!(id, 1);
        assert!(registry.image(1).is_some());
        Ok(())
    }

    #[test]
    fn resolve_reports_valid_ids_for_expected_category() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        for (reference, category) in [
            ("/tmp/i1.png", ImageCategory::Inspiration),
            ("/tmp/d1.png", ImageCategory::Draft),
            ("/tmp/d2.png", ImageCategory::Draft),
        ] {
            registry.register_image_sync(reference, ImageKind::Generated, category, None)?;
        }

        assert_eq!(registry.resolve(2, ImageCategory::Draft)?.path, "/tmp/d1.png");
        match registry.resolve(1, ImageCategory::Draft) {
            Err(RegistryError::InvalidIdentity { id, actual, valid_ids, .. }) => {
                assert_eq!(id, 1);
                assert_eq!(actual, Some(ImageCategory::Inspiration));
                assert_eq!(valid_ids, vec![2, 3]);
            }
            other => anyhow::bail!("unexpected: {other:?}"),
        }
        assert!(registry.resolve_many(&[2, 3, 40], ImageCategory::Draft).is_err());
        assert_eq!(
            registry.validate_ids(&[3, 1, 40], ImageCategory::Draft),
            IdValidation {
                valid: vec![3],
                invalid: vec![1, 40],
            }
        );
        Ok(())
    }

    #[test]
    fn category_listing_mapping_and_summary_follow_id_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = memory_registry(temp.path());
        generated(&registry, "/tmp/d1.png", ImageCategory::Draft, Some("First"))?;
        generated(&registry, "/tmp/m1.png", ImageCategory::Medium, None)?;
        generated(&registry, "/tmp/d2.png", ImageCategory::Draft, None)?;

        let drafts: Vec<ImageId> = registry
            .images_by_category(ImageCategory::Draft)
            .iter()
            .map(|image| image.id)
            .collect();
        assert_eq!(drafts, vec![1, 3]);
        assert_eq!(
            registry.grid_mapping(ImageCategory::Draft),
            BTreeMap::from([(1, 1), (2, 3)])
        );

        let summary = registry.summary();
        assert!(summary.contains("DRAFT (2 images):"));
        assert!(summary.contains("  #1: d1.png - \"First\""));
        assert!(summary.contains("MEDIUM (1 images):"));
        assert!(!summary.contains("FINAL"));
        Ok(())
    }

    #[tokio::test]
    async fn localize_references_retries_remote_paths() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let server = StaticServer::start(vec![("/late.webp", png_bytes(2, 2, [1, 2, 3])?)]).await?;
        let registry = memory_registry(&temp.path().join("reference"));
        let url = server.url("/late.webp");
        let id = inspiration(&registry, &url)?;
        inspiration(&registry, "http://127.0.0.1:9/gone.png")?;

        let report = registry.localize_references().await;
        assert_eq!(report, LocalizeReport { downloaded: 1, failed: 1 });
        let image = registry.image(id).ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert!(image.path.ends_with("1.webp"));
        assert_eq!(image.original_ref.as_deref(), Some(url.as_str()));
        Ok(())
    }

    struct RecordingStore {
        image_counts: Arc<Mutex<Vec<usize>>>,
    }

    impl RegistryStore for RecordingStore {
        fn describe(&self) -> String {
            "recording".to_string()
        }

        fn load(&self) -> anyhow::Result<Option<RegistrySnapshot>> {
            Ok(None)
        }

        fn save(&self, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
            let mut counts = self
                .image_counts
                .lock()
                .map_err(|_| anyhow::anyhow!("poisoned"))?;
            counts.push(snapshot.images.len());
            Ok(())
        }
    }

    #[tokio::test]
    async fn snapshots_reach_the_store_in_mutation_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let image_counts = Arc::new(Mutex::new(Vec::new()));
        let registry = ImageRegistry::new(
            Box::new(RecordingStore {
                image_counts: image_counts.clone(),
            }),
            temp.path(),
            reqwest::Client::new(),
        );
        let refs: Vec<String> = (0..6)
            .map(|idx| format!("http://127.0.0.1:9/{idx}.png"))
            .collect();
        join_all(refs.iter().map(|reference| {
            registry.register_image(
                reference,
                ImageKind::Reference,
                ImageCategory::Inspiration,
                None,
            )
        }))
        .await;

        let counts = image_counts
            .lock()
            .map(|counts| counts.clone())
            .unwrap_or_default();
        assert_eq!(counts.first(), Some(&0));
        assert_eq!(counts.last(), Some(&6));
        assert!(counts.windows(2).all(|pair| pair[0] < pair[1]));
        Ok(())
    }

    #[tokio::test]
    async fn local_reference_is_copied_under_its_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let shot = temp.path().join("screenshots").join("hero.png");
        write_png(&shot, 4, 4, [10, 20, 30])?;
        let reference_dir = temp.path().join("reference");
        let registry = memory_registry(&reference_dir);

        let shot_ref = shot.to_string_lossy().to_string();
        let id = registry
            .register_image(
                &shot_ref,
                ImageKind::Reference,
                ImageCategory::Inspiration,
                Some("Hero"),
            )
            .await?;
        let image = registry
            .image(id)
            .ok_or_else(|| anyhow::anyhow!("missing"))?;
        let expected = reference_dir.join("1.png");
        assert_eq!(image.path, expected.to_string_lossy());
        assert_eq!(image.original_ref.as_deref(), Some(shot_ref.as_str()));
        assert_eq!(std::fs::read(&expected)?, std::fs::read(&shot)?);
        assert_eq!(registry.id_by_ref(&shot_ref), Some(id));
        assert_eq!(registry.id_by_ref(&image.path), Some(id));

        let draft = temp.path().join("draft.png");
        write_png(&draft, 4, 4, [1, 1, 1])?;
        let draft_ref = draft.to_string_lossy().to_string();
        let draft_id = registry
            .register_image(&draft_ref, ImageKind::Generated, ImageCategory::Draft, None)
            .await?;
        assert_eq!(registry.image(draft_id).map(|image| image.path), Some(draft_ref));
        Ok(())
    }
}
