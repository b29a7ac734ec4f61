use std::path::{Path, PathBuf};
use std::sync::Arc;

use content_store_core::{
    ContentType, Entity, EntityKey, MirrorBackend, PathLock, StoreError, SyncAllReport, SyncReport,
};
use serde_json::{Map, Value};
use tracing::info;

use crate::defaults::{DefaultsProvider, NewPlayer};
use crate::store::{ContentStore, StoreOptions};
use crate::sync::MasterSyncService;

/// Composition root: one store per content type sharing a lock table and a
/// mirror, plus master-document sync and defaults.
///
/// This is the surface the HTTP/admin layers and the game loop talk to. Build
/// one per process (or one per test) and pass it around; nothing is global.
pub struct ContentRegistry {
    stores: [Arc<ContentStore>; 5],
    locks: PathLock,
    sync: MasterSyncService,
    defaults: DefaultsProvider,
    mirror: Arc<dyn MirrorBackend>,
}

impl std::fmt::Debug for ContentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRegistry")
            .field("stores", &self.stores)
            .field("mirror", &self.mirror.backend_name())
            .finish_non_exhaustive()
    }
}

impl ContentRegistry {
    pub fn new(
        data_dir: impl AsRef<Path>,
        master_dir: impl AsRef<Path>,
        mirror: Arc<dyn MirrorBackend>,
        options: StoreOptions,
    ) -> Self {
        let locks = PathLock::new();
        let stores = ContentType::ALL.map(|content_type| {
            Arc::new(ContentStore::new(
                content_type,
                data_dir.as_ref(),
                locks.clone(),
                mirror.clone(),
                options.clone(),
            ))
        });
        let sync = MasterSyncService::new(master_dir.as_ref(), stores.iter().cloned(), locks.clone());
        let defaults = DefaultsProvider::new(master_dir.as_ref());

        Self {
            stores,
            locks,
            sync,
            defaults,
            mirror,
        }
    }

    /// Store for one content type.
    pub fn store(&self, content_type: ContentType) -> &ContentStore {
        &self.stores[content_type.index()]
    }

    pub fn locks(&self) -> &PathLock {
        &self.locks
    }

    pub fn master_path(&self, content_type: ContentType) -> PathBuf {
        self.sync.master_path(content_type)
    }

    /// Fill every cache from disk and load the default templates.
    ///
    /// Returns the number of cached entities.
    pub async fn warm(&self) -> Result<usize, StoreError> {
        let loads = self.stores.iter().map(|store| store.load_all());
        let mut total = 0;
        for loaded in futures::future::join_all(loads).await {
            total += loaded?.len();
        }
        self.defaults.warm().await;
        info!(
            "Content registry warm: {} entities (mirror: {})",
            total,
            self.mirror.backend_name()
        );
        Ok(total)
    }

    // =========================================================================
    // Store operations
    // =========================================================================

    pub async fn load_all(&self, content_type: ContentType) -> Result<Vec<Entity>, StoreError> {
        self.store(content_type).load_all().await
    }

    pub async fn load_by_id(
        &self,
        content_type: ContentType,
        key: &EntityKey,
    ) -> Result<Option<Entity>, StoreError> {
        self.store(content_type).load_by_id(key).await
    }

    /// Save a JSON document as an entity of `content_type`.
    pub async fn save(&self, content_type: ContentType, document: Value) -> Result<Entity, StoreError> {
        self.store(content_type).save_value(document).await
    }

    pub async fn save_entity(&self, entity: Entity) -> Result<(), StoreError> {
        self.store(entity.content_type()).save(entity).await
    }

    pub async fn delete(&self, content_type: ContentType, key: &EntityKey) -> Result<bool, StoreError> {
        self.store(content_type).delete(key).await
    }

    pub fn get_all_from_cache(&self, content_type: ContentType) -> Vec<Entity> {
        self.store(content_type).get_all_from_cache()
    }

    pub fn get_from_cache(&self, content_type: ContentType, key: &EntityKey) -> Option<Entity> {
        self.store(content_type).get_from_cache(key)
    }

    // =========================================================================
    // Master documents
    // =========================================================================

    pub async fn sync_from_master(&self, content_type: ContentType) -> Result<SyncReport, StoreError> {
        self.sync.sync_from_master(content_type).await
    }

    pub async fn sync_all_from_master(&self) -> SyncAllReport {
        self.sync.sync_all_from_master().await
    }

    pub async fn export_to_master(&self, content_type: ContentType) -> Result<PathBuf, StoreError> {
        self.sync.export_to_master(content_type).await
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    pub async fn get_new_player_defaults(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<NewPlayer, StoreError> {
        self.defaults.new_player(external_id, display_name).await
    }

    pub async fn get_defaults_by_type(&self, content_type: ContentType) -> Map<String, Value> {
        self.defaults.defaults_by_type(content_type).await
    }
}
