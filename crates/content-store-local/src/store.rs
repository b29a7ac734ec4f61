use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use content_store_core::{
    ContentType, Entity, EntityKey, MirrorBackend, PathLock, StoreError,
};
use dashmap::DashMap;
use serde_json::Value;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Default bound on a single secondary-store call.
pub const DEFAULT_MIRROR_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables shared by every store of a registry.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a save/delete waits for the file lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// How long a mirror call may take before it is abandoned with a warning.
    pub mirror_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: None,
            mirror_timeout: DEFAULT_MIRROR_TIMEOUT,
        }
    }
}

/// File-backed store for one content type.
///
/// Layout:
/// ```text
/// {base_dir}/
///   {content_type}/
///     {prefix}-{key}.json
/// ```
///
/// Reads from the running game go through the cache; the cache is filled by
/// [`ContentStore::load_all`] at startup and kept in step by `save`/`delete`.
/// Writes to one file are serialized through the shared [`PathLock`].
pub struct ContentStore {
    content_type: ContentType,
    dir: PathBuf,
    cache: DashMap<EntityKey, Entity>,
    /// Writers hold this shared; `load_all` holds it exclusively while it
    /// rescans the directory and swaps the cache.
    reload_gate: RwLock<()>,
    locks: PathLock,
    mirror: Arc<dyn MirrorBackend>,
    options: StoreOptions,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("content_type", &self.content_type)
            .field("dir", &self.dir)
            .field("cached", &self.cache.len())
            .field("mirror", &self.mirror.backend_name())
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    pub fn new(
        content_type: ContentType,
        base_dir: impl AsRef<Path>,
        locks: PathLock,
        mirror: Arc<dyn MirrorBackend>,
        options: StoreOptions,
    ) -> Self {
        Self {
            content_type,
            dir: base_dir.as_ref().join(content_type.as_str()),
            cache: DashMap::new(),
            reload_gate: RwLock::new(()),
            locks,
            mirror,
            options,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Directory holding this type's entity files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical file path for an entity key.
    pub fn entity_path(&self, key: &EntityKey) -> PathBuf {
        self.dir.join(self.content_type.file_name(key))
    }

    fn check_key(&self, key: &EntityKey) -> Result<(), StoreError> {
        key.validate_for(self.content_type)
    }

    // =========================================================================
    // Disk reads
    // =========================================================================

    /// Scan the directory, parse every entity file and rebuild the cache.
    ///
    /// Files that fail to parse are logged and skipped. A missing directory
    /// is an empty store. Saves and deletes wait until the cache is swapped.
    #[instrument(skip(self), level = "debug", fields(content_type = %self.content_type))]
    pub async fn load_all(&self) -> Result<Vec<Entity>, StoreError> {
        let _reload = self.reload_gate.write().await;
        let mut entities = Vec::new();

        if fs::try_exists(&self.dir).await.unwrap_or(false) {
            let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
                StoreError::Io(format!("Failed to read dir {}: {}", self.dir.display(), e))
            })?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| {
                StoreError::Io(format!("Failed to read dir entry: {}", e))
            })? {
                let path = entry.path();
                if !self.is_entity_file(&path) {
                    continue;
                }
                match self.read_entity(&path).await {
                    Ok(entity) => entities.push(entity),
                    Err(e) => warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }

        entities.sort_by_key(Entity::key);

        let keys: HashSet<EntityKey> = entities.iter().map(Entity::key).collect();
        for entity in &entities {
            self.cache.insert(entity.key(), entity.clone());
        }
        self.cache.retain(|key, _| keys.contains(key));

        info!("Loaded {} {} into cache", entities.len(), self.content_type);
        Ok(entities)
    }

    /// Read one entity straight from disk. The cache is not consulted or updated.
    ///
    /// Returns `Ok(None)` when the file is missing or does not parse.
    #[instrument(skip(self), level = "debug", fields(content_type = %self.content_type))]
    pub async fn load_by_id(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        self.check_key(key)?;
        let path = self.entity_path(key);

        match self.read_entity(&path).await {
            Ok(entity) => Ok(Some(entity)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(StoreError::Parse(msg)) => {
                warn!("Ignoring unreadable {}: {}", path.display(), msg);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn is_entity_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name.ends_with(".json") && name.starts_with(&format!("{}-", self.content_type.file_prefix()))
    }

    async fn read_entity(&self, path: &Path) -> Result<Entity, StoreError> {
        let json = match fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let value: Value = serde_json::from_str(&json)
            .map_err(|e| StoreError::Parse(format!("Invalid JSON: {}", e)))?;
        let entity = Entity::from_value(self.content_type, value)
            .map_err(|e| StoreError::Parse(e.to_string()))?;

        // The file name is derived from the key; a mismatch means the file was
        // edited by hand and cannot be addressed by its key.
        if self.entity_path(&entity.key()).file_name() != path.file_name() {
            return Err(StoreError::Parse(format!(
                "document key {} does not match file name",
                entity.key()
            )));
        }

        debug!("Read {} {}", self.content_type, entity.key());
        Ok(entity)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write an entity to its file and cache, then mirror it.
    ///
    /// The key is validated before any I/O. The mirror runs after the file lock
    /// is released and its failures are only logged. Mirror calls for one key
    /// are not ordered against each other: a slow upsert can land after the
    /// remove of a delete that followed it on disk.
    #[instrument(skip(self, entity), level = "debug", fields(content_type = %self.content_type, key = %entity.key()))]
    pub async fn save(&self, entity: Entity) -> Result<(), StoreError> {
        if entity.content_type() != self.content_type {
            return Err(StoreError::Validation(format!(
                "cannot save a {} entity into the {} store",
                entity.content_type(),
                self.content_type
            )));
        }
        let key = entity.key();
        self.check_key(&key)?;
        let path = self.entity_path(&key);
        let json = entity.to_pretty_json()?;

        let reload = self.reload_gate.read().await;
        self.locks
            .run_exclusive_within(&path, self.options.lock_timeout, || {
                self.write_locked(&path, &json, &key, &entity)
            })
            .await?;
        drop(reload);

        debug!("Saved {} {} ({} bytes)", self.content_type, key, json.len());

        self.mirror_upsert(&key, &entity.to_value()).await;
        Ok(())
    }

    /// Validate a raw JSON document as an entity of this store's type and save it.
    pub async fn save_value(&self, value: Value) -> Result<Entity, StoreError> {
        let entity = Entity::from_value(self.content_type, value)?;
        self.save(entity.clone()).await?;
        Ok(entity)
    }

    /// Remove an entity's file and cache entry, then remove its mirror record.
    ///
    /// Returns whether the file existed. A file that is already gone is not an error.
    #[instrument(skip(self), level = "debug", fields(content_type = %self.content_type))]
    pub async fn delete(&self, key: &EntityKey) -> Result<bool, StoreError> {
        self.check_key(key)?;
        let path = self.entity_path(key);

        let reload = self.reload_gate.read().await;
        let existed = self
            .locks
            .run_exclusive_within(&path, self.options.lock_timeout, || {
                self.remove_locked(&path, key)
            })
            .await?;
        drop(reload);

        debug!("Deleted {} {} (existed: {})", self.content_type, key, existed);

        self.mirror_remove(key).await;
        Ok(existed)
    }

    /// Move an entity to a new key: delete the old file, then save under the new key.
    pub async fn rekey(&self, old_key: &EntityKey, entity: Entity) -> Result<(), StoreError> {
        self.check_key(old_key)?;
        self.check_key(&entity.key())?;
        if *old_key != entity.key() {
            self.delete(old_key).await?;
        }
        self.save(entity).await
    }

    /// Critical section of `save`. Caller holds the path lock.
    async fn write_locked(
        &self,
        path: &Path,
        json: &str,
        key: &EntityKey,
        entity: &Entity,
    ) -> Result<(), StoreError> {
        self.ensure_dir().await?;

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json).await.map_err(|e| {
            StoreError::Io(format!("Failed to write {}: {}", temp_path.display(), e))
        })?;
        if let Err(e) = fs::rename(&temp_path, path).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                warn!("Failed to remove {}: {}", temp_path.display(), cleanup);
            }
            return Err(StoreError::Io(format!(
                "Failed to rename to {}: {}",
                path.display(),
                e
            )));
        }

        self.cache.insert(key.clone(), entity.clone());
        Ok(())
    }

    /// Critical section of `delete`. Caller holds the path lock.
    async fn remove_locked(&self, path: &Path, key: &EntityKey) -> Result<bool, StoreError> {
        let existed = match fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        self.cache.remove(key);
        Ok(existed)
    }

    async fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            StoreError::Io(format!("Failed to create dir {}: {}", self.dir.display(), e))
        })
    }

    // =========================================================================
    // Mirror (best effort)
    // =========================================================================

    async fn mirror_upsert(&self, key: &EntityKey, document: &Value) {
        let call = self.mirror.upsert(self.content_type, key, document);
        match tokio::time::timeout(self.options.mirror_timeout, call).await {
            Ok(Ok(())) => debug!(
                "Mirrored {} {} to {}",
                self.content_type,
                key,
                self.mirror.backend_name()
            ),
            Ok(Err(e)) => warn!("Mirror upsert of {} {} failed: {}", self.content_type, key, e),
            Err(_) => warn!(
                "Mirror upsert of {} {} timed out after {:?}",
                self.content_type, key, self.options.mirror_timeout
            ),
        }
    }

    async fn mirror_remove(&self, key: &EntityKey) {
        let call = self.mirror.remove(self.content_type, key);
        match tokio::time::timeout(self.options.mirror_timeout, call).await {
            Ok(Ok(existed)) => debug!(
                "Removed {} {} from {} (existed: {})",
                self.content_type,
                key,
                self.mirror.backend_name(),
                existed
            ),
            Ok(Err(e)) => warn!("Mirror removal of {} {} failed: {}", self.content_type, key, e),
            Err(_) => warn!(
                "Mirror removal of {} {} timed out after {:?}",
                self.content_type, key, self.options.mirror_timeout
            ),
        }
    }

    // =========================================================================
    // Cache reads
    // =========================================================================

    /// Cached copy of one entity. Never touches the disk.
    pub fn get_from_cache(&self, key: &EntityKey) -> Option<Entity> {
        self.cache.get(key).map(|entry| entry.value().clone())
    }

    /// Snapshot of every cached entity, ordered by key.
    pub fn get_all_from_cache(&self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.cache.iter().map(|e| e.value().clone()).collect();
        entities.sort_by_key(Entity::key);
        entities
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
