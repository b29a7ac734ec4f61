use std::path::{Path, PathBuf};
use std::sync::Arc;

use content_store_core::{
    ContentType, ElementFailure, Entity, MasterDocument, PathLock, StoreError, SyncAllReport,
    SyncReport, TypeSyncOutcome,
};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::store::ContentStore;

/// One-way fan-out from master documents into the live per-entity files.
///
/// Master documents live at `{master_dir}/{content_type}-master.json`. The
/// running game never reads them; an editor commits a bulk edit by syncing.
pub struct MasterSyncService {
    master_dir: PathBuf,
    stores: Vec<Arc<ContentStore>>,
    locks: PathLock,
}

impl std::fmt::Debug for MasterSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSyncService")
            .field("master_dir", &self.master_dir)
            .field("stores", &self.stores.len())
            .finish_non_exhaustive()
    }
}

impl MasterSyncService {
    pub fn new(
        master_dir: impl AsRef<Path>,
        stores: impl IntoIterator<Item = Arc<ContentStore>>,
        locks: PathLock,
    ) -> Self {
        Self {
            master_dir: master_dir.as_ref().to_path_buf(),
            stores: stores.into_iter().collect(),
            locks,
        }
    }

    /// Path of the master document for a content type.
    pub fn master_path(&self, content_type: ContentType) -> PathBuf {
        self.master_dir.join(MasterDocument::file_name(content_type))
    }

    fn store(&self, content_type: ContentType) -> Result<&ContentStore, StoreError> {
        self.stores
            .iter()
            .find(|s| s.content_type() == content_type)
            .map(|s| s.as_ref())
            .ok_or_else(|| StoreError::Internal(format!("No store registered for {}", content_type)))
    }

    /// Read and parse a master document. Absent or malformed documents are
    /// reported as [`StoreError::SyncSourceMissing`].
    pub async fn read_master(&self, content_type: ContentType) -> Result<MasterDocument, StoreError> {
        let path = self.master_path(content_type);
        let json = match fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::SyncSourceMissing(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(StoreError::SyncSourceMissing(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        MasterDocument::from_json(content_type, &json)
    }

    /// Write one file per master array element through the store's locked save.
    ///
    /// Nothing is written when the master document is missing or lacks its
    /// array. Elements are independent: a bad element is reported and skipped.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync_from_master(&self, content_type: ContentType) -> Result<SyncReport, StoreError> {
        let store = self.store(content_type)?;
        let master = self.read_master(content_type).await?;
        let key_field = content_type.key_field();

        let mut report = SyncReport::new(content_type);
        for (index, element) in master.elements.into_iter().enumerate() {
            let key_hint = element.get(key_field).map(|k| match k {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });

            let result = match Entity::from_value(content_type, element) {
                Ok(entity) => store.save(entity).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => report.written += 1,
                Err(e) => {
                    warn!(
                        "Master {} element {} ({}) not written: {}",
                        content_type,
                        index,
                        key_hint.as_deref().unwrap_or("no key"),
                        e
                    );
                    report.failures.push(ElementFailure {
                        index,
                        key: key_hint,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Synced {} {} from master ({} failed)",
            report.written,
            content_type,
            report.failures.len()
        );
        Ok(report)
    }

    /// Sync every content type. One type's failure does not stop the others.
    pub async fn sync_all_from_master(&self) -> SyncAllReport {
        let mut report = SyncAllReport::default();
        for content_type in ContentType::ALL {
            let result = self.sync_from_master(content_type).await;
            if let Err(e) = &result {
                warn!("Skipping {} sync: {}", content_type, e);
            }
            report
                .outcomes
                .push(TypeSyncOutcome::from_result(content_type, result));
        }
        report
    }

    /// Write the cached entities of a type back into its master document,
    /// keeping the document's existing `defaults`.
    #[instrument(skip(self), level = "debug")]
    pub async fn export_to_master(&self, content_type: ContentType) -> Result<PathBuf, StoreError> {
        let store = self.store(content_type)?;
        let path = self.master_path(content_type);

        self.locks
            .run_exclusive_within(&path, None, || self.write_master(store, &path))
            .await?;

        Ok(path)
    }

    async fn write_master(&self, store: &ContentStore, path: &Path) -> Result<(), StoreError> {
        let content_type = store.content_type();
        let entities = store.get_all_from_cache();
        let document = match self.read_master(content_type).await {
            Ok(existing) => existing.with_entities(entities),
            Err(e) => {
                debug!("Starting a new {} master: {}", content_type, e);
                MasterDocument::from_entities(content_type, entities, None)
            }
        };
        let json = document.to_pretty_json()?;

        fs::create_dir_all(&self.master_dir).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to create dir {}: {}",
                self.master_dir.display(),
                e
            ))
        })?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json).await.map_err(|e| {
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

        info!(
            "Exported {} {} to {}",
            document.elements.len(),
            content_type,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use content_store_core::{EntityKey, NoopMirror};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        service: MasterSyncService,
        stores: Vec<Arc<ContentStore>>,
        data_dir: PathBuf,
        _temp: TempDir,
    }

    impl Fixture {
        fn store(&self, content_type: ContentType) -> &ContentStore {
            &self.stores[content_type.index()]
        }

        fn write_master(&self, content_type: ContentType, json: &str) {
            std::fs::create_dir_all(&self.service.master_dir).unwrap();
            std::fs::write(self.service.master_path(content_type), json).unwrap();
        }
    }

    fn setup() -> Fixture {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        let locks = PathLock::new();
        let stores: Vec<Arc<ContentStore>> = ContentType::ALL
            .into_iter()
            .map(|ct| {
                Arc::new(ContentStore::new(
                    ct,
                    &data_dir,
                    locks.clone(),
                    Arc::new(NoopMirror),
                    StoreOptions::default(),
                ))
            })
            .collect();
        let service = MasterSyncService::new(temp.path().join("master"), stores.clone(), locks);
        Fixture {
            service,
            stores,
            data_dir,
            _temp: temp,
        }
    }

    fn entity_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => vec![],
        };
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_missing_master_writes_nothing() {
        let fx = setup();

        let err = fx.service.sync_from_master(ContentType::Upgrades).await.unwrap_err();
        assert!(matches!(err, StoreError::SyncSourceMissing(_)));
        assert!(!fx.data_dir.exists());
    }

    #[tokio::test]
    async fn test_master_without_array_writes_nothing() {
        let fx = setup();
        fx.write_master(ContentType::Upgrades, r#"{"items": [{"id": "a"}]}"#);

        let err = fx.service.sync_from_master(ContentType::Upgrades).await.unwrap_err();
        assert!(matches!(err, StoreError::SyncSourceMissing(_)));
        assert!(!fx.data_dir.join("upgrades").exists());
    }

    #[tokio::test]
    async fn test_malformed_element_does_not_block_others() {
        let fx = setup();
        fx.write_master(
            ContentType::Upgrades,
            r#"{"upgrades": [
                {"id": "tap-power", "maxLevel": 30},
                {"maxLevel": 5},
                {"id": "energy-cap", "maxLevel": 10},
                {"id": "auto-tap", "maxLevel": 3}
            ]}"#,
        );

        let report = fx.service.sync_from_master(ContentType::Upgrades).await.unwrap();

        assert_eq!(report.written, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(report.failures[0].key, None);
        assert_eq!(
            entity_files(&fx.data_dir.join("upgrades")),
            vec![
                "upgrade-auto-tap.json",
                "upgrade-energy-cap.json",
                "upgrade-tap-power.json"
            ]
        );

        let store = fx.store(ContentType::Upgrades);
        let tap = store
            .load_by_id(&EntityKey::Id("tap-power".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tap.get("maxLevel"), Some(&json!(30)));
        assert_eq!(store.get_from_cache(&EntityKey::Id("tap-power".into())), Some(tap));
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let fx = setup();
        fx.write_master(
            ContentType::Levels,
            r#"{"levels": [{"level": 1, "xpRequired": 0}, {"level": 2, "xpRequired": 100, "name": "Two"}]}"#,
        );
        let dir = fx.data_dir.join("levels");

        fx.service.sync_from_master(ContentType::Levels).await.unwrap();
        let first: Vec<Vec<u8>> = entity_files(&dir)
            .iter()
            .map(|n| std::fs::read(dir.join(n)).unwrap())
            .collect();
        let cache_first = fx.store(ContentType::Levels).get_all_from_cache();

        let report = fx.service.sync_from_master(ContentType::Levels).await.unwrap();
        assert_eq!(report.written, 2);
        let second: Vec<Vec<u8>> = entity_files(&dir)
            .iter()
            .map(|n| std::fs::read(dir.join(n)).unwrap())
            .collect();

        assert_eq!(first, second);
        assert_eq!(cache_first, fx.store(ContentType::Levels).get_all_from_cache());
    }

    #[tokio::test]
    async fn test_sync_all_reports_per_type() {
        let fx = setup();
        fx.write_master(ContentType::Tasks, r#"{"tasks": [{"id": "daily"}, {"id": "null"}]}"#);
        fx.write_master(ContentType::Characters, r#"{"characters": [{"id": "kit"}]}"#);
        fx.write_master(ContentType::Levels, "{ broken");

        let report = fx.service.sync_all_from_master().await;

        assert_eq!(report.outcomes.len(), ContentType::ALL.len());
        assert_eq!(report.total_written(), 2);

        let tasks = report.get(ContentType::Tasks).unwrap();
        assert_eq!(tasks.written, 1);
        assert_eq!(tasks.failures[0].key.as_deref(), Some("null"));
        assert!(report.get(ContentType::Levels).unwrap().error.is_some());
        assert!(report.get(ContentType::Upgrades).unwrap().error.is_some());
        assert_eq!(report.get(ContentType::Characters).unwrap().written, 1);
    }

    #[tokio::test]
    async fn test_export_round_trips_and_keeps_defaults() {
        let fx = setup();
        fx.write_master(
            ContentType::Achievements,
            r#"{"achievements": [{"id": "first-tap", "reward": 5}], "defaults": {"reward": 1}}"#,
        );
        fx.service.sync_from_master(ContentType::Achievements).await.unwrap();
        fx.store(ContentType::Achievements)
            .save_value(json!({"id": "big-spender", "reward": 50}))
            .await
            .unwrap();

        let path = fx.service.export_to_master(ContentType::Achievements).await.unwrap();
        assert_eq!(path, fx.service.master_path(ContentType::Achievements));

        let master = fx.service.read_master(ContentType::Achievements).await.unwrap();
        assert_eq!(
            master.elements,
            vec![
                json!({"id": "big-spender", "reward": 50}),
                json!({"id": "first-tap", "reward": 5})
            ]
        );
        assert_eq!(master.defaults.unwrap()["reward"], json!(1));
    }

    #[tokio::test]
    async fn test_export_keeps_other_top_level_properties() {
        let fx = setup();
        fx.write_master(
            ContentType::Levels,
            r#"{"levels": [{"level": 1}], "editorVersion": 3, "notes": {"owner": "design"}}"#,
        );
        fx.service.sync_from_master(ContentType::Levels).await.unwrap();
        fx.store(ContentType::Levels)
            .save_value(json!({"level": 2}))
            .await
            .unwrap();

        fx.service.export_to_master(ContentType::Levels).await.unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(fx.service.master_path(ContentType::Levels)).unwrap(),
        )
        .unwrap();
        assert_eq!(
            raw,
            json!({
                "levels": [{"level": 1}, {"level": 2}],
                "editorVersion": 3,
                "notes": {"owner": "design"}
            })
        );
    }
}
