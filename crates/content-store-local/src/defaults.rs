use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use content_store_core::{ContentType, EntityKey, MasterDocument, StoreError, DEFAULTS_FIELD};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// File holding the default player fields, next to the content master documents.
pub const PLAYER_MASTER_FILE: &str = "player-master.json";

/// Character every player owns when no master document names a starter.
const FALLBACK_STARTER_CHARACTER: &str = "starter";

/// Renamed fields: (deprecated, canonical).
const PLAYER_RENAMES: &[(&str, &str)] = &[
    ("tapValue", "pointsPerTap"),
    ("energyMax", "maxEnergy"),
    ("regenRate", "energyRegenRate"),
];
const UPGRADE_RENAMES: &[(&str, &str)] = &[
    ("maxLvl", "maxLevel"),
    ("cost", "baseCost"),
    ("multiplier", "costMultiplier"),
];
const CHARACTER_RENAMES: &[(&str, &str)] = &[("img", "imageUrl"), ("unlockLvl", "unlockLevel")];
const LEVEL_RENAMES: &[(&str, &str)] = &[("xpNeeded", "xpRequired"), ("reward", "rewardPoints")];

fn renames_for(content_type: ContentType) -> &'static [(&'static str, &'static str)] {
    match content_type {
        ContentType::Upgrades => UPGRADE_RENAMES,
        ContentType::Characters => CHARACTER_RENAMES,
        ContentType::Levels => LEVEL_RENAMES,
        ContentType::Tasks | ContentType::Achievements => &[],
    }
}

fn builtin_player_defaults() -> Map<String, Value> {
    object(json!({
        "maxEnergy": 1000,
        "energyRegenRate": 1,
        "pointsPerTap": 1,
        "passiveIncomePerHour": 0,
    }))
}

fn builtin_defaults(content_type: ContentType) -> Map<String, Value> {
    object(match content_type {
        ContentType::Levels => json!({
            "xpRequired": 1000,
            "rewardPoints": 0,
        }),
        ContentType::Tasks => json!({
            "reward": 100,
            "repeatable": false,
        }),
        ContentType::Achievements => json!({
            "reward": 500,
            "hidden": false,
        }),
        ContentType::Upgrades => json!({
            "baseCost": 100,
            "costMultiplier": 1.5,
            "maxLevel": 10,
            "effectPerLevel": 1,
            "category": "tap",
        }),
        ContentType::Characters => json!({
            "unlockLevel": 1,
            "rarity": "common",
            "imageUrl": "",
        }),
    })
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Move values from deprecated field names to their canonical names.
///
/// The canonical field wins when both are present. Only the given in-memory
/// document changes. Returns the number of fields repaired.
pub fn repair_fields(label: &str, doc: &mut Map<String, Value>, renames: &[(&str, &str)]) -> usize {
    let mut repaired = 0;
    for (old, new) in renames {
        let Some(value) = doc.remove(*old) else {
            continue;
        };
        if doc.contains_key(*new) {
            warn!("{}: dropping deprecated '{}', '{}' already set", label, old, new);
        } else {
            warn!("{}: renaming deprecated '{}' to '{}'", label, old, new);
            doc.insert((*new).to_string(), value);
        }
        repaired += 1;
    }
    repaired
}

/// Initial state of a newly registered player.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPlayer {
    pub id: String,
    pub external_id: String,
    pub display_name: String,
    pub points: u64,
    pub level: u32,
    pub energy: u64,
    pub max_energy: u64,
    pub points_per_tap: u64,
    pub energy_regen_rate: u64,
    pub unlocked_characters: Vec<String>,
    pub selected_character: String,
    pub upgrade_levels: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    /// Remaining default fields, passed through as configured.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug)]
struct LoadedDefaults {
    player: Map<String, Value>,
    by_type: BTreeMap<ContentType, Map<String, Value>>,
    starter_character: String,
}

/// Templates for new entities and players, read from the master documents.
///
/// Documents are loaded once on first use. A missing or unreadable document
/// falls back to built-in values, so creating an entity never fails because a
/// template is absent.
#[derive(Debug)]
pub struct DefaultsProvider {
    master_dir: PathBuf,
    loaded: OnceCell<LoadedDefaults>,
}

impl DefaultsProvider {
    pub fn new(master_dir: impl AsRef<Path>) -> Self {
        Self {
            master_dir: master_dir.as_ref().to_path_buf(),
            loaded: OnceCell::new(),
        }
    }

    /// Load every template document. Later calls do nothing.
    pub async fn warm(&self) {
        self.loaded().await;
    }

    async fn loaded(&self) -> &LoadedDefaults {
        self.loaded.get_or_init(|| self.load()).await
    }

    async fn load(&self) -> LoadedDefaults {
        let mut player = builtin_player_defaults();
        if let Some(mut doc) = self.read_player_master().await {
            repair_fields("player defaults", &mut doc, PLAYER_RENAMES);
            player.extend(doc);
        }

        let mut by_type = BTreeMap::new();
        let mut starter_character = None;
        for content_type in [ContentType::Upgrades, ContentType::Characters, ContentType::Levels] {
            let mut defaults = builtin_defaults(content_type);
            if let Some(master) = self.read_master(content_type).await {
                if content_type == ContentType::Characters {
                    starter_character = pick_starter(&master.elements);
                }
                match master.defaults {
                    Some(mut doc) => {
                        repair_fields(
                            &format!("{} defaults", content_type),
                            &mut doc,
                            renames_for(content_type),
                        );
                        defaults.extend(doc);
                    }
                    None => debug!("{} master has no defaults, using built-ins", content_type),
                }
            }
            by_type.insert(content_type, defaults);
        }
        for content_type in [ContentType::Tasks, ContentType::Achievements] {
            by_type.insert(content_type, builtin_defaults(content_type));
        }

        let starter_character =
            starter_character.unwrap_or_else(|| FALLBACK_STARTER_CHARACTER.to_string());
        info!("Loaded defaults (starter character: {})", starter_character);

        LoadedDefaults {
            player,
            by_type,
            starter_character,
        }
    }

    async fn read_player_master(&self) -> Option<Map<String, Value>> {
        let path = self.master_dir.join(PLAYER_MASTER_FILE);
        let json = read_optional(&path).await?;
        match serde_json::from_str::<Value>(&json) {
            Ok(Value::Object(mut doc)) => match doc.remove(DEFAULTS_FIELD) {
                Some(Value::Object(defaults)) => Some(defaults),
                _ => Some(doc),
            },
            Ok(_) => {
                warn!("{} is not a JSON object, using built-in player defaults", path.display());
                None
            }
            Err(e) => {
                warn!("Failed to parse {}: {}, using built-in player defaults", path.display(), e);
                None
            }
        }
    }

    async fn read_master(&self, content_type: ContentType) -> Option<MasterDocument> {
        let path = self.master_dir.join(MasterDocument::file_name(content_type));
        let json = read_optional(&path).await?;
        match MasterDocument::from_json(content_type, &json) {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!("{}, using built-in {} defaults", e, content_type);
                None
            }
        }
    }

    pub async fn upgrade_defaults(&self) -> Map<String, Value> {
        self.defaults_by_type(ContentType::Upgrades).await
    }

    pub async fn character_defaults(&self) -> Map<String, Value> {
        self.defaults_by_type(ContentType::Characters).await
    }

    pub async fn level_defaults(&self) -> Map<String, Value> {
        self.defaults_by_type(ContentType::Levels).await
    }

    /// Template fields for a new entity of `content_type` (key not included).
    pub async fn defaults_by_type(&self, content_type: ContentType) -> Map<String, Value> {
        self.loaded()
            .await
            .by_type
            .get(&content_type)
            .cloned()
            .unwrap_or_else(|| builtin_defaults(content_type))
    }

    /// Build the initial state for a player identified by an external account.
    pub async fn new_player(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<NewPlayer, StoreError> {
        let external_id = external_id.trim();
        let display_name = display_name.trim();
        if external_id.is_empty() {
            return Err(StoreError::Validation("external id is empty".to_string()));
        }
        if display_name.is_empty() {
            return Err(StoreError::Validation("display name is empty".to_string()));
        }

        let loaded = self.loaded().await;
        let mut extra = loaded.player.clone();
        let max_energy = take_u64(&mut extra, "maxEnergy", 1000);
        let points_per_tap = take_u64(&mut extra, "pointsPerTap", 1);
        let energy_regen_rate = take_u64(&mut extra, "energyRegenRate", 1);

        // Identity and starting values are fixed; defaults cannot override them.
        for fixed in [
            "id",
            "externalId",
            "displayName",
            "points",
            "level",
            "energy",
            "unlockedCharacters",
            "selectedCharacter",
            "upgradeLevels",
            "createdAt",
        ] {
            extra.remove(fixed);
        }

        Ok(NewPlayer {
            id: uuid::Uuid::new_v4().to_string(),
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            points: 0,
            level: 1,
            energy: max_energy,
            max_energy,
            points_per_tap,
            energy_regen_rate,
            unlocked_characters: vec![loaded.starter_character.clone()],
            selected_character: loaded.starter_character.clone(),
            upgrade_levels: BTreeMap::new(),
            created_at: Utc::now(),
            extra,
        })
    }
}

async fn read_optional(path: &Path) -> Option<String> {
    match fs::read_to_string(path).await {
        Ok(json) => Some(json),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{} not found, using built-in defaults", path.display());
            None
        }
        Err(e) => {
            warn!("Failed to read {}: {}, using built-in defaults", path.display(), e);
            None
        }
    }
}

fn take_u64(doc: &mut Map<String, Value>, field: &str, fallback: u64) -> u64 {
    match doc.remove(field) {
        Some(value) => value.as_u64().unwrap_or_else(|| {
            warn!("Default '{}' is not a non-negative integer ({}), using {}", field, value, fallback);
            fallback
        }),
        None => fallback,
    }
}

/// First character available from level 1 (or with no unlock level at all).
fn pick_starter(elements: &[Value]) -> Option<String> {
    elements.iter().find_map(|element| {
        let mut doc = element.as_object()?.clone();
        repair_fields("character", &mut doc, CHARACTER_RENAMES);
        let id = doc.get("id")?.as_str()?;
        EntityKey::parse(ContentType::Characters, id).ok()?;
        let unlock_level = doc.get("unlockLevel").and_then(Value::as_u64).unwrap_or(0);
        (unlock_level <= 1).then(|| id.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (DefaultsProvider, TempDir) {
        let temp = TempDir::new().unwrap();
        (DefaultsProvider::new(temp.path()), temp)
    }

    fn write(temp: &TempDir, name: &str, json: &str) {
        std::fs::write(temp.path().join(name), json).unwrap();
    }

    #[tokio::test]
    async fn test_new_player_without_master_documents() {
        let (provider, _temp) = setup();
        let (logs, _guard) = crate::test_support::capture_warnings();

        let player = provider.new_player("tg-42", "Alice").await.unwrap();

        let logs = logs.contents();
        assert!(logs.contains("WARN"), "{}", logs);
        assert!(
            logs.contains(&format!("{} not found, using built-in defaults", PLAYER_MASTER_FILE)),
            "{}",
            logs
        );

        assert_eq!(player.external_id, "tg-42");
        assert_eq!(player.display_name, "Alice");
        assert_eq!(player.points, 0);
        assert_eq!(player.level, 1);
        assert_eq!(player.max_energy, 1000);
        assert_eq!(player.energy, 1000);
        assert_eq!(player.points_per_tap, 1);
        assert_eq!(player.unlocked_characters, vec!["starter".to_string()]);
        assert_eq!(player.selected_character, "starter");
        assert!(player.upgrade_levels.is_empty());
        assert_eq!(player.extra.get("passiveIncomePerHour"), Some(&json!(0)));
        assert!(uuid::Uuid::parse_str(&player.id).is_ok());

        let value = serde_json::to_value(&player).unwrap();
        for field in ["id", "externalId", "displayName", "points", "energy", "maxEnergy", "createdAt"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
    }

    #[tokio::test]
    async fn test_player_defaults_repaired_and_merged() {
        let (provider, temp) = setup();
        write(
            &temp,
            PLAYER_MASTER_FILE,
            r#"{"tapValue": 3, "maxEnergy": 500, "energyMax": 9999, "points": 1000000, "vipTier": 0}"#,
        );

        let player = provider.new_player("ext", "Bob").await.unwrap();

        assert_eq!(player.points_per_tap, 3);
        assert_eq!(player.max_energy, 500);
        assert_eq!(player.energy, 500);
        assert_eq!(player.points, 0);
        assert_eq!(player.extra.get("vipTier"), Some(&json!(0)));
        assert!(!player.extra.contains_key("tapValue"));
        assert!(!player.extra.contains_key("energyMax"));
        assert!(!player.extra.contains_key("points"));
    }

    #[tokio::test]
    async fn test_unparsable_player_master_falls_back() {
        let (provider, temp) = setup();
        write(&temp, PLAYER_MASTER_FILE, "{ nope");

        let player = provider.new_player("ext", "Bob").await.unwrap();
        assert_eq!(player.max_energy, 1000);
    }

    #[tokio::test]
    async fn test_type_defaults_from_master() {
        let (provider, temp) = setup();
        write(
            &temp,
            "upgrades-master.json",
            r#"{"upgrades": [], "defaults": {"maxLvl": 25, "baseCost": 250}}"#,
        );
        write(&temp, "levels-master.json", r#"{"levels": [{"level": 1}]}"#);

        let upgrades = provider.upgrade_defaults().await;
        assert_eq!(upgrades.get("maxLevel"), Some(&json!(25)));
        assert_eq!(upgrades.get("baseCost"), Some(&json!(250)));
        assert_eq!(upgrades.get("costMultiplier"), Some(&json!(1.5)));
        assert!(!upgrades.contains_key("maxLvl"));

        assert_eq!(provider.level_defaults().await, builtin_defaults(ContentType::Levels));
        assert_eq!(
            provider.defaults_by_type(ContentType::Tasks).await,
            builtin_defaults(ContentType::Tasks)
        );
    }

    #[tokio::test]
    async fn test_starter_character_from_master() {
        let (provider, temp) = setup();
        write(
            &temp,
            "characters-master.json",
            r#"{"characters": [
                {"id": "dragon", "unlockLevel": 10},
                {"id": "undefined"},
                {"id": "bunny", "unlockLvl": 1}
            ], "defaults": {"img": "/img/default.png"}}"#,
        );

        let player = provider.new_player("ext", "Cat").await.unwrap();
        assert_eq!(player.unlocked_characters, vec!["bunny".to_string()]);
        assert_eq!(
            provider.character_defaults().await.get("imageUrl"),
            Some(&json!("/img/default.png"))
        );
    }

    #[tokio::test]
    async fn test_warm_up_loads_once() {
        let (provider, temp) = setup();
        write(&temp, PLAYER_MASTER_FILE, r#"{"pointsPerTap": 2}"#);
        provider.warm().await;

        write(&temp, PLAYER_MASTER_FILE, r#"{"pointsPerTap": 7}"#);
        provider.warm().await;

        let player = provider.new_player("ext", "Dee").await.unwrap();
        assert_eq!(player.points_per_tap, 2);
    }

    #[tokio::test]
    async fn test_identity_required() {
        let (provider, _temp) = setup();
        assert!(provider.new_player("", "Eve").await.unwrap_err().is_validation());
        assert!(provider.new_player("ext", "  ").await.unwrap_err().is_validation());
    }

    #[test]
    fn test_repair_fields_prefers_canonical() {
        let mut doc = object(json!({"maxLvl": 5, "maxLevel": 8, "cost": 3}));
        let repaired = repair_fields("test", &mut doc, UPGRADE_RENAMES);
        assert_eq!(repaired, 2);
        assert_eq!(doc, object(json!({"maxLevel": 8, "baseCost": 3})));
    }
}
