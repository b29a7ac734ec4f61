use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;

/// Id values that show up when a caller forgets to fill in the key.
const PLACEHOLDER_IDS: &[&str] = &["undefined", "null", "nan", "new"];

/// The categories of game content, each with its own directory and cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Levels,
    Tasks,
    Achievements,
    Upgrades,
    Characters,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Levels,
        ContentType::Tasks,
        ContentType::Achievements,
        ContentType::Upgrades,
        ContentType::Characters,
    ];

    /// Position in [`ContentType::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Plural lowercase name. Also the directory name and the master array property.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Levels => "levels",
            ContentType::Tasks => "tasks",
            ContentType::Achievements => "achievements",
            ContentType::Upgrades => "upgrades",
            ContentType::Characters => "characters",
        }
    }

    /// Prefix of every entity file name in this type's directory.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            ContentType::Levels => "level",
            ContentType::Tasks => "task",
            ContentType::Achievements => "achievement",
            ContentType::Upgrades => "upgrade",
            ContentType::Characters => "character",
        }
    }

    /// Name of the document field holding the entity key.
    pub fn key_field(&self) -> &'static str {
        match self {
            ContentType::Levels => "level",
            _ => "id",
        }
    }

    /// Deterministic file name for an entity, e.g. `level-3.json` or `upgrade-tap-power.json`.
    pub fn file_name(&self, key: &EntityKey) -> String {
        format!("{}-{}.json", self.file_prefix(), key)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ContentType::ALL
            .into_iter()
            .find(|ct| ct.as_str() == normalized || ct.file_prefix() == normalized)
            .ok_or_else(|| StoreError::Validation(format!("Unknown content type: {}", s)))
    }
}

/// Stable identifier of an entity for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Level(u32),
    Id(String),
}

impl EntityKey {
    /// Parse a key given as text (CLI argument, URL segment) for a content type.
    pub fn parse(content_type: ContentType, raw: &str) -> Result<Self, StoreError> {
        let key = match content_type {
            ContentType::Levels => {
                let n = raw.trim().parse::<u32>().map_err(|_| {
                    StoreError::Validation(format!("Invalid level number: {:?}", raw))
                })?;
                EntityKey::Level(n)
            }
            _ => EntityKey::Id(raw.to_string()),
        };
        key.validate_for(content_type)?;
        Ok(key)
    }

    /// Extract a key from the key field of a document.
    pub fn from_field(content_type: ContentType, value: Option<&Value>) -> Result<Self, StoreError> {
        let field = content_type.key_field();
        let value = value.ok_or_else(|| {
            StoreError::Validation(format!("{} document is missing '{}'", content_type, field))
        })?;

        match (content_type, value) {
            (ContentType::Levels, Value::Number(n)) => {
                let level = n
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| StoreError::Validation(format!("Invalid level number: {}", n)))?;
                Ok(EntityKey::Level(level))
            }
            (_, Value::String(s)) => EntityKey::parse(content_type, s),
            (_, other) => Err(StoreError::Validation(format!(
                "{} '{}' must be a {}, got {}",
                content_type,
                field,
                if content_type == ContentType::Levels { "number" } else { "string" },
                other
            ))),
        }
    }

    /// Reject keys that cannot name a file or that look like caller placeholders.
    pub fn validate_for(&self, content_type: ContentType) -> Result<(), StoreError> {
        match (content_type, self) {
            (ContentType::Levels, EntityKey::Level(_)) => Ok(()),
            (ContentType::Levels, EntityKey::Id(id)) => Err(StoreError::Validation(format!(
                "levels are keyed by number, got id {:?}",
                id
            ))),
            (_, EntityKey::Level(n)) => Err(StoreError::Validation(format!(
                "{} are keyed by id, got level {}",
                content_type, n
            ))),
            (_, EntityKey::Id(id)) => validate_id(content_type, id),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntityKey::Level(n) => Value::from(*n),
            EntityKey::Id(id) => Value::from(id.as_str()),
        }
    }
}

fn validate_id(content_type: ContentType, id: &str) -> Result<(), StoreError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Validation(format!("{} id is empty", content_type)));
    }
    if PLACEHOLDER_IDS.iter().any(|p| trimmed.eq_ignore_ascii_case(p)) {
        return Err(StoreError::Validation(format!(
            "{} id {:?} is a placeholder value",
            content_type, id
        )));
    }
    if trimmed != id
        || id.contains(&['/', '\\'][..])
        || id.contains("..")
        || id.chars().any(char::is_control)
    {
        return Err(StoreError::Validation(format!(
            "{} id {:?} cannot be used as a file name",
            content_type, id
        )));
    }
    Ok(())
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Level(n) => write!(f, "{}", n),
            EntityKey::Id(id) => f.write_str(id),
        }
    }
}

/// A level, keyed by its number.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelEntity {
    pub level: u32,
    /// Everything except the key, as authored.
    pub fields: Map<String, Value>,
}

/// A task, achievement, upgrade or character, keyed by a string id.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedEntity {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// One content item. The key is explicit; the remaining fields stay open so
/// admin-authored documents with extra properties survive a round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Level(LevelEntity),
    Task(KeyedEntity),
    Achievement(KeyedEntity),
    Upgrade(KeyedEntity),
    Character(KeyedEntity),
}

impl Entity {
    /// Build an entity of `content_type` from a JSON document, validating its key.
    pub fn from_value(content_type: ContentType, value: Value) -> Result<Self, StoreError> {
        let Value::Object(mut fields) = value else {
            return Err(StoreError::Validation(format!(
                "{} document must be a JSON object",
                content_type
            )));
        };
        let raw_key = fields.remove(content_type.key_field());
        let key = EntityKey::from_field(content_type, raw_key.as_ref())?;
        Self::with_key(content_type, key, fields)
    }

    /// Build an entity from an already-parsed key and its remaining fields.
    pub fn with_key(
        content_type: ContentType,
        key: EntityKey,
        mut fields: Map<String, Value>,
    ) -> Result<Self, StoreError> {
        key.validate_for(content_type)?;
        fields.remove(content_type.key_field());

        let entity = match (content_type, key) {
            (ContentType::Levels, EntityKey::Level(level)) => {
                Entity::Level(LevelEntity { level, fields })
            }
            (ContentType::Tasks, EntityKey::Id(id)) => Entity::Task(KeyedEntity { id, fields }),
            (ContentType::Achievements, EntityKey::Id(id)) => {
                Entity::Achievement(KeyedEntity { id, fields })
            }
            (ContentType::Upgrades, EntityKey::Id(id)) => Entity::Upgrade(KeyedEntity { id, fields }),
            (ContentType::Characters, EntityKey::Id(id)) => {
                Entity::Character(KeyedEntity { id, fields })
            }
            (content_type, key) => {
                return Err(StoreError::Validation(format!(
                    "key {} does not fit content type {}",
                    key, content_type
                )))
            }
        };
        Ok(entity)
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Entity::Level(_) => ContentType::Levels,
            Entity::Task(_) => ContentType::Tasks,
            Entity::Achievement(_) => ContentType::Achievements,
            Entity::Upgrade(_) => ContentType::Upgrades,
            Entity::Character(_) => ContentType::Characters,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Level(l) => EntityKey::Level(l.level),
            Entity::Task(e) | Entity::Achievement(e) | Entity::Upgrade(e) | Entity::Character(e) => {
                EntityKey::Id(e.id.clone())
            }
        }
    }

    pub fn fields(&self) -> &Map<String, Value> {
        match self {
            Entity::Level(l) => &l.fields,
            Entity::Task(e) | Entity::Achievement(e) | Entity::Upgrade(e) | Entity::Character(e) => {
                &e.fields
            }
        }
    }

    pub fn fields_mut(&mut self) -> &mut Map<String, Value> {
        match self {
            Entity::Level(l) => &mut l.fields,
            Entity::Task(e) | Entity::Achievement(e) | Entity::Upgrade(e) | Entity::Character(e) => {
                &mut e.fields
            }
        }
    }

    /// Shorthand for reading one field of the document.
    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == self.content_type().key_field() {
            return None;
        }
        self.fields().get(field)
    }

    /// The full document, key included. The key always wins over a same-named field.
    pub fn to_value(&self) -> Value {
        let mut doc = self.fields().clone();
        doc.insert(self.content_type().key_field().to_string(), self.key().to_value());
        Value::Object(doc)
    }

    /// Pretty-printed document with sorted keys and a trailing newline.
    pub fn to_pretty_json(&self) -> Result<String, StoreError> {
        let mut json = serde_json::to_string_pretty(&self.to_value()).map_err(|e| {
            StoreError::Serialization(format!(
                "Failed to serialize {} {}: {}",
                self.content_type(),
                self.key(),
                e
            ))
        })?;
        json.push('\n');
        Ok(json)
    }
}
