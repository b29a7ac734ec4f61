use serde::Serialize;
use serde_json::{Map, Value};

use crate::entity::{ContentType, Entity};
use crate::error::StoreError;

/// Property of a master document holding the template for new entities.
pub const DEFAULTS_FIELD: &str = "defaults";

/// Editor-facing aggregate of every entity of one content type.
///
/// On disk: `{"<content type>": [ ...entities... ], "defaults": { ... }}`.
/// The running game never reads it; fan-out sync copies it into the live store.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterDocument {
    pub content_type: ContentType,
    /// Raw array elements. Each is validated separately during sync.
    pub elements: Vec<Value>,
    /// Optional template for newly created entities.
    pub defaults: Option<Map<String, Value>>,
    /// Any other top-level properties, written back untouched.
    pub extra: Map<String, Value>,
}

impl MasterDocument {
    /// File name of the master document for a content type.
    pub fn file_name(content_type: ContentType) -> String {
        format!("{}-master.json", content_type)
    }

    /// Parse a master document. A document that is not an object or that
    /// lacks its array property is reported as a missing sync source.
    pub fn from_json(content_type: ContentType, json: &str) -> Result<Self, StoreError> {
        let value: Value = serde_json::from_str(json).map_err(|e| {
            StoreError::SyncSourceMissing(format!(
                "{} master document is not valid JSON: {}",
                content_type, e
            ))
        })?;

        let Value::Object(mut doc) = value else {
            return Err(StoreError::SyncSourceMissing(format!(
                "{} master document must be a JSON object",
                content_type
            )));
        };

        let elements = match doc.remove(content_type.as_str()) {
            Some(Value::Array(elements)) => elements,
            Some(other) => {
                return Err(StoreError::SyncSourceMissing(format!(
                    "{} master document field '{}' must be an array, got {}",
                    content_type,
                    content_type,
                    type_name(&other)
                )))
            }
            None => {
                return Err(StoreError::SyncSourceMissing(format!(
                    "{} master document has no '{}' array",
                    content_type, content_type
                )))
            }
        };

        let defaults = match doc.remove(DEFAULTS_FIELD) {
            Some(Value::Object(defaults)) => Some(defaults),
            Some(other) => {
                doc.insert(DEFAULTS_FIELD.to_string(), other);
                None
            }
            None => None,
        };

        Ok(Self {
            content_type,
            elements,
            defaults,
            extra: doc,
        })
    }

    /// Build a master document from live entities, ordered by key.
    pub fn from_entities(
        content_type: ContentType,
        entities: Vec<Entity>,
        defaults: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            content_type,
            elements: Vec::new(),
            defaults,
            extra: Map::new(),
        }
        .with_entities(entities)
    }

    /// Replace the array with live entities, ordered by key. Defaults and
    /// other properties are kept.
    pub fn with_entities(mut self, mut entities: Vec<Entity>) -> Self {
        entities.sort_by_key(Entity::key);
        self.elements = entities.iter().map(Entity::to_value).collect();
        self
    }

    pub fn to_pretty_json(&self) -> Result<String, StoreError> {
        let mut doc = self.extra.clone();
        doc.insert(
            self.content_type.as_str().to_string(),
            Value::Array(self.elements.clone()),
        );
        if let Some(defaults) = &self.defaults {
            doc.insert(DEFAULTS_FIELD.to_string(), Value::Object(defaults.clone()));
        }
        let mut json = serde_json::to_string_pretty(&Value::Object(doc)).map_err(|e| {
            StoreError::Serialization(format!(
                "Failed to serialize {} master document: {}",
                self.content_type, e
            ))
        })?;
        json.push('\n');
        Ok(json)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One master array element that could not be written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementFailure {
    /// Position in the master array.
    pub index: usize,
    /// Key of the element, when it had a usable one.
    pub key: Option<String>,
    pub reason: String,
}

/// Result of fanning out one master document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub content_type: ContentType,
    /// Number of entity files written.
    pub written: usize,
    pub failures: Vec<ElementFailure>,
}

impl SyncReport {
    pub fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            written: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome for one content type within a full sync.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSyncOutcome {
    pub content_type: ContentType,
    pub written: usize,
    pub failures: Vec<ElementFailure>,
    /// Set when the whole type was skipped (e.g. its master document is missing).
    pub error: Option<String>,
}

impl TypeSyncOutcome {
    pub fn from_result(content_type: ContentType, result: Result<SyncReport, StoreError>) -> Self {
        match result {
            Ok(report) => Self {
                content_type,
                written: report.written,
                failures: report.failures,
                error: None,
            },
            Err(e) => Self {
                content_type,
                written: 0,
                failures: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

/// Aggregated result of syncing every content type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncAllReport {
    pub outcomes: Vec<TypeSyncOutcome>,
}

impl SyncAllReport {
    pub fn total_written(&self) -> usize {
        self.outcomes.iter().map(|o| o.written).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| o.failures.len() + usize::from(o.error.is_some()))
            .sum()
    }

    pub fn get(&self, content_type: ContentType) -> Option<&TypeSyncOutcome> {
        self.outcomes.iter().find(|o| o.content_type == content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_master_document() {
        let json = r#"{"upgrades": [{"id": "a"}, {"id": "b"}], "defaults": {"maxLevel": 10}}"#;
        let doc = MasterDocument::from_json(ContentType::Upgrades, json).unwrap();
        assert_eq!(doc.elements.len(), 2);
        assert_eq!(doc.defaults.unwrap()["maxLevel"], json!(10));
    }

    #[test]
    fn test_missing_array_is_source_missing() {
        for json in [
            r#"{"levels": []}"#,
            r#"{"upgrades": {"id": "a"}}"#,
            r#"[1, 2]"#,
            "not json",
        ] {
            let err = MasterDocument::from_json(ContentType::Upgrades, json).unwrap_err();
            assert!(matches!(err, StoreError::SyncSourceMissing(_)), "{}", json);
        }
    }

    #[test]
    fn test_from_entities_orders_by_key() {
        let entities = vec![
            Entity::from_value(ContentType::Levels, json!({"level": 2})).unwrap(),
            Entity::from_value(ContentType::Levels, json!({"level": 1})).unwrap(),
        ];
        let doc = MasterDocument::from_entities(ContentType::Levels, entities, None);
        let reparsed =
            MasterDocument::from_json(ContentType::Levels, &doc.to_pretty_json().unwrap()).unwrap();
        assert_eq!(reparsed.elements, vec![json!({"level": 1}), json!({"level": 2})]);
        assert_eq!(reparsed.defaults, None);
    }

    #[test]
    fn test_sync_all_totals() {
        let mut report = SyncReport::new(ContentType::Tasks);
        report.written = 3;
        report.failures.push(ElementFailure {
            index: 1,
            key: None,
            reason: "missing id".to_string(),
        });
        let all = SyncAllReport {
            outcomes: vec![
                TypeSyncOutcome::from_result(ContentType::Tasks, Ok(report)),
                TypeSyncOutcome::from_result(
                    ContentType::Levels,
                    Err(StoreError::SyncSourceMissing("gone".to_string())),
                ),
            ],
        };
        assert_eq!(all.total_written(), 3);
        assert_eq!(all.total_failures(), 2);
        assert!(all.get(ContentType::Levels).unwrap().error.is_some());
    }
}
