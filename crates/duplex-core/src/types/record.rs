use serde::{Deserialize, Serialize};
use std::fmt;

/// Attribute map of a record. Insertion order is preserved.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Opaque revision token assigned by the primary store.
///
/// Only meaningful relative to the primary; the secondary stores it verbatim
/// in its version column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Canonical unit of data shared by both stores.
///
/// `id` and `collection` identify the record in both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    pub collection: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Record {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            revision: None,
            collection: collection.into(),
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// `collection/id`, used in logs and error messages.
    pub fn key(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_preserves_insertion_order() {
        let record = Record::new("users", "u1")
            .with("name", "Alice")
            .with("age", 30)
            .with("email", "alice@example.com");

        let keys: Vec<&str> = record.attributes.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["name", "age", "email"]);
        assert_eq!(record.get("age"), Some(&json!(30)));
        assert_eq!(record.key(), "users/u1");
    }

    #[test]
    fn test_serde_skips_missing_revision() {
        let record = Record::new("users", "u1").with("name", "Alice");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("revision").is_none());

        let with_rev = record.with_revision(Revision::new("1-abc"));
        let json = serde_json::to_value(&with_rev).unwrap();
        assert_eq!(json["revision"], json!("1-abc"));
    }
}
