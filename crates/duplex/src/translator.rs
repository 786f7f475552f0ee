//! Bidirectional mapping between canonical records and relational rows
//!
//! - `id` maps to the configured primary-key column
//! - `revision` maps to the configured version column
//! - `collection` is implied by the target table and never stored as a column
//! - Scalars map 1:1; arrays, objects and integers outside `i64` are stored
//!   as a JSON blob
//!
//! Every well-formed record survives `to_primary(to_secondary(r)) == r`.
//! There are no lossy fields: blobs are decoded back with `serde_json`, and a
//! JSON number that parsed as a float stays a float.

use duplex_core::{
    ColumnValue, DuplexError, Record, Result, Revision, Row, RowMutation, TranslatorConfig,
};
use serde_json::{Number, Value};

#[derive(Debug, Clone, Default)]
pub struct SchemaTranslator {
    config: TranslatorConfig,
}

impl SchemaTranslator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn id_column(&self) -> &str {
        &self.config.id_column
    }

    pub fn revision_column(&self) -> &str {
        &self.config.revision_column
    }

    /// Secondary table backing `collection`.
    pub fn table_for(&self, collection: &str) -> String {
        format!("{}{}", self.config.table_prefix, collection)
    }

    /// Inverse of [`table_for`](Self::table_for).
    pub fn collection_for(&self, table: &str) -> Result<String> {
        table
            .strip_prefix(self.config.table_prefix.as_str())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                DuplexError::Mapping(format!(
                    "table '{}' does not carry prefix '{}'",
                    table, self.config.table_prefix
                ))
            })
    }

    /// Validate that `record` can be written to the secondary store.
    ///
    /// Runs before any store is touched so a contract violation never leaves
    /// partial state behind.
    pub fn check(&self, record: &Record) -> Result<()> {
        if record.id.is_empty() {
            return Err(DuplexError::Mapping(format!(
                "record in '{}' has an empty id",
                record.collection
            )));
        }
        if record.collection.is_empty() {
            return Err(DuplexError::Mapping(format!(
                "record '{}' has no collection",
                record.id
            )));
        }
        if let Some(name) = record
            .attributes
            .keys()
            .find(|name| self.config.is_reserved(name))
        {
            return Err(DuplexError::Mapping(format!(
                "attribute '{}' of {} collides with a reserved column",
                name,
                record.key()
            )));
        }
        Ok(())
    }

    pub fn to_secondary(&self, record: &Record) -> Result<Row> {
        self.check(record)?;

        let mut row = Row::new(self.table_for(&record.collection));
        row.columns
            .push((self.config.id_column.clone(), ColumnValue::Text(record.id.clone())));
        row.columns.push((
            self.config.revision_column.clone(),
            record
                .revision
                .as_ref()
                .map(|r| ColumnValue::Text(r.as_str().to_string()))
                .unwrap_or(ColumnValue::Null),
        ));

        for (name, value) in &record.attributes {
            row.columns.push((name.clone(), encode_value(value)?));
        }
        Ok(row)
    }

    pub fn to_primary(&self, row: &Row) -> Result<Record> {
        let collection = self.collection_for(&row.table)?;

        let id = match row.get(&self.config.id_column) {
            Some(ColumnValue::Text(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(DuplexError::Mapping(format!(
                    "id column '{}' in '{}' must be non-empty text, got {:?}",
                    self.config.id_column, row.table, other
                )))
            }
            None => {
                return Err(DuplexError::Mapping(format!(
                    "row in '{}' has no '{}' column",
                    row.table, self.config.id_column
                )))
            }
        };

        let revision = match row.get(&self.config.revision_column) {
            None | Some(ColumnValue::Null) => None,
            Some(ColumnValue::Text(rev)) => Some(Revision::new(rev.clone())),
            Some(other) => {
                return Err(DuplexError::Mapping(format!(
                    "version column '{}' of {}/{} must be text, got {:?}",
                    self.config.revision_column, collection, id, other
                )))
            }
        };

        let mut record = Record::new(collection, id);
        record.revision = revision;
        for (name, value) in &row.columns {
            if self.config.is_reserved(name) {
                continue;
            }
            record.attributes.insert(name.clone(), decode_value(value)?);
        }
        Ok(record)
    }

    pub fn upsert_mutation(&self, record: &Record) -> Result<RowMutation> {
        Ok(RowMutation::Upsert {
            row: self.to_secondary(record)?,
            id_column: self.config.id_column.clone(),
        })
    }

    pub fn delete_mutation(&self, collection: &str, id: &str) -> RowMutation {
        RowMutation::Delete {
            table: self.table_for(collection),
            id_column: self.config.id_column.clone(),
            id: id.to_string(),
        }
    }

    /// Names of fields that differ between the primary and secondary view of
    /// one record.
    ///
    /// A null attribute and a missing attribute compare equal, since the
    /// secondary store cannot tell them apart. A differing revision is
    /// reported under the version column name.
    pub fn diff(&self, primary: &Record, secondary: &Record) -> Vec<String> {
        let mut fields = Vec::new();
        if primary.revision != secondary.revision {
            fields.push(self.config.revision_column.clone());
        }

        fn present(value: Option<&Value>) -> Option<&Value> {
            value.filter(|v| !v.is_null())
        }
        for (name, value) in &primary.attributes {
            if present(Some(value)) != present(secondary.attributes.get(name)) {
                fields.push(name.clone());
            }
        }
        for (name, value) in &secondary.attributes {
            if !value.is_null() && !primary.attributes.contains_key(name) {
                fields.push(name.clone());
            }
        }
        fields
    }
}

/// Encode one attribute value as a column value.
pub fn encode_value(value: &Value) -> Result<ColumnValue> {
    Ok(match value {
        Value::Null => ColumnValue::Null,
        Value::Bool(b) => ColumnValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ColumnValue::Integer(i)
            } else if n.is_f64() {
                match n.as_f64() {
                    Some(f) => ColumnValue::Real(f),
                    None => ColumnValue::Blob(serde_json::to_vec(value)?),
                }
            } else {
                // u64 above i64::MAX
                ColumnValue::Blob(serde_json::to_vec(value)?)
            }
        }
        Value::String(s) => ColumnValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => ColumnValue::Blob(serde_json::to_vec(value)?),
    })
}

/// Decode one column value back into an attribute value.
pub fn decode_value(value: &ColumnValue) -> Result<Value> {
    Ok(match value {
        ColumnValue::Null => Value::Null,
        ColumnValue::Bool(b) => Value::Bool(*b),
        ColumnValue::Integer(i) => Value::Number((*i).into()),
        ColumnValue::Real(f) => Number::from_f64(*f).map(Value::Number).ok_or_else(|| {
            DuplexError::Mapping(format!("non-finite real {} has no JSON form", f))
        })?,
        ColumnValue::Text(s) => Value::String(s.clone()),
        ColumnValue::Blob(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| DuplexError::Mapping(format!("blob column is not JSON: {}", e)))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn translator() -> SchemaTranslator {
        SchemaTranslator::default()
    }

    #[test]
    fn test_round_trip_scalars_and_nested() {
        let record = Record::new("users", "u1")
            .with_revision(Revision::new("3-abc"))
            .with("name", "Alice")
            .with("age", 30)
            .with("score", 9.5)
            .with("active", true)
            .with("nickname", Value::Null)
            .with("address", json!({"city": "Oslo", "zip": ["0150", 150]}))
            .with("tags", json!(["a", "b"]))
            .with("big", json!(u64::MAX));

        let t = translator();
        let row = t.to_secondary(&record).unwrap();
        assert_eq!(row.table, "users");
        assert_eq!(row.get("id"), Some(&ColumnValue::Text("u1".into())));
        assert_eq!(row.get("_rev"), Some(&ColumnValue::Text("3-abc".into())));
        assert!(matches!(row.get("address"), Some(ColumnValue::Blob(_))));
        assert!(matches!(row.get("big"), Some(ColumnValue::Blob(_))));
        assert_eq!(row.get("score"), Some(&ColumnValue::Real(9.5)));

        assert_eq!(t.to_primary(&row).unwrap(), record);
    }

    #[test]
    fn test_round_trip_without_revision() {
        let record = Record::new("users", "u1").with("name", "Alice");
        let t = translator();
        let row = t.to_secondary(&record).unwrap();
        assert_eq!(row.get("_rev"), Some(&ColumnValue::Null));
        assert_eq!(t.to_primary(&row).unwrap(), record);
    }

    #[test]
    fn test_reserved_collision_is_mapping_error() {
        let t = translator();
        let record = Record::new("users", "u1").with("_rev", "spoof");
        assert!(matches!(t.to_secondary(&record), Err(DuplexError::Mapping(_))));

        let record = Record::new("users", "u1").with("id", "other");
        assert!(matches!(t.check(&record), Err(DuplexError::Mapping(_))));
    }

    #[test]
    fn test_table_prefix() {
        let t = SchemaTranslator::new(TranslatorConfig::default().with_table_prefix("app_"));
        assert_eq!(t.table_for("users"), "app_users");
        assert_eq!(t.collection_for("app_users").unwrap(), "users");
        assert!(t.collection_for("users").is_err());

        let row = t
            .to_secondary(&Record::new("orders", "o1").with("total", 12))
            .unwrap();
        assert_eq!(t.to_primary(&row).unwrap().collection, "orders");
    }

    #[test]
    fn test_to_primary_rejects_malformed_rows() {
        let t = translator();
        let no_id = Row::new("users").with("name", "Alice");
        assert!(matches!(t.to_primary(&no_id), Err(DuplexError::Mapping(_))));

        let bad_rev = Row::new("users").with("id", "u1").with("_rev", 7i64);
        assert!(matches!(t.to_primary(&bad_rev), Err(DuplexError::Mapping(_))));

        let bad_blob = Row::new("users")
            .with("id", "u1")
            .with("doc", ColumnValue::Blob(b"not json".to_vec()));
        assert!(matches!(t.to_primary(&bad_blob), Err(DuplexError::Mapping(_))));
    }

    #[test]
    fn test_diff_treats_null_as_absent() {
        let t = translator();
        let a = Record::new("users", "u1")
            .with_revision(Revision::new("1-a"))
            .with("name", "Alice")
            .with("nickname", Value::Null);
        let b = Record::new("users", "u1")
            .with_revision(Revision::new("1-a"))
            .with("name", "Alice");
        assert!(t.diff(&a, &b).is_empty());

        let c = Record::new("users", "u1")
            .with_revision(Revision::new("2-b"))
            .with("name", "Alicia")
            .with("extra", 1);
        assert_eq!(t.diff(&a, &c), vec!["_rev", "name", "extra"]);
    }
}
