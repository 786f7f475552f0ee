use serde::{Deserialize, Serialize};

/// Reserved column layout on the secondary side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatorConfig {
    /// Primary-key column holding the canonical id.
    /// Default: "id"
    #[serde(default = "default_id_column")]
    pub id_column: String,

    /// Column holding the primary revision token.
    /// Default: "_rev"
    #[serde(default = "default_revision_column")]
    pub revision_column: String,

    /// Prefix applied to collection names to form table names.
    /// Default: "" (table name == collection name)
    #[serde(default)]
    pub table_prefix: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_revision_column() -> String {
    "_rev".to_string()
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            id_column: default_id_column(),
            revision_column: default_revision_column(),
            table_prefix: String::new(),
        }
    }
}

impl TranslatorConfig {
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn is_reserved(&self, name: &str) -> bool {
        name == self.id_column || name == self.revision_column
    }
}
