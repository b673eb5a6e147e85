//! SQL schema definitions.

/// Schema v1: a single ordered key-value table.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;
