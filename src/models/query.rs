//! Statements, parameters and results.

use crate::models::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// A result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Structured value stored in a JSON column
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Convert a JSON value taken from a row or fixture into a parameter.
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for QueryParam {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::from_json(&v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A SQL statement with positional `?` parameters.
///
/// The optional table is what the statement is "about"; sessions use it to
/// pick a bind when no explicit one is given.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
    pub table: Option<Arc<Table>>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            table: None,
        }
    }

    /// Append a positional parameter.
    pub fn bind(mut self, param: impl Into<QueryParam>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Declare the table this statement targets.
    pub fn for_table(mut self, table: Arc<Table>) -> Self {
        self.table = Some(table);
        self
    }

    /// Bind key of the targeted table, if any.
    pub fn bind_key(&self) -> Option<&str> {
        self.table.as_ref().and_then(|t| t.bind_key.as_deref())
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// Outcome of a data-modifying statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Auto-generated key of the last inserted row (MySQL and SQLite only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_deserialization() {
        let json = r#"[null, true, 42, 3.15, "hello"]"#;
        let params: Vec<QueryParam> = serde_json::from_str(json).unwrap();

        assert!(matches!(params[0], QueryParam::Null));
        assert!(matches!(params[1], QueryParam::Bool(true)));
        assert!(matches!(params[2], QueryParam::Int(42)));
        assert!(matches!(params[3], QueryParam::Float(f) if (f - 3.15).abs() < 0.001));
        assert!(matches!(params[4], QueryParam::String(ref s) if s == "hello"));
    }

    #[test]
    fn test_query_param_from_json_object() {
        let value = serde_json::json!({"tags": ["a"]});
        assert!(matches!(QueryParam::from_json(&value), QueryParam::Json(_)));
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some("x")), QueryParam::String("x".into()));
    }

    #[test]
    fn test_statement_builder() {
        let table = Arc::new(Table::new("events").bind_key("analytics"));
        let stmt = Statement::new("SELECT * FROM events WHERE id = ?")
            .bind(7)
            .for_table(table);
        assert_eq!(stmt.params, vec![QueryParam::Int(7)]);
        assert_eq!(stmt.bind_key(), Some("analytics"));
        assert_eq!(Statement::from("SELECT 1").bind_key(), None);
    }
}
