//! Firestore REST API types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Firestore document value types used by video records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    NullValue(()),
    BooleanValue(bool),
    IntegerValue(String), // Firestore sends integers as strings
    TimestampValue(String),
    StringValue(String),
}

/// Firestore document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Full resource name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Document fields
    pub fields: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_time: Option<String>,
    /// Used as the optimistic concurrency token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<String>,
}

impl Document {
    /// Create a new document with the given fields.
    pub fn new(fields: HashMap<String, Value>) -> Self {
        Self {
            fields: Some(fields),
            ..Self::default()
        }
    }

    /// Decode a field, `None` when absent or of another type.
    pub fn field<T: FromFirestoreValue>(&self, name: &str) -> Option<T> {
        self.fields
            .as_ref()
            .and_then(|f| f.get(name))
            .and_then(T::from_firestore_value)
    }
}

/// Convert a Rust value into a Firestore value.
pub trait ToFirestoreValue {
    fn to_firestore_value(&self) -> Value;
}

impl ToFirestoreValue for String {
    fn to_firestore_value(&self) -> Value {
        Value::StringValue(self.clone())
    }
}

impl ToFirestoreValue for &str {
    fn to_firestore_value(&self) -> Value {
        Value::StringValue(self.to_string())
    }
}

impl ToFirestoreValue for DateTime<Utc> {
    fn to_firestore_value(&self) -> Value {
        Value::TimestampValue(self.to_rfc3339())
    }
}

/// Read a Rust value out of a Firestore value.
pub trait FromFirestoreValue: Sized {
    fn from_firestore_value(value: &Value) -> Option<Self>;
}

impl FromFirestoreValue for String {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        match value {
            Value::StringValue(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromFirestoreValue for DateTime<Utc> {
    fn from_firestore_value(value: &Value) -> Option<Self> {
        match value {
            Value::TimestampValue(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_wire_format() {
        let json = serde_json::to_value(Value::StringValue("PUBLIC".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "stringValue": "PUBLIC" }));
    }

    #[test]
    fn test_document_field_decoding() {
        let doc: Document = serde_json::from_value(serde_json::json!({
            "name": "projects/p/databases/(default)/documents/videos/abc",
            "fields": {
                "title": { "stringValue": "Clip" },
                "upload_timestamp": { "timestampValue": "2024-05-01T10:00:00Z" }
            },
            "updateTime": "2024-05-01T10:00:01.123456Z"
        }))
        .unwrap();

        assert_eq!(doc.field::<String>("title").as_deref(), Some("Clip"));
        assert!(doc.field::<DateTime<Utc>>("upload_timestamp").is_some());
        assert!(doc.field::<String>("upload_timestamp").is_none());
        assert!(doc.field::<String>("missing").is_none());
        assert_eq!(doc.update_time.as_deref(), Some("2024-05-01T10:00:01.123456Z"));
    }
}
