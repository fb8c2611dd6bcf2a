//! Typed fields for static payload definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

use crate::models::DataItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadField {
    pub key: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub value: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field key must not be empty")]
    EmptyKey,
    #[error("duplicate field key '{0}'")]
    DuplicateKey(String),
    #[error("field '{key}' must be an integer, got '{value}'")]
    NotAnInteger { key: String, value: String },
    #[error("field '{key}' must be true or false, got '{value}'")]
    NotABoolean { key: String, value: String },
    #[error("field '{key}' must be a JSON object: {reason}")]
    NotAnObject { key: String, reason: String },
    #[error("field '{key}' must be a JSON array: {reason}")]
    NotAnArray { key: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

pub fn parse_field(field: &PayloadField) -> Result<Value, FieldError> {
    let raw = field.value.trim();
    match field.field_type {
        FieldType::String => Ok(Value::String(field.value.clone())),
        FieldType::Int => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| FieldError::NotAnInteger {
                key: field.key.clone(),
                value: field.value.clone(),
            }),
        FieldType::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(FieldError::NotABoolean {
                key: field.key.clone(),
                value: field.value.clone(),
            }),
        },
        FieldType::Object => match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => Ok(value),
            Ok(_) => Err(FieldError::NotAnObject {
                key: field.key.clone(),
                reason: "not an object".to_string(),
            }),
            Err(e) => Err(FieldError::NotAnObject {
                key: field.key.clone(),
                reason: e.to_string(),
            }),
        },
        FieldType::Array => match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Array(_)) => Ok(value),
            Ok(_) => Err(FieldError::NotAnArray {
                key: field.key.clone(),
                reason: "not an array".to_string(),
            }),
            Err(e) => Err(FieldError::NotAnArray {
                key: field.key.clone(),
                reason: e.to_string(),
            }),
        },
    }
}

/// Builds the `data` mapping of a payload. Rejects empty and duplicate keys.
pub fn build_data(fields: &[PayloadField]) -> Result<Map<String, Value>, FieldError> {
    let mut seen = HashSet::new();
    let mut data = Map::new();
    for field in fields {
        let key = field.key.trim();
        if key.is_empty() {
            return Err(FieldError::EmptyKey);
        }
        if !seen.insert(key.to_string()) {
            return Err(FieldError::DuplicateKey(key.to_string()));
        }
        data.insert(key.to_string(), parse_field(field)?);
    }
    Ok(data)
}

/// A payload definition as entered by the operator.
#[derive(Debug, Clone, Deserialize)]
pub struct DataItemDraft {
    pub topic: String,
    #[serde(default)]
    pub fields: Vec<PayloadField>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub lwt: bool,
    #[serde(default)]
    pub retain: bool,
    #[serde(default)]
    pub template_id: Option<String>,
}

fn default_interval() -> u64 {
    10
}

impl DataItemDraft {
    pub fn into_data_item(self) -> Result<DataItem, FieldError> {
        let topic = self.topic.trim().to_string();
        if topic.is_empty() {
            return Err(FieldError::Invalid("topic must not be empty".to_string()));
        }
        if topic.contains('+') || topic.contains('#') {
            return Err(FieldError::Invalid(format!(
                "topic '{}' must not contain wildcards",
                topic
            )));
        }
        if self.qos > 2 {
            return Err(FieldError::Invalid(format!("qos {} is not 0, 1 or 2", self.qos)));
        }
        if self.interval == 0 {
            return Err(FieldError::Invalid("interval must be greater than zero".to_string()));
        }

        Ok(DataItem {
            id: None,
            topic,
            data: build_data(&self.fields)?,
            interval: self.interval,
            qos: self.qos,
            lwt: self.lwt,
            retain: self.retain,
            template_id: self.template_id.filter(|id| !id.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(key: &str, field_type: FieldType, value: &str) -> PayloadField {
        PayloadField {
            key: key.to_string(),
            field_type,
            value: value.to_string(),
        }
    }

    #[test]
    fn typed_fields() {
        assert_eq!(parse_field(&field("n", FieldType::Int, " 42 ")).unwrap(), json!(42));
        assert_eq!(parse_field(&field("b", FieldType::Boolean, "true")).unwrap(), json!(true));
        assert_eq!(parse_field(&field("b", FieldType::Boolean, "FALSE")).unwrap(), json!(false));
        assert_eq!(parse_field(&field("o", FieldType::Object, r#"{"a":1}"#)).unwrap(), json!({"a": 1}));
        assert_eq!(parse_field(&field("l", FieldType::Array, "[1,2]")).unwrap(), json!([1, 2]));
        assert_eq!(parse_field(&field("s", FieldType::String, " raw ")).unwrap(), json!(" raw "));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            parse_field(&field("n", FieldType::Int, "abc")),
            Err(FieldError::NotAnInteger { .. })
        ));
        assert!(matches!(
            parse_field(&field("n", FieldType::Int, "1.5")),
            Err(FieldError::NotAnInteger { .. })
        ));
        assert!(matches!(
            parse_field(&field("b", FieldType::Boolean, "yes")),
            Err(FieldError::NotABoolean { .. })
        ));
        assert!(matches!(
            parse_field(&field("o", FieldType::Object, "{bad")),
            Err(FieldError::NotAnObject { .. })
        ));
        assert!(matches!(
            parse_field(&field("o", FieldType::Object, "[1]")),
            Err(FieldError::NotAnObject { .. })
        ));
        assert!(matches!(
            parse_field(&field("l", FieldType::Array, "{}")),
            Err(FieldError::NotAnArray { .. })
        ));
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let fields = vec![
            field("temperature", FieldType::Int, "20"),
            field(" temperature", FieldType::Int, "21"),
        ];
        assert_eq!(
            build_data(&fields),
            Err(FieldError::DuplicateKey("temperature".to_string()))
        );
    }

    #[test]
    fn draft_is_validated() {
        let draft = DataItemDraft {
            topic: "sensors/#".to_string(),
            fields: vec![],
            interval: 5,
            qos: 1,
            lwt: false,
            retain: false,
            template_id: None,
        };
        assert!(matches!(draft.into_data_item(), Err(FieldError::Invalid(_))));

        let draft: DataItemDraft = serde_json::from_value(json!({
            "topic": "sensors/room1",
            "fields": [{ "key": "online", "type": "boolean", "value": "true" }],
            "qos": 1,
            "template_id": ""
        }))
        .unwrap();
        let item = draft.into_data_item().unwrap();
        assert_eq!(item.data["online"], json!(true));
        assert_eq!(item.interval, 10);
        assert_eq!(item.template_id, None);
    }
}
