use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;

use crate::error::{ConsoleError, ConsoleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateCategory {
    Development,
    Production,
    Edge,
    Backup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerProtocol {
    #[default]
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub protocol: BrokerProtocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u32,
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period: u32,
}

fn default_keepalive() -> u16 {
    60
}

fn default_connect_timeout() -> u32 {
    30
}

fn default_reconnect_period() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackBroker {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: BrokerProtocol,
    #[serde(default)]
    pub priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TemplateMetadata {
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// A saved broker connection profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerTemplate {
    pub template_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: TemplateCategory,
    pub config: BrokerConfig,
    #[serde(default)]
    pub fallback_brokers: Vec<FallbackBroker>,
    #[serde(default)]
    pub metadata: TemplateMetadata,
}

impl BrokerTemplate {
    pub fn validate(&self) -> ConsoleResult<()> {
        if self.template_id.trim().is_empty() {
            return Err(ConsoleError::Validation("template_id must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(ConsoleError::Validation("template name must not be empty".to_string()));
        }
        if self.config.host.trim().is_empty() {
            return Err(ConsoleError::Validation("broker host must not be empty".to_string()));
        }
        if self.config.port == 0 {
            return Err(ConsoleError::Validation("broker port must be greater than zero".to_string()));
        }
        if self.config.qos > 2 {
            return Err(ConsoleError::Validation(format!("qos {} is not 0, 1 or 2", self.config.qos)));
        }
        if let Some(fallback) = self.fallback_brokers.iter().find(|b| b.host.trim().is_empty() || b.port == 0) {
            return Err(ConsoleError::Validation(format!(
                "fallback broker '{}:{}' is incomplete",
                fallback.host, fallback.port
            )));
        }
        Ok(())
    }
}

/// Backend-assigned identifier; the middleware uses numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Number(n) => write!(f, "{}", n),
            ItemId::Text(s) => f.write_str(s),
        }
    }
}

/// A static payload the gateway republishes on an interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,
    pub topic: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub lwt: bool,
    #[serde(default)]
    pub retain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    pub original_key: String,
    pub custom_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDevice {
    pub device_id: String,
    #[serde(default)]
    pub device_name: Option<String>,
    pub mqtt_topic: String,
    /// Device-library profile used to look up `available_keys`.
    #[serde(default)]
    pub part_number: Option<String>,
    #[serde(default)]
    pub available_keys: Vec<String>,
    #[serde(default)]
    pub key_mappings: Vec<KeyMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    pub broker_url: String,
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_publish_interval")]
    pub interval: u64,
}

fn default_publish_interval() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemappingConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source_devices: Vec<SourceDevice>,
    pub mqtt_publish_config: PublishConfig,
}

impl RemappingConfig {
    pub fn validate(&self) -> ConsoleResult<()> {
        if self.id.trim().is_empty() {
            return Err(ConsoleError::Validation("remapping id must not be empty".to_string()));
        }
        if self.mqtt_publish_config.topic.trim().is_empty() {
            return Err(ConsoleError::Validation("publish topic must not be empty".to_string()));
        }
        if self.mqtt_publish_config.qos > 2 {
            return Err(ConsoleError::Validation(format!(
                "qos {} is not 0, 1 or 2",
                self.mqtt_publish_config.qos
            )));
        }

        let mut custom_keys = HashSet::new();
        for device in &self.source_devices {
            if device.device_id.trim().is_empty() || device.mqtt_topic.trim().is_empty() {
                return Err(ConsoleError::Validation(
                    "source devices need a device_id and an mqtt_topic".to_string(),
                ));
            }
            for mapping in &device.key_mappings {
                if mapping.original_key.trim().is_empty() || mapping.custom_key.trim().is_empty() {
                    return Err(ConsoleError::Validation(format!(
                        "device '{}' has an empty key mapping",
                        device.device_id
                    )));
                }
                if !custom_keys.insert(mapping.custom_key.trim().to_string()) {
                    return Err(ConsoleError::Validation(format!(
                        "custom key '{}' is mapped twice",
                        mapping.custom_key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Command form: `available_keys` is derived locally and never sent.
    pub fn to_command_value(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(devices) = value.get_mut("source_devices").and_then(Value::as_array_mut) {
            for device in devices {
                if let Some(map) = device.as_object_mut() {
                    map.remove("available_keys");
                }
            }
        }
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn validate(&self) -> ConsoleResult<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(ConsoleError::Validation(format!(
                "latitude {} is outside -90..90",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(ConsoleError::Validation(format!(
                "longitude {} is outside -180..180",
                self.longitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub base_topic: String,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> BrokerTemplate {
        serde_json::from_value(json!({
            "template_id": "edge-1",
            "name": "Edge broker",
            "category": "edge",
            "config": { "protocol": "mqtts", "host": "10.0.0.2", "port": 8883, "ssl": true, "qos": 1 }
        }))
        .unwrap()
    }

    #[test]
    fn template_defaults_and_validation() {
        let mut template = template();
        assert_eq!(template.config.keepalive, 60);
        assert!(template.fallback_brokers.is_empty());
        assert!(template.validate().is_ok());

        template.config.qos = 3;
        assert!(matches!(template.validate(), Err(ConsoleError::Validation(_))));
    }

    #[test]
    fn item_ids_accept_numbers_and_strings() {
        let item: DataItem = serde_json::from_value(json!({ "id": 7, "topic": "a" })).unwrap();
        assert_eq!(item.id, Some(ItemId::Number(7)));
        let item: DataItem = serde_json::from_value(json!({ "id": "x-7", "topic": "a" })).unwrap();
        assert_eq!(item.id.unwrap().to_string(), "x-7");
    }

    #[test]
    fn available_keys_never_leave_the_console() {
        let config: RemappingConfig = serde_json::from_value(json!({
            "id": "r1",
            "source_devices": [{
                "device_id": "pm1",
                "mqtt_topic": "modbus/pm1",
                "available_keys": ["voltage"],
                "key_mappings": [{ "original_key": "voltage", "custom_key": "v" }]
            }],
            "mqtt_publish_config": { "broker_url": "mqtt://localhost:1883", "topic": "remapped/pm1" }
        }))
        .unwrap();
        assert!(config.validate().is_ok());

        let outbound = config.to_command_value();
        assert!(outbound["source_devices"][0].get("available_keys").is_none());
        assert_eq!(outbound["source_devices"][0]["key_mappings"][0]["custom_key"], "v");
    }

    #[test]
    fn duplicate_custom_keys_are_rejected() {
        let mut config: RemappingConfig = serde_json::from_value(json!({
            "id": "r1",
            "source_devices": [
                { "device_id": "a", "mqtt_topic": "t/a", "key_mappings": [{ "original_key": "x", "custom_key": "k" }] },
                { "device_id": "b", "mqtt_topic": "t/b", "key_mappings": [{ "original_key": "y", "custom_key": "k" }] }
            ],
            "mqtt_publish_config": { "broker_url": "", "topic": "out" }
        }))
        .unwrap();
        assert!(config.validate().is_err());
        config.source_devices[1].key_mappings[0].custom_key = "k2".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn location_bounds() {
        assert!(Location { latitude: 91.0, longitude: 0.0 }.validate().is_err());
        assert!(Location { latitude: -6.2, longitude: 106.8 }.validate().is_ok());
    }
}
