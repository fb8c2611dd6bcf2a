//! Device library editor.
//!
//! The library (`section → manufacturer → part_number → protocol →
//! variables`) is owned by the middleware. The console only keeps the last
//! summary it received and filters it locally for the cascading pickers.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{Cache, ControllerContext};
use crate::error::{ConsoleError, ConsoleResult};
use crate::mqtt_service::SubscriptionGuard;
use crate::service_utils::RefreshTask;
use crate::topics::{LIBRARY_COMMAND, LIBRARY_SUMMARY};

/// One register mapping of a device profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceVariableEntry {
    pub var_name: String,
    pub relative_address: u32,
    pub register_type: String,
    #[serde(default = "default_word_length")]
    pub word_length: u8,
    pub data_type: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_word_length() -> u8 {
    1
}

fn default_multiplier() -> f64 {
    1.0
}

type Protocols = BTreeMap<String, Vec<DeviceVariableEntry>>;
type PartNumbers = BTreeMap<String, Protocols>;
type Manufacturers = BTreeMap<String, PartNumbers>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LibrarySummary {
    pub sections: BTreeMap<String, Manufacturers>,
}

impl LibrarySummary {
    pub fn sections(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    pub fn manufacturers(&self, section: &str) -> Vec<String> {
        self.sections
            .get(section)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn part_numbers(&self, section: &str, manufacturer: &str) -> Vec<String> {
        self.sections
            .get(section)
            .and_then(|m| m.get(manufacturer))
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn protocols(&self, section: &str, manufacturer: &str, part_number: &str) -> Vec<String> {
        self.sections
            .get(section)
            .and_then(|m| m.get(manufacturer))
            .and_then(|p| p.get(part_number))
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn variables(
        &self,
        section: &str,
        manufacturer: &str,
        part_number: &str,
        protocol: &str,
    ) -> Vec<DeviceVariableEntry> {
        self.sections
            .get(section)
            .and_then(|m| m.get(manufacturer))
            .and_then(|p| p.get(part_number))
            .and_then(|p| p.get(protocol))
            .cloned()
            .unwrap_or_default()
    }

    /// Variable names of the first profile with this part number, in
    /// library order.
    pub fn variable_names_for_part(&self, part_number: &str) -> Option<Vec<String>> {
        self.sections
            .values()
            .flat_map(|manufacturers| manufacturers.values())
            .find_map(|parts| parts.get(part_number))
            .map(|protocols| {
                let mut seen = HashSet::new();
                protocols
                    .values()
                    .flatten()
                    .filter(|v| seen.insert(v.var_name.clone()))
                    .map(|v| v.var_name.clone())
                    .collect()
            })
    }

    fn contains(&self, entry: &LibraryEntryKey) -> bool {
        self.protocols(&entry.section, &entry.manufacturer, &entry.part_number)
            .contains(&entry.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryEntryKey {
    pub section: String,
    pub manufacturer: String,
    pub part_number: String,
    pub protocol: String,
}

impl LibraryEntryKey {
    fn validate(&self) -> ConsoleResult<()> {
        for (name, value) in [
            ("section", &self.section),
            ("manufacturer", &self.manufacturer),
            ("part_number", &self.part_number),
            ("protocol", &self.protocol),
        ] {
            if value.trim().is_empty() {
                return Err(ConsoleError::Validation(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    #[serde(flatten)]
    pub key: LibraryEntryKey,
    pub data: Vec<DeviceVariableEntry>,
}

impl LibraryEntry {
    pub fn validate(&self) -> ConsoleResult<()> {
        self.key.validate()?;
        if self.data.is_empty() {
            return Err(ConsoleError::Validation("at least one variable is required".to_string()));
        }
        let mut names = HashSet::new();
        for variable in &self.data {
            if variable.var_name.trim().is_empty() {
                return Err(ConsoleError::Validation("variable name must not be empty".to_string()));
            }
            if !names.insert(variable.var_name.trim()) {
                return Err(ConsoleError::Validation(format!(
                    "variable '{}' is defined twice",
                    variable.var_name
                )));
            }
            if variable.word_length == 0 {
                return Err(ConsoleError::Validation(format!(
                    "variable '{}' needs a word length of at least 1",
                    variable.var_name
                )));
            }
            if !variable.multiplier.is_finite() {
                return Err(ConsoleError::Validation(format!(
                    "variable '{}' has an invalid multiplier",
                    variable.var_name
                )));
            }
        }
        Ok(())
    }
}

pub struct DeviceLibraryController {
    ctx: ControllerContext,
    summary: Arc<Cache<LibrarySummary>>,
    discovery_task: Mutex<Option<RefreshTask>>,
    _subscriptions: Vec<SubscriptionGuard>,
}

impl DeviceLibraryController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let subscriptions = ctx.subscribe(&[LIBRARY_SUMMARY.response_topics[0], LIBRARY_COMMAND.response_topics[0]]);
        Arc::new(Self {
            ctx,
            summary: Cache::new(),
            discovery_task: Mutex::new(None),
            _subscriptions: subscriptions,
        })
    }

    pub fn summary(&self) -> LibrarySummary {
        self.summary.snapshot()
    }

    pub fn variable_names_for_part(&self, part_number: &str) -> Option<Vec<String>> {
        self.summary.read(|summary| summary.variable_names_for_part(part_number))
    }

    pub fn start_discovery(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = RefreshTask::spawn("device-library", interval, move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(controller) = weak.upgrade() {
                    if controller.ctx.is_connected() {
                        let _ = controller.refresh().await;
                    } else {
                        debug!("Skipping library refresh: not connected.");
                    }
                }
            })
        });
        *self.discovery_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn stop_discovery(&self) {
        let task = self.discovery_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    async fn fetch(&self) -> ConsoleResult<LibrarySummary> {
        let envelope = self.ctx.client.request(&LIBRARY_SUMMARY, "search", json!({})).await?;
        let summary: LibrarySummary = envelope
            .decode(&["summary", "data"])
            .map_err(|e| ConsoleError::malformed(LIBRARY_SUMMARY.response_topics[0], e))?;
        self.summary.replace(summary.clone());
        Ok(summary)
    }

    pub async fn refresh(&self) -> ConsoleResult<LibrarySummary> {
        self.ctx.run("Load device library", "library:summary", self.fetch()).await
    }

    async fn command(&self, label: &str, key: &str, verb: &str, payload: serde_json::Value) -> ConsoleResult<LibrarySummary> {
        self.ctx
            .run(label, key, self.ctx.client.request(&LIBRARY_COMMAND, verb, payload))
            .await?;
        self.ctx.success(format!("{} succeeded", label));
        Ok(self
            .ctx
            .reload("device library", self.fetch(), || self.summary.snapshot())
            .await)
    }

    pub async fn create_section(&self, section: &str) -> ConsoleResult<LibrarySummary> {
        let section = section.trim();
        if section.is_empty() {
            return self.reject("Create section", "section must not be empty");
        }
        if self.summary.read(|s| s.sections.contains_key(section)) {
            return self.reject("Create section", &format!("section '{}' already exists", section));
        }
        self.command(
            "Create section",
            &format!("library:section:{}", section),
            "Create New Section",
            json!({ "section": section }),
        )
        .await
    }

    pub async fn delete_section(&self, section: &str) -> ConsoleResult<LibrarySummary> {
        self.command(
            "Delete section",
            &format!("library:section:{}", section),
            "Delete Section",
            json!({ "section": section }),
        )
        .await
    }

    pub async fn create_entry(&self, entry: LibraryEntry) -> ConsoleResult<LibrarySummary> {
        if let Err(e) = entry.validate() {
            return self.fail("Create device entry", e);
        }
        if self.summary.read(|s| s.contains(&entry.key)) {
            return self.reject(
                "Create device entry",
                &format!("{} {} ({}) already exists", entry.key.manufacturer, entry.key.part_number, entry.key.protocol),
            );
        }
        let key = format!("library:entry:{}:{}", entry.key.part_number, entry.key.protocol);
        self.command("Create device entry", &key, "Create Data", json!(entry)).await
    }

    pub async fn update_entry(&self, entry: LibraryEntry) -> ConsoleResult<LibrarySummary> {
        if let Err(e) = entry.validate() {
            return self.fail("Update device entry", e);
        }
        let key = format!("library:entry:{}:{}", entry.key.part_number, entry.key.protocol);
        self.command("Update device entry", &key, "Update Data", json!(entry)).await
    }

    pub async fn delete_entry(&self, entry: LibraryEntryKey) -> ConsoleResult<LibrarySummary> {
        if let Err(e) = entry.validate() {
            return self.fail("Delete device entry", e);
        }
        let key = format!("library:entry:{}:{}", entry.part_number, entry.protocol);
        self.command("Delete device entry", &key, "Delete Data", json!(entry)).await
    }

    fn reject<T>(&self, label: &str, message: &str) -> ConsoleResult<T> {
        self.fail(label, ConsoleError::Validation(message.to_string()))
    }

    fn fail<T>(&self, label: &str, err: ConsoleError) -> ConsoleResult<T> {
        self.ctx.notifier.report_failure(label, &err);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_client::testing::Harness;
    use crate::controllers::testing::context;

    fn summary_json() -> serde_json::Value {
        json!({
            "Power Meter": {
                "Panasonic": {
                    "KW9M": {
                        "MODBUS": [
                            { "var_name": "voltage", "relative_address": 0, "register_type": "holding", "word_length": 2, "data_type": "FLOAT32", "multiplier": 0.1 },
                            { "var_name": "current", "relative_address": 2, "register_type": "holding", "word_length": 2, "data_type": "FLOAT32", "multiplier": 0.01 }
                        ]
                    }
                },
                "Schneider": { "PM5110": { "MODBUS": [] } }
            },
            "UPS": { "APC": { "SMT1500": { "SNMP": [
                { "var_name": "battery_capacity", "relative_address": 1, "register_type": "oid", "data_type": "INT" }
            ] } } }
        })
    }

    fn summary() -> LibrarySummary {
        serde_json::from_value(summary_json()).unwrap()
    }

    #[test]
    fn cascading_filters() {
        let summary = summary();
        assert_eq!(summary.sections(), vec!["Power Meter", "UPS"]);
        assert_eq!(summary.manufacturers("Power Meter"), vec!["Panasonic", "Schneider"]);
        assert_eq!(summary.part_numbers("Power Meter", "Panasonic"), vec!["KW9M"]);
        assert_eq!(summary.protocols("UPS", "APC", "SMT1500"), vec!["SNMP"]);
        assert_eq!(summary.variables("Power Meter", "Panasonic", "KW9M", "MODBUS").len(), 2);
        assert!(summary.manufacturers("Unknown").is_empty());
        assert!(summary.variables("UPS", "APC", "SMT1500", "MODBUS").is_empty());

        let ups = summary.variables("UPS", "APC", "SMT1500", "SNMP");
        assert_eq!(ups[0].word_length, 1);
        assert_eq!(ups[0].multiplier, 1.0);
    }

    #[test]
    fn variable_names_by_part_number() {
        let summary = summary();
        assert_eq!(
            summary.variable_names_for_part("KW9M"),
            Some(vec!["voltage".to_string(), "current".to_string()])
        );
        assert_eq!(summary.variable_names_for_part("PM5110"), Some(vec![]));
        assert_eq!(summary.variable_names_for_part("nope"), None);
    }

    #[test]
    fn entry_validation() {
        let mut entry = LibraryEntry {
            key: LibraryEntryKey {
                section: "Power Meter".into(),
                manufacturer: "Panasonic".into(),
                part_number: "KW8M".into(),
                protocol: "MODBUS".into(),
            },
            data: summary().variables("Power Meter", "Panasonic", "KW9M", "MODBUS"),
        };
        assert!(entry.validate().is_ok());

        entry.data[1].var_name = "voltage".into();
        assert!(entry.validate().is_err());

        entry.data[1].var_name = "current".into();
        entry.data[1].multiplier = f64::NAN;
        assert!(entry.validate().is_err());
    }

    #[tokio::test]
    async fn create_entry_publishes_then_refreshes() {
        let mut harness = Harness::connected();
        let controller = DeviceLibraryController::attach(context(&harness));
        let entry = LibraryEntry {
            key: LibraryEntryKey {
                section: "UPS".into(),
                manufacturer: "APC".into(),
                part_number: "SMT3000".into(),
                protocol: "SNMP".into(),
            },
            data: vec![DeviceVariableEntry {
                var_name: "load".into(),
                relative_address: 4,
                register_type: "oid".into(),
                word_length: 1,
                data_type: "INT".into(),
                multiplier: 1.0,
            }],
        };

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.create_entry(entry).await })
        };

        let command = harness
            .reply("library/devices/command/response", json!({ "status": "success" }))
            .await;
        assert_eq!(command["command"], "Create Data");
        assert_eq!(command["part_number"], "SMT3000");
        assert_eq!(command["data"][0]["var_name"], "load");

        harness
            .reply("library/devices/summary/search/response", json!({ "summary": summary_json() }))
            .await;
        let refreshed = task.await.unwrap().unwrap();
        assert_eq!(refreshed.sections().len(), 2);
        assert_eq!(controller.summary(), refreshed);
    }

    #[tokio::test]
    async fn delete_section_survives_a_silent_reload() {
        let mut harness = Harness::connected();
        let controller = DeviceLibraryController::attach(context(&harness));
        controller.summary.replace(summary());

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.delete_section("UPS").await })
        };
        harness
            .reply("library/devices/command/response", json!({ "status": "success" }))
            .await;
        harness.next_publish().await;

        assert_eq!(task.await.unwrap().unwrap(), summary());
        let levels: Vec<_> = harness.notifier.recent(10).into_iter().map(|n| n.level).collect();
        assert_eq!(
            levels,
            vec![crate::notifications::Level::Warning, crate::notifications::Level::Success]
        );
    }

    #[tokio::test]
    async fn duplicate_section_is_rejected_locally() {
        let mut harness = Harness::connected();
        let controller = DeviceLibraryController::attach(context(&harness));
        controller.summary.replace(summary());
        assert!(matches!(
            controller.create_section("UPS").await,
            Err(ConsoleError::Validation(_))
        ));
        assert!(harness.published_nothing());
    }
}
