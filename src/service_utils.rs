use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::mqtt_service::{MqttService, Outbox};

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Start the MQTT service
pub fn start_mqtt_service(mqtt_service: Arc<MqttService>, outbox: Outbox) -> JoinHandle<()> {
    let mqtt_client_id = format!("gateway_console_{}", Uuid::new_v4());
    tokio::spawn(async move {
        mqtt_service.start(outbox, mqtt_client_id).await;
    })
}

/// Publish a log line on the console's log topic.
pub fn publish_log(mqtt_service: &MqttService, level: &str, message: &str) {
    let payload = json!({ "level": level, "message": message, "timestamp": now_rfc3339() });
    if let Err(e) = mqtt_service.publish(
        &mqtt_service.config.log_topic,
        &payload.to_string(),
        rumqttc::QoS::AtLeastOnce,
        false,
    ) {
        debug!("Log line not published: {}", e);
    }
}

/// Publish console status with the MQTT service
pub fn publish_status(mqtt_service: &MqttService, status: &str, details: Option<&str>) {
    let payload = json!({
        "status": status,
        "details": details.unwrap_or_default(),
        "timestamp": now_rfc3339(),
    });
    if let Err(e) = mqtt_service.publish(
        &mqtt_service.config.status_topic,
        &payload.to_string(),
        rumqttc::QoS::AtLeastOnce,
        true,
    ) {
        debug!("Status '{}' not published: {}", status, e);
    }
}

/// Periodically runs an async job until cancelled or dropped.
pub struct RefreshTask {
    name: String,
    handle: JoinHandle<()>,
}

impl RefreshTask {
    pub fn spawn<F>(name: &str, interval: Duration, job: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Refreshing '{}'.", task_name);
                job().await;
            }
        });
        info!("Refresh task '{}' started ({:?}).", name, interval);
        Self {
            name: name.to_string(),
            handle,
        }
    }

    pub fn cancel(self) {
        // Drop does the work.
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.handle.abort();
        debug!("Refresh task '{}' stopped.", self.name);
    }
}

/// Start periodic status updates
pub fn periodic_status_update(mqtt_service: Arc<MqttService>, interval: Duration) -> RefreshTask {
    RefreshTask::spawn("console-status", interval, move || {
        let mqtt_service = mqtt_service.clone();
        Box::pin(async move {
            if mqtt_service.is_connected() {
                publish_status(&mqtt_service, "running", Some("Console is operational"));
            }
        })
    })
}

/// Wait for ctrl-c, then announce shutdown and close the session.
pub async fn handle_shutdown(mqtt_service: Arc<MqttService>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
        publish_status(&mqtt_service, "error", Some("Termination signal failed"));
    } else {
        info!("Console is shutting down...");
        publish_log(&mqtt_service, "INFO", "Console is shutting down");
        publish_status(&mqtt_service, "shutdown", Some("Console is shutting down"));
    }
    mqtt_service.shutdown();
}
