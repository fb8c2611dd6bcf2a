//! Command/response round trips over the shared session.
//!
//! A command is published as `{ <verb_key>: verb, ...payload, request_id,
//! timestamp }`. A reply resolves the request whose `request_id` it echoes.
//! A reply without `request_id` resolves the oldest request still waiting
//! on that topic with the verb the reply names in `action`/`command`, or
//! the oldest one outright when it names none. A reply naming a request
//! that is no longer waiting is stale and goes nowhere.

use rumqttc::QoS;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConsoleError, ConsoleResult};
use crate::mqtt_service::MqttService;
use crate::router::{InboundMessage, ResponseEnvelope};
use crate::service_utils::now_rfc3339;
use crate::topics::{CommandSpec, TimeoutClass};

type Slot = Arc<Mutex<Option<oneshot::Sender<ResponseEnvelope>>>>;

struct PendingEntry {
    request_id: String,
    verb: String,
    slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    Stale,
    Unclaimed,
}

/// Requests waiting for a reply, queued per response topic in send order.
#[derive(Default)]
pub struct PendingRequests {
    by_topic: Mutex<HashMap<String, VecDeque<PendingEntry>>>,
}

impl PendingRequests {
    fn register(
        self: &Arc<Self>,
        request_id: &str,
        verb: &str,
        topics: &[&str],
        sender: oneshot::Sender<ResponseEnvelope>,
    ) -> PendingGuard {
        let slot: Slot = Arc::new(Mutex::new(Some(sender)));
        let mut by_topic = self.by_topic.lock().unwrap_or_else(PoisonError::into_inner);
        for topic in topics {
            by_topic
                .entry(topic.to_string())
                .or_default()
                .push_back(PendingEntry {
                    request_id: request_id.to_string(),
                    verb: verb.to_string(),
                    slot: slot.clone(),
                });
        }
        PendingGuard {
            request_id: request_id.to_string(),
            pending: self.clone(),
        }
    }

    fn forget(&self, request_id: &str) {
        let mut by_topic = self.by_topic.lock().unwrap_or_else(PoisonError::into_inner);
        for queue in by_topic.values_mut() {
            queue.retain(|entry| entry.request_id != request_id);
        }
        by_topic.retain(|_, queue| !queue.is_empty());
    }

    pub fn resolve(&self, message: &InboundMessage) -> Resolution {
        let entry = {
            let mut by_topic = self.by_topic.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(queue) = by_topic.get_mut(&message.topic) else {
                return Resolution::Unclaimed;
            };
            let envelope = &message.envelope;
            let index = match (&envelope.request_id, &envelope.action) {
                (Some(id), _) => match queue.iter().position(|entry| &entry.request_id == id) {
                    Some(index) => index,
                    None => return Resolution::Stale,
                },
                (None, Some(verb)) => match queue.iter().position(|entry| &entry.verb == verb) {
                    Some(index) => index,
                    None => return Resolution::Unclaimed,
                },
                (None, None) => 0,
            };
            let Some(entry) = queue.remove(index) else {
                return Resolution::Unclaimed;
            };
            for queue in by_topic.values_mut() {
                queue.retain(|other| other.request_id != entry.request_id);
            }
            by_topic.retain(|_, queue| !queue.is_empty());
            entry
        };

        let sender = entry
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender.map(|sender| sender.send(message.envelope.clone())) {
            Some(Ok(())) => Resolution::Delivered,
            _ => Resolution::Stale,
        }
    }

    pub fn pending_count(&self) -> usize {
        let by_topic = self.by_topic.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<&str> = by_topic
            .values()
            .flat_map(|queue| queue.iter().map(|entry| entry.request_id.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Withdraws a request when its caller stops waiting.
struct PendingGuard {
    request_id: String,
    pending: Arc<PendingRequests>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.forget(&self.request_id);
    }
}

/// Serializes one command message.
pub fn build_command(verb_key: &str, verb: &str, payload: Value, request_id: &str) -> String {
    let mut message = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    message.insert(verb_key.to_string(), Value::String(verb.to_string()));
    message.insert("request_id".to_string(), Value::String(request_id.to_string()));
    message.insert("timestamp".to_string(), Value::String(now_rfc3339()));
    Value::Object(message).to_string()
}

pub struct CommandClient {
    mqtt: Arc<MqttService>,
    pending: Arc<PendingRequests>,
    short_timeout: Duration,
    long_timeout: Duration,
}

impl CommandClient {
    pub fn new(mqtt: Arc<MqttService>, pending: Arc<PendingRequests>, config: &Config) -> Arc<Self> {
        Arc::new(Self {
            mqtt,
            pending,
            short_timeout: config.command_timeout(),
            long_timeout: config.long_command_timeout(),
        })
    }

    pub fn mqtt(&self) -> &Arc<MqttService> {
        &self.mqtt
    }

    pub fn timeout_for(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Short => self.short_timeout,
            TimeoutClass::Long => self.long_timeout,
        }
    }

    /// Publishes `verb` on `spec` and waits for the correlated reply.
    pub async fn request(&self, spec: &CommandSpec, verb: &str, payload: Value) -> ConsoleResult<ResponseEnvelope> {
        if !self.mqtt.is_connected() {
            return Err(ConsoleError::NotConnected);
        }

        let request_id = Uuid::new_v4().to_string();
        let message = build_command(spec.verb_key, verb, payload, &request_id);

        let (sender, receiver) = oneshot::channel();
        let _guard = self.pending.register(&request_id, verb, spec.response_topics, sender);

        self.mqtt
            .publish(spec.request_topic, &message, QoS::AtLeastOnce, false)?;
        debug!("Sent '{}' to '{}' (request_id {})", verb, spec.request_topic, request_id);

        let after = self.timeout_for(spec.timeout);
        let envelope = match tokio::time::timeout(after, receiver).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(_)) => return Err(ConsoleError::ChannelClosed),
            Err(_) => {
                warn!("No reply to '{}' on '{}' within {:?}", verb, spec.request_topic, after);
                return Err(ConsoleError::Timeout {
                    topic: spec.response_topics.first().copied().unwrap_or(spec.request_topic).to_string(),
                    after,
                });
            }
        };

        if envelope.is_error() {
            return Err(ConsoleError::Backend(envelope.error_message()));
        }
        Ok(envelope)
    }

    /// Publishes without waiting for a reply. Returns the request id.
    pub fn fire(&self, spec: &CommandSpec, verb: &str, payload: Value) -> ConsoleResult<String> {
        if !self.mqtt.is_connected() {
            return Err(ConsoleError::NotConnected);
        }
        let request_id = Uuid::new_v4().to_string();
        let message = build_command(spec.verb_key, verb, payload, &request_id);
        self.mqtt
            .publish(spec.request_topic, &message, QoS::AtLeastOnce, false)?;
        Ok(request_id)
    }
}
