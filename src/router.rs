//! Inbound message routing.
//!
//! Every publish received on the shared session passes through
//! [`MessageRouter::dispatch`]. The payload is parsed once into a
//! [`ResponseEnvelope`], offered to the pending-request tracker, and then
//! handed to every handler whose topic filter matches.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

use crate::command_client::{PendingRequests, Resolution};
use crate::notifications::{Level, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Common view over every reply shape the middleware publishes.
///
/// Known keys are lifted out; everything else stays in `body`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    pub message: Option<String>,
    pub request_id: Option<String>,
    pub action: Option<String>,
    pub body: Map<String, Value>,
}

impl ResponseEnvelope {
    pub fn from_value(value: Value) -> Self {
        let mut body = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };

        let status_field = body.remove("status");
        let success_field = body.remove("success");
        let status = match (status_field.as_ref().and_then(Value::as_str), success_field.as_ref()) {
            (Some(s), _) if is_error_status(s) => ResponseStatus::Error,
            (Some(_), _) => ResponseStatus::Success,
            (None, Some(Value::Bool(false))) => ResponseStatus::Error,
            _ => ResponseStatus::Success,
        };

        let message = body.remove("message").and_then(|m| match m {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        });
        let request_id = body.remove("request_id").and_then(|id| match id {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        let action = ["action", "command"]
            .iter()
            .find_map(|key| body.remove(*key))
            .and_then(|v| v.as_str().map(str::to_string));

        Self {
            status,
            message,
            request_id,
            action,
            body,
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ResponseStatus::Error
    }

    /// First present field among `keys`.
    pub fn field(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter().find_map(|key| self.body.get(*key))
    }

    /// Decodes the first present field among `keys`. Absent and `null`
    /// fields decode as `T::default()`.
    pub fn decode<T>(&self, keys: &[&str]) -> Result<T, String>
    where
        T: DeserializeOwned + Default,
    {
        match self.field(keys) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        }
    }

    pub fn error_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.field(&["error"]).and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| "Backend reported an error".to_string())
    }
}

fn is_error_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "error" | "failed" | "failure" | "fail"
    )
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub envelope: ResponseEnvelope,
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Malformed,
    Routed { resolved: bool, handlers: usize },
}

type Handler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

struct Route {
    id: u64,
    filter: String,
    handler: Handler,
}

pub struct MessageRouter {
    routes: Mutex<Vec<Route>>,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    notifier: Arc<Notifier>,
}

impl MessageRouter {
    pub fn new(pending: Arc<PendingRequests>, notifier: Arc<Notifier>) -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            pending,
            notifier,
        })
    }

    /// Registers `handler` for every topic matching `filter` until the
    /// returned guard is dropped.
    pub fn register<F>(self: &Arc<Self>, filter: &str, handler: F) -> HandlerGuard
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                id,
                filter: filter.to_string(),
                handler: Arc::new(handler),
            });
        HandlerGuard {
            id,
            router: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: u64) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|route| route.id != id);
    }

    #[cfg(test)]
    pub fn handler_count(&self) -> usize {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping malformed message on '{}': {}", topic, e);
                self.notifier
                    .notify(Level::Error, format!("Received an invalid message on {}", topic));
                return DispatchOutcome::Malformed;
            }
        };

        let message = InboundMessage {
            topic: topic.to_string(),
            envelope: ResponseEnvelope::from_value(value),
        };

        let resolved = match self.pending.resolve(&message) {
            Resolution::Delivered => true,
            Resolution::Stale => {
                debug!(
                    "Ignoring stale {:?} response on '{}' (request_id {:?})",
                    message.envelope.action, topic, message.envelope.request_id
                );
                false
            }
            Resolution::Unclaimed => false,
        };

        // Handlers run outside the lock so they may register or drop routes.
        let handlers: Vec<Handler> = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|route| topic_matches(&route.filter, topic))
            .map(|route| route.handler.clone())
            .collect();

        for handler in &handlers {
            handler(&message);
        }

        DispatchOutcome::Routed {
            resolved,
            handlers: handlers.len(),
        }
    }
}

/// Removes its handler from the router when dropped.
pub struct HandlerGuard {
    id: u64,
    router: Weak<MessageRouter>,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(router) = self.router.upgrade() {
            router.unregister(self.id);
        }
    }
}
