use serde_json::{json, Value};
use std::sync::Arc;

use super::{Cache, ControllerContext};
use crate::error::{ConsoleError, ConsoleResult};
use crate::models::{Location, NodeConfig};
use crate::mqtt_service::SubscriptionGuard;
use crate::router::ResponseEnvelope;
use crate::topics::NODE_INFO;

pub struct NodeInfoController {
    ctx: ControllerContext,
    config: Arc<Cache<Option<NodeConfig>>>,
    _subscriptions: Vec<SubscriptionGuard>,
}

impl NodeInfoController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let subscriptions = ctx.subscribe(NODE_INFO.response_topics);
        Arc::new(Self {
            ctx,
            config: Cache::new(),
            _subscriptions: subscriptions,
        })
    }

    pub fn config(&self) -> Option<NodeConfig> {
        self.config.snapshot()
    }

    fn decode(envelope: &ResponseEnvelope) -> ConsoleResult<Option<NodeConfig>> {
        match envelope.field(&["config", "data"]) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| ConsoleError::malformed(NODE_INFO.response_topics[0], e)),
        }
    }

    async fn fetch(&self) -> ConsoleResult<NodeConfig> {
        let envelope = self.ctx.client.request(&NODE_INFO, "get_config", json!({})).await?;
        let config = Self::decode(&envelope)?
            .ok_or_else(|| ConsoleError::malformed(NODE_INFO.response_topics[0], "reply carries no config"))?;
        self.config.replace(Some(config.clone()));
        Ok(config)
    }

    pub async fn refresh(&self) -> ConsoleResult<NodeConfig> {
        self.ctx.run("Load node configuration", "node:get_config", self.fetch()).await
    }

    async fn change(&self, label: &str, verb: &str, payload: Value) -> ConsoleResult<NodeConfig> {
        let key = format!("node:{}", verb);
        let replied = self
            .ctx
            .run(label, &key, async {
                let envelope = self.ctx.client.request(&NODE_INFO, verb, payload).await?;
                Self::decode(&envelope)
            })
            .await?;
        self.ctx.success(format!("{} succeeded", label));
        match replied {
            Some(config) => {
                self.config.replace(Some(config.clone()));
                Ok(config)
            }
            None => Ok(self
                .ctx
                .reload("node configuration", self.fetch(), || self.config().unwrap_or_default())
                .await),
        }
    }

    fn reject<T>(&self, label: &str, err: ConsoleError) -> ConsoleResult<T> {
        self.ctx.notifier.report_failure(label, &err);
        Err(err)
    }

    pub async fn update_node_name(&self, node_name: &str) -> ConsoleResult<NodeConfig> {
        let node_name = node_name.trim();
        if node_name.is_empty() {
            return self.reject(
                "Update node name",
                ConsoleError::Validation("node name must not be empty".to_string()),
            );
        }
        self.change("Update node name", "update_node_name", json!({ "node_name": node_name }))
            .await
    }

    pub async fn update_base_topic(&self, base_topic: &str) -> ConsoleResult<NodeConfig> {
        let base_topic = base_topic.trim().trim_end_matches('/');
        if base_topic.is_empty() || base_topic.contains('+') || base_topic.contains('#') {
            return self.reject(
                "Update base topic",
                ConsoleError::Validation(format!("'{}' is not a valid base topic", base_topic)),
            );
        }
        self.change("Update base topic", "update_base_topic", json!({ "base_topic": base_topic }))
            .await
    }

    pub async fn set_manual_location(&self, location: Location) -> ConsoleResult<NodeConfig> {
        if let Err(e) = location.validate() {
            return self.reject("Set location", e);
        }
        self.change(
            "Set location",
            "set_manual_location",
            json!({ "latitude": location.latitude, "longitude": location.longitude }),
        )
        .await
    }
}
