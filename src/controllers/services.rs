use serde_json::{json, Value};
use std::sync::Arc;

use super::ControllerContext;
use crate::error::{ConsoleError, ConsoleResult};
use crate::mqtt_service::SubscriptionGuard;
use crate::topics::SERVICES;

pub struct ServicesController {
    ctx: ControllerContext,
    _subscriptions: Vec<SubscriptionGuard>,
}

impl ServicesController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let subscriptions = ctx.subscribe(SERVICES.response_topics);
        Arc::new(Self {
            ctx,
            _subscriptions: subscriptions,
        })
    }

    /// Restarts the named gateway services. Names are trimmed and
    /// deduplicated in order.
    pub async fn restart(&self, services: &[String]) -> ConsoleResult<Value> {
        let mut names: Vec<&str> = Vec::new();
        for name in services.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        let key = format!("services:restart:{}", names.join(","));
        let reply = self
            .ctx
            .run("Restart services", &key, async {
                if names.is_empty() {
                    return Err(ConsoleError::Validation("no services selected".to_string()));
                }
                let envelope = self
                    .ctx
                    .client
                    .request(&SERVICES, "restart", json!({ "services": names }))
                    .await?;
                Ok(Value::Object(envelope.body))
            })
            .await?;
        self.ctx.success(format!("Restarted {}", names.join(", ")));
        Ok(reply)
    }
}
