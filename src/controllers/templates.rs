use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{Cache, ControllerContext};
use crate::error::{ConsoleError, ConsoleResult};
use crate::models::BrokerTemplate;
use crate::mqtt_service::SubscriptionGuard;
use crate::notifications::Level;
use crate::router::{HandlerGuard, InboundMessage, ResponseEnvelope};
use crate::topics::{TEMPLATES, TEMPLATE_CREATED, TEMPLATE_DELETED, TEMPLATE_UPDATED};

pub struct TemplatesController {
    ctx: ControllerContext,
    templates: Arc<Cache<Vec<BrokerTemplate>>>,
    _subscriptions: Vec<SubscriptionGuard>,
    _handlers: Vec<HandlerGuard>,
}

fn upsert(templates: &mut Vec<BrokerTemplate>, template: BrokerTemplate) {
    match templates.iter_mut().find(|t| t.template_id == template.template_id) {
        Some(existing) => *existing = template,
        None => templates.push(template),
    }
}

/// Broadcasts carry the template either under `template` or at top level.
fn broadcast_template(message: &InboundMessage) -> Result<BrokerTemplate, String> {
    match message.envelope.field(&["template", "data"]) {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| e.to_string()),
        None => serde_json::from_value(Value::Object(message.envelope.body.clone())).map_err(|e| e.to_string()),
    }
}

impl TemplatesController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let templates: Arc<Cache<Vec<BrokerTemplate>>> = Cache::new();

        let mut topics: Vec<&str> = TEMPLATES.response_topics.to_vec();
        topics.extend([TEMPLATE_CREATED, TEMPLATE_UPDATED, TEMPLATE_DELETED]);
        let subscriptions = ctx.subscribe(&topics);

        let mut handlers = Vec::new();
        for topic in [TEMPLATE_CREATED, TEMPLATE_UPDATED] {
            let cache = templates.clone();
            let notifier = ctx.notifier.clone();
            handlers.push(ctx.router.register(topic, move |message| match broadcast_template(message) {
                Ok(template) => {
                    info!("Template '{}' changed on '{}'.", template.template_id, message.topic);
                    cache.update(|list| upsert(list, template));
                }
                Err(e) => {
                    warn!("Unexpected template broadcast on '{}': {}", message.topic, e);
                    notifier.notify(Level::Error, format!("Received an invalid template update on {}", message.topic));
                }
            }));
        }

        let cache = templates.clone();
        let notifier = ctx.notifier.clone();
        handlers.push(ctx.router.register(TEMPLATE_DELETED, move |message| {
            let template_id = message
                .envelope
                .field(&["template_id", "id"])
                .and_then(Value::as_str)
                .map(str::to_string);
            match template_id {
                Some(template_id) => {
                    info!("Template '{}' deleted.", template_id);
                    cache.update(|list| list.retain(|t| t.template_id != template_id));
                }
                None => {
                    warn!("Template delete broadcast without template_id.");
                    notifier.notify(Level::Error, "Received an invalid template delete notification");
                }
            }
        }));

        Arc::new(Self {
            ctx,
            templates,
            _subscriptions: subscriptions,
            _handlers: handlers,
        })
    }

    pub fn templates(&self) -> Vec<BrokerTemplate> {
        self.templates.snapshot()
    }

    /// Applies a mutation reply: a full list replaces the cache, a single
    /// template is upserted.
    fn apply_reply(&self, envelope: &ResponseEnvelope, fallback: BrokerTemplate) -> ConsoleResult<BrokerTemplate> {
        if envelope.field(&["templates"]).is_some() {
            let list: Vec<BrokerTemplate> = envelope
                .decode(&["templates"])
                .map_err(|e| ConsoleError::malformed(TEMPLATES.response_topics[0], e))?;
            self.templates.replace(list);
            return Ok(fallback);
        }
        let template = match envelope.field(&["template"]) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ConsoleError::malformed(TEMPLATES.response_topics[0], e))?,
            None => fallback,
        };
        self.templates.update(|list| upsert(list, template.clone()));
        Ok(template)
    }

    pub async fn refresh(&self) -> ConsoleResult<Vec<BrokerTemplate>> {
        self.ctx
            .run("Load broker templates", "templates:get_all", async {
                let envelope = self.ctx.client.request(&TEMPLATES, "get_all", json!({})).await?;
                let list: Vec<BrokerTemplate> = envelope
                    .decode(&["templates", "data"])
                    .map_err(|e| ConsoleError::malformed(TEMPLATES.response_topics[0], e))?;
                self.templates.replace(list.clone());
                Ok(list)
            })
            .await
    }

    pub async fn create(&self, template: BrokerTemplate) -> ConsoleResult<BrokerTemplate> {
        let key = format!("templates:create:{}", template.template_id);
        let result = self
            .ctx
            .run("Create broker template", &key, async {
                template.validate()?;
                let exists = self
                    .templates
                    .read(|list| list.iter().any(|t| t.template_id == template.template_id));
                if exists {
                    return Err(ConsoleError::Validation(format!(
                        "template '{}' already exists",
                        template.template_id
                    )));
                }
                let envelope = self
                    .ctx
                    .client
                    .request(&TEMPLATES, "create", json!({ "template": template }))
                    .await?;
                self.apply_reply(&envelope, template.clone())
            })
            .await?;
        self.ctx.success(format!("Template '{}' created", result.name));
        Ok(result)
    }

    pub async fn update(&self, template: BrokerTemplate) -> ConsoleResult<BrokerTemplate> {
        let key = format!("templates:update:{}", template.template_id);
        let result = self
            .ctx
            .run("Update broker template", &key, async {
                template.validate()?;
                let envelope = self
                    .ctx
                    .client
                    .request(
                        &TEMPLATES,
                        "update",
                        json!({ "template_id": template.template_id, "template": template }),
                    )
                    .await?;
                self.apply_reply(&envelope, template.clone())
            })
            .await?;
        self.ctx.success(format!("Template '{}' updated", result.name));
        Ok(result)
    }

    pub async fn delete(&self, template_id: &str) -> ConsoleResult<()> {
        let key = format!("templates:delete:{}", template_id);
        self.ctx
            .run("Delete broker template", &key, async {
                if template_id.trim().is_empty() {
                    return Err(ConsoleError::Validation("template_id must not be empty".to_string()));
                }
                let envelope = self
                    .ctx
                    .client
                    .request(&TEMPLATES, "delete", json!({ "template_id": template_id }))
                    .await?;
                if envelope.field(&["templates"]).is_some() {
                    let list: Vec<BrokerTemplate> = envelope
                        .decode(&["templates"])
                        .map_err(|e| ConsoleError::malformed(TEMPLATES.response_topics[0], e))?;
                    self.templates.replace(list);
                } else {
                    self.templates.update(|list| list.retain(|t| t.template_id != template_id));
                }
                Ok(())
            })
            .await?;
        self.ctx.success(format!("Template '{}' deleted", template_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_client::testing::Harness;
    use crate::controllers::testing::context;

    fn template(id: &str) -> BrokerTemplate {
        serde_json::from_value(json!({
            "template_id": id,
            "name": format!("Broker {}", id),
            "category": "production",
            "config": { "host": "broker.local", "port": 1883 }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn get_all_replaces_the_cache() {
        let mut harness = Harness::connected();
        let controller = TemplatesController::attach(context(&harness));
        controller.templates.replace(vec![template("stale")]);

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.refresh().await })
        };
        let command = harness
            .reply(
                "broker-templates/response",
                json!({ "status": "success", "templates": [template("a"), template("b")] }),
            )
            .await;

        assert_eq!(command["action"], "get_all");
        assert_eq!(task.await.unwrap().unwrap().len(), 2);
        let ids: Vec<String> = controller.templates().into_iter().map(|t| t.template_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn double_save_is_rejected_while_first_is_sending() {
        let mut harness = Harness::connected();
        let controller = TemplatesController::attach(context(&harness));

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.create(template("t1")).await })
        };
        let (_, command) = harness.next_publish().await;
        assert_eq!(command["action"], "create");

        let second = controller.create(template("t1")).await;
        assert!(matches!(second, Err(ConsoleError::InFlight(_))));
        assert!(harness.published_nothing());

        harness.router.dispatch(
            "broker-templates/response",
            json!({ "request_id": command["request_id"], "status": "success" })
                .to_string()
                .as_bytes(),
        );
        first.await.unwrap().unwrap();
        assert_eq!(controller.templates().len(), 1);

        // Once saved, the same id is a duplicate.
        assert!(matches!(
            controller.create(template("t1")).await,
            Err(ConsoleError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn failed_create_leaves_cache_unchanged() {
        let mut harness = Harness::connected();
        let controller = TemplatesController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.create(template("t2")).await })
        };
        harness
            .reply("broker-templates/error", json!({ "status": "error", "message": "Broker unreachable" }))
            .await;

        assert!(matches!(task.await.unwrap(), Err(ConsoleError::Backend(_))));
        assert!(controller.templates().is_empty());
        assert_eq!(harness.notifier.recent(1)[0].message, "Broker unreachable");
    }

    #[tokio::test]
    async fn broadcasts_update_the_cache_until_detached() {
        let harness = Harness::connected();
        let controller = TemplatesController::attach(context(&harness));

        harness
            .router
            .dispatch(TEMPLATE_CREATED, json!({ "template": template("x") }).to_string().as_bytes());
        harness
            .router
            .dispatch(TEMPLATE_CREATED, serde_json::to_string(&template("y")).unwrap().as_bytes());
        assert_eq!(controller.templates().len(), 2);

        harness
            .router
            .dispatch(TEMPLATE_DELETED, json!({ "template_id": "x" }).to_string().as_bytes());
        assert_eq!(controller.templates().len(), 1);

        let cache = controller.templates.clone();
        drop(controller);
        assert_eq!(harness.mqtt.subscription_count(TEMPLATE_CREATED), 0);
        harness
            .router
            .dispatch(TEMPLATE_CREATED, json!({ "template": template("z") }).to_string().as_bytes());
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn invalid_template_never_reaches_the_wire() {
        let mut harness = Harness::connected();
        let controller = TemplatesController::attach(context(&harness));
        let mut bad = template("t3");
        bad.config.port = 0;
        assert!(matches!(controller.create(bad).await, Err(ConsoleError::Validation(_))));
        assert!(harness.published_nothing());
    }
}
