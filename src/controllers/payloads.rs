use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{Cache, ControllerContext};
use crate::error::{ConsoleError, ConsoleResult};
use crate::models::DataItem;
use crate::mqtt_service::SubscriptionGuard;
use crate::payload_builder::DataItemDraft;
use crate::service_utils::RefreshTask;
use crate::topics::{CommandSpec, PAYLOAD_DELETE, PAYLOAD_GET, PAYLOAD_UPDATE, PAYLOAD_WRITE};

pub struct PayloadsController {
    ctx: ControllerContext,
    items: Arc<Cache<Vec<DataItem>>>,
    refresh_task: Mutex<Option<RefreshTask>>,
    _subscriptions: Vec<SubscriptionGuard>,
}

fn item_payload(item: &DataItem) -> Value {
    serde_json::to_value(item).unwrap_or_else(|_| json!({}))
}

impl PayloadsController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let topics: Vec<&str> = [PAYLOAD_GET, PAYLOAD_WRITE, PAYLOAD_UPDATE, PAYLOAD_DELETE]
            .iter()
            .flat_map(|spec| spec.response_topics.iter().copied())
            .collect();
        let subscriptions = ctx.subscribe(&topics);
        Arc::new(Self {
            ctx,
            items: Cache::new(),
            refresh_task: Mutex::new(None),
            _subscriptions: subscriptions,
        })
    }

    pub fn items(&self) -> Vec<DataItem> {
        self.items.snapshot()
    }

    /// Re-issues `getData` every `interval` while the session is up.
    pub fn start_refresh(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = RefreshTask::spawn("payloads", interval, move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(controller) = weak.upgrade() {
                    if controller.ctx.is_connected() {
                        let _ = controller.refresh().await;
                    } else {
                        debug!("Skipping payload refresh: not connected.");
                    }
                }
            })
        });
        *self.refresh_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    pub fn stop_refresh(&self) {
        let task = self.refresh_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.cancel();
        }
    }

    async fn fetch(&self) -> ConsoleResult<Vec<DataItem>> {
        let envelope = self.ctx.client.request(&PAYLOAD_GET, "getData", json!({})).await?;
        let items: Vec<DataItem> = envelope
            .decode(&["payloads", "data"])
            .map_err(|e| ConsoleError::malformed(PAYLOAD_GET.response_topics[0], e))?;
        self.items.replace(items.clone());
        Ok(items)
    }

    pub async fn refresh(&self) -> ConsoleResult<Vec<DataItem>> {
        self.ctx.run("Load payloads", "payloads:get", self.fetch()).await
    }

    async fn mutate(&self, spec: &CommandSpec, verb: &str, payload: Value) -> ConsoleResult<()> {
        self.ctx.client.request(spec, verb, payload).await?;
        Ok(())
    }

    async fn reload(&self) -> Vec<DataItem> {
        self.ctx.reload("payloads", self.fetch(), || self.items.snapshot()).await
    }

    pub async fn write(&self, draft: DataItemDraft) -> ConsoleResult<Vec<DataItem>> {
        let key = format!("payloads:write:{}", draft.topic.trim());
        self.ctx
            .run("Save payload", &key, async {
                let item = draft.into_data_item()?;
                let exists = self.items.read(|items| items.iter().any(|i| i.topic == item.topic));
                if exists {
                    return Err(ConsoleError::Validation(format!(
                        "a payload for topic '{}' already exists",
                        item.topic
                    )));
                }
                self.mutate(&PAYLOAD_WRITE, "writeData", item_payload(&item)).await
            })
            .await?;
        self.ctx.success("Payload saved");
        Ok(self.reload().await)
    }

    pub async fn update(&self, id: &str, draft: DataItemDraft) -> ConsoleResult<Vec<DataItem>> {
        let key = format!("payloads:update:{}", id);
        self.ctx
            .run("Update payload", &key, async {
                let mut item = draft.into_data_item()?;
                item.id = self.find(id).and_then(|existing| existing.id);
                let mut payload = item_payload(&item);
                payload["id"] = item.id.as_ref().map(|v| json!(v)).unwrap_or_else(|| json!(id));
                self.mutate(&PAYLOAD_UPDATE, "updateData", payload).await
            })
            .await?;
        self.ctx.success("Payload updated");
        Ok(self.reload().await)
    }

    pub async fn delete(&self, id: &str) -> ConsoleResult<Vec<DataItem>> {
        let key = format!("payloads:delete:{}", id);
        self.ctx
            .run("Delete payload", &key, async {
                let payload = match self.find(id) {
                    Some(item) => json!({ "id": item.id, "topic": item.topic }),
                    None => json!({ "id": id }),
                };
                self.mutate(&PAYLOAD_DELETE, "deleteData", payload).await
            })
            .await?;
        self.ctx.success("Payload deleted");
        Ok(self.reload().await)
    }

    /// Looks an item up by backend id, falling back to its topic.
    fn find(&self, id: &str) -> Option<DataItem> {
        self.items.read(|items| {
            items
                .iter()
                .find(|item| item.id.as_ref().map(|v| v.to_string()).as_deref() == Some(id))
                .or_else(|| items.iter().find(|item| item.topic == id))
                .cloned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_client::testing::Harness;
    use crate::controllers::testing::context;
    use crate::models::ItemId;
    use crate::notifications::Level;

    #[tokio::test]
    async fn empty_list_is_a_valid_state() {
        let mut harness = Harness::connected();
        let controller = PayloadsController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.refresh().await })
        };
        let command = harness
            .reply("response/data/payload", json!({ "status": "success", "payloads": [] }))
            .await;
        assert_eq!(command["command"], "getData");
        assert!(task.await.unwrap().unwrap().is_empty());
        assert!(controller.items().is_empty());
    }

    #[tokio::test]
    async fn write_then_refetch() {
        let mut harness = Harness::connected();
        let controller = PayloadsController::attach(context(&harness));
        let draft: DataItemDraft = serde_json::from_value(json!({
            "topic": "static/room1",
            "fields": [
                { "key": "temp", "type": "int", "value": "21" },
                { "key": "meta", "type": "object", "value": "{\"floor\":2}" }
            ],
            "interval": 5,
            "qos": 1
        }))
        .unwrap();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.write(draft).await })
        };

        let write = harness.reply("response/data/write", json!({ "status": "success" })).await;
        assert_eq!(write["command"], "writeData");
        assert_eq!(write["topic"], "static/room1");
        assert_eq!(write["data"]["temp"], 21);
        assert_eq!(write["data"]["meta"]["floor"], 2);

        let get = harness
            .reply(
                "response/data/payload",
                json!({ "payloads": [{ "id": 3, "topic": "static/room1", "data": { "temp": 21 }, "interval": 5, "qos": 1 }] }),
            )
            .await;
        assert_eq!(get["command"], "getData");

        let items = task.await.unwrap().unwrap();
        assert_eq!(items[0].id, Some(ItemId::Number(3)));
    }

    #[tokio::test]
    async fn failed_reload_keeps_the_write_successful() {
        let mut harness = Harness::connected();
        let controller = PayloadsController::attach(context(&harness));
        let draft: DataItemDraft = serde_json::from_value(json!({
            "topic": "static/room2",
            "fields": [{ "key": "temp", "type": "int", "value": "19" }]
        }))
        .unwrap();

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.write(draft).await })
        };
        harness.reply("response/data/write", json!({ "status": "success" })).await;
        let (_, get) = harness.next_publish().await;
        assert_eq!(get["command"], "getData");

        // The re-read times out; the write itself still succeeded.
        assert!(task.await.unwrap().unwrap().is_empty());
        let notes = harness.notifier.recent(10);
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].level, Level::Warning);
        assert_eq!(notes[1].level, Level::Success);
        assert_eq!(notes[1].message, "Payload saved");
    }

    #[tokio::test]
    async fn invalid_fields_are_rejected_before_publish() {
        let mut harness = Harness::connected();
        let controller = PayloadsController::attach(context(&harness));
        let draft: DataItemDraft = serde_json::from_value(json!({
            "topic": "static/room1",
            "fields": [
                { "key": "temp", "type": "int", "value": "abc" }
            ]
        }))
        .unwrap();
        assert!(matches!(controller.write(draft).await, Err(ConsoleError::Validation(_))));
        assert!(harness.published_nothing());
    }

    #[tokio::test]
    async fn delete_sends_known_topic() {
        let mut harness = Harness::connected();
        let controller = PayloadsController::attach(context(&harness));
        controller.items.replace(vec![serde_json::from_value(json!({ "id": 9, "topic": "static/a" })).unwrap()]);

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.delete("9").await })
        };
        let delete = harness.reply("response/data/delete", json!({ "status": "success" })).await;
        assert_eq!(delete["id"], 9);
        assert_eq!(delete["topic"], "static/a");
        harness.reply("response/data/payload", json!({ "payloads": [] })).await;
        assert!(task.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn refresh_task_polls_while_attached() {
        let mut harness = Harness::connected();
        let controller = PayloadsController::attach(context(&harness));
        controller.start_refresh(Duration::from_millis(50));

        let (topic, command) = harness.next_publish().await;
        assert_eq!(topic, "command/data/payload");
        assert_eq!(command["command"], "getData");
        controller.stop_refresh();
    }
}
