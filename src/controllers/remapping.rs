use serde_json::json;
use std::sync::Arc;

use super::device_library::DeviceLibraryController;
use super::{Cache, ControllerContext};
use crate::error::{ConsoleError, ConsoleResult};
use crate::models::RemappingConfig;
use crate::mqtt_service::SubscriptionGuard;
use crate::router::ResponseEnvelope;
use crate::topics::REMAP;

pub struct RemappingController {
    ctx: ControllerContext,
    configs: Arc<Cache<Vec<RemappingConfig>>>,
    library: Arc<DeviceLibraryController>,
    _subscriptions: Vec<SubscriptionGuard>,
}

impl RemappingController {
    pub fn attach(ctx: ControllerContext, library: Arc<DeviceLibraryController>) -> Arc<Self> {
        let subscriptions = ctx.subscribe(REMAP.response_topics);
        Arc::new(Self {
            ctx,
            configs: Cache::new(),
            library,
            _subscriptions: subscriptions,
        })
    }

    /// Cached configs with `available_keys` recomputed from the device
    /// library.
    pub fn configs(&self) -> Vec<RemappingConfig> {
        let mut configs = self.configs.snapshot();
        for device in configs.iter_mut().flat_map(|c| c.source_devices.iter_mut()) {
            device.available_keys = device
                .part_number
                .as_deref()
                .and_then(|part| self.library.variable_names_for_part(part))
                .unwrap_or_default();
        }
        configs
    }

    fn apply(&self, envelope: &ResponseEnvelope, keys: &[&str]) -> ConsoleResult<Option<Vec<RemappingConfig>>> {
        if envelope.field(keys).is_none() {
            return Ok(None);
        }
        let configs: Vec<RemappingConfig> = envelope
            .decode(keys)
            .map_err(|e| ConsoleError::malformed(REMAP.response_topics[0], e))?;
        self.configs.replace(configs);
        Ok(Some(self.configs()))
    }

    async fn fetch(&self) -> ConsoleResult<Vec<RemappingConfig>> {
        let envelope = self.ctx.client.request(&REMAP, "get", json!({})).await?;
        Ok(self.apply(&envelope, &["configs", "data"])?.unwrap_or_else(|| {
            self.configs.replace(Vec::new());
            Vec::new()
        }))
    }

    pub async fn refresh(&self) -> ConsoleResult<Vec<RemappingConfig>> {
        self.ctx.run("Load remapping configs", "remap:get", self.fetch()).await
    }

    /// Sends one change. Yields the new list when the reply carries it.
    async fn mutate(&self, verb: &str, payload: serde_json::Value) -> ConsoleResult<Option<Vec<RemappingConfig>>> {
        let envelope = self.ctx.client.request(&REMAP, verb, payload).await?;
        self.apply(&envelope, &["configs"])
    }

    async fn settle(&self, applied: Option<Vec<RemappingConfig>>) -> Vec<RemappingConfig> {
        match applied {
            Some(configs) => configs,
            None => {
                self.ctx
                    .reload("remapping configs", self.fetch(), || self.configs())
                    .await
            }
        }
    }

    pub async fn add(&self, config: RemappingConfig) -> ConsoleResult<Vec<RemappingConfig>> {
        let key = format!("remap:add:{}", config.id);
        let applied = self
            .ctx
            .run("Add remapping config", &key, async {
                config.validate()?;
                if self.configs.read(|list| list.iter().any(|c| c.id == config.id)) {
                    return Err(ConsoleError::Validation(format!(
                        "remapping config '{}' already exists",
                        config.id
                    )));
                }
                self.mutate("add", json!({ "config": config.to_command_value() })).await
            })
            .await?;
        self.ctx.success(format!("Remapping config '{}' added", config.id));
        Ok(self.settle(applied).await)
    }

    pub async fn set(&self, config: RemappingConfig) -> ConsoleResult<Vec<RemappingConfig>> {
        let key = format!("remap:set:{}", config.id);
        let applied = self
            .ctx
            .run("Update remapping config", &key, async {
                config.validate()?;
                self.mutate("set", json!({ "id": config.id, "config": config.to_command_value() }))
                    .await
            })
            .await?;
        self.ctx.success(format!("Remapping config '{}' updated", config.id));
        Ok(self.settle(applied).await)
    }

    pub async fn delete(&self, id: &str) -> ConsoleResult<Vec<RemappingConfig>> {
        let key = format!("remap:delete:{}", id);
        let applied = self
            .ctx
            .run("Delete remapping config", &key, self.mutate("delete", json!({ "id": id })))
            .await?;
        self.ctx.success(format!("Remapping config '{}' deleted", id));
        Ok(self.settle(applied).await)
    }
}
