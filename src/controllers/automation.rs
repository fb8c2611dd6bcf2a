//! Visual automation flows.
//!
//! Flows are trigger → logic → action graphs assembled in an editor and
//! stored and interpreted by the middleware. Only structural checks happen
//! here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

use super::{Cache, ControllerContext};
use crate::error::{ConsoleError, ConsoleResult};
use crate::mqtt_service::SubscriptionGuard;
use crate::topics::AUTOMATION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Trigger,
    Logic,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
    /// Editor node type, e.g. `modbus-read` or `threshold`.
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlowGraph {
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
    #[serde(default)]
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    /// Unique node ids; every edge joins two existing nodes.
    pub fn validate(&self) -> ConsoleResult<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ConsoleError::Validation("flow node id must not be empty".to_string()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ConsoleError::Validation(format!("flow node '{}' is defined twice", node.id)));
            }
        }
        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !ids.contains(end.as_str()) {
                    return Err(ConsoleError::Validation(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, end
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub flow_id: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub graph: FlowGraph,
}

pub struct AutomationController {
    ctx: ControllerContext,
    flows: Arc<Cache<Vec<FlowDefinition>>>,
    _subscriptions: Vec<SubscriptionGuard>,
}

impl AutomationController {
    pub fn attach(ctx: ControllerContext) -> Arc<Self> {
        let subscriptions = ctx.subscribe(AUTOMATION.response_topics);
        Arc::new(Self {
            ctx,
            flows: Cache::new(),
            _subscriptions: subscriptions,
        })
    }

    pub fn flows(&self) -> Vec<FlowDefinition> {
        self.flows.snapshot()
    }

    async fn fetch(&self) -> ConsoleResult<Vec<FlowDefinition>> {
        let envelope = self.ctx.client.request(&AUTOMATION, "get_flows", json!({})).await?;
        let flows: Vec<FlowDefinition> = envelope
            .decode(&["flows", "data"])
            .map_err(|e| ConsoleError::malformed(AUTOMATION.response_topics[0], e))?;
        self.flows.replace(flows.clone());
        Ok(flows)
    }

    pub async fn refresh(&self) -> ConsoleResult<Vec<FlowDefinition>> {
        self.ctx.run("Load automation flows", "automation:get_flows", self.fetch()).await
    }

    async fn reload(&self) -> Vec<FlowDefinition> {
        self.ctx.reload("automation flows", self.fetch(), || self.flows()).await
    }

    pub async fn save_flow(&self, flow: FlowDefinition) -> ConsoleResult<Vec<FlowDefinition>> {
        let key = format!("automation:save:{}", flow.flow_id);
        self.ctx
            .run("Save flow", &key, async {
                if flow.flow_id.trim().is_empty() || flow.name.trim().is_empty() {
                    return Err(ConsoleError::Validation("flows need an id and a name".to_string()));
                }
                flow.graph.validate()?;
                self.ctx
                    .client
                    .request(
                        &AUTOMATION,
                        "save_flow",
                        json!({
                            "flow_id": flow.flow_id,
                            "name": flow.name,
                            "enabled": flow.enabled,
                            "nodes": flow.graph.nodes,
                            "edges": flow.graph.edges,
                        }),
                    )
                    .await
            })
            .await?;
        self.ctx.success(format!("Flow '{}' saved", flow.name));
        Ok(self.reload().await)
    }

    pub async fn delete_flow(&self, flow_id: &str) -> ConsoleResult<Vec<FlowDefinition>> {
        let key = format!("automation:delete:{}", flow_id);
        self.ctx
            .run(
                "Delete flow",
                &key,
                self.ctx
                    .client
                    .request(&AUTOMATION, "delete_flow", json!({ "flow_id": flow_id })),
            )
            .await?;
        self.ctx.success(format!("Flow '{}' deleted", flow_id));
        Ok(self.reload().await)
    }

    /// Asks the middleware to run a flow now. No reply is awaited.
    pub fn execute(&self, flow_id: &str) -> ConsoleResult<String> {
        let result = self
            .ctx
            .client
            .fire(&AUTOMATION, "execute", json!({ "flow_id": flow_id }));
        match &result {
            Ok(_) => self.ctx.success(format!("Flow '{}' started", flow_id)),
            Err(e) => self.ctx.notifier.report_failure("Execute flow", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_client::testing::Harness;
    use crate::controllers::testing::context;

    fn flow() -> FlowDefinition {
        serde_json::from_value(json!({
            "flow_id": "f1",
            "name": "Overheat alarm",
            "graph": {
                "nodes": [
                    { "id": "n1", "kind": "trigger", "type": "modbus-read", "position": { "x": 0, "y": 0 } },
                    { "id": "n2", "kind": "logic", "type": "threshold", "data": { "gt": 80 } },
                    { "id": "n3", "kind": "action", "type": "mqtt-publish" }
                ],
                "edges": [
                    { "id": "e1", "source": "n1", "target": "n2" },
                    { "id": "e2", "source": "n2", "target": "n3", "sourceHandle": "true" }
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn dangling_edges_are_rejected() {
        let mut flow = flow();
        assert!(flow.graph.validate().is_ok());
        flow.graph.edges[1].target = "n9".to_string();
        assert!(flow.graph.validate().is_err());
    }

    #[test]
    fn cycles_are_left_to_the_backend() {
        let mut flow = flow();
        flow.graph.edges.push(FlowEdge {
            id: "e3".into(),
            source: "n3".into(),
            target: "n1".into(),
            source_handle: None,
            target_handle: None,
        });
        assert!(flow.graph.validate().is_ok());
    }

    #[tokio::test]
    async fn save_serializes_the_graph() {
        let mut harness = Harness::connected();
        let controller = AutomationController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.save_flow(flow()).await })
        };

        let save = harness.reply("automation/response", json!({ "status": "success" })).await;
        assert_eq!(save["command"], "save_flow");
        assert_eq!(save["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(save["edges"][1]["sourceHandle"], "true");

        harness.reply("automation/response", json!({ "flows": [flow()] })).await;
        assert_eq!(task.await.unwrap().unwrap()[0].flow_id, "f1");
    }

    #[tokio::test]
    async fn saved_flow_is_not_undone_by_a_bad_listing() {
        let mut harness = Harness::connected();
        let controller = AutomationController::attach(context(&harness));
        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.save_flow(flow()).await })
        };
        harness.reply("automation/response", json!({ "status": "success" })).await;
        harness.reply("automation/response", json!({ "flows": "garbage" })).await;

        assert!(task.await.unwrap().unwrap().is_empty());
        let notes = harness.notifier.recent(10);
        assert_eq!(notes[1].message, "Flow 'Overheat alarm' saved");
        assert_eq!(notes[0].level, crate::notifications::Level::Warning);
    }

    #[tokio::test]
    async fn execute_is_fire_and_forget() {
        let mut harness = Harness::connected();
        let controller = AutomationController::attach(context(&harness));
        controller.execute("f1").unwrap();
        let (topic, command) = harness.next_publish().await;
        assert_eq!(topic, "automation/command");
        assert_eq!(command["command"], "execute");
        assert_eq!(harness.pending.pending_count(), 0);
    }
}
