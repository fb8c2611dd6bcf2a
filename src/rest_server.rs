use base64::{engine::general_purpose::STANDARD, Engine as _};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Status};
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{delete, get, options, post, put, routes, Build, Rocket, State};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::command_client::PendingRequests;
use crate::controllers::automation::{AutomationController, FlowDefinition};
use crate::controllers::device_library::{
    DeviceLibraryController, DeviceVariableEntry, LibraryEntry, LibraryEntryKey, LibrarySummary,
};
use crate::controllers::file_transfer::FileTransferController;
use crate::controllers::node_info::NodeInfoController;
use crate::controllers::payloads::PayloadsController;
use crate::controllers::remapping::RemappingController;
use crate::controllers::services::ServicesController;
use crate::controllers::templates::TemplatesController;
use crate::controllers::ControllerContext;
use crate::error::ConsoleError;
use crate::models::{BrokerTemplate, DataItem, Location, NodeConfig, RemappingConfig};
use crate::mqtt_service::{ClientState, MqttService};
use crate::notifications::{Notification, Notifier};
use crate::operation_tracker::{OperationRecord, OperationTracker};
use crate::payload_builder::DataItemDraft;

/// Everything the routes reach through rocket's managed state.
pub struct AppState {
    pub mqtt: Arc<MqttService>,
    pub pending: Arc<PendingRequests>,
    pub notifier: Arc<Notifier>,
    pub tracker: Arc<OperationTracker>,
    pub templates: Arc<TemplatesController>,
    pub payloads: Arc<PayloadsController>,
    pub library: Arc<DeviceLibraryController>,
    pub remapping: Arc<RemappingController>,
    pub automation: Arc<AutomationController>,
    pub node: Arc<NodeInfoController>,
    pub files: Arc<FileTransferController>,
    pub services: Arc<ServicesController>,
}

impl AppState {
    /// Attaches one controller per console page.
    pub fn attach(ctx: ControllerContext, pending: Arc<PendingRequests>) -> Self {
        let library = DeviceLibraryController::attach(ctx.clone());
        Self {
            mqtt: ctx.client.mqtt().clone(),
            pending,
            notifier: ctx.notifier.clone(),
            tracker: ctx.tracker.clone(),
            templates: TemplatesController::attach(ctx.clone()),
            payloads: PayloadsController::attach(ctx.clone()),
            remapping: RemappingController::attach(ctx.clone(), library.clone()),
            library,
            automation: AutomationController::attach(ctx.clone()),
            node: NodeInfoController::attach(ctx.clone()),
            files: FileTransferController::attach(ctx.clone()),
            services: ServicesController::attach(ctx),
        }
    }
}

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
pub struct ApiResponse {
    status: String,
    message: String,
}

impl ApiResponse {
    fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success".to_string(),
            message: message.into(),
        })
    }
}

type ApiError = status::Custom<Json<ApiResponse>>;
type ApiResult<T> = Result<Json<T>, ApiError>;

fn http_status(err: &ConsoleError) -> Status {
    match err {
        ConsoleError::NotConnected => Status::ServiceUnavailable,
        ConsoleError::Timeout { .. } => Status::GatewayTimeout,
        ConsoleError::Backend(_) => Status::BadGateway,
        ConsoleError::Validation(_) | ConsoleError::Malformed { .. } => Status::UnprocessableEntity,
        ConsoleError::InFlight(_) => Status::Conflict,
        ConsoleError::ChannelClosed => Status::InternalServerError,
    }
}

fn reject(err: ConsoleError) -> ApiError {
    status::Custom(
        http_status(&err),
        Json(ApiResponse {
            status: "error".to_string(),
            message: err.to_string(),
        }),
    )
}

fn respond<T>(result: Result<T, ConsoleError>) -> ApiResult<T> {
    result.map(Json).map_err(reject)
}

fn same_id(path_id: &str, body_id: &str) -> Result<(), ApiError> {
    if path_id == body_id {
        Ok(())
    } else {
        Err(reject(ConsoleError::Validation(format!(
            "path id '{}' does not match body id '{}'",
            path_id, body_id
        ))))
    }
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(Header::new(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS",
        ));
        res.set_header(Header::new("Access-Control-Allow-Headers", "Content-Type"));
    }
}

/// Preflight requests only need the CORS headers.
#[options("/<_..>")]
fn preflight() -> Status {
    Status::NoContent
}

/// Root handler
#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    ApiResponse::success("Gateway console is running")
}

#[get("/status")]
fn status_handler(state: &State<AppState>) -> Json<Value> {
    let client_state = state.mqtt.state();
    let error = match &client_state {
        ClientState::Error(reason) => Some(reason.clone()),
        _ => None,
    };
    Json(json!({
        "state": client_state.label(),
        "error": error,
        "connected": state.mqtt.is_connected(),
        "pending_requests": state.pending.pending_count(),
    }))
}

#[get("/notifications?<limit>")]
fn notifications(limit: Option<usize>, state: &State<AppState>) -> Json<Vec<Notification>> {
    Json(state.notifier.recent(limit.unwrap_or(50)))
}

#[get("/operations")]
fn operations(state: &State<AppState>) -> Json<Vec<OperationRecord>> {
    Json(state.tracker.snapshot())
}

// List routes refresh from the gateway while connected and otherwise
// serve the last reply received.

// Broker templates

#[get("/templates")]
async fn list_templates(state: &State<AppState>) -> ApiResult<Vec<BrokerTemplate>> {
    if !state.mqtt.is_connected() {
        return Ok(Json(state.templates.templates()));
    }
    respond(state.templates.refresh().await)
}

#[post("/templates", data = "<template>")]
async fn create_template(template: Json<BrokerTemplate>, state: &State<AppState>) -> ApiResult<BrokerTemplate> {
    respond(state.templates.create(template.into_inner()).await)
}

#[put("/templates/<id>", data = "<template>")]
async fn update_template(
    id: String,
    template: Json<BrokerTemplate>,
    state: &State<AppState>,
) -> ApiResult<BrokerTemplate> {
    same_id(&id, &template.template_id)?;
    respond(state.templates.update(template.into_inner()).await)
}

#[delete("/templates/<id>")]
async fn delete_template(id: String, state: &State<AppState>) -> ApiResult<ApiResponse> {
    state.templates.delete(&id).await.map_err(reject)?;
    Ok(ApiResponse::success(format!("Template '{}' deleted", id)))
}

// Static payloads

#[get("/payloads")]
async fn list_payloads(state: &State<AppState>) -> ApiResult<Vec<DataItem>> {
    if !state.mqtt.is_connected() {
        return Ok(Json(state.payloads.items()));
    }
    respond(state.payloads.refresh().await)
}

#[post("/payloads", data = "<draft>")]
async fn write_payload(draft: Json<DataItemDraft>, state: &State<AppState>) -> ApiResult<Vec<DataItem>> {
    respond(state.payloads.write(draft.into_inner()).await)
}

#[put("/payloads/<id>", data = "<draft>")]
async fn update_payload(
    id: String,
    draft: Json<DataItemDraft>,
    state: &State<AppState>,
) -> ApiResult<Vec<DataItem>> {
    respond(state.payloads.update(&id, draft.into_inner()).await)
}

#[delete("/payloads/<id>")]
async fn delete_payload(id: String, state: &State<AppState>) -> ApiResult<Vec<DataItem>> {
    respond(state.payloads.delete(&id).await)
}

// Remapping

#[get("/remapping")]
async fn list_remapping(state: &State<AppState>) -> ApiResult<Vec<RemappingConfig>> {
    if !state.mqtt.is_connected() {
        return Ok(Json(state.remapping.configs()));
    }
    respond(state.remapping.refresh().await)
}

#[post("/remapping", data = "<config>")]
async fn add_remapping(config: Json<RemappingConfig>, state: &State<AppState>) -> ApiResult<Vec<RemappingConfig>> {
    respond(state.remapping.add(config.into_inner()).await)
}

#[put("/remapping/<id>", data = "<config>")]
async fn set_remapping(
    id: String,
    config: Json<RemappingConfig>,
    state: &State<AppState>,
) -> ApiResult<Vec<RemappingConfig>> {
    same_id(&id, &config.id)?;
    respond(state.remapping.set(config.into_inner()).await)
}

#[delete("/remapping/<id>")]
async fn delete_remapping(id: String, state: &State<AppState>) -> ApiResult<Vec<RemappingConfig>> {
    respond(state.remapping.delete(&id).await)
}

// Device library

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct SectionRequest {
    section: String,
}

#[get("/library")]
async fn library_summary(state: &State<AppState>) -> ApiResult<LibrarySummary> {
    if !state.mqtt.is_connected() {
        return Ok(Json(state.library.summary()));
    }
    respond(state.library.refresh().await)
}

#[get("/library/sections")]
fn library_sections(state: &State<AppState>) -> Json<Vec<String>> {
    Json(state.library.summary().sections())
}

#[get("/library/<section>/manufacturers")]
fn library_manufacturers(section: String, state: &State<AppState>) -> Json<Vec<String>> {
    Json(state.library.summary().manufacturers(&section))
}

#[get("/library/<section>/<manufacturer>/parts")]
fn library_parts(section: String, manufacturer: String, state: &State<AppState>) -> Json<Vec<String>> {
    Json(state.library.summary().part_numbers(&section, &manufacturer))
}

#[get("/library/<section>/<manufacturer>/<part_number>/protocols")]
fn library_protocols(
    section: String,
    manufacturer: String,
    part_number: String,
    state: &State<AppState>,
) -> Json<Vec<String>> {
    Json(state.library.summary().protocols(&section, &manufacturer, &part_number))
}

#[get("/library/<section>/<manufacturer>/<part_number>/<protocol>/variables")]
fn library_variables(
    section: String,
    manufacturer: String,
    part_number: String,
    protocol: String,
    state: &State<AppState>,
) -> Json<Vec<DeviceVariableEntry>> {
    Json(
        state
            .library
            .summary()
            .variables(&section, &manufacturer, &part_number, &protocol),
    )
}

#[post("/library/sections", data = "<request>")]
async fn create_section(request: Json<SectionRequest>, state: &State<AppState>) -> ApiResult<LibrarySummary> {
    respond(state.library.create_section(&request.section).await)
}

#[delete("/library/sections/<section>")]
async fn delete_section(section: String, state: &State<AppState>) -> ApiResult<LibrarySummary> {
    respond(state.library.delete_section(&section).await)
}

#[post("/library/entries", data = "<entry>")]
async fn create_entry(entry: Json<LibraryEntry>, state: &State<AppState>) -> ApiResult<LibrarySummary> {
    respond(state.library.create_entry(entry.into_inner()).await)
}

#[put("/library/entries", data = "<entry>")]
async fn update_entry(entry: Json<LibraryEntry>, state: &State<AppState>) -> ApiResult<LibrarySummary> {
    respond(state.library.update_entry(entry.into_inner()).await)
}

#[delete("/library/entries", data = "<key>")]
async fn delete_entry(key: Json<LibraryEntryKey>, state: &State<AppState>) -> ApiResult<LibrarySummary> {
    respond(state.library.delete_entry(key.into_inner()).await)
}

// Automation

#[get("/flows")]
async fn list_flows(state: &State<AppState>) -> ApiResult<Vec<FlowDefinition>> {
    if !state.mqtt.is_connected() {
        return Ok(Json(state.automation.flows()));
    }
    respond(state.automation.refresh().await)
}

#[post("/flows", data = "<flow>")]
async fn save_flow(flow: Json<FlowDefinition>, state: &State<AppState>) -> ApiResult<Vec<FlowDefinition>> {
    respond(state.automation.save_flow(flow.into_inner()).await)
}

#[delete("/flows/<id>")]
async fn delete_flow(id: String, state: &State<AppState>) -> ApiResult<Vec<FlowDefinition>> {
    respond(state.automation.delete_flow(&id).await)
}

#[post("/flows/<id>/execute")]
fn execute_flow(id: String, state: &State<AppState>) -> ApiResult<Value> {
    let request_id = state.automation.execute(&id).map_err(reject)?;
    Ok(Json(json!({ "status": "success", "request_id": request_id })))
}

// Node info

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct NodeNameRequest {
    node_name: String,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct BaseTopicRequest {
    base_topic: String,
}

#[get("/node")]
async fn node_config(state: &State<AppState>) -> ApiResult<NodeConfig> {
    if let (false, Some(config)) = (state.mqtt.is_connected(), state.node.config()) {
        return Ok(Json(config));
    }
    respond(state.node.refresh().await)
}

#[put("/node/name", data = "<request>")]
async fn node_name(request: Json<NodeNameRequest>, state: &State<AppState>) -> ApiResult<NodeConfig> {
    respond(state.node.update_node_name(&request.node_name).await)
}

#[put("/node/base-topic", data = "<request>")]
async fn node_base_topic(request: Json<BaseTopicRequest>, state: &State<AppState>) -> ApiResult<NodeConfig> {
    respond(state.node.update_base_topic(&request.base_topic).await)
}

#[put("/node/location", data = "<location>")]
async fn node_location(location: Json<Location>, state: &State<AppState>) -> ApiResult<NodeConfig> {
    respond(state.node.set_manual_location(location.into_inner()).await)
}

// File transfer and services

/// File bodies travel as base64 inside the JSON; local paths are refused.
#[derive(Deserialize)]
#[serde(crate = "rocket::serde", deny_unknown_fields)]
struct DownloadRequest {
    filepath: String,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde", deny_unknown_fields)]
struct UploadRequest {
    filepath: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde")]
struct RestartRequest {
    services: Vec<String>,
}

#[post("/files/download", data = "<request>")]
async fn download_file(request: Json<DownloadRequest>, state: &State<AppState>) -> ApiResult<Value> {
    let file = state.files.download(&request.filepath).await.map_err(reject)?;
    let mut body = json!(file);
    body["content"] = json!(STANDARD.encode(&file.content));
    Ok(Json(body))
}

#[post("/files/upload", data = "<request>")]
async fn upload_file(request: Json<UploadRequest>, state: &State<AppState>) -> ApiResult<Value> {
    let bytes = STANDARD
        .decode(request.content.trim())
        .map_err(|e| reject(ConsoleError::Validation(format!("content is not base64: {}", e))))?;
    respond(state.files.upload(&request.filepath, &bytes).await)
}

#[post("/services/restart", data = "<request>")]
async fn restart_services(request: Json<RestartRequest>, state: &State<AppState>) -> ApiResult<Value> {
    respond(state.services.restart(&request.services).await)
}

pub fn build_rocket(state: AppState, port: u16) -> Rocket<Build> {
    let figment = rocket::Config::figment().merge(("port", port));
    rocket::custom(figment)
        .manage(state)
        .mount(
            "/",
            routes![
                preflight,
                root_handler,
                status_handler,
                notifications,
                operations,
                list_templates,
                create_template,
                update_template,
                delete_template,
                list_payloads,
                write_payload,
                update_payload,
                delete_payload,
                list_remapping,
                add_remapping,
                set_remapping,
                delete_remapping,
                library_summary,
                library_sections,
                library_manufacturers,
                library_parts,
                library_protocols,
                library_variables,
                create_section,
                delete_section,
                create_entry,
                update_entry,
                delete_entry,
                list_flows,
                save_flow,
                delete_flow,
                execute_flow,
                node_config,
                node_name,
                node_base_topic,
                node_location,
                download_file,
                upload_file,
                restart_services,
            ],
        )
        .attach(Cors)
}

/// Run the Rocket server with the attached controllers
pub async fn run_rest_server(state: AppState, port: u16) {
    info!("Starting REST API on port {}", port);
    if let Err(e) = build_rocket(state, port).launch().await {
        error!("REST API stopped: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_client::testing::Harness;
    use crate::controllers::testing::context;
    use rocket::http::ContentType;
    use rocket::local::asynchronous::Client;

    async fn client(harness: &Harness) -> Client {
        let state = AppState::attach(context(harness), harness.pending.clone());
        Client::tracked(build_rocket(state, 0)).await.expect("valid rocket")
    }

    #[rocket::async_test]
    async fn root_carries_cors_headers() {
        let harness = Harness::disconnected();
        let client = client(&harness).await;
        let response = client.get("/").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            response.headers().get_one("Access-Control-Allow-Origin"),
            Some("*")
        );
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["status"], "success");
    }

    #[rocket::async_test]
    async fn status_reports_connection_state() {
        let harness = Harness::disconnected();
        let client = client(&harness).await;
        let body: Value = client.get("/status").dispatch().await.into_json().await.unwrap();
        assert_eq!(body["state"], "disconnected");
        assert_eq!(body["connected"], false);
    }

    #[rocket::async_test]
    async fn disconnected_commands_are_503() {
        let harness = Harness::disconnected();
        let client = client(&harness).await;
        let response = client
            .post("/services/restart")
            .header(ContentType::JSON)
            .body(r#"{"services":["modbus"]}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::ServiceUnavailable);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body["status"], "error");

        let notes: Value = client.get("/notifications?limit=5").dispatch().await.into_json().await.unwrap();
        assert_eq!(notes.as_array().unwrap().len(), 1);
    }

    #[rocket::async_test]
    async fn lists_fall_back_to_cache_while_disconnected() {
        let harness = Harness::disconnected();
        let client = client(&harness).await;
        let response = client.get("/flows").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body: Value = response.into_json().await.unwrap();
        assert_eq!(body, json!([]));

        // Nothing cached yet for the node, so the failure surfaces.
        let response = client.get("/node").dispatch().await;
        assert_eq!(response.status(), Status::ServiceUnavailable);
    }

    #[rocket::async_test]
    async fn validation_failures_are_422() {
        let harness = Harness::connected();
        let client = client(&harness).await;
        let response = client
            .put("/node/location")
            .header(ContentType::JSON)
            .body(r#"{"latitude":91.0,"longitude":0.0}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn file_routes_refuse_local_paths() {
        let mut harness = Harness::connected();
        let client = client(&harness).await;
        let response = client
            .post("/files/upload")
            .header(ContentType::JSON)
            .body(r#"{"filepath":"/tmp/loot","local_path":"/etc/passwd"}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);

        let response = client
            .post("/files/download")
            .header(ContentType::JSON)
            .body(r#"{"filepath":"/etc/gateway/devices.json","save_to":"/root/.bashrc"}"#)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
        assert!(harness.published_nothing());
    }

    #[rocket::async_test]
    async fn mismatched_path_id_is_rejected() {
        let harness = Harness::connected();
        let client = client(&harness).await;
        let response = client
            .put("/remapping/other")
            .header(ContentType::JSON)
            .body(
                json!({
                    "id": "r1",
                    "source_devices": [],
                    "mqtt_publish_config": { "broker_url": "mqtt://localhost", "topic": "t" }
                })
                .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }
}
