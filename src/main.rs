mod command_client;
mod config;
mod controllers;
mod db;
mod error;
mod models;
mod mqtt_service;
mod notifications;
mod operation_tracker;
mod payload_builder;
mod rest_server;
mod router;
mod service_utils;
mod topics;

use crate::command_client::{CommandClient, PendingRequests};
use crate::config::Config;
use crate::controllers::ControllerContext;
use crate::db::DatabaseService;
use crate::mqtt_service::MqttService;
use crate::notifications::Notifier;
use crate::operation_tracker::OperationTracker;
use crate::rest_server::{run_rest_server, AppState};
use crate::router::MessageRouter;
use crate::service_utils::{handle_shutdown, periodic_status_update, start_mqtt_service};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let db_service = match DatabaseService::new(&config.notification_db_path) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to create database service: {:?}", e);
            return;
        }
    };

    if let Err(e) = db_service.initialize_db() {
        error!("Database initialization failed: {:?}", e);
        return;
    }
    info!("Notification store ready at {}.", config.notification_db_path);

    let notifier = Notifier::new(db_service);
    let pending = Arc::new(PendingRequests::default());
    let router = MessageRouter::new(pending.clone(), notifier.clone());
    let (mqtt_service, outbox) = MqttService::new(config.clone(), router.clone());
    let client = CommandClient::new(mqtt_service.clone(), pending.clone(), &config);

    let ctx = ControllerContext {
        client,
        router,
        notifier,
        tracker: OperationTracker::new(),
    };
    let state = AppState::attach(ctx, pending);
    state.payloads.start_refresh(config.refresh_interval());
    state.library.start_discovery(config.discovery_interval());

    let mqtt_task = start_mqtt_service(mqtt_service.clone(), outbox);

    // Online status is published on every ConnAck; this keeps it fresh.
    let _status_task = periodic_status_update(mqtt_service.clone(), Duration::from_secs(60));

    let payloads = state.payloads.clone();
    let library = state.library.clone();

    // Start REST API server
    let rest_port = config.rest_port;
    let rest_api_task = tokio::spawn(async move {
        run_rest_server(state, rest_port).await;
    });

    handle_shutdown(mqtt_service.clone()).await;
    payloads.stop_refresh();
    library.stop_discovery();

    rest_api_task.abort();
    let _ = tokio::join!(mqtt_task, rest_api_task);
    info!("All services shut down successfully.");
}
