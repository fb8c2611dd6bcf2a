//! One controller per console page.
//!
//! A controller owns a cache of the last successful reply for its domain,
//! holds the subscriptions its replies arrive on, and turns operator actions
//! into commands. Dropping a controller drops its subscriptions and
//! handlers, so late replies are no longer applied.

pub mod automation;
pub mod device_library;
pub mod file_transfer;
pub mod node_info;
pub mod payloads;
pub mod remapping;
pub mod services;
pub mod templates;

use std::future::Future;
use std::sync::{Arc, RwLock, PoisonError};
use tracing::{info, warn};

use crate::command_client::CommandClient;
use crate::error::{ConsoleError, ConsoleResult};
use crate::mqtt_service::SubscriptionGuard;
use crate::notifications::{Level, Notifier};
use crate::operation_tracker::OperationTracker;
use crate::router::MessageRouter;

/// Shared services every controller is built from.
#[derive(Clone)]
pub struct ControllerContext {
    pub client: Arc<CommandClient>,
    pub router: Arc<MessageRouter>,
    pub notifier: Arc<Notifier>,
    pub tracker: Arc<OperationTracker>,
}

impl ControllerContext {
    pub fn subscribe(&self, topics: &[&str]) -> Vec<SubscriptionGuard> {
        topics
            .iter()
            .map(|topic| self.client.mqtt().subscribe(topic))
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.client.mqtt().is_connected()
    }

    /// Runs an operation under `key`. A failure raises one error
    /// notification; a duplicate submission is only logged.
    pub async fn run<T, F>(&self, label: &str, key: &str, operation: F) -> ConsoleResult<T>
    where
        F: Future<Output = ConsoleResult<T>>,
    {
        let result = self.tracker.track(key, operation).await;
        match &result {
            Err(ConsoleError::InFlight(_)) => info!("{} skipped: already in progress", label),
            Err(e) => self.notifier.report_failure(label, e),
            Ok(_) => {}
        }
        result
    }

    pub fn success(&self, message: impl Into<String>) {
        self.notifier.notify(Level::Success, message);
    }

    /// Re-reads a list after a mutation has already succeeded. A failed
    /// re-read raises a warning of its own and yields `cached` instead, so
    /// the mutation is never reported as failed.
    pub async fn reload<T, F>(&self, what: &str, fetch: F, cached: impl FnOnce() -> T) -> T
    where
        F: Future<Output = ConsoleResult<T>>,
    {
        match fetch.await {
            Ok(value) => value,
            Err(e) => {
                warn!("Reloading {} failed: {}", what, e);
                self.notifier
                    .notify(Level::Warning, format!("Could not reload {}: {}", what, e));
                cached()
            }
        }
    }
}

/// Last reply received for one domain list. Replaced wholesale.
pub struct Cache<T> {
    inner: RwLock<T>,
}

impl<T: Clone + Default> Cache<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(T::default()),
        })
    }

    pub fn snapshot(&self) -> T {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn replace(&self, value: T) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub fn update<R>(&self, change: impl FnOnce(&mut T) -> R) -> R {
        change(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn read<R>(&self, view: impl FnOnce(&T) -> R) -> R {
        view(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::command_client::testing::Harness;

    pub(crate) fn context(harness: &Harness) -> ControllerContext {
        ControllerContext {
            client: harness.client.clone(),
            router: harness.router.clone(),
            notifier: harness.notifier.clone(),
            tracker: OperationTracker::new(),
        }
    }
}
