use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::{ConsoleError, ConsoleResult};
use crate::service_utils::now_rfc3339;

/// `idle → sending → success | failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum OperationState {
    Idle,
    Sending,
    Success,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub key: String,
    #[serde(flatten)]
    pub state: OperationState,
    pub updated_at: String,
}

#[derive(Default)]
pub struct OperationTracker {
    operations: Mutex<HashMap<String, OperationRecord>>,
}

impl OperationTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn set(&self, key: &str, state: OperationState) {
        let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations.insert(
            key.to_string(),
            OperationRecord {
                key: key.to_string(),
                state,
                updated_at: now_rfc3339(),
            },
        );
    }

    /// Moves `key` to `sending`. Fails while the same key is still sending.
    pub fn begin(self: &Arc<Self>, key: &str) -> ConsoleResult<OperationGuard> {
        let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(operations.get(key), Some(record) if record.state == OperationState::Sending) {
            info!("Operation '{}' is already in progress.", key);
            return Err(ConsoleError::InFlight(key.to_string()));
        }
        operations.insert(
            key.to_string(),
            OperationRecord {
                key: key.to_string(),
                state: OperationState::Sending,
                updated_at: now_rfc3339(),
            },
        );
        Ok(OperationGuard {
            key: key.to_string(),
            tracker: self.clone(),
            finished: false,
        })
    }

    /// Runs `operation` under `key`, recording its outcome.
    pub async fn track<T, F>(self: &Arc<Self>, key: &str, operation: F) -> ConsoleResult<T>
    where
        F: Future<Output = ConsoleResult<T>>,
    {
        let guard = self.begin(key)?;
        let result = operation.await;
        guard.finish(&result);
        result
    }

    #[cfg(test)]
    pub fn state(&self, key: &str) -> OperationState {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|record| record.state.clone())
            .unwrap_or(OperationState::Idle)
    }

    pub fn snapshot(&self) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

/// Resets its operation to `idle` if dropped before [`OperationGuard::finish`].
pub struct OperationGuard {
    key: String,
    tracker: Arc<OperationTracker>,
    finished: bool,
}

impl OperationGuard {
    pub fn finish<T>(mut self, result: &ConsoleResult<T>) {
        let state = match result {
            Ok(_) => OperationState::Success,
            Err(e) => OperationState::Failed {
                message: e.to_string(),
            },
        };
        debug!("Operation '{}' finished: {:?}", self.key, state);
        self.tracker.set(&self.key, state);
        self.finished = true;
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.set(&self.key, OperationState::Idle);
        }
    }
}

impl fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationGuard")
            .field("key", &self.key)
            .field("finished", &self.finished)
            .finish()
    }
}
