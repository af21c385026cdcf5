//! Registry of long-running named operations.
//!
//! Operations move `Pending → Running → Done`, or to `Cancelled` from any
//! non-terminal state. The registry is created at service start and drained
//! with [`OperationRegistry::shutdown`]; every operation still unfinished at
//! that point is reported at critical severity, once.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Running,
    Done,
    Cancelled,
}

impl OperationStatus {
    /// Done or cancelled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// Snapshot of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub name: String,
    pub status: OperationStatus,
    /// Set when the operation completed successfully.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Set when the operation failed or was cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: OperationStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status.is_terminal()
    }
}

struct Entry {
    operation: Operation,
    task: Option<tokio::task::AbortHandle>,
}

#[derive(Default)]
struct RegistryState {
    entries: FxHashMap<String, Entry>,
    drained: bool,
}

/// Named operations tracked for the lifetime of a service.
#[derive(Default)]
pub struct OperationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending operation.
    pub fn begin(&self, name: &str) -> Result<Operation> {
        let mut state = lock(&self.state);
        if state.drained {
            return Err(Error::InvalidOperation(format!(
                "registry is shut down, cannot begin `{}`",
                name
            )));
        }
        if state.entries.contains_key(name) {
            return Err(Error::DuplicateOperation(name.to_string()));
        }

        let operation = Operation::new(name);
        state.entries.insert(
            name.to_string(),
            Entry {
                operation: operation.clone(),
                task: None,
            },
        );
        tracing::debug!("Operation `{}` registered", name);
        Ok(operation)
    }

    /// Mark a pending operation as running.
    pub fn start(&self, name: &str) -> Result<Operation> {
        transition(&self.state, name, |op| match op.status {
            OperationStatus::Pending => {
                op.status = OperationStatus::Running;
                Ok(())
            }
            other => Err(Error::InvalidOperation(format!(
                "cannot start `{}` in state {:?}",
                op.name, other
            ))),
        })
    }

    /// Finish an operation with a result. No-op if it already finished.
    pub fn complete(&self, name: &str, result: serde_json::Value) -> Result<Operation> {
        finish(&self.state, name, OperationStatus::Done, Some(result), None)
    }

    /// Finish an operation with an error. No-op if it already finished.
    pub fn fail(&self, name: &str, error: impl std::fmt::Display) -> Result<Operation> {
        finish(&self.state, name, OperationStatus::Done, None, Some(error.to_string()))
    }

    /// Cancel an operation and abort its task, if any. No-op if it already finished.
    pub fn cancel(&self, name: &str) -> Result<Operation> {
        let mut state = lock(&self.state);
        let entry = state
            .entries
            .get_mut(name)
            .ok_or_else(|| Error::OperationNotFound(name.to_string()))?;

        if !entry.operation.is_done() {
            tracing::info!("Cancelling operation `{}`", name);
            entry.operation.status = OperationStatus::Cancelled;
            entry.operation.error = Some(Error::Cancelled(name.to_string()).to_string());
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
        Ok(entry.operation.clone())
    }

    /// Register `name` and drive `work` to completion on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn spawn<F>(&self, name: &str, work: F) -> Result<Operation>
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::InvalidOperation(format!("`{}` spawned outside a tokio runtime", name))
        })?;

        let operation = self.begin(name)?;

        let state = self.state.clone();
        let task_name = name.to_string();
        let task = runtime.spawn(async move {
            let started = transition(&state, &task_name, |op| {
                if op.status == OperationStatus::Pending {
                    op.status = OperationStatus::Running;
                    Ok(())
                } else {
                    Err(Error::Cancelled(op.name.clone()))
                }
            });
            if started.is_err() {
                return;
            }

            let outcome = work.await;
            let finished = match outcome {
                Ok(value) => finish(&state, &task_name, OperationStatus::Done, Some(value), None),
                Err(e) => {
                    tracing::warn!("Operation `{}` failed: {}", task_name, e);
                    finish(&state, &task_name, OperationStatus::Done, None, Some(e.to_string()))
                }
            };
            if let Err(e) = finished {
                tracing::debug!("Operation `{}` finished after removal: {}", task_name, e);
            }
        });

        let mut state = lock(&self.state);
        match state.entries.get_mut(name) {
            Some(entry) if !entry.operation.is_done() => entry.task = Some(task.abort_handle()),
            _ => task.abort(),
        }

        Ok(operation)
    }

    pub fn get(&self, name: &str) -> Option<Operation> {
        lock(&self.state)
            .entries
            .get(name)
            .map(|entry| entry.operation.clone())
    }

    /// All operations, sorted by name.
    pub fn list(&self) -> Vec<Operation> {
        let mut operations: Vec<_> = lock(&self.state)
            .entries
            .values()
            .map(|entry| entry.operation.clone())
            .collect();
        operations.sort_by(|a, b| a.name.cmp(&b.name));
        operations
    }

    /// Forget a finished operation.
    pub fn remove(&self, name: &str) -> Result<Operation> {
        let mut state = lock(&self.state);
        let done = state
            .entries
            .get(name)
            .map(|entry| entry.operation.is_done())
            .ok_or_else(|| Error::OperationNotFound(name.to_string()))?;

        if !done {
            return Err(Error::InvalidOperation(format!(
                "cannot remove unfinished operation `{}`",
                name
            )));
        }

        state
            .entries
            .remove(name)
            .map(|entry| entry.operation)
            .ok_or_else(|| Error::OperationNotFound(name.to_string()))
    }

    /// Abandon every unfinished operation and refuse new ones.
    ///
    /// Returns the names of the abandoned operations, sorted.
    pub fn shutdown(&self) -> Vec<String> {
        drain(&self.state)
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).drained
    }
}

impl Drop for OperationRegistry {
    fn drop(&mut self) {
        if !lock(&self.state).drained {
            drain(&self.state);
        }
    }
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    // The guarded maps stay consistent across a panic; every update is a single assignment.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn transition(
    state: &Mutex<RegistryState>,
    name: &str,
    apply: impl FnOnce(&mut Operation) -> Result<()>,
) -> Result<Operation> {
    let mut state = lock(state);
    let entry = state
        .entries
        .get_mut(name)
        .ok_or_else(|| Error::OperationNotFound(name.to_string()))?;
    apply(&mut entry.operation)?;
    Ok(entry.operation.clone())
}

fn finish(
    state: &Mutex<RegistryState>,
    name: &str,
    status: OperationStatus,
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> Result<Operation> {
    let mut state = lock(state);
    let entry = state
        .entries
        .get_mut(name)
        .ok_or_else(|| Error::OperationNotFound(name.to_string()))?;

    if !entry.operation.is_done() {
        entry.operation.status = status;
        entry.operation.result = result;
        entry.operation.error = error;
        entry.task = None;
        tracing::debug!("Operation `{}` finished", name);
    }
    Ok(entry.operation.clone())
}

fn drain(state: &Mutex<RegistryState>) -> Vec<String> {
    let mut state = lock(state);
    state.drained = true;

    let mut abandoned = Vec::new();
    for (name, entry) in state.entries.iter_mut() {
        if entry.operation.is_done() {
            continue;
        }

        tracing::error!(
            severity = "critical",
            operation = %name,
            "Operation `{}` cancelled before finishing.",
            name
        );
        entry.operation.status = OperationStatus::Cancelled;
        entry.operation.error = Some(Error::OperationAbandoned(name.clone()).to_string());
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        abandoned.push(name.clone());
    }

    abandoned.sort();
    abandoned
}
