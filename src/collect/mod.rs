//! Remote command collection: batch dispatch, invocation polling, retry.
//!
//! A `collect()` call moves through three stages. The dispatcher splits the
//! target list into bounded batches and submits each one, yielding a
//! [`CommandHandle`] per batch and a `Pending` [`InvocationRecord`] per target.
//! The poller then drives every record to a terminal state, and the pipeline
//! hands the resulting [`CollectionResult`] back to the caller.

pub mod client;
pub mod dispatch;
pub mod local;
pub mod pipeline;
pub mod poll;
pub mod retry;
pub mod session;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::client::{CommandBackend, RemoteExecution, RemoteExecutionClient};
pub use self::dispatch::ChunkedDispatcher;
pub use self::pipeline::CollectionPipeline;
pub use self::poll::InvocationPoller;

/// Identifier of a remote host (e.g. an instance id).
pub type Target = String;

/// Backend-issued token identifying one batch submission.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandHandle(String);

impl CommandHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one target's execution under a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Pending,
    Success,
    TimedOut,
    Cancelled,
    Failed,
}

impl InvocationStatus {
    /// Map a backend status string onto the five-state lifecycle.
    /// Anything that is not one of the four terminal outcomes is still pending
    /// (`Pending`, `InProgress`, `Delayed`, `Cancelling`, ...).
    pub fn from_backend(status: &str) -> Self {
        match status {
            "Success" => InvocationStatus::Success,
            "TimedOut" => InvocationStatus::TimedOut,
            "Cancelled" => InvocationStatus::Cancelled,
            "Failed" => InvocationStatus::Failed,
            _ => InvocationStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, InvocationStatus::Pending)
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InvocationStatus::Pending => "Pending",
            InvocationStatus::Success => "Success",
            InvocationStatus::TimedOut => "TimedOut",
            InvocationStatus::Cancelled => "Cancelled",
            InvocationStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One snapshot of an invocation as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationSnapshot {
    pub status: String,
    pub end_time: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Terminal outcome folded into a record by [`InvocationRecord::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl Outcome {
    fn status(&self) -> InvocationStatus {
        match self {
            Outcome::Success(_) => InvocationStatus::Success,
            Outcome::Failed(_) => InvocationStatus::Failed,
            Outcome::TimedOut => InvocationStatus::TimedOut,
            Outcome::Cancelled => InvocationStatus::Cancelled,
        }
    }
}

/// Per (handle, target) result. Mutated only until it turns terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    #[serde(rename = "instance_id", alias = "target_id")]
    target_id: Target,
    status: InvocationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdout: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

impl InvocationRecord {
    pub fn pending(target_id: impl Into<Target>) -> Self {
        Self {
            target_id: target_id.into(),
            status: InvocationStatus::Pending,
            collected_at: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn status(&self) -> InvocationStatus {
        self.status
    }

    pub fn collected_at(&self) -> Option<DateTime<Utc>> {
        self.collected_at
    }

    pub fn stdout(&self) -> Option<&serde_json::Value> {
        self.stdout.as_ref()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Transition to a terminal state. Returns `false` (and changes nothing)
    /// when the record is already terminal.
    pub fn complete(&mut self, outcome: Outcome, collected_at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = outcome.status();
        self.collected_at = Some(collected_at);
        match outcome {
            Outcome::Success(value) => self.stdout = Some(value),
            Outcome::Failed(stderr) => self.stderr = Some(stderr),
            Outcome::TimedOut | Outcome::Cancelled => {}
        }
        true
    }
}

/// Terminal output of one `collect()` call: handle -> records in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionResult {
    invocations: BTreeMap<CommandHandle, Vec<InvocationRecord>>,
}

impl CollectionResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: CommandHandle, records: Vec<InvocationRecord>) {
        self.invocations.insert(handle, records);
    }

    pub fn get(&self, handle: &CommandHandle) -> Option<&[InvocationRecord]> {
        self.invocations.get(handle).map(Vec::as_slice)
    }

    pub fn handles(&self) -> impl Iterator<Item = &CommandHandle> {
        self.invocations.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CommandHandle, &[InvocationRecord])> {
        self.invocations.iter().map(|(h, r)| (h, r.as_slice()))
    }

    pub(crate) fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = (&CommandHandle, &mut Vec<InvocationRecord>)> {
        self.invocations.iter_mut()
    }

    /// Every record across every handle.
    pub fn records(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.invocations.values().flatten()
    }

    pub fn into_records(self) -> impl Iterator<Item = InvocationRecord> {
        self.invocations.into_values().flatten()
    }

    /// Number of handles.
    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.records().filter(|r| !r.is_terminal()).count()
    }

    pub fn is_terminal(&self) -> bool {
        self.pending_count() == 0
    }
}
