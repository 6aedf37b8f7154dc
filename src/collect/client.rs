//! Remote-execution client: submit a command to a batch, fetch invocations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use super::retry::RetryPolicy;
use super::session::Session;
use super::{CommandHandle, InvocationSnapshot, InvocationStatus, Target};
use crate::error::{BackendError, Result};
use crate::logging::redact;

/// Parameter name carrying the shell commands in a submission.
pub const COMMANDS_PARAMETER: &str = "commands";

/// Raw submission sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCommandRequest {
    pub instance_ids: Vec<String>,
    pub document_name: String,
    pub comment: String,
    pub parameters: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCommandResponse {
    pub command_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInvocation {
    pub status: String,
    pub execution_end_time: Option<String>,
    pub standard_output_content: Option<String>,
    pub standard_error_content: Option<String>,
}

/// The cloud command-execution service, as seen through its SDK.
#[async_trait]
pub trait CommandBackend: Send + Sync {
    async fn send_command(
        &self,
        session: &Session,
        request: SendCommandRequest,
    ) -> std::result::Result<SendCommandResponse, BackendError>;

    async fn get_command_invocation(
        &self,
        session: &Session,
        command_id: &str,
        instance_id: &str,
    ) -> std::result::Result<CommandInvocation, BackendError>;
}

/// What the dispatcher and poller need from a remote-execution service.
#[async_trait]
pub trait RemoteExecution: Send + Sync {
    /// Submit `commands` to every target in the batch.
    async fn submit(
        &self,
        targets: &[Target],
        commands: &[String],
    ) -> Result<(CommandHandle, InvocationStatus)>;

    /// Current state of one target's invocation under `handle`.
    async fn get_invocation(&self, handle: &CommandHandle, target: &str)
        -> Result<InvocationSnapshot>;
}

/// [`RemoteExecution`] over a [`CommandBackend`], bound to one session.
pub struct RemoteExecutionClient<'s> {
    backend: Arc<dyn CommandBackend>,
    session: &'s Session,
    document_name: String,
    comment: String,
    throttle: RetryPolicy,
}

impl<'s> RemoteExecutionClient<'s> {
    pub fn new(backend: Arc<dyn CommandBackend>, session: &'s Session) -> Self {
        Self {
            backend,
            session,
            document_name: "AWS-RunShellScript".to_string(),
            comment: String::new(),
            throttle: RetryPolicy::throttling(),
        }
    }

    pub fn with_document(mut self, document_name: impl Into<String>) -> Self {
        self.document_name = document_name.into();
        self
    }

    /// Incident id attached to every submission as its comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_retry(mut self, throttle: RetryPolicy) -> Self {
        self.throttle = throttle;
        self
    }
}

#[async_trait]
impl RemoteExecution for RemoteExecutionClient<'_> {
    async fn submit(
        &self,
        targets: &[Target],
        commands: &[String],
    ) -> Result<(CommandHandle, InvocationStatus)> {
        debug!(instances = targets.len(), "sending command(s) to instance(s)");

        let mut parameters = BTreeMap::new();
        parameters.insert(COMMANDS_PARAMETER.to_string(), commands.to_vec());
        let request = SendCommandRequest {
            instance_ids: targets.to_vec(),
            document_name: self.document_name.clone(),
            comment: self.comment.clone(),
            parameters,
        };

        let response = self
            .throttle
            .run("send_command", || {
                let request = request.clone();
                async move {
                    self.backend
                        .send_command(self.session, request)
                        .await
                        .map_err(|e| {
                            if e.is_invalid_instance() {
                                error!(code = %e.code, "backend has no record of this instance");
                            }
                            crate::Error::from_backend(e)
                        })
                }
            })
            .await?;

        debug!(command_id = %response.command_id, status = %response.status, "command accepted");
        Ok((
            CommandHandle::new(response.command_id),
            InvocationStatus::from_backend(&response.status),
        ))
    }

    async fn get_invocation(
        &self,
        handle: &CommandHandle,
        target: &str,
    ) -> Result<InvocationSnapshot> {
        debug!(command_id = %handle, instance_id = target, "getting command status");

        let invocation = self
            .throttle
            .run("get_command_invocation", || async {
                self.backend
                    .get_command_invocation(self.session, handle.as_str(), target)
                    .await
                    .map_err(crate::Error::from_backend)
            })
            .await?;

        Ok(InvocationSnapshot {
            status: invocation.status,
            end_time: invocation.execution_end_time,
            stdout: invocation.standard_output_content,
            stderr: invocation.standard_error_content.map(|s| redact(&s).into_owned()),
        })
    }
}
