//! `collect()`: dispatch then poll, inside one scoped session.

use std::sync::Arc;

use tracing::{debug, info};

use super::client::{CommandBackend, RemoteExecutionClient};
use super::dispatch::ChunkedDispatcher;
use super::poll::InvocationPoller;
use super::retry::RetryPolicy;
use super::session::SessionProvider;
use super::{CollectionResult, Target};
use crate::error::Result;

/// End-to-end remote collection against one backend.
pub struct CollectionPipeline {
    backend: Arc<dyn CommandBackend>,
    sessions: Arc<dyn SessionProvider>,
    dispatcher: ChunkedDispatcher,
    poller: InvocationPoller,
    throttle: RetryPolicy,
    document: Option<String>,
}

impl CollectionPipeline {
    pub fn new(backend: Arc<dyn CommandBackend>, sessions: Arc<dyn SessionProvider>) -> Self {
        Self {
            backend,
            sessions,
            dispatcher: ChunkedDispatcher::default(),
            poller: InvocationPoller::default(),
            throttle: RetryPolicy::throttling(),
            document: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: ChunkedDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_poller(mut self, poller: InvocationPoller) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_throttle(mut self, throttle: RetryPolicy) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Run `commands` on every target and wait for all of them to finish.
    ///
    /// The session is acquired here and released before returning, on both
    /// the success and the error path.
    pub async fn collect(
        &self,
        targets: &[Target],
        commands: &[String],
        account: &str,
        region: &str,
        incident_id: &str,
    ) -> Result<CollectionResult> {
        info!(
            instances = targets.len(),
            commands = commands.len(),
            account,
            region,
            incident_id,
            "collecting from instances"
        );

        let session = self.sessions.acquire(account, region).await?;
        let mut client = RemoteExecutionClient::new(Arc::clone(&self.backend), &session)
            .with_comment(incident_id)
            .with_retry(self.throttle);
        if let Some(document) = &self.document {
            client = client.with_document(document.as_str());
        }

        let pending = self.dispatcher.dispatch(&client, targets, commands).await?;
        debug!(
            handles = pending.len(),
            records = pending.pending_count(),
            "dispatch complete, polling"
        );
        let result = self.poller.poll(&client, pending).await?;

        info!(
            handles = result.len(),
            records = result.records().count(),
            "collection complete"
        );
        Ok(result)
    }
}
