//! Bounded batch submission.

use tracing::{debug, warn};

use super::client::RemoteExecution;
use super::{CollectionResult, InvocationRecord, Target};
use crate::error::{Error, Result};
use crate::logging::redact;

/// Maximum instances per submission the backend accepts.
pub const DEFAULT_CHUNK_SIZE: usize = 50;

/// A submission failed after some batches were already dispatched.
#[derive(Debug)]
pub struct PartialDispatch {
    /// Batches that were accepted before the failure; still pending.
    pub dispatched: CollectionResult,
    pub error: Error,
}

impl From<PartialDispatch> for Error {
    fn from(partial: PartialDispatch) -> Self {
        if !partial.dispatched.is_empty() {
            warn!(
                handles = partial.dispatched.len(),
                "dropping dispatched batches after a failed submission"
            );
        }
        partial.error
    }
}

/// Splits targets into contiguous, order-preserving batches of at most
/// `chunk_size` and submits each batch once.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedDispatcher {
    chunk_size: usize,
}

impl Default for ChunkedDispatcher {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ChunkedDispatcher {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::BadArguments("chunk size must be at least 1".into()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// The batches `targets` will be submitted as.
    pub fn batches<'t>(&self, targets: &'t [Target]) -> impl Iterator<Item = &'t [Target]> {
        targets.chunks(self.chunk_size)
    }

    /// Submit every batch. No retries happen here; the client owns those.
    pub async fn dispatch(
        &self,
        client: &dyn RemoteExecution,
        targets: &[Target],
        commands: &[String],
    ) -> Result<CollectionResult, PartialDispatch> {
        let mut result = CollectionResult::new();

        for batch in self.batches(targets) {
            debug!(
                instances = ?batch,
                commands = %redact(&commands.join("\n")),
                "sending command"
            );
            let (handle, status) = match client.submit(batch, commands).await {
                Ok(submitted) => submitted,
                Err(error) => {
                    return Err(PartialDispatch {
                        dispatched: result,
                        error,
                    })
                }
            };
            debug!(command_id = %handle, %status, size = batch.len(), "batch dispatched");
            if status.is_terminal() {
                // The submission status carries no output; the poller fetches it.
                debug!(command_id = %handle, %status, "seeding terminal submission as pending");
            }

            let records = batch.iter().map(InvocationRecord::pending).collect();
            result.insert(handle, records);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{CommandHandle, InvocationSnapshot, InvocationStatus};
    use crate::error::BackendError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        batches: Mutex<Vec<Vec<Target>>>,
        fail_on: Option<usize>,
        status: Option<InvocationStatus>,
    }

    #[async_trait]
    impl RemoteExecution for RecordingClient {
        async fn submit(
            &self,
            targets: &[Target],
            _commands: &[String],
        ) -> Result<(CommandHandle, InvocationStatus)> {
            let mut batches = self.batches.lock().unwrap();
            if Some(batches.len()) == self.fail_on {
                return Err(Error::UnknownInstance(BackendError::new(
                    "InvalidInstanceId",
                    "no such instance",
                )));
            }
            batches.push(targets.to_vec());
            Ok((
                CommandHandle::new(format!("cmd-{}", batches.len())),
                self.status.unwrap_or(InvocationStatus::Pending),
            ))
        }

        async fn get_invocation(
            &self,
            _handle: &CommandHandle,
            _target: &str,
        ) -> Result<InvocationSnapshot> {
            unreachable!("dispatch never polls")
        }
    }

    fn targets(n: usize) -> Vec<Target> {
        (1..=n).map(|i| format!("i-{i}")).collect()
    }

    #[tokio::test]
    async fn test_two_targets_single_batch() {
        let client = RecordingClient::default();
        let result = ChunkedDispatcher::default()
            .dispatch(&client, &targets(2), &["echo 1".to_string()])
            .await
            .unwrap();

        assert_eq!(result.len(), 1);
        let (handle, records) = result.iter().next().unwrap();
        assert_eq!(handle.as_str(), "cmd-1");
        let ids: Vec<&str> = records.iter().map(|r| r.target_id()).collect();
        assert_eq!(ids, vec!["i-1", "i-2"]);
        assert!(records.iter().all(|r| r.status() == InvocationStatus::Pending));
        assert!(records.iter().all(|r| r.stdout().is_none()));
    }

    #[tokio::test]
    async fn test_terminal_submission_status_still_polled() {
        let client = RecordingClient {
            status: Some(InvocationStatus::Success),
            ..Default::default()
        };
        let result = ChunkedDispatcher::default()
            .dispatch(&client, &targets(3), &["echo 1".to_string()])
            .await
            .unwrap();

        assert_eq!(result.pending_count(), 3);
        assert!(!result.is_terminal());
    }

    #[tokio::test]
    async fn test_120_targets_three_batches() {
        let client = RecordingClient::default();
        let result = ChunkedDispatcher::new(50)
            .unwrap()
            .dispatch(&client, &targets(120), &["echo 1".to_string()])
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        let sizes: Vec<usize> = client.batches.lock().unwrap().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(result.records().count(), 120);
    }

    #[test]
    fn test_batches_partition_targets() {
        for chunk in 1..=7 {
            let dispatcher = ChunkedDispatcher::new(chunk).unwrap();
            for n in 0..=30 {
                let all = targets(n);
                let batches: Vec<&[Target]> = dispatcher.batches(&all).collect();
                assert_eq!(batches.len(), n.div_ceil(chunk));
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= chunk));
                assert_eq!(batches.concat(), all);
            }
        }
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(matches!(ChunkedDispatcher::new(0), Err(Error::BadArguments(_))));
    }

    #[tokio::test]
    async fn test_failure_keeps_dispatched_batches() {
        let client = RecordingClient {
            fail_on: Some(1),
            ..Default::default()
        };
        let partial = ChunkedDispatcher::new(2)
            .unwrap()
            .dispatch(&client, &targets(5), &["echo 1".to_string()])
            .await
            .unwrap_err();

        assert_eq!(partial.dispatched.len(), 1);
        assert_eq!(partial.dispatched.records().count(), 2);
        assert!(matches!(partial.error, Error::UnknownInstance(_)));
    }
}
