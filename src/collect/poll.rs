//! Invocation polling: drive every record to a terminal state.
//!
//! Each cycle queries every still-pending record once. Handles are polled
//! concurrently, each handle's records sequentially and in submission order,
//! so a record sequence only ever has one writer. Between cycles the poller
//! sleeps on the pending backoff schedule. Terminal records are never queried
//! again, which makes polling an already-terminal result free.
//!
//! The pending schedule itself has no ceiling. A wall-clock deadline and a
//! cycle cap bound the loop; once either runs out, the remaining records are
//! closed out as `TimedOut`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::client::RemoteExecution;
use super::retry::RetryPolicy;
use super::{CollectionResult, CommandHandle, InvocationRecord, InvocationStatus, Outcome};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct InvocationPoller {
    backoff: RetryPolicy,
    deadline: Option<Duration>,
    max_cycles: Option<u32>,
}

impl Default for InvocationPoller {
    fn default() -> Self {
        Self {
            backoff: RetryPolicy::pending(),
            deadline: None,
            max_cycles: None,
        }
    }
}

impl InvocationPoller {
    pub fn new(backoff: RetryPolicy) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    /// Give up on still-pending records once `deadline` has elapsed.
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Give up on still-pending records after `max_cycles` query cycles.
    pub fn with_max_cycles(mut self, max_cycles: Option<u32>) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    /// Poll until every record in `invocations` is terminal and return it.
    pub async fn poll(
        &self,
        client: &dyn RemoteExecution,
        mut invocations: CollectionResult,
    ) -> Result<CollectionResult> {
        let started = Instant::now();
        let mut cycle = 0u32;

        while !invocations.is_terminal() {
            cycle += 1;
            let pending: usize = try_join_all(
                invocations
                    .iter_mut()
                    .map(|(handle, records)| self.poll_handle(client, handle, records)),
            )
            .await?
            .into_iter()
            .sum();

            if pending == 0 {
                break;
            }

            if self.max_cycles.is_some_and(|max| cycle >= max) {
                warn!(cycle, pending, "poll cycle limit reached");
                close_out(&mut invocations);
                break;
            }

            let mut wait = self.backoff.delay_for(cycle);
            if let Some(deadline) = self.deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        pending, "poll deadline reached"
                    );
                    close_out(&mut invocations);
                    break;
                }
                wait = wait.min(deadline - elapsed);
            }

            debug!(cycle, pending, wait_ms = wait.as_millis() as u64, "commands still pending");
            tokio::time::sleep(wait).await;
        }

        info!(
            handles = invocations.len(),
            records = invocations.records().count(),
            cycles = cycle,
            "all invocations terminal"
        );
        Ok(invocations)
    }

    /// One pass over a handle's pending records. Returns how many remain pending.
    async fn poll_handle(
        &self,
        client: &dyn RemoteExecution,
        handle: &CommandHandle,
        records: &mut [InvocationRecord],
    ) -> Result<usize> {
        let mut still_pending = 0;
        for record in records.iter_mut().filter(|r| !r.is_terminal()) {
            match poll_record(client, handle, record).await {
                Ok(()) => {}
                Err(err) if self.backoff.should_retry(&err) => {
                    debug!(error = %err, "still pending");
                    still_pending += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(still_pending)
    }
}

async fn poll_record(
    client: &dyn RemoteExecution,
    handle: &CommandHandle,
    record: &mut InvocationRecord,
) -> Result<()> {
    let snapshot = client.get_invocation(handle, record.target_id()).await?;

    let outcome = match InvocationStatus::from_backend(&snapshot.status) {
        InvocationStatus::Pending => {
            return Err(Error::Pending {
                command_id: handle.to_string(),
                target: record.target_id().to_string(),
            })
        }
        InvocationStatus::Success => {
            let raw = snapshot.stdout.unwrap_or_default();
            let value =
                serde_json::from_str(&raw).map_err(|source| Error::InvalidOutput {
                    target: record.target_id().to_string(),
                    source,
                })?;
            Outcome::Success(value)
        }
        InvocationStatus::Failed => {
            let stderr = snapshot.stderr.unwrap_or_default();
            error!(
                instance_id = record.target_id(),
                command_id = %handle,
                reason = %stderr,
                "failed to fetch command output"
            );
            Outcome::Failed(stderr)
        }
        InvocationStatus::TimedOut => Outcome::TimedOut,
        InvocationStatus::Cancelled => Outcome::Cancelled,
    };

    let collected_at = parse_end_time(snapshot.end_time.as_deref());
    debug!(
        instance_id = record.target_id(),
        command_id = %handle,
        status = %snapshot.status,
        "command completed"
    );
    record.complete(outcome, collected_at);
    Ok(())
}

fn parse_end_time(end_time: Option<&str>) -> DateTime<Utc> {
    end_time
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn close_out(invocations: &mut CollectionResult) {
    let now = Utc::now();
    for (handle, records) in invocations.iter_mut() {
        for record in records.iter_mut().filter(|r| !r.is_terminal()) {
            warn!(
                instance_id = record.target_id(),
                command_id = %handle,
                "giving up on pending invocation"
            );
            record.complete(Outcome::TimedOut, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{InvocationSnapshot, Target};
    use crate::error::BackendError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Replays a queue of snapshots per (handle, target); the last one repeats.
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<HashMap<(String, String), VecDeque<InvocationSnapshot>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedClient {
        fn script(&self, handle: &str, target: &str, snapshots: Vec<InvocationSnapshot>) {
            self.script
                .lock()
                .unwrap()
                .insert((handle.into(), target.into()), snapshots.into());
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RemoteExecution for ScriptedClient {
        async fn submit(
            &self,
            _targets: &[Target],
            _commands: &[String],
        ) -> Result<(CommandHandle, InvocationStatus)> {
            unreachable!("poller never submits")
        }

        async fn get_invocation(
            &self,
            handle: &CommandHandle,
            target: &str,
        ) -> Result<InvocationSnapshot> {
            let key = (handle.to_string(), target.to_string());
            self.calls.lock().unwrap().push(key.clone());
            let mut script = self.script.lock().unwrap();
            let queue = script.get_mut(&key).expect("unscripted invocation");
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap())
            } else {
                Ok(queue.front().cloned().unwrap())
            }
        }
    }

    fn snapshot(status: &str, stdout: Option<&str>, stderr: Option<&str>) -> InvocationSnapshot {
        InvocationSnapshot {
            status: status.into(),
            end_time: Some("2024-05-01T12:00:00Z".into()),
            stdout: stdout.map(Into::into),
            stderr: stderr.map(Into::into),
        }
    }

    fn pending_result(handle: &str, targets: &[&str]) -> CollectionResult {
        let mut result = CollectionResult::new();
        result.insert(
            CommandHandle::new(handle),
            targets.iter().map(|t| InvocationRecord::pending(*t)).collect(),
        );
        result
    }

    fn fast() -> InvocationPoller {
        InvocationPoller::new(RetryPolicy::pending().with_base(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_success_parses_stdout() {
        let client = ScriptedClient::default();
        client.script("c-1", "i-1", vec![snapshot("Success", Some(r#"{"a":1}"#), None)]);

        let result = fast().poll(&client, pending_result("c-1", &["i-1"])).await.unwrap();
        let record = result.records().next().unwrap();
        assert_eq!(record.status(), InvocationStatus::Success);
        assert_eq!(record.stdout(), Some(&json!({"a": 1})));
        assert_eq!(record.stderr(), None);
        assert_eq!(
            record.collected_at().unwrap().to_rfc3339(),
            "2024-05-01T12:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_failed_keeps_stderr_only() {
        let client = ScriptedClient::default();
        client.script("c-1", "i-1", vec![snapshot("Failed", Some(""), Some("boom"))]);

        let result = fast().poll(&client, pending_result("c-1", &["i-1"])).await.unwrap();
        let record = result.records().next().unwrap();
        assert_eq!(record.status(), InvocationStatus::Failed);
        assert_eq!(record.stderr(), Some("boom"));
        assert!(record.stdout().is_none());
    }

    #[tokio::test]
    async fn test_pending_then_success_requeries_only_pending() {
        let client = ScriptedClient::default();
        client.script(
            "c-1",
            "i-1",
            vec![
                snapshot("InProgress", None, None),
                snapshot("InProgress", None, None),
                snapshot("Success", Some("[]"), None),
            ],
        );
        client.script("c-1", "i-2", vec![snapshot("Success", Some("{}"), None)]);

        let result = fast()
            .poll(&client, pending_result("c-1", &["i-1", "i-2"]))
            .await
            .unwrap();

        assert!(result.is_terminal());
        // i-2 finished on the first cycle and is not queried again.
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|(_, t)| t == "i-2").count(), 1);
        assert_eq!(calls.iter().filter(|(_, t)| t == "i-1").count(), 3);
    }

    #[tokio::test]
    async fn test_all_terminal_is_free() {
        let client = ScriptedClient::default();
        client.script("c-1", "i-1", vec![snapshot("Cancelled", None, None)]);
        let once = fast().poll(&client, pending_result("c-1", &["i-1"])).await.unwrap();
        assert_eq!(client.call_count(), 1);

        let twice = fast().poll(&client, once.clone()).await.unwrap();
        assert_eq!(client.call_count(), 1);
        assert_eq!(once, twice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_cycles() {
        let client = ScriptedClient::default();
        client.script(
            "c-1",
            "i-1",
            vec![
                snapshot("Pending", None, None),
                snapshot("Pending", None, None),
                snapshot("Pending", None, None),
                snapshot("Success", Some("{}"), None),
            ],
        );
        let start = Instant::now();
        InvocationPoller::default()
            .poll(&client, pending_result("c-1", &["i-1"]))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2 + 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_times_out_pending_records() {
        let client = ScriptedClient::default();
        client.script("c-1", "i-1", vec![snapshot("InProgress", None, None)]);
        client.script("c-1", "i-2", vec![snapshot("Success", Some("{}"), None)]);

        let result = InvocationPoller::default()
            .with_deadline(Some(Duration::from_secs(10)))
            .poll(&client, pending_result("c-1", &["i-1", "i-2"]))
            .await
            .unwrap();

        let statuses: Vec<InvocationStatus> = result.records().map(|r| r.status()).collect();
        assert_eq!(statuses, vec![InvocationStatus::TimedOut, InvocationStatus::Success]);
        let timed_out = result.records().next().unwrap();
        assert!(timed_out.stdout().is_none() && timed_out.stderr().is_none());
    }

    #[tokio::test]
    async fn test_cycle_cap() {
        let client = ScriptedClient::default();
        client.script("c-1", "i-1", vec![snapshot("Delayed", None, None)]);

        let result = fast()
            .with_max_cycles(Some(3))
            .poll(&client, pending_result("c-1", &["i-1"]))
            .await
            .unwrap();
        assert_eq!(client.call_count(), 3);
        assert_eq!(result.records().next().unwrap().status(), InvocationStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_invalid_json_is_an_error() {
        let client = ScriptedClient::default();
        client.script("c-1", "i-1", vec![snapshot("Success", Some("not json"), None)]);

        let err = fast().poll(&client, pending_result("c-1", &["i-1"])).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOutput { ref target, .. } if target == "i-1"));
    }

    #[tokio::test]
    async fn test_backend_error_propagates() {
        struct Broken;

        #[async_trait]
        impl RemoteExecution for Broken {
            async fn submit(
                &self,
                _targets: &[Target],
                _commands: &[String],
            ) -> Result<(CommandHandle, InvocationStatus)> {
                unreachable!()
            }

            async fn get_invocation(
                &self,
                _handle: &CommandHandle,
                _target: &str,
            ) -> Result<InvocationSnapshot> {
                Err(Error::Backend(BackendError::new("InvocationDoesNotExist", "gone")))
            }
        }

        let err = fast().poll(&Broken, pending_result("c-1", &["i-1"])).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }
}
