//! Local-process collection: run each command with `sh -c` on this host.
//!
//! Mirrors the remote result shape so flows and analysis don't care where a
//! record came from: one handle per call holding a single `localhost` record,
//! the same as one remote submission to one instance. A successful record's
//! stdout is the array of per-command outputs, in command order.

use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{CollectionResult, CommandHandle, InvocationRecord, Outcome};
use crate::error::{Error, Result};
use crate::logging::redact;

pub const LOCALHOST: &str = "localhost";

#[derive(Debug, Clone, Copy)]
pub struct LocalCollector {
    timeout: Duration,
}

impl Default for LocalCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl LocalCollector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn collect(&self, commands: &[String]) -> Result<CollectionResult> {
        info!(commands = commands.len(), "collecting from local host");
        let handle = CommandHandle::new(format!("local-{}", uuid::Uuid::new_v4()));
        let mut record = InvocationRecord::pending(LOCALHOST);

        let mut outputs = Vec::with_capacity(commands.len());
        let mut outcome = None;
        for command in commands {
            match self.run(command).await? {
                Outcome::Success(value) => outputs.push(value),
                stopped => {
                    outcome = Some(stopped);
                    break;
                }
            }
        }
        record.complete(
            outcome.unwrap_or(Outcome::Success(Value::Array(outputs))),
            Utc::now(),
        );
        debug!(command_id = %handle, status = %record.status(), "local collection finished");

        let mut result = CollectionResult::new();
        result.insert(handle, vec![record]);
        Ok(result)
    }

    async fn run(&self, command: &str) -> Result<Outcome> {
        debug!(command = %redact(command), "running local command");
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(
                    command = %redact(command),
                    timeout_secs = self.timeout.as_secs(),
                    "local command timed out"
                );
                return Ok(Outcome::TimedOut);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            error!(
                code = ?output.status.code(),
                reason = %stderr.trim(),
                "local command failed"
            );
            return Ok(Outcome::Failed(stderr));
        }

        let value = serde_json::from_slice(&output.stdout).map_err(|source| {
            Error::InvalidOutput {
                target: LOCALHOST.to_string(),
                source,
            }
        })?;
        Ok(Outcome::Success(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::InvocationStatus;
    use serde_json::json;

    fn single(result: &CollectionResult) -> &InvocationRecord {
        assert_eq!(result.len(), 1);
        let records: Vec<_> = result.records().collect();
        assert_eq!(records.len(), 1);
        records[0]
    }

    #[tokio::test]
    async fn test_outputs_collected_in_command_order() {
        let commands = vec![
            r#"echo '{"ports": [22]}'"#.to_string(),
            r#"echo '[{"command": "backup"}]'"#.to_string(),
        ];
        let result = LocalCollector::default().collect(&commands).await.unwrap();
        let record = single(&result);
        assert_eq!(record.target_id(), LOCALHOST);
        assert_eq!(record.status(), InvocationStatus::Success);
        assert_eq!(
            record.stdout(),
            Some(&json!([{"ports": [22]}, [{"command": "backup"}]]))
        );
        assert!(result.handles().all(|h| h.as_str().starts_with("local-")));
    }

    #[tokio::test]
    async fn test_failure_stops_the_run() {
        let commands = vec![
            "echo '{}'".to_string(),
            "echo nope >&2; exit 3".to_string(),
            "echo not-json".to_string(),
        ];
        let result = LocalCollector::default().collect(&commands).await.unwrap();
        let record = single(&result);
        assert_eq!(record.status(), InvocationStatus::Failed);
        assert_eq!(record.stderr(), Some("nope\n"));
        assert!(record.stdout().is_none());
    }

    #[tokio::test]
    async fn test_timeout() {
        let collector = LocalCollector::new(Duration::from_millis(200));
        let result = collector.collect(&["sleep 5".to_string()]).await.unwrap();
        let record = single(&result);
        assert_eq!(record.status(), InvocationStatus::TimedOut);
        assert!(record.collected_at().is_some());
    }

    #[tokio::test]
    async fn test_unparseable_output_is_an_error() {
        let err = LocalCollector::default()
            .collect(&["echo not-json".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOutput { .. }));
    }
}
