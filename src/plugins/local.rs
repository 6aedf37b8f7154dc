//! Plugins that run entirely on this host.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    AnalysisEngine, CollectionService, Options, PayloadGenerator, Plugin, PluginKind, PluginMeta,
    TargetResolver,
};
use crate::analysis::{self, AnalysisItem};
use crate::collect::local::{LocalCollector, LOCALHOST};
use crate::collect::{CollectionResult, InvocationRecord, Target};
use crate::error::Result;

/// Every key resolves to this host.
pub struct LocalTarget {
    meta: PluginMeta,
}

impl LocalTarget {
    pub fn new() -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Target,
                "local",
                "local-target",
                "Targets the local machine.",
            ),
        }
    }
}

impl Default for LocalTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for LocalTarget {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl TargetResolver for LocalTarget {
    async fn resolve(&self, key: &str, _options: &Options) -> Result<Vec<Target>> {
        debug!(target_key = key, "targeting local host");
        Ok(vec![LOCALHOST.to_string()])
    }
}

/// Sends the configured commands unchanged.
pub struct LocalCommandPayload {
    meta: PluginMeta,
    commands: Vec<String>,
}

impl LocalCommandPayload {
    pub fn new(commands: Vec<String>) -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Payload,
                "command",
                "local-command",
                "Sends command without any modification.",
            ),
            commands,
        }
    }
}

impl Plugin for LocalCommandPayload {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl PayloadGenerator for LocalCommandPayload {
    async fn generate(&self, _incident: Option<&str>, _options: &Options) -> Result<Vec<String>> {
        Ok(self.commands.clone())
    }
}

/// Runs the payload as local subprocesses.
pub struct LocalShellCollection {
    meta: PluginMeta,
    collector: LocalCollector,
}

impl LocalShellCollection {
    pub fn new(timeout: Duration) -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Collection,
                "local shell",
                "local-shell-collection",
                "Collects information on the local machine via shell commands.",
            ),
            collector: LocalCollector::new(timeout),
        }
    }
}

impl Plugin for LocalShellCollection {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl CollectionService for LocalShellCollection {
    async fn collect(
        &self,
        _targets: &[Target],
        commands: &[String],
        _options: &Options,
    ) -> Result<CollectionResult> {
        self.collector.collect(commands).await
    }
}

/// Diffs every item against the baseline output.
pub struct SimpleAnalysis {
    meta: PluginMeta,
}

impl SimpleAnalysis {
    pub fn new() -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Analysis,
                "simple",
                "local-simple",
                "Perform simple differential analysis on collection results.",
            ),
        }
    }
}

impl Default for SimpleAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for SimpleAnalysis {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl AnalysisEngine for SimpleAnalysis {
    async fn run(
        &self,
        items: Vec<InvocationRecord>,
        baseline: Option<&Value>,
    ) -> Result<Vec<AnalysisItem>> {
        debug!(items = items.len(), "performing simple local baseline analysis");
        analysis::compare(items, baseline)
    }
}

/// Returns items untouched, with an empty diff.
pub struct ClusterAnalysis {
    meta: PluginMeta,
}

impl ClusterAnalysis {
    pub fn new() -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Analysis,
                "cluster",
                "local-cluster",
                "Perform cluster analysis on collection results.",
            ),
        }
    }
}

impl Default for ClusterAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ClusterAnalysis {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }
}

#[async_trait]
impl AnalysisEngine for ClusterAnalysis {
    async fn run(
        &self,
        items: Vec<InvocationRecord>,
        _baseline: Option<&Value>,
    ) -> Result<Vec<AnalysisItem>> {
        debug!(items = items.len(), "performing local cluster analysis");
        Ok(analysis::passthrough(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::InvocationStatus;
    use crate::error::Error;

    #[tokio::test]
    async fn test_local_target_ignores_key() {
        let targets = LocalTarget::new().resolve("anything", &Options::new()).await.unwrap();
        assert_eq!(targets, vec!["localhost"]);
    }

    #[tokio::test]
    async fn test_local_command_passthrough() {
        let payload = LocalCommandPayload::new(vec!["echo 1".into(), "echo 2".into()]);
        let commands = payload.generate(None, &Options::new()).await.unwrap();
        assert_eq!(commands, vec!["echo 1", "echo 2"]);
    }

    #[tokio::test]
    async fn test_shell_collection() {
        let collection = LocalShellCollection::new(Duration::from_secs(5));
        let result = collection
            .collect(&[], &[r#"echo '{"ok": true}'"#.to_string()], &Options::new())
            .await
            .unwrap();
        let record = result.records().next().unwrap();
        assert_eq!(record.status(), InvocationStatus::Success);
        assert_eq!(record.target_id(), "localhost");
    }

    #[tokio::test]
    async fn test_simple_requires_baseline() {
        let err = SimpleAnalysis::new()
            .run(vec![InvocationRecord::pending("localhost")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadArguments(_)));
    }

    #[test]
    fn test_cluster_passthrough() {
        let items = tokio_test::block_on(
            ClusterAnalysis::new().run(vec![InvocationRecord::pending("localhost")], None),
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].has_differences());
    }
}
