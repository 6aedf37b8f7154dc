//! The two top-level operations: establish a baseline, analyze against it.
//!
//! Each flow resolves targets, generates the payload, collects, and persists,
//! with every plugin getting the caller's options validated its own way.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::analysis::AnalysisItem;
use crate::collect::InvocationRecord;
use crate::error::{Error, Result};
use crate::plugins::{
    AnalysisEngine, CollectionService, Options, PayloadGenerator, PersistenceStore, Plugin,
    PluginRegistry, TargetResolver,
};

/// Persistence kind of a baseline record.
pub const BASELINE_KIND: &str = "baseline";
/// Persistence kind of a per-instance record.
pub const INSTANCE_KIND: &str = "instance";
/// Persistence kind of an analysis result.
pub const ANALYSIS_KIND: &str = "analysis";

/// Slugs chosen for one run.
#[derive(Debug, Clone)]
pub struct PluginSelection {
    pub target: String,
    pub payload: String,
    pub collection: String,
    pub persistence: String,
    pub analysis: String,
}

impl From<&crate::config::PluginDefaults> for PluginSelection {
    fn from(defaults: &crate::config::PluginDefaults) -> Self {
        Self {
            target: defaults.target.clone(),
            payload: defaults.payload.clone(),
            collection: defaults.collection.clone(),
            persistence: defaults.persistence.clone(),
            analysis: defaults.analysis.clone(),
        }
    }
}

/// Plugins resolved from a [`PluginSelection`].
#[derive(Clone)]
pub struct FlowPlugins {
    pub target: Arc<dyn TargetResolver>,
    pub payload: Arc<dyn PayloadGenerator>,
    pub collection: Arc<dyn CollectionService>,
    pub persistence: Arc<dyn PersistenceStore>,
}

impl FlowPlugins {
    pub fn resolve(registry: &PluginRegistry, selection: &PluginSelection) -> Result<Self> {
        Ok(Self {
            target: registry.target(&selection.target)?,
            payload: registry.payload(&selection.payload)?,
            collection: registry.collection(&selection.collection)?,
            persistence: registry.persistence(&selection.persistence)?,
        })
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct FlowOptions {
    /// Options handed to every plugin (validated per plugin).
    pub options: Options,
    /// Skip every save; reads still happen.
    pub dry_run: bool,
}

impl FlowOptions {
    fn incident_id(&self) -> Option<&str> {
        self.options.get("incident_id").and_then(Value::as_str)
    }

    fn for_plugin<P: Plugin + ?Sized>(&self, plugin: &P) -> Result<Options> {
        let options = plugin.validate_options(self.options.clone())?;
        debug!(slug = plugin.meta().slug, ?options, "validated plugin options");
        Ok(options)
    }
}

/// Baseline records written by [`baseline`], keyed by target key.
#[derive(Debug, Clone, Serialize)]
pub struct BaselineReport {
    pub baselines: Vec<serde_json::Map<String, Value>>,
}

/// Items produced by [`analysis`].
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub analysis: Vec<AnalysisItem>,
}

/// Collect from the first target behind `target_key` and store the result as
/// its baseline.
pub async fn baseline(
    target_key: &str,
    plugins: &FlowPlugins,
    flow: &FlowOptions,
) -> Result<BaselineReport> {
    info!(target_key, dry_run = flow.dry_run, "creating baseline");

    let target_options = flow.for_plugin(plugins.target.as_ref())?;
    let mut targets = plugins.target.resolve(target_key, &target_options).await?;
    targets.truncate(1);

    debug!("generating payload");
    let payload_options = flow.for_plugin(plugins.payload.as_ref())?;
    let commands = plugins
        .payload
        .generate(flow.incident_id(), &payload_options)
        .await?;

    debug!(instances = targets.len(), "collecting baseline data");
    let collection_options = flow.for_plugin(plugins.collection.as_ref())?;
    let results = plugins
        .collection
        .collect(&targets, &commands, &collection_options)
        .await?;

    let mut baselines = Vec::new();
    for (_, records) in results.iter() {
        let Some(record) = records.first() else {
            continue;
        };
        let item = serde_json::to_value(record)?;
        if !flow.dry_run {
            plugins
                .persistence
                .save(BASELINE_KIND, target_key, &item)
                .await?;
        }
        let mut entry = serde_json::Map::new();
        entry.insert(target_key.to_string(), item);
        baselines.push(entry);
    }

    info!(target_key, baselines = baselines.len(), "baseline complete");
    Ok(BaselineReport { baselines })
}

/// Collect from every target behind `target_key` and diff each result
/// against the stored baseline.
pub async fn analysis(
    target_key: &str,
    plugins: &FlowPlugins,
    engine: &dyn AnalysisEngine,
    flow: &FlowOptions,
) -> Result<AnalysisReport> {
    info!(target_key, dry_run = flow.dry_run, "creating analysis");

    let target_options = flow.for_plugin(plugins.target.as_ref())?;
    let targets = plugins.target.resolve(target_key, &target_options).await?;

    let payload_options = flow.for_plugin(plugins.payload.as_ref())?;
    let commands = plugins
        .payload
        .generate(flow.incident_id(), &payload_options)
        .await?;

    debug!(instances = targets.len(), "collecting analysis data");
    let collection_options = flow.for_plugin(plugins.collection.as_ref())?;
    let results = plugins
        .collection
        .collect(&targets, &commands, &collection_options)
        .await?;

    let items: Vec<InvocationRecord> = results.into_records().collect();
    if !flow.dry_run {
        for record in &items {
            let key = instance_key(target_key, record.target_id());
            plugins
                .persistence
                .save(INSTANCE_KIND, &key, &serde_json::to_value(record)?)
                .await?;
        }
    }

    debug!(engine = engine.meta().slug, "running analysis");
    let baseline = plugins.persistence.get(BASELINE_KIND, target_key).await?;
    let analyzed = engine.run(items, baseline.as_ref()).await?;

    if !flow.dry_run {
        plugins
            .persistence
            .save(ANALYSIS_KIND, target_key, &serde_json::to_value(&analyzed)?)
            .await?;
    }

    let differing = analyzed.iter().filter(|i| i.has_differences()).count();
    info!(target_key, items = analyzed.len(), differing, "analysis complete");
    Ok(AnalysisReport { analysis: analyzed })
}

/// Persistence key of one instance's record.
pub fn instance_key(target_key: &str, instance_id: &str) -> String {
    format!("{target_key}-{instance_id}")
}

/// Parse `key=value` pairs into string-valued options.
pub fn parse_pairs<I, S>(pairs: I) -> Result<Options>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut options = Options::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let (key, raw) = pair
            .split_once('=')
            .ok_or_else(|| Error::BadArguments(format!("expected key=value, got {pair}")))?;
        options.insert(key.trim().to_string(), Value::String(raw.to_string()));
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pairs() {
        let options = parse_pairs(["region=us-west-2", "account_number=123456789012", "q=a=b"]).unwrap();
        assert_eq!(options["region"], json!("us-west-2"));
        assert_eq!(options["account_number"], json!("123456789012"));
        assert_eq!(options["q"], json!("a=b"));

        assert!(matches!(parse_pairs(["novalue"]), Err(Error::BadArguments(_))));
    }

    #[test]
    fn test_instance_key() {
        assert_eq!(instance_key("web", "i-123"), "web-i-123");
    }
}
