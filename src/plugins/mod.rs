//! Plugin contract: capability traits and the slug-keyed registry.
//!
//! A plugin is anything implementing [`Plugin`] plus exactly one capability
//! trait. The registry is built once at startup and passed by reference to
//! whatever needs to resolve plugins by slug.

pub mod local;
pub mod osquery;
pub mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::analysis::AnalysisItem;
use crate::collect::session::Credentials;
use crate::collect::{CollectionResult, InvocationRecord, Target};
use crate::config::HostDiffConfig;
use crate::error::{Error, Result};

/// Free-form plugin options, validated per plugin.
pub type Options = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Target,
    Payload,
    Collection,
    Persistence,
    Analysis,
}

impl PluginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginKind::Target => "target",
            PluginKind::Payload => "payload",
            PluginKind::Collection => "collection",
            PluginKind::Persistence => "persistence",
            PluginKind::Analysis => "analysis",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Descriptive metadata every plugin carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMeta {
    pub title: &'static str,
    pub slug: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub author: &'static str,
    #[serde(rename = "type")]
    pub kind: PluginKind,
}

impl PluginMeta {
    pub const fn new(
        kind: PluginKind,
        title: &'static str,
        slug: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            title,
            slug,
            description,
            version: env!("CARGO_PKG_VERSION"),
            author: "hostdiff",
            kind,
        }
    }
}

pub trait Plugin: Send + Sync {
    fn meta(&self) -> &PluginMeta;

    /// Check `options` and return them normalized (defaults filled in).
    fn validate_options(&self, options: Options) -> Result<Options> {
        Ok(options)
    }
}

/// Validate `options` by round-tripping them through the typed struct `T`.
/// Unknown keys are dropped; type errors become `BadArguments`.
pub fn validate_as<T>(options: Options) -> Result<Options>
where
    T: DeserializeOwned + Serialize,
{
    let typed: T = parse_options(&options)?;
    match serde_json::to_value(typed)? {
        Value::Object(normalized) => Ok(normalized),
        other => Err(Error::BadArguments(format!(
            "options must be an object, got {other}"
        ))),
    }
}

/// Deserialize `options` into `T`, mapping failures to `BadArguments`.
pub fn parse_options<T: DeserializeOwned>(options: &Options) -> Result<T> {
    serde_json::from_value(Value::Object(options.clone()))
        .map_err(|e| Error::BadArguments(format!("invalid plugin options: {e}")))
}

#[async_trait]
pub trait TargetResolver: Plugin {
    /// Targets behind `key`. Zero matches is `TargetNotFound`.
    async fn resolve(&self, key: &str, options: &Options) -> Result<Vec<Target>>;
}

#[async_trait]
pub trait PayloadGenerator: Plugin {
    async fn generate(&self, incident: Option<&str>, options: &Options) -> Result<Vec<String>>;
}

#[async_trait]
pub trait CollectionService: Plugin {
    async fn collect(
        &self,
        targets: &[Target],
        commands: &[String],
        options: &Options,
    ) -> Result<CollectionResult>;
}

#[async_trait]
pub trait PersistenceStore: Plugin {
    async fn get(&self, kind: &str, key: &str) -> Result<Option<Value>>;
    async fn get_all(&self, kind: &str) -> Result<Vec<Value>>;
    async fn save(&self, kind: &str, key: &str, item: &Value) -> Result<()>;
}

#[async_trait]
pub trait AnalysisEngine: Plugin {
    async fn run(
        &self,
        items: Vec<InvocationRecord>,
        baseline: Option<&Value>,
    ) -> Result<Vec<AnalysisItem>>;
}

/// A registered plugin, tagged with its capability.
#[derive(Clone)]
pub enum PluginHandle {
    Target(Arc<dyn TargetResolver>),
    Payload(Arc<dyn PayloadGenerator>),
    Collection(Arc<dyn CollectionService>),
    Persistence(Arc<dyn PersistenceStore>),
    Analysis(Arc<dyn AnalysisEngine>),
}

impl PluginHandle {
    pub fn meta(&self) -> &PluginMeta {
        match self {
            PluginHandle::Target(p) => p.meta(),
            PluginHandle::Payload(p) => p.meta(),
            PluginHandle::Collection(p) => p.meta(),
            PluginHandle::Persistence(p) => p.meta(),
            PluginHandle::Analysis(p) => p.meta(),
        }
    }

    pub fn kind(&self) -> PluginKind {
        match self {
            PluginHandle::Target(_) => PluginKind::Target,
            PluginHandle::Payload(_) => PluginKind::Payload,
            PluginHandle::Collection(_) => PluginKind::Collection,
            PluginHandle::Persistence(_) => PluginKind::Persistence,
            PluginHandle::Analysis(_) => PluginKind::Analysis,
        }
    }
}

/// Slug -> plugin.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, PluginHandle>,
}

macro_rules! typed_lookup {
    ($name:ident, $variant:ident, $trait:ident) => {
        pub fn $name(&self, slug: &str) -> Result<Arc<dyn $trait>> {
            match self.lookup(slug)? {
                PluginHandle::$variant(p) => Ok(Arc::clone(p)),
                other => Err(Error::PluginKindMismatch {
                    slug: slug.to_string(),
                    expected: PluginKind::$variant.as_str(),
                    actual: other.kind().as_str(),
                }),
            }
        }
    };
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every plugin that needs no external backend.
    pub fn builtin(config: &HostDiffConfig) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(PluginHandle::Target(Arc::new(local::LocalTarget::new())))?;
        registry.register(PluginHandle::Payload(Arc::new(local::LocalCommandPayload::new(
            config.local.commands.clone(),
        ))))?;
        let mut osquery_payload = osquery::OsqueryPayload::new(config.osquery.clone());
        if let Some(credentials) = Credentials::from_env() {
            osquery_payload = osquery_payload.with_credentials(credentials);
        }
        registry.register(PluginHandle::Payload(Arc::new(osquery_payload)))?;
        registry.register(PluginHandle::Collection(Arc::new(
            local::LocalShellCollection::new(config.local.command_timeout()),
        )))?;
        registry.register(PluginHandle::Persistence(Arc::new(
            crate::storage::FileStore::new(&config.local.file_directory)
                .with_retry(config.retry.storage()),
        )))?;
        registry.register(PluginHandle::Persistence(Arc::new(
            crate::storage::SqliteStore::new(&config.storage.path)
                .with_retry(config.retry.storage()),
        )))?;
        registry.register(PluginHandle::Analysis(Arc::new(local::SimpleAnalysis::new())))?;
        registry.register(PluginHandle::Analysis(Arc::new(local::ClusterAnalysis::new())))?;
        Ok(registry)
    }

    /// Add a plugin. Slugs are unique.
    pub fn register(&mut self, plugin: PluginHandle) -> Result<()> {
        let slug = plugin.meta().slug.to_string();
        if self.plugins.contains_key(&slug) {
            return Err(Error::DuplicatePlugin(slug));
        }
        debug!(%slug, kind = %plugin.kind(), "registered plugin");
        self.plugins.insert(slug, plugin);
        Ok(())
    }

    fn lookup(&self, slug: &str) -> Result<&PluginHandle> {
        self.plugins
            .get(slug)
            .ok_or_else(|| Error::UnknownPlugin(slug.to_string()))
    }

    typed_lookup!(target, Target, TargetResolver);
    typed_lookup!(payload, Payload, PayloadGenerator);
    typed_lookup!(collection, Collection, CollectionService);
    typed_lookup!(persistence, Persistence, PersistenceStore);
    typed_lookup!(analysis, Analysis, AnalysisEngine);

    /// Metadata of every plugin, ordered by slug.
    pub fn all(&self) -> impl Iterator<Item = &PluginMeta> {
        self.plugins.values().map(PluginHandle::meta)
    }

    /// Metadata of every plugin of one kind.
    pub fn of_kind(&self, kind: PluginKind) -> impl Iterator<Item = &PluginMeta> {
        self.plugins
            .values()
            .filter(move |p| p.kind() == kind)
            .map(PluginHandle::meta)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
