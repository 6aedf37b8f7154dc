//! Plugins backed by the cloud: group-based targeting and remote collection.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    parse_options, CollectionService, Options, Plugin, PluginKind, PluginMeta, TargetResolver,
};
use crate::collect::client::CommandBackend;
use crate::collect::dispatch::ChunkedDispatcher;
use crate::collect::retry::RetryPolicy;
use crate::collect::session::{Credentials, SessionProvider, StaticSessionProvider};
use crate::collect::{CollectionPipeline, CollectionResult, Target};
use crate::config::HostDiffConfig;
use crate::error::{BackendError, Error, Result};

/// Account/region scoping shared by the cloud plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteOptions {
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub incident_id: Option<String>,
}

/// Resolved, validated scoping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Scope {
    account_number: String,
    region: String,
    incident_id: String,
}

/// Fill in defaults and check the region against the configured list.
fn normalize(
    options: Options,
    accounts: &[String],
    regions: &[String],
    default_region: &str,
) -> Result<Options> {
    let raw: RemoteOptions = parse_options(&options)?;
    let account_number = raw
        .account_number
        .or_else(|| accounts.first().cloned())
        .ok_or_else(|| Error::BadArguments("account_number is required".into()))?;
    let region = raw.region.unwrap_or_else(|| default_region.to_string());
    if !regions.iter().any(|r| *r == region) {
        return Err(Error::BadArguments(format!(
            "region {region} is not one of the configured regions: {}",
            regions.join(", ")
        )));
    }
    let scope = Scope {
        account_number,
        region,
        incident_id: raw.incident_id.unwrap_or_default(),
    };
    match serde_json::to_value(scope)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(Error::BadArguments("options must be an object".into())),
    }
}

/// Looks up the members of a named instance group (an auto-scaling group).
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn describe_group(
        &self,
        name: &str,
        account: &str,
        region: &str,
    ) -> std::result::Result<Option<Vec<String>>, BackendError>;
}

/// Targets every instance in a group.
pub struct GroupTarget {
    meta: PluginMeta,
    directory: Arc<dyn GroupDirectory>,
    throttle: RetryPolicy,
    accounts: Vec<String>,
    regions: Vec<String>,
    default_region: String,
}

impl GroupTarget {
    pub fn new(directory: Arc<dyn GroupDirectory>, config: &HostDiffConfig) -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Target,
                "auto scaling",
                "group-target",
                "Uses instance groups to determine which instances to target for analysis.",
            ),
            directory,
            throttle: config.retry.throttle(),
            accounts: config.accounts.clone(),
            regions: config.regions.clone(),
            default_region: config.default_region.clone(),
        }
    }
}

impl Plugin for GroupTarget {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn validate_options(&self, options: Options) -> Result<Options> {
        normalize(options, &self.accounts, &self.regions, &self.default_region)
    }
}

#[async_trait]
impl TargetResolver for GroupTarget {
    async fn resolve(&self, key: &str, options: &Options) -> Result<Vec<Target>> {
        let scope: Scope = parse_options(options)?;
        debug!(group = key, account = %scope.account_number, region = %scope.region, "fetching group instances");

        let members = self
            .throttle
            .run("describe_group", || async {
                self.directory
                    .describe_group(key, &scope.account_number, &scope.region)
                    .await
                    .map_err(Error::from_backend)
            })
            .await?;

        match members {
            Some(instances) if !instances.is_empty() => Ok(instances),
            _ => Err(Error::target_not_found(key, self.meta.slug, options)),
        }
    }
}

/// Collects through the remote command-execution service.
pub struct RemoteCollection {
    meta: PluginMeta,
    pipeline: CollectionPipeline,
    accounts: Vec<String>,
    regions: Vec<String>,
    default_region: String,
}

impl RemoteCollection {
    pub fn new(
        backend: Arc<dyn CommandBackend>,
        sessions: Arc<dyn SessionProvider>,
        config: &HostDiffConfig,
    ) -> Result<Self> {
        let pipeline = CollectionPipeline::new(backend, sessions)
            .with_dispatcher(ChunkedDispatcher::new(config.remote.chunk_size)?)
            .with_poller(config.retry.poller())
            .with_throttle(config.retry.throttle())
            .with_document(config.remote.document.as_str());
        Ok(Self {
            meta: PluginMeta::new(
                PluginKind::Collection,
                "remote",
                "remote-collection",
                "Uses the remote command service to collect information for analysis.",
            ),
            pipeline,
            accounts: config.accounts.clone(),
            regions: config.regions.clone(),
            default_region: config.default_region.clone(),
        })
    }
}

impl RemoteCollection {
    /// Sessions assume `[remote] assume_role` on top of fixed credentials.
    pub fn with_static_credentials(
        backend: Arc<dyn CommandBackend>,
        credentials: Credentials,
        config: &HostDiffConfig,
    ) -> Result<Self> {
        let sessions = Arc::new(StaticSessionProvider::from_config(&config.remote, credentials));
        Self::new(backend, sessions, config)
    }
}

impl Plugin for RemoteCollection {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn validate_options(&self, options: Options) -> Result<Options> {
        normalize(options, &self.accounts, &self.regions, &self.default_region)
    }
}

#[async_trait]
impl CollectionService for RemoteCollection {
    async fn collect(
        &self,
        targets: &[Target],
        commands: &[String],
        options: &Options,
    ) -> Result<CollectionResult> {
        let scope: Scope = parse_options(options)?;
        self.pipeline
            .collect(
                targets,
                commands,
                &scope.account_number,
                &scope.region,
                &scope.incident_id,
            )
            .await
    }
}
