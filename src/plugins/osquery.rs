//! osquery payload: run the configured osquery queries on the target, fetching
//! an osquery bundle first when `osqueryi` is not available.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{parse_options, validate_as, Options, PayloadGenerator, Plugin, PluginKind, PluginMeta};
use crate::collect::session::Credentials;
use crate::config::OsqueryConfig;
use crate::error::{Error, Result};

const BINARY: &str = "osqueryi";

#[derive(Debug, Default, Serialize, Deserialize)]
struct OsqueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
}

pub struct OsqueryPayload {
    meta: PluginMeta,
    config: OsqueryConfig,
    credentials: Option<Credentials>,
    binary_present: Option<bool>,
}

impl OsqueryPayload {
    pub fn new(config: OsqueryConfig) -> Self {
        Self {
            meta: PluginMeta::new(
                PluginKind::Payload,
                "osquery",
                "osquery-payload",
                "Uses osquery as part of the collection payload.",
            ),
            config,
            credentials: None,
            binary_present: None,
        }
    }

    /// Credentials exported for the bundle download, so the instance's own
    /// credentials are left alone.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Skip the `PATH` lookup for `osqueryi`.
    pub fn with_binary_present(mut self, present: bool) -> Self {
        self.binary_present = Some(present);
        self
    }

    fn binary_present(&self) -> bool {
        self.binary_present.unwrap_or_else(|| on_path(BINARY))
    }

    fn fetch_preamble(&self, workdir: String, options: &OsqueryOptions) -> Result<Vec<String>> {
        let region = options
            .region
            .as_deref()
            .unwrap_or(&self.config.region)
            .to_string();
        let key = options.key.as_deref().unwrap_or(&self.config.key).to_string();
        if region.is_empty() {
            return Err(Error::BadArguments(
                "osquery region required for use with osquery plugin.".into(),
            ));
        }
        if key.is_empty() {
            return Err(Error::BadArguments(
                "osquery key required for use with osquery plugin.".into(),
            ));
        }

        let mut commands = Vec::new();
        if let Some(creds) = &self.credentials {
            commands.push(format!("export AWS_ACCESS_KEY_ID={}", creds.access_key_id));
            commands.push(format!(
                "export AWS_SECRET_ACCESS_KEY={}",
                creds.secret_access_key()
            ));
            if let Some(token) = creds.session_token() {
                commands.push(format!("export AWS_SESSION_TOKEN={token}"));
            }
        }
        commands.extend([
            workdir,
            format!("aws s3 --region {region} cp s3://{key} ./latest.tar.bz2 --quiet"),
            "tar xvf latest.tar.bz2 &>/dev/null".to_string(),
            "export PATH=${PATH}:${HOME}/.local/bin".to_string(),
            "mkdir -p ${HOME}/.local/bin".to_string(),
            "ln -s ./usr/bin/osqueryi ${HOME}/.local/bin/osqueryi".to_string(),
        ]);
        Ok(commands)
    }
}

impl Plugin for OsqueryPayload {
    fn meta(&self) -> &PluginMeta {
        &self.meta
    }

    fn validate_options(&self, options: Options) -> Result<Options> {
        validate_as::<OsqueryOptions>(options)
    }
}

#[async_trait]
impl PayloadGenerator for OsqueryPayload {
    async fn generate(&self, incident: Option<&str>, options: &Options) -> Result<Vec<String>> {
        debug!("generating osquery payload");
        let options: OsqueryOptions = parse_options(options)?;
        let incident = incident.unwrap_or("none");
        let workdir = format!("cd $(mktemp -d -t binaries-{incident}-`date +%s`-XXXXXX)");

        let mut commands = if self.binary_present() {
            vec![workdir]
        } else {
            self.fetch_preamble(workdir, &options)?
        };
        commands.extend(self.config.commands.iter().cloned());
        Ok(commands)
    }
}

fn on_path(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_file(&dir.join(binary))))
        .unwrap_or(false)
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file()).unwrap_or(false)
}
