//! Credential-scoped sessions against the remote-execution backend.
//!
//! A [`Session`] is acquired once per top-level operation for an
//! (account, region) pair, passed by reference to every backend call, and
//! dropped at the end of the operation. Secret material is zeroized on drop.

use std::fmt;

use async_trait::async_trait;
use tracing::debug;
use zeroize::Zeroizing;

use crate::config::RemoteConfig;
use crate::error::{Error, Result};

/// Temporary credentials backing a session.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    secret_access_key: Zeroizing<String>,
    session_token: Option<Zeroizing<String>>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: Zeroizing::new(secret_access_key.into()),
            session_token: session_token.map(Zeroizing::new),
        }
    }

    /// Credentials from the standard `AWS_*` environment variables.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the
    /// optional `AWS_SESSION_TOKEN`, as returned by `lookup`. `None` unless both
    /// key parts are present.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let present = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let access_key_id = present("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = present("AWS_SECRET_ACCESS_KEY")?;
        Some(Self::new(
            access_key_id,
            secret_access_key,
            present("AWS_SESSION_TOKEN"),
        ))
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref().map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// An immutable, credential-scoped view of one account/region.
#[derive(Debug)]
pub struct Session {
    pub account: String,
    pub region: String,
    pub role: String,
    pub name: String,
    pub credentials: Credentials,
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!(account = %self.account, region = %self.region, session = %self.name, "releasing session");
    }
}

/// Acquires sessions (the assume-role / token-exchange seam).
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self, account: &str, region: &str) -> Result<Session>;
}

/// Role identifier assumed in `account`.
pub fn role_arn(account: &str, role: &str) -> String {
    format!("arn:aws:iam::{account}:role/{role}")
}

/// Hands out sessions built from fixed credentials and the configured role name.
pub struct StaticSessionProvider {
    role: String,
    credentials: Credentials,
}

impl StaticSessionProvider {
    pub fn new(role: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            role: role.into(),
            credentials,
        }
    }

    /// Assume the configured `[remote] assume_role`.
    pub fn from_config(remote: &RemoteConfig, credentials: Credentials) -> Self {
        Self::new(remote.assume_role.as_str(), credentials)
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn acquire(&self, account: &str, region: &str) -> Result<Session> {
        if account.is_empty() || region.is_empty() {
            return Err(Error::Session {
                account: account.to_string(),
                region: region.to_string(),
                reason: "account and region are required".to_string(),
            });
        }
        let role = role_arn(account, &self.role);
        let name = format!("hostdiff-{}", uuid::Uuid::new_v4());
        debug!(%role, session = %name, %region, "assuming role");
        Ok(Session {
            account: account.to_string(),
            region: region.to_string(),
            role,
            name,
            credentials: self.credentials.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_scopes_role() {
        let provider = StaticSessionProvider::new(
            "Diffy",
            Credentials::new("AKIDEXAMPLE", "secret", Some("token".into())),
        );
        let session = provider.acquire("123456789012", "us-west-2").await.unwrap();
        assert_eq!(session.role, "arn:aws:iam::123456789012:role/Diffy");
        assert_eq!(session.region, "us-west-2");
        assert!(session.name.starts_with("hostdiff-"));
        assert_eq!(session.credentials.secret_access_key(), "secret");
        assert_eq!(session.credentials.session_token(), Some("token"));
    }

    #[tokio::test]
    async fn test_missing_account_is_rejected() {
        let provider = StaticSessionProvider::new("Diffy", Credentials::new("a", "b", None));
        let err = provider.acquire("", "us-west-2").await.unwrap_err();
        assert!(matches!(err, Error::Session { .. }));
    }

    #[test]
    fn test_credentials_from_lookup() {
        use std::collections::HashMap;
        let mut vars = HashMap::new();
        vars.insert("AWS_ACCESS_KEY_ID", "AKIDEXAMPLE");
        assert!(Credentials::from_lookup(|k| vars.get(k).map(|v| v.to_string())).is_none());

        vars.insert("AWS_SECRET_ACCESS_KEY", "secret");
        vars.insert("AWS_SESSION_TOKEN", "");
        let creds = Credentials::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(creds.access_key_id, "AKIDEXAMPLE");
        assert_eq!(creds.secret_access_key(), "secret");
        assert_eq!(creds.session_token(), None);
    }

    #[tokio::test]
    async fn test_provider_from_config_uses_assume_role() {
        let mut remote = RemoteConfig::default();
        remote.assume_role = "Forensics".into();
        let provider = StaticSessionProvider::from_config(&remote, Credentials::new("a", "b", None));
        let session = provider.acquire("123456789012", "us-west-2").await.unwrap();
        assert_eq!(session.role, "arn:aws:iam::123456789012:role/Forensics");
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI", Some("tok".into()));
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("wJalrXUtnFEMI"));
        assert!(!rendered.contains("tok\""));
    }
}
