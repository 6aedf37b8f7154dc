//! Error taxonomy shared by the collection core, plugins and stores.

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Backend error codes that signal rate limiting.
const THROTTLE_CODES: &[&str] = &[
    "ThrottlingException",
    "Throttling",
    "TooManyRequestsException",
    "RequestLimitExceeded",
];

/// Backend error code for an instance the service has no record of.
pub const INVALID_INSTANCE_CODE: &str = "InvalidInstanceId";

/// An error reported by the remote-execution (or inventory) backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_throttle(&self) -> bool {
        THROTTLE_CODES.contains(&self.code.as_str())
    }

    pub fn is_invalid_instance(&self) -> bool {
        self.code == INVALID_INSTANCE_CODE
    }
}

/// How the retry layer treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Backend rate limiting; retried with a bounded attempt count.
    Throttle,
    /// Invocation not yet terminal; retried until a deadline.
    Pending,
    /// Transient persistence fault.
    Storage,
    /// Everything else; propagated immediately.
    Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend throttled the request ({0})")]
    Throttled(BackendError),

    #[error("command {command_id} is not yet complete on {target}")]
    Pending { command_id: String, target: String },

    #[error("could not find target. key: {target_key} slug: {plugin_slug} {context}")]
    TargetNotFound {
        target_key: String,
        plugin_slug: String,
        context: String,
    },

    #[error("error with sent data: {0}")]
    BadArguments(String),

    #[error("backend has no record of this instance ({0})")]
    UnknownInstance(BackendError),

    #[error("backend error ({0})")]
    Backend(BackendError),

    #[error("output from {target} is not valid JSON: {source}")]
    InvalidOutput {
        target: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not acquire session for account {account} in {region}: {reason}")]
    Session {
        account: String,
        region: String,
        reason: String,
    },

    #[error("could not find plugin. slug: {0}")]
    UnknownPlugin(String),

    #[error("plugin {slug} is a {actual} plugin, expected {expected}")]
    PluginKindMismatch {
        slug: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("a plugin with slug {0} is already registered")]
    DuplicatePlugin(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Map a raw backend error onto the taxonomy.
    pub fn from_backend(err: BackendError) -> Self {
        if err.is_invalid_instance() {
            Error::UnknownInstance(err)
        } else if err.is_throttle() {
            Error::Throttled(err)
        } else {
            Error::Backend(err)
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Error::Throttled(_) => RetryClass::Throttle,
            Error::Pending { .. } => RetryClass::Pending,
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                RetryClass::Storage
            }
            Error::Pool(_) => RetryClass::Storage,
            Error::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                RetryClass::Storage
            }
            _ => RetryClass::Fatal,
        }
    }

    /// Collapse an exhausted throttle into the generic backend error.
    pub(crate) fn into_exhausted(self) -> Self {
        match self {
            Error::Throttled(e) => Error::Backend(e),
            other => other,
        }
    }

    /// Construct a `TargetNotFound` with `key: value` pairs describing the lookup.
    pub fn target_not_found(
        target_key: &str,
        plugin_slug: &str,
        context: &serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let context = context
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect::<Vec<_>>()
            .join(" ");
        Error::TargetNotFound {
            target_key: target_key.to_string(),
            plugin_slug: plugin_slug.to_string(),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_codes_classify() {
        let throttled = Error::from_backend(BackendError::new("ThrottlingException", "slow down"));
        assert_eq!(throttled.retry_class(), RetryClass::Throttle);

        let unknown = Error::from_backend(BackendError::new("InvalidInstanceId", "i-404"));
        assert!(matches!(unknown, Error::UnknownInstance(_)));
        assert_eq!(unknown.retry_class(), RetryClass::Fatal);

        let other = Error::from_backend(BackendError::new("AccessDenied", "nope"));
        assert!(matches!(other, Error::Backend(_)));
        assert_eq!(other.retry_class(), RetryClass::Fatal);
    }

    #[test]
    fn test_exhausted_throttle_becomes_backend_error() {
        let err = Error::Throttled(BackendError::new("Throttling", "rate exceeded")).into_exhausted();
        match err {
            Error::Backend(e) => assert_eq!(e.code, "Throttling"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_target_not_found_message() {
        let mut ctx = serde_json::Map::new();
        ctx.insert("region".into(), "us-west-2".into());
        let err = Error::target_not_found("web-asg", "group-target", &ctx);
        assert_eq!(
            err.to_string(),
            "could not find target. key: web-asg slug: group-target region: us-west-2"
        );
        assert_eq!(err.retry_class(), RetryClass::Fatal);
    }

    #[test]
    fn test_bad_arguments_is_fatal() {
        let err = Error::BadArguments("no baseline".into());
        assert_eq!(err.retry_class(), RetryClass::Fatal);
        assert_eq!(err.to_string(), "error with sent data: no baseline");
    }
}
