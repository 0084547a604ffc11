use std::path::PathBuf;

/// Failure of a single delivery attempt (HTTP, key-value push or token
/// acquisition).
///
/// Cloneable so a single in-flight token refresh can hand the same outcome
/// to every waiter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("controller responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("key-value queue error: {0}")]
    KeyValue(String),

    #[error("token acquisition failed: {0}")]
    Token(String),
}

impl DeliveryError {
    /// Authentication failures self-correct after a token refresh and are
    /// excluded from circuit breaker accounting.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            DeliveryError::Unauthorized => true,
            DeliveryError::Status { status, .. } => *status == 401,
            DeliveryError::Transport(msg) | DeliveryError::Token(msg) => {
                msg.contains("Unauthorized") || msg.contains("401")
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.status().map(|s| s.as_u16()) == Some(401) {
            DeliveryError::Unauthorized
        } else {
            DeliveryError::Transport(err.to_string())
        }
    }
}

/// Structural misuse detected while building the pipeline. Never raised at
/// log time.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("client id is required")]
    MissingClientId,

    #[error("client secret is required")]
    MissingClientSecret,

    #[error("controller url is required")]
    MissingControllerUrl,

    #[error("invalid controller url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("cannot read sensitive fields config {path}: {source}")]
    SensitiveFieldsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed sensitive fields config {path}: {source}")]
    SensitiveFieldsFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build http client: {0}")]
    HttpClient(String),

    #[error("failed to build key-value queue: {0}")]
    KeyValue(String),
}

/// Failure installing the global tracing subscriber.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("global tracing subscriber already set: {0}")]
    SubscriberAlreadySet(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("the tracing bridge must be installed from within a tokio runtime")]
    NoRuntime,
}
