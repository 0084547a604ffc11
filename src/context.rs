//! Per-call-chain ambient context.
//!
//! Every call chain (typically one incoming request) owns a [`LogContext`]
//! held in a Tokio task-local cell. Code running inside the chain reads and
//! extends it without passing it around; unrelated chains never observe each
//! other's writes.
//!
//! A chain starts at [`scope`], or at [`ensure`] which opens one only when
//! the caller is not already inside a chain. Every entry point that calls
//! [`set`] (a request handler, a job runner) must run under one of them:
//! outside any chain [`set`] and [`clear`] change nothing, `set` reports
//! that with `false` and a warning, and [`get`] returns an empty context.
//! Tasks started with
//! `tokio::spawn` do not inherit task-locals; wrap their future with
//! [`propagate`] to carry a snapshot across.

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static CURRENT: RefCell<LogContext>;
}

/// Ambient fields attached to every record emitted within a call chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    /// Bearer token of the caller, decoded for identity hints only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_system_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_system_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_display_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_category: Option<String>,

    /// Free-form fields merged key by key.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

macro_rules! overlay {
    ($dst:expr, $src:expr; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

impl LogContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay every field `partial` sets; fields it leaves empty keep
    /// their current value.
    pub fn merge(&mut self, partial: LogContext) {
        overlay!(self, partial;
            correlation_id, request_id, user_id, session_id, ip_address, user_agent,
            referer, token, application, application_id, environment,
            source_key, source_display_name, external_system_key,
            external_system_display_name, record_key, record_display_name,
            credential_id, credential_type, request_size, response_size, duration_ms,
            error_category, http_status_category,
        );
        self.extra.extend(partial.extra);
    }

    pub fn is_empty(&self) -> bool {
        *self == LogContext::default()
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Collect request metadata from incoming HTTP headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let ip_address = header("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|hop| hop.trim().to_string()))
            .filter(|v| !v.is_empty())
            .or_else(|| header("x-real-ip"));

        let token = header("authorization").and_then(|v| {
            let (scheme, rest) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| rest.trim().to_string())
        });

        LogContext {
            correlation_id: header("x-correlation-id"),
            request_id: header("x-request-id"),
            user_agent: header("user-agent"),
            referer: header("referer"),
            ip_address,
            token,
            ..LogContext::default()
        }
    }
}

/// Run `fut` as a new call chain whose context starts as `ctx`.
pub async fn scope<F: Future>(ctx: LogContext, fut: F) -> F::Output {
    CURRENT.scope(RefCell::new(ctx), fut).await
}

/// Run `fut` with the current context merged with `partial`. The merged view
/// is visible only inside `fut`; the enclosing chain's context is untouched
/// once it returns.
pub async fn run_scoped<F: Future>(partial: LogContext, fut: F) -> F::Output {
    let mut ctx = get();
    ctx.merge(partial);
    CURRENT.scope(RefCell::new(ctx), fut).await
}

/// Run `fut` inside the caller's chain, or inside a new empty chain when
/// there is none. Writes made by `fut` stay visible to an enclosing chain.
pub async fn ensure<F: Future>(fut: F) -> F::Output {
    if in_scope() {
        fut.await
    } else {
        scope(LogContext::default(), fut).await
    }
}

/// Whether the current task runs inside a call chain.
pub fn in_scope() -> bool {
    CURRENT.try_with(|_| ()).is_ok()
}

/// Merge `partial` into the current chain's context. Returns `false`, and
/// drops `partial`, when called outside any chain.
pub fn set(partial: LogContext) -> bool {
    let applied = CURRENT
        .try_with(|cell| cell.borrow_mut().merge(partial))
        .is_ok();
    if !applied {
        tracing::warn!("log context set outside of a call chain; wrap the entry point in context::scope or context::ensure");
    }
    applied
}

/// Snapshot of the current chain's context, empty outside any chain.
pub fn get() -> LogContext {
    CURRENT
        .try_with(|cell| cell.borrow().clone())
        .unwrap_or_default()
}

/// Reset the current chain's context to empty.
pub fn clear() {
    let _ = CURRENT.try_with(|cell| *cell.borrow_mut() = LogContext::default());
}

/// Wrap `fut` so that, wherever it is polled (for instance after
/// `tokio::spawn`), it sees a snapshot of the caller's current context.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    CURRENT.scope(RefCell::new(get()), fut)
}
