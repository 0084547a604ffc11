use crate::error::DeliveryError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

/// Tokens expiring within this window are refreshed before use.
pub const DEFAULT_REFRESH_WINDOW: Duration = Duration::from_secs(60);

/// Subtracted from the issued lifetime when caching.
pub const DEFAULT_SAFETY_BUFFER: Duration = Duration::from_secs(30);

/// A freshly issued bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Source of new bearer tokens (the controller's token endpoint).
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self) -> Result<IssuedToken, DeliveryError>;
}

type RefreshFuture = Shared<BoxFuture<'static, Result<String, DeliveryError>>>;

#[derive(Default)]
struct TokenState {
    token: Option<String>,
    expires_at: Option<Instant>,
    refresh_in_flight: Option<RefreshFuture>,
}

struct Inner {
    fetcher: Arc<dyn TokenFetcher>,
    refresh_window: Duration,
    safety_buffer: Duration,
    state: Mutex<TokenState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Caches one bearer token and refreshes it single-flight.
///
/// Concurrent callers that find the cache stale while a refresh is already
/// running await that same refresh instead of starting their own. Cloning
/// the manager shares its cache.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(fetcher: Arc<dyn TokenFetcher>) -> Self {
        Self::with_settings(fetcher, DEFAULT_REFRESH_WINDOW, DEFAULT_SAFETY_BUFFER)
    }

    pub fn with_settings(
        fetcher: Arc<dyn TokenFetcher>,
        refresh_window: Duration,
        safety_buffer: Duration,
    ) -> Self {
        TokenManager {
            inner: Arc::new(Inner {
                fetcher,
                refresh_window,
                safety_buffer,
                state: Mutex::new(TokenState::default()),
            }),
        }
    }

    /// Return a token valid beyond the refresh window, fetching one if
    /// needed.
    pub async fn get_token(&self) -> Result<String, DeliveryError> {
        let refresh = {
            let mut state = self.inner.lock();
            if let (Some(token), Some(expires_at)) = (&state.token, state.expires_at) {
                if Instant::now() + self.inner.refresh_window < expires_at {
                    return Ok(token.clone());
                }
            }

            match state.refresh_in_flight.clone() {
                Some(in_flight) => in_flight,
                None => {
                    let refresh = start_refresh(Arc::clone(&self.inner));
                    state.refresh_in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    /// Drop the cached token so the next [`TokenManager::get_token`] refreshes.
    /// Called when a consumer of the token saw a 401.
    pub fn invalidate(&self) {
        let mut state = self.inner.lock();
        state.token = None;
        state.expires_at = None;
        tracing::debug!("cached controller token invalidated");
    }

    pub fn has_cached_token(&self) -> bool {
        self.inner.lock().token.is_some()
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TokenManager")
            .field("cached", &state.token.is_some())
            .field("expires_at", &state.expires_at)
            .field("refreshing", &state.refresh_in_flight.is_some())
            .finish()
    }
}

fn start_refresh(inner: Arc<Inner>) -> RefreshFuture {
    async move {
        let outcome = inner.fetcher.fetch_token().await;

        let mut state = inner.lock();
        state.refresh_in_flight = None;
        match outcome {
            Ok(issued) => {
                let lifetime = issued.expires_in.saturating_sub(inner.safety_buffer);
                state.token = Some(issued.token.clone());
                state.expires_at = Some(Instant::now() + lifetime);
                Ok(issued.token)
            }
            Err(err) => {
                tracing::warn!(error = %err, "controller token refresh failed");
                Err(err)
            }
        }
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_sink::StaticTokenFetcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingFetcher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenFetcher for FailingFetcher {
        async fn fetch_token(&self) -> Result<IssuedToken, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeliveryError::Token("controller down".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let fetcher = Arc::new(
            StaticTokenFetcher::new(Duration::from_secs(3600)).with_delay(Duration::from_millis(50)),
        );
        let manager = TokenManager::new(fetcher.clone());

        let calls = (0..10).map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_token().await })
        });
        let results = futures::future::join_all(calls).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap(), "token-1");
        }
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_proactively_before_expiry() {
        let fetcher = Arc::new(StaticTokenFetcher::new(Duration::from_secs(120)));
        let manager = TokenManager::new(fetcher.clone());

        assert_eq!(manager.get_token().await.unwrap(), "token-1");

        // Cached lifetime is 120s - 30s; refresh starts 60s before that.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(manager.get_token().await.unwrap(), "token-1");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(manager.get_token().await.unwrap(), "token-2");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let fetcher = Arc::new(StaticTokenFetcher::new(Duration::from_secs(3600)));
        let manager = TokenManager::new(fetcher.clone());

        assert_eq!(manager.get_token().await.unwrap(), "token-1");
        assert_eq!(manager.get_token().await.unwrap(), "token-1");
        manager.invalidate();
        assert!(!manager.has_cached_token());
        assert_eq!(manager.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn failed_refresh_is_not_cached() {
        let fetcher = Arc::new(FailingFetcher { calls: AtomicUsize::new(0) });
        let manager = TokenManager::new(fetcher.clone());

        assert!(manager.get_token().await.is_err());
        assert!(manager.get_token().await.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }
}
