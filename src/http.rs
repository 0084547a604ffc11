use crate::error::{ConfigError, DeliveryError};
use crate::record::LogRecord;
use crate::sink::LogApi;
use crate::token::{IssuedToken, TokenFetcher};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

pub const LOGS_PATH: &str = "/api/v1/logs";
pub const LOGS_BATCH_PATH: &str = "/api/v1/logs/batch";
pub const TOKEN_PATH: &str = "/api/v1/auth/token";

/// Lifetime assumed when the token endpoint omits `expiresIn`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Configuration for [`ControllerClient`].
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Base URL without path, e.g. "https://controller.example.com"
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

/// HTTP client for the controller's logging and token endpoints.
///
/// Implements [`LogApi`] for record delivery and [`TokenFetcher`] for
/// client-credential token acquisition.
#[derive(Clone)]
pub struct ControllerClient {
    client: Client,
    config: ControllerConfig,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    logs: &'a [LogRecord],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload {
    token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// The token endpoint answers either with the payload itself or wrapped
/// in a `data` envelope.
#[derive(Deserialize)]
#[serde(untagged)]
enum TokenResponse {
    Bare(TokenPayload),
    Wrapped { data: TokenPayload },
}

impl ControllerClient {
    /// Construct a client with the configured request timeout.
    ///
    /// **Returns**
    /// - `Err(ConfigError::HttpClient)` if the underlying client cannot be
    ///   built (TLS backend initialisation).
    pub fn new(config: ControllerConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        token: &str,
    ) -> Result<(), DeliveryError> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .bearer_auth(token)
            .header("X-Client-Id", &self.config.client_id)
            .json(body)
            .send()
            .await?;
        check_status(resp).await.map(|_| ())
    }
}

async fn check_status(resp: Response) -> Result<Response, DeliveryError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(DeliveryError::Unauthorized);
    }
    let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
    Err(DeliveryError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl LogApi for ControllerClient {
    async fn send(&self, record: &LogRecord, token: &str) -> Result<(), DeliveryError> {
        self.post_json(LOGS_PATH, record, token).await
    }

    async fn send_batch(&self, records: &[LogRecord], token: &str) -> Result<(), DeliveryError> {
        self.post_json(LOGS_BATCH_PATH, &BatchBody { logs: records }, token).await
    }
}

#[async_trait]
impl TokenFetcher for ControllerClient {
    async fn fetch_token(&self) -> Result<IssuedToken, DeliveryError> {
        let resp = self
            .client
            .post(self.endpoint(TOKEN_PATH))
            .header("X-Client-Id", &self.config.client_id)
            .header("X-Client-Secret", &self.config.client_secret)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let payload = match resp.json::<TokenResponse>().await {
            Ok(TokenResponse::Bare(p)) | Ok(TokenResponse::Wrapped { data: p }) => p,
            Err(e) => return Err(DeliveryError::Token(format!("unexpected token response: {}", e))),
        };
        Ok(IssuedToken {
            token: payload.token,
            expires_in: payload
                .expires_in
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }
}
