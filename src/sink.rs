use crate::error::DeliveryError;
use crate::record::LogRecord;
use async_trait::async_trait;

/// Remote logging endpoint of the controller.
///
/// Implementations transport already-assembled [`LogRecord`]s; they do not
/// retry. The caller feeds every outcome into a circuit breaker and drops the
/// record on failure.
#[async_trait]
pub trait LogApi: Send + Sync {
    /// Deliver a single record (`POST /api/v1/logs`).
    ///
    /// **Returns**
    /// - `Ok(())` if the controller accepted the record.
    /// - `Err(DeliveryError::Unauthorized)` on HTTP 401; the token manager
    ///   drops its cached token in response.
    /// - Any other `Err(..)` for transport failures or non-success statuses.
    async fn send(&self, record: &LogRecord, token: &str) -> Result<(), DeliveryError>;

    /// Deliver a batch as one unit (`POST /api/v1/logs/batch`).
    async fn send_batch(&self, records: &[LogRecord], token: &str) -> Result<(), DeliveryError>;
}

/// List-style key-value store used as a delivery queue (Redis `RPUSH`).
#[async_trait]
pub trait KeyValueQueue: Send + Sync {
    /// Append `payload` to the list at `key`.
    async fn push(&self, key: &str, payload: String) -> Result<(), DeliveryError>;
}

/// Queue key for single records.
pub fn log_key(client_id: &str) -> String {
    format!("logs:{}", client_id)
}

/// Queue key for audit batches.
pub fn audit_key(client_id: &str) -> String {
    format!("audit-logs:{}", client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_are_namespaced_by_client() {
        assert_eq!(log_key("ctrl-app"), "logs:ctrl-app");
        assert_eq!(audit_key("ctrl-app"), "audit-logs:ctrl-app");
    }
}
