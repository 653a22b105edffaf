pub mod http;
pub mod model;
pub mod warehouse;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Failure classification at the raw transport boundary, before façade
/// policy (retry, deadline clamping) is applied.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("rate limited")]
    RateLimited,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("request invalid: {0}")]
    Invalid(String),

    #[error("transport timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    /// Transport-class failures worth another attempt. Auth and validation
    /// failures are not; they will not heal on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Unavailable(_) | Self::Timeout
        )
    }
}

/// Text-in/text-out generative model backend. Implementations must honour
/// the cancellation token and are expected to bound their own outbound
/// concurrency (connection pools).
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError>;
}

/// One warehouse result set. `truncated` is set whenever a row or byte cap
/// cut the data short, so downstream scoring can discount it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub truncated: bool,
}

impl RowSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Parameterised read-only query execution over dealership data.
/// Implementations receive templates that already passed the façade's
/// structural validation; they bind `$name` placeholders from `params`.
#[async_trait]
pub trait WarehouseTransport: Send + Sync {
    async fn execute(
        &self,
        template: &str,
        params: &BTreeMap<String, serde_json::Value>,
        row_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<RowSet, TransportError>;
}
