pub mod provider;
pub mod queue;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use provider::{HttpProvider, OutboundMessage, Provider, ProviderMessage, ProviderResponse};
pub use queue::DispatchQueue;

/// Provider status for an accepted message
pub const STATUS_ACCEPTED: &str = "0";
/// Provider status reporting the caller exceeded its allowed rate
pub const STATUS_THROTTLED: &str = "1";
/// Local status for records that never reached the provider because rendering failed
pub const STATUS_RENDER_FAILED: &str = "render-failed";
/// Local status for records whose request failed in transport
pub const STATUS_NETWORK_FAILED: &str = "network-failed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchErrorKind {
    Throttled,
    ProviderRejected,
    Network,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct DispatchError {
    pub kind: DispatchErrorKind,
    /// Provider status code when the provider answered
    pub status: Option<String>,
    pub message: String,
}

impl DispatchError {
    pub fn throttled(message: impl Into<String>) -> Self {
        Self {
            kind: DispatchErrorKind::Throttled,
            status: Some(STATUS_THROTTLED.to_string()),
            message: message.into(),
        }
    }

    pub fn rejected(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DispatchErrorKind::ProviderRejected,
            status: Some(status.into()),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: DispatchErrorKind::Network,
            status: None,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        DispatchError::network(e.to_string())
    }
}

/// Outcome for one attempted record. Produced exactly once per record, in
/// record order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Value of the record's reference column
    pub reference: String,
    pub recipient: String,
    pub provider_message_id: Option<String>,
    pub error_text: Option<String>,
    pub status_code: String,
}

impl DispatchResult {
    pub fn accepted(reference: String, recipient: String, message: &ProviderMessage) -> Self {
        Self {
            reference,
            recipient: message.to.clone().unwrap_or(recipient),
            provider_message_id: message.message_id.clone(),
            error_text: None,
            status_code: message.status.clone(),
        }
    }

    pub fn failed(
        reference: String,
        recipient: String,
        status_code: impl Into<String>,
        error_text: impl Into<String>,
    ) -> Self {
        Self {
            reference,
            recipient,
            provider_message_id: None,
            error_text: Some(error_text.into()),
            status_code: status_code.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_ACCEPTED
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl DispatchSummary {
    pub fn from_results(
        results: &[DispatchResult],
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            attempted: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            started_at,
            ended_at,
        }
    }
}
