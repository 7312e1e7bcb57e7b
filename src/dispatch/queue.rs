use super::{
    DispatchError, DispatchErrorKind, DispatchResult, OutboundMessage, Provider, ProviderResponse,
    STATUS_ACCEPTED, STATUS_NETWORK_FAILED, STATUS_THROTTLED,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rate-limited front of the provider.
///
/// Every attempt, retries included, waits for a permit from one limiter
/// releasing `tps` requests per second with no burst, so N sends take at
/// least (N-1)/tps seconds however many callers share the queue.
pub struct DispatchQueue {
    provider: Arc<dyn Provider>,
    limiter: Arc<DefaultDirectRateLimiter>,
    max_attempts: Option<u32>,
}

impl DispatchQueue {
    /// `max_attempts` of `None` keeps retrying a throttled message until the
    /// provider accepts or rejects it.
    pub fn new(provider: Arc<dyn Provider>, tps: u32, max_attempts: Option<u32>) -> Self {
        let rate = NonZeroU32::new(tps).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rate).allow_burst(NonZeroU32::MIN);

        Self {
            provider,
            limiter: Arc::new(RateLimiter::direct(quota)),
            max_attempts,
        }
    }

    /// Send one message, retrying the identical payload while the provider
    /// answers with a throttle signal.
    pub async fn send(&self, message: &OutboundMessage) -> Result<ProviderResponse, DispatchError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.limiter.until_ready().await;

            let err = match self.provider.submit(message).await {
                Ok(response) => match check_status(&response) {
                    Ok(()) => return Ok(response),
                    Err(e) => e,
                },
                Err(e) => e,
            };

            if err.kind != DispatchErrorKind::Throttled {
                return Err(err);
            }

            if let Some(max) = self.max_attempts {
                if attempt >= max {
                    warn!(
                        client_ref = %message.client_ref,
                        attempts = attempt,
                        "Provider still throttling, giving up on message"
                    );
                    return Err(err);
                }
            }

            debug!(
                client_ref = %message.client_ref,
                attempt,
                "Provider throttled request, queueing it again"
            );
        }
    }

    /// Send one message and fold the outcome into a per-record result
    pub async fn dispatch(&self, message: &OutboundMessage) -> DispatchResult {
        match self.send(message).await {
            Ok(response) => match response.messages.first() {
                Some(first) => {
                    DispatchResult::accepted(message.client_ref.clone(), message.to.clone(), first)
                }
                None => DispatchResult::failed(
                    message.client_ref.clone(),
                    message.to.clone(),
                    STATUS_NETWORK_FAILED,
                    "provider response contained no messages",
                ),
            },
            Err(e) => {
                let status = match e.kind {
                    DispatchErrorKind::Network => STATUS_NETWORK_FAILED.to_string(),
                    _ => e.status.clone().unwrap_or_else(|| STATUS_NETWORK_FAILED.to_string()),
                };
                DispatchResult::failed(message.client_ref.clone(), message.to.clone(), status, e.message)
            }
        }
    }
}

fn check_status(response: &ProviderResponse) -> Result<(), DispatchError> {
    let first = response
        .messages
        .first()
        .ok_or_else(|| DispatchError::network("provider response contained no messages"))?;

    match first.status.as_str() {
        STATUS_ACCEPTED => Ok(()),
        STATUS_THROTTLED => Err(DispatchError::throttled(
            first.error_text.clone().unwrap_or_else(|| "Throttled".to_string()),
        )),
        other => Err(DispatchError::rejected(
            other,
            first
                .error_text
                .clone()
                .unwrap_or_else(|| format!("provider status {}", other)),
        )),
    }
}
