use super::DispatchError;
use crate::config::types::ProviderConfig;
use crate::render::is_unicode;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// One SMS ready to go out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub text: String,
    /// Record reference, echoed back by the provider as `client-ref`
    pub client_ref: String,
    /// Batch the record came from, sent as `account-ref`
    pub account_ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    #[serde(rename = "message-count", default)]
    pub message_count: Option<String>,
    #[serde(default)]
    pub messages: Vec<ProviderMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMessage {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(rename = "message-id", default)]
    pub message_id: Option<String>,
    pub status: String,
    #[serde(rename = "error-text", default)]
    pub error_text: Option<String>,
}

/// Outbound SMS API. One call to `submit` is exactly one network request.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn submit(&self, message: &OutboundMessage) -> Result<ProviderResponse, DispatchError>;
}

#[derive(Debug, Serialize)]
struct SmsRequestBody<'a> {
    api_key: &'a str,
    api_secret: &'a str,
    from: &'a str,
    to: &'a str,
    text: &'a str,
    #[serde(rename = "type")]
    message_type: &'static str,
    #[serde(rename = "client-ref")]
    client_ref: &'a str,
    #[serde(rename = "account-ref")]
    account_ref: &'a str,
}

/// JSON-over-HTTP SMS provider client
#[derive(Debug)]
pub struct HttpProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    api_secret: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn submit(&self, message: &OutboundMessage) -> Result<ProviderResponse, DispatchError> {
        let body = SmsRequestBody {
            api_key: &self.api_key,
            api_secret: &self.api_secret,
            from: &message.from,
            to: &message.to,
            text: &message.text,
            message_type: if is_unicode(&message.text) {
                "unicode"
            } else {
                "text"
            },
            client_ref: &message.client_ref,
            account_ref: &message.account_ref,
        };

        let response = self.client.post(&self.api_url).json(&body).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DispatchError::throttled("HTTP 429 Too Many Requests"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DispatchError::rejected(
                status.as_u16().to_string(),
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
        }

        let parsed = response.json::<ProviderResponse>().await?;
        Ok(parsed)
    }
}
