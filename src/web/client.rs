use super::api::TemplateRequest;
use crate::render::Template;
use crate::storage::{StorageError, TemplateStore};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("invalid service URL '{0}'")]
    InvalidUrl(String),

    #[error("service returned error status {status}: {message}")]
    ServiceError { status: u16, message: String },
}

impl From<ClientError> for StorageError {
    fn from(e: ClientError) -> Self {
        StorageError::Remote(e.to_string())
    }
}

/// HTTP client for a running `smsbatch run` service
#[derive(Debug, Clone)]
pub struct ServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl ServiceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(|_| ClientError::InvalidUrl(base_url.clone()))?;

        // No overall timeout: a forwarded cycle runs as long as its batches take
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Client for the service listening on `listen` on this host
    pub fn for_listen(listen: &str) -> Result<Self, ClientError> {
        Self::new(base_url_for_listen(listen))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the service to run one dispatch cycle and return its JSON report
    pub async fn check_and_send(&self) -> Result<serde_json::Value, ClientError> {
        let url = format!("{}/checkandsend", self.base_url);
        let response = self.client.post(&url).send().await?;
        let response = error_for_status(response).await?;
        Ok(response.json().await?)
    }

    fn template_url(&self, id: Option<&str>) -> Result<Url, ClientError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?;
            segments.pop_if_empty().push("templates");
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(ClientError::ServiceError {
        status: response.status().as_u16(),
        message: response.text().await.unwrap_or_default(),
    })
}

#[async_trait]
impl TemplateStore for ServiceClient {
    async fn get_template(&self, id: &str) -> Result<Option<Template>, StorageError> {
        let url = self.template_url(Some(id))?;
        let response = self.client.get(url).send().await.map_err(ClientError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = error_for_status(response).await?;
        Ok(Some(response.json().await.map_err(ClientError::from)?))
    }

    async fn list_templates(&self) -> Result<Vec<Template>, StorageError> {
        let url = self.template_url(None)?;
        let response = self.client.get(url).send().await.map_err(ClientError::from)?;
        let response = error_for_status(response).await?;
        Ok(response.json().await.map_err(ClientError::from)?)
    }

    async fn put_template(&self, template: &Template) -> Result<(), StorageError> {
        let url = self.template_url(Some(&template.id))?;
        let request = TemplateRequest {
            body: template.body.clone(),
            sender_field: template.sender_field.clone(),
        };
        let response = self
            .client
            .put(url)
            .json(&request)
            .send()
            .await
            .map_err(ClientError::from)?;
        error_for_status(response).await?;
        Ok(())
    }

    async fn remove_template(&self, id: &str) -> Result<bool, StorageError> {
        let url = self.template_url(Some(id))?;
        let response = self.client.delete(url).send().await.map_err(ClientError::from)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        error_for_status(response).await?;
        Ok(true)
    }
}

/// `0.0.0.0:3000` is reached as `http://127.0.0.1:3000`
pub fn base_url_for_listen(listen: &str) -> String {
    match listen.parse::<SocketAddr>() {
        Ok(mut addr) => {
            if addr.ip().is_unspecified() {
                let loopback = match addr {
                    SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
                };
                addr.set_ip(loopback);
            }
            format!("http://{}", addr)
        }
        Err(_) => format!("http://{}", listen),
    }
}
