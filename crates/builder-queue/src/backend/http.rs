//! REST provisioning backend.
//!
//! - `POST {base_url}/builders` returns `{"id", "host", "port"}` for a new builder
//! - `DELETE {base_url}/builders/{id}` tears it down
//! - Optional bearer token authentication

use std::time::Duration;

use async_trait::async_trait;

use super::{BackendError, ProvisioningBackend};
use crate::builder::BuilderHandle;
use crate::version::user_agent;

#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl HttpBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Some(ref token) = config.token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| BackendError::Other(format!("invalid backend token: {}", e)))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent()) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Other(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ProvisioningBackend for HttpBackend {
    async fn create_builder(&self) -> Result<BuilderHandle, BackendError> {
        let response = self
            .client
            .post(format!("{}/builders", self.base_url))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let builder = Self::check_status(response)
            .await?
            .json::<BuilderHandle>()
            .await
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?;

        tracing::debug!(builder_id = %builder, address = %builder.address(), "Backend created builder");
        Ok(builder)
    }

    async fn destroy_builder(&self, builder: &BuilderHandle) -> Result<(), BackendError> {
        let response = self
            .client
            .delete(format!("{}/builders/{}", self.base_url, builder.id()))
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        Self::check_status(response).await?;
        tracing::debug!(builder_id = %builder, "Backend destroyed builder");
        Ok(())
    }
}
