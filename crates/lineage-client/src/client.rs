//! REST client for the remote process service.
//!
//! Uses reqwest to call the `/api/v1/process` endpoints.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::service::ProcessService;
use crate::types::{
    ProcessEntry, ProcessRequest, StartProcessResponse, SubmitRequest, WaitCondition,
};

/// Process service client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Process service error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// HTTP status of an API error, if any.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Configuration for connecting to a process service instance.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Service URL (e.g., "<http://localhost:8001>").
    pub base_url: String,
    /// API key, sent verbatim in the `Authorization` header.
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl RestConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Process service REST client.
#[derive(Debug)]
pub struct RestProcessService {
    http: reqwest::Client,
    base_url: String,
}

impl RestProcessService {
    /// Create a new process service client.
    pub fn new(config: &RestConfig) -> Result<Self, ClientError> {
        if config.base_url.is_empty() {
            return Err(ClientError::Config("base_url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            if key.is_empty() {
                return Err(ClientError::Config("api_key is empty".into()));
            }
            let key_val = HeaderValue::from_str(key)
                .map_err(|_| ClientError::Config("Invalid api_key format".into()))?;
            headers.insert(AUTHORIZATION, key_val);
        }

        // reqwest is built with rustls-no-provider; `Err` means a provider is
        // already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    /// Build the API v1 URL for a given path.
    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Percent-encode a query parameter value.
    pub(crate) fn encode_query_value(value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        for b in value.bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
                out.push(char::from(b));
            } else {
                let _ = write!(out, "%{b:02X}");
            }
        }
        out
    }

    /// Check HTTP response status, returning error for non-success codes.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn submit_form(request: SubmitRequest) -> Result<Form, ClientError> {
        let request_json = serde_json::to_vec(&request.request)?;
        let mut form = Form::new().part(
            "request",
            Part::bytes(request_json).mime_str("application/json")?,
        );
        for (name, value) in request.text_fields() {
            form = form.text(name, value);
        }
        if let Some(archive) = request.archive {
            form = form.part(
                "archive",
                Part::bytes(archive)
                    .file_name("payload.zip")
                    .mime_str("application/octet-stream")?,
            );
        }
        Ok(form)
    }
}

#[async_trait]
impl ProcessService for RestProcessService {
    async fn submit(&self, request: SubmitRequest) -> Result<StartProcessResponse, ClientError> {
        let url = self.api_url("/process");
        let form = Self::submit_form(request)?;
        let resp = self.http.post(&url).multipart(form).send().await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn fork(
        &self,
        parent: Uuid,
        request: &ProcessRequest,
        sync: bool,
    ) -> Result<StartProcessResponse, ClientError> {
        let url = format!("{}?sync={sync}", self.api_url(&format!("/process/{parent}/fork")));
        let resp = self.http.post(&url).json(request).send().await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn get_status(&self, id: Uuid) -> Result<ProcessEntry, ClientError> {
        let url = self.api_url(&format!("/process/{id}"));
        let resp = self.http.get(&url).send().await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn list_children(
        &self,
        id: Uuid,
        tags: &[String],
    ) -> Result<Vec<ProcessEntry>, ClientError> {
        let mut url = self.api_url(&format!("/process/{id}/subprocess"));
        for (i, tag) in tags.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            let _ = write!(url, "{sep}tags={}", Self::encode_query_value(tag));
        }
        let resp = self.http.get(&url).send().await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    async fn kill(&self, id: Uuid) -> Result<(), ClientError> {
        let url = self.api_url(&format!("/process/{id}"));
        let resp = self.http.delete(&url).send().await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn set_wait_condition(
        &self,
        id: Uuid,
        condition: &WaitCondition,
    ) -> Result<(), ClientError> {
        let url = self.api_url(&format!("/process/{id}/wait"));
        let resp = self.http.post(&url).json(condition).send().await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn download_output_artifact(
        &self,
        id: Uuid,
        name: &str,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let url = self.api_url(&format!("/process/{id}/attachment/{name}"));
        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(instance_id = %id, name, "Attachment not found");
            return Ok(None);
        }
        let resp = Self::check_status(resp).await?;
        Ok(Some(resp.bytes().await?.to_vec()))
    }
}
