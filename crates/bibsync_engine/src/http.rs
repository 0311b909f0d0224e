//! HTTP client for the Zotero Web API.
//!
//! Wraps `reqwest` behind [`ApiClient`]. Every request to the API carries the
//! `Zotero-API-Version` header and, when configured, the API key. Requests to
//! external upload targets are sent without them.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{ApiClient, ByteStream};
use async_trait::async_trait;
use bibsync_protocol::{
    ApiRequest, ApiResponse, Endpoint, Method, MultipartForm, RequestBody, ResponseHeaders,
    API_VERSION,
};
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::multipart::{Form, Part};
use reqwest::Client;

/// Production API client.
#[derive(Debug)]
pub struct ZoteroApiClient {
    /// Base URL of the API (e.g. "https://api.zotero.org").
    base_url: String,
    api_key: Option<String>,
    client: Client,
    last_error: RwLock<Option<String>>,
}

impl ZoteroApiClient {
    /// Creates a client from the sync configuration.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SyncError::transport_fatal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
            last_error: RwLock::new(None),
        })
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn builder(&self, request: &ApiRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = match &request.endpoint {
            Endpoint::Zotero(path) => {
                let builder = self
                    .client
                    .request(method, format!("{}/{}", self.base_url, path))
                    .header("Zotero-API-Version", API_VERSION);
                match &self.api_key {
                    Some(key) => builder.header("Zotero-API-Key", key),
                    None => builder,
                }
            }
            Endpoint::External(url) => self.client.request(method, url),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
        }
    }

    fn map_error(&self, error: reqwest::Error) -> SyncError {
        *self.last_error.write() = Some(error.to_string());
        if error.is_timeout() {
            SyncError::Timeout
        } else if error.is_connect() || error.is_request() {
            SyncError::transport_retryable(error.to_string())
        } else {
            SyncError::transport_fatal(error.to_string())
        }
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> SyncResult<ApiResponse> {
        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let mut headers = ResponseHeaders::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str(), value);
            }
        }
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        *self.last_error.write() = None;
        tracing::debug!(status, bytes = body.len(), "api response");
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl ApiClient for ZoteroApiClient {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        tracing::debug!(method = request.method.as_str(), path = request.path(), "api request");
        self.execute(self.builder(&request)).await
    }

    async fn upload(&self, request: ApiRequest, form: MultipartForm) -> SyncResult<ApiResponse> {
        let mut multipart = Form::new();
        for (name, value) in form.params {
            multipart = multipart.text(name, value);
        }
        let part = Part::stream(form.file.bytes)
            .file_name(form.file.filename)
            .mime_str(&form.file.mime_type)
            .map_err(|e| SyncError::transport_fatal(format!("invalid mime type: {}", e)))?;
        multipart = multipart.part(form.file.field, part);

        tracing::debug!(path = request.path(), "api upload");
        self.execute(self.builder(&request).multipart(multipart)).await
    }

    async fn download(&self, request: ApiRequest) -> SyncResult<ByteStream> {
        let response = self
            .builder(&request)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| SyncError::transport_retryable(format!("download interrupted: {}", e)))
            })
            .boxed())
    }
}
