use std::fmt;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use vaultguard_core::engine::{CheckRequest, CheckResponse, EngineError, ListObjectsRequest};
use vaultguard_core::{PolicyEngine, Tuple};

use crate::conversions::{self, CheckReply, ListObjectsReply, WriteBody};
use crate::error::ClientError;

#[derive(Clone)]
pub struct HttpEngineOptions {
    pub endpoint: String,
    pub store_id: String,
    pub model_id: Option<String>,
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
}

impl fmt::Debug for HttpEngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpEngineOptions")
            .field("endpoint", &self.endpoint)
            .field("store_id", &self.store_id)
            .field("model_id", &self.model_id)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl HttpEngineOptions {
    pub fn new(endpoint: impl Into<String>, store_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            store_id: store_id.into(),
            model_id: None,
            api_token: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Policy engine reached over its JSON HTTP API.
#[derive(Debug, Clone)]
pub struct HttpPolicyEngine {
    http: reqwest::Client,
    store_url: String,
    model_id: Option<String>,
}

impl HttpPolicyEngine {
    pub fn new(options: HttpEngineOptions) -> Result<Self, ClientError> {
        if options.endpoint.is_empty() {
            return Err(ClientError::InvalidRequest("engine endpoint must not be empty".to_string()));
        }
        if options.store_id.is_empty() {
            return Err(ClientError::InvalidRequest("engine store id must not be empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        if let Some(ref token) = options.api_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::InvalidRequest("invalid api token format".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ClientError::Connection(e.to_string()))?;

        Ok(Self {
            http,
            store_url: format!(
                "{}/stores/{}",
                options.endpoint.trim_end_matches('/'),
                options.store_id
            ),
            model_id: options.model_id,
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, EngineError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/{path}", self.store_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| conversions::transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = conversions::status_to_error(status.as_u16(), &body);
            tracing::debug!(%url, status = status.as_u16(), error = %err, "policy engine returned error");
            return Err(err);
        }

        response
            .json::<R>()
            .await
            .map_err(|e| conversions::transport_error(&e))
    }

    fn write_body(&self, writes: Option<&[Tuple]>, deletes: Option<&[Tuple]>) -> WriteBody {
        WriteBody {
            writes: writes.map(conversions::tuples_to_wire),
            deletes: deletes.map(conversions::tuples_to_wire),
            authorization_model_id: self.model_id.clone(),
        }
    }
}

impl PolicyEngine for HttpPolicyEngine {
    async fn check(&self, request: &CheckRequest) -> Result<CheckResponse, EngineError> {
        let body = conversions::check_to_wire(request, self.model_id.as_deref());
        let reply: CheckReply = self.post("check", &body).await?;
        Ok(CheckResponse {
            allowed: reply.allowed,
        })
    }

    async fn list_objects(&self, request: &ListObjectsRequest) -> Result<Vec<String>, EngineError> {
        let body = conversions::list_objects_to_wire(request, self.model_id.as_deref());
        let reply: ListObjectsReply = self.post("list-objects", &body).await?;
        Ok(reply.objects)
    }

    async fn write_tuples(&self, tuples: &[Tuple]) -> Result<(), EngineError> {
        let body = self.write_body(Some(tuples), None);
        let _: IgnoredAny = self.post("write", &body).await?;
        Ok(())
    }

    async fn delete_tuples(&self, tuples: &[Tuple]) -> Result<(), EngineError> {
        let body = self.write_body(None, Some(tuples));
        let _: IgnoredAny = self.post("write", &body).await?;
        Ok(())
    }
}
