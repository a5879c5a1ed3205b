//! Remote datastore API client.
//!
//! `HttpRemoteStore` talks to a PostgREST-style REST endpoint
//! (`/rest/v1/{table}`) with `apikey` + bearer authentication. Every write
//! carries the operation's idempotency token both as an `Idempotency-Key`
//! header and, on inserts, as the `client_ref` column, so a replayed insert
//! that hits the unique constraint resolves to the row stored the first time.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{ConfigError, RemoteError};
use crate::remote::{RecordKey, RemoteStore};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight health check.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const REST_PREFIX: &str = "/rest/v1";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote store URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with(REST_PREFIX) {
        url.truncate(url.len() - REST_PREFIX.len());
    }

    // Again, in case "/rest/v1/" was present
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a `RemoteError`.
fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unreachable(format!("Cannot reach remote store at {url}"));
    }
    if err.is_timeout() {
        return RemoteError::Unreachable(format!("Connection to {url} timed out"));
    }
    if err.is_decode() {
        return RemoteError::InvalidResponse(err.to_string());
    }
    RemoteError::Unreachable(format!("Network error communicating with {url}: {err}"))
}

fn default_message(status: u16) -> String {
    match status {
        401 => "API key is invalid or expired".to_string(),
        403 => "API key not authorized for this table".to_string(),
        404 => "Remote store endpoint not found".to_string(),
        409 => "Conflicts with an existing row".to_string(),
        s if s >= 500 => "Remote store server error".to_string(),
        _ => "Unexpected response from remote store".to_string(),
    }
}

/// Pull the most useful message out of an error body. Keeps validation
/// details so they reach the queue item and the user notification.
fn error_detail(status: u16, body: &str) -> String {
    let body = body.trim();
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_message(status));
        return match json.get("details").filter(|d| !d.is_null()) {
            Some(Value::String(details)) => format!("{message}: {details}"),
            Some(details) => format!("{message}: {details}"),
            None => message,
        };
    }
    if body.is_empty() {
        default_message(status)
    } else {
        format!("{}: {body}", default_message(status))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
fn status_error(status: u16, body: &str) -> RemoteError {
    let message = error_detail(status, body);
    match status {
        401 | 403 => RemoteError::Unauthorized(message),
        408 | 429 => RemoteError::Server { status, message },
        s if s >= 500 => RemoteError::Server { status: s, message },
        s => RemoteError::Rejected { status: s, message },
    }
}

/// First row of a PostgREST representation (array or single object).
fn first_row(body: Value) -> Option<Value> {
    match body {
        Value::Array(rows) => rows.into_iter().next(),
        Value::Object(_) => Some(body),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpRemoteStore {
    pub fn new(url: &str, api_key: &str) -> Result<Self, ConfigError> {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("remote_url must not be empty".into()));
        }
        if api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("api_key must not be empty".into()));
        }
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_url(url),
            api_key: api_key.trim().to_string(),
        })
    }

    /// Build from `remote_url` / `api_key` of the sync config.
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        let url = config
            .remote_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("remote_url is not configured".into()))?;
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("api_key is not configured".into()))?;
        Self::new(url, api_key)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}{REST_PREFIX}/{table}", self.base_url)
    }

    fn request(&self, method: Method, url: &str, client_ref: Option<&str>) -> RequestBuilder {
        let req = self
            .client
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json");
        match client_ref {
            Some(r) => req.header("Idempotency-Key", r),
            None => req,
        }
    }

    /// Send and decode. Empty bodies decode to `Value::Null`.
    async fn send(&self, req: RequestBuilder) -> Result<Value, RemoteError> {
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = status_error(status.as_u16(), &body);
            debug!(status = status.as_u16(), error = %err, "Remote store request failed");
            return Err(err);
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| RemoteError::InvalidResponse(format!("Invalid JSON from remote store: {e}")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn select(&self, table: &str, key: &RecordKey) -> Result<Option<Value>, RemoteError> {
        let req = self
            .request(Method::GET, &self.table_url(table), None)
            .query(&key.to_query())
            .query(&[("limit", "1")]);
        Ok(first_row(self.send(req).await?))
    }

    async fn select_all(&self, table: &str, store_id: &str) -> Result<Vec<Value>, RemoteError> {
        let key = RecordKey::new().eq("store_id", store_id);
        let req = self
            .request(Method::GET, &self.table_url(table), None)
            .query(&key.to_query());
        match self.send(req).await? {
            Value::Array(rows) => Ok(rows),
            Value::Null => Ok(Vec::new()),
            other => Err(RemoteError::InvalidResponse(format!(
                "expected rows from {table}, got {other}"
            ))),
        }
    }

    async fn insert(&self, table: &str, record: Value, client_ref: Option<&str>) -> Result<Value, RemoteError> {
        let mut record = record;
        if let (Some(r), Value::Object(map)) = (client_ref, &mut record) {
            map.insert("client_ref".into(), Value::String(r.to_string()));
        }
        let req = self
            .request(Method::POST, &self.table_url(table), client_ref)
            .header("Prefer", "return=representation")
            .json(&record);

        match self.send(req).await {
            Ok(body) => first_row(body)
                .ok_or_else(|| RemoteError::InvalidResponse(format!("insert into {table} returned no row"))),
            // Unique violation on client_ref: an earlier attempt already landed.
            Err(RemoteError::Rejected { status: 409, message }) => match client_ref {
                Some(r) => {
                    info!(table, client_ref = r, "Insert already applied, resolving existing row");
                    let key = RecordKey::new().eq("client_ref", r);
                    self.select(table, &key)
                        .await?
                        .ok_or(RemoteError::Rejected { status: 409, message })
                }
                None => Err(RemoteError::Rejected { status: 409, message }),
            },
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        table: &str,
        key: &RecordKey,
        fields: Value,
        client_ref: Option<&str>,
    ) -> Result<Option<Value>, RemoteError> {
        let req = self
            .request(Method::PATCH, &self.table_url(table), client_ref)
            .query(&key.to_query())
            .header("Prefer", "return=representation")
            .json(&fields);
        Ok(first_row(self.send(req).await?))
    }

    async fn delete(&self, table: &str, key: &RecordKey, client_ref: Option<&str>) -> Result<bool, RemoteError> {
        if key.is_empty() {
            warn!(table, "Refusing unfiltered delete");
            return Err(RemoteError::Rejected {
                status: 400,
                message: "delete requires at least one filter".into(),
            });
        }
        let req = self
            .request(Method::DELETE, &self.table_url(table), client_ref)
            .query(&key.to_query())
            .header("Prefer", "return=representation");
        Ok(first_row(self.send(req).await?).is_some())
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        let url = format!("{}{REST_PREFIX}/", self.base_url);
        let resp = self
            .request(Method::GET, &url, None)
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        // Some deployments disable the root listing; a 404 still proves
        // the server answered and accepted the key.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status.as_u16(), &body))
    }
}
