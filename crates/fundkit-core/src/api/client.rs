//! Client for the hosted backend's REST interface.
//!
//! This module provides `SupabaseClient`, which signs admins in and backs the
//! kit service: table rows go through the `/rest/v1` endpoints, kit images
//! through the `/storage/v1` object API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::SessionData;
use crate::config::Config;
use crate::store::{Filter, ObjectStorage, Order, Row, RowStore, StoreError, Table};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Header carrying the project API key on every request
const API_KEY_HEADER: &str = "apikey";

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
    user: AuthUser,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

#[derive(Serialize)]
struct PasswordGrant<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshGrant<'a> {
    refresh_token: &'a str,
}

/// Backend client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    bucket: String,
    token: Option<String>,
    native_cascade: bool,
}

impl SupabaseClient {
    /// Create a new client for the project at `base_url`
    pub fn new(base_url: &str, api_key: &str, bucket: &str) -> Result<Self> {
        Self::with_timeout(base_url, api_key, bucket, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, api_key: &str, bucket: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            bucket: bucket.to_string(),
            token: None,
            native_cascade: false,
        })
    }

    /// Build a client from the loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let url = config
            .supabase_url
            .as_deref()
            .context("Backend URL is not configured (set SUPABASE_URL)")?;
        let key = config
            .anon_key
            .as_deref()
            .context("Backend API key is not configured (set SUPABASE_ANON_KEY)")?;

        let mut client = Self::with_timeout(url, key, &config.media_bucket, config.request_timeout())?;
        client.native_cascade = config.store_cascades_deletes;
        Ok(client)
    }

    /// Create a new client with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            token: Some(token),
            ..self.clone() // Cheap clone, shares connection pool
        }
    }

    /// Sign in with email and password and return session data
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<SessionData> {
        let url = format!("{}/auth/v1/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("grant_type", "password")])
            .header(API_KEY_HEADER, &self.api_key)
            .json(&PasswordGrant { email, password })
            .send()
            .await
            .context("Failed to send authentication request")?;

        let response = Self::check_response(response).await?;
        let auth: AuthResponse = response.json().await.context("Failed to parse auth response")?;
        Ok(Self::session_from(auth, email))
    }

    /// Exchange a refresh token for a new session
    pub async fn refresh_session(&self, refresh_token: &str, email: &str) -> Result<SessionData> {
        let url = format!("{}/auth/v1/token", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("grant_type", "refresh_token")])
            .header(API_KEY_HEADER, &self.api_key)
            .json(&RefreshGrant { refresh_token })
            .send()
            .await
            .context("Failed to send session refresh request")?;

        let response = Self::check_response(response).await?;
        let auth: AuthResponse = response.json().await.context("Failed to parse refresh response")?;
        Ok(Self::session_from(auth, email))
    }

    fn session_from(auth: AuthResponse, email: &str) -> SessionData {
        SessionData {
            access_token: auth.access_token,
            refresh_token: auth.refresh_token,
            user_id: auth.user.id,
            email: auth.user.email.unwrap_or_else(|| email.to_string()),
            expires_at: Utc::now() + chrono::Duration::seconds(auth.expires_in),
        }
    }

    fn rest_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.base_url, self.bucket, key)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let bearer = self.token.as_deref().unwrap_or(&self.api_key);
        let value = |v: &str| {
            header::HeaderValue::from_str(v)
                .map_err(|_| ApiError::InvalidResponse("API key or token is not a valid header value".to_string()))
        };

        let mut headers = header::HeaderMap::new();
        headers.insert(API_KEY_HEADER, value(&self.api_key)?);
        headers.insert(header::AUTHORIZATION, value(&format!("Bearer {}", bearer))?);
        Ok(headers)
    }

    /// Query parameters selecting rows for `filter`
    fn filter_params(filter: &Filter) -> Vec<(String, String)> {
        match filter {
            Filter::All => Vec::new(),
            Filter::Eq(column, value) => vec![(column.to_string(), format!("eq.{}", value))],
            Filter::In(column, values) => {
                let quoted: Vec<String> = values
                    .iter()
                    .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
                    .collect();
                vec![(column.to_string(), format!("in.({})", quoted.join(",")))]
            }
        }
    }

    fn order_param(order: Order) -> String {
        let direction = if order.ascending { "asc" } else { "desc" };
        format!("{}.{}", order.column, direction)
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            // Rate limited - signal to retry
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, retrying with exponential backoff while rate limited
    async fn execute<F>(&self, build: F, what: &str) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = build().headers(self.auth_headers()?).send().await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(request = what, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }
}

#[async_trait]
impl RowStore for SupabaseClient {
    async fn insert(&self, table: Table, fields: Row) -> Result<Row, StoreError> {
        let url = self.rest_url(table);
        let body = Value::Object(fields);
        let response = self
            .execute(
                || {
                    self.client
                        .post(&url)
                        .header("Prefer", "return=representation")
                        .json(&body)
                },
                "insert",
            )
            .await?;

        let mut rows: Vec<Row> = response.json().await.map_err(ApiError::from)?;
        debug!(table = %table, "Inserted row");
        if rows.is_empty() {
            return Err(StoreError::Malformed(format!("insert into {} returned no row", table)));
        }
        Ok(rows.swap_remove(0))
    }

    async fn update(&self, table: Table, id: &str, fields: Row) -> Result<(), StoreError> {
        let url = self.rest_url(table);
        let body = Value::Object(fields);
        let id_filter = format!("eq.{}", id);
        self.execute(
            || {
                self.client
                    .patch(&url)
                    .query(&[("id", id_filter.as_str())])
                    .header("Prefer", "return=minimal")
                    .json(&body)
            },
            "update",
        )
        .await?;
        debug!(table = %table, id = id, "Updated row");
        Ok(())
    }

    async fn delete(&self, table: Table, id: &str) -> Result<(), StoreError> {
        let url = self.rest_url(table);
        let id_filter = format!("eq.{}", id);
        self.execute(
            || self.client.delete(&url).query(&[("id", id_filter.as_str())]),
            "delete",
        )
        .await?;
        debug!(table = %table, id = id, "Deleted row");
        Ok(())
    }

    async fn select(&self, table: Table, filter: &Filter, order: Option<Order>) -> Result<Vec<Row>, StoreError> {
        let url = self.rest_url(table);
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(Self::filter_params(filter));
        if let Some(order) = order {
            params.push(("order".to_string(), Self::order_param(order)));
        }

        let response = self
            .execute(|| self.client.get(&url).query(&params), "select")
            .await?;
        let rows: Vec<Row> = response.json().await.map_err(ApiError::from)?;
        debug!(table = %table, count = rows.len(), "Selected rows");
        Ok(rows)
    }

    fn cascades_deletes(&self) -> bool {
        self.native_cascade
    }
}

#[async_trait]
impl ObjectStorage for SupabaseClient {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let url = self.object_url(key);
        self.execute(
            || {
                self.client
                    .post(&url)
                    .header(header::CONTENT_TYPE, content_type)
                    .header("x-upsert", "false")
                    .body(bytes.clone())
            },
            "upload",
        )
        .await?;
        debug!(key = key, "Uploaded object");
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, self.bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SupabaseClient {
        SupabaseClient::new("https://project.supabase.co/", "anon-key", "kit_media")
            .expect("Failed to build client")
    }

    #[test]
    fn test_urls() {
        let c = client();
        assert_eq!(c.rest_url(Table::KitSections), "https://project.supabase.co/rest/v1/kit_sections");
        assert_eq!(
            c.object_url("kits/1-abc.png"),
            "https://project.supabase.co/storage/v1/object/kit_media/kits/1-abc.png"
        );
        assert_eq!(
            c.public_url("kits/1-abc.png"),
            "https://project.supabase.co/storage/v1/object/public/kit_media/kits/1-abc.png"
        );
    }

    #[test]
    fn test_filter_params() {
        assert!(SupabaseClient::filter_params(&Filter::All).is_empty());
        assert_eq!(
            SupabaseClient::filter_params(&Filter::eq("kit_id", "k1")),
            vec![("kit_id".to_string(), "eq.k1".to_string())]
        );
        assert_eq!(
            SupabaseClient::filter_params(&Filter::In("section_id", vec!["a".into(), "b,c".into()])),
            vec![("section_id".to_string(), "in.(\"a\",\"b,c\")".to_string())]
        );
        assert_eq!(
            SupabaseClient::filter_params(&Filter::In("name", vec![r#"a\"b"#.into()])),
            vec![("name".to_string(), r#"in.("a\\\"b")"#.to_string())]
        );
    }

    #[test]
    fn test_order_param() {
        assert_eq!(SupabaseClient::order_param(Order::asc("position")), "position.asc");
        assert_eq!(SupabaseClient::order_param(Order::desc("created_at")), "created_at.desc");
    }

    #[test]
    fn test_auth_headers_fall_back_to_api_key() {
        let c = client();
        let headers = c.auth_headers().expect("headers");
        assert_eq!(headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()), Some("Bearer anon-key"));

        let signed_in = c.with_token("jwt".to_string());
        let headers = signed_in.auth_headers().expect("headers");
        assert_eq!(headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()), Some("Bearer jwt"));
        assert_eq!(headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()), Some("anon-key"));
    }

    #[test]
    fn test_parse_auth_response() {
        let json = r#"{"access_token":"jwt","token_type":"bearer","expires_in":3600,"refresh_token":"r1","user":{"id":"0e65066c-ab20-4da0-b3bf-79dfd0668049","email":"admin@example.org","role":"authenticated"}}"#;
        let auth: AuthResponse = serde_json::from_str(json).expect("Failed to parse auth test JSON");
        let session = SupabaseClient::session_from(auth, "fallback@example.org");

        assert_eq!(session.user_id, "0e65066c-ab20-4da0-b3bf-79dfd0668049");
        assert_eq!(session.email, "admin@example.org");
        assert!(!session.needs_refresh());
    }
}
