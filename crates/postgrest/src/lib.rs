//! PostgREST client for the placement backend
//!
//! Row queries against `/rest/v1/<table>`:
//!
//! - `select` with embedded resources (`*,schools(school_name)`)
//! - Filters (`eq`, negated `not`, or any raw operator)
//! - Ordering and row limits
//! - Single-row reads
//! - Exact row counts without fetching rows
//! - `insert` and `update` returning the affected rows

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Accept header asking PostgREST for exactly one object instead of an array.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// Error body returned by PostgREST
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PostgrestApiErrorDetails {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
    pub hint: Option<String>,
}

impl fmt::Display for PostgrestApiErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(code) = &self.code {
            parts.push(format!("Code: {}", code));
        }
        if let Some(message) = &self.message {
            parts.push(format!("Message: {}", message));
        }
        if let Some(details) = &self.details {
            parts.push(format!("Details: {}", details));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("Hint: {}", hint));
        }
        write!(f, "{}", parts.join(", "))
    }
}

#[derive(Error, Debug)]
pub enum PostgrestError {
    #[error("API error: {details} (Status: {status})")]
    ApiError {
        details: PostgrestApiErrorDetails,
        status: reqwest::StatusCode,
    },

    #[error("API error (unparsed): {message} (Status: {status})")]
    UnparsedApiError {
        message: String,
        status: reqwest::StatusCode,
    },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid count in response: {0}")]
    InvalidCount(String),
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// How PostgREST should count rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountMethod {
    #[default]
    Exact,
    Planned,
    Estimated,
}

impl CountMethod {
    fn as_str(&self) -> &'static str {
        match self {
            CountMethod::Exact => "exact",
            CountMethod::Planned => "planned",
            CountMethod::Estimated => "estimated",
        }
    }
}

/// Query builder bound to one table
#[derive(Debug, Clone)]
pub struct PostgrestClient {
    base_url: String,
    table: String,
    http_client: Client,
    headers: HeaderMap,
    query_params: Vec<(String, String)>,
}

impl PostgrestClient {
    /// Create a client for `table` under `base_url/rest/v1`
    pub fn new(base_url: &str, api_key: &str, table: &str, http_client: Client) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("apikey", value);
        }
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            http_client,
            headers,
            query_params: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Add a request header
    pub fn with_header(mut self, key: &str, value: &str) -> Result<Self, PostgrestError> {
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header value: {}", value))
        })?;
        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            PostgrestError::InvalidParameters(format!("Invalid header name: {}", key))
        })?;

        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Send requests with the signed-in user's access token
    pub fn with_auth(self, token: &str) -> Result<Self, PostgrestError> {
        self.with_header("Authorization", &format!("Bearer {}", token))
    }

    /// Columns to return, including embedded resources
    pub fn select(mut self, columns: &str) -> Self {
        self.set_param("select", columns.to_string());
        self
    }

    /// `column = value`. The column may be an embedded one (`school_postings.school_id`).
    pub fn eq<V: ToString>(self, column: &str, value: V) -> Self {
        self.filter(column, "eq", &value.to_string())
    }

    /// Negated filter `column=not.<operator>.<value>`, e.g. `not("read", "is", "true")`
    /// to keep both `false` and `NULL` rows
    pub fn not(self, column: &str, operator: &str, value: &str) -> Self {
        self.filter(column, &format!("not.{}", operator), value)
    }

    /// Generic filter `column=<operator>.<value>`
    pub fn filter(mut self, column: &str, operator: &str, value: &str) -> Self {
        self.query_params
            .push((column.to_string(), format!("{}.{}", operator, value)));
        self
    }

    pub fn order(mut self, column: &str, order: SortOrder) -> Self {
        let direction = match order {
            SortOrder::Ascending => "asc",
            SortOrder::Descending => "desc",
        };
        self.set_param("order", format!("{}.{}", column, direction));
        self
    }

    pub fn limit(mut self, count: usize) -> Self {
        self.set_param("limit", count.to_string());
        self
    }

    fn set_param(&mut self, key: &str, value: String) {
        self.query_params.retain(|(k, _)| k != key);
        self.query_params.push((key.to_string(), value));
    }

    fn build_url(&self) -> Result<Url, PostgrestError> {
        let mut url = Url::parse(&format!("{}/rest/v1/{}", self.base_url, self.table))?;
        if !self.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query_params {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        extra_headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<Response, PostgrestError> {
        let url = self.build_url()?;
        debug!(table = %self.table, %method, %url, "postgrest request");

        let mut headers = self.headers.clone();
        headers.extend(extra_headers);

        let mut request = self.http_client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(response)
    }

    /// Fetch all matching rows
    pub async fn execute<T: DeserializeOwned>(&self) -> Result<Vec<T>, PostgrestError> {
        let response = self.send(Method::GET, HeaderMap::new(), None).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }

    /// Fetch exactly one row; zero or several rows is an API error
    pub async fn single<T: DeserializeOwned>(&self) -> Result<T, PostgrestError> {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static(SINGLE_OBJECT));
        let response = self.send(Method::GET, headers, None).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }

    /// Fetch the first matching row, if any
    pub async fn maybe_single<T: DeserializeOwned>(&self) -> Result<Option<T>, PostgrestError> {
        let rows = self.clone().limit(1).execute::<T>().await?;
        Ok(rows.into_iter().next())
    }

    /// Count matching rows without transferring them
    pub async fn count(&self, method: CountMethod) -> Result<u64, PostgrestError> {
        let prefer = format!("count={}", method.as_str());
        let mut headers = HeaderMap::new();
        headers.insert(
            "Prefer",
            HeaderValue::from_str(&prefer)
                .map_err(|_| PostgrestError::InvalidParameters(prefer.clone()))?,
        );

        let response = self.send(Method::HEAD, headers, None).await?;
        let range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PostgrestError::InvalidCount("missing Content-Range".to_string()))?;

        parse_content_range(range)
            .ok_or_else(|| PostgrestError::InvalidCount(range.to_string()))
    }

    /// Insert rows and return them as stored
    pub async fn insert<T: Serialize, R: DeserializeOwned>(
        &self,
        values: &T,
    ) -> Result<Vec<R>, PostgrestError> {
        self.write(Method::POST, values).await
    }

    /// Update the filtered rows and return them as stored
    pub async fn update<T: Serialize, R: DeserializeOwned>(
        &self,
        values: &T,
    ) -> Result<Vec<R>, PostgrestError> {
        if self.query_params.iter().all(|(k, _)| k == "select") {
            return Err(PostgrestError::InvalidParameters(
                "update without a filter would touch every row".to_string(),
            ));
        }
        self.write(Method::PATCH, values).await
    }

    async fn write<T: Serialize, R: DeserializeOwned>(
        &self,
        method: Method,
        values: &T,
    ) -> Result<Vec<R>, PostgrestError> {
        let body = serde_json::to_vec(values)?;
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let response = self.send(method, headers, Some(body)).await?;
        response
            .json::<Vec<R>>()
            .await
            .map_err(|e| PostgrestError::DeserializationError(e.to_string()))
    }
}

/// Total from a `Content-Range` header (`0-24/3573`, `*/0`)
pub fn parse_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

async fn error_from_response(response: Response) -> PostgrestError {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    match serde_json::from_str::<PostgrestApiErrorDetails>(&error_text) {
        Ok(details) => PostgrestError::ApiError { details, status },
        Err(_) => PostgrestError::UnparsedApiError {
            message: error_text,
            status,
        },
    }
}
