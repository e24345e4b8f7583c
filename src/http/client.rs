use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{ErrorCode, FlagBridgeError, Result};
use crate::types::{normalize_flag_name, FlagVariation, Flags};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("flagbridge-rust/", env!("CARGO_PKG_VERSION"));

/// A single GraphQL request for flags.
#[derive(Debug, Clone, Serialize)]
pub struct FlagsRequest {
    #[serde(skip)]
    pub uri: String,
    #[serde(skip)]
    pub headers: HashMap<String, String>,
    pub query: String,
    pub variables: serde_json::Value,
}

/// Source of raw flag payloads for the GraphQL adapter.
///
/// Returns the `data` member of the response. Turning it into flags is the
/// adapter's job.
#[async_trait]
pub trait FlagsFetcher: Send + Sync {
    async fn fetch(&self, request: &FlagsRequest) -> Result<serde_json::Value>;
}

/// Reads flags from a GraphQL `data` object: every non-null member becomes a
/// flag under its normalized name.
pub fn default_parse_flags(data: &serde_json::Value) -> Result<Flags> {
    let object = data.as_object().ok_or_else(|| {
        FlagBridgeError::new(
            ErrorCode::HttpInvalidResponse,
            "GraphQL response data is not an object",
        )
    })?;

    Ok(object
        .iter()
        .filter_map(|(name, value)| {
            FlagVariation::from_json(value.clone()).map(|flag| (normalize_flag_name(name), flag))
        })
        .collect())
}

pub struct HttpFlagsFetcher {
    client: Client,
}

impl HttpFlagsFetcher {
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                FlagBridgeError::with_source(ErrorCode::NetworkError, "Failed to create HTTP client", e)
            })?;

        Ok(Self { client })
    }

    fn status_to_error(status: StatusCode, body: &str) -> FlagBridgeError {
        let code = if status.is_server_error() {
            ErrorCode::HttpServerError
        } else {
            ErrorCode::HttpInvalidResponse
        };

        FlagBridgeError::network_error(code, format!("HTTP {}: {}", status.as_u16(), body))
    }

    fn convert_error(error: reqwest::Error) -> FlagBridgeError {
        if error.is_timeout() {
            FlagBridgeError::with_source(ErrorCode::NetworkError, "Request timed out", error)
        } else if error.is_connect() {
            FlagBridgeError::with_source(ErrorCode::NetworkError, "Connection failed", error)
        } else {
            FlagBridgeError::with_source(ErrorCode::NetworkError, error.to_string(), error)
        }
    }

    fn extract_data(body: &str) -> Result<serde_json::Value> {
        let mut response: serde_json::Value = serde_json::from_str(body).map_err(|e| {
            FlagBridgeError::with_source(
                ErrorCode::HttpInvalidResponse,
                format!("Failed to parse response: {}", e),
                e,
            )
        })?;

        if let Some(errors) = response.get("errors").filter(|e| !e.is_null()) {
            return Err(FlagBridgeError::new(
                ErrorCode::ProviderError,
                format!("GraphQL errors: {}", errors),
            ));
        }

        match response.get_mut("data").map(serde_json::Value::take) {
            Some(data) if !data.is_null() => Ok(data),
            _ => Err(FlagBridgeError::new(
                ErrorCode::HttpInvalidResponse,
                "GraphQL response has no data",
            )),
        }
    }
}

#[async_trait]
impl FlagsFetcher for HttpFlagsFetcher {
    async fn fetch(&self, request: &FlagsRequest) -> Result<serde_json::Value> {
        let mut builder = self
            .client
            .post(&request.uri)
            .header("Content-Type", "application/json")
            .json(request);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(Self::convert_error)?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            FlagBridgeError::with_source(ErrorCode::HttpInvalidResponse, "Failed to read response", e)
        })?;

        if !status.is_success() {
            return Err(Self::status_to_error(status, &body));
        }

        Self::extract_data(&body)
    }
}
