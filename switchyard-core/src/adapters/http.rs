//! Shared HTTP plumbing for provider adapters.
//!
//! One client per provider: different base URLs, auth schemes and header
//! sets, so clients are never shared across providers. The per-attempt
//! timeout lives in the resilience pipeline, not here; the reqwest
//! client only bounds connection establishment, otherwise a client-level
//! timeout would also cut off long-lived streaming bodies.

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::AdapterError;
use crate::registry::{AdapterKind, ProviderConfig};

const POOL_MAX_IDLE_PER_HOST: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub enum AuthScheme {
    Bearer { token: String },
    Header { name: String, value: String },
    None,
}

impl AuthScheme {
    /// Pick the scheme a provider's wire protocol expects.
    fn for_provider(config: &ProviderConfig) -> Self {
        match (&config.api_key, config.kind) {
            (Some(key), AdapterKind::GeminiNative) => AuthScheme::Header {
                name: "x-goog-api-key".to_string(),
                value: key.clone(),
            },
            (Some(key), _) => AuthScheme::Bearer { token: key.clone() },
            (None, _) => AuthScheme::None,
        }
    }
}

/// HTTP client bound to a single provider.
#[derive(Clone)]
pub struct ProviderHttpClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
}

impl ProviderHttpClient {
    pub fn for_provider(config: &ProviderConfig) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| AdapterError::Configuration {
                message: format!("failed to build http client for '{}': {e}", config.key),
            })?;

        let mut default_headers = HeaderMap::new();
        match AuthScheme::for_provider(config) {
            AuthScheme::Bearer { token } => {
                let value = format!("Bearer {token}").parse().map_err(|_| {
                    AdapterError::Configuration {
                        message: format!("invalid api key for provider '{}'", config.key),
                    }
                })?;
                default_headers.insert("authorization", value);
            }
            AuthScheme::Header { name, value } => {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<reqwest::header::HeaderName>(),
                    value.parse(),
                ) {
                    default_headers.insert(name, value);
                }
            }
            AuthScheme::None => {}
        }
        for (name, value) in &config.headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<reqwest::header::HeaderName>(), value.parse())
            {
                default_headers.insert(name, value);
            }
        }

        Ok(Self {
            http,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            default_headers,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<TResp, AdapterError> {
        let resp = self
            .http
            .request(Method::POST, self.build_url(path))
            .headers(self.default_headers.clone())
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    /// POST returning the raw response after the status check; used for
    /// streaming bodies.
    pub async fn post_stream<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
    ) -> Result<Response, AdapterError> {
        let resp = self
            .http
            .request(Method::POST, self.build_url(path))
            .headers(self.default_headers.clone())
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp)
    }
}

/// Turn a non-success response into a structured [`AdapterError`],
/// pulling the message out of the common `{"error":{"message":...}}`
/// shape when present.
pub async fn map_error_response(resp: Response) -> AdapterError {
    let status = resp.status().as_u16();
    let message = match resp.text().await {
        Ok(body) => serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or(body),
        Err(_) => "failed to read error response".to_string(),
    };
    AdapterError::Api { status, message }
}
