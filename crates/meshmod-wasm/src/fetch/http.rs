//! HTTP transport: status mapping and retry.
//!
//! This is the only place that interprets HTTP status codes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::auth::PullCredential;
use crate::config::ModuleCacheConfig;
use crate::error::{WasmError, WasmResult};

use super::unbox::MAX_MODULE_SIZE;
use super::ModuleFetcher;

pub const FETCHER_USER_AGENT: &str = concat!("meshmod-wasm/", env!("CARGO_PKG_VERSION"));

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A failed attempt and whether another attempt may help.
#[derive(Debug)]
struct AttemptError {
    error: WasmError,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl AttemptError {
    fn fatal(error: WasmError) -> Self {
        Self {
            error,
            retryable: false,
            retry_after: None,
        }
    }

    fn transient(error: WasmError) -> Self {
        Self {
            error,
            retryable: true,
            retry_after: None,
        }
    }
}

/// Fetches modules over `http`/`https`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_retries: u32,
    max_body_size: u64,
}

impl HttpFetcher {
    pub fn new(config: &ModuleCacheConfig) -> WasmResult<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(USER_AGENT, HeaderValue::from_static(FETCHER_USER_AGENT));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|e| WasmError::Config {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            max_retries: config.max_retries,
            max_body_size: MAX_MODULE_SIZE,
        })
    }

    /// Reject responses larger than `bytes`.
    pub fn with_max_body_size(mut self, bytes: u64) -> Self {
        self.max_body_size = bytes;
        self
    }

    fn parse_uri(uri: &str) -> WasmResult<Url> {
        let url = Url::parse(uri).map_err(|e| WasmError::FetchFailure {
            uri: uri.to_string(),
            message: format!("invalid uri: {}", e),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(WasmError::FetchFailure {
                uri: uri.to_string(),
                message: format!("unsupported scheme {:?}", other),
            }),
        }
    }

    fn backoff(attempt: u32, retry_after: Option<Duration>) -> Duration {
        use rand::Rng;

        match retry_after {
            Some(retry_after) => {
                let base_ms = retry_after.min(MAX_BACKOFF).as_millis() as u64;
                let jitter_factor: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
                let jittered_ms = ((base_ms as f64) * jitter_factor).round() as u64;
                Duration::from_millis(jittered_ms.max(100))
            }
            None => {
                let base = Duration::from_millis(100 << attempt.min(8)).min(MAX_BACKOFF);
                let jittered_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
                Duration::from_millis(jittered_ms.max(10))
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &Url,
        credential: Option<&PullCredential>,
    ) -> Result<Vec<u8>, AttemptError> {
        let uri = url.as_str();
        let mut request = self.client.get(url.clone());
        if let Some(credential) = credential {
            request = request.header(AUTHORIZATION, credential.authorization());
        }

        let response = request.send().await.map_err(|e| {
            AttemptError::transient(WasmError::FetchFailure {
                uri: uri.to_string(),
                message: e.to_string(),
            })
        })?;
        let status = response.status();

        if status.is_success() {
            return self.read_body(uri, response).await;
        }

        let failure = |message: String| WasmError::FetchFailure {
            uri: uri.to_string(),
            message,
        };

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AttemptError::fatal(failure(
                format!("unauthorized (HTTP {})", status.as_u16()),
            ))),

            StatusCode::NOT_FOUND => Err(AttemptError::fatal(failure("not found (HTTP 404)".into()))),

            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(AttemptError {
                    error: failure("rate limited (HTTP 429)".into()),
                    retryable: true,
                    retry_after,
                })
            }

            s if s.is_server_error() => {
                let body = response.text().await.unwrap_or_default();
                let detail: String = body.chars().take(200).collect();
                Err(AttemptError::transient(failure(format!(
                    "HTTP {}: {}",
                    s.as_u16(),
                    detail
                ))))
            }

            s => Err(AttemptError::fatal(failure(format!(
                "unexpected status HTTP {}",
                s.as_u16()
            )))),
        }
    }
}

impl HttpFetcher {
    /// Read a success body, failing once it exceeds `max_body_size`.
    async fn read_body(
        &self,
        uri: &str,
        mut response: reqwest::Response,
    ) -> Result<Vec<u8>, AttemptError> {
        let too_large = || {
            AttemptError::fatal(WasmError::FetchFailure {
                uri: uri.to_string(),
                message: format!("response exceeds size limit of {} bytes", self.max_body_size),
            })
        };

        let declared = response.content_length();
        if declared.is_some_and(|len| len > self.max_body_size) {
            return Err(too_large());
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                AttemptError::transient(WasmError::FetchFailure {
                    uri: uri.to_string(),
                    message: format!("failed to read response body: {}", e),
                })
            })?;
            let Some(chunk) = chunk else {
                return Ok(body);
            };
            if (body.len() + chunk.len()) as u64 > self.max_body_size {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str, pull_secret: Option<&[u8]>) -> WasmResult<Vec<u8>> {
        let url = Self::parse_uri(uri)?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let credential = pull_secret.and_then(|secret| PullCredential::from_secret(secret, &host));
        debug!(uri, authenticated = credential.is_some(), "fetching wasm module");

        let mut retries = 0;
        loop {
            match self.fetch_once(&url, credential.as_ref()).await {
                Ok(bytes) => {
                    debug!(uri, size = bytes.len(), "fetched wasm module");
                    return Ok(bytes);
                }
                Err(attempt) if attempt.retryable && retries < self.max_retries => {
                    retries += 1;
                    let backoff = Self::backoff(retries, attempt.retry_after);
                    warn!(
                        error = %attempt.error,
                        retry = retries,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis(),
                        "retrying module fetch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(attempt) => return Err(attempt.error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri_rejects_other_schemes() {
        for uri in ["oci://registry/module:v1", "file:///tmp/module.wasm", "not a uri"] {
            let err = HttpFetcher::parse_uri(uri).unwrap_err();
            assert!(matches!(err, WasmError::FetchFailure { .. }), "{}", uri);
        }
        assert!(HttpFetcher::parse_uri("https://example.com/module.wasm").is_ok());
    }

    #[test]
    fn test_backoff_bounds() {
        for attempt in 1..20 {
            assert!(HttpFetcher::backoff(attempt, None) <= MAX_BACKOFF);
            assert!(HttpFetcher::backoff(attempt, None) >= Duration::from_millis(10));
        }
        let capped = HttpFetcher::backoff(1, Some(Duration::from_secs(300)));
        assert!(capped <= Duration::from_secs(33));
        assert!(capped >= Duration::from_secs(27));
    }

    #[test]
    fn test_user_agent_has_version() {
        assert!(FETCHER_USER_AGENT.starts_with("meshmod-wasm/"));
    }
}
