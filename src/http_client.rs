use std::time::Duration;

use reqwest::blocking::{Client, Response};
use tracing::{debug, warn};

use crate::error::ValidationError;

/// Configuration for the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds (for exponential backoff cap)
    pub max_retry_delay_ms: u64,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            user_agent: format!("label-validator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// A downloaded body with the validators needed for cache metadata
#[derive(Debug, Clone)]
pub struct Download {
    pub data: Vec<u8>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Blocking HTTP client for remote schemas, rule sources and catalogs
pub struct HttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, ValidationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(ValidationError::from)?;

        Ok(Self { client, config })
    }

    /// Download with retry logic and exponential backoff
    pub fn download(&self, url: &str) -> Result<Download, ValidationError> {
        let response = self.get_response_with_retry(url)?;
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(reqwest::header::ETAG);
        let last_modified = header(reqwest::header::LAST_MODIFIED);

        let bytes = response.bytes().map_err(|e| self.map_error(url, e))?;
        debug!(%url, size = bytes.len(), "downloaded");
        Ok(Download {
            data: bytes.to_vec(),
            etag,
            last_modified,
        })
    }

    fn get_response_with_retry(&self, url: &str) -> Result<Response, ValidationError> {
        let mut current_attempt = 0;

        loop {
            match self.make_request(url) {
                Ok(response) => {
                    if response.status().is_success() {
                        return Ok(response);
                    }

                    let status = response.status();
                    let error = ValidationError::HttpStatus {
                        url: url.to_string(),
                        status: status.as_u16(),
                        message: format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("Unknown")
                        ),
                    };

                    // Retry on server errors (5xx) but not client errors (4xx)
                    if status.is_server_error() && current_attempt < self.config.retry_attempts {
                        self.wait_before_retry(url, current_attempt);
                        current_attempt += 1;
                        continue;
                    }

                    return Err(error);
                }
                Err(error) => {
                    if current_attempt < self.config.retry_attempts
                        && self.is_retryable_error(&error)
                    {
                        self.wait_before_retry(url, current_attempt);
                        current_attempt += 1;
                        continue;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn make_request(&self, url: &str) -> Result<Response, ValidationError> {
        self.client
            .get(url)
            .send()
            .map_err(|e| self.map_error(url, e))
    }

    fn map_error(&self, url: &str, error: reqwest::Error) -> ValidationError {
        if error.is_timeout() {
            ValidationError::Timeout {
                url: url.to_string(),
                timeout_seconds: self.config.timeout_seconds,
            }
        } else {
            ValidationError::Http(error)
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .retry_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.config.max_retry_delay_ms))
    }

    fn wait_before_retry(&self, url: &str, attempt: u32) {
        let delay = self.backoff_delay(attempt);
        warn!(%url, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "retrying download");
        std::thread::sleep(delay);
    }

    fn is_retryable_error(&self, error: &ValidationError) -> bool {
        match error {
            ValidationError::Http(reqwest_error) => {
                reqwest_error.is_timeout() || reqwest_error.is_connect()
            }
            ValidationError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.retry_attempts, 3);
        assert!(config.user_agent.starts_with("label-validator/"));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let client = HttpClient::new(HttpClientConfig {
            retry_delay_ms: 100,
            max_retry_delay_ms: 500,
            ..HttpClientConfig::default()
        })
        .unwrap();

        assert_eq!(client.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(client.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(client.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(client.backoff_delay(3), Duration::from_millis(500));
        assert_eq!(client.backoff_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_retryable_classification() {
        let client = HttpClient::new(HttpClientConfig::default()).unwrap();
        assert!(client.is_retryable_error(&ValidationError::Timeout {
            url: "http://example.com".to_string(),
            timeout_seconds: 1,
        }));
        assert!(!client.is_retryable_error(&ValidationError::HttpStatus {
            url: "http://example.com".to_string(),
            status: 404,
            message: "HTTP 404: Not Found".to_string(),
        }));
    }

    #[test]
    fn test_unreachable_host_fails_without_retry_budget() {
        let client = HttpClient::new(HttpClientConfig {
            timeout_seconds: 2,
            retry_attempts: 0,
            ..HttpClientConfig::default()
        })
        .unwrap();

        // Port 9 on localhost is discard; nothing listens there in CI.
        let result = client.download("http://127.0.0.1:9/schema.xsd");
        assert!(result.is_err());
    }
}
