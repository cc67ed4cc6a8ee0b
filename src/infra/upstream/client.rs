use std::{fmt, num::NonZeroU32, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Client, StatusCode, Url,
    header::{ACCEPT, HeaderMap, RETRY_AFTER},
};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::application::upstream::{Upstream, UpstreamError, UpstreamQuery};
use crate::config::UpstreamSettings;
use crate::infra::error::InfraError;

use super::retry::{AttemptError, RetryPolicy};

/// Resolved knobs for [`HttpUpstream`].
#[derive(Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: String,
    pub throttle: Duration,
    pub request_timeout: Duration,
    pub max_connections: NonZeroU32,
    pub retry: RetryPolicy,
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .field("throttle", &self.throttle)
            .field("request_timeout", &self.request_timeout)
            .field("max_connections", &self.max_connections)
            .field("retry", &self.retry)
            .finish()
    }
}

impl TryFrom<&UpstreamSettings> for UpstreamConfig {
    type Error = InfraError;

    fn try_from(settings: &UpstreamSettings) -> Result<Self, Self::Error> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| InfraError::configuration("upstream base_url is not configured"))?;
        let token = settings
            .token
            .clone()
            .ok_or_else(|| InfraError::configuration("upstream token is not configured"))?;

        Ok(Self {
            base_url,
            token,
            throttle: settings.throttle,
            request_timeout: settings.request_timeout,
            max_connections: settings.max_connections,
            retry: RetryPolicy {
                max_attempts: settings.retry_attempts,
                base_delay: settings.retry_base_delay,
                rate_limit_delay: settings.rate_limit_delay,
                max_delay: settings.max_backoff,
            },
        })
    }
}

/// Throttled, retrying HTTP client for the CRM API.
///
/// One instance is shared by every dataset; its connection pool and in-flight
/// ceiling therefore bound the whole process.
pub struct HttpUpstream {
    client: Client,
    base: Url,
    token: String,
    throttle: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl HttpUpstream {
    pub fn new(config: UpstreamConfig) -> Result<Self, InfraError> {
        let base = base_url(&config.base_url)?;
        let max_connections = config.max_connections.get() as usize;

        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(max_connections)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|err| InfraError::configuration(format!("failed to build client: {err}")))?;

        Ok(Self {
            client,
            base,
            token: config.token,
            throttle: config.throttle,
            retry: config.retry,
            permits: Arc::new(Semaphore::new(max_connections)),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("leadcache/", env!("CARGO_PKG_VERSION"))
    }

    fn url(&self, endpoint: &str, query: &UpstreamQuery) -> Result<Url, UpstreamError> {
        let mut url = self
            .base
            .join(endpoint.trim_start_matches('/'))
            .map_err(|err| UpstreamError::Url(err.to_string()))?;
        if !query.pairs().is_empty() {
            url.query_pairs_mut().extend_pairs(query.pairs());
        }
        Ok(url)
    }

    async fn attempt(&self, endpoint: &str, url: &Url) -> Result<Value, AttemptError<UpstreamError>> {
        tokio::time::sleep(self.throttle).await;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| AttemptError::Permanent(UpstreamError::transport(endpoint, err)))?;

        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| AttemptError::Transient(UpstreamError::transport(endpoint, err)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Object(Map::new()));
        }
        if !status.is_success() {
            let err = UpstreamError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            };
            return Err(if status.is_server_error() {
                AttemptError::Transient(err)
            } else {
                AttemptError::Permanent(err)
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| AttemptError::Transient(UpstreamError::transport(endpoint, err)))?;
        if bytes.is_empty() {
            return Ok(Value::Object(Map::new()));
        }

        serde_json::from_slice(&bytes)
            .map_err(|err| AttemptError::Transient(UpstreamError::decode(endpoint, err)))
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    #[instrument(skip(self, query), fields(params = query.pairs().len()))]
    async fn fetch(&self, endpoint: &str, query: &UpstreamQuery) -> Result<Value, UpstreamError> {
        let url = self.url(endpoint, query)?;
        debug!(target = "leadcache::upstream", url = %url, "upstream request");
        self.retry
            .run(endpoint, || self.attempt(endpoint, &url))
            .await
    }
}

/// Parse `base` so endpoint paths resolve beneath it, keeping any path prefix
/// such as a proxy mount point.
fn base_url(base: &str) -> Result<Url, InfraError> {
    let mut url = Url::parse(base)
        .map_err(|err| InfraError::configuration(format!("invalid upstream url: {err}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// `Retry-After` in delta-seconds. HTTP dates and anything else unparsable
/// are ignored; the retry policy caps whatever survives.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::upstream::LEADS_ENDPOINT;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_parses_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_after_ignores_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn retry_after_rejects_out_of_range_hints() {
        for raw in ["1e20", "-3", "2.5", "99999999999999999999999"] {
            let mut headers = HeaderMap::new();
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            assert_eq!(parse_retry_after(&headers), None, "{raw}");
        }
    }

    #[test]
    fn largest_retry_after_is_capped_by_the_policy() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("18446744073709551615"));
        let hint = parse_retry_after(&headers);
        assert_eq!(hint, Some(Duration::from_secs(u64::MAX)));

        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_backoff(1, hint), policy.max_delay);
    }

    fn config(base_url: &str) -> UpstreamConfig {
        UpstreamConfig {
            base_url: base_url.into(),
            token: "secret-token".into(),
            throttle: Duration::ZERO,
            request_timeout: Duration::from_secs(1),
            max_connections: NonZeroU32::MIN,
            retry: RetryPolicy::default(),
        }
    }

    #[test]
    fn debug_output_redacts_token() {
        let rendered = format!("{:?}", config("https://crm.example.com"));
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn endpoints_resolve_under_the_base_path() {
        let cases = [
            ("https://crm.example.com", "https://crm.example.com/api/v4/leads"),
            ("https://proxy.example.com/kommo", "https://proxy.example.com/kommo/api/v4/leads"),
            ("https://proxy.example.com/kommo/", "https://proxy.example.com/kommo/api/v4/leads"),
        ];
        for (base, expected) in cases {
            let upstream = HttpUpstream::new(config(base)).expect("client");
            let url = upstream
                .url(LEADS_ENDPOINT, &UpstreamQuery::new())
                .expect("url");
            assert_eq!(url.as_str(), expected);
        }
    }
}
