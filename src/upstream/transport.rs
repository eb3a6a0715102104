//! Throttled, host-scoped upstream transport.
//!
//! All upstream traffic flows through a shared token bucket. A 403 response
//! drops the bucket to a minimum rate for one minute before the original
//! budget is restored. Requests are pinned to the expected host, and
//! redirects never leave it, so credentials cannot leak to other domains.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tracing::warn;

use crate::cache::lock::mutex_lock;
use crate::domain::ProxyError;

const SOURCE: &str = "upstream::transport";

/// How long the minimum rate applies after a 403.
const BACKOFF_WINDOW: Duration = Duration::from_secs(60);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct ThrottleState {
    current: Arc<DirectLimiter>,
    restore_at: Option<Instant>,
}

/// Token bucket with a 403 penalty box.
pub struct Throttle {
    normal: Quota,
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// A bucket allowing `requests_per_minute` sustained requests.
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute.max(1)).expect("clamped to at least one");
        let normal = Quota::per_minute(rpm);
        Self {
            normal,
            state: Mutex::new(ThrottleState {
                current: Arc::new(RateLimiter::direct(normal)),
                restore_at: None,
            }),
        }
    }

    /// Wait for a token.
    pub async fn acquire(&self) {
        let limiter = {
            let mut state = mutex_lock(&self.state, SOURCE, "acquire");
            if let Some(restore_at) = state.restore_at {
                if Instant::now() >= restore_at {
                    state.current = Arc::new(RateLimiter::direct(self.normal));
                    state.restore_at = None;
                }
            }
            Arc::clone(&state.current)
        };
        limiter.until_ready().await;
    }

    /// Drop to one request per minute; the original budget is restored after
    /// the backoff window.
    pub fn backoff(&self) {
        warn!("backing off after 403");
        let mut state = mutex_lock(&self.state, SOURCE, "backoff");
        state.current = Arc::new(RateLimiter::direct(Quota::per_minute(
            NonZeroU32::new(1).expect("one is non-zero"),
        )));
        state.restore_at = Some(Instant::now() + BACKOFF_WINDOW);
    }

    #[cfg(test)]
    fn in_backoff(&self) -> bool {
        mutex_lock(&self.state, SOURCE, "in_backoff")
            .restore_at
            .is_some()
    }
}

/// HTTP access to the upstream host: rate limited, host pinned, credentialed,
/// with 4xx/5xx statuses proxied as typed errors.
pub struct UpstreamTransport {
    client: reqwest::Client,
    /// Client that reports redirects instead of following them, used to
    /// sniff ID mappings out of Location headers.
    sniff_client: reqwest::Client,
    host: String,
    headers: HeaderMap,
    throttle: Arc<Throttle>,
}

impl UpstreamTransport {
    pub fn new(
        host: impl Into<String>,
        throttle: Arc<Throttle>,
        cookie: Option<&str>,
        proxy: Option<&str>,
    ) -> Result<Self, ProxyError> {
        let host = host.into();

        let mut headers = HeaderMap::new();
        if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
            let value = HeaderValue::from_str(cookie)
                .map_err(|_| ProxyError::bad_request("invalid cookie"))?;
            headers.insert(reqwest::header::COOKIE, value);
        }

        // Redirects may not leave the upstream host; a cross-host hop drops
        // the response (and with it our credentials).
        let redirect_host = host.clone();
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() > 5 {
                return attempt.error("too many redirects");
            }
            if attempt.url().host_str() == Some(redirect_host.as_str()) {
                attempt.follow()
            } else {
                attempt.stop()
            }
        });

        let mut builder = reqwest::Client::builder().redirect(policy);
        let mut sniff_builder = reqwest::Client::builder().redirect(Policy::none());
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|err| ProxyError::bad_request(format!("invalid proxy url: {err}")))?;
            builder = builder.proxy(proxy.clone());
            sniff_builder = sniff_builder.proxy(proxy);
        }

        Ok(Self {
            client: builder
                .build()
                .map_err(|err| ProxyError::transport(err.to_string()))?,
            sniff_client: sniff_builder
                .build()
                .map_err(|err| ProxyError::transport(err.to_string()))?,
            host,
            headers,
            throttle,
        })
    }

    /// Attach an extra header to every request, e.g. an API key.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    fn url_for(&self, path_and_query: &str) -> String {
        format!("https://{}{}", self.host, path_and_query)
    }

    fn check_status(&self, status: reqwest::StatusCode) -> Result<(), ProxyError> {
        if status == reqwest::StatusCode::FORBIDDEN {
            self.throttle.backoff();
        }
        if status.as_u16() >= 400 {
            return Err(ProxyError::from_status(status.as_u16()));
        }
        Ok(())
    }

    /// GET a path on the upstream host.
    pub async fn get(&self, path_and_query: &str) -> Result<reqwest::Response, ProxyError> {
        self.throttle.acquire().await;

        let response = self
            .client
            .get(self.url_for(path_and_query))
            .headers(self.headers.clone())
            .send()
            .await?;

        self.check_status(response.status())?;
        Ok(response)
    }

    /// POST a JSON body to an absolute URL (the GraphQL endpoint may live on
    /// a sibling host). The same throttle and error proxying apply.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        self.throttle.acquire().await;

        let response = self
            .client
            .post(url)
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        self.check_status(response.status())?;
        Ok(response)
    }

    /// HEAD a path expected to redirect, returning the Location header. Used
    /// to resolve ID mappings without loading anything.
    pub async fn head_location(&self, path_and_query: &str) -> Result<String, ProxyError> {
        self.throttle.acquire().await;

        let response = self
            .sniff_client
            .head(self.url_for(path_and_query))
            .headers(self.headers.clone())
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            self.throttle.backoff();
        }

        response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| ProxyError::transport("missing location header"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttle_allows_within_budget() {
        let throttle = Throttle::per_minute(600);
        // A generous budget admits a small burst without measurable delay.
        let start = Instant::now();
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn backoff_flags_and_restores() {
        let throttle = Throttle::per_minute(600);
        assert!(!throttle.in_backoff());

        throttle.backoff();
        assert!(throttle.in_backoff());

        // Restoration is time-based; the flag stays until the window passes.
        throttle.acquire().await; // First token of the 1RPM bucket.
        assert!(throttle.in_backoff());
    }

    #[test]
    fn transport_rejects_malformed_proxy() {
        let throttle = Arc::new(Throttle::per_minute(60));
        let result = UpstreamTransport::new("example.com", throttle, None, Some("::not a url::"));
        assert!(matches!(result, Err(ProxyError::BadRequest(_))));
    }
}
