//! Shared HTTP plumbing: proxy configuration, pooled client construction,
//! retry with backoff, and ISP-block detection.
//!
//! The proxy configuration is process-wide. Changing it bumps a generation
//! counter; clients are rebuilt lazily against the new configuration while
//! requests already in flight complete on the client they started with.
//! Proxy credentials never appear in logs.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Default per-request timeout for API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for file downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
/// User-Agent applied when an extension does not set its own.
pub const DEFAULT_USER_AGENT: &str = "TuneVault-Extension/1.0";

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(16);
const RETRY_AFTER_FALLBACK: Duration = Duration::from_secs(60);

/// Supported proxy flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

impl ProxyKind {
    pub fn parse(kind: &str) -> Result<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "socks5" => Ok(Self::Socks5),
            other => Err(Error::validation(format!(
                "unsupported proxy type: {other}"
            ))),
        }
    }

    const fn scheme(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            // socks5h: let the proxy resolve names so local DNS never sees
            // the target host.
            Self::Socks5 => "socks5h",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
        }
    }
}

/// A process-wide proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxyConfig {
    fn to_reqwest_proxy(&self) -> Result<reqwest::Proxy> {
        let mut proxy_url = Url::parse(&format!(
            "{}://{}:{}",
            self.kind.scheme(),
            self.host,
            self.port
        ))
        .map_err(|err| Error::validation(format!("invalid proxy address: {err}")))?;

        if !self.username.is_empty() {
            proxy_url
                .set_username(&self.username)
                .and_then(|()| proxy_url.set_password(Some(&self.password)))
                .map_err(|()| Error::validation("invalid proxy credentials"))?;
        }

        Ok(reqwest::Proxy::all(proxy_url)?)
    }
}

/// Shared proxy state with a generation counter for lazy client rebuilds.
#[derive(Debug, Default)]
pub(crate) struct ProxyState {
    config: RwLock<Option<ProxyConfig>>,
    generation: AtomicU64,
}

impl ProxyState {
    pub(crate) fn set(&self, config: ProxyConfig) {
        info!(proxy = config.kind.label(), "proxy configured");
        *self.config.write() = Some(config);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        info!("proxy configuration cleared");
        *self.config.write() = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> Option<ProxyConfig> {
        self.config.read().clone()
    }
}

/// Build a pooled blocking client honoring the given proxy configuration.
///
/// Cookie persistence is enabled so each extension runtime keeps an in-memory
/// jar until it asks for a rebuild via `http.clearCookies()`.
pub(crate) fn build_client(
    proxy: Option<&ProxyConfig>,
    timeout: Duration,
) -> Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .cookie_store(true);

    if let Some(config) = proxy {
        builder = builder.proxy(config.to_reqwest_proxy()?);
    }

    Ok(builder.build()?)
}

/// Retry policy for host-side request helpers.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
            backoff_factor: 2.0,
        }
    }
}

pub(crate) fn next_delay(current: Duration, config: &RetryConfig) -> Duration {
    let scaled = current.mul_f64(config.backoff_factor);
    scaled.min(config.max_delay)
}

/// Parse a `Retry-After` header value as whole seconds.
// TODO: also accept the HTTP-date form of Retry-After.
pub(crate) fn retry_after_duration(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(RETRY_AFTER_FALLBACK, Duration::from_secs)
}

/// Execute a request with exponential backoff.
///
/// Retries transport failures and 5xx responses; honours `Retry-After` on
/// 429; stops immediately when ISP blocking is detected (retrying will not
/// help). Other 4xx responses are returned to the caller as-is.
pub fn send_with_retry(
    client: &reqwest::blocking::Client,
    request: reqwest::blocking::Request,
    config: RetryConfig,
) -> Result<reqwest::blocking::Response> {
    let url = request.url().clone();
    let host = url.host_str().unwrap_or("unknown").to_string();
    let mut delay = config.initial_delay;
    let mut last_error: Option<Error> = None;

    for attempt in 0..=config.max_retries {
        let Some(attempt_request) = request.try_clone() else {
            // Streaming bodies cannot be replayed.
            return Ok(client.execute(request)?);
        };

        match client.execute(attempt_request) {
            Err(err) => {
                if let Some(reason) = classify_isp_blocking(&err.to_string()) {
                    warn!(host = %host, reason, "ISP blocking detected");
                    return Err(Error::remote(
                        0,
                        format!(
                            "ISP blocking detected for {host}: {reason} - try using a VPN or change DNS to 1.1.1.1/8.8.8.8"
                        ),
                    ));
                }
                last_error = Some(err.into());
            }
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                if status.as_u16() == 429 {
                    let retry_after = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    delay = retry_after_duration(retry_after.as_deref());
                    last_error = Some(Error::remote(429, "rate limited"));
                } else if status.as_u16() == 403 || status.as_u16() == 451 {
                    let body = response.text().unwrap_or_default();
                    let lowered = body.to_ascii_lowercase();
                    if let Some(indicator) = BLOCKING_PAGE_INDICATORS
                        .iter()
                        .find(|needle| lowered.contains(**needle))
                    {
                        warn!(host = %host, status = status.as_u16(), indicator, "ISP blocking detected");
                        return Err(Error::remote(
                            status.as_u16(),
                            format!(
                                "ISP blocking detected for {host} (HTTP {}) - try using a VPN or change DNS",
                                status.as_u16()
                            ),
                        ));
                    }
                    return Err(Error::remote(status.as_u16(), truncate(&body, 100)));
                } else if status.is_server_error() {
                    last_error = Some(Error::remote(status.as_u16(), "server error"));
                } else {
                    return Ok(response);
                }
            }
        }

        if attempt < config.max_retries {
            std::thread::sleep(delay);
            delay = next_delay(delay, &config);
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::remote(0, format!("request to {host} failed"))))
}

/// Error-text patterns that usually indicate ISP-level interference.
const BLOCKING_ERROR_PATTERNS: &[(&str, &str)] = &[
    (
        "connection reset by peer",
        "connection reset - ISP may be intercepting traffic",
    ),
    (
        "connection refused",
        "connection refused - port may be blocked",
    ),
    (
        "no such host",
        "DNS lookup failed - domain may be blocked by ISP",
    ),
    (
        "dns error",
        "DNS lookup failed - domain may be blocked by ISP",
    ),
    (
        "network unreachable",
        "network unreachable - ISP may be blocking route",
    ),
    (
        "certificate",
        "certificate error - ISP may be using a MITM proxy",
    ),
    (
        "tls",
        "TLS error - ISP may be intercepting HTTPS traffic",
    ),
    (
        "timed out",
        "connection timed out - ISP may be blocking access",
    ),
];

/// Body keywords that make a 403/451 response look like a blocking page.
const BLOCKING_PAGE_INDICATORS: &[&str] = &[
    "blocked",
    "forbidden",
    "access denied",
    "not available in your",
    "restricted",
    "censored",
    "unavailable for legal",
    "blocked by",
];

/// Classify a transport-error message, returning a human-readable reason when
/// it matches a known ISP-blocking signature.
pub fn classify_isp_blocking(error_text: &str) -> Option<&'static str> {
    let lowered = error_text.to_ascii_lowercase();
    BLOCKING_ERROR_PATTERNS
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, reason)| *reason)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        text.to_string()
    } else {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}
