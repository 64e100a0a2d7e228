use crate::response::BackendResponse;
use crate::text::{abbrev_unquoted, compact_ws};
use http::HeaderMap;
use http::header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

/// Upstream connections are single-use (`Connection: close`), the pool only
/// bounds how many idle sockets we keep around.
const MAX_POOL_SIZE: usize = 4;

/// URL parameters appended when results should be pinned to the upstream
/// cache.
const PIN_PARAMS: &str = "&pinresult=true&pinsubtrees=true";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Immutable description of one upstream SPARQL engine.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub url: String,
    /// Per-call deadline used when racing; single-backend calls pass their
    /// own deadline explicitly.
    pub timeout: Duration,
    /// 1 = primary, 2 = fallback.
    pub id: u32,
    pub pin_results: bool,
    pub clear_cache_on_start: bool,
    pub always_show_cache_stats: bool,
}

impl BackendConfig {
    pub fn new(url: impl Into<String>, timeout: Duration, id: u32) -> Self {
        BackendConfig {
            url: url.into(),
            timeout,
            id,
            pin_results: false,
            clear_cache_on_start: false,
            always_show_cache_stats: false,
        }
    }
}

/// Client for one upstream engine. Issues plain GETs with a per-call
/// deadline and normalises every outcome into a [`BackendResponse`].
pub struct Backend {
    client: reqwest::Client,
    scheme: String,
    authority: String,
    host: String,
    base_path: String,
    timeout: Duration,
    id: u32,
    pin_results: bool,
    clear_cache_on_start: bool,
    always_show_cache_stats: bool,
    log_prefix: String,
}

#[derive(Debug, Deserialize)]
struct CacheStats {
    #[serde(rename = "num-cached-elements")]
    num_cached_elements: u64,
    #[serde(rename = "num-pinned-elements")]
    num_pinned_elements: u64,
    #[serde(rename = "pinned-size")]
    pinned_size: u64,
}

impl Backend {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let parsed = Url::parse(&config.url).map_err(|e| BackendError::InvalidUrl {
            url: config.url.clone(),
            reason: e.to_string(),
        })?;
        let scheme = parsed.scheme().to_string();
        let host = parsed
            .host_str()
            .ok_or_else(|| BackendError::InvalidUrl {
                url: config.url.clone(),
                reason: "missing host".to_string(),
            })?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| BackendError::InvalidUrl {
                url: config.url.clone(),
                reason: "unknown scheme, cannot derive port".to_string(),
            })?;
        let base_path = match parsed.path() {
            "/" => String::new(),
            path => path.to_string(),
        };

        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONNECTION, HeaderValue::from_static("close"));

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .pool_max_idle_per_host(MAX_POOL_SIZE)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()?;

        Ok(Backend {
            client,
            scheme,
            authority: format!("{host}:{port}"),
            host,
            base_path,
            timeout: config.timeout,
            id: config.id,
            pin_results: config.pin_results,
            clear_cache_on_start: config.clear_cache_on_start,
            always_show_cache_stats: config.always_show_cache_stats,
            log_prefix: format!("Backend {}:", config.id),
        })
    }

    /// One-time startup work: optionally clear the upstream cache, then log
    /// what this backend points at.
    pub async fn init(&self) {
        let mut cleared = false;
        if self.clear_cache_on_start {
            cleared = self.clear_cache().await;
        }
        tracing::info!(
            "{} {}{} with timeout {:.1}s{}",
            self.log_prefix,
            self.authority,
            self.base_path,
            self.timeout.as_secs_f64(),
            if cleared { " [cache completely cleared]" } else { "" }
        );
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue a GET for `path` (always starting with `/`) against this
    /// backend and normalise the outcome.
    ///
    /// `pin_override` forces the pinning URL parameters on or off regardless
    /// of the backend default; probe queries pass `Some(false)` to keep
    /// speculative subtrees out of the upstream cache (this also suppresses
    /// the cache-stats report).
    pub async fn query(
        &self,
        path: &str,
        timeout: Duration,
        pin_override: Option<bool>,
    ) -> BackendResponse {
        let pin_params = if pin_override.unwrap_or(self.pin_results) {
            PIN_PARAMS
        } else {
            ""
        };
        let full_path = format!("{}{}{}", self.base_path, path, pin_params);
        tracing::info!(
            "{} Sending GET request {}",
            self.log_prefix,
            abbrev_unquoted(&full_path)
        );

        let url = format!("{}://{}{}", self.scheme, self.authority, full_path);
        let result = self.client.get(&url).timeout(timeout).send().await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                let error_msg = format!(
                    "{} Timeout after {:.1} seconds",
                    self.log_prefix,
                    timeout.as_secs_f64()
                );
                tracing::info!("{error_msg}");
                return BackendResponse::proxy_error(path, &error_msg);
            }
            Err(e) => {
                let error_msg =
                    format!("{} Error with request to {} ({})", self.log_prefix, self.host, e);
                tracing::info!("{error_msg}");
                return BackendResponse::proxy_error(path, &error_msg);
            }
        };

        if response.status() != http::StatusCode::OK {
            let error_msg = format!(
                "{} Error with request to {} (HTTP status {})",
                self.log_prefix,
                self.host,
                response.status()
            );
            tracing::info!("{error_msg}");
            return BackendResponse::proxy_error(path, &error_msg);
        }

        let status = response.status();
        let headers = preserved_headers(response.headers());
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let error_msg = format!(
                    "{} Error reading response from {} ({})",
                    self.log_prefix, self.host, e
                );
                tracing::info!("{error_msg}");
                return BackendResponse::proxy_error(path, &error_msg);
            }
        };
        tracing::debug!(
            "{} Response data: {}",
            self.log_prefix,
            crate::text::abbrev(&String::from_utf8_lossy(&body))
        );

        // After a successful non-probe query, report cache statistics when
        // configured to do so.
        if (self.pin_results || self.always_show_cache_stats) && pin_override.unwrap_or(true) {
            self.show_cache_stats().await;
        }

        // A 200 whose JSON body reports "status": "ERROR" is an upstream
        // error; the body is handed through verbatim. Non-JSON bodies (CSV
        // exports, admin command output) count as success.
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body)
            && value.get("status").and_then(|s| s.as_str()) == Some("ERROR")
        {
            let exception = value
                .get("exception")
                .and_then(|e| e.as_str())
                .unwrap_or("[error msg not found]");
            tracing::info!(
                "{} Response with ERROR: {}",
                self.log_prefix,
                compact_ws(exception)
            );
            return BackendResponse::BackendError { body };
        }

        BackendResponse::Ok {
            status,
            headers,
            body,
        }
    }

    /// Like [`Backend::query`], but deposit `(response, backend_id)` on the
    /// given channel. Used by the racing dispatcher; the id tells the
    /// consumer which backend a result came from. A closed receiver (the
    /// race was already decided) is not an error.
    pub async fn query_and_send(
        &self,
        path: String,
        timeout: Duration,
        tx: mpsc::Sender<(BackendResponse, u32)>,
    ) {
        let response = self.query(&path, timeout, None).await;
        let _ = tx.send((response, self.id)).await;
    }

    /// Fetch and log upstream cache statistics. Best-effort: failures are
    /// logged and swallowed.
    pub async fn show_cache_stats(&self) {
        let url = format!(
            "{}://{}{}?cmd=cachestats",
            self.scheme, self.authority, self.base_path
        );
        let result = async {
            let response = self.client.get(&url).timeout(self.timeout).send().await?;
            response.error_for_status()?.json::<CacheStats>().await
        }
        .await;

        match result {
            Ok(stats) => {
                tracing::info!(
                    "{} {} cached results + {} pinned results in {:.1} GB",
                    self.log_prefix,
                    stats.num_cached_elements,
                    stats.num_pinned_elements,
                    stats.pinned_size as f64 / 1e9
                );
            }
            Err(e) => {
                tracing::info!(
                    "{} Error getting cache statistics from {} ({})",
                    self.log_prefix,
                    self.authority,
                    e
                );
            }
        }
    }

    /// Clear the upstream cache completely, including pinned results.
    /// Best-effort; returns whether the upstream confirmed with a 200.
    pub async fn clear_cache(&self) -> bool {
        let url = format!(
            "{}://{}{}?cmd=clearcachecomplete",
            self.scheme, self.authority, self.base_path
        );
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) if response.status() == http::StatusCode::OK => true,
            Ok(response) => {
                tracing::info!(
                    "{} Cache clear failed (HTTP status {})",
                    self.log_prefix,
                    response.status()
                );
                false
            }
            Err(e) => {
                tracing::info!("{} Cache clear failed ({})", self.log_prefix, e);
                false
            }
        }
    }
}

/// Copy the headers the proxy forwards to its caller.
fn preserved_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in [CONTENT_TYPE, ACCESS_CONTROL_ALLOW_ORIGIN] {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}
