//! Blocking HTTP transport with bounded retries.
//!
//! [`HttpClient`] is the seam between the network and everything above it.
//! The catalog client and the fetcher only ever see an `&dyn HttpClient`,
//! so tests swap in an in-memory implementation and never open a socket.
//!
//! [`get_with_retry`] wraps any client with the retry policy: transient
//! failures are retried after `min(base * 2^attempt, cap)`; permanent ones
//! (4xx other than 429) return immediately. Backoff sleeps end early when the
//! run is cancelled or passes its deadline.

use std::io::Read;
use std::time::Duration;
use thiserror::Error;

use crate::config::HttpConfig;
use crate::control::{Interrupt, RunControl};

/// Longest single sleep between checks of the run control.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("IO error reading {url}: {source}")]
    Io {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request to {url} stopped: {source}")]
    Interrupted {
        url: String,
        #[source]
        source: Interrupt,
    },
}

impl HttpError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Status { status, .. } => *status >= 500 || *status == 429,
            HttpError::Transport { .. } | HttpError::Io { .. } => true,
            HttpError::Interrupted { .. } => false,
        }
    }

    /// The URL no longer names a resource (404 or 410).
    pub fn is_not_found(&self) -> bool {
        matches!(self, HttpError::Status { status: 404 | 410, .. })
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        match self {
            HttpError::Interrupted { source, .. } => Some(*source),
            _ => None,
        }
    }
}

/// A fetched response body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub body: Vec<u8>,
    /// `Content-Type` header, without parameters, lowercased.
    pub content_type: Option<String>,
}

pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;
}

/// `ureq`-backed client with a per-call timeout.
pub struct UreqClient {
    agent: ureq::Agent,
}

impl UreqClient {
    pub fn new(config: &HttpConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build();
        Self { agent }
    }
}

impl HttpClient for UreqClient {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        match self.agent.get(url).call() {
            Ok(response) => {
                let content_type = response.header("Content-Type").map(normalize_content_type);
                let mut body = Vec::new();
                response
                    .into_reader()
                    .read_to_end(&mut body)
                    .map_err(|source| HttpError::Io {
                        url: url.to_string(),
                        source,
                    })?;
                Ok(HttpResponse { body, content_type })
            }
            Err(ureq::Error::Status(status, _)) => Err(HttpError::Status {
                url: url.to_string(),
                status,
            }),
            Err(ureq::Error::Transport(transport)) => Err(HttpError::Transport {
                url: url.to_string(),
                message: transport.to_string(),
            }),
        }
    }
}

/// `"application/zip; charset=binary"` → `"application/zip"`
pub fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or(raw)
        .trim()
        .to_ascii_lowercase()
}

/// Delay before retry number `attempt` (0-based).
pub fn backoff_delay(config: &HttpConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let ms = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_cap_ms);
    Duration::from_millis(ms)
}

/// Sleep for `delay`, waking early if `control` interrupts the run.
fn sleep_unless_interrupted(delay: Duration, control: &RunControl) -> Result<(), Interrupt> {
    let mut remaining = delay;
    while !remaining.is_zero() {
        control.check()?;
        let slice = remaining.min(SLEEP_SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    control.check()
}

/// GET with the configured retry policy.
pub fn get_with_retry(
    client: &dyn HttpClient,
    config: &HttpConfig,
    url: &str,
    control: &RunControl,
) -> Result<HttpResponse, HttpError> {
    let mut retries = 0;
    loop {
        match client.get(url) {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && retries < config.max_retries => {
                let delay = backoff_delay(config, retries);
                retries += 1;
                tracing::warn!(
                    error = %e,
                    retry = retries,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "request failed, retrying"
                );
                sleep_unless_interrupted(delay, control).map_err(|source| {
                    tracing::warn!(url, error = %source, "retries abandoned");
                    HttpError::Interrupted {
                        url: url.to_string(),
                        source,
                    }
                })?;
            }
            Err(e) => {
                if e.is_transient() {
                    tracing::error!(error = %e, "request failed after all retries");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::MockHttp;

    fn fast_config(max_retries: u32) -> HttpConfig {
        HttpConfig {
            timeout_secs: 1,
            max_retries,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
        }
    }

    fn get(http: &MockHttp, config: &HttpConfig, url: &str) -> Result<HttpResponse, HttpError> {
        get_with_retry(http, config, url, &RunControl::new())
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = HttpConfig {
            backoff_base_ms: 100,
            backoff_cap_ms: 500,
            ..HttpConfig::default()
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(500));
        assert_eq!(backoff_delay(&config, 60), Duration::from_millis(500));
    }

    #[test]
    fn transient_classification() {
        let status = |s| HttpError::Status {
            url: "u".into(),
            status: s,
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(status(404).is_not_found());
        assert!(
            HttpError::Transport {
                url: "u".into(),
                message: "reset".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let http = MockHttp::new();
        http.fail_times("https://x/a", 503, 2);
        http.serve("https://x/a", b"ok".to_vec(), None);

        let response = get(&http, &fast_config(3), "https://x/a").unwrap();
        assert_eq!(response.body, b"ok");
        assert_eq!(http.calls("https://x/a"), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let http = MockHttp::new();
        http.fail_times("https://x/a", 500, 10);

        let err = get(&http, &fast_config(2), "https://x/a").unwrap_err();
        assert!(matches!(err, HttpError::Status { status: 500, .. }));
        assert_eq!(http.calls("https://x/a"), 3);
    }

    #[test]
    fn permanent_failure_is_not_retried() {
        let http = MockHttp::new();
        let err = get(&http, &fast_config(3), "https://x/missing").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(http.calls("https://x/missing"), 1);
    }

    #[test]
    fn cancelled_run_stops_retrying() {
        let http = MockHttp::new();
        http.fail_times("https://x/a", 503, 10);
        let control = RunControl::new();
        control.cancel();

        let err = get_with_retry(&http, &fast_config(5), "https://x/a", &control).unwrap_err();
        assert_eq!(err.interrupt(), Some(Interrupt::Cancelled));
        assert!(!err.is_transient());
        assert_eq!(http.calls("https://x/a"), 1);
    }

    #[test]
    fn deadline_cuts_backoff_short() {
        let http = MockHttp::new();
        http.fail_times("https://x/a", 503, 10);
        let config = HttpConfig {
            timeout_secs: 1,
            max_retries: 3,
            backoff_base_ms: 60_000,
            backoff_cap_ms: 60_000,
        };
        let control = RunControl::new().with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = get_with_retry(&http, &config, "https://x/a", &control).unwrap_err();
        assert_eq!(err.interrupt(), Some(Interrupt::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(http.calls("https://x/a"), 1);
    }

    #[test]
    fn content_type_parameters_are_stripped() {
        assert_eq!(
            normalize_content_type("Application/Zip; charset=binary"),
            "application/zip"
        );
    }
}
