//! Analytics backends
//!
//! The session talks to exactly one [`AnalyticsClient`], chosen at
//! construction time by [`BackendKind`]:
//!
//! - [`BatchingClient`] queues events and lets a background loop deliver them
//!   in batches. Failures are reported per connection, so statistics use the
//!   bulk-failure model of [`StatisticsMonitor`](crate::stats::StatisticsMonitor).
//! - [`PerCallClient`] issues one request per call and derives statistics by
//!   scanning its completed and pending requests.
//!
//! Both deliver through a [`Transport`]. Production code uses
//! [`HttpTransport`]; tests plug in stubs.
//!
//! ## Threading
//!
//! Each client owns a small multi-thread tokio runtime. `track` and
//! `identify` only hand work to that runtime and return; nothing on the
//! caller's thread waits for network I/O.

mod batching;
mod http;
mod per_call;

pub use batching::BatchingClient;
pub use http::{HttpTransport, DEFAULT_BATCHING_HOST, DEFAULT_PER_CALL_HOST};
pub use per_call::PerCallClient;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;

use crate::config::AnalyticsConfig;
use crate::error::{Error, Result};
use crate::event::{Batch, Properties};
use crate::stats::DeliveryStatistics;

/// How long `shut_down` lets the delivery runtime wind down
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Capacity of the delivery notice channel
const NOTICE_CAPACITY: usize = 64;

/// Which backend implementation delivers events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Queued delivery, flushed by size or interval
    #[default]
    Batching,
    /// One request per call
    PerCall,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Batching => "batching",
            BackendKind::PerCall => "per_call",
        }
    }

    /// Whether the backend can be pointed at a different API host
    pub fn supports_host_override(&self) -> bool {
        matches!(self, BackendKind::Batching)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "batching" => Ok(BackendKind::Batching),
            "per_call" | "percall" => Ok(BackendKind::PerCall),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Options passed to [`AnalyticsClient::initialize`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub secret: String,
    /// API host override; rejected by backends without host redirection
    pub host: Option<String>,
    /// Queue length that triggers a flush
    pub batch_size: Option<usize>,
    /// Max time an incomplete batch waits
    pub flush_interval: Option<Duration>,
    pub timeout: Duration,
    pub max_retries: usize,
}

impl ClientOptions {
    pub fn new(secret: impl Into<String>) -> Self {
        let defaults = AnalyticsConfig::default();
        Self {
            secret: secret.into(),
            host: None,
            batch_size: None,
            flush_interval: None,
            timeout: defaults.timeout(),
            max_retries: defaults.max_retries,
        }
    }

    pub fn from_config(secret: impl Into<String>, config: &AnalyticsConfig) -> Self {
        Self {
            secret: secret.into(),
            host: config.host.clone(),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval(),
            timeout: config.timeout(),
            max_retries: config.max_retries,
        }
    }
}

/// Completion notification published by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryNotice {
    /// A delivery succeeded; `events` counts the track calls it carried
    Succeeded { events: usize },
    /// A delivery failed after retries
    Failed { error: String },
}

/// Fan-out of [`DeliveryNotice`]s to any subscribers
#[derive(Debug, Clone)]
pub struct DeliveryNotifier {
    sender: broadcast::Sender<DeliveryNotice>,
}

impl DeliveryNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice> {
        self.sender.subscribe()
    }

    pub fn succeeded(&self, events: usize) {
        // No subscribers is fine.
        let _ = self.sender.send(DeliveryNotice::Succeeded { events });
    }

    pub fn failed(&self, error: &Error) {
        let _ = self.sender.send(DeliveryNotice::Failed {
            error: error.to_string(),
        });
    }
}

impl Default for DeliveryNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// The remote sink events are delivered to
///
/// Implementations must be cheap to share across delivery tasks; `deliver`
/// may be called concurrently.
pub trait Transport: Send + Sync + 'static {
    /// Apply client options before the first delivery
    fn configure(&mut self, _options: &ClientOptions) -> Result<()> {
        Ok(())
    }

    /// Deliver one batch, retrying transient failures internally
    fn deliver(&self, batch: Batch) -> impl Future<Output = Result<()>> + Send;
}

/// Capabilities the session needs from a backend
pub trait AnalyticsClient: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Start the backend. Fails with [`Error::HostNotSupported`] when a host
    /// override is given to a backend that cannot honour it.
    fn initialize(&mut self, options: &ClientOptions) -> Result<()>;

    fn identify(&self, analytics_id: &str, traits: &Properties, context: &Properties)
        -> Result<()>;

    fn track(&self, analytics_id: &str, event_name: &str, properties: Properties) -> Result<()>;

    /// Best-effort request to deliver queued events now; never waits
    fn flush(&self);

    /// Release delivery resources. Bounded: never waits on the transport.
    fn shut_down(&self);

    fn statistics(&self) -> DeliveryStatistics;

    fn subscribe(&self) -> broadcast::Receiver<DeliveryNotice>;
}

/// Build the production client for `kind`
pub fn create_client(kind: BackendKind) -> Box<dyn AnalyticsClient> {
    match kind {
        BackendKind::Batching => Box::new(BatchingClient::new(HttpTransport::new(kind))),
        BackendKind::PerCall => Box::new(PerCallClient::new(HttpTransport::new(kind))),
    }
}

fn delivery_runtime(backend: BackendKind) -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name(format!("analytics-{}", backend))
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to create delivery runtime: {}", e)))
}

/// Stop a backend runtime, giving in-flight deliveries a short grace period
///
/// Waiting is not allowed on an async worker thread, so a caller inside a
/// tokio context releases the runtime without waiting.
fn release_runtime(runtime: Runtime) {
    if tokio::runtime::Handle::try_current().is_ok() {
        runtime.shutdown_background();
    } else {
        runtime.shutdown_timeout(SHUTDOWN_GRACE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("batching".parse::<BackendKind>().unwrap(), BackendKind::Batching);
        assert_eq!("per-call".parse::<BackendKind>().unwrap(), BackendKind::PerCall);
        assert_eq!("PER_CALL".parse::<BackendKind>().unwrap(), BackendKind::PerCall);
        assert!("carrier-pigeon".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_host_override_support() {
        assert!(BackendKind::Batching.supports_host_override());
        assert!(!BackendKind::PerCall.supports_host_override());
    }

    #[test]
    fn test_client_options_from_config() {
        let config = AnalyticsConfig {
            host: Some("https://collector.example.com".to_string()),
            batch_size: Some(10),
            flush_interval_secs: Some(3),
            ..Default::default()
        };
        let options = ClientOptions::from_config("secret", &config);
        assert_eq!(options.secret, "secret");
        assert_eq!(options.host.as_deref(), Some("https://collector.example.com"));
        assert_eq!(options.batch_size, Some(10));
        assert_eq!(options.flush_interval, Some(Duration::from_secs(3)));
        assert_eq!(options.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_release_runtime_outside_async_context() {
        let runtime = delivery_runtime(BackendKind::Batching).unwrap();
        runtime.spawn(std::future::pending::<()>());
        release_runtime(runtime);
    }

    #[tokio::test]
    async fn test_release_runtime_inside_async_context() {
        let runtime = delivery_runtime(BackendKind::PerCall).unwrap();
        runtime.spawn(std::future::pending::<()>());
        release_runtime(runtime);
    }

    #[test]
    fn test_notifier_without_subscribers_does_not_fail() {
        let notifier = DeliveryNotifier::new();
        notifier.succeeded(3);
        notifier.failed(&Error::Delivery("offline".to_string()));
    }

    #[test]
    fn test_notifier_delivers_to_subscribers() {
        let notifier = DeliveryNotifier::new();
        let mut rx = notifier.subscribe();
        notifier.failed(&Error::Delivery("offline".to_string()));

        assert_eq!(
            rx.try_recv().unwrap(),
            DeliveryNotice::Failed {
                error: "delivery error: offline".to_string()
            }
        );
    }
}
