//! # desktop-analytics-core
//!
//! Usage telemetry for desktop applications.
//!
//! This library provides:
//! - An [`AnalyticsSession`] that records events and user traits
//! - Two backends: a batching one and a one-request-per-call one
//! - Delivery statistics and a bounded-wait shutdown
//! - Migration of the anonymous id from sibling channel installations
//! - Configuration management and logging infrastructure
//!
//! ## Privacy
//!
//! Unless `retain_pii` is set, names are reduced to an initial plus a short
//! digest and emails to their domain before anything leaves the process.
//!
//! ## Example
//!
//! ```rust,no_run
//! use desktop_analytics_core::{
//!     AnalyticsSession, Config, FileSettingsStore, Identity, Properties, SessionOptions,
//! };
//!
//! let config = Config::load().expect("failed to load config");
//! let options = SessionOptions::new("write-key", Identity::default(), "3.2.1")
//!     .with_config(config.analytics);
//! let store = FileSettingsStore::new(&Config::settings_root(), "Acme", "Editor");
//!
//! let session = AnalyticsSession::new(options, Box::new(store)).expect("session");
//! session.track("Save PDF", Properties::new()).unwrap();
//! let stats = session.shutdown();
//! println!("{} of {} delivered", stats.succeeded, stats.submitted);
//! ```

// Re-export commonly used items at the crate root
pub use client::{AnalyticsClient, BackendKind, DeliveryNotice};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventRecord, Properties};
pub use identity::Identity;
pub use session::{AnalyticsSession, SessionOptions};
pub use settings::{AnalyticsSettings, FileSettingsStore, MemorySettingsStore, SettingsStore};
pub use stats::{DeliveryStatistics, StatisticsMonitor};

// Public modules
pub mod client;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod event;
pub mod identity;
pub mod logging;
pub mod migration;
pub mod session;
pub mod settings;
pub mod stats;
