//! The analytics session
//!
//! One [`AnalyticsSession`] may be live per process. Constructing it:
//!
//! 1. loads persisted settings, adopting a sibling channel's id when there is
//!    none yet and generating a fresh one as a last resort
//! 2. starts the configured backend and identifies the user
//! 3. emits `Created` (first launch) or `Upgrade` (version changed)
//! 4. emits `Launch`, after the optional location lookup has finished
//!
//! With tracking disabled the session is an inert shell: calls are accepted
//! and discarded, the backend is never touched.
//!
//! [`AnalyticsSession::shutdown`] (also run on drop) waits a bounded time for
//! outstanding events, then releases the backend whether or not they made it.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::client::{create_client, AnalyticsClient, ClientOptions, DeliveryNotice, DeliveryNotifier};
use crate::config::{AnalyticsConfig, Config};
use crate::enrichment::LocationLookup;
use crate::error::{Error, Result};
use crate::event::{
    EventRecord, Properties, CREATED_EVENT, EXCEPTION_EVENT, LAUNCH_EVENT, UPGRADE_EVENT,
};
use crate::identity::Identity;
use crate::migration::ChannelMigrationResolver;
use crate::settings::{save_with_retry, AnalyticsSettings, SettingsStore};
use crate::stats::DeliveryStatistics;

/// Exception reports beyond this count are dropped for the rest of the run
pub const MAX_EXCEPTION_REPORTS_PER_RUN: usize = 10;

static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// Held by the live session; releases the process-wide slot on drop
struct SessionSlot;

impl SessionSlot {
    fn claim() -> Result<Self> {
        SESSION_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| SessionSlot)
            .map_err(|_| Error::AlreadyConstructed)
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        SESSION_LIVE.store(false, Ordering::Release);
    }
}

/// What the host knows at startup
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Write key / project token for the backend
    pub api_secret: String,
    pub identity: Identity,
    /// Full version of the host application, e.g. `3.2.1.0`
    pub app_version: String,
    /// Sent with every event, on top of `analytics.default_properties`
    pub default_properties: Properties,
    /// Reported as `Browser` and `$browser`
    pub os_label: String,
    /// Reported as `64bit OS`; defaults to the width of this process
    pub os_is_64bit: bool,
    /// Sent with `Launch` as `installedUiLangId`; defaults to the `LANG` language
    pub installed_ui_language: String,
    /// Root searched for sibling installations
    pub settings_root: PathBuf,
    pub analytics: AnalyticsConfig,
}

impl SessionOptions {
    pub fn new(
        api_secret: impl Into<String>,
        identity: Identity,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            api_secret: api_secret.into(),
            identity,
            app_version: app_version.into(),
            default_properties: Properties::new(),
            os_label: std::env::consts::OS.to_string(),
            os_is_64bit: cfg!(target_pointer_width = "64"),
            installed_ui_language: system_ui_language(),
            settings_root: Config::settings_root(),
            analytics: AnalyticsConfig::default(),
        }
    }

    pub fn with_config(mut self, analytics: AnalyticsConfig) -> Self {
        self.analytics = analytics;
        self
    }
}

/// State shared between the session and the location lookup task
struct Tracker {
    client: Box<dyn AnalyticsClient>,
    analytics_id: String,
    retain_pii: bool,
    os_label: String,
    launch_properties: Properties,
    identity: RwLock<Identity>,
    context: RwLock<Properties>,
    defaults: RwLock<Properties>,
    exceptions_reported: AtomicUsize,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

impl Tracker {
    fn track(&self, event_name: &str, properties: Properties) -> Result<()> {
        // Merged under the read lock so a concurrent default change lands
        // either wholly before or wholly after this event.
        let record = EventRecord::with_properties(event_name, properties)
            .merge_defaults(&read(&self.defaults));
        tracing::trace!(event = %record.name, "Tracking event");
        self.client.track(&self.analytics_id, &record.name, record.properties)
    }

    fn launch(&self) -> Result<()> {
        self.track(LAUNCH_EVENT, self.launch_properties.clone())
    }

    fn identify(&self) -> Result<()> {
        let traits = self.traits();
        let context = read(&self.context).clone();
        self.client.identify(&self.analytics_id, &traits, &context)
    }

    fn set_identity(&self, identity: &Identity) {
        let effective = if self.retain_pii {
            identity.clone()
        } else {
            identity.sanitized()
        };
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = effective;
    }

    fn traits(&self) -> Properties {
        let identity = read(&self.identity);
        let mut traits = Properties::from([
            ("lastName".to_string(), identity.last_name.clone()),
            ("firstName".to_string(), identity.first_name.clone()),
            ("Email".to_string(), identity.email.clone()),
            ("UILanguage".to_string(), identity.ui_language_code.clone()),
            ("$browser".to_string(), self.os_label.clone()),
        ]);
        for (key, value) in &identity.other_properties {
            if !value.trim().is_empty() {
                traits.insert(key.clone(), value.clone());
            }
        }
        traits
    }

    fn add_location(&self, location: &Properties) {
        self.context
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(location.clone());
        self.defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(location.clone());
    }
}

/// Process-wide analytics session
pub struct AnalyticsSession {
    /// `None` when tracking is disabled
    tracker: Option<Arc<Tracker>>,
    enrichment: Mutex<Option<Runtime>>,
    closed: AtomicBool,
    shutdown_max_wait: Duration,
    shutdown_poll_interval: Duration,
    _slot: SessionSlot,
}

impl AnalyticsSession {
    /// Start a session with the backend named in `options.analytics.backend`
    pub fn new(options: SessionOptions, store: Box<dyn SettingsStore>) -> Result<Self> {
        let client = create_client(options.analytics.backend);
        Self::with_client(options, client, store)
    }

    /// Start a session delivering through `client`
    ///
    /// Fails with [`Error::AlreadyConstructed`] while another session is live
    /// and with [`Error::HostNotSupported`] when the backend rejects the
    /// configured host.
    pub fn with_client(
        options: SessionOptions,
        mut client: Box<dyn AnalyticsClient>,
        store: Box<dyn SettingsStore>,
    ) -> Result<Self> {
        let slot = SessionSlot::claim()?;
        let config = &options.analytics;
        config.validate()?;

        let mut session = Self {
            tracker: None,
            enrichment: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown_max_wait: config.shutdown_max_wait(),
            shutdown_poll_interval: config.shutdown_poll_interval(),
            _slot: slot,
        };

        if !config.allow_tracking {
            tracing::info!("Analytics disabled, session will discard all calls");
            return Ok(session);
        }

        let mut settings = store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Could not load analytics settings, starting fresh");
            AnalyticsSettings::default()
        });

        if !settings.has_id() {
            let resolver = ChannelMigrationResolver::for_installation(
                &options.settings_root,
                config.vendor.as_deref(),
                config.product.as_deref(),
                store.location().as_deref(),
            );
            if let Some(sibling) = resolver.resolve() {
                settings.adopt(sibling);
                save_with_retry(store.as_ref(), &settings);
            }
        }

        client.initialize(&ClientOptions::from_config(
            options.api_secret.clone(),
            config,
        ))?;

        if !settings.has_id() {
            settings.id_for_analytics = Uuid::new_v4().to_string();
            save_with_retry(store.as_ref(), &settings);
        }

        let identity = if config.retain_pii {
            options.identity.clone()
        } else {
            options.identity.sanitized()
        };

        let mut defaults = config.default_properties.clone();
        defaults.extend(options.default_properties.clone());
        defaults.insert("Version".to_string(), short_version(&options.app_version));
        defaults.insert("FullVersion".to_string(), options.app_version.clone());
        defaults.insert("UserName".to_string(), identity.display_name());
        defaults.insert("Browser".to_string(), options.os_label.clone());
        defaults.insert(
            "64bit OS".to_string(),
            bool_label(options.os_is_64bit).to_string(),
        );
        defaults.insert(
            "64bit App".to_string(),
            bool_label(cfg!(target_pointer_width = "64")).to_string(),
        );

        let mut launch_properties = Properties::new();
        if !options.installed_ui_language.is_empty() {
            launch_properties.insert(
                "installedUiLangId".to_string(),
                options.installed_ui_language.clone(),
            );
        }

        let context = Properties::from([(
            "language".to_string(),
            identity.ui_language_code.clone(),
        )]);

        let tracker = Arc::new(Tracker {
            client,
            analytics_id: settings.id_for_analytics.clone(),
            retain_pii: config.retain_pii,
            os_label: options.os_label.clone(),
            launch_properties,
            identity: RwLock::new(identity),
            context: RwLock::new(context),
            defaults: RwLock::new(defaults),
            exceptions_reported: AtomicUsize::new(0),
        });
        session.tracker = Some(Arc::clone(&tracker));

        tracker.identify()?;

        if settings.last_version_launched.is_empty() {
            tracker.track(CREATED_EVENT, Properties::new())?;
        } else if settings.last_version_launched != options.app_version {
            let previous = Properties::from([(
                "OldVersion".to_string(),
                settings.last_version_launched.clone(),
            )]);
            tracker.track(UPGRADE_EVENT, previous)?;
        }

        settings.last_version_launched = options.app_version.clone();
        save_with_retry(store.as_ref(), &settings);

        match LocationLookup::from_config(config) {
            Some(lookup) => {
                let runtime = launch_after_lookup(Arc::clone(&tracker), lookup, config.timeout())?;
                *session
                    .enrichment
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(runtime);
            }
            None => tracker.launch()?,
        }

        tracing::info!(
            backend = %config.backend,
            version = %options.app_version,
            "Analytics session started"
        );
        Ok(session)
    }

    /// Whether events are actually sent anywhere
    pub fn is_tracking(&self) -> bool {
        self.tracker.is_some()
    }

    /// Anonymous id of this installation (tracking sessions only)
    pub fn analytics_id(&self) -> Option<&str> {
        self.tracker.as_deref().map(|t| t.analytics_id.as_str())
    }

    fn active(&self) -> Result<Option<&Tracker>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        Ok(self.tracker.as_deref())
    }

    /// Record an event; default properties are merged in and win on collision
    pub fn track(&self, event_name: &str, properties: Properties) -> Result<()> {
        match self.active()? {
            Some(tracker) => tracker.track(event_name, properties),
            None => Ok(()),
        }
    }

    /// Send updated user information now rather than at the next launch
    pub fn identify(&self, identity: &Identity) -> Result<()> {
        match self.active()? {
            Some(tracker) => {
                tracker.set_identity(identity);
                tracker.identify()
            }
            None => Ok(()),
        }
    }

    /// Report an error with its message and trace
    ///
    /// Only the first [`MAX_EXCEPTION_REPORTS_PER_RUN`] reports are sent.
    pub fn report_exception(&self, error: &dyn StdError, properties: Properties) -> Result<()> {
        let Some(tracker) = self.active()? else {
            return Ok(());
        };

        let reported = tracker.exceptions_reported.fetch_add(1, Ordering::AcqRel) + 1;
        if reported > MAX_EXCEPTION_REPORTS_PER_RUN {
            tracing::debug!(reported, "Exception report dropped, per-run cap reached");
            return Ok(());
        }

        let mut report = Properties::from([
            ("Message".to_string(), error.to_string()),
            ("Stack Trace".to_string(), stack_trace(error)),
        ]);
        for (key, value) in properties {
            report.entry(key).or_insert(value);
        }
        tracker.track(EXCEPTION_EVENT, report)
    }

    /// Add or replace a property sent with every subsequent event
    pub fn set_default_property(&self, key: &str, value: impl Into<String>) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidPropertyKey);
        }
        if let Some(tracker) = self.active()? {
            tracker
                .defaults
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key.to_string(), value.into());
        }
        Ok(())
    }

    /// Ask the backend to deliver queued events now; does not wait
    pub fn flush(&self) -> Result<()> {
        if let Some(tracker) = self.active()? {
            tracker.client.flush();
        }
        Ok(())
    }

    pub fn statistics(&self) -> DeliveryStatistics {
        self.tracker
            .as_deref()
            .map(|t| t.client.statistics())
            .unwrap_or_default()
    }

    /// Delivery outcomes as the backend reports them
    pub fn subscribe_delivery_notices(&self) -> broadcast::Receiver<DeliveryNotice> {
        match self.tracker.as_deref() {
            Some(tracker) => tracker.client.subscribe(),
            None => DeliveryNotifier::new().subscribe(),
        }
    }

    /// Wait (bounded) for outstanding events, then release the backend
    ///
    /// Returns the final statistics. Later calls return immediately; tracking
    /// calls after shutdown fail with [`Error::SessionClosed`].
    pub fn shutdown(&self) -> DeliveryStatistics {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.statistics();
        }

        if let Some(runtime) = self
            .enrichment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runtime.shutdown_background();
        }

        let Some(tracker) = self.tracker.as_deref() else {
            return DeliveryStatistics::default();
        };

        tracker.client.flush();
        let drained = wait_for_drain(
            tracker.client.as_ref(),
            self.shutdown_max_wait,
            self.shutdown_poll_interval,
        );
        tracker.client.shut_down();

        let stats = tracker.client.statistics();
        tracing::info!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            drained = drained.is_drained(),
            "Analytics session shut down"
        );
        stats
    }
}

impl Drop for AnalyticsSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Poll until nothing is outstanding or `max_wait` has passed
fn wait_for_drain(
    client: &dyn AnalyticsClient,
    max_wait: Duration,
    poll_interval: Duration,
) -> DeliveryStatistics {
    let started = Instant::now();
    loop {
        let stats = client.statistics();
        if stats.is_drained() {
            return stats;
        }

        let elapsed = started.elapsed();
        if elapsed >= max_wait {
            tracing::warn!(
                outstanding = stats.outstanding(),
                "Gave up waiting for analytics delivery"
            );
            return stats;
        }
        thread::sleep(poll_interval.min(max_wait - elapsed));
    }
}

/// Run the location lookup in the background, then send `Launch` either way
fn launch_after_lookup(
    tracker: Arc<Tracker>,
    lookup: LocationLookup,
    timeout: Duration,
) -> Result<Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("analytics-enrichment")
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to create enrichment runtime: {}", e)))?;

    runtime.spawn(async move {
        match lookup.fetch(timeout).await {
            Ok(location) => {
                tracing::debug!(?location, "Location lookup succeeded");
                tracker.add_location(&location);
                if let Err(e) = tracker.identify() {
                    tracing::debug!(error = %e, "Re-identify after location lookup failed");
                }
            }
            Err(e) => {
                tracing::debug!(url = %lookup.url(), error = %e, "Location lookup failed");
            }
        }
        if let Err(e) = tracker.launch() {
            tracing::debug!(error = %e, "Launch event not sent");
        }
    });

    Ok(runtime)
}

fn bool_label(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Language of the user's locale, from the usual POSIX variables
fn system_ui_language() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|locale| language_from_locale(&locale))
        .unwrap_or_default()
}

/// `fr` from `fr_FR.UTF-8`; `None` for the C locale or an empty value
fn language_from_locale(locale: &str) -> Option<String> {
    let language = locale.split(['_', '.', '@']).next()?.trim();
    match language {
        "" | "C" | "POSIX" => None,
        _ => Some(language.to_lowercase()),
    }
}

/// `major.minor` of a dotted version
fn short_version(full: &str) -> String {
    full.split('.').take(2).collect::<Vec<_>>().join(".")
}

/// Source chain of `error`, followed by a backtrace when capturing is enabled
fn stack_trace(error: &dyn StdError) -> String {
    let mut lines = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }

    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        lines.push(backtrace.to_string());
    }
    lines.join("\n")
}
