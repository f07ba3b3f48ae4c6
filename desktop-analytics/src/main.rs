//! desktop-analytics - command-line companion for the analytics library
//!
//! This tool provides commands for:
//! - Checking the effective analytics configuration
//! - Sending a short scripted session to a backend and reporting the outcome
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/desktop-analytics/config.toml
//! - Settings: $XDG_DATA_HOME/<vendor>/<product>/default/settings.toml
//! - Logs: $XDG_STATE_HOME/desktop-analytics/

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use desktop_analytics_core::{
    AnalyticsSession, BackendKind, Config, FileSettingsStore, Identity, Properties,
    SessionOptions,
};
use std::time::Instant;

/// Vendor and product folder used when the config names neither
const DEFAULT_SETTINGS_FOLDER: &str = "desktop-analytics";

#[derive(Parser)]
#[command(name = "desktop-analytics")]
#[command(about = "Send desktop usage analytics")]
#[command(version)]
struct Args {
    /// Write debug logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show analytics configuration
    Status,

    /// Run a short session: launch, a few events, shutdown
    Send {
        /// API secret (default: from config)
        #[arg(short, long)]
        secret: Option<String>,

        /// Backend to deliver through: batching or per_call (default: from config)
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Event to track; repeat for several
        #[arg(short, long = "event")]
        events: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(
            desktop_analytics_core::logging::init(&config.logging)
                .context("failed to initialize logging")?,
        )
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Send {
            secret,
            backend,
            events,
        } => cmd_send(config, secret, backend, events),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Desktop Analytics Configuration");
    println!("===============================");
    println!();

    let analytics = &config.analytics;

    println!("Config File:     {}", Config::config_path().display());
    println!("Tracking:        {}", analytics.allow_tracking);
    println!("Backend:         {}", analytics.backend);
    println!(
        "API Secret:      {}",
        if analytics.api_secret.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Host:            {}",
        analytics.host.as_deref().unwrap_or("<default>")
    );
    println!(
        "Batch Size:      {}",
        analytics
            .batch_size
            .map(|n| n.to_string())
            .unwrap_or_else(|| "<unbatched>".to_string())
    );
    if let Some(interval) = analytics.flush_interval_secs {
        println!("Flush Interval:  {}s", interval);
    }
    println!("Retain PII:      {}", analytics.retain_pii);
    println!("Timeout:         {}s", analytics.timeout_secs);
    println!("Max Retries:     {}", analytics.max_retries);
    println!("Shutdown Wait:   {}ms", analytics.shutdown_max_wait_ms);

    let lookup = desktop_analytics_core::enrichment::LocationLookup::from_config(analytics);
    println!(
        "Location Lookup: {}",
        lookup.as_ref().map(|l| l.url()).unwrap_or("<disabled>")
    );

    println!();
    let store = settings_store(config);
    println!("Settings File:   {}", store.path().display());
    println!(
        "Log File:        {}",
        desktop_analytics_core::logging::log_file_path().display()
    );

    if analytics.host.is_some() && !analytics.backend.supports_host_override() {
        println!();
        println!(
            "Warning: the {} backend does not support a host override",
            analytics.backend
        );
    }

    Ok(())
}

fn cmd_send(
    config: Config,
    secret: Option<String>,
    backend: Option<BackendKind>,
    events: Vec<String>,
) -> Result<()> {
    let mut analytics = config.analytics.clone();
    let Some(secret) = secret.or_else(|| analytics.api_secret.clone()) else {
        bail!("no API secret: pass --secret or set analytics.api_secret in config.toml");
    };
    if let Some(backend) = backend {
        analytics.backend = backend;
    }

    let events = if events.is_empty() {
        vec!["SomeEvent".to_string()]
    } else {
        events
    };

    let identity = Identity {
        first_name: "John".to_string(),
        last_name: "Smith".to_string(),
        email: "john@example.com".to_string(),
        ui_language_code: "fr".to_string(),
        ..Default::default()
    };

    let store = settings_store(&config);
    let mut options = SessionOptions::new(secret, identity, env!("CARGO_PKG_VERSION"))
        .with_config(analytics);
    options
        .default_properties
        .insert("channel".to_string(), "cli".to_string());

    let started = Instant::now();
    tracing::debug!(
        backend = %options.analytics.backend,
        events = events.len(),
        "Starting session"
    );
    let session = AnalyticsSession::new(options, Box::new(store))
        .context("failed to start analytics session")?;

    println!(
        "Session started ({})",
        if session.is_tracking() {
            "tracking"
        } else {
            "tracking disabled"
        }
    );

    for (i, event) in events.iter().enumerate() {
        session.set_default_property(
            "TimeSinceLaunch",
            format!("{} ms", started.elapsed().as_millis()),
        )?;
        let properties = Properties::from([("SomeValue".to_string(), i.to_string())]);
        session
            .track(event, properties)
            .with_context(|| format!("failed to track {}", event))?;
        println!("  Tracked: {}", event);
    }
    session.flush()?;

    println!("Shutting down...");
    let stats = session.shutdown();
    println!(
        "Succeeded: {}; Submitted: {}; Failed: {}",
        stats.succeeded, stats.submitted, stats.failed
    );

    Ok(())
}

fn settings_store(config: &Config) -> FileSettingsStore {
    let analytics = &config.analytics;
    FileSettingsStore::new(
        &Config::settings_root(),
        analytics.vendor.as_deref().unwrap_or(DEFAULT_SETTINGS_FOLDER),
        analytics
            .product
            .as_deref()
            .unwrap_or(DEFAULT_SETTINGS_FOLDER),
    )
}
