//! Persisted per-user analytics settings
//!
//! The session only needs a handful of values to survive between runs: the
//! anonymous id, the identity fields a sibling installation may hand over, and
//! the last version launched (for `Created`/`Upgrade` detection).
//!
//! Layout of the file-backed store:
//!
//! ```text
//! <settings_root>/<vendor>/<product>/<profile>/settings.toml
//! ```
//!
//! Sibling channels of one product (`Bloom`, `BloomAlpha`, ...) therefore
//! share the `<vendor>` folder, which is what
//! [`ChannelMigrationResolver`](crate::migration::ChannelMigrationResolver)
//! searches.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::Result;

/// Name of the settings file inside a profile folder
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Profile folder used when the host does not name one
pub const DEFAULT_PROFILE: &str = "default";

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF: Duration = Duration::from_millis(100);

/// Values persisted between runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub id_for_analytics: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub last_version_launched: String,
}

impl AnalyticsSettings {
    pub fn has_id(&self) -> bool {
        !self.id_for_analytics.is_empty()
    }

    /// Adopt `other`'s id, keeping any identity field that is already set locally
    pub fn adopt(&mut self, other: AnalyticsSettings) {
        self.id_for_analytics = other.id_for_analytics;
        keep_local(&mut self.first_name, other.first_name);
        keep_local(&mut self.last_name, other.last_name);
        keep_local(&mut self.last_version_launched, other.last_version_launched);
        keep_local(&mut self.email, other.email);
    }

    /// Parse a settings file
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn keep_local(local: &mut String, imported: String) {
    if local.is_empty() {
        *local = imported;
    }
}

/// Narrow load/save boundary for persisted settings
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<AnalyticsSettings>;

    fn save(&self, settings: &AnalyticsSettings) -> Result<()>;

    /// Path of the backing file, if there is one
    fn location(&self) -> Option<PathBuf> {
        None
    }
}

/// Save, retrying a few times with a short backoff; a final failure is logged
/// and swallowed.
pub fn save_with_retry(store: &dyn SettingsStore, settings: &AnalyticsSettings) -> bool {
    for attempt in 1..=SAVE_ATTEMPTS {
        match store.save(settings) {
            Ok(()) => return true,
            Err(e) if attempt < SAVE_ATTEMPTS => {
                tracing::debug!(attempt, error = %e, "Settings save failed, retrying");
                thread::sleep(SAVE_BACKOFF * attempt);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Giving up on saving analytics settings");
            }
        }
    }
    false
}

/// TOML file store
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    /// Store for `<settings_root>/<vendor>/<product>/default/settings.toml`
    pub fn new(settings_root: &Path, vendor: &str, product: &str) -> Self {
        Self::with_profile(settings_root, vendor, product, DEFAULT_PROFILE)
    }

    pub fn with_profile(settings_root: &Path, vendor: &str, product: &str, profile: &str) -> Self {
        Self {
            path: settings_root
                .join(vendor)
                .join(product)
                .join(profile)
                .join(SETTINGS_FILE_NAME),
        }
    }

    /// Store backed by an explicit file path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for FileSettingsStore {
    /// A missing file is a first run, not an error.
    fn load(&self) -> Result<AnalyticsSettings> {
        if !self.path.exists() {
            return Ok(AnalyticsSettings::default());
        }
        AnalyticsSettings::read_from(&self.path)
    }

    fn save(&self, settings: &AnalyticsSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(settings)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    fn location(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }
}

/// In-memory store; clones share the same settings
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    settings: Arc<Mutex<AnalyticsSettings>>,
}

impl MemorySettingsStore {
    pub fn new(settings: AnalyticsSettings) -> Self {
        Self {
            settings: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn snapshot(&self) -> AnalyticsSettings {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<AnalyticsSettings> {
        Ok(self.snapshot())
    }

    fn save(&self, settings: &AnalyticsSettings) -> Result<()> {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        Ok(())
    }
}
