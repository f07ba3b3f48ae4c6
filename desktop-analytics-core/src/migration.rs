//! Channel migration
//!
//! When an installation has no analytics id yet, a sibling channel of the
//! same product (`BloomAlpha` next to `Bloom`, say) may already have one.
//! Reusing it keeps usage statistics continuous across channel switches.
//!
//! The search is a heuristic:
//!
//! 1. Each [`SearchOrigin`] names a settings root and a product name. Origins
//!    are tried in order until one yields an id.
//! 2. The first five characters of the product name form a folder prefix.
//!    Short on purpose: extra candidates are filtered out later, a missed
//!    sibling is lost for good.
//! 3. Candidates are `<root>/<prefix>*/<profile>/settings.toml`.
//! 4. Candidates are visited most recently modified first; the first one with
//!    a non-empty id wins. Unreadable or unparsable candidates are skipped.
//!
//! Nothing here is an error for the caller: "nothing found" just means a
//! fresh id gets generated.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::settings::{AnalyticsSettings, SETTINGS_FILE_NAME};

/// Number of product-name characters used as the sibling folder prefix
pub const PREFIX_LEN: usize = 5;

/// Where to look for sibling installations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOrigin {
    /// Folder holding one subfolder per product
    pub settings_root: PathBuf,
    pub product_name: String,
}

impl SearchOrigin {
    pub fn new(settings_root: impl Into<PathBuf>, product_name: impl Into<String>) -> Self {
        Self {
            settings_root: settings_root.into(),
            product_name: product_name.into(),
        }
    }

    /// Origin from the vendor folder and product name
    ///
    /// The product defaults to the running executable's name. Returns `None`
    /// when no vendor is known or no product name can be determined.
    pub fn from_vendor(
        settings_root: &Path,
        vendor: Option<&str>,
        product: Option<&str>,
    ) -> Option<Self> {
        let vendor = vendor.filter(|v| !v.is_empty())?;
        let product = match product.filter(|p| !p.is_empty()) {
            Some(p) => p.to_string(),
            None => current_exe_name()?,
        };
        Some(Self::new(settings_root.join(vendor), product))
    }

    /// Origin derived from this installation's own settings file
    ///
    /// `<root>/<product>/<profile>/settings.toml`: the product folder name is
    /// cut at `.exe` or `_StrongName_` if present.
    pub fn from_settings_file(settings_file: &Path) -> Option<Self> {
        if settings_file.file_name()? != SETTINGS_FILE_NAME {
            return None;
        }
        let product_dir = settings_file.parent()?.parent()?;
        let folder_name = product_dir.file_name()?.to_str()?;
        let settings_root = product_dir.parent()?;

        let product_name = [".exe", "_StrongName_"]
            .iter()
            .find_map(|marker| match folder_name.find(marker) {
                Some(i) if i > 0 => Some(&folder_name[..i]),
                _ => None,
            })
            .unwrap_or(folder_name);

        Some(Self::new(settings_root, product_name))
    }

    fn prefix(&self) -> String {
        self.product_name.chars().take(PREFIX_LEN).collect()
    }

    /// Settings files of candidate siblings, most recently modified first
    fn candidates(&self) -> Vec<PathBuf> {
        let pattern = format!(
            "{}/{}*/*/{}",
            glob::Pattern::escape(&self.settings_root.to_string_lossy()),
            glob::Pattern::escape(&self.prefix()),
            SETTINGS_FILE_NAME
        );

        let entries = match glob::glob(&pattern) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(pattern = %pattern, error = %e, "Invalid sibling search pattern");
                return Vec::new();
            }
        };

        let mut files: Vec<(PathBuf, SystemTime)> = entries
            .flatten()
            .filter(|path| path.is_file())
            .map(|path| {
                let modified = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (path, modified)
            })
            .collect();

        files.sort_by(|a, b| b.1.cmp(&a.1));
        files.into_iter().map(|(path, _)| path).collect()
    }
}

/// Finds a previously generated analytics id in a sibling installation
#[derive(Debug, Clone, Default)]
pub struct ChannelMigrationResolver {
    origins: Vec<SearchOrigin>,
}

impl ChannelMigrationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an origin; duplicates are ignored
    pub fn with_origin(mut self, origin: SearchOrigin) -> Self {
        if !self.origins.contains(&origin) {
            self.origins.push(origin);
        }
        self
    }

    /// Resolver trying the vendor folder first, then the folder around
    /// this installation's own settings file.
    pub fn for_installation(
        settings_root: &Path,
        vendor: Option<&str>,
        product: Option<&str>,
        settings_file: Option<&Path>,
    ) -> Self {
        let mut resolver = Self::new();
        if let Some(origin) = SearchOrigin::from_vendor(settings_root, vendor, product) {
            resolver = resolver.with_origin(origin);
        }
        if let Some(origin) = settings_file.and_then(SearchOrigin::from_settings_file) {
            resolver = resolver.with_origin(origin);
        }
        resolver
    }

    pub fn origins(&self) -> &[SearchOrigin] {
        &self.origins
    }

    /// Settings of the first sibling holding a non-empty id, if any
    pub fn resolve(&self) -> Option<AnalyticsSettings> {
        for origin in &self.origins {
            for candidate in origin.candidates() {
                match AnalyticsSettings::read_from(&candidate) {
                    Ok(settings) if settings.has_id() => {
                        tracing::info!(source = %candidate.display(), "Migrating analytics id from sibling installation");
                        return Some(settings);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(source = %candidate.display(), error = %e, "Skipping unreadable sibling settings");
                    }
                }
            }
        }
        None
    }
}

fn current_exe_name() -> Option<String> {
    let exe = std::env::current_exe().ok()?;
    Some(exe.file_stem()?.to_str()?.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_settings(root: &Path, product: &str, id: &str, age_secs: u64) -> PathBuf {
        let dir = root.join(product).join("default");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            format!("id_for_analytics = \"{}\"\nfirst_name = \"{}\"\n", id, product),
        )
        .unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
        path
    }

    #[test]
    fn test_prefix_is_at_most_five_chars() {
        assert_eq!(SearchOrigin::new("/", "BloomAlpha").prefix(), "Bloom");
        assert_eq!(SearchOrigin::new("/", "TEX").prefix(), "TEX");
    }

    #[test]
    fn test_most_recent_candidate_wins() {
        let dir = TempDir::new().unwrap();
        write_settings(dir.path(), "BloomBeta", "older", 600);
        write_settings(dir.path(), "BloomAlpha", "newer", 10);

        let resolver =
            ChannelMigrationResolver::new().with_origin(SearchOrigin::new(dir.path(), "Bloom"));
        let found = resolver.resolve().unwrap();
        assert_eq!(found.id_for_analytics, "newer");
        assert_eq!(found.first_name, "BloomAlpha");
    }

    #[test]
    fn test_non_matching_prefix_ignored() {
        let dir = TempDir::new().unwrap();
        write_settings(dir.path(), "HearThis", "other-product", 10);

        let resolver =
            ChannelMigrationResolver::new().with_origin(SearchOrigin::new(dir.path(), "Bloom"));
        assert!(resolver.resolve().is_none());
    }

    #[test]
    fn test_unparsable_candidate_skipped() {
        let dir = TempDir::new().unwrap();
        write_settings(dir.path(), "BloomBeta", "fallback", 600);
        let broken = write_settings(dir.path(), "BloomAlpha", "unused", 10);
        std::fs::write(&broken, "id_for_analytics = [").unwrap();

        let resolver =
            ChannelMigrationResolver::new().with_origin(SearchOrigin::new(dir.path(), "Bloom"));
        assert_eq!(resolver.resolve().unwrap().id_for_analytics, "fallback");
    }

    #[test]
    fn test_later_origin_tried_when_first_finds_nothing() {
        let empty = TempDir::new().unwrap();
        let populated = TempDir::new().unwrap();
        write_settings(populated.path(), "BloomBeta", "from-second", 10);

        let resolver = ChannelMigrationResolver::new()
            .with_origin(SearchOrigin::new(empty.path(), "Bloom"))
            .with_origin(SearchOrigin::new(populated.path(), "Bloom"));
        assert_eq!(resolver.resolve().unwrap().id_for_analytics, "from-second");
    }

    #[test]
    fn test_origin_from_settings_file() {
        let origin = SearchOrigin::from_settings_file(Path::new(
            "/data/SIL/Bloom.exe_Url_abc/default/settings.toml",
        ))
        .unwrap();
        assert_eq!(origin.settings_root, PathBuf::from("/data/SIL"));
        assert_eq!(origin.product_name, "Bloom");

        let origin = SearchOrigin::from_settings_file(Path::new(
            "/data/SIL/HearThis_StrongName_1234/2.0/settings.toml",
        ))
        .unwrap();
        assert_eq!(origin.product_name, "HearThis");

        assert!(SearchOrigin::from_settings_file(Path::new("/data/other.toml")).is_none());
    }

    #[test]
    fn test_origin_from_vendor_requires_vendor() {
        let root = Path::new("/data");
        assert!(SearchOrigin::from_vendor(root, None, Some("Bloom")).is_none());
        assert!(SearchOrigin::from_vendor(root, Some(""), Some("Bloom")).is_none());

        let origin = SearchOrigin::from_vendor(root, Some("SIL"), Some("Bloom")).unwrap();
        assert_eq!(origin.settings_root, PathBuf::from("/data/SIL"));
        assert_eq!(origin.product_name, "Bloom");
    }

    #[test]
    fn test_duplicate_origins_collapsed() {
        let resolver = ChannelMigrationResolver::for_installation(
            Path::new("/data"),
            Some("SIL"),
            Some("Bloom"),
            Some(Path::new("/data/SIL/Bloom/default/settings.toml")),
        );
        assert_eq!(resolver.origins().len(), 1);
    }
}
