//! Global settings, read from `settings.json` in the base directory.
//!
//! Every field has a default so a missing or partial file is fine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{error::Error, options::ValidationOptions};

pub const LETS_ENCRYPT_SERVER: &str = "https://acme-v02.api.letsencrypt.org/directory";
#[allow(dead_code)]
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub acme: AcmeSettings,
    pub cache: CacheSettings,
    pub schedule: ScheduleSettings,
    pub validation: ValidationSettings,
    pub execution: ExecutionSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcmeSettings {
    pub base_uri: String,
    pub contact_email: Option<String>,
    /// Common name of the root (or topmost issuer) to prefer when the CA offers alternate chains.
    pub preferred_issuer: Option<String>,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
    pub user_agent: String,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            base_uri: LETS_ENCRYPT_SERVER.to_owned(),
            contact_email: None,
            preferred_issuer: None,
            poll_interval_secs: 2,
            max_poll_attempts: 30,
            user_agent: concat!("acme-renew/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

impl AcmeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Cached certificates younger than this are reused instead of ordering a new one.
    pub reuse_days: i64,
    pub delete_stale_files: bool,
    pub delete_stale_files_days: i64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            reuse_days: 1,
            delete_stale_files: false,
            delete_stale_files_days: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub renewal_days: i64,
    pub renewal_minimum_valid_days: i64,
    /// Width of the randomized window before the latest due date, in days.
    pub renewal_days_range: i64,
    pub renewal_disable_server_schedule: bool,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            renewal_days: 55,
            renewal_minimum_valid_days: 7,
            renewal_days_range: 0,
            renewal_disable_server_schedule: false,
        }
    }
}

/// Pins a validation option bundle to every identifier matching `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalValidationOverride {
    pub pattern: String,
    pub options: Arc<ValidationOptions>,
}

impl GlobalValidationOverride {
    /// `*.example.com` matches `example.com` and all of its sub-domains.
    pub fn matches(&self, identifier: &str) -> bool {
        let pattern = self.pattern.to_lowercase();
        let identifier = identifier.to_lowercase();
        match pattern.strip_prefix("*.") {
            Some(base) => {
                let identifier = identifier.trim_start_matches("*.");
                identifier == base || identifier.ends_with(&format!(".{}", base))
            }
            None => identifier == pattern,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub disable_multi_threading: bool,
    pub global_overrides: Vec<GlobalValidationOverride>,
}

impl ValidationSettings {
    /// The first pinned option bundle matching the identifier.
    pub fn pinned_for(&self, identifier: &str) -> Option<Arc<ValidationOptions>> {
        self.global_overrides
            .iter()
            .find(|pin| pin.matches(identifier))
            .map(|pin| Arc::clone(&pin.options))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub default_pre_execution_script: Option<String>,
    pub default_post_execution_script: Option<String>,
    pub script_timeout_secs: u64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_pre_execution_script: None,
            default_post_execution_script: None,
            script_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub default_pem_files_path: Option<PathBuf>,
    pub default_pfx_path: Option<PathBuf>,
}

impl Settings {
    /// Loads `settings.json` from `base_dir`, falling back to defaults when it does not exist.
    pub fn load(base_dir: &Path) -> Result<Self, Error> {
        let path = base_dir.join(SETTINGS_FILE);
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        settings.check()?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    fn check(&self) -> Result<(), Error> {
        if self.schedule.renewal_days_range < 0 {
            return Err(Error::Config(
                "schedule.renewal_days_range must not be negative".into(),
            ));
        }
        if self.cache.reuse_days < 0 {
            return Err(Error::Config("cache.reuse_days must not be negative".into()));
        }
        Ok(())
    }
}
