//! Application configuration management.
//!
//! Holds the backend project URL and API key, the media bucket used for kit
//! images, the per-operation timeout, and the last signed-in email.
//!
//! Configuration is stored at `~/.config/fundkit/config.json`; the
//! `SUPABASE_URL`, `SUPABASE_ANON_KEY` and `FUNDKIT_MEDIA_BUCKET` environment
//! variables override the file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "fundkit";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_MEDIA_BUCKET: &str = "kit_media";
const DEFAULT_UPLOAD_FOLDER: &str = "kits";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

fn default_media_bucket() -> String {
    DEFAULT_MEDIA_BUCKET.to_string()
}

fn default_upload_folder() -> String {
    DEFAULT_UPLOAD_FOLDER.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub anon_key: Option<String>,
    #[serde(default = "default_media_bucket")]
    pub media_bucket: String,
    #[serde(default = "default_upload_folder")]
    pub upload_folder: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Set when the tables declare `ON DELETE CASCADE`, so child rows need
    /// not be removed one by one.
    #[serde(default)]
    pub store_cascades_deletes: bool,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            anon_key: None,
            media_bucket: default_media_bucket(),
            upload_folder: default_upload_folder(),
            request_timeout_secs: default_timeout_secs(),
            store_cascades_deletes: false,
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file, then apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override fields from variables resolved by `lookup`; blank values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("SUPABASE_URL") {
            self.supabase_url = Some(url);
        }
        if let Some(key) = get("SUPABASE_ANON_KEY") {
            self.anon_key = Some(key);
        }
        if let Some(bucket) = get("FUNDKIT_MEDIA_BUCKET") {
            self.media_bucket = bucket;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the saved session
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{"supabase_url": "https://p.supabase.co"}"#)
            .expect("Failed to parse config JSON");
        assert_eq!(config.media_bucket, "kit_media");
        assert_eq!(config.upload_folder, "kits");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(!config.store_cascades_deletes);
        assert!(config.anon_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SUPABASE_URL", "https://env.supabase.co"),
            ("SUPABASE_ANON_KEY", "env-key"),
            ("FUNDKIT_MEDIA_BUCKET", "  "),
        ]);
        let mut config = Config {
            supabase_url: Some("https://file.supabase.co".to_string()),
            ..Config::default()
        };
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.supabase_url.as_deref(), Some("https://env.supabase.co"));
        assert_eq!(config.anon_key.as_deref(), Some("env-key"));
        assert_eq!(config.media_bucket, "kit_media");
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = Config {
            request_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }
}
