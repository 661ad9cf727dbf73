use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::MIN_REPLAY_WINDOW;

const DEFAULT_DB_PATH: &str = "drone.db";
const DEFAULT_KEYSTORE_DIR: &str = "identity";
const DEFAULT_ORG_ID: &str = "zypher-prototype";
const DEFAULT_REPLAY_WINDOW_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct TrustConfigFile {
    db_path: Option<String>,
    keystore_dir: Option<PathBuf>,
    org_id: Option<String>,
    replay_window_secs: Option<u64>,
}

/// Explicit configuration for the trust core. Constructors take this
/// struct; nothing in the core reads ambient globals.
#[derive(Debug, Clone)]
pub struct TrustConfig {
    pub db_path: String,
    pub keystore_dir: PathBuf,
    pub org_id: String,
    pub replay_window: Duration,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            keystore_dir: PathBuf::from(DEFAULT_KEYSTORE_DIR),
            org_id: DEFAULT_ORG_ID.to_string(),
            replay_window: Duration::from_secs(DEFAULT_REPLAY_WINDOW_SECS),
        }
    }
}

impl TrustConfig {
    /// Loads configuration from the JSON file named by `AEROTRUST_CONFIG`
    /// (if set), applies field-wise environment overrides, and validates.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("AEROTRUST_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TrustConfigFile) -> Self {
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            keystore_dir: file
                .keystore_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYSTORE_DIR)),
            org_id: file.org_id.unwrap_or_else(|| DEFAULT_ORG_ID.to_string()),
            replay_window: Duration::from_secs(
                file.replay_window_secs.unwrap_or(DEFAULT_REPLAY_WINDOW_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("AEROTRUST_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("AEROTRUST_KEYSTORE_DIR") {
            if !dir.trim().is_empty() {
                self.keystore_dir = PathBuf::from(dir);
            }
        }
        if let Ok(org_id) = std::env::var("AEROTRUST_ORG_ID") {
            if !org_id.trim().is_empty() {
                self.org_id = org_id;
            }
        }
        if let Ok(window) = std::env::var("AEROTRUST_REPLAY_WINDOW_SECS") {
            let seconds: u64 = window.parse().map_err(|_| {
                anyhow!("AEROTRUST_REPLAY_WINDOW_SECS must be an integer number of seconds")
            })?;
            self.replay_window = Duration::from_secs(seconds);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.keystore_dir.as_os_str().is_empty() {
            return Err(anyhow!("keystore_dir must not be empty"));
        }
        if self.org_id.trim().is_empty() {
            return Err(anyhow!("org_id must not be empty"));
        }
        if self.replay_window < MIN_REPLAY_WINDOW {
            return Err(anyhow!(
                "replay window must be at least {} second(s)",
                MIN_REPLAY_WINDOW.as_secs()
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<TrustConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
