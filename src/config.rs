use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/callback";
pub const DEFAULT_SCOPES: [&str; 4] = [
    "offline_access",
    "https://graph.microsoft.com/Mail.Read",
    "https://graph.microsoft.com/Mail.Send",
    "https://graph.microsoft.com/Mail.ReadWrite",
];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub client_id: String,
    pub tenant: Option<String>,
    pub redirect_uri: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub db_path: Option<String>,
    /// Name used to sign drafted replies.
    pub owner_name: Option<String>,
    /// Optional TOML file replacing the built-in relevance keyword table.
    pub rules_path: Option<String>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub base_url: String,
    pub name: String,
    pub temperature: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            name: "phi3:mini".to_string(),
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Messages fetched by a user-triggered sync.
    pub limit: usize,
    /// Messages fetched per background poll.
    pub background_limit: usize,
    /// How far back a user-triggered sync looks.
    pub lookback_days: i64,
    pub poll_interval_secs: u64,
    pub retention_days: Option<u32>,
    pub workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            limit: 20,
            background_limit: 5,
            lookback_days: 7,
            poll_interval_secs: 300,
            retention_days: None,
            workers: 5,
        }
    }
}

impl Config {
    pub fn tenant(&self) -> &str {
        self.tenant.as_deref().unwrap_or("common")
    }

    pub fn redirect_uri(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string())
    }

    pub fn scopes(&self) -> Vec<String> {
        self.scopes
            .clone()
            .unwrap_or_else(|| DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect())
    }

    fn template() -> Self {
        Self {
            client_id: "YOUR_APPLICATION_CLIENT_ID".to_string(),
            tenant: Some("common".to_string()),
            redirect_uri: Some(DEFAULT_REDIRECT_URI.to_string()),
            scopes: None,
            db_path: None,
            owner_name: None,
            rules_path: None,
            model: ModelConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| Error::Config("no config dir available".into()))?
        .join("mail_triage"))
}

pub fn config_path() -> Result<PathBuf> {
    let p = config_dir()?;
    fs::create_dir_all(&p)?;
    Ok(p.join("config.toml"))
}

pub fn default_db_path() -> Result<PathBuf> {
    let p = config_dir()?;
    fs::create_dir_all(&p)?;
    Ok(p.join("emails.db"))
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path()?)
}

/// Reads the config at `path`, writing a template there first if it is missing.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        let tom = toml::to_string_pretty(&Config::template())
            .map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, tom)?;
        return Err(Error::Config(format!(
            "created template config at {}; edit it and run again",
            path.display()
        )));
    }
    let s = fs::read_to_string(path)?;
    toml::from_str(&s).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

pub fn resolve_db_path(cfg: &Config) -> Result<PathBuf> {
    match &cfg.db_path {
        Some(p) => Ok(PathBuf::from(p)),
        None => default_db_path(),
    }
}
