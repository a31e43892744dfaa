use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::config_dir;
use crate::error::{Error, Result};

/// Non-secret credential metadata stored in ~/.config/mail_triage/tokens.json.
/// The refresh token lives in the keyring, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokensFile {
    pub access_token: String,
    pub issued_at_epoch: i64,
    pub lifetime_secs: i64,
}

pub fn default_tokens_path() -> Result<PathBuf> {
    let p = config_dir()?;
    fs::create_dir_all(&p)?;
    Ok(p.join("tokens.json"))
}

pub fn save_tokens(path: &Path, tokens: &TokensFile) -> Result<()> {
    let s = serde_json::to_string_pretty(tokens)
        .map_err(|e| Error::Config(format!("serialize tokens: {e}")))?;
    fs::write(path, s)?;
    Ok(())
}

/// Load tokens file if present. An unreadable file counts as absent.
pub fn load_tokens(path: &Path) -> Result<Option<TokensFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let s = fs::read_to_string(path)?;
    match serde_json::from_str(&s) {
        Ok(tf) => Ok(Some(tf)),
        Err(e) => {
            log::warn!("ignoring unreadable tokens file {}: {e}", path.display());
            Ok(None)
        }
    }
}

pub fn clear_tokens(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}
