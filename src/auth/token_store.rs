use keyring::{Entry, Error as KeyringError};
use log::warn;

use crate::error::{Error, Result};

const SERVICE: &str = "mail_triage";

fn entry(key: &str) -> Result<Entry> {
    Entry::new(SERVICE, key).map_err(|e| Error::Config(format!("keyring: {e}")))
}

fn keyring_err(e: KeyringError) -> Error {
    Error::Config(format!("keyring: {e}"))
}

/// Save a refresh token into the OS keyring for the mailbox account
pub fn save_refresh_token(account: &str, refresh_token: &str) -> Result<()> {
    entry(account)?
        .set_password(refresh_token)
        .map_err(keyring_err)
}

pub fn load_refresh_token(account: &str) -> Result<Option<String>> {
    match entry(account)?.get_password() {
        Ok(v) => Ok(Some(v)),
        Err(KeyringError::NoEntry) => Ok(None),
        Err(e) => Err(keyring_err(e)),
    }
}

/// Forget the refresh token (logout). Missing entries are fine.
pub fn delete_refresh_token(account: &str) -> Result<()> {
    match entry(account)?.delete_credential() {
        Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
        Err(e) => Err(keyring_err(e)),
    }
}

/// Save a client secret into the keyring, keyed by client_id
pub fn save_client_secret(client_id: &str, client_secret: &str) -> Result<()> {
    entry(&format!("client:{client_id}"))?
        .set_password(client_secret)
        .map_err(keyring_err)
}

/// Client secret from the keyring, else `OAUTH_CLIENT_SECRET`.
pub fn load_client_secret(client_id: &str) -> Result<Option<String>> {
    let stored = Entry::new(SERVICE, &format!("client:{client_id}")).and_then(|e| e.get_password());
    let env = std::env::var("OAUTH_CLIENT_SECRET")
        .ok()
        .filter(|s| !s.is_empty());
    Ok(secret_or_env(stored, env))
}

/// A keyring that can't be reached falls back to the environment.
fn secret_or_env(
    stored: std::result::Result<String, KeyringError>,
    env: Option<String>,
) -> Option<String> {
    match stored {
        Ok(v) => Some(v),
        Err(KeyringError::NoEntry) => env,
        Err(e) => {
            warn!("keyring unavailable for client secret: {e}");
            env
        }
    }
}
