//! Credential lifecycle: holds the mailbox access credential and refreshes
//! it on demand. Pull-based; nothing runs in the background.

use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::auth::oauth::{self, OAuthSettings, Tokens};
use crate::auth::{token_store, tokens_file};
use crate::config::Config;
use crate::error::{Error, Result};

/// Refresh this long before the declared expiry.
pub const REFRESH_BUFFER_SECS: i64 = 300;
/// Lifetime assumed when the provider doesn't declare one.
pub const DEFAULT_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Unauthenticated,
    Valid,
    Expiring,
    Refreshing,
    Invalid,
}

/// The four lifecycle fields, always replaced together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub issued_at: i64,
    pub lifetime_secs: i64,
    pub refresh_token: Option<String>,
}

impl Credential {
    /// A refresh response without a refresh token keeps the previous one.
    pub fn from_tokens(tokens: Tokens, now: i64, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: tokens.access_token,
            issued_at: now,
            lifetime_secs: tokens
                .expires_in
                .and_then(|s| i64::try_from(s).ok())
                .unwrap_or(DEFAULT_LIFETIME_SECS),
            refresh_token: tokens.refresh_token.or(previous_refresh),
        }
    }

    pub fn needs_refresh(&self, now: i64) -> bool {
        now - self.issued_at > self.lifetime_secs - REFRESH_BUFFER_SECS
    }
}

/// Performs the refresh-token exchange.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> Result<Tokens>;
}

pub struct OAuthRefresher {
    settings: OAuthSettings,
}

impl OAuthRefresher {
    pub fn new(settings: OAuthSettings) -> Self {
        Self { settings }
    }
}

impl TokenRefresher for OAuthRefresher {
    fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        oauth::refresh_access_token(&self.settings, refresh_token)
            .map_err(|e| Error::RefreshFailed(e.to_string()))
    }
}

/// Anything that can hand out a currently valid access credential.
pub trait CredentialSource: Send + Sync {
    fn valid_credential(&self) -> Result<String>;
}

struct Slot {
    credential: Option<Credential>,
    version: u64,
    invalid: bool,
}

struct Persistence {
    tokens_path: PathBuf,
    account: String,
}

pub struct TokenManager {
    slot: Mutex<Slot>,
    refreshing: AtomicUsize,
    refresher: Box<dyn TokenRefresher>,
    persistence: Option<Persistence>,
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

impl TokenManager {
    /// In-memory manager with no persistence.
    pub fn new(refresher: Box<dyn TokenRefresher>) -> Self {
        Self {
            slot: Mutex::new(Slot {
                credential: None,
                version: 0,
                invalid: false,
            }),
            refreshing: AtomicUsize::new(0),
            refresher,
            persistence: None,
        }
    }

    /// Manager backed by the tokens file and the keyring, preloaded with
    /// whatever a previous login left behind.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let client_secret = token_store::load_client_secret(&cfg.client_id)?;
        let settings = OAuthSettings::from_config(cfg, client_secret);
        let account = format!("mailbox:{}", cfg.client_id);
        let tokens_path = tokens_file::default_tokens_path()?;

        let mut mgr = Self::new(Box::new(OAuthRefresher::new(settings)));

        let refresh_token = token_store::load_refresh_token(&account).unwrap_or_else(|e| {
            warn!("could not read refresh token from keyring: {e}");
            None
        });
        let cached = tokens_file::load_tokens(&tokens_path)?;

        let restored = match (cached, refresh_token) {
            (Some(tf), rt) => Some(Credential {
                access_token: tf.access_token,
                issued_at: tf.issued_at_epoch,
                lifetime_secs: tf.lifetime_secs,
                refresh_token: rt,
            }),
            // Forces a refresh on first use.
            (None, Some(rt)) => Some(Credential {
                access_token: String::new(),
                issued_at: 0,
                lifetime_secs: 0,
                refresh_token: Some(rt),
            }),
            (None, None) => None,
        };

        if let Some(cred) = restored {
            debug!("restored stored credential");
            mgr.swap(cred)?;
        }
        mgr.persistence = Some(Persistence {
            tokens_path,
            account,
        });
        Ok(mgr)
    }

    pub fn get_valid_credential(&self) -> Result<String> {
        self.get_valid_credential_at(now_epoch())
    }

    /// Returns the current access credential, refreshing first when it is
    /// within the buffer of its expiry.
    pub fn get_valid_credential_at(&self, now: i64) -> Result<String> {
        let current = {
            let slot = self.slot.lock().map_err(|_| Error::LockPoisoned)?;
            slot.credential.clone().ok_or(Error::Unauthenticated)?
        };

        if !current.needs_refresh(now) {
            return Ok(current.access_token);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            self.mark_invalid()?;
            return Err(Error::RefreshFailed("no refresh credential recorded".into()));
        };

        debug!("access credential expiring; refreshing");
        // No lock held across the exchange; concurrent refreshes are last-writer-wins.
        self.refreshing.fetch_add(1, Ordering::SeqCst);
        let result = self.refresher.refresh(&refresh_token);
        self.refreshing.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(tokens) => {
                let cred = Credential::from_tokens(tokens, now, Some(refresh_token));
                let access = cred.access_token.clone();
                self.swap(cred.clone())?;
                self.persist(&cred);
                info!("access credential refreshed");
                Ok(access)
            }
            Err(e) => {
                warn!("credential refresh failed: {e}");
                self.mark_invalid()?;
                Err(match e {
                    Error::RefreshFailed(_) => e,
                    other => Error::RefreshFailed(other.to_string()),
                })
            }
        }
    }

    /// Records freshly issued tokens (after login).
    pub fn install(&self, tokens: Tokens, now: i64) -> Result<()> {
        let previous = {
            let slot = self.slot.lock().map_err(|_| Error::LockPoisoned)?;
            slot.credential.as_ref().and_then(|c| c.refresh_token.clone())
        };
        let cred = Credential::from_tokens(tokens, now, previous);
        self.swap(cred.clone())?;
        self.persist(&cred);
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        {
            let mut slot = self.slot.lock().map_err(|_| Error::LockPoisoned)?;
            slot.credential = None;
            slot.invalid = false;
            slot.version += 1;
        }
        if let Some(p) = &self.persistence {
            tokens_file::clear_tokens(&p.tokens_path)?;
            token_store::delete_refresh_token(&p.account)?;
        }
        Ok(())
    }

    pub fn state(&self, now: i64) -> CredentialState {
        if self.refreshing.load(Ordering::SeqCst) > 0 {
            return CredentialState::Refreshing;
        }
        let Ok(slot) = self.slot.lock() else {
            return CredentialState::Invalid;
        };
        match &slot.credential {
            None => CredentialState::Unauthenticated,
            Some(_) if slot.invalid => CredentialState::Invalid,
            Some(c) if c.needs_refresh(now) => CredentialState::Expiring,
            Some(_) => CredentialState::Valid,
        }
    }

    /// Increments on every install/refresh.
    pub fn version(&self) -> u64 {
        self.slot.lock().map(|s| s.version).unwrap_or(0)
    }

    pub fn current(&self) -> Option<Credential> {
        self.slot.lock().ok().and_then(|s| s.credential.clone())
    }

    fn swap(&self, cred: Credential) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| Error::LockPoisoned)?;
        slot.credential = Some(cred);
        slot.invalid = false;
        slot.version += 1;
        Ok(())
    }

    fn mark_invalid(&self) -> Result<()> {
        let mut slot = self.slot.lock().map_err(|_| Error::LockPoisoned)?;
        slot.invalid = true;
        Ok(())
    }

    // best-effort: a failed write only costs a refresh on next start
    fn persist(&self, cred: &Credential) {
        let Some(p) = &self.persistence else {
            return;
        };
        let tf = tokens_file::TokensFile {
            access_token: cred.access_token.clone(),
            issued_at_epoch: cred.issued_at,
            lifetime_secs: cred.lifetime_secs,
        };
        if let Err(e) = tokens_file::save_tokens(&p.tokens_path, &tf) {
            warn!("couldn't save token metadata: {e}");
        }
        if let Some(rt) = &cred.refresh_token
            && let Err(e) = token_store::save_refresh_token(&p.account, rt)
        {
            warn!("couldn't save refresh token to keyring: {e}");
        }
    }
}

impl CredentialSource for TokenManager {
    fn valid_credential(&self) -> Result<String> {
        self.get_valid_credential()
    }
}

/// A fixed credential, for tools and tests that authenticate elsewhere.
pub struct StaticCredential(pub String);

impl CredentialSource for StaticCredential {
    fn valid_credential(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
