use anyhow::{Result, anyhow};
use log::{info, warn};
use oauth2::TokenResponse;
use oauth2::basic::BasicClient;
use oauth2::reqwest::http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, Scope, TokenUrl,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tiny_http::{Response, Server};
use url::Url;

use crate::config::Config;

const CALLBACK_WAIT: Duration = Duration::from_secs(120);

/// Tokens returned by the oauth flow (in-memory)
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Identity-provider endpoints and client registration.
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthSettings {
    pub fn from_config(cfg: &Config, client_secret: Option<String>) -> Self {
        let base = format!("https://login.microsoftonline.com/{}/oauth2/v2.0", cfg.tenant());
        Self {
            client_id: cfg.client_id.clone(),
            client_secret,
            auth_url: format!("{base}/authorize"),
            token_url: format!("{base}/token"),
            redirect_uri: cfg.redirect_uri(),
            scopes: cfg.scopes(),
        }
    }

    fn client(&self) -> Result<BasicClient> {
        let client_id = ClientId::new(self.client_id.clone());
        let client_secret = self.client_secret.clone().map(ClientSecret::new);
        let auth_url = AuthUrl::new(self.auth_url.clone())?;
        let token_url = TokenUrl::new(self.token_url.clone())?;
        Ok(BasicClient::new(
            client_id,
            client_secret,
            auth_url,
            Some(token_url),
        ))
    }

    fn scope_list(&self) -> Vec<Scope> {
        self.scopes.iter().cloned().map(Scope::new).collect()
    }
}

/// Exchange a refresh token for a new access token using the oauth2 crate
pub fn refresh_access_token(settings: &OAuthSettings, refresh_token: &str) -> Result<Tokens> {
    let oauth_client = settings.client()?;

    let rt = RefreshToken::new(refresh_token.to_string());
    let token = oauth_client
        .exchange_refresh_token(&rt)
        .add_scopes(settings.scope_list())
        .request(http_client)
        .map_err(|e| anyhow!("refresh exchange failed: {e}"))?;

    Ok(tokens_from(&token))
}

/// Perform Authorization Code + PKCE flow. Opens system browser and captures code via tiny server.
pub fn perform_pkce_flow(settings: &OAuthSettings) -> Result<Tokens> {
    let redirect_uri = settings.redirect_uri.as_str();

    // Parse redirect_uri so bind address matches exactly
    let redirect = Url::parse(redirect_uri)
        .map_err(|e| anyhow!("Invalid redirect_uri '{redirect_uri}': {e}"))?;

    let host = redirect
        .host_str()
        .ok_or_else(|| anyhow!("redirect_uri missing host: {redirect_uri}"))?
        .to_string();

    let port = redirect
        .port_or_known_default()
        .ok_or_else(|| anyhow!("redirect_uri missing/unknown port: {redirect_uri}"))?;

    let bind_ip: IpAddr = match host.as_str() {
        "localhost" | "127.0.0.1" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse::<IpAddr>().map_err(|_| {
            anyhow!("redirect_uri host must be localhost/127.0.0.1 or an IP: {other}")
        })?,
    };

    let bind_addr = SocketAddr::new(bind_ip, port);

    // Listen before handing out the URL so the redirect can't race us.
    let server = Server::http(bind_addr)
        .map_err(|e| anyhow!("Failed to bind OAuth callback server on {bind_addr}: {e:?}"))?;

    let oauth_client = settings
        .client()?
        .set_redirect_uri(RedirectUrl::new(redirect_uri.to_string())?);

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let (auth_url, csrf_token) = oauth_client
        .authorize_url(CsrfToken::new_random)
        .add_scopes(settings.scope_list())
        .set_pkce_challenge(pkce_challenge)
        .url();

    println!("Open this URL in your browser:\n{auth_url}");
    if let Err(e) = open::that(auth_url.as_str()) {
        warn!("could not open browser automatically: {e}");
    }

    let code = wait_for_code(&server, &host, port, csrf_token.secret())?;

    let token = oauth_client
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(pkce_verifier)
        .request(http_client)
        .map_err(|e| anyhow!("Token exchange failed: {e}"))?;

    info!("authorization code exchanged for tokens");
    Ok(tokens_from(&token))
}

fn wait_for_code(server: &Server, host: &str, port: u16, expected_state: &str) -> Result<String> {
    let wait_until = Instant::now() + CALLBACK_WAIT;

    while Instant::now() < wait_until {
        let Ok(maybe_request) = server.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };

        let Some(request) = maybe_request else {
            continue;
        };

        // request.url() is only path+query
        let full = format!("http://{}:{}{}", host, port, request.url());

        match parse_callback(&full, expected_state) {
            Ok(Some(code)) => {
                let _ = request.respond(Response::from_string(
                    "Authorization received. You can close this tab.",
                ));
                return Ok(code);
            }
            Ok(None) => {
                let _ = request.respond(Response::from_string(
                    "No code found in redirect. You can close this tab.",
                ));
            }
            Err(e) => {
                let _ = request.respond(Response::from_string(format!("Authorization failed: {e}")));
                return Err(e);
            }
        }
    }

    Err(anyhow!("No code received within timeout"))
}

/// Pull the authorization code out of a redirect URL.
/// `Ok(None)` for unrelated requests (favicon etc.).
fn parse_callback(full_url: &str, expected_state: &str) -> Result<Option<String>> {
    let parsed = Url::parse(full_url).map_err(|e| anyhow!("Bad redirect: {e}"))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (k, v) in parsed.query_pairs() {
        match &*k {
            "code" => code = Some(v.into_owned()),
            "state" => state = Some(v.into_owned()),
            "error_description" => error = Some(v.into_owned()),
            "error" if error.is_none() => error = Some(v.into_owned()),
            _ => {}
        }
    }

    if let Some(err) = error {
        return Err(anyhow!("provider returned error: {err}"));
    }
    match code {
        Some(_) if state.as_deref() != Some(expected_state) => {
            Err(anyhow!("state mismatch in OAuth redirect"))
        }
        other => Ok(other),
    }
}

fn tokens_from(token: &oauth2::basic::BasicTokenResponse) -> Tokens {
    Tokens {
        access_token: token.access_token().secret().to_string(),
        refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
        expires_in: token.expires_in().map(|d| d.as_secs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_with_code_and_state() {
        let code = parse_callback("http://localhost:8080/callback?code=abc&state=xyz", "xyz")
            .unwrap();
        assert_eq!(code.as_deref(), Some("abc"));
    }

    #[test]
    fn callback_without_code_is_ignored() {
        let code = parse_callback("http://localhost:8080/favicon.ico", "xyz").unwrap();
        assert!(code.is_none());
    }

    #[test]
    fn callback_state_mismatch_is_rejected() {
        assert!(parse_callback("http://localhost:8080/callback?code=abc&state=evil", "xyz").is_err());
    }

    #[test]
    fn callback_error_is_surfaced() {
        let err = parse_callback(
            "http://localhost:8080/callback?error=access_denied&error_description=User+cancelled",
            "xyz",
        )
        .unwrap_err();
        assert!(err.to_string().contains("User cancelled"));
    }
}
