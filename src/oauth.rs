//! Google OAuth2 for the gmail account protocol.
//!
//! Refresh tokens live in the system keyring under the `clerk-oauth` service.
//! When no usable refresh token exists, a PKCE authorization-code flow runs
//! against a loopback redirect listener and the browser is opened for
//! consent. Callers get back a bearer access token ready for XOAUTH2.

use std::path::Path;

use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::errors::{Error, Result};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const OAUTH_KEYRING_SERVICE: &str = "clerk-oauth";
const MAIL_SCOPE: &str = "https://mail.google.com/";

/// Obtain a valid access token for the account, refreshing a stored token or
/// running the interactive consent flow when necessary.
pub async fn access_token(account: &str, client_id_file: &Path) -> Result<String> {
    let creds = load_client_credentials(client_id_file)?;
    let token_store = TokenStore::new(account);

    if let Some(refresh) = token_store.load() {
        let client = build_client(&creds, "http://127.0.0.1:8000")?;
        if let Some(token) = try_refresh(&client, &refresh).await? {
            return Ok(token);
        }
        warn!(account, "Stored refresh token failed; re-authenticating");
        token_store.delete();
    }

    authorize_interactive(account, &creds, &token_store).await
}

#[derive(Debug, Clone, Deserialize)]
struct InstalledCreds {
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct ClientIdFile {
    installed: InstalledCreds,
}

fn load_client_credentials(path: &Path) -> Result<InstalledCreds> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Auth(format!("reading oauth client file {}: {e}", path.display()))
    })?;
    let parsed: ClientIdFile = serde_json::from_str(&raw)
        .map_err(|e| Error::Auth(format!("invalid oauth client file: {e}")))?;
    Ok(parsed.installed)
}

fn build_client(creds: &InstalledCreds, redirect: &str) -> Result<BasicClient> {
    let client = BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        Some(ClientSecret::new(creds.client_secret.clone())),
        AuthUrl::new(AUTH_URL.to_string())
            .map_err(|e| Error::Auth(format!("bad auth url: {e}")))?,
        Some(
            TokenUrl::new(TOKEN_URL.to_string())
                .map_err(|e| Error::Auth(format!("bad token url: {e}")))?,
        ),
    )
    .set_redirect_uri(
        RedirectUrl::new(redirect.to_string())
            .map_err(|e| Error::Auth(format!("invalid redirect uri {redirect}: {e}")))?,
    )
    .set_auth_type(oauth2::AuthType::RequestBody);
    Ok(client)
}

async fn try_refresh(client: &BasicClient, refresh: &str) -> Result<Option<String>> {
    let token = RefreshToken::new(refresh.to_string());
    match client
        .exchange_refresh_token(&token)
        .request_async(async_http_client)
        .await
    {
        Ok(response) => Ok(Some(response.access_token().secret().clone())),
        Err(err) => {
            warn!(error = %err, "Refresh token invalid or expired");
            Ok(None)
        }
    }
}

async fn authorize_interactive(
    account: &str,
    creds: &InstalledCreds,
    token_store: &TokenStore,
) -> Result<String> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|e| Error::Connection(format!("binding loopback redirect port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Connection(format!("reading loopback addr: {e}")))?
        .port();

    let redirect = format!("http://127.0.0.1:{port}");
    let client = build_client(creds, &redirect)?;

    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let (auth_url, csrf) = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .add_scope(Scope::new(MAIL_SCOPE.to_string()))
        .set_pkce_challenge(challenge)
        .url();

    info!(account, redirect = %redirect, "Opening browser for Google OAuth consent");
    open_in_browser(auth_url.as_str());

    let code = listen_for_code(listener).await?;
    if code.state != *csrf.secret() {
        return Err(Error::Auth("OAuth state mismatch in callback".into()));
    }

    let token = exchange_code(&client, code.code, verifier).await?;
    if let Some(refresh) = &token.refresh_token {
        token_store.save(refresh);
    }
    Ok(token.access_token)
}

struct TokenBundle {
    access_token: String,
    refresh_token: Option<String>,
}

async fn exchange_code(
    client: &BasicClient,
    code: String,
    verifier: PkceCodeVerifier,
) -> Result<TokenBundle> {
    let response = client
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(verifier)
        .request_async(async_http_client)
        .await
        .map_err(|e| Error::Auth(format!("token exchange failed: {e}")))?;

    Ok(TokenBundle {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|r| r.secret().clone()),
    })
}

struct CodeResponse {
    code: String,
    state: String,
}

async fn listen_for_code(listener: TcpListener) -> Result<CodeResponse> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| Error::Connection(format!("redirect accept failed: {e}")))?;

    let mut buf = [0u8; 4096];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| Error::Connection(format!("reading auth callback: {e}")))?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::Auth("malformed callback request".into()))?;

    let full_url = format!("http://localhost{path}");
    let parsed = url::Url::parse(&full_url)
        .map_err(|e| Error::Auth(format!("parsing callback url: {e}")))?;

    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| Error::Auth("callback missing code parameter".into()))?;
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();

    let response =
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nAuth complete. You can close this tab.";
    let _ = stream.write_all(response.as_bytes()).await;

    Ok(CodeResponse { code, state })
}

fn open_in_browser(url: &str) {
    let attempt = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("rundll32.exe")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        std::process::Command::new("xdg-open").arg(url).status()
    };
    if attempt.is_err() {
        warn!("Could not auto-open browser; open this URL manually:\n{url}");
    }
}

struct TokenStore {
    account: String,
}

impl TokenStore {
    fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
        }
    }

    fn load(&self) -> Option<String> {
        let entry = keyring::Entry::new(OAUTH_KEYRING_SERVICE, &self.account).ok()?;
        match entry.get_password() {
            Ok(token) => Some(token),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(account = %self.account, error = %e, "Keyring read failed");
                None
            }
        }
    }

    fn save(&self, refresh: &str) {
        match keyring::Entry::new(OAUTH_KEYRING_SERVICE, &self.account) {
            Ok(entry) => {
                if let Err(e) = entry.set_password(refresh) {
                    warn!(account = %self.account, error = %e, "Keyring save failed");
                }
            }
            Err(e) => warn!(account = %self.account, error = %e, "Keyring entry failed"),
        }
    }

    fn delete(&self) {
        if let Ok(entry) = keyring::Entry::new(OAUTH_KEYRING_SERVICE, &self.account) {
            let _ = entry.delete_password();
        }
    }
}
