//! Credential lifecycle for the mailbox API.
//!
//! Tokens live in an authorized-user JSON file next to the client secrets.
//! An expired access token is refreshed and written back immediately; with no
//! usable token at all, the installed-app consent flow runs once against a
//! loopback listener and the result is persisted.

use super::MailboxError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use url::Url;

pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Tokens closer than this to expiry are treated as expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// How long the consent flow waits for the browser redirect.
pub const CONSENT_TIMEOUT_SECS: u64 = 300;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a bearer token valid for at least the next request.
    async fn access_token(&self) -> Result<String, MailboxError>;
}

/// Authorized-user token file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl StoredToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expiry) {
            (Some(token), Some(expiry)) => {
                !token.is_empty() && expiry - ChronoDuration::seconds(EXPIRY_SKEW_SECS) > now
            }
            (Some(token), None) => !token.is_empty(),
            _ => false,
        }
    }

    fn covers_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }
}

/// Client secrets file as downloaded from the Google console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    #[serde(alias = "web")]
    pub installed: ClientSecret,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    scope: Option<String>,
}

pub struct InstalledAppCredentials {
    credentials_path: PathBuf,
    token_path: PathBuf,
    scope: String,
    client: reqwest::Client,
    consent_timeout: Duration,
    cached: Mutex<Option<StoredToken>>,
}

fn generate_state() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl InstalledAppCredentials {
    pub fn new(
        credentials_path: impl Into<PathBuf>,
        token_path: impl Into<PathBuf>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            credentials_path: credentials_path.into(),
            token_path: token_path.into(),
            scope: GMAIL_READONLY_SCOPE.to_string(),
            client,
            consent_timeout: Duration::from_secs(CONSENT_TIMEOUT_SECS),
            cached: Mutex::new(None),
        }
    }

    pub fn with_consent_timeout(mut self, timeout: Duration) -> Self {
        self.consent_timeout = timeout;
        self
    }

    async fn load_token(path: &Path) -> Result<Option<StoredToken>, MailboxError> {
        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&json) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                log::warn!("Ignoring unreadable token file {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    async fn store_token(&self, token: &StoredToken) -> Result<(), MailboxError> {
        let json = serde_json::to_string_pretty(token)?;
        let tmp_path = self.token_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp_path, &self.token_path).await?;
        log::debug!("Stored mailbox token at {}", self.token_path.display());
        Ok(())
    }

    async fn load_secrets(&self) -> Result<ClientSecret, MailboxError> {
        let json = tokio::fs::read_to_string(&self.credentials_path)
            .await
            .map_err(|e| {
                MailboxError::Auth(format!(
                    "cannot read client secrets {}: {e}",
                    self.credentials_path.display()
                ))
            })?;
        let secrets: ClientSecrets = serde_json::from_str(&json)?;
        Ok(secrets.installed)
    }

    async fn refresh(&self, stored: &StoredToken) -> Result<StoredToken, MailboxError> {
        let refresh_token = stored
            .refresh_token
            .as_deref()
            .ok_or_else(|| MailboxError::Auth("no refresh token".to_string()))?;

        log::info!("Refreshing mailbox access token");
        let response = self
            .request_token(
                &stored.token_uri,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", stored.client_id.as_str()),
                    ("client_secret", stored.client_secret.as_str()),
                ],
            )
            .await?;

        Ok(Self::merge(stored.clone(), response))
    }

    async fn request_token(
        &self,
        token_uri: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, MailboxError> {
        let response = self.client.post(token_uri).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailboxError::Auth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        Ok(response.json().await?)
    }

    fn merge(mut stored: StoredToken, response: TokenResponse) -> StoredToken {
        stored.token = Some(response.access_token);
        stored.expiry = response
            .expires_in
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs));
        // Refresh tokens may rotate; keep the old one when none is returned.
        if let Some(refresh_token) = response.refresh_token {
            stored.refresh_token = Some(refresh_token);
        }
        if let Some(scope) = response.scope {
            stored.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
        stored
    }

    /// Runs the installed-app consent flow: prints the consent URL, waits for
    /// the browser redirect on a loopback port and exchanges the code.
    /// Gives up with an auth error after the consent timeout.
    async fn authorize(&self) -> Result<StoredToken, MailboxError> {
        let secret = self.load_secrets().await?;
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
        let state = generate_state();

        let consent_url = Self::consent_url(&secret, &redirect_uri, &self.scope, &state)?;
        log::info!("Mailbox authorization required");
        println!("Open this URL in a browser to authorize mailbox access:\n\n{consent_url}\n");

        let code = tokio::time::timeout(
            self.consent_timeout,
            Self::wait_for_code(&listener, &state),
        )
        .await
        .map_err(|_| {
            MailboxError::Auth(format!(
                "no authorization redirect within {}s",
                self.consent_timeout.as_secs()
            ))
        })??;
        let response = self
            .request_token(
                &secret.token_uri,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", redirect_uri.as_str()),
                    ("client_id", secret.client_id.as_str()),
                    ("client_secret", secret.client_secret.as_str()),
                ],
            )
            .await?;

        let stored = StoredToken {
            token: None,
            refresh_token: None,
            token_uri: secret.token_uri.clone(),
            client_id: secret.client_id.clone(),
            client_secret: secret.client_secret.clone(),
            scopes: vec![self.scope.clone()],
            expiry: None,
        };
        Ok(Self::merge(stored, response))
    }

    pub fn consent_url(
        secret: &ClientSecret,
        redirect_uri: &str,
        scope: &str,
        state: &str,
    ) -> Result<Url, MailboxError> {
        let mut url = Url::parse(&secret.auth_uri)
            .map_err(|e| MailboxError::Auth(format!("invalid auth_uri: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &secret.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", scope)
            .append_pair("state", state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        Ok(url)
    }

    async fn wait_for_code(listener: &TcpListener, state: &str) -> Result<String, MailboxError> {
        loop {
            let (mut stream, _) = listener.accept().await?;
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await?;
            let request = String::from_utf8_lossy(&buf[..n]);

            let outcome = Self::parse_redirect(&request, state);
            let body = match &outcome {
                Some(Ok(_)) => "Authorization complete. You may close this window.",
                Some(Err(_)) => "Authorization was denied.",
                None => "Waiting for authorization.",
            };
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            if let Err(e) = stream.write_all(reply.as_bytes()).await {
                log::debug!("Failed to answer authorization redirect: {e}");
            }

            match outcome {
                Some(Ok(code)) => return Ok(code),
                Some(Err(error)) => return Err(MailboxError::Auth(error)),
                // favicon and other stray requests
                None => continue,
            }
        }
    }

    /// Extracts `code` (or `error`) from the request line of a redirect.
    /// A code is only accepted alongside the `state` sent with the consent URL.
    pub fn parse_redirect(request: &str, expected_state: &str) -> Option<Result<String, String>> {
        let target = request.lines().next()?.split_whitespace().nth(1)?;
        let url = Url::parse(&format!("http://127.0.0.1{target}")).ok()?;
        let mut code = None;
        let mut error = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        match (code, error) {
            (Some(_), _) if state.as_deref() != Some(expected_state) => {
                Some(Err("state parameter mismatch".to_string()))
            }
            (Some(code), _) => Some(Ok(code)),
            (None, Some(error)) => Some(Err(error)),
            (None, None) => None,
        }
    }
}

#[async_trait]
impl TokenProvider for InstalledAppCredentials {
    async fn access_token(&self) -> Result<String, MailboxError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = Self::load_token(&self.token_path).await?;
        }

        let now = Utc::now();
        if let Some(stored) = cached.as_ref() {
            if stored.is_valid_at(now) && stored.covers_scope(&self.scope) {
                if let Some(token) = &stored.token {
                    return Ok(token.clone());
                }
            }
        }

        let fresh = match cached.as_ref() {
            Some(stored) if stored.refresh_token.is_some() => match self.refresh(stored).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    log::warn!("Token refresh failed, re-authorizing: {e}");
                    self.authorize().await?
                }
            },
            _ => self.authorize().await?,
        };

        self.store_token(&fresh).await?;
        let token = fresh
            .token
            .clone()
            .ok_or_else(|| MailboxError::Auth("token endpoint returned no access token".into()))?;
        *cached = Some(fresh);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expiry: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            token: Some("ya29.test".to_string()),
            refresh_token: Some("1//refresh".to_string()),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
            expiry,
        }
    }

    #[test]
    fn test_token_validity_uses_skew() {
        let now = Utc::now();
        assert!(token(Some(now + ChronoDuration::minutes(10))).is_valid_at(now));
        assert!(!token(Some(now + ChronoDuration::seconds(30))).is_valid_at(now));
        assert!(!token(Some(now - ChronoDuration::minutes(1))).is_valid_at(now));
        assert!(token(None).is_valid_at(now));

        let mut empty = token(None);
        empty.token = None;
        assert!(!empty.is_valid_at(now));
    }

    #[test]
    fn test_token_file_parses_authorized_user_format() {
        let json = r#"{
            "token": "ya29.abc",
            "refresh_token": "1//xyz",
            "token_uri": "https://oauth2.googleapis.com/token",
            "client_id": "id.apps.googleusercontent.com",
            "client_secret": "shh",
            "scopes": ["https://www.googleapis.com/auth/gmail.readonly"],
            "expiry": "2030-01-01T00:00:00Z"
        }"#;
        let stored: StoredToken = serde_json::from_str(json).unwrap();
        assert_eq!(stored.token.as_deref(), Some("ya29.abc"));
        assert!(stored.covers_scope(GMAIL_READONLY_SCOPE));
        assert!(stored.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_client_secrets_accepts_web_section() {
        let json = r#"{"web": {"client_id": "id", "client_secret": "s"}}"#;
        let secrets: ClientSecrets = serde_json::from_str(json).unwrap();
        assert_eq!(secrets.installed.client_id, "id");
        assert_eq!(secrets.installed.token_uri, DEFAULT_TOKEN_URI);
    }

    #[test]
    fn test_consent_url_carries_offline_access() {
        let secret = ClientSecret {
            client_id: "id".to_string(),
            client_secret: "s".to_string(),
            auth_uri: DEFAULT_AUTH_URI.to_string(),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
        };
        let url = InstalledAppCredentials::consent_url(
            &secret,
            "http://127.0.0.1:4321/",
            GMAIL_READONLY_SCOPE,
            "s3cr3t",
        )
        .unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_type".to_string(), "offline".to_string())));
        assert!(pairs.contains(&("client_id".to_string(), "id".to_string())));
        assert!(pairs.contains(&("state".to_string(), "s3cr3t".to_string())));
        assert!(pairs.contains(&(
            "redirect_uri".to_string(),
            "http://127.0.0.1:4321/".to_string()
        )));
    }

    #[test]
    fn test_parse_redirect() {
        let ok = "GET /?state=x&code=4%2F0Abc&scope=gmail HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        assert_eq!(
            InstalledAppCredentials::parse_redirect(ok, "x"),
            Some(Ok("4/0Abc".to_string()))
        );

        let denied = "GET /?error=access_denied HTTP/1.1\r\n\r\n";
        assert_eq!(
            InstalledAppCredentials::parse_redirect(denied, "x"),
            Some(Err("access_denied".to_string()))
        );

        let favicon = "GET /favicon.ico HTTP/1.1\r\n\r\n";
        assert_eq!(InstalledAppCredentials::parse_redirect(favicon, "x"), None);
        assert_eq!(InstalledAppCredentials::parse_redirect("", "x"), None);
    }

    #[test]
    fn test_parse_redirect_rejects_foreign_state() {
        let forged = "GET /?state=attacker&code=4%2Fstolen HTTP/1.1\r\n\r\n";
        assert!(matches!(
            InstalledAppCredentials::parse_redirect(forged, "expected"),
            Some(Err(_))
        ));

        let stateless = "GET /?code=4%2Fstolen HTTP/1.1\r\n\r\n";
        assert!(matches!(
            InstalledAppCredentials::parse_redirect(stateless, "expected"),
            Some(Err(_))
        ));
    }

    #[test]
    fn test_generated_state_is_random_hex() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_consent_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let credentials_path = dir.path().join("credentials.json");
        std::fs::write(
            &credentials_path,
            r#"{"installed": {"client_id": "id", "client_secret": "s"}}"#,
        )
        .unwrap();

        let creds = InstalledAppCredentials::new(
            &credentials_path,
            dir.path().join("token.json"),
            reqwest::Client::new(),
        )
        .with_consent_timeout(Duration::from_millis(50));

        let err = creds.access_token().await.unwrap_err();
        assert!(matches!(err, MailboxError::Auth(_)), "got {err:?}");
        assert!(!dir.path().join("token.json").exists());
    }

    #[tokio::test]
    async fn test_valid_token_file_is_used_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token.json");
        let stored = token(Some(Utc::now() + ChronoDuration::hours(1)));
        std::fs::write(&token_path, serde_json::to_string(&stored).unwrap()).unwrap();

        let creds = InstalledAppCredentials::new(
            dir.path().join("credentials.json"),
            &token_path,
            reqwest::Client::new(),
        );
        assert_eq!(creds.access_token().await.unwrap(), "ya29.test");
    }
}
