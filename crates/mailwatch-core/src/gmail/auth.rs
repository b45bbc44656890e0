use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

use crate::gmail::oauth::{
    OAuthError, OAuthTokens, TOKEN_ENDPOINT, refresh_access_token_with_endpoint,
};

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const CALLBACK_PATH: &str = "/oauth2callback";
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);
const SUCCESS_HTML: &str = r#"<!doctype html>
<html>
  <head><title>mailwatch</title></head>
  <body style="font-family: sans-serif;">
    <h2>You can close this window</h2>
    <p>mailwatch is now authorized to watch your inbox.</p>
  </body>
</html>
"#;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to persist token file: {0}")]
    Persist(io::Error),
    #[error("failed to serialize tokens: {0}")]
    Serialize(serde_json::Error),
    #[error("failed to bind OAuth callback listener: {0}")]
    Listener(io::Error),
    #[error("oauth flow error: {0}")]
    OAuth(#[from] OAuthError),
    #[error("invalid consent URL: {0}")]
    ConsentUrl(String),
    #[error("OAuth callback error: {0}")]
    Callback(String),
    #[error("timed out waiting for the OAuth callback")]
    CallbackTimeout,
}

/// Called with the consent URL when interactive authorization is needed.
/// The default opens the system browser; tests drive the callback directly.
pub type ConsentPrompt = Box<dyn Fn(&Url) + Send + Sync>;

/// Owns the Gmail credential lifecycle: load from the durable token file,
/// refresh in place when expired, fall back to the interactive consent flow,
/// persist after every successful refresh or authorization.
///
/// The whole `acquire` path is serialized behind one mutex so a manual
/// `/check` and a scheduled tick can never race a refresh-and-persist.
pub struct CredentialStore {
    http: Client,
    client_id: String,
    client_secret: String,
    scopes: Vec<String>,
    token_path: PathBuf,
    token_endpoint: String,
    auth_endpoint: String,
    callback_timeout: Duration,
    consent: ConsentPrompt,
    cached: Mutex<Option<OAuthTokens>>,
}

impl CredentialStore {
    pub fn new(
        http: Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scopes: Vec<String>,
        token_path: PathBuf,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scopes,
            token_path,
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            consent: Box::new(open_consent_in_browser),
            cached: Mutex::new(None),
        }
    }

    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    pub fn with_auth_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.auth_endpoint = endpoint.into();
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn with_consent_prompt(mut self, consent: ConsentPrompt) -> Self {
        self.consent = consent;
        self
    }

    /// Returns a usable credential, walking cache → token file → refresh →
    /// interactive authorization. No internal retry: callers re-invoke on the
    /// next poll tick.
    pub async fn acquire(&self) -> Result<OAuthTokens, AuthError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(tokens) = cached.as_ref() {
            if tokens.is_valid(now) {
                return Ok(tokens.clone());
            }
        }

        // The in-memory copy is newer truth than the file (invalidate marks
        // it expired without touching disk).
        let candidate = match cached.clone() {
            Some(tokens) => Some(tokens),
            None => self.read_token_file().await,
        };

        if let Some(tokens) = candidate.as_ref() {
            if tokens.is_valid(now) {
                *cached = Some(tokens.clone());
                return Ok(tokens.clone());
            }
        }

        if let Some(tokens) = candidate.as_ref().filter(|t| t.refresh_token.is_some()) {
            match refresh_access_token_with_endpoint(
                &self.http,
                &self.client_id,
                &self.client_secret,
                tokens,
                &self.token_endpoint,
            )
            .await
            {
                Ok(refreshed) => {
                    self.persist(&refreshed).await?;
                    info!("refreshed Gmail access token");
                    *cached = Some(refreshed.clone());
                    return Ok(refreshed);
                }
                Err(err) => {
                    warn!(error = %err, "token refresh failed, falling back to interactive authorization");
                }
            }
        }

        let fresh = self.authorize_interactive().await?;
        self.persist(&fresh).await?;
        info!("completed interactive Gmail authorization");
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Discards trust in the current credential so the next `acquire`
    /// refreshes or re-authorizes. The refresh token, if any, is kept.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        let current = match cached.take() {
            Some(tokens) => Some(tokens),
            None => self.read_token_file().await,
        };
        *cached = current.map(|mut tokens| {
            tokens.expires_at = DateTime::<Utc>::MIN_UTC;
            tokens
        });
    }

    /// Absence or parse failure of the token file is not fatal; both mean
    /// "no credential".
    async fn read_token_file(&self) -> Option<OAuthTokens> {
        let raw = match tokio::fs::read_to_string(&self.token_path).await {
            Ok(raw) => raw,
            Err(err) => {
                debug!(path = %self.token_path.display(), error = %err, "no token file");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(err) => {
                warn!(path = %self.token_path.display(), error = %err, "token file unreadable, ignoring");
                None
            }
        }
    }

    async fn persist(&self, tokens: &OAuthTokens) -> Result<(), AuthError> {
        let serialized = serde_json::to_string_pretty(tokens).map_err(AuthError::Serialize)?;
        if let Some(parent) = self.token_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(AuthError::Persist)?;
            }
        }
        tokio::fs::write(&self.token_path, serialized)
            .await
            .map_err(AuthError::Persist)
    }

    /// Authorization Code flow over an ephemeral loopback listener. Suspends
    /// until the browser redirect arrives or the timeout elapses; never
    /// blocks the runtime.
    async fn authorize_interactive(&self) -> Result<OAuthTokens, AuthError> {
        let state = random_state();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(AuthError::Listener)?;
        let port = listener.local_addr().map_err(AuthError::Listener)?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}{CALLBACK_PATH}");

        let auth_url = build_auth_url(
            &self.auth_endpoint,
            &self.client_id,
            &redirect_uri,
            &self.scopes,
            &state,
        )?;

        info!(%redirect_uri, "waiting for Gmail consent callback");
        (self.consent)(&auth_url);

        let code = match time::timeout(self.callback_timeout, wait_for_code(listener, state)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(AuthError::CallbackTimeout),
        };

        let tokens = exchange_code_for_tokens(
            &self.http,
            &self.client_id,
            &self.client_secret,
            &code,
            &redirect_uri,
            &self.token_endpoint,
        )
        .await?;

        if tokens.refresh_token.is_none() {
            warn!("authorization granted no refresh token; expect another consent prompt after expiry");
        }

        Ok(tokens)
    }
}

fn random_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn build_auth_url(
    auth_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> Result<Url, AuthError> {
    let scope_value = scopes.join(" ");
    Url::parse_with_params(
        auth_endpoint,
        [
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope_value.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ],
    )
    .map_err(|err| AuthError::ConsentUrl(err.to_string()))
}

async fn wait_for_code(listener: TcpListener, expected_state: String) -> Result<String, AuthError> {
    let (mut stream, _addr) = listener.accept().await.map_err(AuthError::Listener)?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    // Read until the end of headers or a reasonable limit.
    for _ in 0..16 {
        let n = stream.read(&mut chunk).await.map_err(AuthError::Listener)?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buf.len() > 8192 {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let request_line = request
        .lines()
        .next()
        .ok_or_else(|| AuthError::Callback("malformed HTTP request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method != "GET" {
        let _ = send_response(&mut stream, 405, "Only GET is supported").await;
        return Err(AuthError::Callback("unexpected HTTP method".into()));
    }

    let url = match Url::parse(&format!("http://localhost{path}")) {
        Ok(url) => url,
        Err(err) => {
            let _ = send_response(
                &mut stream,
                400,
                "Malformed OAuth callback URL. Please retry the authorization.",
            )
            .await;
            return Err(AuthError::Callback(err.to_string()));
        }
    };

    let mut code: Option<String> = None;
    let mut state: Option<String> = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            _ => {}
        }
    }

    let code = match code {
        Some(code) if !code.is_empty() => code,
        _ => {
            let _ = send_response(
                &mut stream,
                400,
                "Missing code in callback. Please retry the authorization.",
            )
            .await;
            return Err(AuthError::Callback("missing code in callback".into()));
        }
    };

    if state.as_deref() != Some(expected_state.as_str()) {
        let _ = send_response(
            &mut stream,
            400,
            "State mismatch, please retry the authorization.",
        )
        .await;
        return Err(AuthError::Callback("state mismatch".into()));
    }

    let _ = send_response(&mut stream, 200, SUCCESS_HTML).await;
    Ok(code)
}

async fn send_response(
    stream: &mut tokio::net::TcpStream,
    status: u16,
    body: &str,
) -> io::Result<()> {
    let status_line = match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        405 => "405 Method Not Allowed",
        _ => "200 OK",
    };

    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await
}

#[derive(Debug, Deserialize)]
struct CodeTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
    #[allow(dead_code)]
    scope: Option<String>,
    #[allow(dead_code)]
    token_type: Option<String>,
}

async fn exchange_code_for_tokens(
    client: &Client,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
    endpoint: &str,
) -> Result<OAuthTokens, OAuthError> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", redirect_uri),
        ])
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let body = response.text().await?;
    let payload: CodeTokenResponse = serde_json::from_str(&body).map_err(OAuthError::Decode)?;
    if payload.expires_in <= 0 {
        return Err(OAuthError::InvalidExpires(payload.expires_in));
    }

    let expires_at = Utc::now() + chrono::Duration::seconds(payload.expires_in);

    Ok(OAuthTokens {
        access_token: payload.access_token,
        refresh_token: payload.refresh_token,
        expires_at,
    })
}

fn open_consent_in_browser(url: &Url) {
    println!("Open this URL in your browser to authorize mailwatch:\n{url}\n");

    #[cfg(target_os = "macos")]
    let mut command = Command::new("open");
    #[cfg(target_os = "linux")]
    let mut command = Command::new("xdg-open");
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let mut command = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg("start");
        cmd
    };

    command.arg(url.as_str());
    match command.status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "browser command failed; open the URL manually"),
        Err(err) => warn!(error = %err, "could not open browser; open the URL manually"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_with_endpoints(server: &MockServer, token_path: PathBuf) -> CredentialStore {
        CredentialStore::new(
            reqwest::Client::new(),
            "client",
            "secret",
            vec!["scope".into()],
            token_path,
        )
        .with_token_endpoint(format!("{}/token", server.uri()))
    }

    fn write_tokens(path: &std::path::Path, tokens: &OAuthTokens) {
        std::fs::write(path, serde_json::to_string(tokens).unwrap()).unwrap();
    }

    fn valid_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "cached_access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        }
    }

    fn expired_tokens() -> OAuthTokens {
        OAuthTokens {
            access_token: "stale_access".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Utc::now() - ChronoDuration::minutes(1),
        }
    }

    #[tokio::test]
    async fn acquire_fast_path_performs_no_network_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let token_path = dir.path().join("token.json");
        write_tokens(&token_path, &valid_tokens());

        let store = store_with_endpoints(&server, token_path);
        let first = store.acquire().await.expect("first acquire");
        let second = store.acquire().await.expect("second acquire");
        assert_eq!(first.access_token, "cached_access");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn acquire_refreshes_expired_token_and_persists_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh_access",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let token_path = dir.path().join("token.json");
        write_tokens(&token_path, &expired_tokens());

        let store = store_with_endpoints(&server, token_path.clone());
        let tokens = store.acquire().await.expect("acquire refreshes");

        assert_eq!(tokens.access_token, "fresh_access");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh"));

        let persisted: OAuthTokens =
            serde_json::from_str(&std::fs::read_to_string(&token_path).unwrap()).unwrap();
        assert_eq!(persisted, tokens);

        // Second acquire uses the refreshed cache; mock expect(1) verifies no
        // further token endpoint traffic on drop.
        let again = store.acquire().await.expect("cached acquire");
        assert_eq!(again.access_token, "fresh_access");
    }

    #[tokio::test]
    async fn refresh_failure_falls_back_to_interactive_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=granted"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "interactive_access",
                "refresh_token": "interactive_refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let token_path = dir.path().join("token.json");
        write_tokens(&token_path, &expired_tokens());

        let store = store_with_endpoints(&server, token_path.clone())
            .with_callback_timeout(Duration::from_secs(5))
            .with_consent_prompt(Box::new(|url| {
                // Simulate the browser redirect back to the loopback listener.
                let params: std::collections::HashMap<_, _> =
                    url.query_pairs().into_owned().collect();
                let redirect = params.get("redirect_uri").cloned().expect("redirect_uri");
                let state = params.get("state").cloned().expect("state");
                tokio::spawn(async move {
                    let callback = format!("{redirect}?code=granted&state={state}");
                    let _ = reqwest::get(callback).await;
                });
            }));

        let tokens = store.acquire().await.expect("interactive flow succeeds");
        assert_eq!(tokens.access_token, "interactive_access");
        assert_eq!(
            tokens.refresh_token.as_deref(),
            Some("interactive_refresh")
        );

        let persisted: OAuthTokens =
            serde_json::from_str(&std::fs::read_to_string(&token_path).unwrap()).unwrap();
        assert_eq!(persisted, tokens);
    }

    #[tokio::test]
    async fn corrupt_token_file_is_treated_as_no_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "recovered_access",
                "refresh_token": "recovered_refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let token_path = dir.path().join("token.json");
        std::fs::write(&token_path, "{ not json").unwrap();

        let store = store_with_endpoints(&server, token_path)
            .with_callback_timeout(Duration::from_secs(5))
            .with_consent_prompt(Box::new(|url| {
                let params: std::collections::HashMap<_, _> =
                    url.query_pairs().into_owned().collect();
                let redirect = params.get("redirect_uri").cloned().expect("redirect_uri");
                let state = params.get("state").cloned().expect("state");
                tokio::spawn(async move {
                    let callback = format!("{redirect}?code=any&state={state}");
                    let _ = reqwest::get(callback).await;
                });
            }));

        let tokens = store.acquire().await.expect("interactive flow succeeds");
        assert_eq!(tokens.access_token, "recovered_access");
    }

    #[tokio::test]
    async fn invalidate_forces_refresh_on_next_acquire() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "reissued_access",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let token_path = dir.path().join("token.json");
        write_tokens(&token_path, &valid_tokens());

        let store = store_with_endpoints(&server, token_path);
        let first = store.acquire().await.expect("first acquire");
        assert_eq!(first.access_token, "cached_access");

        store.invalidate().await;

        let second = store.acquire().await.expect("acquire after invalidate");
        assert_eq!(second.access_token, "reissued_access");
    }

    #[test]
    fn build_auth_url_includes_expected_params() {
        let url = build_auth_url(
            AUTH_ENDPOINT,
            "client",
            "http://127.0.0.1:8080/oauth2callback",
            &["scope1".into(), "scope2".into()],
            "state123",
        )
        .expect("url builds");

        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("accounts.google.com"));
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params.get("client_id"), Some(&"client".to_string()));
        assert_eq!(
            params.get("redirect_uri"),
            Some(&"http://127.0.0.1:8080/oauth2callback".to_string())
        );
        assert_eq!(params.get("response_type"), Some(&"code".to_string()));
        assert_eq!(params.get("scope"), Some(&"scope1 scope2".to_string()));
        assert_eq!(params.get("state"), Some(&"state123".to_string()));
        assert_eq!(params.get("access_type"), Some(&"offline".to_string()));
        assert_eq!(params.get("prompt"), Some(&"consent".to_string()));
    }

    #[test]
    fn random_state_is_urlsafe_and_correct_length() {
        let state = random_state();
        assert!(state.len() >= 43); // 32 bytes => 43 chars without padding
        let decoded = URL_SAFE_NO_PAD
            .decode(state.as_bytes())
            .expect("state decodes");
        assert_eq!(decoded.len(), 32);
    }

    #[tokio::test]
    async fn wait_for_code_returns_authorization_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let wait = tokio::spawn(wait_for_code(listener, "state".to_string()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {CALLBACK_PATH}?code=abc&state=state HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();

        let code = wait.await.unwrap().expect("code returned");
        assert_eq!(code, "abc");
    }

    #[tokio::test]
    async fn wait_for_code_rejects_state_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let wait = tokio::spawn(wait_for_code(listener, "expected".to_string()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {CALLBACK_PATH}?code=abc&state=wrong HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.contains("400 Bad Request"));

        let err = wait.await.unwrap().expect_err("state mismatch");
        assert!(err.to_string().contains("state mismatch"));
    }

    #[tokio::test]
    async fn wait_for_code_returns_error_for_missing_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let wait = tokio::spawn(wait_for_code(listener, "state".to_string()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {CALLBACK_PATH}?state=state HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.contains("400 Bad Request"));

        let err = wait.await.unwrap().expect_err("missing code");
        assert!(err.to_string().contains("missing code"));
    }

    #[tokio::test]
    async fn wait_for_code_rejects_non_get() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let wait = tokio::spawn(wait_for_code(listener, "state".to_string()));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST {CALLBACK_PATH}?code=abc&state=state HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.contains("405 Method Not Allowed"));

        let err = wait.await.unwrap().expect_err("method mismatch");
        assert!(err.to_string().contains("unexpected HTTP method"));
    }

    #[tokio::test]
    async fn exchange_code_requires_positive_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access",
                "refresh_token": "refresh",
                "expires_in": -1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new();
        let err = exchange_code_for_tokens(
            &client,
            "client",
            "secret",
            "code",
            "http://localhost/callback",
            &format!("{}/token", server.uri()),
        )
        .await
        .expect_err("invalid expires");

        assert!(matches!(err, OAuthError::InvalidExpires(-1)));
    }
}
