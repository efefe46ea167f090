//! Credential discovery and OAuth2 access tokens.
use std::env;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::{debug, info};

use super::transport::Transport;

/// Scope granting read access to Cloud Monitoring.
pub const MONITORING_READ_SCOPE: &str = "https://www.googleapis.com/auth/monitoring.read";

/// Scope granting read access to the list of projects.
pub const PROJECTS_READ_SCOPE: &str =
    "https://www.googleapis.com/auth/cloudplatformprojects.readonly";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const METADATA_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Convenience type for the future returned by [`TokenSource::token`].
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<String, AuthError>> + Send + 'a>>;

/// Errors that could occur while discovering credentials or obtaining a token.
#[derive(Debug, ThisError)]
pub enum AuthError {
    /// No credentials could be found.
    #[error(
        "no credentials found: set GOOGLE_APPLICATION_CREDENTIALS, run `gcloud auth \
         application-default login`, or run on Google Cloud"
    )]
    NoCredentials,

    /// A credentials file could not be read.
    #[error("failed to read credentials file {}: {source}", path.display())]
    ReadKeyFile {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A credentials file is not a supported key file.
    #[error("invalid credentials file {}: {source}", path.display())]
    ParseKeyFile {
        /// Path of the file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A service account key could not be used to sign an assertion.
    #[error("invalid service account key: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),

    /// The token endpoint could not be reached.
    #[error("token request failed: {0}")]
    TokenRequest(String),

    /// The token endpoint rejected the request.
    #[error("token endpoint answered {status}: {body}")]
    TokenStatus {
        /// HTTP status of the response.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The token endpoint answered with something other than a token.
    #[error("invalid token response: {0}")]
    TokenResponse(#[source] serde_json::Error),

    /// The token cannot be sent in a header.
    #[error("access token contains characters not allowed in a header")]
    InvalidToken,
}

/// A source of OAuth2 access tokens.
pub trait TokenSource: Send + Sync {
    /// Gets a token that is valid for at least a little while.
    fn token(&self) -> TokenFuture<'_>;
}

/// Token source that always returns the same token.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    /// Creates a new [`StaticTokenSource`].
    pub fn new<T: Into<String>>(token: T) -> Self {
        Self { token: token.into() }
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> TokenFuture<'_> {
        let token = self.token.clone();
        Box::pin(async move { Ok(token) })
    }
}

enum Grant {
    ServiceAccount {
        client_email: String,
        key: EncodingKey,
        key_id: Option<String>,
        token_uri: String,
        scopes: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_uri: String,
    },
    Metadata {
        host: String,
        scopes: String,
    },
}

impl Grant {
    fn kind(&self) -> &'static str {
        match self {
            Grant::ServiceAccount { .. } => "service_account",
            Grant::AuthorizedUser { .. } => "authorized_user",
            Grant::Metadata { .. } => "metadata",
        }
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Token source that obtains short-lived tokens from an OAuth2 endpoint and caches them.
pub struct OAuthTokenSource {
    grant: Grant,
    transport: Arc<dyn Transport>,
    clock: Clock,
    cached: Mutex<Option<CachedToken>>,
    refreshing: tokio::sync::Mutex<()>,
}

impl OAuthTokenSource {
    fn new(grant: Grant, transport: Arc<dyn Transport>, clock: Clock) -> Self {
        Self { grant, transport, clock, cached: Mutex::new(None), refreshing: tokio::sync::Mutex::new(()) }
    }

    fn cached_token(&self) -> Option<String> {
        let now = self.clock.now();
        self.cached
            .lock()
            .as_ref()
            .filter(|cached| now + EXPIRY_MARGIN < cached.expires_at)
            .map(|cached| cached.value.clone())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        // Only one request is in flight; callers queued behind it reuse its token.
        let _refreshing = self.refreshing.lock().await;
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }

        debug!(grant = self.grant.kind(), "requesting access token");
        let request = self.token_request()?;
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| AuthError::TokenRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::TokenStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(response.body()).into_owned(),
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(response.body()).map_err(AuthError::TokenResponse)?;
        let expires_at = self.clock.now() + Duration::from_secs(token.expires_in);
        *self.cached.lock() = Some(CachedToken { value: token.access_token.clone(), expires_at });

        Ok(token.access_token)
    }

    fn token_request(&self) -> Result<Request<Bytes>, AuthError> {
        let request = match &self.grant {
            Grant::ServiceAccount { client_email, key, key_id, token_uri, scopes } => {
                let iat = chrono::Utc::now().timestamp();
                let claims =
                    AssertionClaims { iss: client_email, scope: scopes, aud: token_uri, iat, exp: iat + 3600 };
                let mut header = Header::new(Algorithm::RS256);
                header.kid = key_id.clone();
                let assertion = jsonwebtoken::encode(&header, &claims, key)?;

                let body = form_urlencoded::Serializer::new(String::new())
                    .append_pair("grant_type", JWT_BEARER_GRANT)
                    .append_pair("assertion", &assertion)
                    .finish();
                form_request(token_uri, body)
            }
            Grant::AuthorizedUser { client_id, client_secret, refresh_token, token_uri } => {
                let body = form_urlencoded::Serializer::new(String::new())
                    .append_pair("grant_type", "refresh_token")
                    .append_pair("client_id", client_id)
                    .append_pair("client_secret", client_secret)
                    .append_pair("refresh_token", refresh_token)
                    .finish();
                form_request(token_uri, body)
            }
            Grant::Metadata { host, scopes } => {
                let query =
                    form_urlencoded::Serializer::new(String::new()).append_pair("scopes", scopes).finish();
                Request::get(format!(
                    "http://{host}/computeMetadata/v1/instance/service-accounts/default/token?{query}"
                ))
                .header("Metadata-Flavor", "Google")
                .body(Bytes::new())
            }
        };

        request.map_err(|e| AuthError::TokenRequest(e.to_string()))
    }
}

fn form_request(uri: &str, body: String) -> Result<Request<Bytes>, hyper::http::Error> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Bytes::from(body))
}

impl TokenSource for OAuthTokenSource {
    fn token(&self) -> TokenFuture<'_> {
        Box::pin(self.refresh())
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KeyFile {
    ServiceAccount {
        client_email: String,
        private_key: String,
        #[serde(default)]
        private_key_id: Option<String>,
        #[serde(default)]
        token_uri: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        #[serde(default)]
        quota_project_id: Option<String>,
    },
}

/// Where credentials are looked for.
#[derive(Clone, Debug, Default)]
pub struct CredentialEnvironment {
    /// A ready-to-use access token (`GOOGLE_OAUTH_ACCESS_TOKEN`).
    pub access_token: Option<String>,
    /// Explicit key file (`GOOGLE_APPLICATION_CREDENTIALS`).
    pub credentials_file: Option<PathBuf>,
    /// Key file written by `gcloud auth application-default login`.
    pub well_known_file: Option<PathBuf>,
    /// Host of the metadata server (`GCE_METADATA_HOST`).
    pub metadata_host: Option<String>,
    /// Project set in the environment (`GOOGLE_CLOUD_PROJECT`).
    pub project: Option<String>,
}

impl CredentialEnvironment {
    /// Reads the credential environment of the current process.
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|value| !value.is_empty());

        let gcloud_config = var("CLOUDSDK_CONFIG").map(PathBuf::from).or_else(|| {
            if cfg!(windows) {
                var("APPDATA").map(|dir| Path::new(&dir).join("gcloud"))
            } else {
                var("HOME").map(|dir| Path::new(&dir).join(".config").join("gcloud"))
            }
        });

        CredentialEnvironment {
            access_token: var("GOOGLE_OAUTH_ACCESS_TOKEN"),
            credentials_file: var("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from),
            well_known_file: gcloud_config
                .map(|dir| dir.join("application_default_credentials.json")),
            metadata_host: var("GCE_METADATA_HOST"),
            project: var("GOOGLE_CLOUD_PROJECT").or_else(|| var("GCLOUD_PROJECT")),
        }
    }
}

/// Discovered credentials.
pub struct Credentials {
    /// Source of access tokens.
    pub tokens: Arc<dyn TokenSource>,
    /// Project the credentials belong to, if known.
    pub project_id: Option<String>,
}

/// Discovers the default credentials.
///
/// Credentials are looked up, in order, as an access token in the environment, the key file
/// named by `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud application default credentials, and
/// the metadata server of the instance the process runs on.  `transport` is used for token
/// requests, and must not authorize requests itself.
///
/// ## Errors
///
/// If no credentials can be found, or a key file is unreadable or malformed, an error is
/// returned.
pub async fn discover_credentials(
    environment: &CredentialEnvironment,
    transport: Arc<dyn Transport>,
    scopes: &[&str],
) -> Result<Credentials, AuthError> {
    if let Some(token) = &environment.access_token {
        info!("using access token from the environment");
        return Ok(Credentials {
            tokens: Arc::new(StaticTokenSource::new(token.clone())),
            project_id: environment.project.clone(),
        });
    }

    if let Some(path) = &environment.credentials_file {
        info!(path = %path.display(), "using credentials file");
        return credentials_from_file(path, environment, transport, scopes);
    }

    if let Some(path) = environment.well_known_file.as_ref().filter(|path| path.is_file()) {
        info!(path = %path.display(), "using application default credentials");
        return credentials_from_file(path, environment, transport, scopes);
    }

    let host = environment.metadata_host.clone().unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
    match probe_metadata_server(transport.as_ref(), &host).await {
        Some(project_id) => {
            info!(%host, "using metadata server credentials");
            let grant = Grant::Metadata { host, scopes: scopes.join(",") };
            Ok(Credentials {
                tokens: Arc::new(OAuthTokenSource::new(grant, transport, Clock::new())),
                project_id: environment.project.clone().or(Some(project_id)),
            })
        }
        None => Err(AuthError::NoCredentials),
    }
}

fn credentials_from_file(
    path: &Path,
    environment: &CredentialEnvironment,
    transport: Arc<dyn Transport>,
    scopes: &[&str],
) -> Result<Credentials, AuthError> {
    let contents = fs::read(path)
        .map_err(|source| AuthError::ReadKeyFile { path: path.to_path_buf(), source })?;
    let key_file = serde_json::from_slice(&contents)
        .map_err(|source| AuthError::ParseKeyFile { path: path.to_path_buf(), source })?;

    let (grant, project_id) = grant_from_key_file(key_file, scopes)?;
    Ok(Credentials {
        tokens: Arc::new(OAuthTokenSource::new(grant, transport, Clock::new())),
        project_id: project_id.or_else(|| environment.project.clone()),
    })
}

fn grant_from_key_file(
    key_file: KeyFile,
    scopes: &[&str],
) -> Result<(Grant, Option<String>), AuthError> {
    match key_file {
        KeyFile::ServiceAccount { client_email, private_key, private_key_id, token_uri, project_id } => {
            let grant = Grant::ServiceAccount {
                client_email,
                key: EncodingKey::from_rsa_pem(private_key.as_bytes())?,
                key_id: private_key_id,
                token_uri: token_uri.unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                scopes: scopes.join(" "),
            };
            Ok((grant, project_id))
        }
        KeyFile::AuthorizedUser { client_id, client_secret, refresh_token, quota_project_id } => {
            let grant = Grant::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_uri: DEFAULT_TOKEN_URI.to_string(),
            };
            Ok((grant, quota_project_id))
        }
    }
}

async fn probe_metadata_server(transport: &dyn Transport, host: &str) -> Option<String> {
    let request = Request::get(format!("http://{host}/computeMetadata/v1/project/project-id"))
        .header("Metadata-Flavor", "Google")
        .body(Bytes::new())
        .ok()?;

    match tokio::time::timeout(METADATA_PROBE_TIMEOUT, transport.send(request)).await {
        Ok(Ok(response)) if response.status().is_success() => {
            let project_id = String::from_utf8_lossy(response.body()).trim().to_string();
            Some(project_id).filter(|id| !id.is_empty())
        }
        Ok(Ok(response)) => {
            debug!(status = response.status().as_u16(), "metadata server rejected probe");
            None
        }
        Ok(Err(e)) => {
            debug!(error = %e, "metadata server unreachable");
            None
        }
        Err(_) => {
            debug!("metadata server probe timed out");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use hyper::{Response, StatusCode};

    use super::*;
    use crate::client::transport::{TransportError, TransportFuture};

    #[derive(Default)]
    struct TokenEndpoint {
        requests: Mutex<Vec<Request<Bytes>>>,
    }

    impl Transport for TokenEndpoint {
        fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
            let response = if request.uri().path().ends_with("/project/project-id") {
                Response::builder().status(StatusCode::OK).body(Bytes::from_static(b"metadata-project"))
            } else {
                let issued = self.requests.lock().len();
                let body = format!(r#"{{"access_token":"token-{issued}","expires_in":120,"token_type":"Bearer"}}"#);
                Response::builder().status(StatusCode::OK).body(Bytes::from(body))
            };
            self.requests.lock().push(request);
            let response = response.map_err(TransportError::from);
            Box::pin(async move { response })
        }
    }

    struct SlowTokenEndpoint(Arc<TokenEndpoint>);

    impl Transport for SlowTokenEndpoint {
        fn send(&self, request: Request<Bytes>) -> TransportFuture<'_> {
            let response = self.0.send(request);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                response.await
            })
        }
    }

    fn authorized_user(transport: Arc<dyn Transport>, clock: Clock) -> OAuthTokenSource {
        let grant = Grant::AuthorizedUser {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
        };
        OAuthTokenSource::new(grant, transport, clock)
    }

    #[tokio::test]
    async fn test_tokens_are_cached_until_close_to_expiry() {
        let (clock, mock) = Clock::mock();
        let endpoint = Arc::new(TokenEndpoint::default());
        let source = authorized_user(Arc::clone(&endpoint) as Arc<dyn Transport>, clock);

        assert_eq!(source.token().await.unwrap(), "token-0");
        mock.increment(Duration::from_secs(30));
        assert_eq!(source.token().await.unwrap(), "token-0");
        mock.increment(Duration::from_secs(40));
        assert_eq!(source.token().await.unwrap(), "token-1");

        let requests = endpoint.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method(), Method::POST);
        let form = form_urlencoded::parse(requests[0].body()).into_owned().collect::<Vec<_>>();
        assert!(form.contains(&("grant_type".to_string(), "refresh_token".to_string())));
        assert!(form.contains(&("refresh_token".to_string(), "refresh".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(TokenEndpoint::default());
        let source = authorized_user(Arc::new(SlowTokenEndpoint(Arc::clone(&endpoint))), Clock::new());

        let tokens = futures::future::join_all((0..4).map(|_| source.token())).await;
        for token in tokens {
            assert_eq!(token.unwrap(), "token-0");
        }
        assert_eq!(endpoint.requests.lock().len(), 1);
    }

    #[test]
    fn test_key_file_types() {
        let key_file: KeyFile = serde_json::from_str(
            r#"{"type":"authorized_user","client_id":"id","client_secret":"s","refresh_token":"r","quota_project_id":"quota"}"#,
        )
        .unwrap();
        let (grant, project_id) = grant_from_key_file(key_file, &[MONITORING_READ_SCOPE]).unwrap();
        assert_eq!(grant.kind(), "authorized_user");
        assert_eq!(project_id.as_deref(), Some("quota"));

        let key_file: KeyFile = serde_json::from_str(
            r#"{"type":"service_account","client_email":"a@b","private_key":"not a key","project_id":"p"}"#,
        )
        .unwrap();
        assert!(matches!(
            grant_from_key_file(key_file, &[MONITORING_READ_SCOPE]),
            Err(AuthError::InvalidKey(_))
        ));

        assert!(serde_json::from_str::<KeyFile>(r#"{"type":"external_account"}"#).is_err());
    }

    #[tokio::test]
    async fn test_environment_token_wins() {
        let environment = CredentialEnvironment {
            access_token: Some("static".to_string()),
            project: Some("env-project".to_string()),
            ..Default::default()
        };
        let credentials = discover_credentials(&environment, Arc::new(TokenEndpoint::default()), &[])
            .await
            .unwrap();
        assert_eq!(credentials.tokens.token().await.unwrap(), "static");
        assert_eq!(credentials.project_id.as_deref(), Some("env-project"));
    }

    #[tokio::test]
    async fn test_unreadable_credentials_file_is_an_error() {
        let environment = CredentialEnvironment {
            credentials_file: Some(PathBuf::from("/nonexistent/credentials.json")),
            ..Default::default()
        };
        let result = discover_credentials(&environment, Arc::new(TokenEndpoint::default()), &[]).await;
        assert!(matches!(result, Err(AuthError::ReadKeyFile { .. })));
    }

    #[tokio::test]
    async fn test_metadata_server_fallback() {
        let endpoint = Arc::new(TokenEndpoint::default());
        let environment = CredentialEnvironment {
            metadata_host: Some("metadata.test".to_string()),
            ..Default::default()
        };
        let credentials =
            discover_credentials(&environment, Arc::clone(&endpoint) as Arc<dyn Transport>, &[MONITORING_READ_SCOPE])
                .await
                .unwrap();
        assert_eq!(credentials.project_id.as_deref(), Some("metadata-project"));

        assert_eq!(credentials.tokens.token().await.unwrap(), "token-1");
        let requests = endpoint.requests.lock();
        assert_eq!(requests[1].headers().get("Metadata-Flavor").unwrap(), "Google");
        assert!(requests[1].uri().to_string().starts_with("http://metadata.test/computeMetadata/v1/instance/"));
    }

    #[tokio::test]
    async fn test_no_credentials() {
        struct Unreachable;

        impl Transport for Unreachable {
            fn send(&self, _: Request<Bytes>) -> TransportFuture<'_> {
                let result: Result<Response<Bytes>, TransportError> =
                    Err(TransportError::Send("connection refused".to_string()));
                Box::pin(async move { result })
            }
        }

        let result = discover_credentials(&CredentialEnvironment::default(), Arc::new(Unreachable), &[]).await;
        assert!(matches!(result, Err(AuthError::NoCredentials)));
    }
}
