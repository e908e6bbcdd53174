//! Bearer tokens for the profiler API and inference of the project id.
//!
//! Tokens come either from a JSON token file or, ambiently, from the GCE
//! metadata server. Ambient tokens are cached until shortly before they
//! expire.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tonic::metadata::MetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use url::Url;

const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

/// Refresh ambient tokens this long before the server says they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsSource {
    /// A JSON file with an `access_token` and optionally a `project_id`.
    File(PathBuf),
    /// The metadata server of the instance the agent runs on.
    Ambient,
    /// No credentials at all, for plaintext test endpoints.
    Anonymous,
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    project_id: Option<String>,
    /// Set to `service_account` in downloaded key files.
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

fn read_token_file(path: &Path) -> anyhow::Result<TokenFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials {}", path.display()))?;
    let parsed: TokenFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse credentials {}", path.display()))?;
    if parsed.kind.as_deref() == Some("service_account") {
        bail!(
            "credentials {} hold a service account key, expected a token file with an access_token",
            path.display()
        );
    }
    if parsed.access_token.trim().is_empty() {
        bail!("credentials {} carry an empty access_token", path.display());
    }
    Ok(parsed)
}

pub struct MetadataServer {
    base: Url,
    client: ureq::Agent,
}

impl MetadataServer {
    pub fn new(host: &str) -> anyhow::Result<Self> {
        let base = Url::parse(&format!("http://{}/computeMetadata/v1/", host))
            .with_context(|| format!("invalid metadata host {}", host))?;
        Ok(Self {
            base,
            client: ureq::AgentBuilder::new()
                .timeout_connect(Duration::from_secs(2))
                .timeout_read(Duration::from_secs(5))
                .timeout_write(Duration::from_secs(5))
                .build(),
        })
    }

    /// Honors `GCE_METADATA_HOST` like the Google client libraries do.
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var(METADATA_HOST_ENV)
            .unwrap_or_else(|_| DEFAULT_METADATA_HOST.to_string());
        Self::new(&host)
    }

    fn url(&self, path: &str) -> anyhow::Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn get(&self, path: &str) -> anyhow::Result<String> {
        let url = self.url(path)?;
        let response = match self.client.get(url.as_str()).set("Metadata-Flavor", "Google").call() {
            Ok(response) => response,
            Err(e) => bail!("metadata request {} failed: {}", url, e),
        };
        Ok(response.into_string()?)
    }

    pub fn project_id(&self) -> anyhow::Result<String> {
        let id = self.get("project/project-id")?;
        let id = id.trim();
        if id.is_empty() {
            bail!("metadata server returned an empty project id");
        }
        Ok(id.to_string())
    }

    fn access_token(&self) -> anyhow::Result<CachedToken> {
        let body = self.get("instance/service-accounts/default/token")?;
        let token: MetadataToken =
            serde_json::from_str(&body).context("failed to parse metadata token")?;
        Ok(CachedToken {
            value: token.access_token,
            refresh_at: Instant::now()
                + Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

enum TokenKind {
    Static(String),
    Metadata(MetadataServer),
    Anonymous,
}

pub struct TokenSource {
    kind: TokenKind,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(source: &CredentialsSource) -> anyhow::Result<Self> {
        let kind = match source {
            CredentialsSource::File(path) => TokenKind::Static(read_token_file(path)?.access_token),
            CredentialsSource::Ambient => TokenKind::Metadata(MetadataServer::from_env()?),
            CredentialsSource::Anonymous => TokenKind::Anonymous,
        };
        Ok(Self {
            kind,
            cached: Mutex::new(None),
        })
    }

    /// The token to present, `None` for anonymous access.
    pub fn bearer(&self) -> anyhow::Result<Option<String>> {
        let server = match &self.kind {
            TokenKind::Anonymous => return Ok(None),
            TokenKind::Static(token) => return Ok(Some(token.clone())),
            TokenKind::Metadata(server) => server,
        };

        let mut cached = match self.cached.lock() {
            Ok(cached) => cached,
            Err(_) => bail!("failed to lock token cache"),
        };
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(Some(token.value.clone()));
        }
        let token = server.access_token()?;
        log::debug!("refreshed access token from metadata server");
        let value = token.value.clone();
        *cached = Some(token);
        Ok(Some(value))
    }
}

/// Attaches `authorization: Bearer <token>` to every call.
#[derive(Clone)]
pub struct AuthInterceptor {
    tokens: Arc<TokenSource>,
}

impl AuthInterceptor {
    pub fn new(tokens: Arc<TokenSource>) -> Self {
        Self { tokens }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let token = self
            .tokens
            .bearer()
            .map_err(|e| Status::unavailable(format!("no access token: {:#}", e)))?;
        if let Some(token) = token {
            let value = MetadataValue::try_from(format!("Bearer {}", token))
                .map_err(|_| Status::unauthenticated("access token is not a valid header value"))?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

/// Project id from the credentials, the environment, or the metadata server,
/// in that order.
pub fn infer_project(source: &CredentialsSource) -> anyhow::Result<String> {
    if let CredentialsSource::File(path) = source {
        if let Some(project) = read_token_file(path)?.project_id.filter(|p| !p.is_empty()) {
            return Ok(project);
        }
    }
    if let Ok(project) = std::env::var(PROJECT_ENV) {
        if !project.is_empty() {
            return Ok(project);
        }
    }
    match source {
        CredentialsSource::Ambient => MetadataServer::from_env()?
            .project_id()
            .context("could not determine project"),
        _ => bail!("could not determine project, pass --project or set {}", PROJECT_ENV),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn token_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_static_token_from_file() {
        let file = token_file(r#"{"access_token": "ya29.token", "project_id": "my-proj"}"#);
        let source = CredentialsSource::File(file.path().to_path_buf());
        let tokens = TokenSource::new(&source).unwrap();
        assert_eq!(tokens.bearer().unwrap().as_deref(), Some("ya29.token"));
        assert_eq!(infer_project(&source).unwrap(), "my-proj");
    }

    #[test]
    fn test_empty_token_rejected() {
        let file = token_file(r#"{"access_token": "  "}"#);
        assert!(TokenSource::new(&CredentialsSource::File(file.path().to_path_buf())).is_err());
    }

    #[test]
    fn test_malformed_file_rejected() {
        let file = token_file("not json");
        let err = TokenSource::new(&CredentialsSource::File(file.path().to_path_buf()))
            .err()
            .unwrap();
        assert!(format!("{:#}", err).contains("failed to parse credentials"));
    }

    #[test]
    fn test_anonymous_interceptor_adds_nothing() {
        let tokens = Arc::new(TokenSource::new(&CredentialsSource::Anonymous).unwrap());
        let request = AuthInterceptor::new(tokens).call(Request::new(())).unwrap();
        assert!(request.metadata().get("authorization").is_none());
    }

    #[test]
    fn test_interceptor_sets_bearer() {
        let file = token_file(r#"{"access_token": "abc"}"#);
        let source = CredentialsSource::File(file.path().to_path_buf());
        let tokens = Arc::new(TokenSource::new(&source).unwrap());
        let request = AuthInterceptor::new(tokens).call(Request::new(())).unwrap();
        assert_eq!(
            request.metadata().get("authorization").unwrap().to_str().unwrap(),
            "Bearer abc"
        );
    }

    #[test]
    fn test_service_account_key_rejected() {
        let file = token_file(
            r#"{"type": "service_account", "project_id": "p", "private_key": "-----BEGIN"}"#,
        );
        let err = TokenSource::new(&CredentialsSource::File(file.path().to_path_buf()))
            .err()
            .unwrap();
        assert!(err.to_string().contains("service account key"));
    }

    #[test]
    fn test_unreachable_metadata_server_is_retryable() {
        let tokens = Arc::new(TokenSource {
            kind: TokenKind::Metadata(MetadataServer::new("127.0.0.1:9").unwrap()),
            cached: Mutex::new(None),
        });
        let started = Instant::now();
        let status = AuthInterceptor::new(tokens).call(Request::new(())).unwrap_err();
        assert!(crate::negotiator::is_retryable(&status), "got {:?}", status.code());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_metadata_urls() {
        let server = MetadataServer::new("169.254.169.254").unwrap();
        assert_eq!(
            server.url("project/project-id").unwrap().as_str(),
            "http://169.254.169.254/computeMetadata/v1/project/project-id"
        );
    }
}
