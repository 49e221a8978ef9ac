//! OAuth credential handling for the YouTube upload scope.
//!
//! `authorize` runs the interactive installed-app consent once and stores the
//! token file; the uploader only ever refreshes it.

use anyhow::{Context, Result, anyhow, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::reddit::REQUEST_TIMEOUT;
use crate::security::write_private_file;

pub const UPLOAD_SCOPE: &str = "https://www.googleapis.com/auth/youtube.upload";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientSecrets {
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

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Google ships `client_secret.json` with the credentials nested under
/// `installed` (desktop apps) or `web`.
#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading client secrets {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let file: ClientSecretsFile = serde_json::from_str(raw)?;
        file.installed
            .or(file.web)
            .ok_or_else(|| anyhow!("neither an `installed` nor a `web` section is present"))
    }

    /// Consent URL for the offline upload scope.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String> {
        let url = url::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", UPLOAD_SCOPE),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .with_context(|| format!("building consent URL from {}", self.auth_uri))?;
        Ok(url.into())
    }
}

/// Random `state` value for the consent round-trip.
pub fn random_state() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "bearer")]
    pub token_type: String,
}

fn bearer() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > now
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let token = serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(token))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        write_private_file(path, &payload)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

impl TokenResponse {
    /// Google omits the refresh token on refresh responses; keep the old one.
    fn into_stored(self, previous_refresh: Option<String>, now: DateTime<Utc>) -> StoredToken {
        StoredToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            expires_at: now + Duration::seconds(self.expires_in),
            scope: self.scope.unwrap_or_else(|| UPLOAD_SCOPE.to_string()),
            token_type: self.token_type.unwrap_or_else(bearer),
        }
    }
}

/// Owns the client secrets and the persisted token, refreshing on demand.
pub struct Authenticator {
    secrets: ClientSecrets,
    token_path: PathBuf,
    token: Option<StoredToken>,
    http: ureq::Agent,
}

impl Authenticator {
    pub fn load(client_secret_path: &Path, token_path: &Path) -> Result<Self> {
        let secrets = ClientSecrets::load(client_secret_path)?;
        Self::load_from(secrets, token_path)
    }

    /// Pairs already-loaded secrets with the token file at `token_path`.
    pub fn load_from(secrets: ClientSecrets, token_path: &Path) -> Result<Self> {
        let token = StoredToken::load(token_path)?;
        Ok(Self::with_token(secrets, token_path.to_path_buf(), token))
    }

    pub fn with_token(secrets: ClientSecrets, token_path: PathBuf, token: Option<StoredToken>) -> Self {
        let http = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT * 3).build();
        Self {
            secrets,
            token_path,
            token,
            http,
        }
    }

    pub fn secrets(&self) -> &ClientSecrets {
        &self.secrets
    }

    /// A bearer token valid for at least another minute.
    pub fn access_token(&mut self) -> Result<String> {
        let now = Utc::now();
        let refresh_token = match &self.token {
            Some(token) if token.is_fresh(now) => return Ok(token.access_token.clone()),
            Some(token) => token.refresh_token.clone(),
            None => None,
        };
        let Some(refresh_token) = refresh_token else {
            bail!(
                "no usable credential in {}; run `authorize` first",
                self.token_path.display()
            );
        };

        info!("refreshing access token");
        let response = self.post_token_form(&[
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ])?;
        let token = response.into_stored(Some(refresh_token), now);
        token.save(&self.token_path)?;
        let access = token.access_token.clone();
        self.token = Some(token);
        Ok(access)
    }

    /// Exchanges the consent `code` and persists the resulting credential.
    pub fn exchange_code(&mut self, code: &str, redirect_uri: &str) -> Result<()> {
        let now = Utc::now();
        let response = self.post_token_form(&[
            ("client_id", self.secrets.client_id.as_str()),
            ("client_secret", self.secrets.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ])?;
        let previous = self.token.as_ref().and_then(|token| token.refresh_token.clone());
        let token = response.into_stored(previous, now);
        if token.refresh_token.is_none() {
            bail!("token endpoint returned no refresh token; revoke the app grant and retry");
        }
        token.save(&self.token_path)?;
        self.token = Some(token);
        Ok(())
    }

    fn post_token_form(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.secrets.token_uri)
            .send_form(form)
            .map_err(|err| match err {
                ureq::Error::Status(code, response) => {
                    let body = response.into_string().unwrap_or_default();
                    anyhow!("token endpoint returned {code}: {body}")
                }
                other => anyhow!(other),
            })
            .with_context(|| format!("requesting {}", self.secrets.token_uri))?;
        response
            .into_json::<TokenResponse>()
            .context("decoding token response")
    }
}
