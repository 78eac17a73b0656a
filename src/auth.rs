//! Token authentication for incoming upgrade requests.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use url::form_urlencoded;

use crate::handshake::HttpRequest;

pub const DEFAULT_TOKEN_ENV: &str = "EDITOR_BRIDGE_TOKEN";

/// Header older clients use instead of `Authorization`.
pub const LEGACY_TOKEN_HEADER: &str = "x-bridge-token";

const TOKEN_QUERY_PARAM: &str = "token";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CredentialSource {
    Env(String),
    File(PathBuf),
    Inline,
    Missing,
}

/// The secret a client has to present.
#[derive(Clone)]
pub struct Credentials {
    token: Option<String>,
    source: CredentialSource,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_deref().map(mask_secret))
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    NotConfigured,
    MissingToken,
    InvalidToken,
}

impl AuthRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthRejection::NotConfigured => "no bridge token configured",
            AuthRejection::MissingToken => "missing token",
            AuthRejection::InvalidToken => "invalid token",
        }
    }
}

impl Credentials {
    /// Loads the secret from `env_var`, falling back to `secret_file`.
    pub fn load(env_var: &str, secret_file: Option<&Path>) -> Self {
        if let Some(token) = std::env::var(env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            return Self {
                token: Some(token),
                source: CredentialSource::Env(env_var.to_string()),
            };
        }

        if let Some(path) = secret_file {
            match std::fs::read_to_string(path) {
                Ok(raw) if !raw.trim().is_empty() => {
                    return Self {
                        token: Some(raw.trim().to_string()),
                        source: CredentialSource::File(path.to_path_buf()),
                    };
                }
                Ok(_) => {
                    tracing::warn!(path = %path.display(), "bridge token file is empty");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to read bridge token file");
                }
            }
        }

        Self::none()
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        if token.trim().is_empty() {
            return Self::none();
        }
        Self {
            token: Some(token),
            source: CredentialSource::Inline,
        }
    }

    pub fn none() -> Self {
        Self {
            token: None,
            source: CredentialSource::Missing,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    pub fn describe_source(&self) -> String {
        match &self.source {
            CredentialSource::Env(var) => format!("env:{var}"),
            CredentialSource::File(path) => format!("file:{}", path.display()),
            CredentialSource::Inline => "inline".to_string(),
            CredentialSource::Missing => "none".to_string(),
        }
    }

    /// Checks bearer header, legacy header, then `?token=`; any match wins.
    pub fn authorize(&self, req: &HttpRequest) -> Result<(), AuthRejection> {
        let Some(expected) = self.token.as_deref() else {
            tracing::warn!(
                "rejecting bridge connection: no token configured (set {} or write a token file)",
                DEFAULT_TOKEN_ENV
            );
            return Err(AuthRejection::NotConfigured);
        };

        let presented = presented_tokens(req);
        if presented.is_empty() {
            return Err(AuthRejection::MissingToken);
        }
        if presented
            .iter()
            .any(|candidate| constant_time_eq(candidate, expected))
        {
            Ok(())
        } else {
            Err(AuthRejection::InvalidToken)
        }
    }
}

fn presented_tokens(req: &HttpRequest) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(token) = req.header("authorization").and_then(extract_bearer_token) {
        out.push(token);
    }
    if let Some(token) = req
        .header(LEGACY_TOKEN_HEADER)
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        out.push(token.to_string());
    }
    if let Some(token) = req
        .query_param(TOKEN_QUERY_PARAM)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
    {
        out.push(token);
    }
    out
}

fn extract_bearer_token(header: &str) -> Option<String> {
    let mut parts = header.split_whitespace();
    let scheme = parts.next()?;
    let token = parts.next()?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.to_string())
}

/// Compares without short-circuiting; runtime depends only on the longer input.
pub fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());

    let mut diff = left_bytes.len() ^ right_bytes.len();
    for index in 0..max_len {
        let left_byte = *left_bytes.get(index).unwrap_or(&0);
        let right_byte = *right_bytes.get(index).unwrap_or(&0);
        diff |= (left_byte ^ right_byte) as usize;
    }

    diff == 0
}

/// Keeps the first and last four characters visible.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(chars.len() - 8))
}

/// Request line and headers for diagnostics, with every secret masked.
pub fn redact_request(req: &HttpRequest) -> String {
    let target = match req.query.as_deref() {
        Some(query) => {
            let mut ser = form_urlencoded::Serializer::new(String::new());
            for (k, v) in form_urlencoded::parse(query.as_bytes()) {
                if k == TOKEN_QUERY_PARAM {
                    ser.append_pair(&k, &mask_secret(&v));
                } else {
                    ser.append_pair(&k, &v);
                }
            }
            format!("{}?{}", req.path, ser.finish())
        }
        None => req.target.clone(),
    };

    let mut out = format!("{} {} {}", req.method, target, req.version_str());
    for (name, value) in req.headers() {
        let shown = match name {
            "authorization" => match value.split_once(' ') {
                Some((scheme, secret)) => format!("{scheme} {}", mask_secret(secret.trim())),
                None => mask_secret(value),
            },
            LEGACY_TOKEN_HEADER => mask_secret(value),
            _ => value.to_string(),
        };
        out.push_str(&format!("\n{name}: {shown}"));
    }
    out
}

pub fn generate_token() -> String {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    let mut rng = rand::rngs::OsRng;
    rng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Returns the token stored at `path`, generating and persisting one if absent.
pub fn ensure_token_file(path: &Path) -> Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create token dir {}", dir.display()))?;
    }
    let token = generate_token();
    std::fs::write(path, &token).with_context(|| format!("write token {}", path.display()))?;
    Ok(token)
}
