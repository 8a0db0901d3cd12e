//! Pull credentials for module fetches.
//!
//! A pull secret is opaque bytes handed over by the control plane. Two forms
//! are understood:
//!
//! - a Docker config JSON (`{"auths": {"<host>": {"auth": "<base64 user:pass>"}}}`,
//!   or the legacy form without the `auths` wrapper), resolved against the
//!   host of the module URI into HTTP Basic credentials;
//! - any other UTF-8 payload, sent as a bearer token.

use std::collections::HashMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use tracing::debug;

/// Credential attached to a module fetch.
#[derive(Clone, PartialEq, Eq)]
pub enum PullCredential {
    Basic { username: String, password: String },
    Bearer(String),
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: Option<HashMap<String, DockerAuth>>,
    #[serde(flatten)]
    legacy: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerAuth {
    fn into_credential(self) -> Option<PullCredential> {
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Some(PullCredential::Basic { username, password });
        }
        let decoded = BASE64.decode(self.auth?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(PullCredential::Basic {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Reduce a registry key such as `https://host:5000/v1/` to `host:5000`.
fn registry_host(key: &str) -> &str {
    let without_scheme = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    without_scheme.split('/').next().unwrap_or(without_scheme)
}

impl PullCredential {
    /// Resolve a pull secret for `host` (`host` or `host:port`).
    ///
    /// Returns `None` for an empty secret or a Docker config without an
    /// entry for the host.
    pub fn from_secret(secret: &[u8], host: &str) -> Option<Self> {
        let text = std::str::from_utf8(secret).ok()?.trim();
        if text.is_empty() {
            return None;
        }

        if text.starts_with('{') {
            if let Ok(config) = serde_json::from_str::<DockerConfig>(text) {
                return Self::from_docker_config(config, host);
            }
        }

        Some(Self::Bearer(text.to_string()))
    }

    fn from_docker_config(config: DockerConfig, host: &str) -> Option<Self> {
        let entries: HashMap<String, DockerAuth> = match config.auths {
            Some(auths) => auths,
            None => config
                .legacy
                .into_iter()
                .filter_map(|(k, v)| serde_json::from_value(v).ok().map(|auth| (k, auth)))
                .collect(),
        };

        let bare_host = host.split(':').next().unwrap_or(host);
        let found = entries.into_iter().find(|(key, _)| {
            let candidate = registry_host(key);
            candidate == host || candidate == bare_host
        });

        match found {
            Some((key, auth)) => {
                debug!(registry = %key, "using docker config credential");
                auth.into_credential()
            }
            None => {
                debug!(host, "no docker config entry for host");
                None
            }
        }
    }

    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> String {
        match self {
            Self::Basic { username, password } => {
                format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
            }
            Self::Bearer(token) => format!("Bearer {}", token),
        }
    }
}

impl fmt::Debug for PullCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(_) => f.debug_tuple("Bearer").field(&"<redacted>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_token_is_bearer() {
        let cred = PullCredential::from_secret(b"  my-token\n", "registry.example.com").unwrap();
        assert_eq!(cred, PullCredential::Bearer("my-token".to_string()));
        assert_eq!(cred.authorization(), "Bearer my-token");
    }

    #[test]
    fn test_empty_secret_is_none() {
        assert!(PullCredential::from_secret(b"", "registry.example.com").is_none());
        assert!(PullCredential::from_secret(b"   ", "registry.example.com").is_none());
    }

    #[test]
    fn test_docker_config_auth_field() {
        let auth = BASE64.encode("alice:s3cret");
        let secret = format!(
            r#"{{"auths": {{"https://registry.example.com/v1/": {{"auth": "{}"}}}}}}"#,
            auth
        );

        let cred = PullCredential::from_secret(secret.as_bytes(), "registry.example.com").unwrap();
        assert_eq!(
            cred,
            PullCredential::Basic {
                username: "alice".to_string(),
                password: "s3cret".to_string(),
            }
        );
        assert_eq!(cred.authorization(), format!("Basic {}", auth));
    }

    #[test]
    fn test_docker_config_username_password_with_port() {
        let secret = r#"{"auths": {"registry.example.com:5000": {"username": "bob", "password": "pw"}}}"#;
        let cred =
            PullCredential::from_secret(secret.as_bytes(), "registry.example.com:5000").unwrap();
        assert!(matches!(cred, PullCredential::Basic { ref username, .. } if username == "bob"));
    }

    #[test]
    fn test_legacy_docker_config() {
        let secret = format!(
            r#"{{"registry.example.com": {{"auth": "{}"}}}}"#,
            BASE64.encode("carol:pw")
        );
        let cred = PullCredential::from_secret(secret.as_bytes(), "registry.example.com").unwrap();
        assert!(matches!(cred, PullCredential::Basic { ref username, .. } if username == "carol"));
    }

    #[test]
    fn test_docker_config_other_host_is_none() {
        let secret = r#"{"auths": {"other.example.com": {"username": "bob", "password": "pw"}}}"#;
        assert!(PullCredential::from_secret(secret.as_bytes(), "registry.example.com").is_none());
    }

    #[test]
    fn test_debug_redacts() {
        let cred = PullCredential::Basic {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
        };
        let debug = format!("{:?}", cred);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("s3cret"));
        assert!(!format!("{:?}", PullCredential::Bearer("tok".into())).contains("tok"));
    }
}
