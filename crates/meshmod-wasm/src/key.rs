//! Cache keys, pull policy and fetch options.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::sha256_hex;
use crate::error::{WasmError, WasmResult};

/// Placeholder the control plane sends when no checksum was configured.
pub const NIL_CHECKSUM: &str = "nil";

const SHA256_HEX_LEN: usize = 64;

/// Normalized identity of a fetch: source URI plus expected checksum.
///
/// An empty checksum means the module is unpinned. The same URI with
/// different checksums yields distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    uri: String,
    checksum: String,
}

impl CacheKey {
    /// Build a key, normalizing the checksum (see [`normalize_checksum`]).
    pub fn new(uri: impl Into<String>, checksum: &str) -> WasmResult<Self> {
        Ok(Self {
            uri: uri.into(),
            checksum: normalize_checksum(checksum)?,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Lowercase hex digest, or `""` when unpinned.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn is_pinned(&self) -> bool {
        !self.checksum.is_empty()
    }

    /// Store filename for this key.
    ///
    /// Pinned keys are named after their checksum; unpinned keys after a hash
    /// of the URI. Both forms are hex only, so no path traversal is possible.
    pub fn file_name(&self) -> String {
        if self.is_pinned() {
            format!("{}.wasm", self.checksum)
        } else {
            format!("url-{}.wasm", sha256_hex(self.uri.as_bytes()))
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_pinned() {
            write!(f, "{}@sha256:{}", self.uri, self.checksum)
        } else {
            f.write_str(&self.uri)
        }
    }
}

/// Normalize a user supplied checksum.
///
/// `""` and the `"nil"` alias mean unset. Otherwise the value must be a
/// sha256 hex digest, optionally prefixed with `sha256:`; the result is
/// lowercase.
pub fn normalize_checksum(checksum: &str) -> WasmResult<String> {
    let trimmed = checksum.trim();
    if trimmed.is_empty() || trimmed == NIL_CHECKSUM {
        return Ok(String::new());
    }

    let hex_part = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
    if hex_part.len() != SHA256_HEX_LEN {
        return Err(WasmError::InvalidChecksum {
            checksum: checksum.to_string(),
            reason: format!("expected {} hex characters", SHA256_HEX_LEN),
        });
    }
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(WasmError::InvalidChecksum {
            checksum: checksum.to_string(),
            reason: "non-hex character".to_string(),
        });
    }

    Ok(hex_part.to_ascii_lowercase())
}

/// Whether a cached artifact may be reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PullPolicy {
    /// Treated as [`PullPolicy::IfNotPresent`].
    #[default]
    Unspecified,
    IfNotPresent,
    Always,
    Never,
}

impl PullPolicy {
    /// Parse the wire form; unknown values fall back to `Unspecified`.
    pub fn from_env_value(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for PullPolicy {
    type Err = WasmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNSPECIFIED_POLICY" | "" => Ok(Self::Unspecified),
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Always" => Ok(Self::Always),
            "Never" => Ok(Self::Never),
            other => Err(WasmError::Config {
                message: format!("unknown pull policy {:?}", other),
            }),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "UNSPECIFIED_POLICY",
            Self::IfNotPresent => "IfNotPresent",
            Self::Always => "Always",
            Self::Never => "Never",
        })
    }
}

/// Per-request controls. Not part of the cache key.
#[derive(Clone, Default)]
pub struct FetchOptions {
    /// Logical resource that references the module.
    pub resource_name: String,

    /// Version of that resource.
    pub resource_version: String,

    /// Bound on the network fetch; the cache default applies when unset.
    pub request_timeout: Option<Duration>,

    /// Opaque pull credential bytes.
    pub pull_secret: Option<Vec<u8>>,

    pub pull_policy: PullPolicy,
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("resource_name", &self.resource_name)
            .field("resource_version", &self.resource_version)
            .field("request_timeout", &self.request_timeout)
            .field(
                "pull_secret",
                &self.pull_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("pull_policy", &self.pull_policy)
            .finish()
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.resource_name = name.into();
        self.resource_version = version.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_pull_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.pull_secret = Some(secret.into());
        self
    }

    pub fn with_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_nil_and_empty_are_unpinned() {
        let a = CacheKey::new("https://example/module.wasm", "nil").unwrap();
        let b = CacheKey::new("https://example/module.wasm", "").unwrap();
        assert_eq!(a, b);
        assert!(!a.is_pinned());
        assert!(a.file_name().starts_with("url-"));
    }

    #[test]
    fn test_checksum_normalized() {
        let upper = DIGEST.to_ascii_uppercase();
        let prefixed = format!("sha256:{}", DIGEST);
        assert_eq!(normalize_checksum(&upper).unwrap(), DIGEST);
        assert_eq!(normalize_checksum(&prefixed).unwrap(), DIGEST);

        let key = CacheKey::new("https://example/module.wasm", &upper).unwrap();
        assert_eq!(key.file_name(), format!("{}.wasm", DIGEST));
    }

    #[test]
    fn test_invalid_checksum_rejected() {
        let non_hex = "z".repeat(64);
        for bad in ["abc", "../../etc/passwd", non_hex.as_str()] {
            let err = normalize_checksum(bad).unwrap_err();
            assert!(matches!(err, WasmError::InvalidChecksum { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_same_uri_different_checksums_are_distinct() {
        let other = "a".repeat(64);
        let a = CacheKey::new("https://example/module.wasm", DIGEST).unwrap();
        let b = CacheKey::new("https://example/module.wasm", &other).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.file_name(), b.file_name());
    }

    #[test]
    fn test_unpinned_file_name_depends_on_uri() {
        let a = CacheKey::new("https://example/a.wasm", "").unwrap();
        let b = CacheKey::new("https://example/b.wasm", "").unwrap();
        assert_ne!(a.file_name(), b.file_name());
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!(PullPolicy::from_env_value("Always"), PullPolicy::Always);
        assert_eq!(
            PullPolicy::from_env_value("IfNotPresent"),
            PullPolicy::IfNotPresent
        );
        assert_eq!(PullPolicy::from_env_value("Never"), PullPolicy::Never);
        assert_eq!(
            PullPolicy::from_env_value("UNSPECIFIED_POLICY"),
            PullPolicy::Unspecified
        );
        assert_eq!(PullPolicy::from_env_value("sometimes"), PullPolicy::Unspecified);
    }

    #[test]
    fn test_fetch_options_debug_redacts_secret() {
        let opts = FetchOptions::new().with_pull_secret("hunter2");
        let debug = format!("{:?}", opts);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }
}
