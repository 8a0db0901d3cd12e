//! Module cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Module cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleCacheConfig {
    /// Directory holding the content-addressed module files.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Seconds an artifact stays fresh after its last access.
    #[serde(default = "default_module_expiry")]
    pub module_expiry_secs: u64,

    /// Seconds between eviction sweeps.
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,

    /// Fetch timeout in milliseconds when the request carries none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Maximum retries for transient HTTP failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Accept invalid TLS certificates.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_dir() -> PathBuf {
    dirs::cache_dir()
        .or_else(dirs::home_dir)
        .map(|base| base.join("meshmod").join("wasm"))
        .unwrap_or_else(|| PathBuf::from("/tmp/meshmod/wasm"))
}

fn default_module_expiry() -> u64 {
    24 * 60 * 60
}

fn default_purge_interval() -> u64 {
    60 * 60
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ModuleCacheConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            module_expiry_secs: default_module_expiry(),
            purge_interval_secs: default_purge_interval(),
            default_timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            insecure_skip_verify: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl ModuleCacheConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `MESHMOD_WASM_CACHE_DIR` | Store directory |
    /// | `MESHMOD_WASM_MODULE_EXPIRY` | Artifact TTL in seconds |
    /// | `MESHMOD_WASM_PURGE_INTERVAL` | Sweep interval in seconds |
    /// | `MESHMOD_WASM_FETCH_TIMEOUT_MS` | Default fetch timeout |
    /// | `MESHMOD_WASM_MAX_RETRIES` | Retries for transient failures |
    /// | `MESHMOD_WASM_INSECURE` | Skip TLS verification (testing only) |
    pub fn from_env() -> Self {
        Self {
            dir: std::env::var("MESHMOD_WASM_CACHE_DIR")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_dir),
            module_expiry_secs: env_parse("MESHMOD_WASM_MODULE_EXPIRY")
                .unwrap_or_else(default_module_expiry),
            purge_interval_secs: env_parse("MESHMOD_WASM_PURGE_INTERVAL")
                .unwrap_or_else(default_purge_interval),
            default_timeout_ms: env_parse("MESHMOD_WASM_FETCH_TIMEOUT_MS")
                .unwrap_or_else(default_timeout_ms),
            max_retries: env_parse("MESHMOD_WASM_MAX_RETRIES").unwrap_or_else(default_max_retries),
            insecure_skip_verify: std::env::var("MESHMOD_WASM_INSECURE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    /// Set the store directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = dir.into();
        self
    }

    /// Set the artifact TTL.
    pub fn with_module_expiry(mut self, expiry: Duration) -> Self {
        self.module_expiry_secs = expiry.as_secs();
        self
    }

    /// Set the sweep interval.
    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval_secs = interval.as_secs();
        self
    }

    /// Set the default fetch timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn module_expiry(&self) -> Duration {
        Duration::from_secs(self.module_expiry_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Environment metadata keys read by the conversion adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    /// Key carrying the pull secret content.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    /// Key carrying the pull policy.
    #[serde(default = "default_policy_env")]
    pub policy_env: String,

    /// Key carrying the resource version.
    #[serde(default = "default_resource_version_env")]
    pub resource_version_env: String,

    /// Keys with this prefix are agent-only and stripped before forwarding.
    #[serde(default = "default_internal_prefix")]
    pub internal_prefix: String,
}

fn default_secret_env() -> String {
    "ISTIO_META_WASM_IMAGE_PULL_SECRET".to_string()
}

fn default_policy_env() -> String {
    "ISTIO_META_WASM_IMAGE_PULL_POLICY".to_string()
}

fn default_resource_version_env() -> String {
    "ISTIO_META_WASM_PLUGIN_RESOURCE_VERSION".to_string()
}

fn default_internal_prefix() -> String {
    "ISTIO_META_".to_string()
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
            policy_env: default_policy_env(),
            resource_version_env: default_resource_version_env(),
            internal_prefix: default_internal_prefix(),
        }
    }
}
