//! Custom-section inspection of Wasm binaries.
//!
//! Modules precompiled ahead-of-time for WAMR carry a `wamr-aot` (or
//! versioned `wamr-aot-<version>`) custom section. Such modules need the WAMR
//! runtime with precompiled code allowed. Inspection never executes the
//! module and never fails resolution: any parse error means no hint.

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wasmparser::{Parser, Payload};

/// Runtime that can load WAMR AOT modules.
pub const WAMR_RUNTIME: &str = "envoy.wasm.runtime.wamr";

const WAMR_AOT_SECTION: &str = "wamr-aot";
const WAMR_AOT_PREFIX: &str = "wamr-aot-";

/// AOT sections produced by this version and later are not loadable.
const WAMR_AOT_MAX_VERSION: Version = Version::new(2, 1, 0);

/// Execution runtime requirement discovered in a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHint {
    /// Runtime to select in the VM config.
    pub runtime: String,

    /// Whether precompiled code must be allowed.
    pub allow_precompiled: bool,
}

impl RuntimeHint {
    pub fn wamr_aot() -> Self {
        Self {
            runtime: WAMR_RUNTIME.to_string(),
            allow_precompiled: true,
        }
    }
}

/// Parse `1`, `1.2`, `v1.2.3` and full semver strings.
fn parse_version_lenient(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let mut parts = raw.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    if parts.next().is_some() {
        return None;
    }
    Some(Version::new(major, minor, patch))
}

/// Scan the custom sections of `bytes` for a runtime requirement.
///
/// The first `wamr-aot` section decides: the bare name always yields the
/// hint, a versioned one only below 2.1.0.
pub fn inspect_runtime_hint(bytes: &[u8]) -> Option<RuntimeHint> {
    for payload in Parser::new(0).parse_all(bytes) {
        let payload = match payload {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "failed to parse wasm module, no runtime hint");
                return None;
            }
        };

        let Payload::CustomSection(section) = payload else {
            continue;
        };
        let name = section.name();

        if name == WAMR_AOT_SECTION {
            return Some(RuntimeHint::wamr_aot());
        }
        if let Some(raw_version) = name.strip_prefix(WAMR_AOT_PREFIX) {
            return match parse_version_lenient(raw_version) {
                Some(version) if version < WAMR_AOT_MAX_VERSION => Some(RuntimeHint::wamr_aot()),
                Some(version) => {
                    debug!(%version, "wamr aot section version not supported");
                    None
                }
                None => {
                    debug!(section = name, "failed to parse wamr aot section version");
                    None
                }
            };
        }
    }
    None
}
