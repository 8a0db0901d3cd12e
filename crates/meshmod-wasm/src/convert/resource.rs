//! Extension config resource model.
//!
//! Resources travel as [`Any`] envelopes whose `value` holds the JSON
//! encoding of the message named by `type_url`. Only the fields the adapter
//! reads or rewrites are modelled; everything else is kept in `extra` and
//! written back unchanged.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{WasmError, WasmResult};

pub const TYPED_EXTENSION_CONFIG_TYPE: &str =
    "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig";
pub const WASM_HTTP_FILTER_TYPE: &str =
    "type.googleapis.com/envoy.extensions.filters.http.wasm.v3.Wasm";
pub const UDPA_TYPED_STRUCT_TYPE: &str = "type.googleapis.com/udpa.type.v1.TypedStruct";
pub const XDS_TYPED_STRUCT_TYPE: &str = "type.googleapis.com/xds.type.v3.TypedStruct";

/// Self-describing typed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Any {
    pub type_url: String,

    /// JSON encoding of the message, base64 in its own JSON form.
    #[serde(default, with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl Any {
    /// Encode `message` as `type_url`.
    pub fn pack<T: Serialize>(type_url: &str, message: &T) -> WasmResult<Self> {
        let value = serde_json::to_vec(message).map_err(|e| WasmError::SerializationFailure {
            message: format!("failed to encode {}: {}", type_url, e),
        })?;
        Ok(Self {
            type_url: type_url.to_string(),
            value,
        })
    }

    /// Decode the message. Does not check `type_url`.
    pub fn unpack<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.value)
    }

    pub fn is(&self, type_url: &str) -> bool {
        self.type_url == type_url
    }
}

/// Named extension config wrapping a typed config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypedExtensionConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typed_config: Option<Any>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Untyped struct tagged with the type it stands for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypedStruct {
    #[serde(default)]
    pub type_url: String,

    #[serde(default)]
    pub value: Value,
}

/// Wasm HTTP filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Wasm {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PluginConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Wasm {
    pub fn vm_config(&self) -> Option<&VmConfig> {
        self.config.as_ref()?.vm_config.as_ref()
    }

    pub fn vm_config_mut(&mut self) -> Option<&mut VmConfig> {
        self.config.as_mut()?.vm_config.as_mut()
    }

    pub fn plugin_name(&self) -> &str {
        self.config.as_ref().map_or("", |c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_config: Option<VmConfig>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<AsyncDataSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<EnvironmentVariables>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_precompiled: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentVariables {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_env_keys: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key_values: BTreeMap<String, String>,
}

/// Where module code comes from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AsyncDataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<DataSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteDataSource>,
}

impl AsyncDataSource {
    pub fn local_file(filename: impl Into<String>) -> Self {
        Self {
            local: Some(DataSource {
                filename: Some(filename.into()),
                ..Default::default()
            }),
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteDataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_uri: Option<HttpUri>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sha256: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpUri {
    #[serde(default)]
    pub uri: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,

    #[serde(
        default,
        with = "duration_str",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Durations in their `"5s"` / `"1.5s"` string form.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn format(duration: Duration) -> String {
        let secs = duration.as_secs();
        let nanos = duration.subsec_nanos();
        if nanos == 0 {
            format!("{}s", secs)
        } else if nanos % 1_000_000 == 0 {
            format!("{}.{:03}s", secs, nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}.{:06}s", secs, nanos / 1_000)
        } else {
            format!("{}.{:09}s", secs, nanos)
        }
    }

    pub(crate) fn parse(raw: &str) -> Option<Duration> {
        let number = raw.trim().strip_suffix('s')?;
        let (secs, frac) = number.split_once('.').unwrap_or((number, ""));
        if secs.is_empty() || frac.len() > 9 {
            return None;
        }
        let secs: u64 = secs.parse().ok()?;
        let nanos = if frac.is_empty() {
            0
        } else {
            let digits: u32 = frac.parse().ok()?;
            digits * 10_u32.pow(9 - frac.len() as u32)
        };
        Some(Duration::new(secs, nanos))
    }

    pub(crate) fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_str(&format(*duration)),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {:?}", raw))),
            None => Ok(None),
        }
    }
}
