//! Single-step classification of extension config resources.

use tracing::debug;

use crate::error::{WasmError, WasmResult};

use super::resource::{
    Any, TypedExtensionConfig, TypedStruct, Wasm, TYPED_EXTENSION_CONFIG_TYPE,
    UDPA_TYPED_STRUCT_TYPE, WASM_HTTP_FILTER_TYPE, XDS_TYPED_STRUCT_TYPE,
};

/// What a resource holds, as far as module fetching is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Extension config without a typed config.
    NoConfig { name: String },

    /// Not a wasm filter.
    NotApplicable,

    /// Wasm filter loading its module from a local source.
    Local,

    /// Wasm filter loading its module from a remote source.
    Remote(RemoteModule),
}

/// A decoded extension config whose wasm filter needs a remote module.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteModule {
    pub extension: TypedExtensionConfig,
    pub wasm: Wasm,
}

fn malformed(message: String) -> WasmError {
    WasmError::MalformedInput { message }
}

/// Decode `resource` and decide how it is handled.
///
/// A wasm filter with neither a remote nor a local code source is
/// [`WasmError::NoFetchSourceSpecified`]; undecodable input is
/// [`WasmError::MalformedInput`].
pub fn classify(resource: &Any) -> WasmResult<Classification> {
    if !resource.is(TYPED_EXTENSION_CONFIG_TYPE) {
        return Err(malformed(format!(
            "unexpected resource type {:?}",
            resource.type_url
        )));
    }
    let extension: TypedExtensionConfig = resource
        .unpack()
        .map_err(|e| malformed(format!("failed to decode extension config: {}", e)))?;

    let Some(typed_config) = &extension.typed_config else {
        return Ok(Classification::NoConfig {
            name: extension.name,
        });
    };

    let wasm: Wasm = match typed_config.type_url.as_str() {
        WASM_HTTP_FILTER_TYPE => typed_config.unpack().map_err(|e| {
            malformed(format!(
                "failed to decode wasm filter in {}: {}",
                extension.name, e
            ))
        })?,
        UDPA_TYPED_STRUCT_TYPE | XDS_TYPED_STRUCT_TYPE => {
            let typed_struct: TypedStruct = typed_config.unpack().map_err(|e| {
                malformed(format!(
                    "failed to decode typed struct in {}: {}",
                    extension.name, e
                ))
            })?;
            if typed_struct.type_url != WASM_HTTP_FILTER_TYPE {
                debug!(resource = %extension.name, type_url = %typed_struct.type_url, "typed struct is not a wasm filter");
                return Ok(Classification::NotApplicable);
            }
            serde_json::from_value(typed_struct.value).map_err(|e| {
                malformed(format!(
                    "failed to convert typed struct in {} to wasm filter: {}",
                    extension.name, e
                ))
            })?
        }
        other => {
            debug!(resource = %extension.name, type_url = other, "not a wasm filter");
            return Ok(Classification::NotApplicable);
        }
    };

    let code = wasm.vm_config().and_then(|vm| vm.code.as_ref());
    if code.is_some_and(|c| c.remote.is_some()) {
        return Ok(Classification::Remote(RemoteModule { extension, wasm }));
    }
    if code.is_some_and(|c| c.local.is_some()) {
        debug!(resource = %extension.name, "wasm filter loads a local module");
        return Ok(Classification::Local);
    }

    Err(WasmError::NoFetchSourceSpecified {
        resource: extension.name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::resource::{AsyncDataSource, PluginConfig, RemoteDataSource, VmConfig};
    use serde_json::json;

    fn extension(typed_config: Option<Any>) -> Any {
        Any::pack(
            TYPED_EXTENSION_CONFIG_TYPE,
            &TypedExtensionConfig {
                name: "ns.plugin".to_string(),
                typed_config,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn wasm_with_code(code: Option<AsyncDataSource>) -> Wasm {
        Wasm {
            config: Some(PluginConfig {
                name: "plugin".to_string(),
                vm_config: Some(VmConfig {
                    code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn remote_code() -> Option<AsyncDataSource> {
        Some(AsyncDataSource {
            remote: Some(RemoteDataSource::default()),
            local: None,
        })
    }

    #[test]
    fn test_remote_wasm_filter() {
        let wasm = Any::pack(WASM_HTTP_FILTER_TYPE, &wasm_with_code(remote_code())).unwrap();
        let classification = classify(&extension(Some(wasm))).unwrap();
        assert!(matches!(classification, Classification::Remote(ref m) if m.extension.name == "ns.plugin"));
    }

    #[test]
    fn test_typed_struct_wasm_filter() {
        let value = serde_json::to_value(wasm_with_code(remote_code())).unwrap();
        for type_url in [UDPA_TYPED_STRUCT_TYPE, XDS_TYPED_STRUCT_TYPE] {
            let typed_struct = Any::pack(
                type_url,
                &TypedStruct {
                    type_url: WASM_HTTP_FILTER_TYPE.to_string(),
                    value: value.clone(),
                },
            )
            .unwrap();
            let classification = classify(&extension(Some(typed_struct))).unwrap();
            assert!(matches!(classification, Classification::Remote(_)), "{}", type_url);
        }
    }

    #[test]
    fn test_typed_struct_of_other_filter_is_not_applicable() {
        let typed_struct = Any::pack(
            UDPA_TYPED_STRUCT_TYPE,
            &TypedStruct {
                type_url: "type.googleapis.com/envoy.extensions.filters.http.rbac.v3.RBAC".into(),
                value: json!({}),
            },
        )
        .unwrap();
        assert_eq!(
            classify(&extension(Some(typed_struct))).unwrap(),
            Classification::NotApplicable
        );
    }

    #[test]
    fn test_other_filter_is_not_applicable() {
        let rbac = Any {
            type_url: "type.googleapis.com/envoy.extensions.filters.http.rbac.v3.RBAC".into(),
            value: b"{}".to_vec(),
        };
        assert_eq!(
            classify(&extension(Some(rbac))).unwrap(),
            Classification::NotApplicable
        );
    }

    #[test]
    fn test_local_and_missing_sources() {
        let local = Any::pack(
            WASM_HTTP_FILTER_TYPE,
            &wasm_with_code(Some(AsyncDataSource::local_file("/etc/m.wasm"))),
        )
        .unwrap();
        assert_eq!(classify(&extension(Some(local))).unwrap(), Classification::Local);

        let neither = Any::pack(WASM_HTTP_FILTER_TYPE, &wasm_with_code(None)).unwrap();
        let err = classify(&extension(Some(neither))).unwrap_err();
        assert_eq!(
            err,
            WasmError::NoFetchSourceSpecified {
                resource: "ns.plugin".into()
            }
        );
    }

    #[test]
    fn test_no_config_and_malformed() {
        assert_eq!(
            classify(&extension(None)).unwrap(),
            Classification::NoConfig {
                name: "ns.plugin".into()
            }
        );

        let garbage = Any {
            type_url: TYPED_EXTENSION_CONFIG_TYPE.into(),
            value: b"not json".to_vec(),
        };
        assert!(matches!(classify(&garbage), Err(WasmError::MalformedInput { .. })));

        let wrong_type = Any {
            type_url: WASM_HTTP_FILTER_TYPE.into(),
            value: b"{}".to_vec(),
        };
        assert!(matches!(classify(&wrong_type), Err(WasmError::MalformedInput { .. })));

        let bad_wasm = Any {
            type_url: WASM_HTTP_FILTER_TYPE.into(),
            value: br#"{"config": 5}"#.to_vec(),
        };
        assert!(matches!(
            classify(&extension(Some(bad_wasm))),
            Err(WasmError::MalformedInput { .. })
        ));
    }
}
