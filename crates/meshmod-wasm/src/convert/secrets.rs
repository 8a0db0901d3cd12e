//! Pull secret lookup and injection.
//!
//! The control plane names a secret in the wasm VM environment; before the
//! config is sent out the name is swapped for the secret's content, which
//! the conversion adapter later extracts and strips.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{WasmError, WasmResult};

use super::resource::{Any, TypedExtensionConfig, Wasm, WASM_HTTP_FILTER_TYPE};

/// Credential source: secret name to raw bytes.
pub trait SecretSource: Send + Sync {
    fn secret(&self, name: &str) -> Option<Vec<u8>>;
}

impl SecretSource for HashMap<String, Vec<u8>> {
    fn secret(&self, name: &str) -> Option<Vec<u8>> {
        self.get(name).cloned()
    }
}

/// Replace secret references with secret content in the named wasm configs.
///
/// Configs not named in `resource_names`, or not carrying a wasm filter, are
/// left alone. An unknown secret becomes `""` so the adapter reports a
/// missing credential instead of fetching anonymously.
pub fn inject_pull_secrets(
    configs: &mut [TypedExtensionConfig],
    resource_names: &[&str],
    secret_env: &str,
    secrets: &dyn SecretSource,
) -> WasmResult<usize> {
    let wanted: HashSet<&str> = resource_names.iter().copied().collect();
    let mut injected = 0;

    for config in configs.iter_mut() {
        if !wanted.contains(config.name.as_str()) {
            continue;
        }
        let Some(typed_config) = config.typed_config.as_mut() else {
            continue;
        };
        if !typed_config.is(WASM_HTTP_FILTER_TYPE) {
            continue;
        }

        let mut wasm: Wasm = typed_config.unpack().map_err(|e| WasmError::MalformedInput {
            message: format!("failed to decode wasm filter in {}: {}", config.name, e),
        })?;
        let Some(envs) = wasm
            .vm_config_mut()
            .and_then(|vm| vm.environment_variables.as_mut())
        else {
            continue;
        };
        let Some(secret_name) = envs.key_values.get(secret_env).filter(|n| !n.is_empty()) else {
            continue;
        };

        let content = match secrets.secret(secret_name) {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                debug!(resource = %config.name, secret = %secret_name, "pull secret not found");
                String::new()
            }
        };
        envs.key_values.insert(secret_env.to_string(), content);

        *typed_config = Any::pack(WASM_HTTP_FILTER_TYPE, &wasm)?;
        injected += 1;
    }

    Ok(injected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::resource::{EnvironmentVariables, PluginConfig, VmConfig};

    const SECRET_ENV: &str = "ISTIO_META_WASM_IMAGE_PULL_SECRET";

    fn config(name: &str, secret_ref: &str) -> TypedExtensionConfig {
        let mut key_values = std::collections::BTreeMap::new();
        key_values.insert(SECRET_ENV.to_string(), secret_ref.to_string());
        let wasm = Wasm {
            config: Some(PluginConfig {
                vm_config: Some(VmConfig {
                    environment_variables: Some(EnvironmentVariables {
                        key_values,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        TypedExtensionConfig {
            name: name.to_string(),
            typed_config: Some(Any::pack(WASM_HTTP_FILTER_TYPE, &wasm).unwrap()),
            ..Default::default()
        }
    }

    fn secret_value(config: &TypedExtensionConfig) -> String {
        let wasm: Wasm = config.typed_config.as_ref().unwrap().unpack().unwrap();
        wasm.vm_config().unwrap().environment_variables.as_ref().unwrap().key_values[SECRET_ENV]
            .clone()
    }

    #[test]
    fn test_injects_only_named_configs() {
        let mut secrets = HashMap::new();
        secrets.insert("registry-cred".to_string(), b"token".to_vec());

        let mut configs = vec![
            config("ns.a", "registry-cred"),
            config("ns.b", "registry-cred"),
            config("ns.c", "unknown-cred"),
        ];
        let injected =
            inject_pull_secrets(&mut configs, &["ns.a", "ns.c"], SECRET_ENV, &secrets).unwrap();

        assert_eq!(injected, 2);
        assert_eq!(secret_value(&configs[0]), "token");
        assert_eq!(secret_value(&configs[1]), "registry-cred");
        assert_eq!(secret_value(&configs[2]), "");
    }

    #[test]
    fn test_empty_reference_is_left_alone() {
        let secrets: HashMap<String, Vec<u8>> = HashMap::new();
        let mut configs = vec![config("ns.a", "")];
        let injected = inject_pull_secrets(&mut configs, &["ns.a"], SECRET_ENV, &secrets).unwrap();
        assert_eq!(injected, 0);
        assert_eq!(secret_value(&configs[0]), "");
    }
}
