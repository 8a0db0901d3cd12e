//! Extension config conversion.
//!
//! Rewrites wasm filters that load their module from a remote URI so they
//! load a local file instead. Each resource in a batch is converted on its
//! own task; failures are collected per resource and never stop siblings.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::ModuleResolver;
use crate::config::ConverterConfig;
use crate::error::{ConversionErrors, Outcome, ResourceFailure, WasmError, WasmResult};
use crate::key::{FetchOptions, PullPolicy};

mod classify;
mod metrics;
pub mod resource;
mod secrets;

pub use classify::{classify, Classification, RemoteModule};
pub use metrics::{ConversionMetrics, ConversionMetricsSnapshot};
pub use secrets::{inject_pull_secrets, SecretSource};

use resource::{Any, AsyncDataSource, TYPED_EXTENSION_CONFIG_TYPE, WASM_HTTP_FILTER_TYPE};

/// Fetch timeout when the remote source does not set one.
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Converts batches of extension config resources.
#[derive(Clone)]
pub struct ExtensionConfigConverter {
    resolver: Arc<dyn ModuleResolver>,
    config: Arc<ConverterConfig>,
    metrics: Arc<ConversionMetrics>,
}

impl std::fmt::Debug for ExtensionConfigConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionConfigConverter")
            .field("config", &self.config)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl ExtensionConfigConverter {
    pub fn new(resolver: Arc<dyn ModuleResolver>) -> Self {
        Self {
            resolver,
            config: Arc::new(ConverterConfig::default()),
            metrics: Arc::new(ConversionMetrics::new()),
        }
    }

    pub fn with_config(mut self, config: ConverterConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Share a metrics sink with other converters.
    pub fn with_metrics(mut self, metrics: Arc<ConversionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &ConversionMetrics {
        &self.metrics
    }

    /// Rewrite every remote wasm module reference in `resources` in place.
    ///
    /// Resources that need no rewrite are left untouched. On failure the
    /// successfully converted resources are still rewritten and the error
    /// lists every resource that could not be.
    pub async fn convert(&self, resources: &mut [Any]) -> Result<(), ConversionErrors> {
        let started = Instant::now();
        let mut tasks = JoinSet::new();

        for (index, resource) in resources.iter().enumerate() {
            let resource = resource.clone();
            let resolver = self.resolver.clone();
            let config = self.config.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let outcome = convert_resource(&resource, resolver.as_ref(), &config).await;
                match &outcome {
                    Ok(Converted::Rewritten(_)) => metrics.record(Outcome::Success),
                    Ok(Converted::Unchanged) => metrics.record(Outcome::NoRemoteLoad),
                    Err((_, error)) => metrics.record(error.outcome()),
                }
                (index, outcome)
            });
        }

        let mut pending: BTreeSet<usize> = (0..resources.len()).collect();
        let mut errors = ConversionErrors::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(joined) => joined,
                Err(e) => {
                    warn!(error = %e, "extension config conversion task failed");
                    continue;
                }
            };
            pending.remove(&index);
            match outcome {
                Ok(Converted::Rewritten(rewritten)) => resources[index] = rewritten,
                Ok(Converted::Unchanged) => {}
                Err((resource, error)) => errors.push(ResourceFailure {
                    index,
                    resource,
                    error,
                }),
            }
        }

        for index in pending {
            errors.push(ResourceFailure {
                index,
                resource: None,
                error: WasmError::Internal {
                    message: "conversion task did not complete".to_string(),
                },
            });
        }

        self.metrics.record_batch(started.elapsed());
        let result = errors.into_result();
        if let Err(errors) = &result {
            warn!(total = resources.len(), failed = errors.len(), "{}", errors);
        }
        result
    }
}

enum Converted {
    Rewritten(Any),
    Unchanged,
}

async fn convert_resource(
    resource: &Any,
    resolver: &dyn ModuleResolver,
    config: &ConverterConfig,
) -> Result<Converted, (Option<String>, WasmError)> {
    let remote = match classify(resource) {
        Ok(Classification::Remote(remote)) => remote,
        Ok(Classification::NotApplicable) | Ok(Classification::Local) => {
            return Ok(Converted::Unchanged)
        }
        Ok(Classification::NoConfig { name }) => {
            let error = WasmError::MalformedInput {
                message: format!("extension config {} has no typed config", name),
            };
            return Err((Some(name), error));
        }
        Err(error) => {
            let name = match &error {
                WasmError::NoFetchSourceSpecified { resource } => Some(resource.clone()),
                _ => None,
            };
            return Err((name, error));
        }
    };

    let name = remote.extension.name.clone();
    let started = Instant::now();
    match localize(remote, resolver, config).await {
        Ok(rewritten) => {
            debug!(resource = %name, elapsed_ms = started.elapsed().as_millis(), "rewrote wasm module to local file");
            Ok(Converted::Rewritten(rewritten))
        }
        Err(error) => Err((Some(name), error)),
    }
}

/// Resolve the remote module of `remote` and point its VM at the local file.
async fn localize(
    remote: RemoteModule,
    resolver: &dyn ModuleResolver,
    config: &ConverterConfig,
) -> WasmResult<Any> {
    let RemoteModule {
        mut extension,
        mut wasm,
    } = remote;
    let resource = extension.name.clone();
    let vm = wasm
        .vm_config_mut()
        .ok_or_else(|| WasmError::NoFetchSourceSpecified {
            resource: resource.clone(),
        })?;

    let mut options = FetchOptions::new();
    let mut resource_version = String::new();
    let mut drop_environment = false;
    if let Some(envs) = vm.environment_variables.as_mut() {
        if let Some(secret) = envs.key_values.get(&config.secret_env) {
            if secret.is_empty() {
                return Err(WasmError::MissingCredential { resource });
            }
            options = options.with_pull_secret(secret.as_bytes());
        }
        if let Some(policy) = envs.key_values.get(&config.policy_env) {
            options = options.with_policy(PullPolicy::from_env_value(policy));
        }
        if let Some(version) = envs.key_values.get(&config.resource_version_env) {
            resource_version = version.clone();
        }

        // Agent-only keys must not reach the proxy or the module.
        envs.key_values
            .retain(|key, _| !key.starts_with(config.internal_prefix.as_str()));
        drop_environment = envs.key_values.is_empty() && envs.host_env_keys.is_empty();
    }
    if drop_environment {
        vm.environment_variables = None;
    }

    let source = vm
        .code
        .as_ref()
        .and_then(|code| code.remote.as_ref())
        .ok_or_else(|| WasmError::NoFetchSourceSpecified {
            resource: resource.clone(),
        })?;
    let http_uri = source
        .http_uri
        .as_ref()
        .ok_or_else(|| WasmError::MissingFetchHint {
            resource: resource.clone(),
        })?;

    let options = options
        .with_resource(resource.as_str(), resource_version)
        .with_timeout(http_uri.timeout.unwrap_or(DEFAULT_REMOTE_TIMEOUT));
    let resolved = resolver
        .resolve(&http_uri.uri, &source.sha256, &options)
        .await?;

    if let Some(hint) = resolved.runtime_hint {
        debug!(resource = %resource, runtime = %hint.runtime, "module requires a specific runtime");
        vm.runtime = hint.runtime;
        vm.allow_precompiled = hint.allow_precompiled;
    }
    vm.code = Some(AsyncDataSource::local_file(
        resolved.path.to_string_lossy().into_owned(),
    ));

    extension.typed_config = Some(Any::pack(WASM_HTTP_FILTER_TYPE, &wasm)?);
    Any::pack(TYPED_EXTENSION_CONFIG_TYPE, &extension)
}
