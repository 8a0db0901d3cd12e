//! Remote Wasm module cache for proxy extension configs.
//!
//! This crate localizes Wasm extension modules referenced by URI so a proxy
//! can load them from disk:
//!
//! - [`ModuleCache`] fetches each module at most once concurrently per
//!   `(uri, checksum)` key, verifies it, stores it content-addressed and
//!   evicts stale entries in the background.
//! - [`ExtensionConfigConverter`] rewrites batches of extension config
//!   resources from remote to local module sources, collecting per-resource
//!   failures into [`ConversionErrors`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use meshmod_wasm::{ExtensionConfigConverter, ModuleCache, ModuleCacheConfig};
//!
//! # async fn example(mut resources: Vec<meshmod_wasm::convert::resource::Any>) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ModuleCache::from_config(ModuleCacheConfig::from_env()).await?;
//! let converter = ExtensionConfigConverter::new(Arc::new(cache));
//!
//! if let Err(errors) = converter.convert(&mut resources).await {
//!     for failure in errors.failures() {
//!         eprintln!("resource {} not converted: {}", failure.index, failure.error);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod convert;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod inspect;
pub mod key;
pub mod store;

pub use auth::PullCredential;
pub use cache::{
    AllReferencesActive, ModuleCache, ModuleResolver, ReferenceSet, ResolvedModule, ResourceRef,
    StoredArtifact,
};
pub use config::{ConverterConfig, ModuleCacheConfig};
pub use convert::{
    inject_pull_secrets, ConversionMetrics, ConversionMetricsSnapshot, ExtensionConfigConverter,
    SecretSource,
};
pub use error::{ConversionErrors, Outcome, ResourceFailure, WasmError, WasmResult};
pub use fetch::{HttpFetcher, ModuleFetcher};
pub use inspect::{inspect_runtime_hint, RuntimeHint};
pub use key::{normalize_checksum, CacheKey, FetchOptions, PullPolicy, NIL_CHECKSUM};
pub use store::DiskStore;
