//! Remote module cache.
//!
//! [`ModuleCache`] turns `(uri, checksum, options)` into a local file path.
//! Concurrent requests for one key share a single fetch, downloads are
//! verified before they become visible, and a background sweep deletes
//! modules that expired and are no longer the latest version of any active
//! resource.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use meshmod_cache::{EvictionTask, Stats, StatsCounters};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::ModuleCacheConfig;
use crate::digest::sha256_hex;
use crate::error::{WasmError, WasmResult};
use crate::fetch::unbox::unbox_module;
use crate::fetch::{HttpFetcher, ModuleFetcher};
use crate::inspect::{inspect_runtime_hint, RuntimeHint};
use crate::key::{CacheKey, FetchOptions, PullPolicy};
use crate::store::DiskStore;

mod index;

use index::{deadline, Index};
pub use index::{AllReferencesActive, ReferenceSet, ResourceRef, StoredArtifact};

/// A module available on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModule {
    pub path: PathBuf,

    /// Digest of the content as fetched.
    pub checksum: String,

    /// Runtime requirement found in the module's custom sections.
    pub runtime_hint: Option<RuntimeHint>,
}

impl ResolvedModule {
    fn from_artifact(artifact: &StoredArtifact) -> Self {
        Self {
            path: artifact.path.clone(),
            checksum: artifact.checksum.clone(),
            runtime_hint: artifact.runtime_hint.clone(),
        }
    }
}

/// Resolves module references to local files.
#[async_trait]
pub trait ModuleResolver: Send + Sync {
    async fn resolve(
        &self,
        uri: &str,
        checksum: &str,
        options: &FetchOptions,
    ) -> WasmResult<ResolvedModule>;
}

type Flight = Arc<OnceCell<WasmResult<ResolvedModule>>>;

struct Inner {
    config: ModuleCacheConfig,
    store: DiskStore,
    fetcher: Arc<dyn ModuleFetcher>,
    index: tokio::sync::Mutex<Index>,
    inflight: Mutex<HashMap<CacheKey, Flight>>,
    references: RwLock<Arc<dyn ReferenceSet>>,
    stats: StatsCounters,
    sweeper: Mutex<Option<EvictionTask>>,
}

/// Local cache of remote Wasm modules. Cheap to clone.
#[derive(Clone)]
pub struct ModuleCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("dir", &self.inner.store.dir())
            .field("fetcher", &self.inner.fetcher)
            .finish_non_exhaustive()
    }
}

impl ModuleCache {
    /// Open the store and start the eviction sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: ModuleCacheConfig, fetcher: Arc<dyn ModuleFetcher>) -> WasmResult<Self> {
        let store = DiskStore::with_dir(&config.dir);
        let leftovers = store.open().await?;
        info!(
            dir = ?store.dir(),
            removed_temp_files = leftovers,
            expiry_secs = config.module_expiry_secs,
            purge_interval_secs = config.purge_interval_secs,
            "opened wasm module cache"
        );

        let purge_interval = config.purge_interval();
        let inner = Arc::new(Inner {
            config,
            store,
            fetcher,
            index: tokio::sync::Mutex::new(Index::default()),
            inflight: Mutex::new(HashMap::new()),
            references: RwLock::new(Arc::new(AllReferencesActive)),
            stats: StatsCounters::new(),
            sweeper: Mutex::new(None),
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let task = EvictionTask::spawn_async(purge_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => {
                        inner.purge_expired().await;
                        true
                    }
                    None => false,
                }
            }
        });
        *inner.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(Self { inner })
    }

    /// [`ModuleCache::new`] with an [`HttpFetcher`] built from `config`.
    pub async fn from_config(config: ModuleCacheConfig) -> WasmResult<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config)?);
        Self::new(config, fetcher).await
    }

    /// Decide which resource references keep expired modules alive.
    pub fn with_reference_set(self, references: Arc<dyn ReferenceSet>) -> Self {
        *self
            .inner
            .references
            .write()
            .unwrap_or_else(|e| e.into_inner()) = references;
        self
    }

    pub fn config(&self) -> &ModuleCacheConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }

    /// Number of indexed artifacts.
    pub async fn len(&self) -> usize {
        self.inner.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Index record for `(uri, checksum)`.
    pub async fn artifact(&self, uri: &str, checksum: &str) -> WasmResult<Option<StoredArtifact>> {
        let key = CacheKey::new(uri, checksum)?;
        Ok(self.inner.index.lock().await.get(&key).cloned())
    }

    /// Resolve a module reference to a local file. See [`ModuleResolver`].
    pub async fn get(
        &self,
        uri: &str,
        checksum: &str,
        options: &FetchOptions,
    ) -> WasmResult<ResolvedModule> {
        self.inner.resolve(uri, checksum, options).await
    }

    /// Run one eviction sweep now. Returns the number of evicted entries.
    pub async fn purge_expired(&self) -> usize {
        self.inner.purge_expired().await
    }

    /// Drop the entry for `(uri, checksum)` and its file.
    ///
    /// Returns whether an entry existed.
    pub async fn remove(&self, uri: &str, checksum: &str) -> WasmResult<bool> {
        let key = CacheKey::new(uri, checksum)?;
        let mut index = self.inner.index.lock().await;
        let Some(artifact) = index.remove(&key) else {
            return Ok(false);
        };
        self.inner.stats.add_removals(1);
        if !index.path_in_use(&artifact.path) {
            self.inner.store.remove_file(&artifact.path).await?;
        }
        debug!(key = %key, "removed wasm module");
        Ok(true)
    }

    /// Stop the sweeper, forget every entry and delete the store directory.
    pub async fn cleanup(&self) -> WasmResult<()> {
        if let Some(task) = self
            .inner
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.stop();
        }

        let mut index = self.inner.index.lock().await;
        let removed = index.len() as u64;
        index.clear();
        self.inner.stats.add_removals(removed);
        self.inner.store.clear().await
    }
}

#[async_trait]
impl ModuleResolver for ModuleCache {
    async fn resolve(
        &self,
        uri: &str,
        checksum: &str,
        options: &FetchOptions,
    ) -> WasmResult<ResolvedModule> {
        self.inner.resolve(uri, checksum, options).await
    }
}

impl Inner {
    async fn resolve(
        &self,
        uri: &str,
        checksum: &str,
        options: &FetchOptions,
    ) -> WasmResult<ResolvedModule> {
        let key = CacheKey::new(uri, checksum)?;
        let policy = options.pull_policy;

        if policy != PullPolicy::Always {
            if let Some(hit) = self.lookup(&key, policy).await {
                self.mark_used(&key, options).await;
                return Ok(hit);
            }
            if policy == PullPolicy::Never {
                self.stats.record_miss();
                return Err(WasmError::NotCached {
                    uri: uri.to_string(),
                });
            }
        }

        let flight = self.join_flight(&key);
        let result = flight
            .get_or_init(|| self.run_flight(&key, &flight, options))
            .await
            .clone();

        if result.is_ok() {
            self.mark_used(&key, options).await;
        }
        result
    }

    fn join_flight(&self, key: &CacheKey) -> Flight {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Fetch for the callers sharing `flight`.
    ///
    /// The flight leaves the in-flight map before its cell is set, so a
    /// caller arriving after the fetch settled starts a new attempt instead
    /// of reading the old outcome.
    async fn run_flight(
        &self,
        key: &CacheKey,
        flight: &Flight,
        options: &FetchOptions,
    ) -> WasmResult<ResolvedModule> {
        let result = self.fetch_and_store(key, options).await;
        self.finish_flight(key, flight);
        result
    }

    /// Forget a flight so later calls start a new attempt.
    fn finish_flight(&self, key: &CacheKey, flight: &Flight) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, flight))
        {
            inflight.remove(key);
        }
    }

    /// Cached artifact for `key`, verified against its recorded digest.
    ///
    /// Expired artifacts only count for [`PullPolicy::Never`].
    async fn lookup(&self, key: &CacheKey, policy: PullPolicy) -> Option<ResolvedModule> {
        let candidate = {
            let index = self.index.lock().await;
            let artifact = index.get(key)?;
            if policy != PullPolicy::Never && artifact.is_expired(Utc::now()) {
                debug!(key = %key, "cached wasm module expired");
                return None;
            }
            artifact.clone()
        };

        match self.store.digest_file(&candidate.path).await {
            Ok(digest) if digest == candidate.file_digest => {
                self.stats.record_hit();
                debug!(key = %key, path = ?candidate.path, "wasm module cache hit");
                Some(ResolvedModule::from_artifact(&candidate))
            }
            outcome => {
                match outcome {
                    Ok(digest) => warn!(
                        key = %key,
                        expected = %candidate.file_digest,
                        actual = %digest,
                        "cached wasm module changed on disk, dropping entry"
                    ),
                    Err(e) => warn!(key = %key, error = %e, "cached wasm module unreadable, dropping entry"),
                }
                self.index
                    .lock()
                    .await
                    .remove_if_fetched_at(key, candidate.fetched_at);
                None
            }
        }
    }

    async fn mark_used(&self, key: &CacheKey, options: &FetchOptions) {
        let resource = (!options.resource_name.is_empty()).then(|| ResourceRef {
            name: options.resource_name.clone(),
            version: options.resource_version.clone(),
        });
        self.index
            .lock()
            .await
            .mark_used(key, resource, Utc::now(), self.config.module_expiry());
    }

    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        options: &FetchOptions,
    ) -> WasmResult<ResolvedModule> {
        // Another flight may have finished between the fast path and joining.
        if options.pull_policy != PullPolicy::Always {
            if let Some(hit) = self.lookup(key, options.pull_policy).await {
                return Ok(hit);
            }
        }
        self.stats.record_miss();

        let uri = key.uri();
        let timeout = options
            .request_timeout
            .unwrap_or_else(|| self.config.default_timeout());
        let started = Instant::now();
        info!(uri, policy = %options.pull_policy, timeout_ms = timeout.as_millis(), "fetching wasm module");

        let fetched = tokio::time::timeout(
            timeout,
            self.fetcher.fetch(uri, options.pull_secret.as_deref()),
        )
        .await
        .map_err(|_| WasmError::Timeout {
            uri: uri.to_string(),
            timeout,
        })??;

        let actual = sha256_hex(&fetched);
        if key.is_pinned() && actual != key.checksum() {
            warn!(uri, expected = key.checksum(), actual = %actual, "wasm module checksum mismatch");
            return Err(WasmError::ChecksumMismatch {
                uri: uri.to_string(),
                expected: key.checksum().to_string(),
                actual,
            });
        }

        let module = unbox_module(uri, fetched)?;
        let file_digest = sha256_hex(&module);
        let runtime_hint = inspect_runtime_hint(&module);
        let staged = self.store.stage(&key.file_name(), &module).await?;

        let now = Utc::now();
        let artifact = StoredArtifact {
            path: staged.target().to_path_buf(),
            checksum: actual,
            file_digest,
            size: module.len() as u64,
            runtime_hint,
            fetched_at: now,
            last_access: now,
            expires_at: deadline(now, self.config.module_expiry()),
            references: Default::default(),
        };

        // Rename under the index lock so a sweep never deletes a file that is
        // about to be indexed.
        {
            let mut index = self.index.lock().await;
            staged.persist().await?;
            index.insert(key.clone(), artifact.clone());
        }
        self.stats.record_write();

        info!(
            uri,
            checksum = %artifact.checksum,
            path = ?artifact.path,
            size = artifact.size,
            elapsed_ms = started.elapsed().as_millis(),
            "stored wasm module"
        );
        Ok(ResolvedModule::from_artifact(&artifact))
    }

    async fn purge_expired(&self) -> usize {
        let references = self
            .references
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut index = self.index.lock().await;
        let evictable = index.evictable(Utc::now(), references.as_ref());
        let mut evicted = Vec::with_capacity(evictable.len());
        for key in &evictable {
            if let Some(artifact) = index.remove(key) {
                evicted.push((key, artifact));
            }
        }

        for (key, artifact) in &evicted {
            if index.path_in_use(&artifact.path) {
                continue;
            }
            match self.store.remove_file(&artifact.path).await {
                Ok(()) => debug!(key = %key, path = ?artifact.path, "evicted wasm module"),
                Err(e) => warn!(key = %key, error = %e, "failed to delete evicted wasm module"),
            }
        }
        drop(index);

        if !evicted.is_empty() {
            self.stats.add_evictions(evicted.len() as u64);
            debug!(count = evicted.len(), "purged expired wasm modules");
        }
        evicted.len()
    }
}
