//! In-memory index of stored artifacts and the resources referencing them.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inspect::RuntimeHint;
use crate::key::CacheKey;

/// A `(resource name, resource version)` pair pointing at an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceRef {
    pub name: String,
    pub version: String,
}

/// Decides which resource references keep an expired artifact alive.
pub trait ReferenceSet: Send + Sync {
    fn is_active(&self, resource_name: &str, resource_version: &str) -> bool;
}

/// Every recorded reference is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllReferencesActive;

impl ReferenceSet for AllReferencesActive {
    fn is_active(&self, _resource_name: &str, _resource_version: &str) -> bool {
        true
    }
}

impl<F> ReferenceSet for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn is_active(&self, resource_name: &str, resource_version: &str) -> bool {
        self(resource_name, resource_version)
    }
}

/// On-disk record of a fetched module.
#[derive(Debug, Clone, Serialize)]
pub struct StoredArtifact {
    /// Location of the module file.
    pub path: PathBuf,

    /// Digest of the content as fetched. Immutable for the entry's lifetime.
    pub checksum: String,

    /// Digest of the stored file, which differs from `checksum` when the
    /// fetched content was a gzip or tar package.
    pub file_digest: String,

    /// Size of the stored file in bytes.
    pub size: u64,

    pub runtime_hint: Option<RuntimeHint>,

    pub fetched_at: DateTime<Utc>,

    pub last_access: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Latest resource versions currently resolved to this artifact.
    pub references: BTreeSet<ResourceRef>,
}

impl StoredArtifact {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    fn touch(&mut self, now: DateTime<Utc>, expiry: Duration) {
        self.last_access = now;
        self.expires_at = deadline(now, expiry);
    }
}

/// `now + expiry`, saturating at the maximum representable time.
pub(crate) fn deadline(now: DateTime<Utc>, expiry: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(expiry)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Default)]
pub(crate) struct Index {
    artifacts: HashMap<CacheKey, StoredArtifact>,
    /// Resource name to the version and key it resolved to most recently.
    latest: HashMap<String, (String, CacheKey)>,
}

impl Index {
    pub(crate) fn get(&self, key: &CacheKey) -> Option<&StoredArtifact> {
        self.artifacts.get(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Insert or replace the artifact for `key`. References of a replaced
    /// artifact carry over.
    pub(crate) fn insert(&mut self, key: CacheKey, mut artifact: StoredArtifact) {
        if let Some(previous) = self.artifacts.remove(&key) {
            artifact.references.extend(previous.references);
        }
        self.artifacts.insert(key, artifact);
    }

    /// Bump the access time of `key` and record the resource that used it.
    ///
    /// A resource name points at one artifact at a time: moving it to a new
    /// version or key drops its previous reference.
    pub(crate) fn mark_used(
        &mut self,
        key: &CacheKey,
        resource: Option<ResourceRef>,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> bool {
        if !self.artifacts.contains_key(key) {
            return false;
        }

        if let Some(resource) = &resource {
            let previous = self.latest.insert(
                resource.name.clone(),
                (resource.version.clone(), key.clone()),
            );
            if let Some((old_version, old_key)) = previous {
                if old_key != *key || old_version != resource.version {
                    if let Some(old) = self.artifacts.get_mut(&old_key) {
                        old.references.remove(&ResourceRef {
                            name: resource.name.clone(),
                            version: old_version,
                        });
                    }
                }
            }
        }

        match self.artifacts.get_mut(key) {
            Some(artifact) => {
                artifact.touch(now, expiry);
                if let Some(resource) = resource {
                    artifact.references.insert(resource);
                }
                true
            }
            None => false,
        }
    }

    /// Remove `key`, forgetting resources that pointed at it.
    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<StoredArtifact> {
        let artifact = self.artifacts.remove(key)?;
        self.latest.retain(|_, (_, latest_key)| latest_key != key);
        Some(artifact)
    }

    /// Remove `key` only if it still holds the artifact fetched at `fetched_at`.
    pub(crate) fn remove_if_fetched_at(
        &mut self,
        key: &CacheKey,
        fetched_at: DateTime<Utc>,
    ) -> Option<StoredArtifact> {
        match self.artifacts.get(key) {
            Some(artifact) if artifact.fetched_at == fetched_at => self.remove(key),
            _ => None,
        }
    }

    /// Whether any entry stores its module at `path`.
    pub(crate) fn path_in_use(&self, path: &Path) -> bool {
        self.artifacts.values().any(|a| a.path == path)
    }

    /// Keys that are expired and not referenced by an active resource.
    pub(crate) fn evictable(&self, now: DateTime<Utc>, active: &dyn ReferenceSet) -> Vec<CacheKey> {
        self.artifacts
            .iter()
            .filter(|(_, artifact)| artifact.is_expired(now))
            .filter(|(_, artifact)| {
                !artifact
                    .references
                    .iter()
                    .any(|r| active.is_active(&r.name, &r.version))
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.artifacts.clear();
        self.latest.clear();
    }
}
