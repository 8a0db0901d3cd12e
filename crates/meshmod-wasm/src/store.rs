//! Content-addressed module files on local disk.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   <sha256>.wasm          # pinned module
//!   url-<sha256(uri)>.wasm # unpinned module
//!   .<name>.<random>.tmp   # in-flight write, renamed into place
//! ```

use std::path::{Path, PathBuf};

use rand::Rng;
use tokio::fs;
use tracing::{debug, warn};

use crate::digest::sha256_hex_reader;
use crate::error::{WasmError, WasmResult};

const TMP_EXTENSION: &str = "tmp";

/// Directory of module files.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
}

impl DiskStore {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final location of `file_name`.
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }

    /// Create the directory and delete temp files left by interrupted writes.
    ///
    /// Returns the number of leftovers removed. Complete module files are
    /// kept; they are re-indexed on their next fetch.
    pub async fn open(&self) -> WasmResult<usize> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            WasmError::store(format!(
                "failed to create store directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;

        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            WasmError::store(format!("failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TMP_EXTENSION) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = ?path, "removed leftover temp file");
                    removed += 1;
                }
                Err(e) => warn!(path = ?path, error = %e, "failed to remove leftover temp file"),
            }
        }

        Ok(removed)
    }

    /// Write `content` to a uniquely named temp file next to `file_name`.
    ///
    /// Nothing is visible under the final name until
    /// [`StagedFile::persist`]; concurrent writers of the same name never
    /// observe each other's partial output.
    pub async fn stage(&self, file_name: &str, content: &[u8]) -> WasmResult<StagedFile> {
        let suffix: u64 = rand::thread_rng().gen();
        let staged = StagedFile {
            temp: Some(
                self.dir
                    .join(format!(".{}.{:016x}.{}", file_name, suffix, TMP_EXTENSION)),
            ),
            target: self.path_for(file_name),
        };

        if let Some(temp) = &staged.temp {
            fs::write(temp, content)
                .await
                .map_err(|e| WasmError::store(format!("failed to write temp file: {}", e)))?;
        }
        Ok(staged)
    }

    /// Stage and persist in one step.
    pub async fn write_atomic(&self, file_name: &str, content: &[u8]) -> WasmResult<PathBuf> {
        self.stage(file_name, content).await?.persist().await
    }

    /// Delete one file. A missing file is not an error.
    pub async fn remove_file(&self, path: &Path) -> WasmResult<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WasmError::store(format!(
                "failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Hex sha256 of a stored file.
    pub async fn digest_file(&self, path: &Path) -> WasmResult<String> {
        let path_buf = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path_buf)?;
            sha256_hex_reader(std::io::BufReader::new(file))
        })
        .await
        .map_err(|e| WasmError::store(format!("digest task failed: {}", e)))?
        .map_err(|e| WasmError::store(format!("failed to read {}: {}", path.display(), e)))
    }

    /// Delete the directory and everything in it.
    pub async fn clear(&self) -> WasmResult<()> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                debug!(dir = ?self.dir, "cleared module store");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WasmError::store(format!("failed to clear store: {}", e))),
        }
    }
}

/// A written temp file awaiting its rename. Dropping it deletes the file.
#[derive(Debug)]
pub struct StagedFile {
    temp: Option<PathBuf>,
    target: PathBuf,
}

impl StagedFile {
    /// Where the file lands on [`StagedFile::persist`].
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Rename into place, replacing any existing file.
    pub async fn persist(mut self) -> WasmResult<PathBuf> {
        let Some(temp) = self.temp.take() else {
            return Err(WasmError::store("staged file already persisted"));
        };

        if let Err(e) = fs::rename(&temp, &self.target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(WasmError::store(format!("failed to rename temp file: {}", e)));
        }

        debug!(path = ?self.target, "stored module");
        Ok(self.target.clone())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Some(temp) = self.temp.take() {
            let _ = std::fs::remove_file(temp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;
    use tempfile::TempDir;

    fn create_test_store() -> (DiskStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskStore::with_dir(temp_dir.path().join("modules"));
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_open_removes_only_temp_files() {
        let (store, _temp_dir) = create_test_store();
        store.open().await.unwrap();
        std::fs::write(store.path_for(".a.wasm.1.tmp"), b"partial").unwrap();
        std::fs::write(store.path_for("keep.wasm"), b"\0asm").unwrap();

        assert_eq!(store.open().await.unwrap(), 1);
        assert!(!store.path_for(".a.wasm.1.tmp").exists());
        assert!(store.path_for("keep.wasm").exists());
    }

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp_file() {
        let (store, _temp_dir) = create_test_store();
        store.open().await.unwrap();

        let path = store.write_atomic("m.wasm", b"\0asm\x01\0\0\0").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\0asm\x01\0\0\0");

        let names: Vec<_> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["m.wasm".to_string()]);
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_existing() {
        let (store, _temp_dir) = create_test_store();
        store.open().await.unwrap();

        store.write_atomic("m.wasm", b"old").await.unwrap();
        let path = store.write_atomic("m.wasm", b"new").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_dropped_stage_is_cleaned_up() {
        let (store, _temp_dir) = create_test_store();
        store.open().await.unwrap();

        let staged = store.stage("m.wasm", b"content").await.unwrap();
        assert!(!staged.target().exists());
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 1);

        drop(staged);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_digest_and_remove() {
        let (store, _temp_dir) = create_test_store();
        store.open().await.unwrap();

        let path = store.write_atomic("m.wasm", b"content").await.unwrap();
        assert_eq!(store.digest_file(&path).await.unwrap(), sha256_hex(b"content"));

        store.remove_file(&path).await.unwrap();
        assert!(!path.exists());
        // Second removal is a no-op.
        store.remove_file(&path).await.unwrap();
        assert!(store.digest_file(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _temp_dir) = create_test_store();
        store.open().await.unwrap();
        store.write_atomic("m.wasm", b"content").await.unwrap();

        store.clear().await.unwrap();
        assert!(!store.dir().exists());
        store.clear().await.unwrap();
    }
}
