use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{Blob, BlobStore, VersionToken};
use crate::error::{Result, StoreError};

/// Blobs as plain files under a root directory.
///
/// The version token is the SHA-256 of the file content, so edits made by
/// hand (a spreadsheet, a text editor) invalidate outstanding tokens too.
///
/// Writers serialise on an in-process mutex and on an advisory lock file
/// next to the blob (`.<name>.lock`), held from the version check until the
/// new content is in place. Readers take no lock; the content is swapped in
/// by rename, so they see either the old or the new table.
pub struct FileBlobStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a blob path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(StoreError::backend(format!("invalid blob path '{path}'")));
        }
        Ok(self.root.join(rel))
    }

    fn read(path: &str, file: &Path) -> Result<String> {
        match fs::read_to_string(file) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Take the cross-process write lock for `file`. Released when the
    /// returned handle is dropped.
    fn lock_blob(file: &Path) -> Result<File> {
        let dir = parent_dir(file);
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(format!(".{}.lock", file_name(file)));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file.lock_exclusive()?;
        debug!(lock = %lock_path.display(), "blob write lock held");
        Ok(lock_file)
    }

    /// Write `content` to a uniquely named temp file in the blob's directory.
    fn stage(file: &Path, content: &str) -> Result<NamedTempFile> {
        let mut tmp = NamedTempFile::new_in(parent_dir(file))?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

fn parent_dir(file: &Path) -> &Path {
    file.parent().unwrap_or_else(|| Path::new("."))
}

fn file_name(file: &Path) -> &str {
    file.file_name().and_then(|n| n.to_str()).unwrap_or("blob")
}

fn content_token(content: &str) -> VersionToken {
    let hash = Sha256::digest(content.as_bytes());
    VersionToken::new(hash.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

impl BlobStore for FileBlobStore {
    fn get(&self, path: &str) -> Result<Blob> {
        let file = self.resolve(path)?;
        let content = Self::read(path, &file)?;
        let version = content_token(&content);
        Ok(Blob { content, version })
    }

    fn put(
        &self,
        path: &str,
        content: &str,
        message: &str,
        expected: &VersionToken,
    ) -> Result<VersionToken> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = Self::lock_blob(&file)?;

        let current = Self::read(path, &file)?;
        if content_token(&current) != *expected {
            return Err(StoreError::conflict(path));
        }
        Self::stage(&file, content)?
            .persist(&file)
            .map_err(|e| StoreError::Io(e.error))?;

        let version = content_token(content);
        info!(path, %version, message, "blob committed");
        Ok(version)
    }

    fn create(&self, path: &str, content: &str, message: &str) -> Result<VersionToken> {
        let file = self.resolve(path)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = Self::lock_blob(&file)?;

        match Self::stage(&file, content)?.persist_noclobber(&file) {
            Ok(_) => {}
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::conflict(path));
            }
            Err(e) => return Err(e.error.into()),
        }

        let version = content_token(content);
        info!(path, %version, message, "blob created");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Measurements;
    use crate::store::{RecordStore, retry_on_conflict};
    use chrono::NaiveDate;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_file_create_get_put() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());

        let v1 = store.create("health.csv", "date\n", "init").unwrap();
        let blob = store.get("health.csv").unwrap();
        assert_eq!(blob.content, "date\n");
        assert_eq!(blob.version, v1);

        let v2 = store
            .put("health.csv", "date\n2024-01-01\n", "add", &v1)
            .unwrap();
        assert_ne!(v1, v2);
        assert_eq!(
            fs::read_to_string(dir.path().join("health.csv")).unwrap(),
            "date\n2024-01-01\n"
        );
    }

    #[test]
    fn test_file_token_is_content_hash() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        let v = store.create("a.csv", "same", "init").unwrap();
        assert_eq!(v, content_token("same"));
        assert_eq!(v.as_str().len(), 64);
    }

    #[test]
    fn test_file_external_edit_conflicts() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        let v1 = store.create("health.csv", "date\n", "init").unwrap();

        // Someone edits the file by hand
        fs::write(dir.path().join("health.csv"), "date\n2024-02-02\n").unwrap();

        let err = store.put("health.csv", "date\n", "mine", &v1).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_file_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        assert!(store.get("health.csv").unwrap_err().is_not_found());
        assert!(
            store
                .put("health.csv", "x", "m", &VersionToken::new("abc"))
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_file_create_existing_conflicts() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        store.create("health.csv", "a", "init").unwrap();
        assert!(store.create("health.csv", "b", "again").unwrap_err().is_conflict());
    }

    #[test]
    fn test_file_creates_nested_dirs() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        store.create("2024/health.csv", "a", "init").unwrap();
        assert!(dir.path().join("2024/health.csv").exists());
    }

    #[test]
    fn test_file_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::new(dir.path());
        assert!(matches!(
            store.get("../secret.csv").unwrap_err(),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            store.get("/etc/passwd").unwrap_err(),
            StoreError::Backend(_)
        ));
    }

    fn concurrent_upserts(stores: &[Arc<RecordStore<Arc<FileBlobStore>>>], writers: usize) {
        let barrier = Arc::new(Barrier::new(writers));
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let store = Arc::clone(&stores[i % stores.len()]);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
                        + chrono::Days::new(i as u64);
                    let values = Measurements {
                        steps: Some(1000 + i as u32),
                        ..Measurements::default()
                    };
                    barrier.wait();
                    retry_on_conflict(writers as u32 + 1, || store.upsert(date, values.clone()))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    }

    #[test]
    fn test_file_concurrent_writers_lose_nothing() {
        let dir = tempdir().unwrap();
        let blobs = Arc::new(FileBlobStore::new(dir.path()));
        let store = Arc::new(RecordStore::new(Arc::clone(&blobs), "health.csv"));

        for round in 0..10 {
            fs::remove_file(dir.path().join("health.csv")).ok();
            concurrent_upserts(std::slice::from_ref(&store), 8);
            let table = store.load().unwrap().table;
            assert_eq!(table.len(), 8, "round {round} lost writes");
        }
    }

    #[test]
    fn test_file_separate_handles_share_the_lock() {
        // Two stores over the same directory only share the lock file
        let dir = tempdir().unwrap();
        let stores: Vec<_> = (0..2)
            .map(|_| {
                Arc::new(RecordStore::new(
                    Arc::new(FileBlobStore::new(dir.path())),
                    "health.csv",
                ))
            })
            .collect();

        concurrent_upserts(&stores, 8);

        let table = stores[0].load().unwrap().table;
        assert_eq!(table.len(), 8);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n != "health.csv" && n != ".health.csv.lock")
            .collect();
        assert!(leftovers.is_empty(), "stray temp files: {leftovers:?}");
    }
}
