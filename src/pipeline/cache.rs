//! On-disk cache of transformed images.
//!
//! Entries are keyed by a digest of the effective request parameters, so
//! the entry name is path-safe regardless of what the request path
//! contained. Writes go to a temp file and rename into place; readers can
//! never observe a partially written entry as a hit.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::detect::ImageFormat;
use super::transform::TransformedImage;

/// Registry size that triggers pruning of idle key locks. Keys are
/// request-derived, so without a bound a scan of distinct paths would
/// grow the registry indefinitely.
const KEY_LOCK_PRUNE_THRESHOLD: usize = 1024;

/// Errors from cache persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache filesystem error: {0}")]
    Filesystem(#[from] io::Error),

    #[error("cache key resolves outside the cache root: {0}")]
    InvalidKey(String),
}

/// Deterministic cache entry name derived from the effective request
/// parameters. Identical parameters always produce identical keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a source path plus transform parameters.
    ///
    /// The digest covers everything that influences the output bytes; the
    /// extension carries the output format so a hit can be served with the
    /// right content type without decoding.
    pub fn derive(
        source_path: &str,
        target_width: Option<u32>,
        target_height: Option<u32>,
        output_format: ImageFormat,
        quality: u8,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source_path.as_bytes());
        hasher.update([0]);
        hasher.update(encode_dim(target_width));
        hasher.update(encode_dim(target_height));
        hasher.update(output_format.extension().as_bytes());
        hasher.update([0, quality]);
        let digest = hex::encode(hasher.finalize());
        CacheKey(format!("{digest}.{}", output_format.extension()))
    }

    /// Output format recorded in the key.
    pub fn format(&self) -> Option<ImageFormat> {
        let ext = self.0.rsplit('.').next()?;
        ImageFormat::from_extension(ext)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn encode_dim(dim: Option<u32>) -> [u8; 5] {
    match dim {
        Some(v) => {
            let b = v.to_be_bytes();
            [1, b[0], b[1], b[2], b[3]]
        }
        None => [0; 5],
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached entry read back from disk.
#[derive(Debug)]
pub struct CacheEntry {
    pub bytes: Bytes,
    pub format: ImageFormat,
}

/// Filesystem-backed store for transformed images.
///
/// Holds its root directory explicitly - no ambient global state. Also
/// owns the per-key gate that collapses concurrent identical requests
/// into a single fetch-and-transform.
pub struct CacheStore {
    root: PathBuf,
    /// Per-key locks so concurrent misses for the same key coalesce.
    key_locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl CacheStore {
    /// Create a store rooted at `root`. The directory is created lazily
    /// on first write.
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get or create the in-flight gate for a key. Callers hold the inner
    /// lock across the whole miss path (fetch, transform, put) and
    /// re-check the store after acquiring it.
    pub async fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        if locks.len() >= KEY_LOCK_PRUNE_THRESHOLD {
            // A strong count of 1 means only the registry holds the lock:
            // no task is holding or awaiting it, so it can be recreated
            // safely on the next miss for that key.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    async fn key_lock_count(&self) -> usize {
        self.key_locks.lock().await.len()
    }

    /// Look up an entry. Corrupt or empty entries are removed and treated
    /// as a miss so they get regenerated instead of served.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.entry_path(key).ok()?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => return None,
        };

        let format = key.format()?;
        if !entry_looks_valid(&bytes, format) {
            warn!(key = %key.as_str(), "Removing corrupt cache entry");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }

        debug!(key = %key.as_str(), size = bytes.len(), "Cache hit");
        Some(CacheEntry { bytes, format })
    }

    /// Persist a transformed image under `key`.
    ///
    /// Writes to a temp path in the same directory, then renames into
    /// place so a concurrent `lookup` sees either nothing or the full
    /// entry.
    pub async fn put(&self, key: &CacheKey, image: &TransformedImage) -> Result<(), StoreError> {
        let path = self.entry_path(key)?;

        tokio::fs::create_dir_all(&self.root).await?;

        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &image.bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(key = %key.as_str(), size = image.bytes.len(), "Cache entry written");
        Ok(())
    }

    fn entry_path(&self, key: &CacheKey) -> Result<PathBuf, StoreError> {
        let name = key.as_str();
        // Keys are digest-derived, so anything path-like means the key was
        // not produced by `CacheKey::derive`.
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(StoreError::InvalidKey(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

/// Cheap magic-byte sanity check for entries read back from disk.
fn entry_looks_valid(bytes: &[u8], format: ImageFormat) -> bool {
    !bytes.is_empty() && ImageFormat::from_magic_bytes(bytes) == Some(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_parameters_give_identical_keys() {
        let a = CacheKey::derive("photos/cat.png", Some(200), None, ImageFormat::Jpeg, 80);
        let b = CacheKey::derive("photos/cat.png", Some(200), None, ImageFormat::Jpeg, 80);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), b.as_str());
    }

    #[test]
    fn any_parameter_change_changes_the_key() {
        let base = CacheKey::derive("photos/cat.png", Some(200), None, ImageFormat::Jpeg, 80);
        let variants = [
            CacheKey::derive("photos/dog.png", Some(200), None, ImageFormat::Jpeg, 80),
            CacheKey::derive("photos/cat.png", Some(201), None, ImageFormat::Jpeg, 80),
            CacheKey::derive("photos/cat.png", None, Some(200), ImageFormat::Jpeg, 80),
            CacheKey::derive("photos/cat.png", Some(200), None, ImageFormat::Webp, 80),
            CacheKey::derive("photos/cat.png", Some(200), None, ImageFormat::Jpeg, 81),
        ];
        for variant in variants {
            assert_ne!(base, variant);
        }
    }

    #[test]
    fn width_and_height_are_not_interchangeable() {
        // (w=200, h=None) and (w=None, h=200) must not collide.
        let a = CacheKey::derive("p.png", Some(200), None, ImageFormat::Png, 80);
        let b = CacheKey::derive("p.png", None, Some(200), ImageFormat::Png, 80);
        assert_ne!(a, b);
    }

    #[test]
    fn key_is_path_safe_for_hostile_paths() {
        let key = CacheKey::derive("../../etc/passwd", None, None, ImageFormat::Png, 80);
        assert!(!key.as_str().contains('/'));
        assert!(!key.as_str().contains(".."));
        let store = CacheStore::new(PathBuf::from("/tmp/cache"));
        assert!(store.entry_path(&key).is_ok());
    }

    #[test]
    fn key_records_output_format() {
        let key = CacheKey::derive("a.png", None, None, ImageFormat::Webp, 80);
        assert!(key.as_str().ends_with(".webp"));
        assert_eq!(key.format(), Some(ImageFormat::Webp));
    }

    #[tokio::test]
    async fn idle_key_locks_are_pruned() {
        let store = CacheStore::new(PathBuf::from("/tmp/cache"));

        // Fill the registry past the threshold with locks nobody holds.
        for i in 0..=KEY_LOCK_PRUNE_THRESHOLD {
            let key = CacheKey::derive(&format!("p/{i}.png"), Some(1), None, ImageFormat::Png, 80);
            drop(store.key_lock(&key).await);
        }
        assert!(store.key_lock_count().await < KEY_LOCK_PRUNE_THRESHOLD);
    }

    #[tokio::test]
    async fn held_key_locks_survive_pruning() {
        let store = CacheStore::new(PathBuf::from("/tmp/cache"));

        let held_key = CacheKey::derive("held.png", None, None, ImageFormat::Png, 80);
        let held = store.key_lock(&held_key).await;

        for i in 0..=KEY_LOCK_PRUNE_THRESHOLD {
            let key = CacheKey::derive(&format!("q/{i}.png"), Some(2), None, ImageFormat::Png, 80);
            drop(store.key_lock(&key).await);
        }

        // In-use locks are exempt: a later caller for the same key must
        // coalesce on the same gate.
        let again = store.key_lock(&held_key).await;
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn entry_validity_requires_matching_magic() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        assert!(entry_looks_valid(&png_magic, ImageFormat::Png));
        assert!(!entry_looks_valid(&png_magic, ImageFormat::Jpeg));
        assert!(!entry_looks_valid(&[], ImageFormat::Png));
    }
}
