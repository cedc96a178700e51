//! Content-addressed reference cache.
//!
//! Each selection fingerprint owns one directory under the cache root
//! holding the concatenated reference FASTA, the accession -> taxid
//! table, the aligner index and a `cache.meta` provenance record. An
//! entry moves `Absent -> Building -> Ready`; `ready` is an empty marker
//! file written last, so a crash mid-build leaves a directory the next
//! resolver treats as absent and garbage-collects.
//!
//! Coordination is a sibling advisory lock file `<fingerprint>.lock`:
//! exclusive while building or evicting, shared while a run reads the
//! entry. Multiple processes may resolve the same fingerprint at once;
//! exactly one builds, the rest block on the lock and find `ready` set.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const REFERENCES_FASTA: &str = "references.fasta";
pub const REFERENCE_TAXONOMY: &str = "reference_taxonomy.tsv";
pub const ALIGNMENT_INDEX: &str = "alignment.index";
pub const READY_MARKER: &str = "ready";
pub const META_FILE: &str = "cache.meta";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMeta {
    pub fingerprint: String,
    pub selection: Vec<String>,
    pub created_at: String,
    pub tool_versions: BTreeMap<String, String>,
    pub checksums: BTreeMap<String, String>,
}

impl CacheMeta {
    pub fn load(path: &Path) -> Option<Self> {
        fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Handle to a `Ready` entry. Holds the shared lock for its lifetime so
/// the pruner cannot evict the entry out from under a running pipeline.
#[derive(Debug)]
pub struct CacheReadGuard {
    dir: PathBuf,
    _lock: File,
}

impl CacheReadGuard {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn references_fasta(&self) -> PathBuf {
        self.dir.join(REFERENCES_FASTA)
    }

    pub fn reference_taxonomy(&self) -> PathBuf {
        self.dir.join(REFERENCE_TAXONOMY)
    }

    pub fn alignment_index(&self) -> PathBuf {
        self.dir.join(ALIGNMENT_INDEX)
    }

    pub fn meta(&self) -> Option<CacheMeta> {
        CacheMeta::load(&self.dir.join(META_FILE))
    }
}

pub struct ReferenceCache {
    root: PathBuf,
}

impl ReferenceCache {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint)
    }

    fn lock_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{}.lock", fingerprint))
    }

    fn open_lock_file(&self, fingerprint: &str) -> Result<File> {
        let path = self.lock_path(fingerprint);
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open cache lock: {}", path.display()))
    }

    fn is_ready(&self, fingerprint: &str) -> bool {
        self.entry_dir(fingerprint).join(READY_MARKER).exists()
    }

    /// Resolve a fingerprint to a readable entry, invoking `builder` on a
    /// scratch directory if the entry does not exist yet. The builder
    /// must materialise `references.fasta`, `reference_taxonomy.tsv` and
    /// `alignment.index` inside the scratch directory it is handed.
    pub fn resolve<F>(&self, fingerprint: &str, selection: &[String], mut builder: F) -> Result<CacheReadGuard>
    where
        F: FnMut(&Path) -> Result<BTreeMap<String, String>>,
    {
        // Fast path plus a retry loop: between dropping the exclusive
        // lock and acquiring the shared one, a pruner may win the lock
        // and evict, so re-check ready after every shared acquisition.
        for _ in 0..8 {
            if self.is_ready(fingerprint) {
                let lock = self.open_lock_file(fingerprint)?;
                lock.lock_shared()
                    .with_context(|| "Failed to take shared cache lock")?;
                if self.is_ready(fingerprint) {
                    return Ok(CacheReadGuard {
                        dir: self.entry_dir(fingerprint),
                        _lock: lock,
                    });
                }
                FileExt::unlock(&lock).ok();
                continue;
            }

            let lock = self.open_lock_file(fingerprint)?;
            lock.lock_exclusive()
                .with_context(|| "Failed to take exclusive cache lock")?;

            // Another process may have completed the build while we
            // waited on the lock
            if !self.is_ready(fingerprint) {
                let result = self.build_entry(fingerprint, selection, &mut builder);
                if let Err(e) = result {
                    FileExt::unlock(&lock).ok();
                    return Err(e);
                }
            }
            FileExt::unlock(&lock).ok();
        }

        anyhow::bail!(
            "cache entry {} kept disappearing between build and read; giving up",
            fingerprint
        )
    }

    /// Must be called with the exclusive lock held.
    fn build_entry<F>(&self, fingerprint: &str, selection: &[String], builder: &mut F) -> Result<()>
    where
        F: FnMut(&Path) -> Result<BTreeMap<String, String>>,
    {
        let dir = self.entry_dir(fingerprint);

        // A directory without a ready marker is a crashed build
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to clear stale cache entry: {}", dir.display()))?;
        }
        self.gc_scratch(fingerprint)?;

        let scratch = self
            .root
            .join(format!("{}.build-{}", fingerprint, std::process::id()));
        fs::create_dir_all(&scratch)?;

        let tool_versions = match builder(&scratch) {
            Ok(v) => v,
            Err(e) => {
                fs::remove_dir_all(&scratch).ok();
                return Err(e.context("cache builder failed"));
            }
        };

        for required in [REFERENCES_FASTA, REFERENCE_TAXONOMY, ALIGNMENT_INDEX] {
            if !scratch.join(required).exists() {
                fs::remove_dir_all(&scratch).ok();
                anyhow::bail!("cache builder did not produce {}", required);
            }
        }

        let mut checksums = BTreeMap::new();
        for file in [REFERENCES_FASTA, REFERENCE_TAXONOMY] {
            checksums.insert(file.to_string(), sha1_file(&scratch.join(file))?);
        }

        let meta = CacheMeta {
            fingerprint: fingerprint.to_string(),
            selection: selection.to_vec(),
            created_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            tool_versions,
            checksums,
        };
        meta.save(&scratch.join(META_FILE))?;

        fs::rename(&scratch, &dir)
            .with_context(|| format!("Failed to move cache entry into place: {}", dir.display()))?;
        // Marker last: its presence is what flips the entry to Ready
        File::create(dir.join(READY_MARKER))?;
        Ok(())
    }

    fn gc_scratch(&self, fingerprint: &str) -> Result<()> {
        let prefix = format!("{}.build-", fingerprint);
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) {
                fs::remove_dir_all(entry.path()).ok();
            }
        }
        Ok(())
    }

    /// Drop an entry before use (`FORCE_DOWNLOAD`). No-op when absent.
    pub fn invalidate(&self, fingerprint: &str) -> Result<()> {
        let lock = self.open_lock_file(fingerprint)?;
        lock.lock_exclusive()
            .with_context(|| "Failed to take exclusive cache lock for invalidation")?;
        let dir = self.entry_dir(fingerprint);
        if dir.exists() {
            // Marker first, so a crash mid-removal leaves a non-ready
            // directory the next resolve garbage-collects
            fs::remove_file(dir.join(READY_MARKER)).ok();
            fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove cache entry: {}", dir.display()))?;
        }
        FileExt::unlock(&lock).ok();
        Ok(())
    }

    /// Evict `Ready` entries older than `max_age_days`, then oldest-first
    /// until total size fits `max_total_bytes`. Entries whose lock is
    /// held (active readers or builders) are skipped. Returns the evicted
    /// fingerprints.
    pub fn prune(&self, max_age_days: Option<u64>, max_total_bytes: Option<u64>) -> Result<Vec<String>> {
        let mut entries: Vec<(String, std::time::SystemTime, u64)> = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(".build-") {
                continue;
            }
            if !self.is_ready(&name) {
                // Building (or crashed); never prune these
                continue;
            }
            let created = entry.metadata()?.modified()?;
            let size = dir_size(&entry.path())?;
            entries.push((name, created, size));
        }
        entries.sort_by_key(|(_, created, _)| *created);

        let mut evicted = Vec::new();
        let now = std::time::SystemTime::now();

        if let Some(days) = max_age_days {
            let horizon = std::time::Duration::from_secs(days * 24 * 3600);
            for (name, created, _) in &entries {
                if now.duration_since(*created).unwrap_or_default() > horizon {
                    if self.try_evict(name)? {
                        evicted.push(name.clone());
                    }
                }
            }
        }

        if let Some(cap) = max_total_bytes {
            let mut total: u64 = entries
                .iter()
                .filter(|(name, _, _)| !evicted.contains(name))
                .map(|(_, _, size)| size)
                .sum();
            for (name, _, size) in &entries {
                if total <= cap {
                    break;
                }
                if evicted.contains(name) {
                    continue;
                }
                if self.try_evict(name)? {
                    evicted.push(name.clone());
                    total -= size;
                }
            }
        }

        Ok(evicted)
    }

    fn try_evict(&self, fingerprint: &str) -> Result<bool> {
        let lock = self.open_lock_file(fingerprint)?;
        if lock.try_lock_exclusive().is_err() {
            return Ok(false);
        }
        let dir = self.entry_dir(fingerprint);
        fs::remove_file(dir.join(READY_MARKER)).ok();
        let removed = fs::remove_dir_all(&dir).is_ok();
        FileExt::unlock(&lock).ok();
        // The lock file stays behind: unlinking it would let a waiter
        // holding the old inode and a newcomer on a fresh one both think
        // they own the entry
        Ok(removed)
    }
}

pub fn sha1_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}
