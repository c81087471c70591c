use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use anyhow::Context as _;
use tracing::{debug, warn};

/// Local string key-value store that outlives the process.
pub(crate) trait KeyValueStore: Send + Sync + std::fmt::Debug {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// Subject-scoped persistence keys.
#[derive(Clone, Debug)]
pub(crate) struct Keys {
    subject_id: String,
}

impl Keys {
    pub(crate) fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
        }
    }

    pub(crate) fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub(crate) fn entitlement_cache(&self) -> String {
        format!("subscription_cache_{}", self.subject_id)
    }

    /// Superseded by [`Keys::paid_lock`], still honoured when reading.
    pub(crate) fn legacy_verified(&self) -> String {
        format!("pro_verified_{}", self.subject_id)
    }

    pub(crate) fn paid_lock(&self) -> String {
        format!("pro_locked_{}", self.subject_id)
    }

    pub(crate) fn usage_cache(&self) -> String {
        format!("usage_cache_{}", self.subject_id)
    }

    pub(crate) fn period_marker(&self) -> String {
        format!("usage_period_{}", self.subject_id)
    }

    pub(crate) fn downloads(&self, period: &str) -> String {
        format!("downloads_{}_{period}", self.subject_id)
    }
}

/// JSON document on disk holding every key.
///
/// Several processes may share one directory (a long-running `watch` next to
/// one-off commands). Every read goes to disk, and every mutation re-reads the
/// document under an exclusive advisory lock before replacing it.
#[derive(Debug)]
pub(crate) struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    // flock is per open file, so threads of this process serialize here first
    writer: Mutex<()>,
}

impl FileStore {
    pub(crate) fn open(dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create cache directory '{}'", dir.display()))?;

        let store = Self {
            path: dir.join("store.json"),
            lock_path: dir.join("store.lock"),
            writer: Mutex::new(()),
        };

        // Surface unreadable files at startup rather than on first use
        store.read_entries()?;

        debug!(path = %store.path.display(), "Opened local store");

        Ok(store)
    }

    fn read_entries(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => Ok(entries),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        ?err,
                        "Local store is not valid JSON, starting empty"
                    );
                    Ok(BTreeMap::new())
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err)
                .with_context(|| format!("Failed to read local store '{}'", self.path.display())),
        }
    }

    /// Applies `change` to the latest document on disk. `change` returns
    /// whether anything changed.
    fn update(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> bool,
    ) -> anyhow::Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::exclusive(&self.lock_path)?;

        let mut entries = self.read_entries()?;
        if change(&mut entries) {
            self.flush(&entries)?;
        }

        Ok(())
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> anyhow::Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");

        fs::write(&tmp_path, serde_json::to_vec_pretty(entries)?)
            .with_context(|| format!("Failed to write local store '{}'", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace local store '{}'", self.path.display()))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        // Writers replace the document by rename, so a plain read is consistent
        Ok(self.read_entries()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.update(|entries| {
            entries.insert(key.to_owned(), value.to_owned()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.update(|entries| entries.remove(key).is_some())
    }
}

/// Exclusive advisory lock on a file, released when dropped.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        flock_exclusive(&file)
            .with_context(|| format!("Failed to lock '{}'", path.display()))?;

        Ok(Self { _file: file })
    }
}

/// Blocks until an exclusive flock on `file` is held.
fn flock_exclusive(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        loop {
            // SAFETY: fd is a valid descriptor owned by `file`, which outlives
            // this call. The lock is released when the descriptor is closed.
            let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
            if result == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    writes: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl MemoryStore {
    /// Number of `set`/`remove` calls that changed something.
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        if self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
        {
            self.writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }
}
