// Hierarchical key/value store on disk
//
// A key is a sequence of validated path components joined under the store
// root. Interior directories are groups, regular files are leaves holding the
// value bytes. Mutations require the store lock, an advisory lock on the root
// directory, so that concurrent processes sharing the root are serialized.

use std::fs::{self, DirBuilder};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, warn};

use crate::error::{Error, FsResultExt, Result};
use crate::filesystem::{self, write::TEMP_PREFIX, Locked};

/// Default mode of the store root and groups
pub const DEFAULT_DIR_PERM: u32 = 0o700;
/// Default mode of leaves
pub const DEFAULT_FILE_PERM: u32 = 0o600;

#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    dir_perm: u32,
    file_perm: u32,
    locked: Mutex<Option<Held>>,
}

/// The store lock together with the thread that took it
#[derive(Debug)]
struct Held {
    handle: Locked,
    owner: ThreadId,
}

impl Store {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, dir_perm: u32, file_perm: u32) -> Result<Self> {
        let root = root.into();
        dir_builder(dir_perm)
            .create(&root)
            .fs_context(|| format!("Failed to create store root: {}", root.display()))?;

        Ok(Self {
            root,
            dir_perm,
            file_perm,
            locked: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Take the exclusive store lock. Blocks until granted.
    ///
    /// The lock belongs to the calling thread: other threads sharing this
    /// store block here and cannot mutate or release it meanwhile. Not
    /// reentrant: locking twice from the same thread deadlocks.
    pub fn lock(&self) -> Result<()> {
        // Blocks on the advisory lock, not on the slot mutex
        let handle = filesystem::lock(&self.root)?;
        *self.slot() = Some(Held {
            handle,
            owner: thread::current().id(),
        });
        Ok(())
    }

    /// Release the store lock taken by [`Store::lock`] on this thread.
    pub fn release(&self) -> Result<()> {
        let held = self.take_owned().ok_or(Error::LockIsNil)?;
        filesystem::unlock(held.handle)
    }

    /// Run `fun` with the store lock held, releasing it on every exit path.
    pub fn with_lock<T>(&self, fun: impl FnOnce() -> Result<T>) -> Result<T> {
        self.lock()?;
        let guard = ReleaseOnDrop { store: self };

        let result = fun();
        // Disarms the guard: once released, another thread may own the slot
        let released = self.release();
        drop(guard);

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("Failed to release store lock after error: {}", release_err);
                Err(e)
            }
        }
    }

    /// Run `fun` with a shared lock on the store root.
    ///
    /// Mutations attempted from inside `fun` are rejected, since the write
    /// lock is not held.
    pub fn with_read_lock<T>(&self, fun: impl FnOnce() -> Result<T>) -> Result<T> {
        filesystem::with_read_only_lock(&self.root, fun)
    }

    /// Path a key maps to, after validating every component.
    pub fn location(&self, key: &[&str]) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for component in key {
            filesystem::validate(component)?;
            path.push(component);
        }
        Ok(path)
    }

    pub fn exists(&self, key: &[&str]) -> Result<bool> {
        let path = self.location(key)?;
        match fs::symlink_metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::filesystem(
                format!("Failed to stat {}", path.display()),
                e,
            )),
        }
    }

    pub fn get(&self, key: &[&str]) -> Result<Vec<u8>> {
        let path = self.location(key)?;
        let metadata = self.stat(&path, key)?;
        if metadata.is_dir() {
            return Err(Error::FaultyImplementation(format!(
                "{} is a group, not a value",
                display_key(key)
            )));
        }

        fs::read(&path).fs_context(|| format!("Failed to read {}", path.display()))
    }

    /// Store `data` under `key`, creating intermediate groups as needed.
    pub fn set(&self, data: &[u8], key: &[&str]) -> Result<()> {
        self.ensure_locked("set")?;
        if key.is_empty() {
            return Err(Error::InvalidArgument("set requires a key".to_string()));
        }

        let path = self.location(key)?;
        if path.is_dir() {
            return Err(Error::FaultyImplementation(format!(
                "cannot set {}: it is a group",
                display_key(key)
            )));
        }

        let parent = self.location(&key[..key.len() - 1])?;
        self.create_group(&parent, &key[..key.len() - 1])?;

        debug!("Setting {} ({} bytes)", display_key(key), data.len());
        filesystem::write_file(&path, data, self.file_perm)
    }

    /// Names of the direct children of a group, sorted.
    pub fn list(&self, key: &[&str]) -> Result<Vec<String>> {
        let path = self.location(key)?;
        let metadata = self.stat(&path, key)?;
        if !metadata.is_dir() {
            return Err(Error::FaultyImplementation(format!(
                "{} is a value, not a group",
                display_key(key)
            )));
        }

        let entries =
            fs::read_dir(&path).fs_context(|| format!("Failed to list {}", path.display()))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.fs_context(|| format!("Failed to list {}", path.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            // In-flight writes are not part of the namespace
            if !name.starts_with(TEMP_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a value, or a group with everything below it.
    pub fn delete(&self, key: &[&str]) -> Result<()> {
        self.ensure_locked("delete")?;
        if key.is_empty() {
            return Err(Error::InvalidArgument(
                "refusing to delete the store root".to_string(),
            ));
        }

        let path = self.location(key)?;
        let metadata = self.stat(&path, key)?;

        debug!("Deleting {}", display_key(key));
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.fs_context(|| format!("Failed to delete {}", path.display()))
    }

    /// Create a group (and its parents) if it does not exist yet.
    pub fn group_ensure(&self, key: &[&str]) -> Result<()> {
        self.ensure_locked("group_ensure")?;
        let path = self.location(key)?;
        self.create_group(&path, key)
    }

    /// Total size in bytes of the values below a group.
    pub fn group_size(&self, key: &[&str]) -> Result<u64> {
        let path = self.location(key)?;
        let metadata = self.stat(&path, key)?;
        if !metadata.is_dir() {
            return Err(Error::FaultyImplementation(format!(
                "{} is a value, not a group",
                display_key(key)
            )));
        }
        walk_size(&path)
    }

    fn slot(&self) -> MutexGuard<'_, Option<Held>> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the lock out of the slot if the calling thread holds it.
    fn take_owned(&self) -> Option<Held> {
        let mut slot = self.slot();
        if slot.as_ref().map(|held| held.owner) == Some(thread::current().id()) {
            slot.take()
        } else {
            None
        }
    }

    fn ensure_locked(&self, operation: &str) -> Result<()> {
        let owner = self.slot().as_ref().map(|held| held.owner);
        if owner != Some(thread::current().id()) {
            return Err(Error::FaultyImplementation(format!(
                "{} called without holding the store lock",
                operation
            )));
        }
        Ok(())
    }

    fn stat(&self, path: &Path, key: &[&str]) -> Result<fs::Metadata> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::NotFound(display_key(key)))
            }
            Err(e) => Err(Error::filesystem(
                format!("Failed to stat {}", path.display()),
                e,
            )),
        }
    }

    fn create_group(&self, path: &Path, key: &[&str]) -> Result<()> {
        if path.exists() && !path.is_dir() {
            return Err(Error::FaultyImplementation(format!(
                "{} is a value, not a group",
                display_key(key)
            )));
        }
        dir_builder(self.dir_perm).create(path).map_err(|e| {
            // A value somewhere along the way makes the group impossible
            if e.kind() == io::ErrorKind::NotADirectory || e.kind() == io::ErrorKind::AlreadyExists
            {
                Error::FaultyImplementation(format!(
                    "a value is in the way of group {}",
                    display_key(key)
                ))
            } else {
                Error::filesystem(format!("Failed to create group {}", path.display()), e)
            }
        })
    }
}

/// Drops the store lock if `with_lock`'s closure unwinds.
struct ReleaseOnDrop<'a> {
    store: &'a Store,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        // Closing the descriptor releases the advisory lock. A lock that
        // already passed to another thread is left alone.
        drop(self.store.take_owned());
    }
}

fn dir_builder(perm: u32) -> DirBuilder {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(perm);
    }
    #[cfg(not(unix))]
    {
        let _ = perm;
    }
    builder
}

fn walk_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let entries = fs::read_dir(dir).fs_context(|| format!("Failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.fs_context(|| format!("Failed to list {}", dir.display()))?;
        let metadata = entry
            .metadata()
            .fs_context(|| format!("Failed to stat {}", entry.path().display()))?;
        if metadata.is_dir() {
            total += walk_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

fn display_key(key: &[&str]) -> String {
    if key.is_empty() {
        "<root>".to_string()
    } else {
        key.join("/")
    }
}
