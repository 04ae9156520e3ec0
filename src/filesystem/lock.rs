// Advisory file locks
//
// On unix the lock is taken with flock(2) on the target itself, directories
// included. Windows cannot lock a directory handle, so a sibling `<dir>.lock`
// file replaces the directory as the lock object there.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A held lock. Dropping the handle closes the descriptor, which releases the
/// lock as well; [`unlock`] does the same but reports failures.
#[derive(Debug)]
pub struct Locked {
    file: File,
    path: PathBuf,
}

impl Locked {
    /// The object actually locked (the sidecar file on Windows directories)
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Exclusive,
    Shared,
}

/// Take an exclusive lock on `path`, blocking until it is granted.
pub fn lock(path: impl AsRef<Path>) -> Result<Locked> {
    acquire(path.as_ref(), Mode::Exclusive)
}

/// Take a shared lock on `path`, blocking until no exclusive lock is held.
pub fn read_only_lock(path: impl AsRef<Path>) -> Result<Locked> {
    acquire(path.as_ref(), Mode::Shared)
}

/// Release a lock and close its descriptor.
pub fn unlock(handle: Locked) -> Result<()> {
    let Locked { file, path } = handle;
    sys::unlock(&file).map_err(|source| Error::UnlockFail { path, source })
}

/// Run `fun` while holding an exclusive lock on `path`.
///
/// The lock is released on every exit path: on unwinding the handle is
/// dropped and the descriptor closed.
pub fn with_lock<T>(path: impl AsRef<Path>, fun: impl FnOnce() -> Result<T>) -> Result<T> {
    let handle = lock(path)?;
    finish(handle, fun())
}

/// Run `fun` while holding a shared lock on `path`.
pub fn with_read_only_lock<T>(
    path: impl AsRef<Path>,
    fun: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let handle = read_only_lock(path)?;
    finish(handle, fun())
}

fn finish<T>(handle: Locked, result: Result<T>) -> Result<T> {
    match (result, unlock(handle)) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(unlock_err)) => Err(unlock_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(unlock_err)) => {
            warn!("Failed to release lock after error: {}", unlock_err);
            Err(err)
        }
    }
}

fn acquire(path: &Path, mode: Mode) -> Result<Locked> {
    let target = lock_target(path);
    let lock_fail = |source: io::Error| Error::LockFail {
        path: target.clone(),
        source,
    };

    let file = open_lock_file(&target).map_err(lock_fail)?;

    debug!("Acquiring {:?} lock on {}", mode, target.display());
    // On failure `file` is dropped here, so no descriptor leaks
    sys::lock(&file, mode).map_err(lock_fail)?;

    Ok(Locked { file, path: target })
}

/// Resolve the object that carries the lock for `path`.
fn lock_target(path: &Path) -> PathBuf {
    if cfg!(windows) && path.is_dir() {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    } else {
        path.to_path_buf()
    }
}

/// Open the lock object read-only, creating a zero-byte owner-read-only file
/// when nothing exists at `target` yet.
fn open_lock_file(target: &Path) -> io::Result<File> {
    match File::open(target) {
        Ok(file) => return Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o400);
    }
    match options.open(target) {
        Ok(_) => {}
        // Lost a creation race with another locker, which is fine
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e),
    }

    File::open(target)
}

#[cfg(unix)]
mod sys {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use super::Mode;

    fn flock_retrying(file: &File, arg: FlockArg) -> io::Result<()> {
        loop {
            match flock(file.as_raw_fd(), arg) {
                Ok(()) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from(errno)),
            }
        }
    }

    pub(super) fn lock(file: &File, mode: Mode) -> io::Result<()> {
        let arg = match mode {
            Mode::Exclusive => FlockArg::LockExclusive,
            Mode::Shared => FlockArg::LockShared,
        };
        flock_retrying(file, arg)
    }

    pub(super) fn unlock(file: &File) -> io::Result<()> {
        flock_retrying(file, FlockArg::Unlock)
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;

    use super::Mode;

    pub(super) fn lock(file: &File, mode: Mode) -> io::Result<()> {
        match mode {
            Mode::Exclusive => file.lock(),
            Mode::Shared => file.lock_shared(),
        }
    }

    pub(super) fn unlock(file: &File) -> io::Result<()> {
        file.unlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lock_creates_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.lock");

        let handle = lock(&path).unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777 & !0o400, 0);
        }

        unlock(handle).unwrap();
    }

    #[test]
    fn test_lock_directory() {
        let temp_dir = TempDir::new().unwrap();
        let handle = lock(temp_dir.path()).unwrap();
        if cfg!(windows) {
            assert!(handle.path().to_string_lossy().ends_with(".lock"));
        } else {
            assert_eq!(handle.path(), temp_dir.path());
        }
        unlock(handle).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let temp_dir = TempDir::new().unwrap();
        let first = read_only_lock(temp_dir.path()).unwrap();
        let second = read_only_lock(temp_dir.path()).unwrap();
        unlock(first).unwrap();
        unlock(second).unwrap();
    }

    #[test]
    fn test_exclusive_lock_serializes_threads() {
        let temp_dir = TempDir::new().unwrap();
        let path = Arc::new(temp_dir.path().to_path_buf());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = Arc::clone(&path);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    with_lock(path.as_path(), || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap();
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_with_lock_releases_on_error() {
        let temp_dir = TempDir::new().unwrap();
        let result: Result<()> = with_lock(temp_dir.path(), || {
            Err(Error::InvalidArgument("boom".to_string()))
        });
        assert!(result.unwrap_err().is_invalid_argument());

        // Would block forever if the previous lock leaked
        with_lock(temp_dir.path(), || Ok(())).unwrap();
    }

    #[test]
    fn test_with_lock_releases_on_panic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().to_path_buf();

        let panicked = thread::spawn({
            let path = path.clone();
            move || {
                let _: Result<()> = with_lock(&path, || panic!("inside lock"));
            }
        })
        .join();
        assert!(panicked.is_err());

        with_lock(&path, || Ok(())).unwrap();
    }

    #[test]
    fn test_lock_in_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let err = lock(temp_dir.path().join("missing").join("x.lock")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::LockFail);
    }
}
