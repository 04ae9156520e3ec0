// Rename-replace writes for data that is never bind-mounted

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, FsResultExt, Result};

/// Prefix of the sibling file used while a rename-replace is in flight
pub const TEMP_PREFIX: &str = ".temp.";

/// Atomically replace `path` with `data`.
///
/// The bytes go to a sibling temporary file in the same directory, are
/// fsynced, then renamed over the destination. The file is created with
/// `perm`, so the final mode is `perm & !umask`. The destination inode
/// changes; use [`super::rollback`] for files that may be bind-mounted.
pub fn write_file(path: impl AsRef<Path>, data: &[u8], perm: u32) -> Result<()> {
    let path = path.as_ref();
    let (dir, base) = split(path)?;

    let temp_path = dir.join(format!("{}{}.{}", TEMP_PREFIX, base, Uuid::new_v4().simple()));
    debug!(
        "Writing {} bytes to {} via {}",
        data.len(),
        path.display(),
        temp_path.display()
    );

    let result = write_temp(&temp_path, data, perm).and_then(|_| {
        fs::rename(&temp_path, path)
            .fs_context(|| format!("Failed to rename into place: {}", path.display()))
    });

    if let Err(e) = result {
        // The temp file may or may not exist depending on where we failed
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    sync_dir(dir);
    Ok(())
}

fn write_temp(temp_path: &Path, data: &[u8], perm: u32) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    set_mode(&mut options, perm);

    let mut file = options
        .open(temp_path)
        .fs_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
    file.write_all(data)
        .fs_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;
    file.sync_all()
        .fs_context(|| format!("Failed to sync temp file: {}", temp_path.display()))?;
    Ok(())
}

/// Split a destination into its parent directory and file name.
pub(crate) fn split(path: &Path) -> Result<(&Path, String)> {
    let base = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no file name", path.display()))
        })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, base))
}

/// Apply a creation mode on platforms that have one.
pub(crate) fn set_mode(options: &mut OpenOptions, perm: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(perm);
    }
    #[cfg(not(unix))]
    {
        let _ = (options, perm);
    }
}

/// Flush directory metadata so a completed rename survives a crash.
/// Best effort: not every platform or filesystem allows it.
pub(crate) fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_and_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("value");

        write_file(&path, b"first", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first");

        write_file(&path, b"second", 0o600).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        // No temp files left behind
        let names: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["value".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_respects_requested_mode() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("secret");
        write_file(&path, b"x", 0o600).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // The umask can only remove bits
        assert_eq!(mode & !0o600, 0);
    }

    #[test]
    fn test_write_into_missing_directory_fails_cleanly() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing").join("value");

        let err = write_file(&path, b"data", 0o600).unwrap_err();
        assert!(err.is_filesystem_failure());
        assert!(!path.exists());
    }
}
