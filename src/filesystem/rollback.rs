// In-place writes with crash recovery and caller-visible rollback
//
// Used for files that may be bind-mounted (the credentials file above all),
// where replacing the inode through a rename is not acceptable. Every write
// is bracketed by a marker file and, when the destination already existed, a
// byte-for-byte backup. Both live in the operations directory rather than
// next to the destination:
//
//   <ops>/<hash8(dir)>-<pretty16(base)>-<hash8(base)>-in-progress
//   <ops>/<hash8(dir)>-<pretty16(base)>-<hash8(base)>-backup
//
// The marker holds `remove` when the destination did not exist before the
// write, and nothing otherwise. The recovery pass only acts while a marker
// is present, and removes the backup before the marker, so an interrupted
// recovery is safe to run again.

use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::write::{set_mode, split, write_file};
use crate::error::{Error, FsResultExt, Result};

const MARKER_REMOVE: &[u8] = b"remove";
const MARKER_SUFFIX: &str = "in-progress";
const BACKUP_SUFFIX: &str = "backup";

/// The operations directory holding markers and backups.
#[derive(Debug, Clone)]
pub struct OpsDir {
    dir: PathBuf,
}

/// Marker and backup locations for one destination file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidePaths {
    pub marker: PathBuf,
    pub backup: PathBuf,
}

/// Inverse of a successful [`OpsDir::write_file_with_rollback`].
///
/// Only valid until the next write to the same destination, which reuses the
/// backup slot.
#[must_use = "dropping a Rollback keeps the new contents; call commit() to say so explicitly"]
#[derive(Debug)]
pub struct Rollback {
    target: PathBuf,
    side: SidePaths,
    pre_image_existed: bool,
    perm: u32,
}

impl OpsDir {
    /// Use `dir` as operations directory, creating it owner-only if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .fs_context(|| format!("Failed to create operations directory: {}", dir.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700)).fs_context(|| {
                format!("Failed to restrict operations directory: {}", dir.display())
            })?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Compute where the marker and backup for `path` live.
    pub fn side_paths(&self, path: &Path) -> Result<SidePaths> {
        let (dir, base) = split(path)?;
        let dir = std::path::absolute(dir)
            .fs_context(|| format!("Failed to resolve directory of {}", path.display()))?;

        let prefix = format!(
            "{}-{}-{}",
            hash8(dir.to_string_lossy().as_bytes()),
            pretty16(&base),
            hash8(base.as_bytes())
        );

        Ok(SidePaths {
            marker: self.dir.join(format!("{}-{}", prefix, MARKER_SUFFIX)),
            backup: self.dir.join(format!("{}-{}", prefix, BACKUP_SUFFIX)),
        })
    }

    /// Heal `path` if a previous write to it was interrupted.
    pub fn recover(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let side = self.side_paths(path)?;
        recover(path, &side)
    }

    /// Write `data` to `path` in place, atomically and durably.
    ///
    /// On success the returned [`Rollback`] restores the previous contents
    /// (or removes the file if it did not exist). On failure the destination
    /// has been brought back to its previous state before returning.
    pub fn write_file_with_rollback(
        &self,
        path: impl AsRef<Path>,
        data: &[u8],
        perm: u32,
    ) -> Result<Rollback> {
        let path = path.as_ref();
        let side = self.side_paths(path)?;

        // A failed recovery is fatal: writing on top of an unknown state
        // could destroy the only good copy.
        recover(path, &side)?;

        let pre_image_existed = match fs::metadata(path) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(Error::filesystem(
                    format!("Failed to stat {}", path.display()),
                    e,
                ))
            }
        };

        // A stale backup would be restored by mistake if this write were
        // interrupted on a destination that did not exist.
        remove_if_present(&side.backup)
            .fs_context(|| format!("Failed to clear stale backup: {}", side.backup.display()))?;

        // Marker and backup are renamed into place, so neither is ever
        // observed half-written.
        let marker_content = if pre_image_existed { &b""[..] } else { MARKER_REMOVE };
        if let Err(e) = write_file(&side.marker, marker_content, 0o600) {
            let _ = remove_if_present(&side.marker);
            return Err(e);
        }

        let result = (|| -> Result<()> {
            if pre_image_existed {
                let current = fs::read(path).fs_context(|| {
                    format!("Failed to back up {} before writing", path.display())
                })?;
                write_file(&side.backup, &current, 0o600)?;
            }
            write_synced(path, data, perm)
                .fs_context(|| format!("Failed to write {}", path.display()))?;
            fs::remove_file(&side.marker)
                .fs_context(|| format!("Failed to remove marker: {}", side.marker.display()))
        })();

        match result {
            Ok(()) => {
                debug!("Wrote {} bytes to {}", data.len(), path.display());
                Ok(Rollback {
                    target: path.to_path_buf(),
                    side,
                    pre_image_existed,
                    perm,
                })
            }
            Err(original) => {
                let context = match recover(path, &side) {
                    Ok(()) => format!(
                        "Write to {} failed and was rolled back",
                        path.display()
                    ),
                    Err(recovery) => format!(
                        "Write to {} failed and recovery also failed ({})",
                        path.display(),
                        recovery
                    ),
                };
                Err(Error::filesystem(context, original))
            }
        }
    }
}

impl Rollback {
    /// Restore the contents the destination had before the write.
    pub fn rollback(self) -> Result<()> {
        let target = &self.target;

        if !self.pre_image_existed {
            info!("Rolling back {}: removing", target.display());
            remove_if_present(target)
                .fs_context(|| format!("Failed to remove {}", target.display()))?;
            return Ok(());
        }

        info!("Rolling back {}: restoring backup", target.display());

        // Re-arm the marker so a crash mid-restore is finished by the next
        // recovery pass, which will find the backup.
        write_file(&self.side.marker, b"", 0o600)?;

        let data = fs::read(&self.side.backup)
            .fs_context(|| format!("Failed to read backup: {}", self.side.backup.display()))?;
        write_synced(target, &data, self.perm)
            .fs_context(|| format!("Failed to restore {}", target.display()))?;

        remove_if_present(&self.side.backup)
            .fs_context(|| format!("Failed to remove backup: {}", self.side.backup.display()))?;
        fs::remove_file(&self.side.marker)
            .fs_context(|| format!("Failed to remove marker: {}", self.side.marker.display()))
    }

    /// Keep the new contents and drop the backup.
    pub fn commit(self) -> Result<()> {
        remove_if_present(&self.side.backup)
            .fs_context(|| format!("Failed to remove backup: {}", self.side.backup.display()))
    }
}

fn recover(path: &Path, side: &SidePaths) -> Result<()> {
    let marker = match fs::read(&side.marker) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(Error::filesystem(
                format!("Failed to read marker: {}", side.marker.display()),
                e,
            ))
        }
    };

    warn!("Recovering interrupted write to {}", path.display());

    if side.backup.exists() {
        let data = fs::read(&side.backup)
            .fs_context(|| format!("Failed to read backup: {}", side.backup.display()))?;
        write_synced(path, &data, 0o600)
            .fs_context(|| format!("Failed to restore {}", path.display()))?;
        fs::remove_file(&side.backup)
            .fs_context(|| format!("Failed to remove backup: {}", side.backup.display()))?;
    } else if marker == MARKER_REMOVE {
        remove_if_present(path).fs_context(|| format!("Failed to remove {}", path.display()))?;
    }
    // Otherwise the backup was already restored and removed before the
    // interruption; the destination holds the pre-image.

    fs::remove_file(&side.marker)
        .fs_context(|| format!("Failed to remove marker: {}", side.marker.display()))
}

/// Truncate-and-write `path` in place, then fsync. The inode is kept when the
/// file exists; `perm` applies only on creation.
fn write_synced(path: &Path, data: &[u8], perm: u32) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    set_mode(&mut options, perm);

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn hash8(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = format!("{:x}", hasher.finalize());
    digest[..8].to_string()
}

/// Human-readable hint of a file name, safe to embed in another file name.
fn pretty16(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(16)
        .collect()
}
