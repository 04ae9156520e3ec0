// Filesystem primitives - path validation, advisory locks and atomic writes
//
// Everything that touches shared on-disk state (the key/value store, the
// credentials file) goes through this module so that path components are
// sanitized before any syscall and every mutation is crash-safe.

pub mod lock;
pub mod path;
pub mod rollback;
pub mod write;

pub use lock::{lock, read_only_lock, unlock, with_lock, with_read_only_lock, Locked};
pub use path::{validate, validate_for, Platform};
pub use rollback::{OpsDir, Rollback, SidePaths};
pub use write::write_file;
