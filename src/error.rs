// Error type shared by every component of the credential and resolver layer

use std::path::PathBuf;

/// Boxed cause carried by errors that wrap a collaborator failure
/// (credential helpers, config file parsing, nested crate errors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Semantic classification of an [`Error`].
///
/// Callers branch on the kind rather than on the concrete variant, since
/// several variants map to the same kind (for example an invalid path
/// component is an `InvalidArgument`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    UnparsableUrl,
    UnsupportedScheme,
    FilesystemFailure,
    LockFail,
    UnlockFail,
    LockIsNil,
    UnableToInstantiate,
    UnableToRetrieve,
    UnableToStore,
    UnableToErase,
    FaultyImplementation,
    HostMismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid path component {component:?}: {reason}")]
    InvalidPath {
        component: String,
        reason: &'static str,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unparsable registry url {address:?}: {reason}")]
    UnparsableUrl { address: String, reason: String },

    #[error("unsupported scheme {scheme:?} in registry url {address:?}")]
    UnsupportedScheme { address: String, scheme: String },

    #[error("filesystem failure: {context}")]
    Filesystem {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to lock {}", path.display())]
    LockFail {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to unlock {}", path.display())]
    UnlockFail {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot release a lock that is not held")]
    LockIsNil,

    #[error("unable to load credentials configuration from {}", path.display())]
    UnableToInstantiate {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("unable to retrieve credentials for {identifier:?}")]
    UnableToRetrieve {
        identifier: String,
        #[source]
        source: BoxError,
    },

    #[error("unable to store credentials for {identifier:?}")]
    UnableToStore {
        identifier: String,
        #[source]
        source: BoxError,
    },

    #[error("unable to erase credentials for {identifiers:?}")]
    UnableToErase {
        identifiers: Vec<String>,
        #[source]
        source: BoxError,
    },

    #[error("faulty implementation: {0}")]
    FaultyImplementation(String),

    #[error("expected registry host {expected:?}, got {actual:?}")]
    HostMismatch { expected: String, actual: String },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::InvalidPath { .. } => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::UnparsableUrl { .. } => ErrorKind::UnparsableUrl,
            Error::UnsupportedScheme { .. } => ErrorKind::UnsupportedScheme,
            Error::Filesystem { .. } => ErrorKind::FilesystemFailure,
            Error::LockFail { .. } => ErrorKind::LockFail,
            Error::UnlockFail { .. } => ErrorKind::UnlockFail,
            Error::LockIsNil => ErrorKind::LockIsNil,
            Error::UnableToInstantiate { .. } => ErrorKind::UnableToInstantiate,
            Error::UnableToRetrieve { .. } => ErrorKind::UnableToRetrieve,
            Error::UnableToStore { .. } => ErrorKind::UnableToStore,
            Error::UnableToErase { .. } => ErrorKind::UnableToErase,
            Error::FaultyImplementation(_) => ErrorKind::FaultyImplementation,
            Error::HostMismatch { .. } => ErrorKind::HostMismatch,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.kind() == ErrorKind::InvalidArgument
    }

    pub fn is_faulty_implementation(&self) -> bool {
        self.kind() == ErrorKind::FaultyImplementation
    }

    pub fn is_filesystem_failure(&self) -> bool {
        self.kind() == ErrorKind::FilesystemFailure
    }

    /// Wrap an underlying filesystem error with a short description of the
    /// operation that failed.
    pub(crate) fn filesystem(context: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::Filesystem {
            context: context.into(),
            source: source.into(),
        }
    }
}

/// Extension trait to turn `io::Result` into a `FilesystemFailure` with context,
/// in the spirit of `anyhow::Context`.
pub(crate) trait FsResultExt<T> {
    fn fs_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> FsResultExt<T> for std::io::Result<T> {
    fn fs_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| Error::filesystem(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_path_is_invalid_argument() {
        let err = Error::InvalidPath {
            component: "..".to_string(),
            reason: "traversal component",
        };
        assert!(err.is_invalid_argument());
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_fs_context_preserves_source() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = result.fs_context(|| "writing file").unwrap_err();
        assert!(err.is_filesystem_failure());
        assert_eq!(err.to_string(), "filesystem failure: writing file");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "denied");
    }
}
