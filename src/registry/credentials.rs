// Credential store - maps registry URLs onto the identifiers of a shared
// credentials backend
//
// Fresh credentials are always written under the canonical identifier, while
// lookups also walk the legacy identifiers older tools may have used.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::url::RegistryUrl;
use crate::error::{BoxError, Error, Result};

/// A credentials record as held by the credentials file or a helper.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub identity_token: String,
    pub registry_token: String,
    /// Diagnostic breadcrumb, never used as a key
    pub server_address: String,
}

impl Credentials {
    /// True when none of the secret-bearing fields are set
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
            && self.password.is_empty()
            && self.identity_token.is_empty()
            && self.registry_token.is_empty()
    }
}

// Secrets stay out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &redacted(&self.password))
            .field("identity_token", &redacted(&self.identity_token))
            .field("registry_token", &redacted(&self.registry_token))
            .field("server_address", &self.server_address)
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Backend holding credentials by identifier.
///
/// Implementations decide per identifier whether a record lives in the
/// credentials file or behind an external helper. A missing identifier is
/// an empty record, not an error.
pub trait AuthStore: Send + Sync {
    fn get(&self, identifier: &str) -> std::result::Result<Credentials, BoxError>;

    fn store(&self, identifier: &str, credentials: &Credentials)
        -> std::result::Result<(), BoxError>;

    fn erase(&self, identifier: &str) -> std::result::Result<(), BoxError>;

    /// Identifiers that currently have a record
    fn list(&self) -> std::result::Result<Vec<String>, BoxError>;

    /// Path of the file holding `identifier`, or `None` when a helper owns it
    fn file_location(&self, identifier: &str) -> Option<PathBuf>;
}

/// Outcome of [`CredentialStore::erase`]
#[derive(Debug, Default)]
pub struct EraseReport {
    pub erased: Vec<String>,
    /// Identifiers whose erase failed, with the failure message
    pub failures: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn AuthStore>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn AuthStore>) -> Self {
        Self { backend }
    }

    /// Look up credentials for `url`, walking every identifier in order.
    ///
    /// With `consult_store` unset nothing is read and the returned record only
    /// carries the server address. The first non-empty record wins.
    pub fn retrieve(&self, url: &RegistryUrl, consult_store: bool) -> Result<Credentials> {
        if !consult_store {
            return Ok(Credentials {
                server_address: url.server_address(),
                ..Default::default()
            });
        }

        let mut last_error = None;
        for identifier in url.all_identifiers() {
            let mut credentials = match self.backend.get(&identifier) {
                Ok(credentials) => credentials,
                Err(source) => {
                    debug!("Failed to read credentials for {}: {}", identifier, source);
                    last_error = Some(Error::UnableToRetrieve { identifier, source });
                    continue;
                }
            };

            if credentials.is_empty() {
                continue;
            }

            // Some registries (ECR among them) store records without a
            // server address. Those are still used.
            if credentials.server_address.is_empty() {
                debug!("Credentials for {} carry no server address", identifier);
            }
            if credentials.username.is_empty()
                && credentials.password.is_empty()
                && credentials.identity_token.is_empty()
            {
                warn!(
                    "Credentials for {} only carry a registry token, which is not supported",
                    identifier
                );
            }

            credentials.username = credentials.username.trim().to_string();
            debug!("Found credentials for {} under {}", url, identifier);
            return Ok(credentials);
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(Credentials::default()),
        }
    }

    /// Save `credentials` under the canonical identifier of `url`.
    pub fn store(&self, url: &RegistryUrl, credentials: &Credentials) -> Result<()> {
        let identifier = url.canonical_identifier();
        let mut credentials = credentials.clone();
        credentials.server_address = url.server_address();

        self.backend
            .store(&identifier, &credentials)
            .map_err(|source| Error::UnableToStore { identifier, source })
    }

    /// Erase every identifier of `url`. Succeeds when at least one erase did.
    pub fn erase(&self, url: &RegistryUrl) -> Result<EraseReport> {
        let identifiers = url.all_identifiers();
        let mut report = EraseReport::default();
        let mut last_error = None;

        for identifier in &identifiers {
            match self.backend.erase(identifier) {
                Ok(()) => report.erased.push(identifier.clone()),
                Err(e) => {
                    debug!("Failed to erase credentials for {}: {}", identifier, e);
                    report.failures.push((identifier.clone(), e.to_string()));
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(source) if report.erased.is_empty() => {
                Err(Error::UnableToErase { identifiers, source })
            }
            _ => Ok(report),
        }
    }

    /// File the canonical identifier of `url` is stored in, or an empty path
    /// when a helper owns it.
    pub fn file_storage_location(&self, url: &RegistryUrl) -> PathBuf {
        self.backend
            .file_location(&url.canonical_identifier())
            .unwrap_or_default()
    }

    /// Stored identifiers, for shell completion
    pub fn shell_completion(&self) -> Vec<String> {
        match self.backend.list() {
            Ok(mut identifiers) => {
                identifiers.sort();
                identifiers.dedup();
                identifiers
            }
            Err(e) => {
                warn!("Failed to list stored credentials: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
pub(crate) use tests::MemoryAuthStore;
