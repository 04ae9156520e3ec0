// File-backed credentials backend over the Docker `config.json` layout
//
// Identifiers bound in `credHelpers`, or every identifier when `credsStore` is
// set, are delegated to external helpers. Everything else lives in `auths`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::credentials::{AuthStore, Credentials};
use super::helper::{Helper, HELPER_PREFIX};
use crate::error::{BoxError, Error, FsResultExt, Result};
use crate::filesystem::{self, OpsDir};

pub const CONFIG_FILE_NAME: &str = "config.json";

const CONFIG_FILE_PERM: u32 = 0o600;
const CONFIG_DIR_PERM: u32 = 0o700;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthEntry {
    /// base64 of `username:password`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub serveraddress: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identitytoken: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registrytoken: String,
}

impl AuthEntry {
    fn to_credentials(&self) -> std::result::Result<Credentials, BoxError> {
        let (username, password) = if self.auth.is_empty() {
            (self.username.clone(), self.password.clone())
        } else {
            decode_auth(&self.auth)?
        };
        Ok(Credentials {
            username,
            password,
            identity_token: self.identitytoken.clone(),
            registry_token: self.registrytoken.clone(),
            server_address: self.serveraddress.clone(),
        })
    }

    fn from_credentials(credentials: &Credentials) -> Self {
        let auth = if credentials.username.is_empty() && credentials.password.is_empty() {
            String::new()
        } else {
            BASE64.encode(format!("{}:{}", credentials.username, credentials.password))
        };
        Self {
            auth,
            serveraddress: credentials.server_address.clone(),
            identitytoken: credentials.identity_token.clone(),
            registrytoken: credentials.registry_token.clone(),
            ..Default::default()
        }
    }
}

fn decode_auth(auth: &str) -> std::result::Result<(String, String), BoxError> {
    let decoded = BASE64.decode(auth.trim())?;
    let decoded = String::from_utf8(decoded)?;
    match decoded.split_once(':') {
        Some((username, password)) => Ok((username.to_string(), password.to_string())),
        None => Err("invalid auth configuration: missing ':' separator".into()),
    }
}

/// The parts of `config.json` this crate reads. Other keys are carried along.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub auths: BTreeMap<String, AuthEntry>,
    #[serde(
        rename = "credsStore",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub creds_store: String,
    #[serde(
        rename = "credHelpers",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub cred_helpers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl ConfigFile {
    /// Helper name serving `identifier`, if any
    pub fn helper_for(&self, identifier: &str) -> Option<&str> {
        self.cred_helpers
            .get(identifier)
            .map(String::as_str)
            .or(Some(self.creds_store.as_str()))
            .filter(|name| !name.is_empty())
    }

    fn parse(data: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(data)
    }
}

/// `AuthStore` reading and writing `<dir>/config.json`.
///
/// Every rewrite holds an exclusive lock on `dir`, re-reads the file, applies
/// its change and commits in place through the backup-and-rollback writer, so
/// a bind-mounted `config.json` keeps its inode.
pub struct DockerConfigStore {
    dir: PathBuf,
    ops: OpsDir,
    helper_dir: Option<PathBuf>,
}

impl DockerConfigStore {
    /// Open the credentials file under `dir`, which need not exist yet.
    pub fn open(dir: impl Into<PathBuf>, ops: OpsDir) -> Result<Self> {
        let store = Self {
            dir: dir.into(),
            ops,
            helper_dir: None,
        };
        store.load()?;
        Ok(store)
    }

    /// Resolve helper programs inside `dir` instead of through `PATH`.
    pub fn with_helper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.helper_dir = Some(dir.into());
        self
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE_NAME)
    }

    /// Helper name serving `identifier`, if any
    pub fn helper_name(&self, identifier: &str) -> Result<Option<String>> {
        Ok(self.load()?.helper_for(identifier).map(str::to_string))
    }

    /// Current contents of the credentials file.
    ///
    /// An interrupted write left behind by another process is healed first,
    /// so readers never see a half-written file.
    pub fn load(&self) -> Result<ConfigFile> {
        if !self.dir.is_dir() {
            return Ok(ConfigFile::default());
        }

        let path = self.config_path();
        let marker = self.ops.side_paths(&path)?.marker;

        // The marker is only meaningful while writers are excluded
        let read = filesystem::with_read_only_lock(&self.dir, || {
            if marker.exists() {
                return Ok(None);
            }
            read_config(&path).map(Some)
        })?;

        let data = match read {
            Some(data) => data,
            None => {
                debug!("Recovering interrupted write of {}", path.display());
                filesystem::with_lock(&self.dir, || {
                    self.ops.recover(&path)?;
                    read_config(&path)
                })?
            }
        };

        ConfigFile::parse(&data).map_err(|e| Error::UnableToInstantiate {
            path: path.clone(),
            source: Box::new(e),
        })
    }

    /// Apply `change` to the file under the directory lock.
    pub fn update(&self, change: impl FnOnce(&mut ConfigFile)) -> Result<()> {
        ensure_dir(&self.dir)?;
        let path = self.config_path();

        filesystem::with_lock(&self.dir, || {
            // Read after the write lock is held so concurrent updates merge
            self.ops.recover(&path)?;
            let data = read_config(&path)?;
            let mut config = ConfigFile::parse(&data).map_err(|e| Error::UnableToInstantiate {
                path: path.clone(),
                source: Box::new(e),
            })?;

            change(&mut config);

            let data = serde_json::to_vec_pretty(&config).map_err(|e| {
                Error::filesystem(format!("Failed to encode {}", path.display()), e)
            })?;
            self.ops
                .write_file_with_rollback(&path, &data, CONFIG_FILE_PERM)?
                .commit()
        })
    }

    fn helper(&self, name: &str) -> Helper {
        match &self.helper_dir {
            Some(dir) => Helper::with_program(
                name,
                dir.join(format!("{}{}", HELPER_PREFIX, name))
                    .to_string_lossy()
                    .to_string(),
            ),
            None => Helper::new(name),
        }
    }
}

impl AuthStore for DockerConfigStore {
    fn get(&self, identifier: &str) -> std::result::Result<Credentials, BoxError> {
        let config = self.load()?;
        if let Some(name) = config.helper_for(identifier) {
            debug!("Using credential helper {} for {}", name, identifier);
            return self.helper(name).get(identifier);
        }

        match config.auths.get(identifier) {
            Some(entry) => entry.to_credentials(),
            None => Ok(Credentials::default()),
        }
    }

    fn store(
        &self,
        identifier: &str,
        credentials: &Credentials,
    ) -> std::result::Result<(), BoxError> {
        let config = self.load()?;
        if let Some(name) = config.helper_for(identifier) {
            debug!("Using credential helper {} for {}", name, identifier);
            self.helper(name).store(identifier, credentials)?;
            // Keep a bare entry so other tools know the server is logged in
            if config.cred_helpers.get(identifier).is_none() {
                self.update(|config| {
                    config
                        .auths
                        .insert(identifier.to_string(), AuthEntry::default());
                })?;
            }
            return Ok(());
        }

        let entry = AuthEntry::from_credentials(credentials);
        self.update(|config| {
            config.auths.insert(identifier.to_string(), entry);
        })?;
        Ok(())
    }

    fn erase(&self, identifier: &str) -> std::result::Result<(), BoxError> {
        let config = self.load()?;
        if let Some(name) = config.helper_for(identifier) {
            self.helper(name).erase(identifier)?;
        }
        if config.auths.contains_key(identifier) {
            self.update(|config| {
                config.auths.remove(identifier);
            })?;
        }
        Ok(())
    }

    fn list(&self) -> std::result::Result<Vec<String>, BoxError> {
        let config = self.load()?;
        let mut identifiers: Vec<String> = config.auths.keys().cloned().collect();
        identifiers.extend(config.cred_helpers.keys().cloned());
        if !config.creds_store.is_empty() {
            identifiers.extend(self.helper(&config.creds_store).list()?);
        }
        identifiers.sort();
        identifiers.dedup();
        Ok(identifiers)
    }

    fn file_location(&self, identifier: &str) -> Option<PathBuf> {
        let config = match self.load() {
            Ok(config) => config,
            Err(e) => {
                debug!("Cannot tell where {} is stored: {}", identifier, e);
                return None;
            }
        };
        if config.helper_for(identifier).is_some() {
            return None;
        }
        Some(std::path::absolute(self.config_path()).unwrap_or_else(|_| self.config_path()))
    }
}

fn read_config(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::filesystem(
            format!("Failed to read {}", path.display()),
            e,
        )),
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(CONFIG_DIR_PERM);
    }
    #[cfg(not(unix))]
    let _ = CONFIG_DIR_PERM;
    builder
        .create(dir)
        .fs_context(|| format!("Failed to create {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::credentials::CredentialStore;
    use crate::registry::url::RegistryUrl;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(temp_dir: &TempDir) -> DockerConfigStore {
        let ops = OpsDir::new(temp_dir.path().join("ops")).unwrap();
        DockerConfigStore::open(temp_dir.path().join("docker"), ops).unwrap()
    }

    fn write_config(temp_dir: &TempDir, contents: &str) {
        let dir = temp_dir.path().join("docker");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILE_NAME), contents).unwrap();
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        assert!(store.get("quay.io:443").unwrap().is_empty());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_reads_docker_layout() {
        let temp_dir = TempDir::new().unwrap();
        // "hubuser:hubpass"
        write_config(
            &temp_dir,
            r#"{"auths": {"https://index.docker.io/v1/": {"auth": "aHVidXNlcjpodWJwYXNz"}}}"#,
        );
        let backend = Arc::new(open(&temp_dir));
        let store = CredentialStore::new(backend);

        let url = RegistryUrl::parse("registry-1.docker.io").unwrap();
        let credentials = store.retrieve(&url, true).unwrap();
        assert_eq!(credentials.username, "hubuser");
        assert_eq!(credentials.password, "hubpass");
    }

    #[test]
    fn test_store_and_preserve_unknown_keys() {
        let temp_dir = TempDir::new().unwrap();
        write_config(
            &temp_dir,
            r#"{"psFormat": "table {{.ID}}", "auths": {"quay.io:443": {"auth": "YTpi"}}}"#,
        );
        let store = open(&temp_dir);

        let credentials = Credentials {
            username: "alice".to_string(),
            password: "pa:ss".to_string(),
            server_address: "ghcr.io:443".to_string(),
            ..Default::default()
        };
        store.store("ghcr.io:443", &credentials).unwrap();

        let config = store.load().unwrap();
        assert_eq!(
            config.other.get("psFormat"),
            Some(&serde_json::Value::String("table {{.ID}}".to_string()))
        );
        assert!(config.auths.contains_key("quay.io:443"));

        let fetched = store.get("ghcr.io:443").unwrap();
        assert_eq!(fetched.username, "alice");
        assert_eq!(fetched.password, "pa:ss");
        assert_eq!(fetched.server_address, "ghcr.io:443");
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_keeps_inode_and_mode() {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let temp_dir = TempDir::new().unwrap();
        write_config(&temp_dir, "{}");
        let store = open(&temp_dir);
        let before = fs::metadata(store.config_path()).unwrap().ino();

        store
            .store(
                "quay.io:443",
                &Credentials {
                    username: "a".to_string(),
                    password: "b".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let metadata = fs::metadata(store.config_path()).unwrap();
        assert_eq!(metadata.ino(), before);
        assert!(store.get("quay.io:443").unwrap().username == "a");

        // A fresh file is created owner-only
        fs::remove_file(store.config_path()).unwrap();
        store.store("quay.io:443", &Credentials::default()).unwrap();
        let mode = fs::metadata(store.config_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_erase() {
        let temp_dir = TempDir::new().unwrap();
        write_config(
            &temp_dir,
            r#"{"auths": {"quay.io:443": {"auth": "YTpi"}, "quay.io": {"auth": "YTpi"}}}"#,
        );
        let store = open(&temp_dir);

        store.erase("quay.io:443").unwrap();
        // Erasing an absent identifier is not an error
        store.erase("https://quay.io:443").unwrap();
        assert_eq!(store.list().unwrap(), vec!["quay.io".to_string()]);
    }

    #[test]
    fn test_identity_token_kept() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        store
            .store(
                "ghcr.io:443",
                &Credentials {
                    identity_token: "refresh".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let config = store.load().unwrap();
        let entry = config.auths.get("ghcr.io:443").unwrap();
        assert!(entry.auth.is_empty());
        assert_eq!(entry.identitytoken, "refresh");
    }

    #[test]
    fn test_unparsable_file() {
        let temp_dir = TempDir::new().unwrap();
        write_config(&temp_dir, "{ not json");
        let ops = OpsDir::new(temp_dir.path().join("ops")).unwrap();
        let err = DockerConfigStore::open(temp_dir.path().join("docker"), ops)
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnableToInstantiate);
    }

    #[test]
    fn test_reader_heals_interrupted_write() {
        let temp_dir = TempDir::new().unwrap();
        write_config(&temp_dir, r#"{"auths": {"quay.io:443": {"auth": "YTpi"}}}"#);
        let store = open(&temp_dir);
        let path = store.config_path();

        // Simulate a writer that died after backing up and truncating
        let side = store.ops.side_paths(&path).unwrap();
        fs::copy(&path, &side.backup).unwrap();
        fs::write(&side.marker, b"").unwrap();
        fs::write(&path, b"{ \"au").unwrap();

        let credentials = store.get("quay.io:443").unwrap();
        assert_eq!(credentials.username, "a");
        assert!(!side.marker.exists());
        assert!(!side.backup.exists());
    }

    #[test]
    fn test_reader_waiting_on_killed_writer_sees_pre_image() {
        let temp_dir = TempDir::new().unwrap();
        write_config(&temp_dir, r#"{"auths": {"quay.io:443": {"auth": "YTpi"}}}"#);
        let store = Arc::new(open(&temp_dir));
        let path = store.config_path();
        let side = store.ops.side_paths(&path).unwrap();

        // A writer holds the directory lock before the reader starts
        let writer = filesystem::lock(temp_dir.path().join("docker")).unwrap();

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || store.get("quay.io:443").unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(100));

        // ...then dies after backing up and truncating
        fs::copy(&path, &side.backup).unwrap();
        fs::write(&side.marker, b"").unwrap();
        fs::write(&path, b"{ \"au").unwrap();
        drop(writer);

        let credentials = reader.join().unwrap();
        assert_eq!(credentials.username, "a");
        assert!(!side.marker.exists());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            r#"{"auths": {"quay.io:443": {"auth": "YTpi"}}}"#
        );
    }

    #[test]
    fn test_file_location_unknown_when_unreadable() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir);
        write_config(&temp_dir, "not json");
        assert_eq!(store.file_location("quay.io:443"), None);
    }

    #[test]
    fn test_concurrent_stores_merge() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(open(&temp_dir));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let credentials = Credentials {
                        username: format!("user{}", i),
                        password: "pw".to_string(),
                        ..Default::default()
                    };
                    store
                        .store(&format!("registry{}.example.com:443", i), &credentials)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 8);
    }

    #[test]
    fn test_helper_routing() {
        let config: ConfigFile = serde_json::from_str(
            r#"{"credsStore": "desktop", "credHelpers": {"gcr.io": "gcloud"}}"#,
        )
        .unwrap();
        assert_eq!(config.helper_for("gcr.io"), Some("gcloud"));
        assert_eq!(config.helper_for("quay.io:443"), Some("desktop"));

        let config = ConfigFile::default();
        assert_eq!(config.helper_for("quay.io:443"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_store_through_helper() {
        let temp_dir = TempDir::new().unwrap();
        let helper_dir = temp_dir.path().join("bin");
        fs::create_dir_all(&helper_dir).unwrap();
        crate::registry::helper::tests::fake_helper(&helper_dir);
        write_config(&temp_dir, r#"{"credHelpers": {"registry.example.com:443": "fake"}}"#);
        let store = open(&temp_dir).with_helper_dir(&helper_dir);

        let credentials = Credentials {
            username: "alice".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        };
        store.store("registry.example.com:443", &credentials).unwrap();

        assert_eq!(store.get("registry.example.com:443").unwrap().password, "secret");
        assert!(store.load().unwrap().auths.is_empty());
        assert_eq!(store.file_location("registry.example.com:443"), None);
        assert!(store.file_location("quay.io:443").is_some());
    }
}
