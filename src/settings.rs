use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::filesystem::OpsDir;
use crate::registry::{CredentialStore, DockerConfigStore};

/// Prefix of environment variables overriding settings, e.g. `REGAUTH_OPS_DIR`
const ENV_PREFIX: &str = "REGAUTH";
/// Points at an alternative settings file
const CONFIG_FILE_ENV: &str = "REGAUTH_CONFIG";
/// Docker's own override for the directory holding `config.json`
const DOCKER_CONFIG_ENV: &str = "DOCKER_CONFIG";

const APP_DIR_NAME: &str = "regauth";

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Directory holding the Docker `config.json` credentials file
    #[serde(default = "default_docker_config_dir")]
    pub docker_config_dir: PathBuf,

    /// Where interrupted-write markers and backups are kept
    #[serde(default = "default_ops_dir")]
    pub ops_dir: PathBuf,

    /// Roots searched, in order, for per-host `hosts.toml` directories
    #[serde(default = "default_hosts_dirs")]
    pub hosts_dirs: Vec<PathBuf>,

    /// Root of the key/value store
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            docker_config_dir: default_docker_config_dir(),
            ops_dir: default_ops_dir(),
            hosts_dirs: default_hosts_dirs(),
            data_root: default_data_root(),
        }
    }
}

fn default_docker_config_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(".docker")
}

fn data_local_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join(APP_DIR_NAME)
}

fn default_ops_dir() -> PathBuf {
    data_local_dir().join("ops")
}

fn default_data_root() -> PathBuf {
    data_local_dir().join("store")
}

fn default_hosts_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if !is_root() {
        if let Some(config_dir) = dirs::config_dir() {
            dirs.push(config_dir.join("containerd").join("certs.d"));
        }
    }
    dirs.push(PathBuf::from("/etc/containerd/certs.d"));
    dirs.push(PathBuf::from("/etc/docker/certs.d"));
    dirs
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Default location of the settings file
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
}

impl Settings {
    /// Load settings from the settings file, `REGAUTH_*` variables and
    /// `DOCKER_CONFIG`, in increasing precedence.
    pub fn load() -> Result<Self, ConfigError> {
        let (file, required) = match env::var_os(CONFIG_FILE_ENV) {
            Some(path) if !path.is_empty() => (Some(PathBuf::from(path)), true),
            _ => (default_config_file(), false),
        };

        let vars: config::Map<String, String> = env::vars()
            .filter(|(key, _)| key != CONFIG_FILE_ENV)
            .collect();

        let mut settings = Self::from_sources(file.as_deref(), required, vars)?;

        if let Some(dir) = env::var_os(DOCKER_CONFIG_ENV).filter(|dir| !dir.is_empty()) {
            settings.docker_config_dir = PathBuf::from(dir);
        }

        Ok(settings)
    }

    /// Build settings from an explicit file and set of environment variables.
    pub fn from_sources(
        file: Option<&Path>,
        required: bool,
        vars: config::Map<String, String>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = file {
            if required || path.exists() {
                tracing::debug!("Loading config file: {}", path.display());
                builder = builder.add_source(
                    File::new(&path.to_string_lossy(), FileFormat::Toml).required(required),
                );
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("hosts_dirs")
                .source(Some(vars)),
        );

        let config = builder.build()?;

        // Deserialize and collect unused fields
        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(config, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field: {}", field);
        }

        Ok(settings)
    }

    /// Operations directory, created owner-only if missing
    pub fn ops(&self) -> crate::Result<OpsDir> {
        OpsDir::new(&self.ops_dir)
    }

    /// Credential store over the configured Docker `config.json`
    pub fn credential_store(&self) -> crate::Result<CredentialStore> {
        let backend = DockerConfigStore::open(&self.docker_config_dir, self.ops()?)?;
        Ok(CredentialStore::new(Arc::new(backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_sources(None, false, vars(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.docker_config_dir.ends_with(".docker"));
        assert!(settings
            .hosts_dirs
            .contains(&PathBuf::from("/etc/containerd/certs.d")));
    }

    #[test]
    fn test_file_then_env() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
docker_config_dir = "/srv/docker"
ops_dir = "/srv/ops"
hosts_dirs = ["/srv/certs.d"]
"#,
        )
        .unwrap();

        let settings = Settings::from_sources(
            Some(&path),
            true,
            vars(&[
                ("REGAUTH_OPS_DIR", "/var/lib/regauth/ops"),
                ("UNRELATED", "ignored"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.docker_config_dir, PathBuf::from("/srv/docker"));
        assert_eq!(settings.ops_dir, PathBuf::from("/var/lib/regauth/ops"));
        assert_eq!(settings.hosts_dirs, vec![PathBuf::from("/srv/certs.d")]);
    }

    #[test]
    fn test_env_hosts_dirs_list() {
        let settings = Settings::from_sources(
            None,
            false,
            vars(&[("REGAUTH_HOSTS_DIRS", "/a/certs.d,/b/certs.d")]),
        )
        .unwrap();
        assert_eq!(
            settings.hosts_dirs,
            vec![PathBuf::from("/a/certs.d"), PathBuf::from("/b/certs.d")]
        );
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "data_root = \"/srv/store\"\nnot_a_setting = 1\n").unwrap();

        let settings = Settings::from_sources(Some(&path), true, vars(&[])).unwrap();
        assert_eq!(settings.data_root, PathBuf::from("/srv/store"));
    }

    #[test]
    fn test_missing_required_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("absent.toml");
        assert!(Settings::from_sources(Some(&path), true, vars(&[])).is_err());
        assert!(Settings::from_sources(Some(&path), false, vars(&[])).is_ok());
    }

    #[test]
    fn test_credential_store_from_settings() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            docker_config_dir: temp_dir.path().join("docker"),
            ops_dir: temp_dir.path().join("ops"),
            hosts_dirs: Vec::new(),
            data_root: temp_dir.path().join("store"),
        };

        let store = settings.credential_store().unwrap();
        let url = crate::registry::RegistryUrl::parse("quay.io").unwrap();
        assert!(store.retrieve(&url, true).unwrap().is_empty());
        assert!(settings.ops_dir.is_dir());
    }
}
