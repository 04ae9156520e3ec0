// Hosts-dir resolver - per-host configuration directories (containerd certs.d layout)

use serde::de::IgnoredAny;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::url::{RegistryUrl, STANDARD_HTTPS_PORT};
use crate::error::{Error, FsResultExt, Result};
use crate::filesystem::{validate_for, Platform};

pub const HOSTS_FILE_NAME: &str = "hosts.toml";

/// The hub is configured under `docker.io`, whatever name the URL carries
const HUB_INDEX_HOSTNAME: &str = "index.docker.io";
const HUB_HOSTS_DIR_NAME: &str = "docker.io";

const DEFAULT_CAPABILITIES: &[&str] = &["pull", "resolve", "push"];

/// Find the first directory under `roots` holding a `hosts.toml` for `url`.
///
/// Each root is searched for `<host:port>` and then, on the standard HTTPS
/// port, for the bare `<hostname>`. Missing roots are skipped.
pub fn host_dir_from_roots(url: &RegistryUrl, roots: &[PathBuf]) -> Result<Option<PathBuf>> {
    let hostname = match url.hostname() {
        HUB_INDEX_HOSTNAME => HUB_HOSTS_DIR_NAME,
        hostname => hostname,
    };
    let with_port = format!("{}:{}", hostname, url.port());

    for root in roots {
        match fs::metadata(root) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                warn!("Hosts directory {} is not a directory, skipping", root.display());
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Hosts directory {} does not exist, skipping", root.display());
                continue;
            }
            Err(e) => {
                return Err(Error::filesystem(
                    format!("Failed to stat hosts directory {}", root.display()),
                    e,
                ))
            }
        }

        match host_dir_from_root(root, &with_port) {
            Ok(dir) => return Ok(Some(dir)),
            Err(e) if e.is_not_found() && url.port() == STANDARD_HTTPS_PORT => {}
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }

        match host_dir_from_root(root, hostname) {
            Ok(dir) => return Ok(Some(dir)),
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(None)
}

fn host_dir_from_root(root: &Path, name: &str) -> Result<PathBuf> {
    // Directory names are compared as on Linux, where ':' is legal
    validate_for(name, Platform::Posix)?;

    let dir = root.join(name);
    let not_found = || Error::NotFound(dir.display().to_string());

    match fs::metadata(&dir) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => return Err(not_found()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => {
            return Err(Error::filesystem(
                format!("Failed to stat {}", dir.display()),
                e,
            ))
        }
    }

    match fs::metadata(dir.join(HOSTS_FILE_NAME)) {
        Ok(metadata) if metadata.is_file() => {
            debug!("Found hosts directory {}", dir.display());
            Ok(dir)
        }
        Ok(_) => Err(not_found()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
        Err(e) => Err(Error::filesystem(
            format!("Failed to stat {}", dir.join(HOSTS_FILE_NAME).display()),
            e,
        )),
    }
}

/// `ca` accepts a single path or a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Paths {
    One(String),
    Many(Vec<String>),
}

fn into_paths(paths: Option<Paths>) -> Vec<String> {
    match paths {
        None => Vec::new(),
        Some(Paths::One(path)) => vec![path],
        Some(Paths::Many(paths)) => paths,
    }
}

#[derive(Debug, Deserialize)]
struct RawHostsFile {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    skip_verify: Option<bool>,
    #[serde(default)]
    ca: Option<Paths>,
    // Understood by the transport, not modelled here
    #[serde(default, rename = "client")]
    _client: Option<IgnoredAny>,
    #[serde(default, rename = "header")]
    _header: Option<IgnoredAny>,
    #[serde(default)]
    host: toml::Table,
}

#[derive(Debug, Deserialize)]
struct RawHost {
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    skip_verify: Option<bool>,
    #[serde(default)]
    ca: Option<Paths>,
    #[serde(default)]
    override_path: bool,
    // Understood by the transport, not modelled here
    #[serde(default, rename = "client")]
    _client: Option<IgnoredAny>,
    #[serde(default, rename = "header")]
    _header: Option<IgnoredAny>,
}

/// A mirror or endpoint declared with `[host."<url>"]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub url: String,
    pub capabilities: Vec<String>,
    pub skip_verify: Option<bool>,
    pub ca: Vec<String>,
    pub override_path: bool,
}

/// Parsed `hosts.toml`. Host entries keep their order in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsConfig {
    pub server: Option<String>,
    pub capabilities: Vec<String>,
    pub skip_verify: Option<bool>,
    pub ca: Vec<String>,
    pub hosts: Vec<HostEntry>,
}

impl HostsConfig {
    /// Read `<dir>/hosts.toml`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(HOSTS_FILE_NAME);
        let contents = fs::read_to_string(&path)
            .fs_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&contents)
            .map_err(|e| Error::InvalidArgument(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, toml::de::Error> {
        let value: toml::Value = toml::from_str(contents)?;
        let raw: RawHostsFile = serde_ignored::deserialize(value, |path| {
            warn!("Unknown field in {}: {}", HOSTS_FILE_NAME, path);
        })?;

        let mut hosts = Vec::with_capacity(raw.host.len());
        for (url, value) in raw.host {
            let host: RawHost = serde_ignored::deserialize(value, |path| {
                warn!("Unknown field in {} host {}: {}", HOSTS_FILE_NAME, url, path);
            })?;
            hosts.push(HostEntry {
                url,
                capabilities: capabilities_or_default(host.capabilities),
                skip_verify: host.skip_verify,
                ca: into_paths(host.ca),
                override_path: host.override_path,
            });
        }

        Ok(Self {
            server: raw.server,
            capabilities: capabilities_or_default(raw.capabilities),
            skip_verify: raw.skip_verify,
            ca: into_paths(raw.ca),
            hosts,
        })
    }
}

fn capabilities_or_default(capabilities: Option<Vec<String>>) -> Vec<String> {
    capabilities
        .unwrap_or_else(|| DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect())
}
