// Transport options builder
//
// Composes the registry URL parser, the credential store and the hosts-dir
// resolver into the bundle handed to an image-distribution resolver.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::credentials::{CredentialStore, Credentials};
use super::hosts::host_dir_from_roots;
use super::url::{RegistryUrl, SCHEME_HTTP, SCHEME_HTTPS};
use crate::error::{Error, Result};

/// Name the hub is reached under once a reference is resolved
const HUB_REFERENCE_HOSTNAME: &str = "docker.io";
const HUB_REGISTRY_HOSTNAME: &str = "registry-1.docker.io";

/// Credential callback: registry hostname in, `(username, secret)` out.
/// A username of `""` means the secret is an identity token.
pub type AuthCreds = Arc<dyn Fn(&str) -> Result<(String, String)> + Send + Sync>;

/// Per-host configuration lookup: host in, hosts directory out
pub type HostDirLookup = Arc<dyn Fn(&str) -> Result<Option<PathBuf>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultScheme {
    Http,
    Https,
}

impl DefaultScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefaultScheme::Http => SCHEME_HTTP,
            DefaultScheme::Https => SCHEME_HTTPS,
        }
    }
}

impl fmt::Display for DefaultScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Default)]
pub struct ResolverOptions {
    /// Default to plain HTTP for every host
    pub plain_http: bool,
    pub skip_verify_certs: bool,
    /// Roots searched, in order, for per-host configuration
    pub hosts_dirs: Vec<PathBuf>,
    /// Replaces the credential store lookup
    pub auth_creds: Option<AuthCreds>,
}

/// Everything an image-distribution resolver needs to reach one registry
#[derive(Clone)]
pub struct HostOptions {
    pub host_dir: HostDirLookup,
    pub credentials: AuthCreds,
    /// Set only when certificate verification is disabled
    pub default_tls: Option<TlsConfig>,
    pub default_scheme: DefaultScheme,
    /// File the credentials were read from, when they came from a file
    pub credentials_location: Option<PathBuf>,
}

impl fmt::Debug for HostOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostOptions")
            .field("default_tls", &self.default_tls)
            .field("default_scheme", &self.default_scheme)
            .field("credentials_location", &self.credentials_location)
            .finish_non_exhaustive()
    }
}

/// Build the transport options for `ref_hostname`.
///
/// Unless the caller provides its own callback, credentials are read from
/// `store` here, once.
pub fn new_host_options(
    ref_hostname: &str,
    options: ResolverOptions,
    store: &CredentialStore,
) -> Result<HostOptions> {
    let default_scheme = if options.plain_http || match_localhost(ref_hostname)? {
        DefaultScheme::Http
    } else {
        DefaultScheme::Https
    };

    let default_tls = options.skip_verify_certs.then(|| TlsConfig {
        insecure_skip_verify: true,
    });

    let (credentials, credentials_location) = match options.auth_creds {
        Some(auth_creds) => (auth_creds, None),
        None => {
            let url = RegistryUrl::parse(ref_hostname)?;
            let found = store.retrieve(&url, true)?;
            let location = store.file_storage_location(&url);
            let location =
                (!found.is_empty() && !location.as_os_str().is_empty()).then_some(location);
            (auth_creds_for(ref_hostname, found), location)
        }
    };

    let roots = options.hosts_dirs;
    let host_dir: HostDirLookup = Arc::new(move |host: &str| {
        let url = RegistryUrl::parse(host)?;
        host_dir_from_roots(&url, &roots)
    });

    debug!(
        "Transport options for {}: scheme={}, skip_verify={}",
        ref_hostname,
        default_scheme,
        default_tls.is_some()
    );

    Ok(HostOptions {
        host_dir,
        credentials,
        default_tls,
        default_scheme,
        credentials_location,
    })
}

/// Credential callback answering only for the host `ref_hostname` resolves to.
fn auth_creds_for(ref_hostname: &str, credentials: Credentials) -> AuthCreds {
    let expected = match ref_hostname {
        HUB_REFERENCE_HOSTNAME => HUB_REGISTRY_HOSTNAME.to_string(),
        hostname => hostname.to_string(),
    };

    Arc::new(move |host: &str| {
        if host != expected {
            return Err(Error::HostMismatch {
                expected: expected.clone(),
                actual: host.to_string(),
            });
        }
        if !credentials.identity_token.is_empty() {
            return Ok((String::new(), credentials.identity_token.clone()));
        }
        Ok((credentials.username.clone(), credentials.password.clone()))
    })
}

/// Whether `host` (optionally with a port) names the loopback interface.
pub fn match_localhost(host: &str) -> Result<bool> {
    if host == "::1" || host == "[::1]" {
        return Ok(true);
    }

    let parsed = url::Url::parse(&format!("{}://{}", SCHEME_HTTPS, host)).map_err(|e| {
        Error::UnparsableUrl {
            address: host.to_string(),
            reason: e.to_string(),
        }
    })?;

    Ok(match parsed.host() {
        Some(url::Host::Domain(domain)) => domain == "localhost",
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    })
}
