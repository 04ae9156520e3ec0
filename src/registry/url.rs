// Registry URL normalization
//
// Users refer to registries in many ways ("docker.io", "localhost:5000",
// "http://registry.example.com/", ...). Parsing brings all of them to one
// shape with an explicit port, from which the canonical identifier used to
// store credentials, and the legacy identifiers older tools may have stored
// them under, are derived.

use std::fmt;
use url::Url;

use crate::error::{Error, Result};

/// Identifier Docker uses for credentials of the official hub
pub const DOCKER_INDEX_SERVER: &str = "https://index.docker.io/v1/";
/// Query parameter carrying the upstream registry of a mirror
pub const NAMESPACE_QUERY_KEY: &str = "ns";
pub const SCHEME_HTTPS: &str = "https";
pub const SCHEME_HTTP: &str = "http";
pub const SCHEME_NAMESPACED: &str = "experimental-namespaced";
pub const STANDARD_HTTPS_PORT: u16 = 443;

const HUB_HOSTNAMES: &[&str] = &["docker.io", "registry-1.docker.io", "index.docker.io"];
const MAX_NAMESPACE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Https,
    Namespaced,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => SCHEME_HTTPS,
            Scheme::Namespaced => SCHEME_NAMESPACED,
        }
    }
}

/// A parsed registry address. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryUrl {
    scheme: Scheme,
    hostname: String,
    port: u16,
    path: String,
    raw_query: String,
    namespace: Option<Box<RegistryUrl>>,
}

impl RegistryUrl {
    /// Parse a user-supplied registry address.
    ///
    /// - `""` and `"docker.io"` mean the hub index
    /// - a missing scheme means `https`; `http` is accepted and rewritten to
    ///   `https`, since plain HTTP is decided by the transport, not here
    /// - a missing port means 443
    /// - an `ns` query parameter is parsed as the namespace (upstream) of a
    ///   mirror
    pub fn parse(address: &str) -> Result<Self> {
        Self::parse_nested(address, 0)
    }

    fn parse_nested(address: &str, depth: usize) -> Result<Self> {
        let unparsable = |reason: String| Error::UnparsableUrl {
            address: address.to_string(),
            reason,
        };

        if depth > MAX_NAMESPACE_DEPTH {
            return Err(unparsable("namespaces nested too deeply".to_string()));
        }

        let mut normalized = if address.is_empty() || address == "docker.io" {
            DOCKER_INDEX_SERVER.to_string()
        } else {
            address.to_string()
        };
        if !normalized.contains("://") {
            normalized = format!("{}://{}", SCHEME_HTTPS, normalized);
        }

        let parsed = Url::parse(&normalized).map_err(|e| unparsable(e.to_string()))?;

        let scheme = match parsed.scheme() {
            SCHEME_HTTP | SCHEME_HTTPS => Scheme::Https,
            SCHEME_NAMESPACED => Scheme::Namespaced,
            other => {
                return Err(Error::UnsupportedScheme {
                    address: address.to_string(),
                    scheme: other.to_string(),
                })
            }
        };

        let hostname = parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| unparsable("missing host".to_string()))?
            .to_string();

        // `Url` forgets ports that equal the scheme default, so an explicit
        // ":80" on an http address has to be recovered from the input.
        let port = match parsed.port() {
            Some(port) => port,
            None => explicit_port(&normalized).unwrap_or(STANDARD_HTTPS_PORT),
        };

        let path = match parsed.path() {
            "/" => String::new(),
            path => path.to_string(),
        };
        let raw_query = parsed.query().unwrap_or_default().to_string();

        let namespace = parsed
            .query_pairs()
            .find(|(key, _)| key == NAMESPACE_QUERY_KEY)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .map(|value| Self::parse_nested(&value, depth + 1).map(Box::new))
            .transpose()?;

        Ok(Self {
            scheme,
            hostname,
            port,
            path,
            raw_query,
            namespace,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// `hostname:port`, the port always present
    pub fn host(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Host without the port. IPv6 literals keep their brackets.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    /// The upstream registry when this URL designates a mirror namespace
    pub fn namespace(&self) -> Option<&RegistryUrl> {
        self.namespace.as_deref()
    }

    /// Whether this designates the official hub on the standard port
    pub fn is_docker_hub(&self) -> bool {
        self.namespace.is_none()
            && self.port == STANDARD_HTTPS_PORT
            && HUB_HOSTNAMES.contains(&self.hostname.as_str())
    }

    /// The single identifier fresh credentials are stored under.
    pub fn canonical_identifier(&self) -> String {
        if let Some(namespace) = &self.namespace {
            return format!(
                "{}://{}/host/{}{}",
                SCHEME_NAMESPACED,
                namespace.canonical_identifier(),
                self.host(),
                self.path
            );
        }
        if self.is_docker_hub() {
            return DOCKER_INDEX_SERVER.to_string();
        }
        self.host()
    }

    /// Every identifier credentials for this registry may be stored under,
    /// canonical first, in lookup order.
    pub fn all_identifiers(&self) -> Vec<String> {
        let mut identifiers = vec![self.canonical_identifier()];

        // Namespaced identifiers are new, and the hub has a single fixed
        // identifier: neither has legacy forms.
        if self.namespace.is_some() || self.is_docker_hub() {
            return identifiers;
        }

        let host = self.host();
        identifiers.push(format!("{}://{}", SCHEME_HTTPS, host));
        identifiers.push(format!("{}://{}", SCHEME_HTTP, host));

        // Older tools stored the bare hostname when the port was implied
        if self.port == STANDARD_HTTPS_PORT {
            identifiers.push(self.hostname.clone());
            identifiers.push(format!("{}://{}", SCHEME_HTTPS, self.hostname));
            identifiers.push(format!("{}://{}", SCHEME_HTTP, self.hostname));
        }

        identifiers
    }

    /// Server address recorded next to stored credentials, for diagnostics
    pub(crate) fn server_address(&self) -> String {
        if self.namespace.is_some() {
            format!("{}{}?{}", self.host(), self.path, self.raw_query)
        } else {
            self.canonical_identifier()
        }
    }
}

impl fmt::Display for RegistryUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme.as_str(), self.host(), self.path)?;
        if !self.raw_query.is_empty() {
            write!(f, "?{}", self.raw_query)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for RegistryUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Port written in the authority of `address`, if any.
fn explicit_port(address: &str) -> Option<u16> {
    let rest = address.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    let after_host = match host_port.strip_prefix('[') {
        Some(v6) => v6.split_once(']')?.1,
        None => host_port,
    };
    let (_, port) = after_host.rsplit_once(':')?;
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_io_is_hub_index() {
        for input in ["", "docker.io", "registry-1.docker.io", DOCKER_INDEX_SERVER] {
            let url = RegistryUrl::parse(input).unwrap();
            assert_eq!(url.canonical_identifier(), DOCKER_INDEX_SERVER, "{input:?}");
            assert_eq!(url.all_identifiers(), vec![DOCKER_INDEX_SERVER.to_string()]);
        }
    }

    #[test]
    fn test_hub_on_other_port_is_not_hub() {
        let url = RegistryUrl::parse("registry-1.docker.io:5000").unwrap();
        assert_eq!(url.canonical_identifier(), "registry-1.docker.io:5000");
    }

    #[test]
    fn test_port_is_always_present() {
        let url = RegistryUrl::parse("localhost").unwrap();
        assert_eq!(url.host(), "localhost:443");
        assert_eq!(url.hostname(), "localhost");

        let url = RegistryUrl::parse("registry.example.com:5000").unwrap();
        assert_eq!(url.host(), "registry.example.com:5000");
        assert_eq!(url.port(), 5000);
    }

    #[test]
    fn test_explicit_default_ports_survive() {
        let url = RegistryUrl::parse("http://registry.example.com:80").unwrap();
        assert_eq!(url.host(), "registry.example.com:80");

        let url = RegistryUrl::parse("https://registry.example.com:443/").unwrap();
        assert_eq!(url.host(), "registry.example.com:443");
        assert_eq!(url.path(), "");
    }

    #[test]
    fn test_http_is_rewritten_to_https() {
        let url = RegistryUrl::parse("http://registry.example.com:5000").unwrap();
        assert_eq!(url.scheme(), Scheme::Https);
        assert_eq!(url.to_string(), "https://registry.example.com:5000");
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = RegistryUrl::parse("ftp://registry.example.com").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnsupportedScheme);
    }

    #[test]
    fn test_unparsable() {
        let err = RegistryUrl::parse("https://bad host name").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnparsableUrl);
    }

    #[test]
    fn test_namespaced_mirror() {
        let url =
            RegistryUrl::parse("http://registry.example.com:5000/foo?ns=mirror.example.com")
                .unwrap();
        assert_eq!(
            url.canonical_identifier(),
            "experimental-namespaced://mirror.example.com:443/host/registry.example.com:5000/foo"
        );
        assert_eq!(url.all_identifiers().len(), 1);
        assert_eq!(url.namespace().unwrap().host(), "mirror.example.com:443");
        assert_eq!(
            url.server_address(),
            "registry.example.com:5000/foo?ns=mirror.example.com"
        );
    }

    #[test]
    fn test_namespace_nesting_is_bounded() {
        // Each level wraps the previous one as its `ns` parameter
        let mut address = "innermost.example.com".to_string();
        for i in 0..12 {
            let encoded: String = url::form_urlencoded::byte_serialize(address.as_bytes()).collect();
            address = format!("level{}.example.com?ns={}", i, encoded);
        }
        let err = RegistryUrl::parse(&address).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnparsableUrl);
    }

    #[test]
    fn test_legacy_identifiers_standard_port() {
        let url = RegistryUrl::parse("registry.example.com").unwrap();
        assert_eq!(
            url.all_identifiers(),
            vec![
                "registry.example.com:443",
                "https://registry.example.com:443",
                "http://registry.example.com:443",
                "registry.example.com",
                "https://registry.example.com",
                "http://registry.example.com",
            ]
        );
    }

    #[test]
    fn test_legacy_identifiers_custom_port() {
        let url = RegistryUrl::parse("registry.example.com:5000").unwrap();
        assert_eq!(
            url.all_identifiers(),
            vec![
                "registry.example.com:5000",
                "https://registry.example.com:5000",
                "http://registry.example.com:5000",
            ]
        );
    }

    #[test]
    fn test_canonical_is_first_identifier() {
        for input in [
            "localhost:5000",
            "ghcr.io",
            "http://127.0.0.1",
            "docker.io",
            "[::1]:5000",
            "https://quay.io/v2/?ns=ghcr.io",
        ] {
            let url = RegistryUrl::parse(input).unwrap();
            assert_eq!(url.all_identifiers()[0], url.canonical_identifier());
        }
    }

    #[test]
    fn test_parse_is_idempotent() {
        for input in [
            "",
            "docker.io",
            "registry-1.docker.io",
            "localhost",
            "http://localhost:80",
            "127.0.0.1:5000",
            "[::1]:5000",
            "https://registry.example.com/some/path",
            "http://registry.example.com:5000/foo?ns=mirror.example.com",
            "experimental-namespaced://mirror.example.com:443/host/registry.example.com:5000/foo",
        ] {
            let once = RegistryUrl::parse(input).unwrap();
            let twice = RegistryUrl::parse(&once.to_string()).unwrap();
            assert_eq!(once, twice, "{input:?}");
        }
    }

    #[test]
    fn test_ipv6_host() {
        let url = RegistryUrl::parse("[::1]:5000").unwrap();
        assert_eq!(url.hostname(), "[::1]");
        assert_eq!(url.host(), "[::1]:5000");
    }

    #[test]
    fn test_explicit_port_helper() {
        assert_eq!(explicit_port("http://host:80/path"), Some(80));
        assert_eq!(explicit_port("https://user:pw@host/path"), None);
        assert_eq!(explicit_port("https://[::1]:443"), Some(443));
        assert_eq!(explicit_port("https://[::1]"), None);
    }
}
