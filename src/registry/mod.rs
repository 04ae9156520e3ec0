// Registry credential and resolver layer
//
// A registry string entered by the user is normalized by `url`, credentials
// are looked up through `credentials` (backed by `docker_config` and external
// `helper`s), per-host configuration is located by `hosts`, and `resolver`
// assembles all of it into transport options.

pub mod credentials;
pub mod docker_config;
pub mod helper;
pub mod hosts;
pub mod resolver;
pub mod url;

pub use credentials::{AuthStore, CredentialStore, Credentials, EraseReport};
pub use docker_config::{ConfigFile, DockerConfigStore};
pub use helper::Helper;
pub use hosts::{host_dir_from_roots, HostsConfig};
pub use resolver::{
    match_localhost, new_host_options, AuthCreds, DefaultScheme, HostOptions, ResolverOptions,
    TlsConfig,
};
pub use url::{RegistryUrl, DOCKER_INDEX_SERVER};
