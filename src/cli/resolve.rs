use anyhow::{Context, Result};
use std::path::PathBuf;

use regauth::registry::{new_host_options, CredentialStore, RegistryUrl, ResolverOptions};

pub fn handle_resolve(
    store: &CredentialStore,
    host: &str,
    plain_http: bool,
    insecure_skip_verify: bool,
    hosts_dirs: Vec<PathBuf>,
) -> Result<()> {
    let options = ResolverOptions {
        plain_http,
        skip_verify_certs: insecure_skip_verify,
        hosts_dirs,
        auth_creds: None,
    };
    let host_options = new_host_options(host, options, store)
        .with_context(|| format!("Failed to build transport options for {}", host))?;

    let url = RegistryUrl::parse(host)?;
    let host_dir = (host_options.host_dir)(&url.host())
        .with_context(|| format!("Failed to look up hosts directory for {}", host))?;
    let found = !store.retrieve(&url, true)?.is_empty();

    println!("Registry:     {}", url.canonical_identifier());
    println!("Scheme:       {}", host_options.default_scheme);
    println!(
        "Skip verify:  {}",
        host_options
            .default_tls
            .map(|tls| tls.insecure_skip_verify)
            .unwrap_or(false)
    );
    match host_dir {
        Some(dir) => println!("Hosts dir:    {}", dir.display()),
        None => println!("Hosts dir:    (none)"),
    }
    match (found, host_options.credentials_location) {
        (true, Some(location)) => println!("Credentials:  found in {}", location.display()),
        (true, None) => println!("Credentials:  found via credential helper"),
        (false, _) => println!("Credentials:  (none)"),
    }
    Ok(())
}
