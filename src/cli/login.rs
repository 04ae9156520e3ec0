use anyhow::{bail, Context, Result};
use std::io::BufRead;
use tracing::{info, warn};

use regauth::registry::{CredentialStore, Credentials, RegistryUrl};

/// Read a password from stdin, dropping the trailing newline
fn read_password_stdin() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub fn handle_login(
    store: &CredentialStore,
    server: Option<&str>,
    username: Option<&str>,
    password: Option<&str>,
    password_stdin: bool,
) -> Result<()> {
    let url = RegistryUrl::parse(server.unwrap_or_default())
        .context("Failed to parse registry address")?;

    let password = match (password, password_stdin) {
        (Some(password), false) => {
            warn!("Using --password on the command line is insecure, use --password-stdin");
            password.to_string()
        }
        (None, true) => read_password_stdin()?,
        _ => bail!("Either --password or --password-stdin must be given"),
    };
    let Some(username) = username.filter(|u| !u.trim().is_empty()) else {
        bail!("A username is required");
    };

    let credentials = Credentials {
        username: username.trim().to_string(),
        password,
        ..Default::default()
    };
    store
        .store(&url, &credentials)
        .with_context(|| format!("Failed to store credentials for {}", url))?;

    let location = store.file_storage_location(&url);
    if location.as_os_str().is_empty() {
        info!("Credentials for {} saved via credential helper", url.canonical_identifier());
    } else {
        info!(
            "Credentials for {} saved to {}",
            url.canonical_identifier(),
            location.display()
        );
    }
    println!("Login Succeeded");
    Ok(())
}

pub fn handle_logout(store: &CredentialStore, server: Option<&str>) -> Result<()> {
    let url = RegistryUrl::parse(server.unwrap_or_default())
        .context("Failed to parse registry address")?;

    println!("Removing login credentials for {}", url.canonical_identifier());
    let report = store
        .erase(&url)
        .with_context(|| format!("Failed to remove credentials for {}", url))?;

    for (identifier, error) in &report.failures {
        warn!("Could not erase {}: {}", identifier, error);
    }
    Ok(())
}

pub fn handle_identifiers(server: &str) -> Result<()> {
    let url = RegistryUrl::parse(server).context("Failed to parse registry address")?;
    for identifier in url.all_identifiers() {
        println!("{}", identifier);
    }
    Ok(())
}

pub fn handle_completion(store: &CredentialStore) -> Result<()> {
    for identifier in store.shell_completion() {
        println!("{}", identifier);
    }
    Ok(())
}
