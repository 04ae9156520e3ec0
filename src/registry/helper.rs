// External credential helpers (docker-credential-<name>)
//
// Helpers speak a tiny protocol: the verb is the first argument, the request
// goes to stdin (a bare server URL, or JSON for `store`) and the reply comes
// back as JSON on stdout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use super::credentials::Credentials;
use crate::error::BoxError;

/// Program name prefix shared by all helpers
pub const HELPER_PREFIX: &str = "docker-credential-";

/// Username a helper returns when the secret is an identity token
const TOKEN_USERNAME: &str = "<token>";

/// Substring of the reply helpers give for unknown server URLs
const NOT_FOUND_MESSAGE: &str = "credentials not found";

#[derive(Debug, Serialize, Deserialize)]
struct HelperCredentials {
    #[serde(rename = "ServerURL", default)]
    server_url: String,
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// A credential helper program, e.g. `docker-credential-pass`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Helper {
    name: String,
    program: String,
}

impl Helper {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            program: format!("{}{}", HELPER_PREFIX, name),
        }
    }

    /// Use an explicit program path instead of resolving `docker-credential-<name>`.
    pub fn with_program(name: &str, program: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            program: program.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch credentials for `server`. Unknown servers yield an empty record.
    pub fn get(&self, server: &str) -> Result<Credentials, BoxError> {
        let reply = match self.run("get", server.as_bytes()) {
            Ok(reply) => reply,
            Err(e) if e.to_string().contains(NOT_FOUND_MESSAGE) => {
                debug!("Helper {} has no credentials for {}", self.name, server);
                return Ok(Credentials::default());
            }
            Err(e) => return Err(e),
        };

        let reply: HelperCredentials = serde_json::from_slice(&reply)?;
        let mut credentials = Credentials {
            server_address: reply.server_url,
            ..Default::default()
        };
        if reply.username == TOKEN_USERNAME {
            credentials.identity_token = reply.secret;
        } else {
            credentials.username = reply.username;
            credentials.password = reply.secret;
        }
        Ok(credentials)
    }

    pub fn store(&self, server: &str, credentials: &Credentials) -> Result<(), BoxError> {
        let request = if credentials.identity_token.is_empty() {
            HelperCredentials {
                server_url: server.to_string(),
                username: credentials.username.clone(),
                secret: credentials.password.clone(),
            }
        } else {
            HelperCredentials {
                server_url: server.to_string(),
                username: TOKEN_USERNAME.to_string(),
                secret: credentials.identity_token.clone(),
            }
        };
        self.run("store", &serde_json::to_vec(&request)?)?;
        Ok(())
    }

    pub fn erase(&self, server: &str) -> Result<(), BoxError> {
        self.run("erase", server.as_bytes())?;
        Ok(())
    }

    /// Server URLs the helper holds credentials for
    pub fn list(&self) -> Result<Vec<String>, BoxError> {
        let reply = self.run("list", b"")?;
        let servers: BTreeMap<String, String> = serde_json::from_slice(&reply)?;
        Ok(servers.into_keys().collect())
    }

    fn run(&self, verb: &str, input: &[u8]) -> Result<Vec<u8>, BoxError> {
        debug!("Executing: {} {}", self.program, verb);

        let output = Command::new(&self.program)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .and_then(|mut child| {
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(input)?;
                }
                child.wait_with_output()
            })
            .map_err(|e| format!("Failed to execute {} {}: {}", self.program, verb, e))?;

        if !output.status.success() {
            // Helpers report errors on stdout, some on stderr
            let mut message = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if message.is_empty() {
                message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            }
            return Err(format!(
                "{} {} failed with status {}: {}",
                self.program, verb, output.status, message
            )
            .into());
        }

        Ok(output.stdout)
    }
}
