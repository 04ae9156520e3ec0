use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::store::StoreCommands;
use regauth::{Settings, Store};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save credentials for a registry
    Login {
        /// Registry address (defaults to Docker Hub)
        server: Option<String>,
        #[arg(long, short)]
        username: Option<String>,
        #[arg(long, short, conflicts_with = "password_stdin")]
        password: Option<String>,
        /// Read the password from stdin
        #[arg(long)]
        password_stdin: bool,
    },
    /// Remove saved credentials for a registry
    Logout {
        /// Registry address (defaults to Docker Hub)
        server: Option<String>,
    },
    /// Print the identifiers credentials for a registry are looked up under
    Identifiers {
        /// Registry address
        server: String,
    },
    /// Show the transport options used to reach a registry host
    Resolve {
        /// Registry host, e.g. docker.io or localhost:5000
        host: String,
        /// Default to plain HTTP
        #[arg(long)]
        plain_http: bool,
        /// Disable TLS certificate verification
        #[arg(long)]
        insecure_skip_verify: bool,
        /// Hosts directory root, replaces the configured ones (repeatable)
        #[arg(long = "hosts-dir")]
        hosts_dirs: Vec<PathBuf>,
    },
    /// Print identifiers with stored credentials, for shell completion
    Completion,
    /// Inspect and edit the key/value store
    #[command(subcommand)]
    Store(StoreCommands),
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "regauth=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load().context("Failed to load settings")?;

    // The key/value store doesn't need the credentials file
    let command = match cli.command {
        Commands::Store(store_cmd) => {
            let store = Store::new(
                &settings.data_root,
                regauth::store::DEFAULT_DIR_PERM,
                regauth::store::DEFAULT_FILE_PERM,
            )
            .with_context(|| {
                format!("Failed to open store at {}", settings.data_root.display())
            })?;
            return cli::store::handle_store_command(&store, store_cmd);
        }
        command => command,
    };

    let store = settings.credential_store().with_context(|| {
        format!(
            "Failed to open credentials in {}",
            settings.docker_config_dir.display()
        )
    })?;

    match command {
        Commands::Login {
            server,
            username,
            password,
            password_stdin,
        } => cli::login::handle_login(
            &store,
            server.as_deref(),
            username.as_deref(),
            password.as_deref(),
            password_stdin,
        ),
        Commands::Logout { server } => cli::login::handle_logout(&store, server.as_deref()),
        Commands::Identifiers { server } => cli::login::handle_identifiers(&server),
        Commands::Resolve {
            host,
            plain_http,
            insecure_skip_verify,
            hosts_dirs,
        } => {
            let hosts_dirs = if hosts_dirs.is_empty() {
                settings.hosts_dirs.clone()
            } else {
                hosts_dirs
            };
            cli::resolve::handle_resolve(
                &store,
                &host,
                plain_http,
                insecure_skip_verify,
                hosts_dirs,
            )
        }
        Commands::Completion => cli::login::handle_completion(&store),
        Commands::Store(_) => {
            // Already handled above before opening credentials
            unreachable!("Store commands should have been handled earlier")
        }
    }
}
