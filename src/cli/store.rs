use anyhow::{Context, Result};
use std::io::Write;

use regauth::Store;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum StoreCommands {
    /// Print the value stored under a key
    Get {
        /// Key components, outermost group first
        #[arg(required = true)]
        key: Vec<String>,
    },
    /// Store a value under a key
    Set {
        /// Value to store
        value: String,
        /// Key components, outermost group first
        #[arg(required = true)]
        key: Vec<String>,
    },
    /// List the children of a group
    #[command(visible_alias = "ls")]
    List {
        /// Group components (the root when empty)
        key: Vec<String>,
    },
    /// Delete a key or a whole group
    #[command(visible_alias = "rm")]
    Delete {
        #[arg(required = true)]
        key: Vec<String>,
    },
}

pub fn handle_store_command(store: &Store, cmd: StoreCommands) -> Result<()> {
    match cmd {
        StoreCommands::Get { key } => {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            let value = store
                .with_read_lock(|| store.get(&key))
                .with_context(|| format!("Failed to read {}", key.join("/")))?;
            std::io::stdout().write_all(&value)?;
        }
        StoreCommands::Set { value, key } => {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            store
                .with_lock(|| store.set(value.as_bytes(), &key))
                .with_context(|| format!("Failed to write {}", key.join("/")))?;
        }
        StoreCommands::List { key } => {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            let names = store
                .with_read_lock(|| store.list(&key))
                .with_context(|| format!("Failed to list {}", key.join("/")))?;
            for name in names {
                println!("{}", name);
            }
        }
        StoreCommands::Delete { key } => {
            let key: Vec<&str> = key.iter().map(String::as_str).collect();
            store
                .with_lock(|| store.delete(&key))
                .with_context(|| format!("Failed to delete {}", key.join("/")))?;
        }
    }
    Ok(())
}
