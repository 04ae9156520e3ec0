//! Registry credential and resolver layer for Docker-compatible container CLIs.
//!
//! The crate normalizes user-entered registry addresses, finds and saves
//! credentials in the shared Docker `config.json` (or behind credential
//! helpers), locates per-host `hosts.toml` directories and assembles the
//! transport options an image-distribution resolver consumes.
//!
//! Shared on-disk state is only ever mutated through [`filesystem`], which
//! provides advisory locks and crash-safe writers.

pub mod error;
pub mod filesystem;
pub mod registry;
pub mod settings;
pub mod store;

pub use error::{Error, ErrorKind, Result};
pub use settings::Settings;
pub use store::Store;
