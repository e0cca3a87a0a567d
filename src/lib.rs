//! Differential self-updater.
//!
//! An [`UpdateSession`] checks the host for a newer build, materializes it in
//! a local content-addressed cache by walking published binary patches from
//! the installed build (downloading the full archive when the chain breaks),
//! and swaps it in place of the running installation.

pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod installer;
pub mod manifest;
pub mod patch;
pub mod platform;
pub mod resolver;
pub mod session;
pub mod shell;
pub mod status;
pub mod version_store;

#[cfg(test)]
mod test_support;

pub use config::{PatchTool, UpdaterConfig};
pub use error::{FetchError, Result, UpdateError};
pub use manifest::{Fetch, FetchResponse, ManifestClient, RemoteUpdateManifest};
pub use session::UpdateSession;
pub use status::{StatusEntry, UpdateStatus};
pub use version_store::{LocalVersionRecord, VersionStore};
