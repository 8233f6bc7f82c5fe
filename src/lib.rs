//! onionup library crate
//!
//! Expose a local file tree or an HTTP origin as a Tor v3 onion service
//! by driving a running Tor daemon over its control port. No public
//! network exposure is required: Tor forwards virtual port 80 to a
//! loopback listener this crate binds and serves.
//!
//! # Modules
//!
//! - [`crypto`] - Ed25519 onion identities and passphrase key derivation
//! - [`error`] - Failure taxonomy for the provisioning pipeline
//! - [`logging`] - Structured logging setup
//! - [`provision`] - Orchestration: parameters in, onion address out
//! - [`serve`] - Reverse-proxy and guarded file-server handlers
//! - [`tor`] - Tor control-port session handling

pub mod crypto;
pub mod error;
pub mod logging;
pub mod provision;
pub mod serve;
pub mod tor;

pub use error::Error;
pub use provision::{provision, Parameters, DEFAULT_CONTROL_ADDR};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
