//! Failure taxonomy for the provisioning pipeline
//!
//! Every fatal condition up through service creation aborts the whole run.
//! Nothing is retried at this layer.

use crate::tor::ControlError;
use thiserror::Error;

/// Fatal provisioning errors, in pipeline order.
#[derive(Debug, Error)]
pub enum Error {
    /// The target string has a scheme we cannot front, or names a local
    /// path that cannot be served.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Could not open the control channel to the Tor daemon.
    #[error("failed to connect to Tor control port")]
    ControlConnect(#[source] std::io::Error),

    /// The daemon rejected our control-port credentials.
    #[error("Tor control port authentication failed")]
    Authentication(#[source] ControlError),

    /// Passphrase-based key material could not be derived.
    #[error("unable to derive onion key material: {0}")]
    KeyDerivation(String),

    /// The loopback listener could not be bound or its port read back.
    #[error("failed to allocate local listener")]
    ListenerAllocation(#[source] std::io::Error),

    /// ADD_ONION failed, or publication was never confirmed.
    #[error("failed to create onion service")]
    ServiceCreation(#[source] ControlError),

    /// The control channel died after the service went live.
    #[error("lost connection to Tor")]
    ChannelLost(#[source] ControlError),

    /// The HTTP accept loop failed while the service was live.
    #[error("cannot serve HTTP")]
    Serve(#[source] std::io::Error),
}
