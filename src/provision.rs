//! Provisioning orchestration
//!
//! One run = one onion service: select the handler, drive the control
//! session through authentication and service creation, publish the
//! resulting address exactly once, then serve HTTP behind it until the
//! process ends or the control channel is lost.

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::crypto;
use crate::error::Error;
use crate::serve;
use crate::tor::{AddOnionConfig, AddOnionReply, ControlError, OnionKey, TorController};

/// Port exposed on the Tor side of the forwarding rule.
const VIRT_PORT: u16 = 80;

/// Control-port address used when none is configured.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9051";

/// Caller-supplied inputs for one provisioning run. Consumed once.
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    /// Local path or http(s) URL to expose.
    pub target: String,
    /// Package directories as zip archives instead of listings.
    pub zip: bool,
    /// Gate file serving behind a random capability slug.
    pub slug: bool,
    /// Tor control port address; [`DEFAULT_CONTROL_ADDR`] when unset.
    pub control_addr: Option<String>,
    /// Control port auth password, if the daemon requires one.
    pub control_password: Option<String>,
    /// Passphrase for a deterministic onion identity; a fresh key is
    /// generated (and discarded) by the daemon when unset.
    pub passphrase: Option<String>,
}

/// Provision an onion service and serve traffic behind it.
///
/// The externally reachable address is delivered on `link_tx` once the
/// daemon has confirmed descriptor publication - never earlier, and at
/// most once. On success this blocks for the rest of the process
/// lifetime; every fatal condition is returned as a typed [`Error`],
/// with the control channel released on every exit path.
pub async fn provision(params: Parameters, link_tx: oneshot::Sender<Url>) -> Result<(), Error> {
    // Handler selection happens before any external side effect.
    let (handler, link) = serve::select_handler(&params.target, params.slug, params.zip)?;

    let control_addr = params
        .control_addr
        .as_deref()
        .unwrap_or(DEFAULT_CONTROL_ADDR);
    let mut control = TorController::connect(control_addr)
        .await
        .map_err(Error::ControlConnect)?;
    control
        .authenticate(params.control_password.as_deref())
        .await
        .map_err(Error::Authentication)?;

    // A failure between authentication and service creation still owns
    // the session, so it can say goodbye instead of just dropping it.
    let (listener, reply) = match create_service(&mut control, &params).await {
        Ok(created) => created,
        Err(err) => {
            control.quit().await;
            return Err(err);
        }
    };
    info!("onion service live: {}", reply.onion_address);

    // The watcher owns the control connection from here on. A failed
    // event read flips the shutdown signal instead of killing the
    // process, so the serving side can report the reason.
    let (lost_tx, lost_rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            match control.next_event().await {
                Ok(event) => debug!("control event: {}", event),
                Err(err) => {
                    warn!("control channel lost: {}", err);
                    let _ = lost_tx.send(err);
                    return;
                }
            }
        }
    });

    // Publish the reachable address, exactly once, only now that the
    // daemon has confirmed publication.
    let address = format!("http://{}{}", reply.onion_address, link);
    let url = Url::parse(&address).map_err(|err| {
        Error::ServiceCreation(ControlError::Protocol(format!(
            "daemon returned unusable service ID {}: {}",
            reply.service_id, err
        )))
    })?;
    let _ = link_tx.send(url);

    serve::run(listener, handler, lost_rx).await
}

/// Resolve key material, bind the loopback listener, and create the
/// service. Blocks until the network has accepted the descriptor; the
/// key is discarded by the daemon in both modes (derived keys are
/// simply re-derived next run).
async fn create_service(
    control: &mut TorController<tokio::net::TcpStream>,
    params: &Parameters,
) -> Result<(TcpListener, AddOnionReply), Error> {
    let key = match params.passphrase.as_deref() {
        // An empty passphrase means no passphrase; let the daemon
        // generate a fresh key instead of deriving from nothing.
        Some(passphrase) if !passphrase.is_empty() => {
            let identity = crypto::derive_identity(passphrase)?;
            debug!("derived onion identity {}", identity.onion_address());
            OnionKey::Ed25519Expanded(identity.expanded_secret_key())
        }
        _ => OnionKey::New,
    };

    // Loopback-only listener, OS-assigned port. Sole ingress for
    // forwarded traffic.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(Error::ListenerAllocation)?;
    let local_port = listener
        .local_addr()
        .map_err(Error::ListenerAllocation)?
        .port();
    debug!("listening on 127.0.0.1:{}", local_port);

    let reply = control
        .add_onion(&AddOnionConfig {
            key,
            virt_port: VIRT_PORT,
            target_port: local_port,
            discard_pk: true,
            await_publication: true,
        })
        .await
        .map_err(Error::ServiceCreation)?;
    Ok((listener, reply))
}
