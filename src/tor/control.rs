//! Tor Control Port client
//!
//! Communicates with the local Tor daemon via the control protocol.
//! The client is generic over the underlying stream so tests can drive
//! every session transition over an in-memory duplex instead of TCP.

use std::collections::VecDeque;
use std::time::Duration;

use data_encoding::BASE64;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Per-reply read timeout. A daemon that stops answering yields a typed
/// error instead of a wedged session.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the HS_DESC UPLOADED confirmation after ADD_ONION.
/// Descriptor publication can take a while on a cold Tor instance.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(120);

/// Control-channel failures.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control channel I/O error")]
    Io(#[from] std::io::Error),

    /// The daemon closed the channel (EOF).
    #[error("control channel closed")]
    Closed,

    #[error("timed out waiting for control reply")]
    Timeout,

    /// The daemon answered with a non-2xx final reply line.
    #[error("control request rejected: {0}")]
    Rejected(String),

    #[error("malformed control reply: {0}")]
    Protocol(String),

    /// Operation attempted out of order.
    #[error("operation invalid in session state {0:?}")]
    State(SessionState),
}

/// Session lifecycle. Each request/response operation is only legal in
/// one state, so misordered provisioning fails loudly instead of
/// confusing the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Authenticated,
    ServiceLive,
    Lost,
}

/// Key material for ADD_ONION.
pub enum OnionKey {
    /// Let the daemon generate a fresh ed25519 key.
    New,
    /// Expanded ed25519 secret key (clamped scalar || PRF secret),
    /// Tor's `ED25519-V3` blob.
    Ed25519Expanded([u8; 64]),
}

/// One forwarding rule plus key handling options for ADD_ONION.
pub struct AddOnionConfig {
    pub key: OnionKey,
    /// Port exposed on the Tor side.
    pub virt_port: u16,
    /// Loopback port the daemon forwards to.
    pub target_port: u16,
    /// Ask the daemon not to return the private key.
    pub discard_pk: bool,
    /// Block until an HS_DESC UPLOADED event confirms publication.
    pub await_publication: bool,
}

/// Successful ADD_ONION reply.
#[derive(Debug, Clone)]
pub struct AddOnionReply {
    /// The service ID (without .onion suffix).
    pub service_id: String,
    /// The full onion address.
    pub onion_address: String,
}

/// Connection to the Tor control port.
pub struct TorController<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    state: SessionState,
    /// Async 650 events observed while waiting for a command reply.
    pending_events: VecDeque<String>,
}

impl TorController<TcpStream> {
    /// Connect to the control port over TCP. The session starts in
    /// [`SessionState::Connected`]; authenticate before anything else.
    pub async fn connect(addr: &str) -> std::io::Result<Self> {
        debug!("connecting to Tor control port {}", addr);
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite> TorController<S> {
    /// Wrap an already-open control channel.
    pub fn new(stream: S) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(rd),
            writer: wr,
            state: SessionState::Connected,
            pending_events: VecDeque::new(),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Authenticate with the daemon. `None` sends a bare AUTHENTICATE,
    /// which works when no auth is configured. Rejection poisons the
    /// session; the caller is expected to drop it.
    pub async fn authenticate(&mut self, password: Option<&str>) -> Result<(), ControlError> {
        if self.state != SessionState::Connected {
            return Err(ControlError::State(self.state));
        }
        let cmd = match password {
            Some(p) if !p.is_empty() => format!("AUTHENTICATE {}", quote(p)),
            _ => "AUTHENTICATE".to_string(),
        };
        match self.round_trip(&cmd).await {
            Ok(_) => {
                self.state = SessionState::Authenticated;
                debug!("control port authentication succeeded");
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::Lost;
                Err(err)
            }
        }
    }

    /// Create an onion service. Only legal once, after authentication.
    /// With `await_publication` set this subscribes to HS_DESC events and
    /// does not return until the network has accepted the descriptor.
    pub async fn add_onion(
        &mut self,
        config: &AddOnionConfig,
    ) -> Result<AddOnionReply, ControlError> {
        if self.state != SessionState::Authenticated {
            return Err(ControlError::State(self.state));
        }

        // Subscribe before ADD_ONION so the UPLOADED event cannot be missed.
        if config.await_publication {
            self.round_trip("SETEVENTS HS_DESC").await?;
        }

        let keyspec = match &config.key {
            OnionKey::New => "NEW:ED25519-V3".to_string(),
            OnionKey::Ed25519Expanded(blob) => format!("ED25519-V3:{}", BASE64.encode(blob)),
        };
        let mut cmd = format!("ADD_ONION {}", keyspec);
        if config.discard_pk {
            cmd.push_str(" Flags=DiscardPK");
        }
        cmd.push_str(&format!(
            " Port={},127.0.0.1:{}",
            config.virt_port, config.target_port
        ));

        info!(
            "requesting onion service, port {} -> 127.0.0.1:{}",
            config.virt_port, config.target_port
        );
        let reply = self.round_trip(&cmd).await?;

        let service_id = reply
            .iter()
            .find_map(|line| line.strip_prefix("ServiceID="))
            .ok_or_else(|| ControlError::Protocol("ADD_ONION reply missing ServiceID".into()))?
            .to_string();
        let onion_address = format!("{}.onion", service_id);

        if config.await_publication {
            self.wait_for_upload(&service_id).await?;
            info!("descriptor for {} published", onion_address);
        }

        self.state = SessionState::ServiceLive;
        Ok(AddOnionReply {
            service_id,
            onion_address,
        })
    }

    /// Wait for the next asynchronous (650) event. Blocks indefinitely;
    /// the caller decides how long it is willing to wait. EOF or an I/O
    /// failure marks the session lost.
    pub async fn next_event(&mut self) -> Result<String, ControlError> {
        if self.state == SessionState::Lost {
            return Err(ControlError::State(self.state));
        }
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        loop {
            let line = self.read_line().await?;
            if let Some(payload) = line.strip_prefix("650 ") {
                return Ok(payload.to_string());
            }
            // Replies outside a command round trip should not happen on a
            // channel we only read events from.
            trace!("ignoring non-event line: {}", line);
        }
    }

    /// Best-effort clean shutdown. Safe to call in any state, more than
    /// once; dropping the controller closes the channel regardless.
    pub async fn quit(&mut self) {
        if self.state != SessionState::Lost {
            let _ = self.writer.write_all(b"QUIT\r\n").await;
            let _ = self.writer.flush().await;
            self.state = SessionState::Lost;
        }
    }

    /// Consume events until the daemon confirms our descriptor upload.
    async fn wait_for_upload(&mut self, service_id: &str) -> Result<(), ControlError> {
        let wait = async {
            loop {
                let event = self.next_event().await?;
                trace!("event while awaiting publication: {}", event);
                let mut parts = event.split_whitespace();
                if parts.next() == Some("HS_DESC")
                    && parts.next() == Some("UPLOADED")
                    && parts.next() == Some(service_id)
                {
                    return Ok(());
                }
            }
        };
        timeout(PUBLISH_TIMEOUT, wait)
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    /// Send one command and collect its reply payload lines. Async 650
    /// events arriving in between are stashed for [`Self::next_event`].
    async fn round_trip(&mut self, cmd: &str) -> Result<Vec<String>, ControlError> {
        trace!("sending control command: {}", first_word(cmd));
        self.write_line(cmd).await?;

        let mut payload = Vec::new();
        loop {
            let line = match timeout(REPLY_TIMEOUT, self.read_line()).await {
                Ok(result) => result?,
                Err(_) => {
                    warn!("timed out waiting for reply to {}", first_word(cmd));
                    self.state = SessionState::Lost;
                    return Err(ControlError::Timeout);
                }
            };
            // Code and separator must be four ASCII bytes; anything else
            // (including a multibyte char straddling the boundary) is junk.
            if line.len() < 4 || !line.as_bytes()[..4].is_ascii() {
                return Err(ControlError::Protocol(line));
            }
            let (code, rest) = line.split_at(3);
            let sep = &rest[..1];
            let text = &rest[1..];

            // Asynchronous event interleaved with the reply.
            if code.starts_with('6') {
                if sep == "+" {
                    let mut body = text.to_string();
                    self.read_data_block(&mut body).await?;
                    self.pending_events.push_back(body);
                } else {
                    self.pending_events.push_back(text.to_string());
                }
                continue;
            }

            match sep {
                "-" => payload.push(text.to_string()),
                "+" => {
                    let mut body = text.to_string();
                    self.read_data_block(&mut body).await?;
                    payload.push(body);
                }
                " " => {
                    if code.starts_with('2') {
                        if text != "OK" {
                            payload.push(text.to_string());
                        }
                        return Ok(payload);
                    }
                    warn!("control request rejected: {}", line);
                    return Err(ControlError::Rejected(line));
                }
                _ => return Err(ControlError::Protocol(line)),
            }
        }
    }

    /// Read the body of a `250+`/`650+` data block up to the lone dot.
    async fn read_data_block(&mut self, body: &mut String) -> Result<(), ControlError> {
        loop {
            let line = self.read_line().await?;
            if line == "." {
                return Ok(());
            }
            body.push('\n');
            body.push_str(&line);
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ControlError> {
        let result = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\r\n").await?;
            self.writer.flush().await
        }
        .await;
        if let Err(err) = result {
            self.state = SessionState::Lost;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, ControlError> {
        let mut line = String::new();
        match self.reader.read_line(&mut line).await {
            Ok(0) => {
                self.state = SessionState::Lost;
                Err(ControlError::Closed)
            }
            Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
            Err(err) => {
                self.state = SessionState::Lost;
                Err(err.into())
            }
        }
    }
}

/// Quote a string per the control-spec QuotedString rules.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn first_word(cmd: &str) -> &str {
    cmd.split_whitespace().next().unwrap_or(cmd)
}
