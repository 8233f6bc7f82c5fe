//! Request handling behind the onion service
//!
//! Turns the raw target string into one of two handlers - a reverse
//! proxy to an HTTP origin or a guarded file server - and runs the
//! accept loop on the loopback listener the daemon forwards to.

pub mod files;
pub mod proxy;

pub use files::{new_slug, FileServer};
pub use proxy::ReverseProxy;

use std::convert::Infallible;
use std::path::Path;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::error::Error;
use crate::tor::ControlError;

/// The handler picked at startup. Selected once, never swapped.
#[derive(Clone, Debug)]
pub enum Handler {
    Proxy(ReverseProxy),
    Files(FileServer),
}

impl Handler {
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match self {
            Handler::Proxy(proxy) => proxy.handle(req).await,
            Handler::Files(files) => files.handle(req).await,
        }
    }
}

/// Decide how to front the target. Returns the handler and the link
/// path to append to the published onion address.
///
/// `http`/`https` URLs are reverse-proxied; anything that does not parse
/// as an absolute URL is treated as a local filesystem path; any other
/// scheme is refused before a single network resource is touched.
pub fn select_handler(target: &str, slug: bool, zip: bool) -> Result<(Handler, String), Error> {
    match Url::parse(target) {
        Ok(origin) if matches!(origin.scheme(), "http" | "https") => {
            let proxy = ReverseProxy::new(origin)?;
            Ok((Handler::Proxy(proxy), String::new()))
        }
        Ok(other) => Err(Error::InvalidTarget(format!(
            "unsupported target scheme: {}",
            other.scheme()
        ))),
        Err(_) => {
            let files = FileServer::new(Path::new(target), slug, zip)?;
            let link = files.link_path();
            Ok((Handler::Files(files), link))
        }
    }
}

/// Serve HTTP on the listener until it fails or the control channel is
/// reported lost. Channel loss drains the accept loop and surfaces as
/// [`Error::ChannelLost`], distinct from an accept failure.
pub async fn run(
    listener: TcpListener,
    handler: Handler,
    mut lost: oneshot::Receiver<ControlError>,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(Error::Serve)?;
                let io = TokioIo::new(stream);
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler.handle(req).await) }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("connection error from {}: {}", addr, err);
                    }
                });
            }
            reason = &mut lost => {
                let err = reason.unwrap_or(ControlError::Closed);
                warn!("control channel lost, shutting down: {}", err);
                return Err(Error::ChannelLost(err));
            }
        }
    }
}

/// Plain-text error response.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from("internal server error"))))
}
