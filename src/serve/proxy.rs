//! HTTP-aware reverse proxy
//!
//! Forwards requests to the configured origin and rewrites Location
//! headers back to relative so the client's URL bar stays on the
//! onion address.

use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{header, Request, Response, StatusCode};
use reqwest::redirect::Policy;
use tracing::{debug, error, info};
use url::Url;

use super::error_response;
use crate::error::Error;

/// Reverse proxy to a fixed HTTP(S) origin.
#[derive(Clone, Debug)]
pub struct ReverseProxy {
    origin: Url,
    client: reqwest::Client,
}

impl ReverseProxy {
    pub fn new(origin: Url) -> Result<Self, Error> {
        // Redirects must not be followed - Location gets rewritten instead.
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| Error::InvalidTarget(format!("cannot build upstream client: {err}")))?;

        info!("reverse proxying to {}", origin);
        Ok(Self { origin, client })
    }

    /// Handle a single request; upstream failures become 502s.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.forward(req).await {
            Ok(response) => {
                debug!("response for {} {}: {}", method, uri, response.status());
                response
            }
            Err(err) => {
                error!("proxy error for {} {}: {:#}", method, uri, err);
                error_response(StatusCode::BAD_GATEWAY, &format!("proxy error: {err}"))
            }
        }
    }

    async fn forward(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let upstream = upstream_url(&self.origin, path);
        debug!("forwarding to {}", upstream);

        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = req
            .into_body()
            .collect()
            .await
            .context("failed to read request body")?
            .to_bytes();

        let mut builder = self.client.request(method, upstream);
        for (name, value) in headers.iter() {
            if name == header::HOST || is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(host) = origin_host(&self.origin) {
            builder = builder.header(header::HOST, host);
        }
        if !body.is_empty() {
            builder = builder.body(body.to_vec());
        }

        let upstream_response = builder.send().await.context("failed to reach upstream")?;

        let status = upstream_response.status();
        let mut response = Response::builder().status(status);
        for (name, value) in upstream_response.headers().iter() {
            let name_str = name.as_str();
            if is_hop_by_hop(name_str) {
                continue;
            }
            if name_str.eq_ignore_ascii_case("location") {
                if let Ok(location) = value.to_str() {
                    let rewritten = rewrite_location(location, &self.origin);
                    debug!("rewrote Location: {} -> {}", location, rewritten);
                    response = response.header(name_str, rewritten);
                    continue;
                }
            }
            response = response.header(name_str, value);
        }

        let body = upstream_response
            .bytes()
            .await
            .context("failed to read upstream body")?;
        response
            .body(Full::new(body))
            .context("failed to build response")
    }
}

/// Compose the upstream URL from the origin and the request path.
fn upstream_url(origin: &Url, path_and_query: &str) -> String {
    let mut url = origin.as_str().trim_end_matches('/').to_string();
    url.push_str(path_and_query);
    url
}

/// Host header value for the origin.
fn origin_host(origin: &Url) -> Option<String> {
    origin.host_str().map(|host| match origin.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Rewrite a Location header pointing at the origin into a relative one.
fn rewrite_location(location: &str, origin: &Url) -> String {
    let base = origin.as_str().trim_end_matches('/');
    if let Some(rest) = location.strip_prefix(base) {
        if rest.is_empty() {
            return "/".to_string();
        }
        if rest.starts_with('/') {
            return rest.to_string();
        }
    }
    // External redirects and already-relative paths pass through.
    location.to_string()
}

/// Connection-scoped headers that must not cross the proxy.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_on_origin_becomes_relative() {
        let origin = Url::parse("https://example.org").unwrap();

        let result = rewrite_location("https://example.org/search?q=test", &origin);
        assert_eq!(result, "/search?q=test");

        let result = rewrite_location("https://example.org", &origin);
        assert_eq!(result, "/");
    }

    #[test]
    fn other_locations_pass_through() {
        let origin = Url::parse("http://127.0.0.1:8080").unwrap();

        // External redirect
        let result = rewrite_location("https://elsewhere.example/page", &origin);
        assert_eq!(result, "https://elsewhere.example/page");

        // Already relative
        let result = rewrite_location("/login", &origin);
        assert_eq!(result, "/login");
    }

    #[test]
    fn upstream_url_keeps_origin_path_prefix() {
        let origin = Url::parse("http://127.0.0.1:8080/app/").unwrap();
        assert_eq!(
            upstream_url(&origin, "/index.html?x=1"),
            "http://127.0.0.1:8080/app/index.html?x=1"
        );
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
