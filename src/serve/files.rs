//! Guarded file server
//!
//! Serves a local file or directory tree, optionally gated behind a
//! random capability slug and optionally packaging directories as zip
//! archives instead of listings.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use data_encoding::BASE32_NOPAD;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response, StatusCode};
use tracing::{debug, error};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::error_response;
use crate::error::Error;

/// Slug length in base-32 symbols (80 bits of entropy).
pub const SLUG_LEN: usize = 16;

/// Generate a random capability token: 16 lowercase base-32 symbols.
pub fn new_slug() -> String {
    let bytes: [u8; 10] = rand::random();
    BASE32_NOPAD.encode(&bytes).to_lowercase()
}

/// File server rooted at a local path, selected once at startup.
#[derive(Clone, Debug)]
pub struct FileServer {
    root: PathBuf,
    root_is_file: bool,
    zip: bool,
    slug: Option<String>,
}

impl FileServer {
    /// Validate the root and, if requested, mint the capability slug.
    pub fn new(path: &Path, want_slug: bool, zip: bool) -> Result<Self, Error> {
        let meta = std::fs::metadata(path)
            .map_err(|err| Error::InvalidTarget(format!("cannot serve {}: {}", path.display(), err)))?;
        let root = std::fs::canonicalize(path)
            .map_err(|err| Error::InvalidTarget(format!("cannot serve {}: {}", path.display(), err)))?;
        Ok(Self {
            root,
            root_is_file: meta.is_file(),
            zip,
            slug: want_slug.then(new_slug),
        })
    }

    /// The path segment to append to the published address.
    pub fn link_path(&self) -> String {
        match &self.slug {
            Some(slug) => format!("/{slug}"),
            None => String::new(),
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let head = req.method() == Method::HEAD;
        if req.method() != Method::GET && !head {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }
        let mut response = self.respond(req.uri().path()).await;
        if head {
            *response.body_mut() = Full::new(Bytes::new());
        }
        response
    }

    /// Resolve a request path and produce the response.
    async fn respond(&self, raw_path: &str) -> Response<Full<Bytes>> {
        // The listing links are percent-encoded, so incoming segments
        // must be decoded before they name anything on disk.
        let mut segments = Vec::new();
        for raw in raw_path.split('/').filter(|s| !s.is_empty()) {
            match urlencoding::decode(raw) {
                Ok(decoded) => segments.push(decoded.into_owned()),
                Err(_) => return error_response(StatusCode::NOT_FOUND, "not found"),
            }
        }

        // A wrong or missing slug looks exactly like a missing file, so
        // the server leaks nothing to path guessing.
        if let Some(slug) = &self.slug {
            match segments.first() {
                Some(first) if first == slug => {
                    segments.remove(0);
                }
                _ => return error_response(StatusCode::NOT_FOUND, "not found"),
            }
        }

        // Plain file names only; no traversal, including encoded forms.
        let mut rel = PathBuf::new();
        for seg in &segments {
            if seg == "." || seg == ".." || seg.contains('/') || seg.contains('\\') {
                return error_response(StatusCode::NOT_FOUND, "not found");
            }
            rel.push(seg);
        }

        if self.root_is_file {
            if segments.is_empty() {
                return self.serve_file(&self.root).await;
            }
            return error_response(StatusCode::NOT_FOUND, "not found");
        }

        let full = self.root.join(&rel);
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => {
                if self.zip {
                    self.serve_zip(&full).await
                } else {
                    self.serve_listing(raw_path, &full).await
                }
            }
            Ok(_) => self.serve_file(&full).await,
            Err(_) => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn serve_file(&self, path: &Path) -> Response<Full<Bytes>> {
        match tokio::fs::read(path).await {
            Ok(contents) => {
                let mime = mime_guess::from_path(path).first_or_octet_stream();
                debug!("serving {} ({} bytes)", path.display(), contents.len());
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, mime.as_ref())
                    .body(Full::new(Bytes::from(contents)))
                    .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
            }
            Err(_) => error_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    /// HTML index of a directory.
    async fn serve_listing(&self, request_path: &str, dir: &Path) -> Response<Full<Bytes>> {
        let mut reader = match tokio::fs::read_dir(dir).await {
            Ok(reader) => reader,
            Err(_) => return error_response(StatusCode::NOT_FOUND, "not found"),
        };

        let mut entries: Vec<(String, bool)> = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push((name, is_dir));
        }
        entries.sort();

        let base = request_path.trim_end_matches('/');
        let title = if base.is_empty() { "/" } else { request_path };
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">");
        html.push_str(&format!("<title>Index of {}</title></head>\n", escape_html(title)));
        html.push_str(&format!("<body><h1>Index of {}</h1>\n<ul>\n", escape_html(title)));
        for (name, is_dir) in &entries {
            let suffix = if *is_dir { "/" } else { "" };
            html.push_str(&format!(
                "<li><a href=\"{}/{}\">{}{}</a></li>\n",
                base,
                urlencoding::encode(name),
                escape_html(name),
                suffix
            ));
        }
        html.push_str("</ul></body></html>\n");

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(Full::new(Bytes::from(html)))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
    }

    /// Archive-packaged view of a directory subtree.
    async fn serve_zip(&self, dir: &Path) -> Response<Full<Bytes>> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        let dir = dir.to_path_buf();

        match tokio::task::spawn_blocking(move || zip_tree(&dir)).await {
            Ok(Ok(bytes)) => Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/zip")
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}.zip\"", name),
                )
                .body(Full::new(Bytes::from(bytes)))
                .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "")),
            Ok(Err(err)) => {
                error!("failed to package archive: {}", err);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to package archive")
            }
            Err(err) => {
                error!("archive task failed: {}", err);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to package archive")
            }
        }
    }
}

/// Zip an entire directory tree into memory.
fn zip_tree(root: &Path) -> std::io::Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = ZipWriter::new(&mut cursor);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        add_tree(&mut writer, root, Path::new(""), options)?;
        let _ = writer.finish().map_err(std::io::Error::other)?;
    }
    Ok(cursor.into_inner())
}

fn add_tree(
    zip: &mut ZipWriter<&mut Cursor<Vec<u8>>>,
    dir: &Path,
    prefix: &Path,
    options: SimpleFileOptions,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let name_str = name.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            zip.add_directory(format!("{}/", name_str), options)
                .map_err(std::io::Error::other)?;
            add_tree(zip, &path, &name, options)?;
        } else {
            zip.start_file(name_str, options)
                .map_err(std::io::Error::other)?;
            let mut file = std::fs::File::open(&path)?;
            std::io::copy(&mut file, zip)?;
        }
    }
    Ok(())
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use std::fs;

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("inner.txt"), b"inner").unwrap();
        dir
    }

    async fn body_of(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[test]
    fn slugs_are_sixteen_base32_symbols() {
        let slug = new_slug();
        assert_eq!(slug.len(), SLUG_LEN);
        assert!(slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
        assert_ne!(new_slug(), new_slug());
    }

    #[tokio::test]
    async fn slug_gates_every_request() {
        let dir = sample_tree();
        let server = FileServer::new(dir.path(), true, false).unwrap();
        let slug = server.slug.clone().unwrap();

        let response = server.respond("/hello.txt").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server.respond(&format!("/{wrong}/hello.txt", wrong = "x".repeat(16))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server.respond(&format!("/{slug}/hello.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], b"hello world");
    }

    #[tokio::test]
    async fn directory_listing_names_entries() {
        let dir = sample_tree();
        let server = FileServer::new(dir.path(), false, false).unwrap();

        let response = server.respond("/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let html = String::from_utf8(body_of(response).await.to_vec()).unwrap();
        assert!(html.contains("hello.txt"));
        assert!(html.contains("sub/"));
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let dir = sample_tree();
        let server = FileServer::new(dir.path(), false, false).unwrap();

        for path in [
            "/../hello.txt",
            "/sub/../../etc/passwd",
            "/./hello.txt",
            "/%2e%2e/hello.txt",
            "/sub%2f..%2f..%2fetc/passwd",
        ] {
            let response = server.respond(path).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "path {}", path);
        }
    }

    #[tokio::test]
    async fn listing_links_round_trip_for_awkward_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("my file.txt"), b"spaced").unwrap();
        fs::write(dir.path().join("100%.txt"), b"percent").unwrap();
        let server = FileServer::new(dir.path(), false, false).unwrap();

        let response = server.respond("/").await;
        let html = String::from_utf8(body_of(response).await.to_vec()).unwrap();
        assert!(html.contains("href=\"/my%20file.txt\""));
        assert!(html.contains("href=\"/100%25.txt\""));

        let response = server.respond("/my%20file.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], b"spaced");

        let response = server.respond("/100%25.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], b"percent");
    }

    #[tokio::test]
    async fn zip_mode_packages_directories_but_not_files() {
        let dir = sample_tree();
        let server = FileServer::new(dir.path(), false, true).unwrap();

        let response = server.respond("/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/zip"
        );
        let body = body_of(response).await;
        assert_eq!(&body[..2], b"PK");

        let response = server.respond("/hello.txt").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], b"hello world");
    }

    #[tokio::test]
    async fn single_file_root_serves_at_root_only() {
        let dir = sample_tree();
        let server = FileServer::new(&dir.path().join("hello.txt"), false, false).unwrap();

        let response = server.respond("/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(&body_of(response).await[..], b"hello world");

        let response = server.respond("/other").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn missing_root_is_invalid() {
        let err = FileServer::new(Path::new("/no/such/root"), false, false).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }
}
