//! Static file serving.
//!
//! # Responsibilities
//! - Serve files under a root directory for GET and HEAD
//! - Serve `index.html` for directories
//! - Strip a route prefix before the file lookup
//!
//! # Design Decisions
//! - Any `..` segment is refused with 400 before touching the filesystem
//! - Content type comes from the file extension only

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use axum::http::{header, uri::PathAndQuery, HeaderValue, Method, StatusCode, Uri};

use crate::http::error::HandlerResult;
use crate::http::handler::{BoxHandler, Handler};
use crate::http::request::Request;
use crate::http::writer::ResponseWriter;

const INDEX_FILE: &str = "index.html";

/// Guess a content type from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "text/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

async fn plain(w: &mut dyn ResponseWriter, status: StatusCode, body: &str) -> HandlerResult {
    w.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    w.set_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    w.send(status, body.as_bytes()).await?;
    Ok(())
}

/// Serves files below `root`.
#[derive(Debug, Clone)]
pub struct FileServer {
    root: PathBuf,
}

impl FileServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return None;
        }
        Some(self.root.join(relative))
    }
}

#[async_trait]
impl Handler for FileServer {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let head_only = match *req.method() {
            Method::GET => false,
            Method::HEAD => true,
            _ => {
                w.set_header(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
                return plain(w, StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n").await;
            }
        };

        let path = req.uri().path();
        let Some(mut file) = self.resolve(path) else {
            return plain(w, StatusCode::BAD_REQUEST, "invalid URL path\n").await;
        };

        let metadata = match tokio::fs::metadata(&file).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return plain(w, StatusCode::NOT_FOUND, "404 page not found\n").await;
            }
            Err(err) => return Err(err.into()),
        };
        if metadata.is_dir() {
            if !path.ends_with('/') {
                let location = format!("{path}/");
                if let Ok(value) = HeaderValue::from_str(&location) {
                    w.set_header(header::LOCATION, value);
                }
                return plain(w, StatusCode::MOVED_PERMANENTLY, "").await;
            }
            file.push(INDEX_FILE);
        }

        let contents = match tokio::fs::read(&file).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return plain(w, StatusCode::NOT_FOUND, "404 page not found\n").await;
            }
            Err(err) => return Err(err.into()),
        };

        tracing::trace!(file = %file.display(), bytes = contents.len(), "Serving static file");
        w.set_header(header::CONTENT_TYPE, HeaderValue::from_static(content_type_for(&file)));
        w.set_header(header::CONTENT_LENGTH, HeaderValue::from(contents.len()));
        if head_only {
            w.write_header(StatusCode::OK).await?;
        } else {
            w.send(StatusCode::OK, &contents).await?;
        }
        Ok(())
    }
}

/// Removes a path prefix before handing the request on.
pub struct StripPrefix {
    prefix: String,
    inner: BoxHandler,
}

impl StripPrefix {
    pub fn new(prefix: impl Into<String>, inner: BoxHandler) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }
}

fn strip_uri(uri: &Uri, prefix: &str) -> Option<Uri> {
    let rest = uri.path().strip_prefix(prefix)?;
    let path = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    };
    let path_and_query = match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query).ok()?);
    Uri::from_parts(parts).ok()
}

#[async_trait]
impl Handler for StripPrefix {
    async fn call(&self, w: &mut dyn ResponseWriter, mut req: Request) -> HandlerResult {
        match strip_uri(req.uri(), &self.prefix) {
            Some(uri) => {
                *req.uri_mut() = uri;
                self.inner.call(w, req).await
            }
            None => plain(w, StatusCode::NOT_FOUND, "404 page not found\n").await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::recorder::MemoryWriter;
    use axum::body::Bytes;
    use std::sync::Arc;

    fn fixture_root(name: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("tideway-files-{name}-{}", std::process::id()));
        std::fs::create_dir_all(root.join("docs")).unwrap();
        std::fs::write(root.join("app.js"), "console.log(1);").unwrap();
        std::fs::write(root.join("docs").join("index.html"), "<h1>docs</h1>").unwrap();
        root
    }

    async fn get(handler: &dyn Handler, method: Method, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::new())
            .unwrap();
        let mut w = MemoryWriter::new();
        handler.call(&mut w, req).await.unwrap();
        w.into_parts()
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for(Path::new("a/b.CSS")), "text/css; charset=utf-8");
        assert_eq!(content_type_for(Path::new("x.png")), "image/png");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn serves_file_with_type_and_length() {
        let server = FileServer::new(fixture_root("serve"));
        let (status, headers, body) = get(&server, Method::GET, "/app.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/javascript; charset=utf-8");
        assert_eq!(headers[header::CONTENT_LENGTH], "15");
        assert_eq!(body, b"console.log(1);");
    }

    #[tokio::test]
    async fn head_has_no_body() {
        let server = FileServer::new(fixture_root("head"));
        let (status, headers, body) = get(&server, Method::HEAD, "/app.js").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_LENGTH], "15");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn directory_serves_index() {
        let server = FileServer::new(fixture_root("index"));
        let (status, _, body) = get(&server, Method::GET, "/docs/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"<h1>docs</h1>");

        let (status, headers, _) = get(&server, Method::GET, "/docs").await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(headers[header::LOCATION], "/docs/");
    }

    #[tokio::test]
    async fn traversal_and_missing_files() {
        let server = FileServer::new(fixture_root("traversal"));
        assert_eq!(get(&server, Method::GET, "/../etc/passwd").await.0, StatusCode::BAD_REQUEST);
        assert_eq!(get(&server, Method::GET, "/missing.txt").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get(&server, Method::POST, "/app.js").await.0, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn strip_prefix_rewrites_the_path() {
        let inner: BoxHandler = Arc::new(FileServer::new(fixture_root("strip")));
        let strip = StripPrefix::new("/static", inner);
        let (status, _, body) = get(&strip, Method::GET, "/static/app.js?v=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"console.log(1);");

        assert_eq!(get(&strip, Method::GET, "/other/app.js").await.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn strip_uri_keeps_query() {
        let uri: Uri = "/static/a/b?x=1".parse().unwrap();
        assert_eq!(strip_uri(&uri, "/static").unwrap().to_string(), "/a/b?x=1");
        assert_eq!(strip_uri(&uri, "/static/a/b").unwrap().to_string(), "/?x=1");
    }
}
