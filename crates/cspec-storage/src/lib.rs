//! Campaign record storage, local PDF storage and HTTP spec fetching.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

#[cfg(any(test, feature = "memory"))]
pub mod memory;
pub mod records;

#[cfg(any(test, feature = "memory"))]
pub use memory::MemoryRecordStore;
pub use records::{DatabaseConfig, PgRecordStore, RecordStore, StoreError};

pub const CRATE_NAME: &str = "cspec-storage";

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Directory holding one downloaded specification PDF per campaign.
#[derive(Debug, Clone)]
pub struct PdfStore {
    root: PathBuf,
}

impl PdfStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Full path for a bare filename. Names that could escape the directory resolve to `None`.
    pub fn resolve(&self, filename: &str) -> Option<PathBuf> {
        let unsafe_name = filename.is_empty()
            || filename.starts_with('.')
            || filename.contains(['/', '\\', '\0'])
            || filename.contains("..");
        if unsafe_name {
            None
        } else {
            Some(self.root.join(filename))
        }
    }

    pub async fn exists(&self, filename: &str) -> bool {
        match self.resolve(filename) {
            Some(path) => fs::try_exists(&path).await.unwrap_or(false),
            None => false,
        }
    }
}

/// Write `bytes` to `destination` via a temp file in the same directory and a rename,
/// so readers never observe a partially written file. Existing files are replaced.
pub async fn write_atomic(destination: &Path, bytes: &[u8]) -> anyhow::Result<u64> {
    let temp_path = stage_temp(destination, bytes).await?;
    if let Err(err) = fs::rename(&temp_path, destination).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                destination.display()
            )
        });
    }
    Ok(bytes.len() as u64)
}

/// Like [`write_atomic`], but never replaces an existing file.
/// Returns `Ok(None)` when `destination` already exists.
pub async fn write_new(destination: &Path, bytes: &[u8]) -> anyhow::Result<Option<u64>> {
    let temp_path = stage_temp(destination, bytes).await?;
    let linked = fs::hard_link(&temp_path, destination).await;
    let _ = fs::remove_file(&temp_path).await;
    match linked {
        Ok(()) => Ok(Some(bytes.len() as u64)),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err).with_context(|| {
            format!(
                "linking temp file {} -> {}",
                temp_path.display(),
                destination.display()
            )
        }),
    }
}

// Fully written temp file next to `destination`.
async fn stage_temp(destination: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }
    Ok(temp_path)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{url} did not return a PDF (content-type: {content_type})")]
    NotPdf { url: String, content_type: String },
    #[error("saving {url} to {} failed: {source:#}", .path.display())]
    Write {
        url: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            Self::Request { url, .. }
            | Self::HttpStatus { url, .. }
            | Self::NotPdf { url, .. }
            | Self::Write { url, .. } => url,
        }
    }
}

/// Downloads one specification document to a local path.
#[async_trait]
pub trait SpecFetcher: Send + Sync {
    /// Fetch `url` and write the body to `destination`, replacing any existing file.
    /// Returns the number of bytes written. No retries.
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64, FetchError>;
}

pub fn looks_like_pdf(body: &[u8]) -> bool {
    body.starts_with(PDF_MAGIC)
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` and return the body if it is a successful PDF response.
    pub async fn download_pdf(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let request_error = |source| FetchError::Request {
            url: url.to_string(),
            source,
        };

        let resp = self.client.get(url).send().await.map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        let body = resp.bytes().await.map_err(request_error)?;
        if !looks_like_pdf(&body) {
            return Err(FetchError::NotPdf {
                url: url.to_string(),
                content_type,
            });
        }
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SpecFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> Result<u64, FetchError> {
        let span = info_span!("http_fetch", url, destination = %destination.display());
        async {
            let body = self.download_pdf(url).await?;
            let written = write_atomic(destination, &body)
                .await
                .map_err(|source| FetchError::Write {
                    url: url.to_string(),
                    path: destination.to_path_buf(),
                    source,
                })?;
            debug!(bytes = written, "spec pdf written");
            Ok(written)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, http::StatusCode, response::Html, routing::get, Router};
    use tempfile::tempdir;
    use tokio::net::TcpListener;

    const PDF_BODY: &[u8] = b"%PDF-1.4\n% campaign spec\n%%EOF\n";

    async fn spawn_spec_server() -> String {
        let app = Router::new()
            .route(
                "/spec.pdf",
                get(|| async { ([(header::CONTENT_TYPE, "application/pdf")], PDF_BODY) }),
            )
            .route(
                "/octet.pdf",
                get(|| async { ([(header::CONTENT_TYPE, "application/octet-stream")], PDF_BODY) }),
            )
            .route("/instructions.html", get(|| async { Html("<html>posting instructions</html>") }))
            .route("/gone.pdf", get(|| async { StatusCode::NOT_FOUND }));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("cspec-test".into()),
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn fetch_writes_pdf_body_and_reports_size() {
        let base = spawn_spec_server().await;
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("acme-launch.pdf");

        let written = fetcher()
            .fetch(&format!("{base}/spec.pdf"), &dest)
            .await
            .expect("fetch");

        assert_eq!(written, PDF_BODY.len() as u64);
        assert_eq!(std::fs::read(&dest).expect("read"), PDF_BODY);
    }

    #[tokio::test]
    async fn fetch_accepts_pdf_bytes_served_with_generic_content_type() {
        let base = spawn_spec_server().await;
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("octet.pdf");

        fetcher()
            .fetch(&format!("{base}/octet.pdf"), &dest)
            .await
            .expect("fetch");
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn fetch_overwrites_existing_file() {
        let base = spawn_spec_server().await;
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("acme-launch.pdf");
        std::fs::write(&dest, b"stale contents that are longer than the new body").expect("seed file");

        fetcher()
            .fetch(&format!("{base}/spec.pdf"), &dest)
            .await
            .expect("fetch");
        assert_eq!(std::fs::read(&dest).expect("read"), PDF_BODY);
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error_and_writes_nothing() {
        let base = spawn_spec_server().await;
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("gone.pdf");
        let url = format!("{base}/gone.pdf");

        let err = fetcher().fetch(&url, &dest).await.expect_err("404");
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(err.url(), url);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn html_body_is_rejected_as_not_pdf() {
        let base = spawn_spec_server().await;
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("instructions.pdf");

        let err = fetcher()
            .fetch(&format!("{base}/instructions.html"), &dest)
            .await
            .expect_err("html");
        match err {
            FetchError::NotPdf { content_type, .. } => assert!(content_type.starts_with("text/html")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("nowhere.pdf");
        let err = fetcher()
            .fetch("http://127.0.0.1:1/spec.pdf", &dest)
            .await
            .expect_err("connection refused");
        assert!(matches!(err, FetchError::Request { .. }));
        assert_eq!(err.url(), "http://127.0.0.1:1/spec.pdf");
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("nested").join("spec.pdf");
        let written = write_atomic(&dest, PDF_BODY).await.expect("write");
        assert_eq!(written, PDF_BODY.len() as u64);

        let names = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["spec.pdf".to_string()]);
    }

    #[tokio::test]
    async fn write_new_keeps_an_existing_file() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("acme-launch.1.v1.pdf");
        assert_eq!(
            write_new(&dest, PDF_BODY).await.expect("first write"),
            Some(PDF_BODY.len() as u64)
        );
        let second = write_new(&dest, b"%PDF-1.7 other").await.expect("second write");
        assert_eq!(second, None);
        assert_eq!(std::fs::read(&dest).unwrap(), PDF_BODY);

        let names = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["acme-launch.1.v1.pdf".to_string()]);
    }

    #[tokio::test]
    async fn pdf_store_rejects_traversal_names() {
        let dir = tempdir().expect("tempdir");
        let store = PdfStore::new(dir.path());
        std::fs::write(dir.path().join("acme.pdf"), PDF_BODY).unwrap();

        assert!(store.exists("acme.pdf").await);
        assert!(!store.exists("missing.pdf").await);
        assert_eq!(store.resolve("../etc/passwd"), None);
        assert_eq!(store.resolve("nested/acme.pdf"), None);
        assert_eq!(store.resolve(".hidden.pdf"), None);
        assert_eq!(store.resolve(""), None);
        assert_eq!(store.resolve("acme.pdf"), Some(dir.path().join("acme.pdf")));
    }

    #[test]
    fn pdf_magic_detection() {
        assert!(looks_like_pdf(PDF_BODY));
        assert!(!looks_like_pdf(b"<html>"));
        assert!(!looks_like_pdf(b""));
    }
}
