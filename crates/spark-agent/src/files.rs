//! File operations requested by the server.
//!
//! Uploads are pushed with an HTTP `PUT` whose `Trigger` header carries the
//! correlation token of the request. The file is streamed from disk, never
//! buffered whole.

use std::io::SeekFrom;
use std::path::Path;
use std::time::UNIX_EPOCH;

use reqwest::header::CONTENT_LENGTH;
use serde::Serialize;
use spark_core::command::UploadFile;
use spark_core::{SparkError, SparkResult};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

/// `type` of a [`FileEntry`].
pub const KIND_FILE: u8 = 0;
pub const KIND_DIR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Modification time, unix seconds.
    pub time: i64,
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Offset and length of the bytes to send for an optional inclusive range.
///
/// A start at or past the end of the file yields an empty body.
pub fn plan_range(size: u64, start: Option<u64>, end: Option<u64>) -> (u64, u64) {
    let start = start.unwrap_or(0);
    if start >= size {
        return (start, 0);
    }
    let last = end.map_or(size - 1, |end| end.min(size - 1));
    if last < start {
        return (start, 0);
    }
    (start, last - start + 1)
}

/// Open `path` positioned at the start of the planned range.
///
/// Returns the file, its full size, and the offset and length to send.
async fn open_range(
    path: &Path,
    start: Option<u64>,
    end: Option<u64>,
) -> std::io::Result<(tokio::fs::File, u64, u64, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    let (offset, len) = plan_range(size, start, end);
    if offset > 0 && len > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }
    Ok((file, size, offset, len))
}

/// Header values must be visible ASCII.
fn header_safe(msg: &str) -> String {
    msg.chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}

pub struct FileService {
    http: reqwest::Client,
    base: String,
}

impl FileService {
    pub fn new(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/device/{path}", self.base)
    }

    async fn put(&self, request: reqwest::RequestBuilder) -> SparkResult<()> {
        let response = request
            .send()
            .await
            .map_err(|e| SparkError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SparkError::Transport(format!(
                "upload rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Report a failure for `trigger` instead of sending a body.
    async fn put_error(&self, path: &str, trigger: &str, error: &str) -> SparkResult<()> {
        let request = self
            .http
            .put(self.endpoint(path))
            .header("Trigger", trigger)
            .header("Error", header_safe(error))
            .header(CONTENT_LENGTH, 0);
        self.put(request).await
    }

    /// Stream the requested file (or byte range of it) to the server.
    ///
    /// Any failure before the body starts is reported through the `Error`
    /// header so the waiting download is answered.
    pub async fn upload(&self, request: &UploadFile, trigger: &str) -> SparkResult<()> {
        let path = Path::new(&request.file);
        let (file, size, offset, len) = match open_range(path, request.start, request.end).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(file = %request.file, error = %e, "cannot read file for upload");
                return self.put_error("file/put", trigger, &e.to_string()).await;
            }
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file.take(len)));
        let put = self
            .http
            .put(self.endpoint("file/put"))
            .header("Trigger", trigger)
            .header("FileSize", size)
            .header("FileName", header_safe(&name))
            .header(CONTENT_LENGTH, len)
            .body(body);
        self.put(put).await?;
        info!(file = %request.file, offset, len, "file uploaded");
        Ok(())
    }

    /// This agent cannot capture the screen; the server is told so.
    pub async fn screenshot(&self, trigger: &str) -> SparkResult<()> {
        debug!("screenshot requested");
        self.put_error("screenshot/put", trigger, "unsupported").await
    }
}

/// List a directory. An empty path lists the filesystem root.
pub async fn list(path: &str) -> SparkResult<Vec<FileEntry>> {
    let path = if path.is_empty() { "/" } else { path };
    let mut entries = Vec::new();
    let mut dir = tokio::fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);
        let kind = if meta.is_dir() { KIND_DIR } else { KIND_FILE };
        entries.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            time,
            kind,
        });
    }
    Ok(entries)
}

/// Remove a file, or a directory with everything under it.
pub async fn remove(path: &str) -> SparkResult<()> {
    if path.is_empty() {
        return Err(SparkError::DataInvalid("empty path".into()));
    }
    let meta = tokio::fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    info!(path, "removed");
    Ok(())
}
