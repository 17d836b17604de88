//! Multipart uploads with progress reporting.
//!
//! Uploads do not go through the JSON request path: the payload is streamed
//! to reqwest in chunks so the caller can observe how many bytes have been
//! handed to the transport.

use std::io;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use reqwest::multipart::Part;
use reqwest::Body;
use tracing::debug;

use super::ApiError;

/// Size of the chunks an in-memory payload is split into.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Snapshot of an upload in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub sent: u64,
    pub total: u64,
    /// False when the payload length was not known up front; `total` is then 0.
    pub length_computable: bool,
}

impl UploadProgress {
    pub fn percent(&self) -> Option<u8> {
        if !self.length_computable || self.total == 0 {
            return None;
        }
        Some(((self.sent.min(self.total) * 100) / self.total) as u8)
    }
}

pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

enum Source {
    Bytes(Vec<u8>),
    Stream {
        stream: BoxStream<'static, io::Result<Vec<u8>>>,
        len: Option<u64>,
    },
}

/// A file to upload, with its name as the backend should store it.
pub struct UploadFile {
    filename: String,
    mime_type: Option<String>,
    source: Source,
}

impl UploadFile {
    pub fn from_bytes(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            source: Source::Bytes(data),
        }
    }

    /// Read a file from disk. The name sent is the path's final component.
    pub async fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string();
        let data = tokio::fs::read(path).await?;
        Ok(Self::from_bytes(filename, data))
    }

    /// Upload from a chunk stream. Pass `None` for `len` when the size is unknown.
    pub fn from_stream<S>(filename: impl Into<String>, stream: S, len: Option<u64>) -> Self
    where
        S: futures::Stream<Item = io::Result<Vec<u8>>> + Send + 'static,
    {
        Self {
            filename: filename.into(),
            mime_type: None,
            source: Source::Stream {
                stream: stream.boxed(),
                len,
            },
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn total(&self) -> Option<u64> {
        match &self.source {
            Source::Bytes(data) => Some(data.len() as u64),
            Source::Stream { len, .. } => *len,
        }
    }

    /// Turn the payload into a multipart part whose body reports progress as it is read.
    pub(crate) fn into_part(self, progress: Option<ProgressFn>) -> Result<Part, ApiError> {
        let total = self.total();
        let chunks: BoxStream<'static, io::Result<Vec<u8>>> = match self.source {
            Source::Bytes(data) => {
                let chunks: Vec<io::Result<Vec<u8>>> = data
                    .chunks(UPLOAD_CHUNK_SIZE)
                    .map(|chunk| Ok(chunk.to_vec()))
                    .collect();
                stream::iter(chunks).boxed()
            }
            Source::Stream { stream, .. } => stream,
        };

        let mut tracker = ProgressTracker::new(total, progress);
        let tracked = chunks.map(move |chunk| {
            if let Ok(ref bytes) = chunk {
                tracker.advance(bytes.len());
            }
            chunk
        });

        let body = Body::wrap_stream(tracked);
        let part = match total {
            Some(len) => Part::stream_with_length(body, len),
            None => Part::stream(body),
        };
        let part = part.file_name(self.filename);
        match self.mime_type {
            Some(mime) => part
                .mime_str(&mime)
                .map_err(|e| ApiError::InvalidRequest(format!("bad mime type '{}': {}", mime, e))),
            None => Ok(part),
        }
    }
}

struct ProgressTracker {
    sent: u64,
    total: Option<u64>,
    callback: Option<ProgressFn>,
}

impl ProgressTracker {
    fn new(total: Option<u64>, callback: Option<ProgressFn>) -> Self {
        Self {
            sent: 0,
            total,
            callback,
        }
    }

    fn advance(&mut self, len: usize) {
        self.sent += len as u64;
        let progress = UploadProgress {
            sent: self.sent,
            total: self.total.unwrap_or(0),
            length_computable: self.total.is_some(),
        };
        debug!(sent = progress.sent, total = progress.total, "Upload progress");
        if let Some(ref callback) = self.callback {
            callback(progress);
        }
    }
}
