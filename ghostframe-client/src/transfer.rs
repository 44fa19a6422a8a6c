//! Two-phase file transfer: upload to the backend, then tell the peer about
//! it with an ordinary chat message carrying the descriptor.

use std::{
    io,
    path::{Path, PathBuf},
};

use ghostframe_core::{FileDescriptor, MessageBody};
use thiserror::Error;
use tracing::info;

use crate::{
    api::{ApiClient, ApiError},
    sync::{SyncEngine, SyncError},
};

pub const DEFAULT_MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
const MAX_FILE_NAME_CHARS: usize = 128;
const MAX_DEDUP_SUFFIX: u32 = 200;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{} is empty", .0.display())]
    EmptyFile(PathBuf),
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is {size} bytes (max {max})", path.display())]
    TooLarge { path: PathBuf, size: u64, max: u64 },
    #[error("upload failed: {0}")]
    Share(#[source] ApiError),
    #[error("file was uploaded but the message could not be sent: {0}")]
    Announce(#[source] SyncError),
    #[error("file {0} is no longer available")]
    Unavailable(String),
    #[error("download failed: {0}")]
    Fetch(#[source] ApiError),
    #[error("cannot save to {}: {source}", path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileTransfer {
    api: ApiClient,
    max_file_bytes: u64,
}

impl FileTransfer {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: u64) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Uploads `path` for `peer_id` and sends its descriptor through `engine`.
    pub async fn share(
        &self,
        engine: &mut SyncEngine,
        peer_id: &str,
        path: &Path,
    ) -> Result<FileDescriptor, TransferError> {
        if engine.session().is_none() {
            return Err(TransferError::Announce(SyncError::NoSession));
        }

        let unreadable = |source| TransferError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(unreadable)?;
        if !metadata.is_file() {
            return Err(unreadable(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        if metadata.len() > self.max_file_bytes {
            return Err(TransferError::TooLarge {
                path: path.to_path_buf(),
                size: metadata.len(),
                max: self.max_file_bytes,
            });
        }

        let bytes = tokio::fs::read(path).await.map_err(unreadable)?;
        if bytes.is_empty() {
            return Err(TransferError::EmptyFile(path.to_path_buf()));
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".to_owned());
        let size = bytes.len();
        let record = self
            .api
            .share_file(peer_id, &file_name, bytes)
            .await
            .map_err(TransferError::Share)?;
        let descriptor = FileDescriptor::from(record);
        info!(file_id = %descriptor.id, name = %descriptor.name, size, peer_id, "file shared");

        engine
            .send_body(peer_id, MessageBody::File(descriptor.clone()))
            .await
            .map_err(TransferError::Announce)?;
        Ok(descriptor)
    }

    /// Downloads `file_id` into `dest_dir` and returns the written path.
    pub async fn request(
        &self,
        file_id: &str,
        dest_dir: &Path,
        name_hint: Option<&str>,
    ) -> Result<PathBuf, TransferError> {
        let bytes = self
            .api
            .request_file(file_id)
            .await
            .map_err(TransferError::Fetch)?
            .ok_or_else(|| TransferError::Unavailable(file_id.to_owned()))?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| TransferError::Save {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let safe = sanitize_file_name(name_hint.unwrap_or(file_id));
        let dest = unique_destination(dest_dir, &safe).ok_or_else(|| TransferError::Save {
            path: dest_dir.join(&safe),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{MAX_DEDUP_SUFFIX} numbered copies already exist"),
            ),
        })?;
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|source| TransferError::Save {
                path: dest.clone(),
                source,
            })?;

        info!(file_id, path = %dest.display(), size = bytes.len(), "file saved");
        Ok(dest)
    }

    pub async fn request_descriptor(
        &self,
        descriptor: &FileDescriptor,
        dest_dir: &Path,
    ) -> Result<PathBuf, TransferError> {
        self.request(&descriptor.id, dest_dir, Some(&descriptor.name))
            .await
    }
}

/// Replaces path separators, reserved characters and control characters.
pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "file.bin".to_owned();
    }

    let mut out: String = trimmed
        .chars()
        .map(|ch| match ch {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .take(MAX_FILE_NAME_CHARS)
        .collect();
    if out.starts_with('.') {
        out.replace_range(0..1, "_");
    }
    out
}

/// `name`, or `stem (n).ext` for the first `n` not yet taken in `dir`.
/// `None` once every numbered name is taken.
pub fn unique_destination(dir: &Path, name: &str) -> Option<PathBuf> {
    let dest = dir.join(name);
    if !dest.exists() {
        return Some(dest);
    }

    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("file");
    let ext = as_path.extension().and_then(|ext| ext.to_str());
    for i in 1..=MAX_DEDUP_SUFFIX {
        let candidate = match ext {
            Some(ext) => dir.join(format!("{stem} ({i}).{ext}")),
            None => dir.join(format!("{stem} ({i})")),
        };
        if !candidate.exists() {
            return Some(candidate);
        }
    }
    None
}
