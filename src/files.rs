//! Round-scoped audio file storage.
//!
//! Files live under `<root>/<round id>/` with server-generated names. The
//! write discipline for replacements is: write the new file, save the round,
//! and only then delete the superseded file. If the save fails the new file
//! is removed again.

use axum::body::Bytes;
use rand::Rng;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::config::MAX_UPLOAD_BYTES;
use crate::error::{FileError, RejectCode, RoundError};
use crate::protocol::Warning;

/// Accepted audio extensions (lowercase, without the dot)
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "flac", "ogg", "aac"];

/// Filename marker for host sample uploads
pub const SAMPLE_MARKER: &str = "SAMPLE";

const DISAMBIGUATOR_LEN: usize = 8;
const MAX_NAME_ATTEMPTS: usize = 8;

/// A file received from a multipart form, not yet validated
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client-supplied name; untrusted
    pub original_name: String,
    pub bytes: Bytes,
}

impl UploadedFile {
    pub fn new(original_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            original_name: original_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Check extension and size. Returns the normalised extension.
    pub fn validate(&self) -> Result<&'static str, RoundError> {
        let ext = audio_extension(&self.original_name).ok_or_else(|| {
            RoundError::invalid(
                RejectCode::UnsupportedFileType,
                "Invalid file type. Please upload an audio file (mp3, wav, m4a, flac, ogg, aac)",
            )
        })?;

        if self.bytes.len() > MAX_UPLOAD_BYTES {
            return Err(RoundError::invalid(
                RejectCode::FileTooLarge,
                "File too large (max 32MB)",
            ));
        }

        if self.bytes.is_empty() {
            return Err(RoundError::invalid(RejectCode::NoFile, "Uploaded file is empty"));
        }

        Ok(ext)
    }
}

/// Match the extension of `name` against the allow-list (case-insensitive)
pub fn audio_extension(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
    ALLOWED_EXTENSIONS.iter().copied().find(|allowed| *allowed == ext)
}

/// MIME type for a stored audio file
pub fn content_type_for(filename: &str) -> &'static str {
    match audio_extension(filename) {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("m4a") => "audio/mp4",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("aac") => "audio/aac",
        _ => "application/octet-stream",
    }
}

/// Who a stored file belongs to; decides the filename prefix
#[derive(Debug, Clone, Copy)]
pub enum FileOwner<'a> {
    Participant(&'a str),
    Sample,
}

fn random_disambiguator() -> String {
    let mut bytes = [0u8; DISAMBIGUATOR_LEN / 2];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// `<owner>_<random>_<unix seconds>.<ext>`
pub fn generate_filename(owner: FileOwner<'_>, ext: &str) -> String {
    let prefix: String = match owner {
        FileOwner::Participant(id) => id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect(),
        FileOwner::Sample => SAMPLE_MARKER.to_string(),
    };
    format!(
        "{}_{}_{}.{}",
        prefix,
        random_disambiguator(),
        chrono::Utc::now().timestamp(),
        ext
    )
}

/// Result of writing an upload to disk
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct UploadDir {
    root: PathBuf,
}

impl UploadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Round directories are keyed by round id, not join code, so files
    /// outlive code reuse.
    pub fn round_dir(&self, round_id: &str) -> PathBuf {
        self.root.join(round_id)
    }

    pub fn path(&self, round_id: &str, filename: &str) -> PathBuf {
        self.round_dir(round_id).join(filename)
    }

    pub async fn ensure_root(&self) -> Result<(), FileError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| FileError::new("create directory", &self.root, e))
    }

    pub async fn ensure_round_dir(&self, round_id: &str) -> Result<(), FileError> {
        let dir = self.round_dir(round_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| FileError::new("create directory", dir, e))
    }

    /// Write `bytes` under a freshly generated name. Never overwrites an
    /// existing file: a name clash draws a new disambiguator.
    pub async fn write_new(
        &self,
        round_id: &str,
        owner: FileOwner<'_>,
        ext: &str,
        bytes: &[u8],
    ) -> Result<StoredFile, FileError> {
        self.ensure_round_dir(round_id).await?;

        let mut attempt = 0;
        let (filename, path, mut file) = loop {
            attempt += 1;
            let filename = generate_filename(owner, ext);
            let path = self.path(round_id, &filename);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => break (filename, path, file),
                Err(e)
                    if e.kind() == std::io::ErrorKind::AlreadyExists
                        && attempt < MAX_NAME_ATTEMPTS =>
                {
                    tracing::debug!(filename = %filename, "Generated filename already taken, retrying");
                }
                Err(e) => return Err(FileError::new("create", path, e)),
            }
        };

        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            drop(file);
            if let Err(cleanup) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %cleanup, "Failed to remove partial file");
            }
            return Err(FileError::new("write", path, e));
        }

        Ok(StoredFile {
            filename,
            size: bytes.len() as u64,
        })
    }

    pub async fn read(&self, round_id: &str, filename: &str) -> Result<Vec<u8>, FileError> {
        let path = self.path(round_id, filename);
        tokio::fs::read(&path)
            .await
            .map_err(|e| FileError::new("read", path, e))
    }

    pub async fn remove(&self, round_id: &str, filename: &str) -> Result<(), FileError> {
        let path = self.path(round_id, filename);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| FileError::new("remove", path, e))
    }

    /// Best-effort deletion of a file the round no longer references.
    /// Failure is logged and reported as a warning, never as an error.
    pub async fn discard_superseded(&self, round_id: &str, filename: &str) -> Option<Warning> {
        match self.remove(round_id, filename).await {
            Ok(()) => {
                tracing::info!(round_id, filename, "Deleted superseded file");
                None
            }
            Err(e) => {
                tracing::warn!(round_id, filename, error = %e, "Could not delete superseded file");
                Some(Warning::StaleFileRetained {
                    filename: filename.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
