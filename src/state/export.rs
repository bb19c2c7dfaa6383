//! File download and the host's zip export

use super::AppState;
use crate::archive;
use crate::error::{FileError, RoundError};
use crate::files::{audio_extension, content_type_for};
use crate::protocol::{Outcome, Warning};
use crate::types::*;
use chrono::Utc;

/// Alias for the round's sample
pub const SAMPLE_ALIAS: &str = "sample";
/// Alias for the telephone upload handed to the caller
pub const ASSIGNED_ALIAS: &str = "assigned";

/// A file ready to send to the client
#[derive(Debug, Clone)]
pub struct Download {
    /// Name offered in `Content-Disposition`
    pub download_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExportArchive {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub entries: usize,
}

fn not_found_on_disk(e: FileError) -> RoundError {
    if e.is_not_found() {
        tracing::warn!(path = %e.path.display(), "Referenced file missing on disk");
        RoundError::NotFound("File not found on server".to_string())
    } else {
        e.into()
    }
}

impl AppState {
    /// Resolve `requested` (a stored filename or one of the aliases) and read it.
    ///
    /// Participants may download anything in their round; anyone else with a
    /// session needs `allow_guest_download`.
    pub async fn download_file(
        &self,
        code: &str,
        session: Option<&Session>,
        requested: &str,
    ) -> Result<Download, RoundError> {
        let session = session.ok_or(RoundError::Unauthorized)?;
        let round = self.load_round(code, self.deadline()).await?;

        let participant = session
            .belongs_to(code)
            .then(|| round.participant(&session.participant_id))
            .flatten();
        if participant.is_none() && !round.allow_guest_download {
            return Err(RoundError::Forbidden(
                "You must be a participant to download files".to_string(),
            ));
        }

        let (filename, download_name) = if requested == SAMPLE_ALIAS
            || round.sample_file_id.as_deref() == Some(requested)
        {
            let sample = round
                .sample_file_id
                .as_deref()
                .ok_or_else(|| RoundError::NotFound("No sample uploaded yet".to_string()))?;
            let ext = audio_extension(sample).unwrap_or("mp3");
            (sample.to_string(), format!("sample.{ext}"))
        } else if requested == ASSIGNED_ALIAS {
            let me = participant.map(|p| p.id.as_str());
            let assigned = round
                .submissions
                .values()
                .find(|s| me.is_some() && s.assigned_to_id.as_deref() == me)
                .ok_or_else(|| {
                    RoundError::NotFound("Nothing has been passed to you yet".to_string())
                })?;
            (assigned.filename.clone(), assigned.original_name.clone())
        } else {
            let submission = round
                .submissions
                .values()
                .find(|s| s.filename == requested)
                .ok_or_else(|| {
                    RoundError::NotFound("File not found or not available for download".to_string())
                })?;
            (submission.filename.clone(), submission.original_name.clone())
        };

        let bytes = self
            .uploads
            .read(&round.id, &filename)
            .await
            .map_err(not_found_on_disk)?;

        tracing::debug!(round = %code, filename = %filename, size = bytes.len(), "Serving download");

        Ok(Download {
            download_name,
            content_type: content_type_for(&filename),
            bytes,
        })
    }

    /// Bundle the sample and every submission into one zip (host only).
    /// Unreadable files are skipped with a warning.
    pub async fn export_round(
        &self,
        code: &str,
        session: Option<&Session>,
    ) -> Result<Outcome<ExportArchive>, RoundError> {
        let session = session.ok_or(RoundError::Unauthorized)?;
        let round = self.load_round(code, self.deadline()).await?;

        if !session.belongs_to(code) || !round.is_host(&session.participant_id) {
            return Err(RoundError::Forbidden(
                "Only the host can export all files".to_string(),
            ));
        }

        let plan = archive::plan_entries(&round);
        if plan.is_empty() {
            return Err(RoundError::NotFound("No files to export".to_string()));
        }

        let reads = plan
            .iter()
            .map(|entry| self.uploads.read(&round.id, &entry.filename));
        let contents = futures::future::join_all(reads).await;

        let mut files = Vec::with_capacity(plan.len());
        let mut warnings = Vec::new();
        for (entry, read) in plan.into_iter().zip(contents) {
            match read {
                Ok(bytes) => files.push((entry.name, bytes)),
                Err(e) => {
                    tracing::warn!(
                        round = %code,
                        filename = %entry.filename,
                        error = %e,
                        "Skipping unreadable file in export"
                    );
                    warnings.push(Warning::ArchiveEntrySkipped {
                        filename: entry.filename,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let bytes = archive::build_zip(&files)?;
        let filename = archive::archive_filename(&round.name, Utc::now());

        tracing::info!(
            round = %code,
            entries = files.len(),
            skipped = warnings.len(),
            size = bytes.len(),
            "Export built"
        );

        Ok(Outcome::with_warnings(
            ExportArchive {
                filename,
                bytes,
                entries: files.len(),
            },
            warnings,
        ))
    }
}
