//! Export archive layout and zip assembly.
//!
//! Entry order is deterministic: the sample first (`00_sample_...`), then one
//! entry per submission ordered by the owner's display name, numbered from
//! `01`.

use chrono::{DateTime, Utc};
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

use crate::error::ArchiveError;
use crate::types::Round;

/// One file to place in the archive
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    /// Name inside the archive
    pub name: String,
    /// Stored filename inside the round's upload directory
    pub filename: String,
}

/// Make a name safe to use as a single archive path component
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '"' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

/// Decide what goes into the export and in which order
pub fn plan_entries(round: &Round) -> Vec<ArchiveEntry> {
    let mut entries = Vec::with_capacity(round.submissions.len() + 1);

    if let Some(sample) = &round.sample_file_id {
        entries.push(ArchiveEntry {
            name: format!("00_sample_{}", sanitize_component(sample)),
            filename: sample.clone(),
        });
    }

    let mut submissions: Vec<_> = round
        .submissions
        .values()
        .map(|s| {
            let name = round
                .display_name(&s.participant_id)
                .unwrap_or(&s.participant_id);
            (name, s)
        })
        .collect();
    // Case-sensitive lexical order by display name; id breaks ties
    submissions.sort_by(|(a_name, a), (b_name, b)| {
        a_name
            .cmp(b_name)
            .then_with(|| a.participant_id.cmp(&b.participant_id))
    });

    for (i, (display_name, submission)) in submissions.into_iter().enumerate() {
        entries.push(ArchiveEntry {
            name: format!(
                "{:02}_{}_{}",
                i + 1,
                sanitize_component(display_name),
                sanitize_component(&submission.original_name)
            ),
            filename: submission.filename.clone(),
        });
    }

    entries
}

/// `<roundName>_<YYYYmmdd_HHMMSS>_export.zip`
pub fn archive_filename(round_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_export.zip",
        sanitize_component(round_name),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Write the given `(name, contents)` pairs into an in-memory zip, in order
pub fn build_zip(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ArchiveError> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (name, contents) in files {
        writer.start_file(name.as_str(), options)?;
        writer.write_all(contents)?;
    }

    Ok(writer.finish()?.into_inner())
}
