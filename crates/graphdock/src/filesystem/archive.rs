//! Gzip-compressed tar archives of test folders.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use graphdock_common::HarnessResult;
use walkdir::WalkDir;

/// An entry left out of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// The path that could not be archived.
    pub path: PathBuf,
    /// Why.
    pub reason: String,
}

/// Result of archiving one directory.
#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    /// The archive written.
    pub archive: PathBuf,
    /// Number of files archived.
    pub entries: usize,
    /// Files that could not be read.
    pub skipped: Vec<SkippedEntry>,
}

/// Path of the archive for `dir`: `<root>/<leaf>.tar.gz`.
#[must_use]
pub fn archive_path(dir: &Path, root: &Path) -> PathBuf {
    let leaf = dir
        .file_name()
        .map_or_else(|| "archive".into(), |name| name.to_string_lossy());
    root.join(format!("{leaf}.tar.gz"))
}

/// Archive every non-directory entry below `dir` into `<root>/<leaf>.tar.gz`.
///
/// Entry names are relative to `root`. Unreadable entries are logged and
/// skipped; the rest of the tree is still archived.
///
/// # Errors
///
/// Returns an error only if the archive file itself cannot be written.
pub fn archive_directory(dir: &Path, root: &Path) -> HarnessResult<ArchiveOutcome> {
    let archive = archive_path(dir, root);
    let file = File::create(&archive)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut entries = 0;
    let mut skipped = Vec::new();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().map_or_else(|| dir.to_path_buf(), Path::to_path_buf);
                tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
                skipped.push(SkippedEntry {
                    path,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        let name = path.strip_prefix(root).unwrap_or(path);
        let appended = File::open(path).and_then(|mut f| builder.append_file(name, &mut f));
        match appended {
            Ok(()) => entries += 1,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable entry");
                skipped.push(SkippedEntry {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        }
    }

    builder.into_inner()?.finish()?.flush()?;
    tracing::info!(
        archive = %archive.display(),
        entries,
        skipped = skipped.len(),
        "Archived directory"
    );
    Ok(ArchiveOutcome {
        archive,
        entries,
        skipped,
    })
}
