//! Source discovery and change detection

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::error::{IngestError, IngestResult};
use super::fingerprint::{FileHasher, Fingerprint};
use super::manifest::ProcessingManifest;

/// A file found in the source directory
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    /// Manifest key
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// How a file compares to the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    New,
    Modified,
    Unchanged,
}

/// A fingerprinted source file
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub fingerprint: Fingerprint,
    pub status: FileStatus,
}

/// Result of one detection pass; every list is sorted by filename
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub changed: Vec<SourceFile>,
    pub unchanged: Vec<SourceFile>,
    /// Files that could not be fingerprinted
    pub unreadable: Vec<(String, IngestError)>,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// List the files in `dir` matching `pattern`, sorted by name
pub fn discover_source_files(dir: &Path, pattern: &str) -> IngestResult<Vec<DiscoveredFile>> {
    if !dir.is_dir() {
        return Err(IngestError::io(
            dir,
            std::io::Error::new(std::io::ErrorKind::NotFound, "source directory not found"),
        ));
    }

    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&dir.to_string_lossy()),
        pattern
    );
    let entries = glob::glob(&full_pattern)
        .map_err(|e| IngestError::InvalidPattern(format!("{}: {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.is_file() => {
                let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let size = fs::metadata(&path)
                    .map_err(|e| IngestError::io(&path, e))?
                    .len();
                files.push(DiscoveredFile { name, path, size });
            }
            Ok(_) => {}
            Err(e) => warn!("Error accessing path: {}", e),
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Splits the source listing into changed and unchanged files
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    hasher: FileHasher,
}

impl ChangeDetector {
    pub fn new(hasher: FileHasher) -> Self {
        Self { hasher }
    }

    /// Fingerprint every file and compare it with the manifest
    ///
    /// A file that cannot be read lands in `unreadable`; the caller decides
    /// whether that is fatal.
    pub fn detect(&self, manifest: &ProcessingManifest, files: &[DiscoveredFile]) -> ChangeSet {
        let mut set = ChangeSet::default();

        let mut sorted: Vec<&DiscoveredFile> = files.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for file in sorted {
            let fingerprint = match self.hasher.fingerprint(&file.path) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!("Skipping {}: {}", file.name, e);
                    set.unreadable.push((file.name.clone(), e));
                    continue;
                }
            };

            let status = match manifest.entry(&file.name) {
                None => FileStatus::New,
                Some(_) if manifest.is_changed(&file.name, &fingerprint) => FileStatus::Modified,
                Some(_) => FileStatus::Unchanged,
            };
            debug!("{}: {:?} ({})", file.name, status, fingerprint);

            let source = SourceFile {
                name: file.name.clone(),
                path: file.path.clone(),
                size: file.size,
                fingerprint,
                status,
            };
            match status {
                FileStatus::Unchanged => set.unchanged.push(source),
                FileStatus::New | FileStatus::Modified => set.changed.push(source),
            }
        }

        set
    }
}
