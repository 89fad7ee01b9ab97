//! Processing manifest
//!
//! The manifest is the only durable state kept outside the store. It records,
//! per source filename, the fingerprint and size that were loaded and when.
//! Entries are never removed: a file that disappears and later comes back
//! unchanged is not reloaded.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::error::{ManifestError, ManifestResult};
use super::fingerprint::Fingerprint;

/// What was recorded for one loaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub hash: Fingerprint,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub processed_at: DateTime<Utc>,
    pub file_size: u64,
}

/// Filename to entry mapping plus the last full load time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingManifest {
    #[serde(default)]
    pub processed_files: BTreeMap<String, ManifestEntry>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_full_load: Option<DateTime<Utc>>,
}

impl ProcessingManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `filename` was never loaded or was loaded with other content
    pub fn is_changed(&self, filename: &str, fingerprint: &Fingerprint) -> bool {
        self.processed_files
            .get(filename)
            .is_none_or(|entry| entry.hash != *fingerprint)
    }

    pub fn entry(&self, filename: &str) -> Option<&ManifestEntry> {
        self.processed_files.get(filename)
    }

    /// Record a file whose rows are committed to the store
    pub fn record(
        &mut self,
        filename: impl Into<String>,
        hash: Fingerprint,
        file_size: u64,
        processed_at: DateTime<Utc>,
    ) {
        self.processed_files.insert(
            filename.into(),
            ManifestEntry {
                hash,
                processed_at,
                file_size,
            },
        );
    }

    pub fn mark_full_load(&mut self, at: DateTime<Utc>) {
        self.last_full_load = Some(at);
    }

    pub fn len(&self) -> usize {
        self.processed_files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed_files.is_empty()
    }
}

/// Reads and atomically rewrites the manifest file
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest; a missing file yields an empty manifest
    pub fn load(&self) -> ManifestResult<ProcessingManifest> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest at {}, starting empty", self.path.display());
                return Ok(ProcessingManifest::new());
            }
            Err(source) => {
                return Err(ManifestError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&content).map_err(|e| ManifestError::Corrupt {
            path: self.path.clone(),
            error: e.to_string(),
        })
    }

    /// Replace the manifest file with `manifest`
    ///
    /// Writes a sibling temporary file, syncs it and renames it over the
    /// target so a crash leaves either the old or the new document.
    pub fn save(&self, manifest: &ProcessingManifest) -> ManifestResult<()> {
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| ManifestError::Serialize(e.to_string()))?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let tmp_path = self.tmp_path();
        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };

        if let Err(source) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(self.io_error(source));
        }

        debug!(
            "Saved manifest with {} entries to {}",
            manifest.len(),
            self.path.display()
        );
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> ManifestError {
        ManifestError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Accept RFC 3339 timestamps and the naive ISO form older manifests used
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))
}

fn deserialize_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(d)?;
    parse_timestamp(&s).map_err(serde::de::Error::custom)
}

fn deserialize_optional_timestamp<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    match Option::<String>::deserialize(d)? {
        Some(s) => parse_timestamp(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
