use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::FixtureError;

/// Lowercase hex MD5 of a file's contents, streamed.
pub fn file_checksum(path: &Path) -> Result<String, FixtureError> {
    let mut file = fs::File::open(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            FixtureError::MissingFile(path.display().to_string())
        } else {
            FixtureError::Filesystem(format!("open {}: {err}", path.display()))
        }
    })?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)
        .map_err(|err| FixtureError::Filesystem(format!("read {}: {err}", path.display())))?;
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn bytes_checksum(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

/// Checksum over several byte strings fed in order, without separators.
pub fn concat_checksum<I, B>(parts: I) -> String
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    format!("{:x}", hasher.finalize())
}

pub fn verify_file(path: &Path, expected: &str) -> Result<(), FixtureError> {
    let actual = file_checksum(path)?;
    if actual != expected {
        return Err(FixtureError::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    tracing::debug!(path = %path.display(), "checksum match");
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChecksumEntry {
    pub file: String,
    pub md5: String,
}

/// Expected checksums of raw source files, keyed by path relative to the download cache.
#[derive(Debug, Clone, Default)]
pub struct ChecksumTable {
    entries: HashMap<String, String>,
}

impl ChecksumTable {
    pub fn load(path: &Path) -> Result<Self, FixtureError> {
        let content = fs::read_to_string(path)
            .map_err(|_| FixtureError::ConfigRead(path.to_path_buf()))?;
        let entries: Vec<ChecksumEntry> = serde_json::from_str(&content)
            .map_err(|err| FixtureError::ConfigParse(format!("{}: {err}", path.display())))?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ChecksumEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.file, entry.md5))
                .collect(),
        }
    }

    pub fn insert(&mut self, file: impl Into<String>, md5: impl Into<String>) {
        self.entries.insert(file.into(), md5.into());
    }

    pub fn lookup(&self, file: &str) -> Result<&str, FixtureError> {
        self.entries
            .get(file)
            .map(String::as_str)
            .ok_or_else(|| FixtureError::ChecksumNotFound(file.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
