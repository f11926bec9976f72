use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FixtureError {
    #[error("invalid case declaration: {0}")]
    InvalidCase(String),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("run descriptor template error: {0}")]
    Template(String),

    #[error("download request failed: {0}")]
    Http(String),

    #[error("remote store returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("failed downloading {url}: retry limit of {attempts} attempts exceeded")]
    #[diagnostic(help("check network connectivity and the raw data base url"))]
    FetchExhausted { url: String, attempts: u32 },

    #[error("{path}: checksum mismatch, expected {expected} got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("{path}: mismatched signatures, expected {expected}, actual {actual}")]
    #[diagnostic(help(
        "source data, conversion command or converter binary changed since the artifact was produced"
    ))]
    SignatureMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("file not found: {0}")]
    MissingFile(String),

    #[error("case {case} has no recorded dependency for {path}")]
    ManifestEntryMissing { case: String, path: String },

    #[error("no checksum entry for source file {0}")]
    #[diagnostic(help("the checksum table and the case declarations are out of sync"))]
    ChecksumNotFound(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("conversion failed: {0}")]
    ConverterFailed(String),

    #[error("conversion timed out after {seconds}s: {command}")]
    ConverterTimeout { command: String, seconds: u64 },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("worker task panicked: {0}")]
    TaskPanicked(String),

    #[error("{phase} failed for {} item(s):\n{}", .failures.len(), summarize(.failures))]
    BatchFailed {
        phase: BatchPhase,
        failures: Vec<ItemFailure>,
    },
}

impl FixtureError {
    /// Network conditions worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FixtureError::Http(_) => true,
            FixtureError::HttpStatus { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            _ => false,
        }
    }

    pub fn is_missing_file(&self) -> bool {
        matches!(self, FixtureError::MissingFile(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    Download,
    Generation,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPhase::Download => write!(f, "dependency download"),
            BatchPhase::Generation => write!(f, "case generation"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, error: &FixtureError) -> Self {
        Self {
            item: item.into(),
            reason: error.to_string(),
        }
    }
}

fn summarize(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("  {}: {}", failure.item, failure.reason))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_failure_lists_every_item() {
        let err = FixtureError::BatchFailed {
            phase: BatchPhase::Generation,
            failures: vec![
                ItemFailure::new("a.cfg", &FixtureError::ConverterFailed("boom".to_string())),
                ItemFailure::new("b.cfg", &FixtureError::MissingFile("x/main.h5".to_string())),
            ],
        };
        let message = err.to_string();
        assert!(message.starts_with("case generation failed for 2 item(s)"));
        assert!(message.contains("a.cfg: conversion failed: boom"));
        assert!(message.contains("b.cfg: file not found: x/main.h5"));
    }

    #[test]
    fn only_network_errors_are_transient() {
        assert!(FixtureError::Http("reset".to_string()).is_transient());
        assert!(
            FixtureError::HttpStatus {
                status: 503,
                url: "u".to_string()
            }
            .is_transient()
        );
        assert!(
            !FixtureError::HttpStatus {
                status: 404,
                url: "u".to_string()
            }
            .is_transient()
        );
        assert!(!FixtureError::ChecksumNotFound("a".to_string()).is_transient());
    }
}
