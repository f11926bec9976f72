use std::collections::BTreeSet;
use std::sync::Arc;

use camino::Utf8Path;

use crate::case::{CaseDeclaration, ConversionRole};
use crate::checksum::{file_checksum, verify_file};
use crate::error::FixtureError;
use crate::manifest::CaseRecord;
use crate::signature::SignatureComputer;
use crate::store::Store;

/// Proves a recorded case still matches what is on disk, without downloading or converting.
#[derive(Debug, Clone)]
pub struct Validator {
    store: Store,
    signatures: Arc<SignatureComputer>,
}

impl Validator {
    pub fn new(store: Store, signatures: Arc<SignatureComputer>) -> Self {
        Self { store, signatures }
    }

    pub fn validate(
        &self,
        case: &CaseDeclaration,
        case_dir: &Utf8Path,
        record: &CaseRecord,
    ) -> Result<(), FixtureError> {
        for key in record.file_dependencies.keys() {
            let path = self.store.resolve_key(key);
            if !path.as_std_path().exists() {
                return Err(FixtureError::MissingFile(path.to_string()));
            }
        }

        let mut checked = BTreeSet::new();

        let expected = self.recorded(case, record, &record.case_file_path)?;
        verify_file(
            self.store.resolve_key(&record.case_file_path).as_std_path(),
            expected,
        )?;
        checked.insert(record.case_file_path.clone());

        for (role, raw) in case.conversions() {
            let output = case_dir.join(role.artifact_name());
            let key = self.store.relative_key(&output)?;
            let expected = self.recorded(case, record, &key)?;
            let actual = self.signatures.compute(raw, &output)?;
            if actual != expected {
                return Err(FixtureError::SignatureMismatch {
                    path: output.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
            checked.insert(key);
        }

        if case.copy_source().is_some() {
            let output = case_dir.join(ConversionRole::Reconstruction.artifact_name());
            checked.insert(self.verify_plain(case, record, &output)?);
        }
        for reference in &case.references {
            let output = case_dir.join(&reference.reference_file);
            checked.insert(self.verify_plain(case, record, &output)?);
        }

        // Rendered run descriptors and anything else the record tracks.
        for (key, expected) in &record.file_dependencies {
            if checked.contains(key) {
                continue;
            }
            verify_file(self.store.resolve_key(key).as_std_path(), expected)?;
        }

        tracing::debug!(case = %case.name, files = record.file_dependencies.len(), "case valid");
        Ok(())
    }

    fn verify_plain(
        &self,
        case: &CaseDeclaration,
        record: &CaseRecord,
        path: &Utf8Path,
    ) -> Result<String, FixtureError> {
        let key = self.store.relative_key(path)?;
        let expected = self.recorded(case, record, &key)?;
        let actual = file_checksum(path.as_std_path())?;
        if actual != expected {
            return Err(FixtureError::ChecksumMismatch {
                path: path.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(key)
    }

    fn recorded<'a>(
        &self,
        case: &CaseDeclaration,
        record: &'a CaseRecord,
        key: &str,
    ) -> Result<&'a str, FixtureError> {
        record
            .file_dependencies
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| FixtureError::ManifestEntryMissing {
                case: case.name.to_string(),
                path: key.to_string(),
            })
    }
}
