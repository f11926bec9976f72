use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use tempfile::Builder;

use crate::case::{CaseDeclaration, ConversionRole, RawConversion};
use crate::error::FixtureError;
use crate::manifest::FileDependencyMap;
use crate::signature::SignatureComputer;
use crate::store::Store;

/// Produces the data files of one case: converted artifacts, copied inputs and references.
#[derive(Debug, Clone)]
pub struct ArtifactGenerator {
    store: Store,
    signatures: Arc<SignatureComputer>,
}

impl ArtifactGenerator {
    pub fn new(store: Store, signatures: Arc<SignatureComputer>) -> Self {
        Self { store, signatures }
    }

    pub fn generate(
        &self,
        case: &CaseDeclaration,
        case_dir: &Utf8Path,
    ) -> Result<FileDependencyMap, FixtureError> {
        fs::create_dir_all(case_dir.as_std_path())
            .map_err(|err| FixtureError::Filesystem(format!("create {case_dir}: {err}")))?;
        let mut dependencies = FileDependencyMap::new();

        for (role, raw) in case.conversions() {
            let output = case_dir.join(role.artifact_name());
            let signature = self.convert(role, raw, &output)?;
            dependencies.insert(self.store.relative_key(&output)?, signature);
        }

        if let Some(copy) = case.copy_source() {
            let output = case_dir.join(ConversionRole::Reconstruction.artifact_name());
            Store::copy_file_atomic(&self.store.cached_file(&copy.source), &output)?;
            let checksum = self.signatures.checksums().lookup(&copy.source)?;
            dependencies.insert(self.store.relative_key(&output)?, checksum.to_string());
        }

        for reference in &case.references {
            let output = case_dir.join(&reference.reference_file);
            if !output.as_std_path().exists() {
                Store::copy_file_atomic(
                    &self.store.cached_file(&reference.reference_file),
                    &output,
                )?;
            }
            let checksum = self.signatures.checksums().lookup(&reference.reference_file)?;
            dependencies.insert(self.store.relative_key(&output)?, checksum.to_string());
        }

        Ok(dependencies)
    }

    fn convert(
        &self,
        role: ConversionRole,
        raw: &RawConversion,
        output: &Utf8Path,
    ) -> Result<String, FixtureError> {
        // The converter refuses to overwrite, and a crashed run may have left a partial file.
        if Store::remove_file_if_exists(output)? {
            tracing::warn!(%output, "deleting file to avoid conversion errors");
        }

        let command = self.signatures.command(raw, output);
        let working_dir = Builder::new()
            .prefix("recon-fixtures-convert")
            .tempdir()
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        tracing::info!(?role, source = %raw.data_file, %output, "converting");
        self.signatures
            .converter()
            .run(&command, working_dir.path())?;

        if !output.as_std_path().exists() {
            return Err(FixtureError::ConverterFailed(format!(
                "converter exited successfully but produced no {output}"
            )));
        }
        self.signatures.compute(raw, output)
    }
}
