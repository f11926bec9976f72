use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::artifacts::ArtifactGenerator;
use crate::case::CaseDeclaration;
use crate::checksum::ChecksumTable;
use crate::converter::Converter;
use crate::descriptor::{DescriptorGenerator, DescriptorOverrides, DescriptorTemplates};
use crate::error::{BatchPhase, FixtureError, ItemFailure};
use crate::fetch::{DependencyFetcher, RemoteStore};
use crate::manifest::{CaseRecord, Manifest};
use crate::pool::TaskGroup;
use crate::signature::SignatureComputer;
use crate::store::Store;
use crate::validator::Validator;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseIssue {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Recorded cases that passed validation untouched.
    pub validated: Vec<String>,
    /// Recorded cases that failed validation and were removed before regeneration.
    pub evicted: Vec<CaseIssue>,
    pub generated: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub valid: Vec<String>,
    pub invalid: Vec<CaseIssue>,
    /// Declared cases with no manifest record.
    pub unrecorded: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty() && self.unrecorded.is_empty()
    }
}

/// Brings the data root in line with a set of case declarations.
///
/// Recorded cases are validated and kept when they still hold; everything else is downloaded,
/// converted and described from scratch. The manifest is written by this thread only, after
/// every worker task has returned.
pub struct Orchestrator<R: RemoteStore> {
    store: Store,
    checksums: Arc<ChecksumTable>,
    fetcher: DependencyFetcher<R>,
    artifacts: ArtifactGenerator,
    descriptors: DescriptorGenerator,
    validator: Validator,
    pool: TaskGroup,
}

impl<R: RemoteStore> Orchestrator<R> {
    pub fn new(
        store: Store,
        checksums: ChecksumTable,
        converter: Converter,
        fetcher: DependencyFetcher<R>,
        templates: DescriptorTemplates,
        pool: TaskGroup,
    ) -> Self {
        let checksums = Arc::new(checksums);
        let signatures = Arc::new(SignatureComputer::new(
            store.clone(),
            Arc::clone(&checksums),
            Arc::new(converter),
        ));
        Self {
            artifacts: ArtifactGenerator::new(store.clone(), Arc::clone(&signatures)),
            descriptors: DescriptorGenerator::new(
                store.clone(),
                templates,
                DescriptorOverrides::default(),
            ),
            validator: Validator::new(store.clone(), signatures),
            store,
            checksums,
            fetcher,
            pool,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn orchestrate(&self, cases: &[CaseDeclaration]) -> Result<SyncReport, FixtureError> {
        check_unique(cases)?;
        self.store.ensure_data_root()?;
        let manifest_path = self.store.manifest_path();
        let mut manifest = Manifest::load(&manifest_path)?;
        let mut report = SyncReport::default();

        let outcome = self.sync(cases, &mut manifest, &mut report);

        // Progress made before a failure is kept.
        match manifest.save(&manifest_path) {
            Ok(()) => {
                tracing::info!(path = %manifest_path, cases = manifest.len(), "manifest saved")
            }
            Err(err) if outcome.is_err() => {
                tracing::error!(path = %manifest_path, error = %err, "failed to save manifest");
            }
            Err(err) => return Err(err),
        }

        report.validated.sort();
        report.generated.sort();
        report.evicted.sort_by(|a, b| a.name.cmp(&b.name));
        outcome.map(|()| report)
    }

    fn sync(
        &self,
        cases: &[CaseDeclaration],
        manifest: &mut Manifest,
        report: &mut SyncReport,
    ) -> Result<(), FixtureError> {
        let mut pending = Vec::new();
        let mut to_generate = Vec::new();
        for case in cases {
            match manifest.get(case.name.as_str()) {
                Some(record) => pending.push((case, record.clone())),
                None => to_generate.push(case),
            }
        }
        tracing::info!(
            validate = pending.len(),
            generate = to_generate.len(),
            "partitioned cases"
        );

        let outcomes = self.pool.run(pending, |(case, record)| {
            self.validator
                .validate(case, &self.store.case_dir(&case.name), record)
        });
        let mut evicted = Vec::new();
        for ((case, _), outcome) in outcomes {
            let Err(err) = outcome else {
                report.validated.push(case.name.to_string());
                continue;
            };
            if err.is_missing_file() {
                tracing::warn!(case = %case.name, error = %err, "case file missing, regenerating");
            } else {
                tracing::warn!(
                    case = %case.name,
                    error = %err,
                    "case failed validation, regenerating"
                );
            }
            manifest.remove(case.name.as_str());
            report.evicted.push(CaseIssue {
                name: case.name.to_string(),
                reason: err.to_string(),
            });
            evicted.push(case);
        }

        // Every failed record is already out of the manifest; a directory that cannot be
        // removed only blocks regeneration of its own case.
        let mut failures = Vec::new();
        for case in evicted {
            match self.store.remove_case_dir(&case.name) {
                Ok(_) => to_generate.push(case),
                Err(err) => {
                    tracing::error!(case = %case.name, error = %err, "failed to evict case");
                    failures.push(ItemFailure::new(case.name.to_string(), &err));
                }
            }
        }

        if !to_generate.is_empty() {
            to_generate.sort_by(|a, b| a.name.cmp(&b.name));
            self.generate_all(to_generate, manifest, report, &mut failures)?;
        }

        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by(|a, b| a.item.cmp(&b.item));
        Err(FixtureError::BatchFailed {
            phase: BatchPhase::Generation,
            failures,
        })
    }

    fn generate_all(
        &self,
        cases: Vec<&CaseDeclaration>,
        manifest: &mut Manifest,
        report: &mut SyncReport,
        failures: &mut Vec<ItemFailure>,
    ) -> Result<(), FixtureError> {
        self.fetcher
            .fetch_all(&cases, &self.checksums, &self.store, &self.pool)?;

        let outcomes = self.pool.run(cases, |case| self.generate_case(case));
        for (case, outcome) in outcomes {
            match outcome {
                Ok(record) => {
                    tracing::info!(
                        case = %case.name,
                        files = record.file_dependencies.len(),
                        "case generated"
                    );
                    manifest.upsert(record);
                    report.generated.push(case.name.to_string());
                }
                Err(err) => {
                    tracing::error!(case = %case.name, error = %err, "case generation failed");
                    failures.push(ItemFailure::new(case.name.to_string(), &err));
                }
            }
        }
        Ok(())
    }

    fn generate_case(&self, case: &CaseDeclaration) -> Result<CaseRecord, FixtureError> {
        let case_dir = self.store.case_dir(&case.name);
        let mut file_dependencies = self.artifacts.generate(case, &case_dir)?;
        file_dependencies.extend(self.descriptors.generate(case, &case_dir)?);
        Ok(CaseRecord {
            name: case.name.to_string(),
            case_file_path: self.store.relative_key(&self.store.case_file_path(&case.name))?,
            file_dependencies,
        })
    }

    /// Validates every declared case against the manifest. Nothing is evicted or written.
    pub fn verify(&self, cases: &[CaseDeclaration]) -> Result<VerifyReport, FixtureError> {
        check_unique(cases)?;
        let manifest = Manifest::load(&self.store.manifest_path())?;
        let mut report = VerifyReport::default();

        let mut pending = Vec::new();
        for case in cases {
            match manifest.get(case.name.as_str()) {
                Some(record) => pending.push((case, record)),
                None => report.unrecorded.push(case.name.to_string()),
            }
        }

        let outcomes = self.pool.run(pending, |(case, record)| {
            self.validator
                .validate(case, &self.store.case_dir(&case.name), record)
        });
        for ((case, _), outcome) in outcomes {
            match outcome {
                Ok(()) => report.valid.push(case.name.to_string()),
                Err(err) => report.invalid.push(CaseIssue {
                    name: case.name.to_string(),
                    reason: err.to_string(),
                }),
            }
        }

        report.valid.sort();
        report.unrecorded.sort();
        report.invalid.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(report)
    }
}

fn check_unique(cases: &[CaseDeclaration]) -> Result<(), FixtureError> {
    let mut seen = HashSet::new();
    for case in cases {
        if !seen.insert(case.name.directory_name()) {
            return Err(FixtureError::InvalidCase(format!(
                "duplicate case directory: {}",
                case.name
            )));
        }
    }
    Ok(())
}
