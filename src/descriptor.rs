use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use crate::case::{CaseDeclaration, ConversionRole};
use crate::checksum::bytes_checksum;
use crate::error::FixtureError;
use crate::manifest::FileDependencyMap;
use crate::store::{CASE_FILE, Store};

pub const NOISE_RUN_FILE: &str = "run_noise.yml";
pub const MAIN_RUN_FILE: &str = "run_main.yml";

const NOISE_PLACEHOLDER: &str = "default_measurement_dependencies.xml";
const MAIN_PLACEHOLDER: &str = "default.xml";
const DEPENDENCY_BUFFER: &str = "noisecovariance";
const DEPENDENCY_ARGS: &[&str] = &[
    "--disable_storage",
    "true",
    "--parameter",
    "noisecovariancein=$(NOISECOVARIANCE_PIPE)",
];

/// Known data-quality workaround: these cases declare a dependency pass they never use, so no
/// dependency run file or buffer wiring is generated for them.
pub const UNUSED_DEPENDENCY_CASES: &[&str] =
    &["epi_2d.cfg", "generic_nl_spirit_cartesian_sampling_cine.cfg"];

/// Known data-quality workaround: these cases peak above their declared memory requirement.
/// Values are extra gigabytes added on top of the rounded declaration.
pub const MEMORY_BUMPS: &[(&str, u64)] = &[
    ("generic_grappa2x1_3d.cfg", 4),
    ("generic_grappa2x2_3d.cfg", 4),
    ("epi_2d.cfg", 4),
    ("generic_spirit_cartesian_sampling_spat2.cfg", 4),
    ("generic_rtcine_ai_landmark.cfg", 4),
];

#[derive(Debug, Clone)]
pub struct DescriptorOverrides {
    pub unused_dependency: BTreeSet<String>,
    pub memory_bumps_gb: BTreeMap<String, u64>,
}

impl Default for DescriptorOverrides {
    fn default() -> Self {
        Self {
            unused_dependency: UNUSED_DEPENDENCY_CASES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            memory_bumps_gb: MEMORY_BUMPS
                .iter()
                .map(|(name, extra)| (name.to_string(), *extra))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DescriptorTemplates {
    pub noise: Utf8PathBuf,
    pub main: Utf8PathBuf,
    pub worker_image: String,
}

/// Renders run descriptors and the case summary for one case.
#[derive(Debug, Clone)]
pub struct DescriptorGenerator {
    store: Store,
    templates: DescriptorTemplates,
    overrides: DescriptorOverrides,
}

#[derive(Debug, Serialize)]
struct CaseSummaryFile {
    case: CaseSummary,
}

#[derive(Debug, Default, Serialize)]
struct CaseSummary {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    noise: Option<RunEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    main: Option<RunEntry>,
    validation: ValidationSummary,
}

#[derive(Debug, Serialize)]
struct RunEntry {
    run_file_path: String,
    dat_file_path: String,
}

#[derive(Debug, Default, Serialize)]
struct ValidationSummary {
    images: BTreeMap<String, ImageThresholds>,
}

#[derive(Debug, Serialize)]
struct ImageThresholds {
    reference_file_path: String,
    scale_comparison_threshold: f64,
    value_comparison_threshold: f64,
}

impl DescriptorGenerator {
    pub fn new(
        store: Store,
        templates: DescriptorTemplates,
        overrides: DescriptorOverrides,
    ) -> Self {
        Self {
            store,
            templates,
            overrides,
        }
    }

    pub fn generate(
        &self,
        case: &CaseDeclaration,
        case_dir: &Utf8Path,
    ) -> Result<FileDependencyMap, FixtureError> {
        let mut dependencies = FileDependencyMap::new();
        let mut summary = CaseSummary {
            name: case.name.to_string(),
            ..CaseSummary::default()
        };
        let uses_dependency = self.uses_dependency(case);

        if uses_dependency {
            let rendered = self.render_noise(case)?;
            let path = case_dir.join(NOISE_RUN_FILE);
            dependencies.insert(self.store.relative_key(&path)?, write_rendered(&path, &rendered)?);
            summary.noise = Some(RunEntry {
                run_file_path: path.to_string(),
                dat_file_path: case_dir
                    .join(ConversionRole::Dependency.artifact_name())
                    .to_string(),
            });
        }

        if case.reconstruction_client.is_some() {
            let rendered = self.render_main(case, uses_dependency)?;
            let path = case_dir.join(MAIN_RUN_FILE);
            dependencies.insert(self.store.relative_key(&path)?, write_rendered(&path, &rendered)?);
            summary.main = Some(RunEntry {
                run_file_path: path.to_string(),
                dat_file_path: case_dir
                    .join(ConversionRole::Reconstruction.artifact_name())
                    .to_string(),
            });
        }

        for reference in &case.references {
            summary.validation.images.insert(
                reference.reference_images.clone(),
                ImageThresholds {
                    reference_file_path: case_dir.join(&reference.reference_file).to_string(),
                    scale_comparison_threshold: reference.scale_comparison_threshold,
                    value_comparison_threshold: reference.value_comparison_threshold,
                },
            );
        }

        // Written last: it describes every other file.
        let rendered = serde_yaml::to_string(&CaseSummaryFile { case: summary })
            .map_err(|err| FixtureError::Template(err.to_string()))?;
        let path = case_dir.join(CASE_FILE);
        dependencies.insert(self.store.relative_key(&path)?, write_rendered(&path, &rendered)?);

        Ok(dependencies)
    }

    pub fn uses_dependency(&self, case: &CaseDeclaration) -> bool {
        case.dependency_client.is_some()
            && !self.overrides.unused_dependency.contains(case.name.as_str())
    }

    /// Declared megabytes rounded up to whole gigabytes, plus any documented bump.
    pub fn memory_requirement(&self, case: &CaseDeclaration) -> String {
        let mut gigabytes = case.requirements.system_memory.div_ceil(1024);
        if let Some(extra) = self.overrides.memory_bumps_gb.get(case.name.as_str()) {
            gigabytes += extra;
        }
        format!("{gigabytes}G")
    }

    fn render_noise(&self, case: &CaseDeclaration) -> Result<String, FixtureError> {
        let Some(client) = &case.dependency_client else {
            return Err(FixtureError::Template(format!(
                "{}: no dependency client configuration",
                case.name
            )));
        };
        let mut document = load_template(&self.templates.noise)?;
        let codespec = job_codespec(&mut document)?;
        replace_placeholder(codespec, NOISE_PLACEHOLDER, &client.configuration)?;
        to_yaml(&document)
    }

    fn render_main(
        &self,
        case: &CaseDeclaration,
        uses_dependency: bool,
    ) -> Result<String, FixtureError> {
        let Some(client) = &case.reconstruction_client else {
            return Err(FixtureError::Template(format!(
                "{}: no reconstruction client configuration",
                case.name
            )));
        };
        let memory = self.memory_requirement(case);
        let mut document = load_template(&self.templates.main)?;
        {
            let codespec = job_codespec(&mut document)?;
            replace_placeholder(codespec, MAIN_PLACEHOLDER, &client.configuration)?;

            if uses_dependency {
                let buffers = child_mapping(codespec, "buffers")?;
                sequence(buffers, "inputs")?.push(Value::from(DEPENDENCY_BUFFER));
                sequence(codespec, "args")?
                    .extend(DEPENDENCY_ARGS.iter().copied().map(Value::from));
            }

            let resources = child_mapping(codespec, "resources")?;
            if case.requirements.gpu_support {
                resources.insert(Value::from("gpu"), Value::from("1"));
            }
            child_mapping(resources, "requests")?
                .insert(Value::from("memory"), Value::from(memory.as_str()));
            child_mapping(resources, "limits")?
                .insert(Value::from("memory"), Value::from(memory.as_str()));

            if case.distributed.is_some() {
                let env = child_mapping(codespec, "env")?;
                env.insert(
                    Value::from("GADGETRON_REMOTE_WORKER_COMMAND"),
                    Value::from("printenv TYGER_GADGETRON_WORKER_ENDPOINT_ADDRESSES"),
                );
            }
        }

        if let Some(distributed) = &case.distributed {
            let root = root_mapping(&mut document)?;
            root.insert(
                Value::from("worker"),
                self.worker_section(distributed.nodes, &memory),
            );
        }

        to_yaml(&document)
    }

    fn worker_section(&self, replicas: u32, memory: &str) -> Value {
        let mut requests = Mapping::new();
        requests.insert(Value::from("cpu"), Value::from("3000m"));
        requests.insert(Value::from("memory"), Value::from(memory));
        let mut limits = Mapping::new();
        limits.insert(Value::from("memory"), Value::from(memory));
        let mut resources = Mapping::new();
        resources.insert(Value::from("requests"), Value::Mapping(requests));
        resources.insert(Value::from("limits"), Value::Mapping(limits));
        let mut endpoints = Mapping::new();
        endpoints.insert(Value::from("gadgetron"), Value::from(9002));

        let mut codespec = Mapping::new();
        codespec.insert(
            Value::from("image"),
            Value::from(self.templates.worker_image.as_str()),
        );
        codespec.insert(Value::from("args"), Value::Sequence(Vec::new()));
        codespec.insert(Value::from("resources"), Value::Mapping(resources));
        codespec.insert(Value::from("endpoints"), Value::Mapping(endpoints));

        let mut worker = Mapping::new();
        worker.insert(Value::from("codespec"), Value::Mapping(codespec));
        worker.insert(Value::from("replicas"), Value::from(replicas));
        worker.insert(Value::from("nodepool"), Value::from("cpunp"));
        Value::Mapping(worker)
    }
}

fn load_template(path: &Utf8Path) -> Result<Value, FixtureError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| FixtureError::Template(format!("read {path}: {err}")))?;
    serde_yaml::from_str(&content).map_err(|err| FixtureError::Template(format!("{path}: {err}")))
}

fn to_yaml(document: &Value) -> Result<String, FixtureError> {
    serde_yaml::to_string(document).map_err(|err| FixtureError::Template(err.to_string()))
}

fn write_rendered(path: &Utf8Path, rendered: &str) -> Result<String, FixtureError> {
    tracing::info!(%path, "generating");
    Store::write_bytes_atomic(path, rendered.as_bytes())?;
    Ok(bytes_checksum(rendered.as_bytes()))
}

fn root_mapping(document: &mut Value) -> Result<&mut Mapping, FixtureError> {
    document
        .as_mapping_mut()
        .ok_or_else(|| FixtureError::Template("template root is not a mapping".to_string()))
}

fn job_codespec(document: &mut Value) -> Result<&mut Mapping, FixtureError> {
    let job = child_mapping(root_mapping(document)?, "job")?;
    child_mapping(job, "codespec")
}

/// The mapping under `key`, created when absent or null.
fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Mapping, FixtureError> {
    if parent.get(key).is_none_or(Value::is_null) {
        parent.insert(Value::from(key), Value::Mapping(Mapping::new()));
    }
    parent
        .get_mut(key)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| FixtureError::Template(format!("`{key}` is not a mapping")))
}

/// The sequence under `key`, created when absent or null.
fn sequence<'a>(parent: &'a mut Mapping, key: &str) -> Result<&'a mut Vec<Value>, FixtureError> {
    if parent.get(key).is_none_or(Value::is_null) {
        parent.insert(Value::from(key), Value::Sequence(Vec::new()));
    }
    parent
        .get_mut(key)
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| FixtureError::Template(format!("`{key}` is not a sequence")))
}

fn replace_placeholder(
    codespec: &mut Mapping,
    placeholder: &str,
    replacement: &str,
) -> Result<(), FixtureError> {
    for arg in sequence(codespec, "args")?.iter_mut() {
        if arg.as_str() == Some(placeholder) {
            *arg = Value::from(replacement);
        }
    }
    Ok(())
}
