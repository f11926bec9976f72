use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::case::{
    CaseDeclaration, CaseName, ClientConfig, CopySource, Distributed, RawConversion,
    ReconstructionClientConfig, ReconstructionSource, ReferenceTarget, Requirements,
};
use crate::error::FixtureError;

pub const DEFAULT_SETTINGS_FILE: &str = "recon-fixtures.json";
pub const DEFAULT_BASE_URL: &str = "http://gadgetrondata.blob.core.windows.net/gadgetrontestdata/";
pub const DEFAULT_CONVERTER: &str = "siemens_to_ismrmrd";
pub const DEFAULT_WORKER_IMAGE: &str = "eminencepublic.azurecr.io/gadgetron:current";
pub const DEFAULT_NOISE_TEMPLATE: &str = "config/gadgetron_noise.yml";
pub const DEFAULT_MAIN_TEMPLATE: &str = "config/gadgetron_default.yml";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CaseSetFile {
    #[serde(default)]
    pub cases: Vec<CaseEntry>,
}

/// A case as written in the case-set file. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CaseEntry {
    pub name: String,
    #[serde(default)]
    pub dependency_client: Option<ClientConfig>,
    #[serde(default)]
    pub dependency_raw: Option<RawConversion>,
    #[serde(default)]
    pub reconstruction_client: Option<ReconstructionClientConfig>,
    #[serde(default)]
    pub reconstruction_copy: Option<CopySource>,
    #[serde(default)]
    pub reconstruction_raw: Option<RawConversion>,
    #[serde(default)]
    pub reconstruction_tests: Vec<ReferenceTarget>,
    #[serde(default)]
    pub requirements: Option<Requirements>,
    #[serde(default)]
    pub distributed: Option<Distributed>,
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaseSet {
    pub cases: Vec<CaseDeclaration>,
}

impl CaseSet {
    /// Drops cases that need MATLAB or Julia support.
    pub fn supported(self) -> Vec<CaseDeclaration> {
        let total = self.cases.len();
        let supported = self
            .cases
            .into_iter()
            .filter(CaseDeclaration::is_supported)
            .collect::<Vec<_>>();
        tracing::info!(total, supported = supported.len(), "compatible test cases found");
        supported
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load_cases(path: &Path) -> Result<CaseSet, FixtureError> {
        let content =
            fs::read_to_string(path).map_err(|_| FixtureError::ConfigRead(path.to_path_buf()))?;
        let file: CaseSetFile = serde_json::from_str(&content)
            .map_err(|err| FixtureError::ConfigParse(format!("{}: {err}", path.display())))?;
        Self::resolve_cases(file)
    }

    pub fn resolve_cases(file: CaseSetFile) -> Result<CaseSet, FixtureError> {
        let mut seen = HashSet::new();
        let mut cases = Vec::with_capacity(file.cases.len());
        for entry in file.cases {
            let case = Self::resolve_case(entry)?;
            if !seen.insert(case.name.directory_name().to_string()) {
                return Err(FixtureError::InvalidCase(format!(
                    "duplicate case name: {}",
                    case.name
                )));
            }
            cases.push(case);
        }
        Ok(CaseSet { cases })
    }

    pub fn resolve_case(entry: CaseEntry) -> Result<CaseDeclaration, FixtureError> {
        let name: CaseName = entry.name.parse()?;

        let reconstruction_source = match (entry.reconstruction_raw, entry.reconstruction_copy) {
            (Some(_), Some(_)) => {
                return Err(FixtureError::InvalidCase(format!(
                    "{name}: reconstruction_raw and reconstruction_copy are mutually exclusive"
                )));
            }
            (Some(raw), None) => Some(ReconstructionSource::Raw(check_raw(&name, raw)?)),
            (None, Some(copy)) => {
                require_non_empty(&name, "reconstruction_copy.source", &copy.source)?;
                require_relative(&name, "reconstruction_copy.source", &copy.source)?;
                Some(ReconstructionSource::Copy(copy))
            }
            (None, None) => None,
        };

        let dependency_raw = entry
            .dependency_raw
            .map(|raw| check_raw(&name, raw))
            .transpose()?;

        if let Some(client) = &entry.dependency_client {
            require_non_empty(&name, "dependency_client.configuration", &client.configuration)?;
        }
        if let Some(client) = &entry.reconstruction_client {
            require_non_empty(
                &name,
                "reconstruction_client.configuration",
                &client.configuration,
            )?;
        }

        for reference in &entry.reconstruction_tests {
            require_non_empty(&name, "reference_file", &reference.reference_file)?;
            require_relative(&name, "reference_file", &reference.reference_file)?;
            require_non_empty(&name, "reference_images", &reference.reference_images)?;
            if reference.scale_comparison_threshold < 0.0
                || reference.value_comparison_threshold < 0.0
            {
                return Err(FixtureError::InvalidCase(format!(
                    "{name}: comparison thresholds must be non-negative"
                )));
            }
        }

        if let Some(distributed) = &entry.distributed {
            if distributed.nodes == 0 {
                return Err(FixtureError::InvalidCase(format!(
                    "{name}: distributed cases need at least one node"
                )));
            }
        }

        let tags = entry
            .tags
            .map(|tags| {
                tags.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(CaseDeclaration {
            name,
            dependency_client: entry.dependency_client,
            dependency_raw,
            reconstruction_client: entry.reconstruction_client,
            reconstruction_source,
            references: entry.reconstruction_tests,
            requirements: entry.requirements.unwrap_or_default(),
            distributed: entry.distributed,
            tags,
        })
    }
}

fn check_raw(name: &CaseName, raw: RawConversion) -> Result<RawConversion, FixtureError> {
    require_non_empty(name, "data_file", &raw.data_file)?;
    require_relative(name, "data_file", &raw.data_file)?;
    require_non_empty(name, "measurement", &raw.measurement)?;
    Ok(raw)
}

fn require_non_empty(name: &CaseName, field: &str, value: &str) -> Result<(), FixtureError> {
    if value.trim().is_empty() {
        return Err(FixtureError::InvalidCase(format!("{name}: {field} is empty")));
    }
    Ok(())
}

/// Remote files land under the cache and inside case directories, so they must stay there.
fn require_relative(name: &CaseName, field: &str, value: &str) -> Result<(), FixtureError> {
    let path = Utf8Path::new(value);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Utf8Component::Normal(_)));
    if escapes {
        return Err(FixtureError::InvalidCase(format!(
            "{name}: {field} must be a relative path inside the store: {value:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub converter: Option<String>,
    #[serde(default)]
    pub noise_template: Option<String>,
    #[serde(default)]
    pub main_template: Option<String>,
    #[serde(default)]
    pub worker_image: Option<String>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub download_timeout_secs: Option<u64>,
    #[serde(default)]
    pub conversion_timeout_secs: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub data_root: Utf8PathBuf,
    pub base_url: String,
    pub converter: String,
    pub noise_template: Utf8PathBuf,
    pub main_template: Utf8PathBuf,
    pub worker_image: String,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub download_timeout: Duration,
    pub conversion_timeout: Duration,
    pub workers: usize,
}

pub struct SettingsLoader;

impl SettingsLoader {
    /// Reads the settings file; an absent default file resolves to defaults.
    pub fn resolve(path: Option<&str>) -> Result<Settings, FixtureError> {
        let settings_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_SETTINGS_FILE),
        };

        if !settings_path.exists() {
            if path.is_some() {
                return Err(FixtureError::MissingConfig(settings_path));
            }
            return Self::resolve_settings(SettingsFile::default());
        }

        let content = fs::read_to_string(&settings_path)
            .map_err(|_| FixtureError::ConfigRead(settings_path.clone()))?;
        let file: SettingsFile = serde_json::from_str(&content)
            .map_err(|err| FixtureError::ConfigParse(err.to_string()))?;
        Self::resolve_settings(file)
    }

    pub fn resolve_settings(file: SettingsFile) -> Result<Settings, FixtureError> {
        let data_root = match file.data_root {
            Some(root) => Utf8PathBuf::from(root),
            None => default_data_root()?,
        };

        let mut base_url = file.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        let retries = file.retries.unwrap_or(5);
        if retries == 0 {
            return Err(FixtureError::ConfigParse(
                "retries must be at least 1".to_string(),
            ));
        }

        let workers = match file.workers {
            Some(0) => {
                return Err(FixtureError::ConfigParse(
                    "workers must be at least 1".to_string(),
                ));
            }
            Some(workers) => workers,
            None => crate::pool::available_workers(),
        };

        Ok(Settings {
            data_root,
            base_url,
            converter: file
                .converter
                .unwrap_or_else(|| DEFAULT_CONVERTER.to_string()),
            noise_template: Utf8PathBuf::from(
                file.noise_template
                    .unwrap_or_else(|| DEFAULT_NOISE_TEMPLATE.to_string()),
            ),
            main_template: Utf8PathBuf::from(
                file.main_template
                    .unwrap_or_else(|| DEFAULT_MAIN_TEMPLATE.to_string()),
            ),
            worker_image: file
                .worker_image
                .unwrap_or_else(|| DEFAULT_WORKER_IMAGE.to_string()),
            retries,
            retry_backoff: Duration::from_millis(file.retry_backoff_ms.unwrap_or(1000)),
            download_timeout: Duration::from_secs(file.download_timeout_secs.unwrap_or(600)),
            conversion_timeout: Duration::from_secs(
                file.conversion_timeout_secs.unwrap_or(30 * 60),
            ),
            workers,
        })
    }
}

fn default_data_root() -> Result<Utf8PathBuf, FixtureError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("recon-fixtures")).ok()
        })
        .ok_or_else(|| FixtureError::Filesystem("unable to resolve data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn entry(name: &str) -> CaseEntry {
        CaseEntry {
            name: name.to_string(),
            ..CaseEntry::default()
        }
    }

    #[test]
    fn absent_sections_resolve_to_defaults() {
        let case = ConfigLoader::resolve_case(entry("simple.cfg")).unwrap();
        assert!(case.reconstruction_source.is_none());
        assert!(case.references.is_empty());
        assert_eq!(case.requirements, Requirements::default());
        assert!(case.tags.is_empty());
    }

    #[test]
    fn copy_and_raw_reconstruction_are_exclusive() {
        let mut both = entry("both.cfg");
        both.reconstruction_raw = Some(RawConversion::new("a.dat", "1"));
        both.reconstruction_copy = Some(CopySource {
            source: "a.h5".to_string(),
        });
        assert_matches!(
            ConfigLoader::resolve_case(both),
            Err(FixtureError::InvalidCase(_))
        );
    }

    #[test]
    fn remote_paths_must_stay_inside_the_store() {
        let mut case = entry("escape.cfg");
        case.reconstruction_raw = Some(RawConversion::new("../outside.dat", "1"));
        assert_matches!(
            ConfigLoader::resolve_case(case),
            Err(FixtureError::InvalidCase(_))
        );

        let mut case = entry("absolute.cfg");
        case.reconstruction_copy = Some(CopySource {
            source: "/etc/passwd".to_string(),
        });
        assert_matches!(
            ConfigLoader::resolve_case(case),
            Err(FixtureError::InvalidCase(_))
        );

        let mut case = entry("nested.cfg");
        case.reconstruction_raw = Some(RawConversion::new("nested/dir/scan.dat", "1"));
        assert!(ConfigLoader::resolve_case(case).is_ok());
    }

    #[test]
    fn zero_nodes_rejected() {
        let mut case = entry("dist.cfg");
        case.distributed = Some(Distributed { nodes: 0 });
        assert_matches!(
            ConfigLoader::resolve_case(case),
            Err(FixtureError::InvalidCase(_))
        );
    }

    #[test]
    fn tags_split_on_commas() {
        let mut case = entry("tagged.cfg");
        case.tags = Some("slow, gpu ,".to_string());
        let case = ConfigLoader::resolve_case(case).unwrap();
        assert_eq!(case.tags, vec!["slow".to_string(), "gpu".to_string()]);
    }

    #[test]
    fn duplicate_directories_rejected() {
        let file = CaseSetFile {
            cases: vec![entry("a.cfg"), entry("a")],
        };
        assert_matches!(
            ConfigLoader::resolve_cases(file),
            Err(FixtureError::InvalidCase(_))
        );
    }

    #[test]
    fn settings_defaults() {
        let settings = SettingsLoader::resolve_settings(SettingsFile {
            data_root: Some("/tmp/data".to_string()),
            base_url: Some("http://example.org/data".to_string()),
            ..SettingsFile::default()
        })
        .unwrap();
        assert_eq!(settings.base_url, "http://example.org/data/");
        assert_eq!(settings.retries, 5);
        assert_eq!(settings.retry_backoff, Duration::from_secs(1));
        assert_eq!(settings.converter, DEFAULT_CONVERTER);
        assert!(settings.workers >= 1);
    }
}
