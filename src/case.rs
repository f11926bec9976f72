use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FixtureError;

/// File extension of every converted artifact.
pub const ARTIFACT_EXTENSION: &str = "h5";

pub const DEFAULT_PARAMETER_XSL: &str = "IsmrmrdParameterMap_Siemens.xsl";
pub const DEFAULT_PARAMETER_XML: &str = "IsmrmrdParameterMap_Siemens.xml";
pub const DEFAULT_COMPARISON_THRESHOLD: f64 = 0.01;

const CASE_FILE_SUFFIX: &str = ".cfg";
const RESERVED_DIRECTORIES: &[&str] = &["cache"];

static CASE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]*$").expect("valid case name regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CaseName(String);

impl CaseName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory name of the case: the declared name without its `.cfg` suffix.
    pub fn directory_name(&self) -> &str {
        self.0.strip_suffix(CASE_FILE_SUFFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for CaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CaseName {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if !CASE_NAME_RE.is_match(trimmed) || trimmed.contains("..") {
            return Err(FixtureError::InvalidCase(format!(
                "case name is not directory-safe: {value:?}"
            )));
        }
        let name = Self(trimmed.to_string());
        if name.directory_name().is_empty() || RESERVED_DIRECTORIES.contains(&name.directory_name())
        {
            return Err(FixtureError::InvalidCase(format!(
                "case name collides with a reserved directory: {value:?}"
            )));
        }
        Ok(name)
    }
}

impl TryFrom<String> for CaseName {
    type Error = FixtureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CaseName> for String {
    fn from(value: CaseName) -> Self {
        value.0
    }
}

/// Which converted artifact a raw conversion produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionRole {
    Dependency,
    Reconstruction,
}

impl ConversionRole {
    pub fn artifact_name(self) -> String {
        let stem = match self {
            ConversionRole::Dependency => "noise",
            ConversionRole::Reconstruction => "main",
        };
        format!("{stem}.{ARTIFACT_EXTENSION}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub configuration: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructionClientConfig {
    pub configuration: String,
    #[serde(default)]
    pub additional_arguments: String,
}

/// A raw scanner file plus the parameters handed to the converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawConversion {
    pub data_file: String,
    pub measurement: String,
    #[serde(default = "default_parameter_xsl")]
    pub parameter_xsl: String,
    #[serde(default = "default_parameter_xml")]
    pub parameter_xml: String,
    #[serde(default)]
    pub data_conversion_flag: String,
}

impl RawConversion {
    pub fn new(data_file: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            data_file: data_file.into(),
            measurement: measurement.into(),
            parameter_xsl: default_parameter_xsl(),
            parameter_xml: default_parameter_xml(),
            data_conversion_flag: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopySource {
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionSource {
    Raw(RawConversion),
    Copy(CopySource),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceTarget {
    pub output_images: String,
    pub reference_file: String,
    pub reference_images: String,
    #[serde(default = "default_threshold")]
    pub scale_comparison_threshold: f64,
    #[serde(default = "default_threshold")]
    pub value_comparison_threshold: f64,
    #[serde(default)]
    pub disable_image_header_test: bool,
    #[serde(default)]
    pub disable_image_meta_test: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub gpu_support: bool,
    #[serde(default)]
    pub julia_support: bool,
    #[serde(default)]
    pub matlab_support: bool,
    #[serde(default)]
    pub python_support: bool,
    /// Megabytes.
    #[serde(default)]
    pub gpu_memory: u64,
    /// Megabytes.
    #[serde(default)]
    pub system_memory: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distributed {
    pub nodes: u32,
}

/// One declared test fixture. Built by `ConfigLoader::resolve_case`, never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseDeclaration {
    pub name: CaseName,
    pub dependency_client: Option<ClientConfig>,
    pub dependency_raw: Option<RawConversion>,
    pub reconstruction_client: Option<ReconstructionClientConfig>,
    pub reconstruction_source: Option<ReconstructionSource>,
    pub references: Vec<ReferenceTarget>,
    pub requirements: Requirements,
    pub distributed: Option<Distributed>,
    pub tags: Vec<String>,
}

impl CaseDeclaration {
    pub fn new(name: CaseName) -> Self {
        Self {
            name,
            dependency_client: None,
            dependency_raw: None,
            reconstruction_client: None,
            reconstruction_source: None,
            references: Vec::new(),
            requirements: Requirements::default(),
            distributed: None,
            tags: Vec::new(),
        }
    }

    /// Raw conversions this case needs, dependency pass first.
    pub fn conversions(&self) -> Vec<(ConversionRole, &RawConversion)> {
        let mut out = Vec::new();
        if let Some(raw) = &self.dependency_raw {
            out.push((ConversionRole::Dependency, raw));
        }
        if let Some(ReconstructionSource::Raw(raw)) = &self.reconstruction_source {
            out.push((ConversionRole::Reconstruction, raw));
        }
        out
    }

    pub fn copy_source(&self) -> Option<&CopySource> {
        match &self.reconstruction_source {
            Some(ReconstructionSource::Copy(copy)) => Some(copy),
            _ => None,
        }
    }

    /// Every remote file generation of this case reads, in declaration order.
    pub fn remote_files(&self) -> Vec<&str> {
        let mut files = Vec::new();
        if let Some(raw) = &self.dependency_raw {
            files.push(raw.data_file.as_str());
        }
        match &self.reconstruction_source {
            Some(ReconstructionSource::Raw(raw)) => files.push(raw.data_file.as_str()),
            Some(ReconstructionSource::Copy(copy)) => files.push(copy.source.as_str()),
            None => {}
        }
        files.extend(
            self.references
                .iter()
                .map(|reference| reference.reference_file.as_str()),
        );
        files
    }

    pub fn is_supported(&self) -> bool {
        !self.requirements.matlab_support && !self.requirements.julia_support
    }
}

fn default_parameter_xsl() -> String {
    DEFAULT_PARAMETER_XSL.to_string()
}

fn default_parameter_xml() -> String {
    DEFAULT_PARAMETER_XML.to_string()
}

fn default_threshold() -> f64 {
    DEFAULT_COMPARISON_THRESHOLD
}
