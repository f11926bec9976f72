use std::collections::BTreeMap;
use std::fs;
use std::io;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::FixtureError;
use crate::store::Store;

/// Path relative to the data root mapped to a plain checksum or a composite signature.
pub type FileDependencyMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub name: String,
    pub case_file_path: String,
    pub file_dependencies: FileDependencyMap,
}

/// The persisted list of every case currently trusted to be valid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub cases: Vec<CaseRecord>,
}

impl Manifest {
    /// A missing manifest is an empty one.
    pub fn load(path: &Utf8Path) -> Result<Self, FixtureError> {
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(FixtureError::Filesystem(format!("read {path}: {err}")));
            }
        };
        serde_json::from_str(&content)
            .map_err(|err| FixtureError::ConfigParse(format!("{path}: {err}")))
    }

    /// Writes the manifest sorted by case name.
    pub fn save(&mut self, path: &Utf8Path) -> Result<(), FixtureError> {
        let bytes = self.to_canonical_bytes()?;
        Store::write_bytes_atomic(path, &bytes)
    }

    pub fn to_canonical_bytes(&mut self) -> Result<Vec<u8>, FixtureError> {
        self.cases.sort_by(|a, b| a.name.cmp(&b.name));
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&CaseRecord> {
        self.cases.iter().find(|record| record.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<CaseRecord> {
        let index = self.cases.iter().position(|record| record.name == name)?;
        Some(self.cases.remove(index))
    }

    /// Replaces any existing record of the same name wholesale.
    pub fn upsert(&mut self, record: CaseRecord) {
        self.remove(&record.name);
        self.cases.push(record);
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}
