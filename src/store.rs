use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::case::CaseName;
use crate::error::FixtureError;

pub const MANIFEST_FILE: &str = "testdata.json";
pub const CASE_FILE: &str = "case.yml";

/// On-disk layout of the fixture data root.
///
/// ```text
/// <root>/testdata.json      manifest
/// <root>/cache/<file>       downloaded raw and reference files
/// <root>/<case>/            one directory per case
/// ```
#[derive(Debug, Clone)]
pub struct Store {
    data_root: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
}

impl Store {
    pub fn new(data_root: Utf8PathBuf) -> Self {
        let cache_dir = data_root.join("cache");
        Self {
            data_root,
            cache_dir,
        }
    }

    pub fn data_root(&self) -> &Utf8Path {
        &self.data_root
    }

    pub fn cache_dir(&self) -> &Utf8Path {
        &self.cache_dir
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.data_root.join(MANIFEST_FILE)
    }

    pub fn case_dir(&self, name: &CaseName) -> Utf8PathBuf {
        self.data_root.join(name.directory_name())
    }

    pub fn case_file_path(&self, name: &CaseName) -> Utf8PathBuf {
        self.case_dir(name).join(CASE_FILE)
    }

    /// Location of a downloaded file, keyed by its path relative to the remote store.
    pub fn cached_file(&self, relative: &str) -> Utf8PathBuf {
        self.cache_dir.join(relative)
    }

    /// Manifest key of a path under the data root, always `/`-separated.
    pub fn relative_key(&self, path: &Utf8Path) -> Result<String, FixtureError> {
        let relative = path.strip_prefix(&self.data_root).map_err(|_| {
            FixtureError::Filesystem(format!("{path} is outside the data root {}", self.data_root))
        })?;
        Ok(relative
            .components()
            .map(|component| component.as_str())
            .collect::<Vec<_>>()
            .join("/"))
    }

    pub fn resolve_key(&self, key: &str) -> Utf8PathBuf {
        self.data_root.join(key)
    }

    pub fn ensure_data_root(&self) -> Result<(), FixtureError> {
        fs::create_dir_all(self.cache_dir.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))
    }

    pub fn remove_case_dir(&self, name: &CaseName) -> Result<bool, FixtureError> {
        let dir = self.case_dir(name);
        if !dir.as_std_path().exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir.as_std_path())
            .map_err(|err| FixtureError::Filesystem(format!("remove {dir}: {err}")))?;
        Ok(true)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FixtureError> {
        let parent = path
            .parent()
            .ok_or_else(|| FixtureError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".recon-fixtures")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| FixtureError::Filesystem(format!("persist {path}: {err}")))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), FixtureError> {
        if !source.as_std_path().exists() {
            return Err(FixtureError::MissingFile(source.to_string()));
        }
        let parent = dest
            .parent()
            .ok_or_else(|| FixtureError::Filesystem(format!("invalid destination path {dest}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".recon-fixtures-copy")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| FixtureError::Filesystem(format!("copy {source}: {err}")))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| FixtureError::Filesystem(format!("persist {dest}: {err}")))?;
        Ok(())
    }

    pub fn remove_file_if_exists(path: &Utf8Path) -> Result<bool, FixtureError> {
        if !path.as_std_path().exists() {
            return Ok(false);
        }
        fs::remove_file(path.as_std_path())
            .map_err(|err| FixtureError::Filesystem(format!("remove {path}: {err}")))?;
        Ok(true)
    }
}
