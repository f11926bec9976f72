use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;

use crate::case::RawConversion;
use crate::checksum::file_checksum;
use crate::error::FixtureError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_LOG: &str = "converter.stderr.log";

/// One converter invocation. `rendered()` is the exact string hashed into signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionCommand {
    args: Vec<String>,
    rendered: String,
}

impl ConversionCommand {
    pub fn new(program: &str, raw: &RawConversion, source: &Utf8Path, output: &Utf8Path) -> Self {
        let mut args = vec![
            "-X".to_string(),
            "-f".to_string(),
            source.to_string(),
            "-m".to_string(),
            raw.parameter_xml.clone(),
            "-x".to_string(),
            raw.parameter_xsl.clone(),
            "-o".to_string(),
            output.to_string(),
            "-z".to_string(),
            raw.measurement.clone(),
        ];
        args.extend(raw.data_conversion_flag.split_whitespace().map(str::to_string));
        // The flag slot is rendered verbatim, and present even when empty.
        let rendered = format!(
            "{program} -X -f {source} -m {} -x {} -o {output} -z {} {} ",
            raw.parameter_xml, raw.parameter_xsl, raw.measurement, raw.data_conversion_flag,
        );
        Self { args, rendered }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

/// The external raw-to-artifact converter, with its binary digest taken once at construction.
#[derive(Debug, Clone)]
pub struct Converter {
    name: String,
    path: PathBuf,
    digest: String,
    timeout: Duration,
}

impl Converter {
    /// Resolves `program` (a path, or a bare name looked up on `PATH`) and hashes its binary.
    pub fn locate(program: &str, timeout: Duration) -> Result<Self, FixtureError> {
        let candidate = Path::new(program);
        let path = if candidate.components().count() > 1 {
            candidate
                .exists()
                .then(|| candidate.to_path_buf())
                .ok_or_else(|| FixtureError::MissingTool(program.to_string()))?
        } else {
            find_in_path(program).ok_or_else(|| FixtureError::MissingTool(program.to_string()))?
        };
        Self::from_path(path, timeout)
    }

    pub fn from_path(path: PathBuf, timeout: Duration) -> Result<Self, FixtureError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| FixtureError::MissingTool(path.display().to_string()))?
            .to_string();
        let digest = file_checksum(&path).map_err(|err| match err {
            FixtureError::MissingFile(_) => FixtureError::MissingTool(path.display().to_string()),
            other => other,
        })?;
        tracing::debug!(converter = %path.display(), %digest, "converter located");
        Ok(Self {
            name,
            path,
            digest,
            timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn command(
        &self,
        raw: &RawConversion,
        source: &Utf8Path,
        output: &Utf8Path,
    ) -> ConversionCommand {
        ConversionCommand::new(&self.name, raw, source, output)
    }

    /// Runs the converter with `working_dir` as its cwd, failing on non-zero exit or timeout.
    pub fn run(&self, command: &ConversionCommand, working_dir: &Path) -> Result<(), FixtureError> {
        let stderr_path = working_dir.join(STDERR_LOG);
        let stderr = fs::File::create(&stderr_path)
            .map_err(|err| FixtureError::Filesystem(err.to_string()))?;

        let mut child = Command::new(&self.path)
            .args(command.args())
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|err| FixtureError::ConverterFailed(format!("{}: {err}", self.name)))?;

        let start = Instant::now();
        let status = loop {
            match child
                .try_wait()
                .map_err(|err| FixtureError::ConverterFailed(err.to_string()))?
            {
                Some(status) => break status,
                None if start.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(FixtureError::ConverterTimeout {
                        command: command.rendered().to_string(),
                        seconds: self.timeout.as_secs(),
                    });
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        if status.success() {
            return Ok(());
        }
        let stderr = fs::read_to_string(&stderr_path)
            .unwrap_or_default()
            .trim()
            .to_string();
        let message = if stderr.is_empty() {
            format!("{} exited with {status}", command.rendered().trim_end())
        } else {
            format!("{} exited with {status}: {stderr}", self.name)
        };
        Err(FixtureError::ConverterFailed(message))
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn rendered_command_keeps_flag_slot() {
        let raw = RawConversion::new("data.dat", "2");
        let command = ConversionCommand::new(
            "siemens_to_ismrmrd",
            &raw,
            Utf8Path::new("/cache/data.dat"),
            Utf8Path::new("/data/a/main.h5"),
        );
        assert_eq!(
            command.rendered(),
            "siemens_to_ismrmrd -X -f /cache/data.dat -m IsmrmrdParameterMap_Siemens.xml \
             -x IsmrmrdParameterMap_Siemens.xsl -o /data/a/main.h5 -z 2  "
        );
    }

    #[test]
    fn extra_flags_become_separate_args() {
        let mut raw = RawConversion::new("data.dat", "1");
        raw.data_conversion_flag = "--skipSyncData --flashPatRef".to_string();
        let command = ConversionCommand::new(
            "conv",
            &raw,
            Utf8Path::new("/in.dat"),
            Utf8Path::new("/out.h5"),
        );
        assert_eq!(
            &command.args()[11..],
            &["--skipSyncData".to_string(), "--flashPatRef".to_string()]
        );
        assert!(command.rendered().ends_with("-z 1 --skipSyncData --flashPatRef "));
    }

    #[test]
    fn missing_binary_is_a_missing_tool() {
        let temp = tempfile::tempdir().unwrap();
        let program = temp.path().join("not-there");
        assert_matches!(
            Converter::locate(program.to_str().unwrap(), Duration::from_secs(1)),
            Err(FixtureError::MissingTool(_))
        );
        assert_matches!(
            Converter::locate("surely-not-on-path-converter", Duration::from_secs(1)),
            Err(FixtureError::MissingTool(_))
        );
    }

    #[test]
    fn digest_tracks_binary_content() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("conv");
        std::fs::write(&path, b"v1").unwrap();
        let first = Converter::from_path(path.clone(), Duration::from_secs(1)).unwrap();
        std::fs::write(&path, b"v2").unwrap();
        let second = Converter::from_path(path, Duration::from_secs(1)).unwrap();
        assert_ne!(first.digest(), second.digest());
        assert_eq!(first.name(), "conv");
    }
}
