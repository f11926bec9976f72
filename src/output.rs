use std::io::{self, Write};

use serde::Serialize;

use crate::manifest::Manifest;
use crate::orchestrator::{SyncReport, VerifyReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    finished_at: String,
    #[serde(flatten)]
    report: &'a T,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_sync(report: &SyncReport) -> io::Result<()> {
        Self::print_stamped(report)
    }

    pub fn print_verify(report: &VerifyReport) -> io::Result<()> {
        Self::print_stamped(report)
    }

    pub fn print_list(manifest: &Manifest) -> io::Result<()> {
        Self::print_json(manifest)
    }

    fn print_stamped<T: Serialize>(report: &T) -> io::Result<()> {
        Self::print_json(&Stamped {
            finished_at: chrono::Utc::now().to_rfc3339(),
            report,
        })
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn print_sync(report: &SyncReport) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(
            stdout,
            "{} validated, {} evicted, {} generated",
            report.validated.len(),
            report.evicted.len(),
            report.generated.len()
        )?;
        for issue in &report.evicted {
            writeln!(stdout, "  evicted {}: {}", issue.name, issue.reason)?;
        }
        for name in &report.generated {
            writeln!(stdout, "  generated {name}")?;
        }
        Ok(())
    }

    pub fn print_verify(report: &VerifyReport) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(
            stdout,
            "{} valid, {} invalid, {} unrecorded",
            report.valid.len(),
            report.invalid.len(),
            report.unrecorded.len()
        )?;
        for issue in &report.invalid {
            writeln!(stdout, "  invalid {}: {}", issue.name, issue.reason)?;
        }
        for name in &report.unrecorded {
            writeln!(stdout, "  unrecorded {name}")?;
        }
        Ok(())
    }

    pub fn print_list(manifest: &Manifest) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for record in &manifest.cases {
            writeln!(
                stdout,
                "{}\t{} files\t{}",
                record.name,
                record.file_dependencies.len(),
                record.case_file_path
            )?;
        }
        Ok(())
    }
}
