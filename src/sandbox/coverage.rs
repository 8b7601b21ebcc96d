//! Line coverage of the production module for one candidate run.
//!
//! Each run owns a `CoverageSession`: its own data file and report
//! path, so no two runs can erase or export each other's measurements.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;

use crate::error::CoverageError;
use crate::sandbox::process::{run_with_timeout, ProcessResult};
use crate::state::CoverageGap;

#[derive(Debug, Deserialize)]
struct CoverageJson {
    totals: Totals,
}

#[derive(Debug, Deserialize)]
struct Totals {
    covered_lines: u64,
    num_statements: u64,
}

pub struct CoverageSession {
    coverage_bin: String,
    data_file: PathBuf,
    report_file: PathBuf,
}

impl CoverageSession {
    /// Claims the `<stem>` namespace under `dir`, discarding anything a
    /// previous run left there.
    pub fn acquire(dir: &Path, stem: &str, coverage_bin: &str) -> Self {
        let session = Self {
            coverage_bin: coverage_bin.to_string(),
            data_file: dir.join(format!(".coverage.{stem}")),
            report_file: dir.join(format!("{stem}.coverage.json")),
        };
        session.erase();
        session
    }

    /// `coverage run` for `script`, measuring only `source_dir` and never
    /// anything under `omit_dir`.
    pub fn run_command(&self, script: &Path, source_dir: &Path, omit_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.coverage_bin);
        cmd.arg("run")
            .arg(format!("--source={}", source_dir.display()))
            .arg(format!("--omit={}/*", omit_dir.display()))
            .arg(script)
            .env("COVERAGE_FILE", &self.data_file);
        cmd
    }

    /// Writes the JSON report and reads the percentage back.
    pub fn export(&self, cwd: &Path, timeout: Duration) -> Result<u8, CoverageError> {
        let mut cmd = Command::new(&self.coverage_bin);
        cmd.arg("json")
            .arg("-o")
            .arg(&self.report_file)
            .env("COVERAGE_FILE", &self.data_file)
            .current_dir(cwd);

        match run_with_timeout(cmd, timeout) {
            Ok(ProcessResult::Exited { success: true, .. }) => {}
            Ok(ProcessResult::Exited { stderr, stdout, .. }) => {
                let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                return Err(CoverageError::Export(detail.trim().to_string()));
            }
            Ok(ProcessResult::TimedOut) => {
                return Err(CoverageError::Export("export timed out".into()));
            }
            Err(e) => return Err(CoverageError::Export(e.to_string())),
        }

        if !self.report_file.exists() {
            return Err(CoverageError::Missing(self.report_file.clone()));
        }
        let raw = fs::read_to_string(&self.report_file)
            .map_err(|e| CoverageError::Unreadable(e.to_string()))?;
        parse_report(&raw)
    }

    fn erase(&self) {
        let _ = fs::remove_file(&self.data_file);
        let _ = fs::remove_file(&self.report_file);
    }
}

impl Drop for CoverageSession {
    fn drop(&mut self) {
        self.erase();
    }
}

impl CoverageError {
    pub fn gap(&self) -> CoverageGap {
        match self {
            CoverageError::Export(_) | CoverageError::Missing(_) => CoverageGap::ReportMissing,
            CoverageError::Unreadable(_) => CoverageGap::ReportUnreadable,
        }
    }
}

pub fn parse_report(raw: &str) -> Result<u8, CoverageError> {
    let report: CoverageJson =
        serde_json::from_str(raw).map_err(|e| CoverageError::Unreadable(e.to_string()))?;
    Ok(percent(report.totals.covered_lines, report.totals.num_statements))
}

/// Nearest integer percentage, ties to even. A module with no
/// executable statements counts as fully covered.
pub fn percent(covered: u64, statements: u64) -> u8 {
    if statements == 0 {
        return 100;
    }
    let pct = (covered as f64 / statements as f64 * 100.0).round_ties_even();
    pct.clamp(0.0, 100.0) as u8
}
