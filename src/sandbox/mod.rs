pub mod coverage;
pub mod process;
pub mod workspace;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::EvalConfig;
use crate::error::ExecutionError;
use crate::sandbox::coverage::CoverageSession;
use crate::sandbox::process::{run_with_timeout, ProcessResult};
use crate::sandbox::workspace::{materialize, ProductionModule};
use crate::state::{CandidateTest, CoverageGap, CoverageReport, ExecutionOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRun {
    pub outcome: ExecutionOutcome,
    pub coverage: CoverageReport,
}

impl SandboxRun {
    pub fn failed(stderr: impl Into<String>, gap: CoverageGap) -> Self {
        Self {
            outcome: ExecutionOutcome::failed(stderr),
            coverage: CoverageReport::Unmeasurable(gap),
        }
    }
}

/// Runs a candidate and reports what happened. Implementations never
/// fail: every problem is folded into the returned run.
pub trait Executor: Sync {
    fn execute(&self, candidate: &CandidateTest) -> SandboxRun;
}

/// Stands in for the per-identity script name in captured output, so
/// identical sources yield identical records.
pub const SCRIPT_PLACEHOLDER: &str = "<candidate>";

/// Fresh `coverage run` process per candidate, bounded by a timeout.
pub struct Sandbox {
    project_root: PathBuf,
    workspace_dir: PathBuf,
    coverage_bin: String,
    timeout: Duration,
    production: ProductionModule,
}

impl Sandbox {
    pub fn new(cfg: &EvalConfig, production: ProductionModule) -> Self {
        Self {
            project_root: cfg.project_root.clone(),
            workspace_dir: cfg.workspace_dir.clone(),
            coverage_bin: cfg.coverage_bin.clone(),
            timeout: cfg.timeout(),
            production,
        }
    }

    fn try_run(&self, candidate: &CandidateTest) -> Result<SandboxRun, ExecutionError> {
        let script = materialize(
            &self.workspace_dir,
            &candidate.id,
            &self.production.import_line(),
            &candidate.source,
        )?;
        let stem = script
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let session = CoverageSession::acquire(&self.workspace_dir, &stem, &self.coverage_bin);
        let mut cmd: Command =
            session.run_command(&script, &self.production.source_dir, &self.workspace_dir);
        cmd.current_dir(&self.project_root)
            .env("PYTHONPATH", &self.project_root);

        debug!(candidate = %candidate.id, script = %script.display(), "running candidate");

        match run_with_timeout(cmd, self.timeout)? {
            ProcessResult::TimedOut => {
                warn!(candidate = %candidate.id, timeout = ?self.timeout, "candidate timed out");
                Ok(SandboxRun {
                    outcome: ExecutionOutcome::timeout(),
                    coverage: CoverageReport::Unmeasurable(CoverageGap::TimedOut),
                })
            }
            ProcessResult::Exited {
                success: false,
                stdout,
                stderr,
            } => Ok(SandboxRun {
                outcome: ExecutionOutcome {
                    passed: false,
                    stdout: anonymize(&stdout, &script, &stem),
                    stderr: anonymize(&stderr, &script, &stem),
                    timed_out: false,
                },
                coverage: CoverageReport::Unmeasurable(CoverageGap::RunFailed),
            }),
            ProcessResult::Exited {
                success: true,
                stdout,
                stderr,
            } => {
                let coverage = match session.export(&self.project_root, self.timeout) {
                    Ok(pct) => CoverageReport::Measured(pct),
                    Err(e) => {
                        warn!(candidate = %candidate.id, error = %e, "coverage unavailable");
                        CoverageReport::Unmeasurable(e.gap())
                    }
                };

                Ok(SandboxRun {
                    outcome: ExecutionOutcome {
                        passed: true,
                        stdout: anonymize(&stdout, &script, &stem),
                        stderr: anonymize(&stderr, &script, &stem),
                        timed_out: false,
                    },
                    coverage,
                })
            }
        }
    }
}

fn anonymize(output: &str, script: &Path, stem: &str) -> String {
    let full = script.display().to_string();
    let out = output.replace(&full, &format!("{SCRIPT_PLACEHOLDER}.py"));
    if stem.is_empty() {
        out
    } else {
        out.replace(stem, SCRIPT_PLACEHOLDER)
    }
}

impl Executor for Sandbox {
    fn execute(&self, candidate: &CandidateTest) -> SandboxRun {
        self.try_run(candidate).unwrap_or_else(|e| {
            warn!(candidate = %candidate.id, error = %e, "sandbox failure");
            SandboxRun::failed(e.to_string(), CoverageGap::RunFailed)
        })
    }
}
