use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    evaluation: Option<EvalConfig>,
}

/// Settings for one evaluation run. Relative paths are taken from
/// `project_root` once `resolve` has run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub project_root: PathBuf,
    pub production_file: PathBuf,
    pub tests_dir: PathBuf,
    pub results_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub coverage_bin: String,
    pub timeout_secs: u64,
    pub workers: usize,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            production_file: PathBuf::from("prompts/code.py"),
            tests_dir: PathBuf::from("generated_tests"),
            results_dir: PathBuf::from("evaluation_results"),
            workspace_dir: PathBuf::from("test_outputs"),
            coverage_bin: "coverage".to_string(),
            timeout_secs: 10,
            workers: 4,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    #[arg(long, help = "Config file (default: <config dir>/suitegrade/config.toml)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Directory the production module is imported from")]
    pub project_root: Option<PathBuf>,

    #[arg(long, help = "Production module under test")]
    pub production_file: Option<PathBuf>,

    #[arg(long, help = "Directory holding tests_*.json generation batches")]
    pub tests_dir: Option<PathBuf>,

    #[arg(long, help = "Directory for evaluation_*.json results")]
    pub results_dir: Option<PathBuf>,

    #[arg(long, help = "Scratch directory for candidate scripts")]
    pub workspace_dir: Option<PathBuf>,

    #[arg(long, help = "coverage.py executable")]
    pub coverage_bin: Option<String>,

    #[arg(long, help = "Wall-clock limit per candidate run, in seconds")]
    pub timeout_secs: Option<u64>,

    #[arg(long, help = "Candidates evaluated concurrently")]
    pub workers: Option<usize>,
}

fn config_path() -> PathBuf {
    let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    dir.push("suitegrade");
    dir.push("config.toml");
    dir
}

/// Loads the `[evaluation]` table. A missing default config file means
/// defaults; an explicitly requested file must exist.
pub fn load(explicit: Option<&Path>) -> Result<EvalConfig, ConfigError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = config_path();
            if !p.exists() {
                return Ok(EvalConfig::default());
            }
            p
        }
    };

    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    parse(&raw).map_err(|source| ConfigError::Parse { path, source })
}

fn parse(raw: &str) -> Result<EvalConfig, toml::de::Error> {
    let cfg: ConfigFile = toml::from_str(raw)?;
    Ok(cfg.evaluation.unwrap_or_default())
}

impl EvalConfig {
    /// File config, then command-line overrides, then path resolution.
    pub fn from_args(args: &ConfigArgs) -> Result<Self, ConfigError> {
        let mut cfg = load(args.config.as_deref())?;
        cfg.apply(args);
        cfg.resolve()
    }

    pub fn apply(&mut self, args: &ConfigArgs) {
        if let Some(v) = &args.project_root {
            self.project_root = v.clone();
        }
        if let Some(v) = &args.production_file {
            self.production_file = v.clone();
        }
        if let Some(v) = &args.tests_dir {
            self.tests_dir = v.clone();
        }
        if let Some(v) = &args.results_dir {
            self.results_dir = v.clone();
        }
        if let Some(v) = &args.workspace_dir {
            self.workspace_dir = v.clone();
        }
        if let Some(v) = &args.coverage_bin {
            self.coverage_bin = v.clone();
        }
        if let Some(v) = args.timeout_secs {
            self.timeout_secs = v;
        }
        if let Some(v) = args.workers {
            self.workers = v;
        }
    }

    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        if self.project_root.is_relative() {
            let cwd = env::current_dir().map_err(ConfigError::Root)?;
            self.project_root = cwd.join(&self.project_root).components().collect();
        }

        let root = self.project_root.clone();
        for p in [
            &mut self.production_file,
            &mut self.tests_dir,
            &mut self.results_dir,
            &mut self.workspace_dir,
        ] {
            if p.is_relative() {
                *p = root.join(&*p);
            }
        }

        self.timeout_secs = self.timeout_secs.max(1);
        self.workers = self.workers.max(1);
        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
