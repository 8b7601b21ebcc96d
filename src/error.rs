//! Error types for each evaluation stage.
//!
//! Only `IngestionError` and `StoreError` ever abort a run. The
//! per-candidate kinds are turned into record defaults by the pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// The generation batch could not be located or read.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("no generation batch matching '{pattern}' found in {}", .dir.display())]
    NoBatch { dir: PathBuf, pattern: String },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed generation batch {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid batch discovery pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Persisting or reloading an evaluation batch failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no evaluation batch found in {}", .0.display())]
    NoBatch(PathBuf),

    #[error("invalid batch discovery pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Candidate source that tree-sitter could not parse.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("SyntaxError: invalid syntax at line {line}, column {column}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
}

/// Failure of the sandbox itself, as opposed to the candidate's tests.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to prepare workspace {}: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to supervise child process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("coverage export failed: {0}")]
    Export(String),

    #[error("coverage report missing at {}", .0.display())]
    Missing(PathBuf),

    #[error("coverage report unreadable: {0}")]
    Unreadable(String),
}

/// Reading the production module failed.
#[derive(Debug, Error)]
pub enum ProductionError {
    #[error("failed to read production module {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("production module {} is not under project root {}", .file.display(), .root.display())]
    OutsideRoot { file: PathBuf, root: PathBuf },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot resolve project root: {0}")]
    Root(#[source] std::io::Error),
}

/// Conditions that abort a whole evaluation run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Production(#[from] ProductionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
