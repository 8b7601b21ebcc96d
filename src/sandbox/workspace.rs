use std::fs;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::detectors::ast::extract_free_functions;
use crate::error::{ExecutionError, ProductionError};
use crate::state::CandidateId;

/* ============================================================
   Production module
   ============================================================ */

/// The fixed module every candidate is run against.
#[derive(Debug, Clone)]
pub struct ProductionModule {
    pub file: PathBuf,
    /// Dotted import path relative to the project root, e.g. `prompts.code`.
    pub module_path: String,
    /// Directory coverage is scoped to.
    pub source_dir: PathBuf,
}

impl ProductionModule {
    pub fn locate(project_root: &Path, file: &Path) -> Result<Self, ProductionError> {
        let outside = || ProductionError::OutsideRoot {
            file: file.to_path_buf(),
            root: project_root.to_path_buf(),
        };

        let rel = file.strip_prefix(project_root).map_err(|_| outside())?;
        let module_path = module_path(rel).ok_or_else(outside)?;
        let source_dir = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| project_root.to_path_buf());

        Ok(Self {
            file: file.to_path_buf(),
            module_path,
            source_dir,
        })
    }

    /// Star import that exposes production names to the candidate unqualified.
    pub fn import_line(&self) -> String {
        format!("from {} import *", self.module_path)
    }

    pub fn functions(&self) -> Result<Vec<String>, ProductionError> {
        let src = fs::read_to_string(&self.file).map_err(|source| ProductionError::Read {
            path: self.file.clone(),
            source,
        })?;
        Ok(extract_free_functions(&src))
    }
}

fn module_path(rel: &Path) -> Option<String> {
    let stem = rel.with_extension("");
    let mut parts = Vec::new();

    for c in stem.components() {
        match c {
            Component::Normal(s) => parts.push(s.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if parts.last().map(|p| p == "__init__").unwrap_or(false) {
        parts.pop();
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("."))
}

/* ============================================================
   Candidate scripts
   ============================================================ */

/// Script name unique per identity. Sanitising alone could map two
/// identities onto one name, so a digest of the raw identity is appended.
pub fn script_name(id: &CandidateId) -> String {
    let raw = format!("{}_{}", id.model, id.variant);
    let name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    let mut h = Sha256::new();
    h.update(id.model.as_bytes());
    h.update([0u8]);
    h.update(id.variant.as_bytes());
    let digest = hex::encode(h.finalize());

    format!("test_{name}_{}.py", &digest[..8])
}

/// Writes the candidate, prefixed by the production import, into `dir`.
/// An older script for the same identity is replaced.
pub fn materialize(
    dir: &Path,
    id: &CandidateId,
    import_line: &str,
    code: &str,
) -> Result<PathBuf, ExecutionError> {
    fs::create_dir_all(dir).map_err(|source| ExecutionError::Workspace {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(script_name(id));
    let content = format!("{import_line}\n\n{code}");
    fs::write(&path, content).map_err(|source| ExecutionError::Workspace {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
