//! Batch persistence.
//!
//! Batch identifiers are `<prefix><YYYYmmdd_HHMMSS>`, so sorting names
//! lexicographically sorts batches chronologically.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local};
use tracing::info;

use crate::error::{IngestionError, StoreError};
use crate::state::{EvaluationBatch, GenerationBatch};

pub const GENERATION_PREFIX: &str = "tests_";
pub const EVALUATION_PREFIX: &str = "evaluation_";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Seconds to step forward when an identifier is already taken.
const MAX_ID_ATTEMPTS: i64 = 120;

pub trait BatchRepository {
    fn latest_generation(&self) -> Result<GenerationBatch, IngestionError>;

    /// Persists a new batch and returns its identifier. Existing batches
    /// are never overwritten.
    fn save_evaluation(&self, batch: &EvaluationBatch) -> Result<String, StoreError>;

    fn latest_evaluation(&self) -> Result<(String, EvaluationBatch), StoreError>;

    fn load_evaluation(&self, id: &str) -> Result<EvaluationBatch, StoreError>;
}

pub struct FsRepository {
    tests_dir: PathBuf,
    results_dir: PathBuf,
}

impl FsRepository {
    pub fn new(tests_dir: impl Into<PathBuf>, results_dir: impl Into<PathBuf>) -> Self {
        Self {
            tests_dir: tests_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn save_evaluation_at(
        &self,
        batch: &EvaluationBatch,
        now: DateTime<Local>,
    ) -> Result<String, StoreError> {
        fs::create_dir_all(&self.results_dir).map_err(|source| StoreError::Io {
            path: self.results_dir.clone(),
            source,
        })?;

        let text = serde_json::to_string_pretty(batch).map_err(|source| StoreError::Json {
            path: self.results_dir.clone(),
            source,
        })?;

        let mut last_err = None;
        for step in 0..MAX_ID_ATTEMPTS {
            let ts = (now + Duration::seconds(step)).format(TIMESTAMP_FORMAT);
            let id = format!("{EVALUATION_PREFIX}{ts}");
            let path = self.results_dir.join(format!("{id}.json"));

            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    last_err = Some((path, e));
                    continue;
                }
                Err(source) => return Err(StoreError::Io { path, source }),
            };

            write_batch(file, &path, &text)?;

            info!(batch = %id, path = %path.display(), "evaluation batch saved");
            return Ok(id);
        }

        let (path, source) = last_err.unwrap_or_else(|| {
            (
                self.results_dir.clone(),
                std::io::Error::from(ErrorKind::AlreadyExists),
            )
        });
        Err(StoreError::Io { path, source })
    }

    fn read_evaluation(&self, path: &Path) -> Result<EvaluationBatch, StoreError> {
        let raw = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Writes `text` into a freshly created batch file. A file that cannot be
/// written in full is removed so it never shows up as the latest batch.
fn write_batch<W: Write>(mut file: W, path: &Path, text: &str) -> Result<(), StoreError> {
    if let Err(source) = file.write_all(text.as_bytes()).and_then(|()| file.flush()) {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

impl BatchRepository for FsRepository {
    fn latest_generation(&self) -> Result<GenerationBatch, IngestionError> {
        let path = latest_file(&self.tests_dir, GENERATION_PREFIX)?.ok_or_else(|| {
            IngestionError::NoBatch {
                dir: self.tests_dir.clone(),
                pattern: format!("{GENERATION_PREFIX}*.json"),
            }
        })?;

        let raw = fs::read_to_string(&path).map_err(|source| IngestionError::Read {
            path: path.clone(),
            source,
        })?;
        let entries: BTreeMap<String, BTreeMap<String, String>> = serde_json::from_str(&raw)
            .map_err(|source| IngestionError::Malformed {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), "loaded generation batch");
        Ok(GenerationBatch {
            id: batch_id(&path),
            entries,
        })
    }

    fn save_evaluation(&self, batch: &EvaluationBatch) -> Result<String, StoreError> {
        self.save_evaluation_at(batch, Local::now())
    }

    fn latest_evaluation(&self) -> Result<(String, EvaluationBatch), StoreError> {
        let path = latest_file(&self.results_dir, EVALUATION_PREFIX)?
            .ok_or_else(|| StoreError::NoBatch(self.results_dir.clone()))?;
        let batch = self.read_evaluation(&path)?;
        Ok((batch_id(&path), batch))
    }

    fn load_evaluation(&self, id: &str) -> Result<EvaluationBatch, StoreError> {
        self.read_evaluation(&self.results_dir.join(format!("{id}.json")))
    }
}

/// The lexicographically greatest `<prefix>*.json` in `dir`.
pub fn latest_file(dir: &Path, prefix: &str) -> Result<Option<PathBuf>, glob::PatternError> {
    let escaped = glob::Pattern::escape(&dir.to_string_lossy());
    let pattern = format!("{escaped}/{prefix}*.json");

    let mut files: Vec<PathBuf> = glob::glob(&pattern)?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();

    files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(files.into_iter().next())
}

fn batch_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::state::{CandidateId, EvaluationRecord};

    fn repo(dir: &Path) -> FsRepository {
        FsRepository::new(dir.join("generated_tests"), dir.join("evaluation_results"))
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn missing_generation_batch_is_an_ingestion_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = repo(dir.path()).latest_generation().unwrap_err();
        assert!(matches!(err, IngestionError::NoBatch { .. }));
    }

    #[test]
    fn latest_generation_is_reverse_lexicographic_first() {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join("generated_tests");
        fs::create_dir_all(&tests).unwrap();
        fs::write(tests.join("tests_20240101_120000.json"), r#"{"old": {"v": "x"}}"#).unwrap();
        fs::write(tests.join("tests_20250101_090000.json"), r#"{"new": {"v": "y"}}"#).unwrap();
        fs::write(tests.join("notes_20990101_000000.json"), r#"{}"#).unwrap();

        let batch = repo(dir.path()).latest_generation().unwrap();
        assert_eq!(batch.id, "tests_20250101_090000");
        assert!(batch.entries.contains_key("new"));
    }

    #[test]
    fn malformed_generation_batch() {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join("generated_tests");
        fs::create_dir_all(&tests).unwrap();
        fs::write(tests.join("tests_20240101_120000.json"), "[1, 2]").unwrap();

        let err = repo(dir.path()).latest_generation().unwrap_err();
        assert!(matches!(err, IngestionError::Malformed { .. }));
    }

    #[test]
    fn failed_write_leaves_no_partial_batch() {
        struct Full;

        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::Other, "no space left"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let r = repo(dir.path());
        let results = dir.path().join("evaluation_results");
        fs::create_dir_all(&results).unwrap();
        let path = results.join("evaluation_20250309_100000.json");
        fs::write(&path, "{\"a\": {").unwrap();

        let err = write_batch(Full, &path, "{}").unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(!path.exists());
        assert!(matches!(r.latest_evaluation(), Err(StoreError::NoBatch(_))));
    }

    #[test]
    fn saved_batches_are_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let r = repo(dir.path());

        let mut first = EvaluationBatch::default();
        first.insert(CandidateId::new("a", "v"), EvaluationRecord::no_code_found(1));
        let second = EvaluationBatch::default();

        let id1 = r.save_evaluation_at(&first, at(10, 0, 0)).unwrap();
        let id2 = r.save_evaluation_at(&second, at(10, 0, 0)).unwrap();
        assert_eq!(id1, "evaluation_20250309_100000");
        assert_eq!(id2, "evaluation_20250309_100001");

        let (latest_id, latest) = r.latest_evaluation().unwrap();
        assert_eq!(latest_id, id2);
        assert!(latest.is_empty());

        // "-" reloads as the generic gap, so compare what is on disk.
        assert_eq!(
            serde_json::to_value(r.load_evaluation(&id1).unwrap()).unwrap(),
            serde_json::to_value(&first).unwrap()
        );
        assert!(matches!(
            r.load_evaluation("evaluation_19990101_000000"),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn ids_sort_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        let r = repo(dir.path());
        let b = EvaluationBatch::default();

        let late = r.save_evaluation_at(&b, at(21, 5, 9)).unwrap();
        let early = r.save_evaluation_at(&b, at(9, 59, 59)).unwrap();
        assert!(early < late);
        assert_eq!(r.latest_evaluation().unwrap().0, late);
    }

    #[test]
    fn no_evaluation_yet() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            repo(dir.path()).latest_evaluation(),
            Err(StoreError::NoBatch(_))
        ));
    }
}
