//! One evaluation pass: extract, run, measure, score.
//!
//! Candidates are independent, so they fan out to a small worker pool.
//! Records are keyed by identity, which keeps the batch deterministic
//! whatever order the workers finish in.

use std::thread;

use crossbeam_channel::unbounded;
use tracing::{info, warn};

use crate::config::EvalConfig;
use crate::detectors::smells::SmellDetector;
use crate::error::RunError;
use crate::extract::first_code_block;
use crate::sandbox::workspace::ProductionModule;
use crate::sandbox::{Executor, Sandbox, SandboxRun};
use crate::score::{
    count_functions_tested, detect_edge_cases, extract_assert_types, synthesize, ScoreInputs,
};
use crate::state::{
    CandidateId, CandidateTest, CoverageGap, EvalStatus, EvaluationBatch, EvaluationRecord,
    GenerationBatch, SmellReport,
};
use crate::store::BatchRepository;

pub struct Evaluator<E: Executor> {
    executor: E,
    detector: SmellDetector,
    prod_functions: Vec<String>,
    workers: usize,
}

impl<E: Executor> Evaluator<E> {
    pub fn new(executor: E, prod_functions: Vec<String>, workers: usize) -> Self {
        Self {
            executor,
            detector: SmellDetector::default(),
            prod_functions,
            workers: workers.max(1),
        }
    }

    pub fn evaluate_candidate(&self, id: &CandidateId, raw: &str) -> EvaluationRecord {
        let total = self.prod_functions.len();

        let Some(code) = first_code_block(raw) else {
            info!(candidate = %id, "no code block");
            return EvaluationRecord::no_code_found(total);
        };

        // Unparsable candidates are reported without being run.
        let (run, smells) = match self.detector.analyze(&code) {
            Ok(smells) => {
                let candidate = CandidateTest {
                    id: id.clone(),
                    source: code.clone(),
                };
                (self.executor.execute(&candidate), smells)
            }
            Err(e) => {
                warn!(candidate = %id, error = %e, "candidate does not parse");
                (
                    SandboxRun::failed(e.to_string(), CoverageGap::NotRun),
                    SmellReport::syntax_error(),
                )
            }
        };

        let assert_types = extract_assert_types(&code);
        let edge_case_found = detect_edge_cases(&code);
        let functions_tested = count_functions_tested(&code, &self.prod_functions);

        let score = synthesize(&ScoreInputs {
            outcome: &run.outcome,
            coverage: run.coverage,
            distinct_asserts: assert_types.len(),
            edge_case_found,
            functions_tested,
            total_functions: total,
            smells: &smells,
        });

        let status = if run.outcome.passed {
            EvalStatus::Passed
        } else {
            EvalStatus::Failed
        };

        info!(
            candidate = %id,
            status = ?status,
            coverage = %run.coverage.label(),
            score,
            "evaluated"
        );

        EvaluationRecord {
            status,
            coverage: run.coverage,
            assert_types,
            edge_case_found,
            functions_tested,
            total_functions: total,
            score,
            stdout: run.outcome.stdout,
            stderr: run.outcome.stderr,
            test_smells: smells,
        }
    }

    pub fn evaluate_batch(&self, batch: &GenerationBatch) -> EvaluationBatch {
        let (job_tx, job_rx) = unbounded::<(CandidateId, &str)>();
        let (out_tx, out_rx) = unbounded::<(CandidateId, EvaluationRecord)>();

        for job in batch.candidates() {
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let workers = self.workers.clamp(1, batch.len().max(1));

        thread::scope(|s| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                s.spawn(move || {
                    for (id, raw) in job_rx.iter() {
                        let record = self.evaluate_candidate(&id, raw);
                        let _ = out_tx.send((id, record));
                    }
                });
            }
        });
        drop(out_tx);

        let mut out = EvaluationBatch::default();
        for (id, record) in out_rx.iter() {
            out.insert(id, record);
        }
        out
    }
}

/// Evaluates the newest generation batch and persists the result.
pub fn run_latest(
    cfg: &EvalConfig,
    repo: &dyn BatchRepository,
) -> Result<(String, EvaluationBatch), RunError> {
    let generation = repo.latest_generation()?;
    let production = ProductionModule::locate(&cfg.project_root, &cfg.production_file)?;

    let prod_functions = production.functions().unwrap_or_else(|e| {
        warn!(error = %e, "production module unreadable; functional coverage disabled");
        Vec::new()
    });

    info!(
        batch = %generation.id,
        candidates = generation.len(),
        functions = prod_functions.len(),
        "starting evaluation"
    );

    let evaluator = Evaluator::new(Sandbox::new(cfg, production), prod_functions, cfg.workers);
    let results = evaluator.evaluate_batch(&generation);
    let id = repo.save_evaluation(&results)?;
    Ok((id, results))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::error::{IngestionError, StoreError};
    use crate::state::{CoverageReport, ExecutionOutcome, SmellKind};

    /// Passes everything with a fixed coverage, counting calls.
    struct FakeExecutor {
        coverage: CoverageReport,
        timeout: bool,
        calls: AtomicUsize,
    }

    impl FakeExecutor {
        fn passing(pct: u8) -> Self {
            Self {
                coverage: CoverageReport::Measured(pct),
                timeout: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn hanging() -> Self {
            Self {
                coverage: CoverageReport::Unmeasurable(CoverageGap::TimedOut),
                timeout: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Executor for FakeExecutor {
        fn execute(&self, _candidate: &CandidateTest) -> SandboxRun {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = if self.timeout {
                ExecutionOutcome::timeout()
            } else {
                ExecutionOutcome {
                    passed: true,
                    stdout: String::new(),
                    stderr: String::new(),
                    timed_out: false,
                }
            };
            SandboxRun {
                outcome,
                coverage: self.coverage,
            }
        }
    }

    fn prod() -> Vec<String> {
        vec!["add".to_string(), "sub".to_string()]
    }

    fn fenced(code: &str) -> String {
        format!("Here you go:\n```python\n{code}```\n")
    }

    fn generation(entries: &[(&str, &str, String)]) -> GenerationBatch {
        let mut map: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (m, v, text) in entries {
            map.entry(m.to_string())
                .or_default()
                .insert(v.to_string(), text.clone());
        }
        GenerationBatch {
            id: "tests_20250101_000000".into(),
            entries: map,
        }
    }

    #[test]
    fn no_code_block_never_runs() {
        let ev = Evaluator::new(FakeExecutor::passing(100), prod(), 2);
        let rec = ev.evaluate_candidate(&CandidateId::new("m", "v"), "I cannot help with that.");

        assert_eq!(rec, EvaluationRecord::no_code_found(2));
        assert_eq!(ev.executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn passing_candidate_is_scored() {
        let code = "def test_add():\n    self.assertEqual(add(1, 2), 3)\n    self.assertTrue(add(0, 0) == 0)\n";
        let ev = Evaluator::new(FakeExecutor::passing(100), prod(), 1);
        let rec = ev.evaluate_candidate(&CandidateId::new("m", "v"), &fenced(code));

        assert_eq!(rec.status, EvalStatus::Passed);
        assert_eq!(rec.coverage, CoverageReport::Measured(100));
        assert_eq!(rec.assert_types, vec!["assertEqual", "assertTrue"]);
        assert!(rec.edge_case_found);
        assert_eq!(rec.functions_tested, 1);
        assert_eq!(rec.total_functions, 2);
        assert!(!rec.test_smells.has_syntax_error());
        // 2 pass + 1 coverage + 0.07 asserts + 0.25 edge + 0.25 functional - smells
        let smell_cost = 0.2 * rec.test_smells.kinds() as f64;
        let expected = ((2.0 + 1.0 + 0.07 + 0.25 + 0.25 - smell_cost) * 100.0).round() / 100.0;
        assert_eq!(rec.score, expected);
    }

    #[test]
    fn unparsable_candidate_skips_sandbox() {
        let ev = Evaluator::new(FakeExecutor::passing(100), prod(), 1);
        let rec = ev.evaluate_candidate(&CandidateId::new("m", "v"), &fenced("def test_x(:\n    pass\n"));

        assert_eq!(ev.executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(rec.status, EvalStatus::Failed);
        assert!(rec.stderr.starts_with("SyntaxError"));
        assert_eq!(rec.coverage, CoverageReport::Unmeasurable(CoverageGap::NotRun));
        assert_eq!(rec.test_smells.count(SmellKind::SyntaxError), 1);
        assert_eq!(rec.test_smells.kinds(), 1);
        assert_eq!(rec.score, -1.0);
    }

    #[test]
    fn timeout_scores_like_zero_coverage() {
        let ev = Evaluator::new(FakeExecutor::hanging(), Vec::new(), 1);
        let rec = ev.evaluate_candidate(&CandidateId::new("m", "v"), &fenced("while True:\n    x = 1\n"));

        assert_eq!(rec.status, EvalStatus::Failed);
        assert_eq!(rec.stderr, "Timeout");
        assert_eq!(rec.coverage.label(), "-");
        assert!(rec.test_smells.is_empty());
        assert_eq!(rec.score, -1.0);
    }

    #[test]
    fn identical_sources_score_identically() {
        let text = fenced("def test_sub():\n    assert sub(3, 1) == 2\n");
        let batch = generation(&[
            ("alpha", "zero-shot", text.clone()),
            ("beta", "zero-shot", text.clone()),
            ("gamma", "few-shot", text),
        ]);

        let ev = Evaluator::new(FakeExecutor::passing(50), prod(), 3);
        let out = ev.evaluate_batch(&batch);

        assert_eq!(out.len(), 3);
        let a = out.get(&CandidateId::new("alpha", "zero-shot")).unwrap();
        let b = out.get(&CandidateId::new("beta", "zero-shot")).unwrap();
        let c = out.get(&CandidateId::new("gamma", "few-shot")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn pool_size_does_not_change_results() {
        let entries: Vec<(String, String, String)> = (0..12)
            .map(|i| {
                let body = if i % 3 == 0 {
                    "no code here".to_string()
                } else {
                    fenced(&format!("assert add({i}, 1) == {}\n", i + 1))
                };
                (format!("model{i:02}"), "v".to_string(), body)
            })
            .collect();
        let refs: Vec<(&str, &str, String)> = entries
            .iter()
            .map(|(m, v, t)| (m.as_str(), v.as_str(), t.clone()))
            .collect();
        let batch = generation(&refs);

        let serial = Evaluator::new(FakeExecutor::passing(75), prod(), 1).evaluate_batch(&batch);
        let pooled = Evaluator::new(FakeExecutor::passing(75), prod(), 8);
        let parallel = pooled.evaluate_batch(&batch);

        assert_eq!(serial, parallel);
        assert_eq!(pooled.executor.calls.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn empty_batch() {
        let ev = Evaluator::new(FakeExecutor::passing(100), prod(), 4);
        assert!(ev.evaluate_batch(&GenerationBatch::default()).is_empty());
    }

    /// In-memory repository recording what was saved.
    struct MemRepo {
        generation: Option<GenerationBatch>,
        saved: Mutex<Vec<EvaluationBatch>>,
    }

    impl BatchRepository for MemRepo {
        fn latest_generation(&self) -> Result<GenerationBatch, IngestionError> {
            self.generation.clone().ok_or_else(|| IngestionError::NoBatch {
                dir: "generated_tests".into(),
                pattern: "tests_*.json".into(),
            })
        }

        fn save_evaluation(&self, batch: &EvaluationBatch) -> Result<String, StoreError> {
            let mut saved = self.saved.lock().unwrap();
            saved.push(batch.clone());
            Ok(format!("evaluation_{}", saved.len()))
        }

        fn latest_evaluation(&self) -> Result<(String, EvaluationBatch), StoreError> {
            let saved = self.saved.lock().unwrap();
            saved
                .last()
                .cloned()
                .map(|b| (format!("evaluation_{}", saved.len()), b))
                .ok_or_else(|| StoreError::NoBatch("evaluation_results".into()))
        }

        fn load_evaluation(&self, id: &str) -> Result<EvaluationBatch, StoreError> {
            let n: usize = id
                .trim_start_matches("evaluation_")
                .parse()
                .map_err(|_| StoreError::NoBatch(id.into()))?;
            let saved = self.saved.lock().unwrap();
            saved
                .get(n.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| StoreError::NoBatch(id.into()))
        }
    }

    fn project(dir: &std::path::Path) -> EvalConfig {
        fs::create_dir_all(dir.join("prompts")).unwrap();
        fs::write(dir.join("prompts/code.py"), "def add(a, b):\n    return a + b\n").unwrap();
        EvalConfig {
            project_root: dir.to_path_buf(),
            coverage_bin: "definitely-not-coverage-xyz".into(),
            ..EvalConfig::default()
        }
        .resolve()
        .unwrap()
    }

    #[test]
    fn missing_generation_batch_aborts_before_saving() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = project(dir.path());
        let repo = MemRepo {
            generation: None,
            saved: Mutex::new(Vec::new()),
        };

        let err = run_latest(&cfg, &repo).unwrap_err();
        assert!(matches!(err, RunError::Ingestion(IngestionError::NoBatch { .. })));
        assert!(repo.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn run_latest_saves_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = project(dir.path());
        let repo = MemRepo {
            generation: Some(generation(&[("m", "v", "nothing to see".into())])),
            saved: Mutex::new(Vec::new()),
        };

        let (id, batch) = run_latest(&cfg, &repo).unwrap();
        assert_eq!(id, "evaluation_1");
        let rec = batch.get(&CandidateId::new("m", "v")).unwrap();
        assert_eq!(rec.status, EvalStatus::NoCodeFound);
        assert_eq!(rec.total_functions, 1);
        assert_eq!(repo.saved.lock().unwrap().len(), 1);
    }
}
