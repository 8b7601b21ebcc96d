use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Coverage value written when no percentage could be measured.
pub const COVERAGE_SENTINEL: &str = "-";

/// Exact stderr recorded for a candidate killed by the wall-clock timeout.
pub const TIMEOUT_MARKER: &str = "Timeout";

/* ---------- identity ---------- */

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CandidateId {
    pub model: String,
    pub variant: String,
}

impl CandidateId {
    pub fn new(model: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            variant: variant.into(),
        }
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.model, self.variant)
    }
}

/* ---------- generation input ---------- */

/// Raw generator output for one run: model -> prompt variant -> text.
#[derive(Debug, Clone, Default)]
pub struct GenerationBatch {
    pub id: String,
    pub entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl GenerationBatch {
    pub fn candidates(&self) -> impl Iterator<Item = (CandidateId, &str)> + '_ {
        self.entries.iter().flat_map(|(model, variants)| {
            variants
                .iter()
                .map(move |(variant, text)| (CandidateId::new(model, variant), text.as_str()))
        })
    }

    pub fn raw_text(&self, id: &CandidateId) -> Option<&str> {
        self.entries
            .get(&id.model)
            .and_then(|v| v.get(&id.variant))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }
}

/// One extracted test blob. Lives for a single evaluation pass.
#[derive(Debug, Clone)]
pub struct CandidateTest {
    pub id: CandidateId,
    pub source: String,
}

/* ---------- execution ---------- */

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExecutionOutcome {
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            passed: false,
            stdout: String::new(),
            stderr: TIMEOUT_MARKER.to_string(),
            timed_out: true,
        }
    }
}

/* ---------- coverage ---------- */

/// Why a run has no coverage percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageGap {
    NotRun,
    RunFailed,
    TimedOut,
    ReportMissing,
    ReportUnreadable,
    /// Loaded from a persisted batch, where only the sentinel survives.
    NotRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageReport {
    Measured(u8),
    Unmeasurable(CoverageGap),
}

impl CoverageReport {
    pub fn percent(&self) -> Option<u8> {
        match self {
            CoverageReport::Measured(p) => Some(*p),
            CoverageReport::Unmeasurable(_) => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            CoverageReport::Measured(p) => format!("{p}%"),
            CoverageReport::Unmeasurable(_) => COVERAGE_SENTINEL.to_string(),
        }
    }

    pub fn parse_label(label: &str) -> Self {
        label
            .trim()
            .strip_suffix('%')
            .and_then(|n| n.parse::<u8>().ok())
            .filter(|p| *p <= 100)
            .map(CoverageReport::Measured)
            .unwrap_or(CoverageReport::Unmeasurable(CoverageGap::NotRecorded))
    }
}

impl Default for CoverageReport {
    fn default() -> Self {
        CoverageReport::Unmeasurable(CoverageGap::NotRecorded)
    }
}

impl Serialize for CoverageReport {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for CoverageReport {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(CoverageReport::parse_label(&raw))
    }
}

/* ---------- smells ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmellKind {
    SyntaxError,
    AssertionRoulette,
    MagicNumber,
    SleepyTest,
    PrintStatement,
    RedundantAssertion,
    EmptyTest,
    IgnoredTest,
}

impl SmellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmellKind::SyntaxError => "syntax_error",
            SmellKind::AssertionRoulette => "assertion_roulette",
            SmellKind::MagicNumber => "magic_number",
            SmellKind::SleepyTest => "sleepy_test",
            SmellKind::PrintStatement => "print_statement",
            SmellKind::RedundantAssertion => "redundant_assertion",
            SmellKind::EmptyTest => "empty_test",
            SmellKind::IgnoredTest => "ignored_test",
        }
    }
}

/// Smell kind -> occurrences. Zero counts are never stored, and
/// `syntax_error` is always alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SmellReport(BTreeMap<SmellKind, u32>);

impl SmellReport {
    pub fn syntax_error() -> Self {
        let mut map = BTreeMap::new();
        map.insert(SmellKind::SyntaxError, 1);
        Self(map)
    }

    pub fn add(&mut self, kind: SmellKind, n: u32) {
        if n == 0 || kind == SmellKind::SyntaxError {
            return;
        }
        *self.0.entry(kind).or_insert(0) += n;
    }

    pub fn count(&self, kind: SmellKind) -> u32 {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn has_syntax_error(&self) -> bool {
        self.0.contains_key(&SmellKind::SyntaxError)
    }

    /// Number of distinct kinds present.
    pub fn kinds(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SmellKind, u32)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

/* ---------- evaluation output ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Passed,
    Failed,
    NoCodeFound,
}

impl EvalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalStatus::Passed => "passed",
            EvalStatus::Failed => "failed",
            EvalStatus::NoCodeFound => "no_code_found",
        }
    }
}

/// Older batches stored only `status` and `score` for `no_code_found`
/// entries, so every other field falls back to its default on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub status: EvalStatus,
    #[serde(default)]
    pub coverage: CoverageReport,
    #[serde(default)]
    pub assert_types: Vec<String>,
    #[serde(default)]
    pub edge_case_found: bool,
    #[serde(default)]
    pub functions_tested: usize,
    #[serde(default)]
    pub total_functions: usize,
    pub score: f64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub test_smells: SmellReport,
}

impl EvaluationRecord {
    pub fn no_code_found(total_functions: usize) -> Self {
        Self {
            status: EvalStatus::NoCodeFound,
            coverage: CoverageReport::Unmeasurable(CoverageGap::NotRun),
            assert_types: Vec::new(),
            edge_case_found: false,
            functions_tested: 0,
            total_functions,
            score: 0.0,
            stdout: String::new(),
            stderr: String::new(),
            test_smells: SmellReport::default(),
        }
    }
}

/// All records of one evaluation run, keyed like the generation batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationBatch {
    pub records: BTreeMap<String, BTreeMap<String, EvaluationRecord>>,
}

impl EvaluationBatch {
    pub fn insert(&mut self, id: CandidateId, record: EvaluationRecord) {
        self.records
            .entry(id.model)
            .or_default()
            .insert(id.variant, record);
    }

    pub fn get(&self, id: &CandidateId) -> Option<&EvaluationRecord> {
        self.records.get(&id.model).and_then(|v| v.get(&id.variant))
    }

    pub fn len(&self) -> usize {
        self.records.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records by score, best first. Ties keep model/variant order.
    pub fn ranking(&self) -> Vec<(CandidateId, &EvaluationRecord)> {
        let mut out: Vec<(CandidateId, &EvaluationRecord)> = self
            .records
            .iter()
            .flat_map(|(model, variants)| {
                variants
                    .iter()
                    .map(move |(variant, rec)| (CandidateId::new(model, variant), rec))
            })
            .collect();

        out.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(Ordering::Equal));
        out
    }

    pub fn best(&self) -> Option<(CandidateId, &EvaluationRecord)> {
        self.ranking().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(score: f64) -> EvaluationRecord {
        let mut r = EvaluationRecord::no_code_found(2);
        r.status = EvalStatus::Passed;
        r.score = score;
        r
    }

    #[test]
    fn coverage_labels_round_trip_through_json() {
        let measured = serde_json::to_string(&CoverageReport::Measured(83)).unwrap();
        assert_eq!(measured, "\"83%\"");

        let gap = serde_json::to_string(&CoverageReport::Unmeasurable(CoverageGap::TimedOut)).unwrap();
        assert_eq!(gap, "\"-\"");

        let back: CoverageReport = serde_json::from_str("\"40%\"").unwrap();
        assert_eq!(back, CoverageReport::Measured(40));
        let back: CoverageReport = serde_json::from_str("\"-\"").unwrap();
        assert_eq!(back.percent(), None);
    }

    #[test]
    fn smell_report_drops_zero_counts_and_keeps_syntax_error_alone() {
        let mut r = SmellReport::default();
        r.add(SmellKind::MagicNumber, 0);
        assert!(r.is_empty());

        r.add(SmellKind::MagicNumber, 2);
        r.add(SmellKind::MagicNumber, 1);
        r.add(SmellKind::SyntaxError, 1);
        assert_eq!(r.count(SmellKind::MagicNumber), 3);
        assert!(!r.has_syntax_error());

        let json = serde_json::to_value(SmellReport::syntax_error()).unwrap();
        assert_eq!(json, serde_json::json!({ "syntax_error": 1 }));
    }

    #[test]
    fn no_code_record_serializes_sentinel_status() {
        let json = serde_json::to_value(EvaluationRecord::no_code_found(3)).unwrap();
        assert_eq!(json["status"], "no_code_found");
        assert_eq!(json["score"], 0.0);
        assert_eq!(json["coverage"], "-");
        assert_eq!(json["total_functions"], 3);
    }

    #[test]
    fn legacy_no_code_entries_still_load() {
        let rec: EvaluationRecord =
            serde_json::from_str(r#"{"status": "no_code_found", "score": 0.0}"#).unwrap();
        assert_eq!(rec.status, EvalStatus::NoCodeFound);
        assert_eq!(rec.coverage.percent(), None);
        assert!(rec.test_smells.is_empty());
    }

    #[test]
    fn ranking_is_score_descending_and_stable_on_ties() {
        let mut batch = EvaluationBatch::default();
        batch.insert(CandidateId::new("b", "zero-shot"), record(1.5));
        batch.insert(CandidateId::new("a", "cot"), record(3.2));
        batch.insert(CandidateId::new("a", "few-shot"), record(1.5));

        let order: Vec<String> = batch
            .ranking()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(order, vec!["a/cot", "a/few-shot", "b/zero-shot"]);
        assert_eq!(batch.best().map(|(id, _)| id.model), Some("a".to_string()));
    }

    #[test]
    fn generation_batch_flattens_in_key_order() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "m2".to_string(),
            BTreeMap::from([("v".to_string(), "x".to_string())]),
        );
        entries.insert(
            "m1".to_string(),
            BTreeMap::from([
                ("b".to_string(), "y".to_string()),
                ("a".to_string(), "z".to_string()),
            ]),
        );
        let batch = GenerationBatch {
            id: "tests_1".into(),
            entries,
        };

        let ids: Vec<String> = batch.candidates().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["m1/a", "m1/b", "m2/v"]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.raw_text(&CandidateId::new("m1", "b")), Some("y"));
    }
}
