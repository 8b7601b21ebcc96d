//! Trust score synthesis.
//!
//! The weights are empirical and kept exactly as the evaluation
//! dashboard has always ranked candidates.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::state::{CoverageGap, CoverageReport, ExecutionOutcome, SmellReport};

pub const PASS_BONUS: f64 = 2.0;
pub const ZERO_COVERAGE_PENALTY: f64 = -1.0;
/// Upper bound of each coverage tier (inclusive) and its bonus.
pub const COVERAGE_TIERS: [(u8, f64); 4] = [(25, 0.25), (50, 0.50), (75, 0.75), (100, 1.0)];
pub const EDGE_CASE_BONUS: f64 = 0.25;
pub const FUNCTIONAL_WEIGHT: f64 = 0.5;
pub const SMELL_PENALTY: f64 = 0.2;
pub const SYNTAX_ERROR_PENALTY: f64 = 1.0;

/// Matched as plain substrings of the test source.
pub const EDGE_CASE_INDICATORS: [&str; 7] = ["0", "-1", "\"\"", "''", "[]", "{}", "None"];

fn assert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"self\.(assert\w+)").unwrap())
}

fn ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\W\d]\w*").unwrap())
}

/// Distinct `self.assert*` method names, sorted.
pub fn extract_assert_types(code: &str) -> Vec<String> {
    assert_re()
        .captures_iter(code)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn detect_edge_cases(code: &str) -> bool {
    EDGE_CASE_INDICATORS.iter().any(|e| code.contains(e))
}

/// Production functions whose name appears as an identifier in `code`.
pub fn count_functions_tested(code: &str, prod_functions: &[String]) -> usize {
    let idents: HashSet<&str> = ident_re().find_iter(code).map(|m| m.as_str()).collect();
    let distinct: HashSet<&str> = prod_functions.iter().map(String::as_str).collect();
    distinct.into_iter().filter(|f| idents.contains(f)).count()
}

#[derive(Debug, Clone)]
pub struct ScoreInputs<'a> {
    pub outcome: &'a ExecutionOutcome,
    pub coverage: CoverageReport,
    pub distinct_asserts: usize,
    pub edge_case_found: bool,
    pub functions_tested: usize,
    pub total_functions: usize,
    pub smells: &'a SmellReport,
}

pub fn synthesize(inputs: &ScoreInputs) -> f64 {
    let mut score = 0.0;

    if inputs.outcome.passed {
        score += PASS_BONUS;
    }
    score += coverage_term(inputs.coverage);
    score += assertion_term(inputs.distinct_asserts);
    if inputs.edge_case_found {
        score += EDGE_CASE_BONUS;
    }
    if inputs.total_functions > 0 {
        score += FUNCTIONAL_WEIGHT * (inputs.functions_tested as f64 / inputs.total_functions as f64);
    }
    score -= smell_penalty(inputs.smells);

    round2(score)
}

/// A timed-out run exercised nothing it could report, so it is scored
/// like 0% coverage. Other gaps are neutral.
pub fn coverage_term(coverage: CoverageReport) -> f64 {
    match coverage {
        CoverageReport::Measured(0) => ZERO_COVERAGE_PENALTY,
        CoverageReport::Measured(p) => COVERAGE_TIERS
            .iter()
            .find(|(upper, _)| p <= *upper)
            .map(|(_, bonus)| *bonus)
            .unwrap_or(1.0),
        CoverageReport::Unmeasurable(CoverageGap::TimedOut) => ZERO_COVERAGE_PENALTY,
        CoverageReport::Unmeasurable(_) => 0.0,
    }
}

pub fn assertion_term(distinct: usize) -> f64 {
    match distinct {
        0 | 1 => 0.0,
        2 => 0.07,
        3 => 0.15,
        _ => 0.30,
    }
}

pub fn smell_penalty(smells: &SmellReport) -> f64 {
    if smells.has_syntax_error() {
        SYNTAX_ERROR_PENALTY
    } else {
        SMELL_PENALTY * smells.kinds() as f64
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
