use serde::{Deserialize, Serialize};
use skilltest_core::{Baseline, RunMetrics, ScoreResult, ScorerMetrics};
use std::collections::BTreeMap;

/// Everything the comparator needs to know about one evaluated case. Carries
/// aggregates only; the report layer never reaches back into case bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseEvaluation {
    pub case_id: String,
    pub gate_passed: bool,
    pub executed_clean: bool,
    pub scores: Vec<ScoreResult>,
}

impl CaseEvaluation {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.gate_passed && self.executed_clean
    }
}

#[must_use]
pub fn collect_metrics(evaluations: &[CaseEvaluation]) -> RunMetrics {
    let total_cases = evaluations.len();
    let passed_cases = evaluations.iter().filter(|e| e.passed()).count();

    let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for evaluation in evaluations {
        for score in &evaluation.scores {
            let entry = counts.entry(score.scorer.clone()).or_insert((0, 0));
            if score.passed {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }

    let per_scorer = counts
        .into_iter()
        .map(|(scorer, (passed, failed))| {
            let total = passed + failed;
            let pass_rate = if total == 0 {
                1.0
            } else {
                passed as f64 / total as f64
            };
            (
                scorer,
                ScorerMetrics {
                    passed,
                    failed,
                    pass_rate,
                },
            )
        })
        .collect();

    RunMetrics {
        total_cases,
        passed_cases,
        pass_rate: if total_cases == 0 {
            1.0
        } else {
            passed_cases as f64 / total_cases as f64
        },
        per_scorer,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeltaClass {
    Regression,
    Improvement,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorerDelta {
    pub scorer: String,
    pub baseline_rate: f64,
    pub current_rate: f64,
    pub delta: f64,
    pub class: DeltaClass,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegressionReport {
    pub skill_name: String,
    pub baseline_id: String,
    pub tolerance: f64,
    pub overall: ScorerDelta,
    pub per_scorer: Vec<ScorerDelta>,
    pub regressions: usize,
    pub improvements: usize,
}

impl RegressionReport {
    #[must_use]
    pub fn has_regressions(&self) -> bool {
        self.regressions > 0
    }
}

/// Classification is policy: the tolerance is an absolute band on the rate
/// delta, default 0.0 so any decrease reads as a regression.
#[must_use]
pub fn classify(delta: f64, tolerance: f64) -> DeltaClass {
    if delta < -tolerance {
        DeltaClass::Regression
    } else if delta > tolerance {
        DeltaClass::Improvement
    } else {
        DeltaClass::Unchanged
    }
}

/// Diff current metrics against a stored baseline. Scorers present on only
/// one side are compared against a 0.0 rate on the other, so a dropped scorer
/// reads as a regression and a newly added one as an improvement. The baseline
/// is never mutated.
#[must_use]
pub fn compare(current: &RunMetrics, baseline: &Baseline, tolerance: f64) -> RegressionReport {
    let mut scorer_names: Vec<&String> = baseline.metrics.per_scorer.keys().collect();
    for name in current.per_scorer.keys() {
        if !baseline.metrics.per_scorer.contains_key(name) {
            scorer_names.push(name);
        }
    }
    scorer_names.sort();

    let per_scorer: Vec<ScorerDelta> = scorer_names
        .into_iter()
        .map(|name| {
            let baseline_rate = baseline
                .metrics
                .per_scorer
                .get(name)
                .map_or(0.0, |m| m.pass_rate);
            let current_rate = current.per_scorer.get(name).map_or(0.0, |m| m.pass_rate);
            let delta = current_rate - baseline_rate;
            ScorerDelta {
                scorer: name.clone(),
                baseline_rate,
                current_rate,
                delta,
                class: classify(delta, tolerance),
            }
        })
        .collect();

    let overall_delta = current.pass_rate - baseline.metrics.pass_rate;
    let overall = ScorerDelta {
        scorer: "overall".to_string(),
        baseline_rate: baseline.metrics.pass_rate,
        current_rate: current.pass_rate,
        delta: overall_delta,
        class: classify(overall_delta, tolerance),
    };

    let regressions = per_scorer
        .iter()
        .map(|d| &d.class)
        .chain(std::iter::once(&overall.class))
        .filter(|class| **class == DeltaClass::Regression)
        .count();
    let improvements = per_scorer
        .iter()
        .map(|d| &d.class)
        .chain(std::iter::once(&overall.class))
        .filter(|class| **class == DeltaClass::Improvement)
        .count();

    RegressionReport {
        skill_name: baseline.skill_name.clone(),
        baseline_id: baseline.baseline_id.clone(),
        tolerance,
        overall,
        per_scorer,
        regressions,
        improvements,
    }
}
