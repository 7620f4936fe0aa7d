use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::{json, Value};
use skilltest_core::{
    extract_fragments, HarnessConfig, HarnessError, Language, Manifest, ScoreResult, ScorerKind,
    TestCase,
};
use skilltest_exec::local_syntax_check;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One evaluation function. Deterministic scorers must be pure in
/// `(case, manifest)`; LLM scorers hide their collaborator behind the same
/// interface so callers never distinguish kinds.
pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ScorerKind;
    fn score(&self, case: &TestCase, manifest: &Manifest) -> ScoreResult;
}

fn deterministic(name: &str, passed: bool, value: f64, rationale: String) -> ScoreResult {
    ScoreResult {
        scorer: name.to_string(),
        kind: ScorerKind::Deterministic,
        gating: false,
        passed,
        value,
        rationale,
    }
}

pub struct ExpectedFactsScorer;

impl Scorer for ExpectedFactsScorer {
    fn name(&self) -> &str {
        "expected_facts"
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::Deterministic
    }

    fn score(&self, case: &TestCase, _manifest: &Manifest) -> ScoreResult {
        let facts = &case.expectations.expected_facts;
        if facts.is_empty() {
            return deterministic(self.name(), true, 1.0, "no expected facts declared".into());
        }
        let missing: Vec<&str> = facts
            .iter()
            .filter(|fact| !case.response.contains(fact.as_str()))
            .map(String::as_str)
            .collect();
        let found = facts.len() - missing.len();
        let value = found as f64 / facts.len() as f64;
        if missing.is_empty() {
            deterministic(
                self.name(),
                true,
                value,
                format!("all {} expected facts present", facts.len()),
            )
        } else {
            deterministic(
                self.name(),
                false,
                value,
                format!("missing facts: {}", missing.join(", ")),
            )
        }
    }
}

pub struct ExpectedPatternsScorer;

impl Scorer for ExpectedPatternsScorer {
    fn name(&self) -> &str {
        "expected_patterns"
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::Deterministic
    }

    fn score(&self, case: &TestCase, _manifest: &Manifest) -> ScoreResult {
        let patterns = &case.expectations.expected_patterns;
        if patterns.is_empty() {
            return deterministic(self.name(), true, 1.0, "no expected patterns declared".into());
        }
        let mut failures = Vec::new();
        let mut matched = 0_usize;
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(&case.response) => matched += 1,
                Ok(_) => failures.push(format!("no match for /{pattern}/")),
                Err(err) => failures.push(format!("invalid pattern /{pattern}/: {err}")),
            }
        }
        let value = matched as f64 / patterns.len() as f64;
        if failures.is_empty() {
            deterministic(
                self.name(),
                true,
                value,
                format!("all {} patterns matched", patterns.len()),
            )
        } else {
            deterministic(self.name(), false, value, failures.join("; "))
        }
    }
}

struct SyntaxScorer {
    language: Language,
}

impl SyntaxScorer {
    fn scorer_name(&self) -> &'static str {
        match self.language {
            Language::Sql => "sql_syntax",
            Language::Python => "python_syntax",
        }
    }
}

impl Scorer for SyntaxScorer {
    fn name(&self) -> &str {
        self.scorer_name()
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::Deterministic
    }

    fn score(&self, case: &TestCase, _manifest: &Manifest) -> ScoreResult {
        let fragments: Vec<_> = extract_fragments(&case.response)
            .into_iter()
            .filter(|fragment| fragment.language == self.language)
            .collect();
        if fragments.is_empty() {
            return deterministic(
                self.scorer_name(),
                true,
                1.0,
                format!("no {} fragments", self.language),
            );
        }
        let mut failures = Vec::new();
        for fragment in &fragments {
            if let Err(reason) = local_syntax_check(fragment.language, &fragment.code) {
                failures.push(format!("line {}: {reason}", fragment.line));
            }
        }
        let value = (fragments.len() - failures.len()) as f64 / fragments.len() as f64;
        if failures.is_empty() {
            deterministic(
                self.scorer_name(),
                true,
                value,
                format!("{} fragment(s) syntactically valid", fragments.len()),
            )
        } else {
            deterministic(self.scorer_name(), false, value, failures.join("; "))
        }
    }
}

pub struct ExecutionSuccessScorer;

impl Scorer for ExecutionSuccessScorer {
    fn name(&self) -> &str {
        "execution_success"
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::Deterministic
    }

    fn score(&self, case: &TestCase, _manifest: &Manifest) -> ScoreResult {
        let degraded = case.degraded_fragments();
        let rationale = format!(
            "{}/{} fragments passed, {} degraded",
            case.code_blocks_passed, case.code_blocks_found, degraded
        );
        let value = if case.code_blocks_found == 0 {
            1.0
        } else {
            case.code_blocks_passed as f64 / case.code_blocks_found as f64
        };
        deterministic(self.name(), case.execution_success, value, rationale)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgeVerdict {
    pub pass: bool,
    pub rationale: String,
}

/// External judging collaborator. Non-deterministic by nature; failures are
/// reported through the scorer result, never propagated into the pipeline.
pub trait Judge: Send + Sync {
    fn judge(&self, prompt: &str, response: &str, guideline: &str) -> Result<JudgeVerdict>;
}

pub struct HttpJudge {
    endpoint: String,
    client: reqwest::blocking::Client,
    bearer: Option<String>,
}

impl HttpJudge {
    pub fn new(endpoint: &str, bearer: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            bearer,
        })
    }

    pub fn from_config(config: &HarnessConfig) -> Result<Option<Self>> {
        match &config.judge_endpoint {
            Some(endpoint) => Ok(Some(Self::new(endpoint, config.bearer_token()?)?)),
            None => Ok(None),
        }
    }
}

impl Judge for HttpJudge {
    fn judge(&self, prompt: &str, response: &str, guideline: &str) -> Result<JudgeVerdict> {
        let mut builder = self.client.post(format!("{}/judge", self.endpoint));
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        let body: Value = builder
            .json(&json!({
                "prompt": prompt,
                "response": response,
                "guideline": guideline,
            }))
            .send()?
            .json()?;
        let verdict = body
            .get("verdict")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("judge reply missing verdict"))?;
        Ok(JudgeVerdict {
            pass: verdict.eq_ignore_ascii_case("pass"),
            rationale: body
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        })
    }
}

/// Guideline adherence via the judge collaborator. The label comes from the
/// manifest so a skill can run several judge personas side by side.
pub struct GuidelineScorer {
    label: String,
    judge: Option<Arc<dyn Judge>>,
}

impl Scorer for GuidelineScorer {
    fn name(&self) -> &str {
        &self.label
    }

    fn kind(&self) -> ScorerKind {
        ScorerKind::Llm
    }

    fn score(&self, case: &TestCase, manifest: &Manifest) -> ScoreResult {
        let mut guidelines: Vec<&str> = case
            .expectations
            .guidelines
            .iter()
            .map(String::as_str)
            .collect();
        guidelines.extend(
            manifest
                .scorers
                .default_guidelines
                .iter()
                .map(String::as_str),
        );

        let base = ScoreResult {
            scorer: self.label.clone(),
            kind: ScorerKind::Llm,
            gating: false,
            passed: true,
            value: 1.0,
            rationale: String::new(),
        };

        if guidelines.is_empty() {
            return ScoreResult {
                rationale: "no guidelines declared".to_string(),
                ..base
            };
        }
        let Some(judge) = &self.judge else {
            return ScoreResult {
                passed: false,
                value: 0.0,
                rationale: "judge not configured, guidelines not evaluated".to_string(),
                ..base
            };
        };

        let mut lines = Vec::new();
        let mut passed_count = 0_usize;
        let mut all_pass = true;
        for guideline in &guidelines {
            match judge.judge(&case.prompt, &case.response, guideline) {
                Ok(verdict) => {
                    if verdict.pass {
                        passed_count += 1;
                    } else {
                        all_pass = false;
                    }
                    lines.push(format!(
                        "[{}] {guideline}: {}",
                        if verdict.pass { "pass" } else { "fail" },
                        verdict.rationale
                    ));
                }
                Err(err) => {
                    warn!(scorer = %self.label, %err, "judge unavailable");
                    all_pass = false;
                    lines.push(format!("[error] {guideline}: judge unavailable: {err}"));
                }
            }
        }
        ScoreResult {
            passed: all_pass,
            value: passed_count as f64 / guidelines.len() as f64,
            rationale: lines.join("\n"),
            ..base
        }
    }
}

const DETERMINISTIC_SCORERS: &[&str] = &[
    "expected_facts",
    "expected_patterns",
    "sql_syntax",
    "python_syntax",
    "execution_success",
];

struct ScorerEntry {
    scorer: Box<dyn Scorer>,
    gating: bool,
}

/// The resolved scorer roster for one skill: every name in
/// `scorers.enabled` (all gating) plus every LLM scorer (gating only when
/// listed under `scorers.llm_gates`).
pub struct ScorerSet {
    entries: Vec<ScorerEntry>,
}

impl std::fmt::Debug for ScorerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScorerSet")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ScorerSet {
    pub fn from_manifest(
        manifest: &Manifest,
        judge: Option<Arc<dyn Judge>>,
    ) -> Result<Self, HarnessError> {
        let mut entries = Vec::new();
        for name in &manifest.scorers.enabled {
            let scorer: Box<dyn Scorer> = match name.as_str() {
                "expected_facts" => Box::new(ExpectedFactsScorer),
                "expected_patterns" => Box::new(ExpectedPatternsScorer),
                "sql_syntax" => Box::new(SyntaxScorer {
                    language: Language::Sql,
                }),
                "python_syntax" => Box::new(SyntaxScorer {
                    language: Language::Python,
                }),
                "execution_success" => Box::new(ExecutionSuccessScorer),
                other => {
                    return Err(HarnessError::ManifestInvalid {
                        reason: format!(
                            "unknown scorer '{other}'; known scorers: {}",
                            DETERMINISTIC_SCORERS.join(", ")
                        ),
                    });
                }
            };
            entries.push(ScorerEntry {
                scorer,
                gating: true,
            });
        }

        for name in &manifest.scorers.llm_scorers {
            let gating = manifest.scorers.llm_gates.contains(name);
            if gating && judge.is_none() {
                return Err(HarnessError::ManifestInvalid {
                    reason: format!("llm gate '{name}' requires a configured judge endpoint"),
                });
            }
            entries.push(ScorerEntry {
                scorer: Box::new(GuidelineScorer {
                    label: name.clone(),
                    judge: judge.clone(),
                }),
                gating,
            });
        }

        Ok(Self { entries })
    }

    /// Run every scorer with no short-circuit so the full rationale set is
    /// available for review even when an early scorer fails.
    #[must_use]
    pub fn score_case(&self, case: &TestCase, manifest: &Manifest) -> Vec<ScoreResult> {
        self.entries
            .iter()
            .map(|entry| {
                let mut result = entry.scorer.score(case, manifest);
                result.gating = entry.gating;
                result
            })
            .collect()
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.scorer.name().to_string())
            .collect()
    }

    #[must_use]
    pub fn gating_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.gating)
            .map(|entry| entry.scorer.name().to_string())
            .collect()
    }

    #[must_use]
    pub fn known_deterministic() -> &'static [&'static str] {
        DETERMINISTIC_SCORERS
    }
}

/// Aggregate gate: logical AND over every gating result.
#[must_use]
pub fn aggregate_gate(results: &[ScoreResult]) -> bool {
    results
        .iter()
        .filter(|result| result.gating)
        .all(|result| result.passed)
}
