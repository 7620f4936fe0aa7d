use anyhow::Result;
use serde_json::{json, Value};
use skilltest_analysis::{collect_metrics, compare, CaseEvaluation, RegressionReport};
use skilltest_core::{
    ensure_non_empty, extract_fragments, mint_baseline_id, now_rfc3339, Baseline, CaseStatus,
    HarnessConfig, HarnessError, Manifest, RunMetrics, ScoreResult, TestCase,
};
use skilltest_exec::ExecutionAdapter;
use skilltest_scorers::{aggregate_gate, ScorerSet};
use skilltest_store::SkillStore;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// External generation collaborator: prompt in, response text out. Failures
/// surface as `GenerationFailed` and nothing is persisted for the case.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String>;
}

pub struct HttpGenerator {
    endpoint: String,
    client: reqwest::blocking::Client,
    bearer: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: &str, bearer: Option<String>) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(120))
                .build()?,
            bearer,
        })
    }

    pub fn from_config(config: &HarnessConfig) -> Result<Option<Self>> {
        match &config.generator_endpoint {
            Some(endpoint) => Ok(Some(Self::new(endpoint, config.bearer_token()?)?)),
            None => Ok(None),
        }
    }
}

impl Generator for HttpGenerator {
    fn generate(&self, prompt: &str) -> Result<String> {
        let mut builder = self.client.post(format!("{}/generate", self.endpoint));
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        let body: Value = builder.json(&json!({ "prompt": prompt })).send()?.json()?;
        body.get("response")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("generator reply missing response"))
    }
}

/// Wraps a response the operator captured out of band, e.g. pasted into the
/// add command.
pub struct ProvidedResponse(pub String);

impl Generator for ProvidedResponse {
    fn generate(&self, _prompt: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// What to do when every fragment of a case failed execution. The default
/// keeps a human in the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecisionPolicy {
    #[default]
    PendingReview,
    RejectOnFullExecutionFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Promoted,
    PendingReview,
    Rejected,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Promoted => "promoted",
            Decision::PendingReview => "pending_review",
            Decision::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub case: TestCase,
    pub decision: Decision,
    pub gate_passed: bool,
}

/// Drives one case through generate, execute, score, decide. Batches fan the
/// compute phase out over a worker pool; persistence stays sequential under
/// the per-skill lock.
pub struct PipelineController<'a> {
    store: &'a SkillStore,
    adapter: &'a ExecutionAdapter,
    scorers: &'a ScorerSet,
    manifest: &'a Manifest,
    policy: DecisionPolicy,
}

impl<'a> PipelineController<'a> {
    #[must_use]
    pub fn new(
        store: &'a SkillStore,
        adapter: &'a ExecutionAdapter,
        scorers: &'a ScorerSet,
        manifest: &'a Manifest,
        policy: DecisionPolicy,
    ) -> Self {
        Self {
            store,
            adapter,
            scorers,
            manifest,
            policy,
        }
    }

    pub fn add_case(&self, prompt: &str, generator: &dyn Generator) -> Result<PipelineOutcome> {
        let (case, decision, gate_passed) = self.prepare_case(prompt, generator)?;
        let _lock = self.store.lock()?;
        let case = self.persist_decision(case, decision)?;
        Ok(PipelineOutcome {
            case,
            decision,
            gate_passed,
        })
    }

    /// Process independent prompts concurrently. Per-case failures are
    /// isolated in the returned vector and never abort the batch.
    pub fn add_batch(
        &self,
        prompts: &[String],
        generator: &dyn Generator,
        max_concurrency: usize,
    ) -> Result<Vec<Result<PipelineOutcome>>> {
        let prepared = self.prepare_batch(prompts, generator, max_concurrency);
        let _lock = self.store.lock()?;
        Ok(prepared
            .into_iter()
            .map(|entry| {
                entry.and_then(|(case, decision, gate_passed)| {
                    let case = self.persist_decision(case, decision)?;
                    Ok(PipelineOutcome {
                        case,
                        decision,
                        gate_passed,
                    })
                })
            })
            .collect())
    }

    /// Evaluate the ground-truth collection: execute and score every case
    /// without touching stored state.
    pub fn run_ground_truth(
        &self,
        test_ids: Option<&[String]>,
        max_concurrency: usize,
    ) -> Result<EvalReport> {
        let ground_truth = self.store.load_ground_truth()?;
        let mut cases = ground_truth.test_cases;
        if let Some(ids) = test_ids {
            let unknown: Vec<&String> = ids
                .iter()
                .filter(|id| !cases.iter().any(|case| case.id == **id))
                .collect();
            if !unknown.is_empty() {
                return Err(HarnessError::ValidationFailed {
                    reason: format!(
                        "unknown test ids: {}",
                        unknown
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                }
                .into());
            }
            cases.retain(|case| ids.iter().any(|id| *id == case.id));
        }

        let inputs: Vec<TestCase> = cases
            .iter()
            .map(|gt| {
                let mut case =
                    TestCase::new(self.store.skill_name(), &gt.inputs.prompt, &gt.outputs.response);
                case.id = gt.id.clone();
                case.expectations = gt.expectations.clone();
                case
            })
            .collect();

        let evaluated = run_pool(&inputs, max_concurrency, |case| {
            let mut case = case.clone();
            self.evaluate(&mut case);
            case
        });

        let mut reports = Vec::with_capacity(evaluated.len());
        let mut evaluations = Vec::with_capacity(evaluated.len());
        for case in evaluated {
            let gate_passed = aggregate_gate(&case.scores);
            let failing_scorers: Vec<String> = case
                .scores
                .iter()
                .filter(|score| score.gating && !score.passed)
                .map(|score| score.scorer.clone())
                .collect();
            evaluations.push(CaseEvaluation {
                case_id: case.id.clone(),
                gate_passed,
                executed_clean: case.executed_clean(),
                scores: case.scores.clone(),
            });
            reports.push(CaseReport {
                case_id: case.id.clone(),
                gate_passed,
                executed_clean: case.executed_clean(),
                degraded: case.degraded_fragments(),
                failing_scorers,
                scores: case.scores,
            });
        }

        let metrics = collect_metrics(&evaluations);
        info!(
            skill = self.store.skill_name(),
            total = metrics.total_cases,
            passed = metrics.passed_cases,
            "ground truth evaluated"
        );
        Ok(EvalReport {
            skill_name: self.store.skill_name().to_string(),
            metrics,
            cases: reports,
        })
    }

    fn prepare_case(
        &self,
        prompt: &str,
        generator: &dyn Generator,
    ) -> Result<(TestCase, Decision, bool)> {
        ensure_non_empty("prompt", prompt)?;
        let response = generator.generate(prompt).map_err(|err| {
            HarnessError::GenerationFailed {
                reason: format!("{err:#}"),
            }
        })?;

        let mut case = TestCase::new(self.store.skill_name(), prompt, &response);
        self.evaluate(&mut case);
        let decision = self.decide(&case);
        let gate_passed = aggregate_gate(&case.scores);
        debug!(
            id = %case.id,
            decision = decision.as_str(),
            gate_passed,
            "case prepared"
        );
        Ok((case, decision, gate_passed))
    }

    fn prepare_batch(
        &self,
        prompts: &[String],
        generator: &dyn Generator,
        max_concurrency: usize,
    ) -> Vec<Result<(TestCase, Decision, bool)>> {
        run_pool(prompts, max_concurrency, |prompt| {
            self.prepare_case(prompt, generator)
        })
    }

    fn evaluate(&self, case: &mut TestCase) {
        let fragments = extract_fragments(&case.response);
        case.code_blocks_found = fragments.len();
        case.execution_details = self.adapter.execute_all(&case.skill_name, &fragments);
        case.code_blocks_passed = case
            .execution_details
            .iter()
            .filter(|result| result.passed())
            .count();
        case.execution_success = case.executed_clean();
        case.scores = self.scorers.score_case(case, self.manifest);
    }

    /// DECIDE. A degraded fragment always routes to review: code that never
    /// ran must not be silently promoted on the strength of a syntax check.
    fn decide(&self, case: &TestCase) -> Decision {
        if case.degraded_fragments() > 0 {
            return Decision::PendingReview;
        }
        if aggregate_gate(&case.scores) && case.executed_clean() {
            return Decision::Promoted;
        }
        let fully_failed = case.code_blocks_found > 0 && case.code_blocks_passed == 0;
        if fully_failed && self.policy == DecisionPolicy::RejectOnFullExecutionFailure {
            return Decision::Rejected;
        }
        Decision::PendingReview
    }

    fn persist_decision(&self, case: TestCase, decision: Decision) -> Result<TestCase> {
        self.store.append_candidate(&case)?;
        match decision {
            Decision::Promoted => {
                self.store
                    .update_status(&case.id, CaseStatus::Approved, None, "controller")?;
                self.store.promote_approved("auto_promoted")?;
                Ok(self.store.get_candidate(&case.id)?.unwrap_or(case))
            }
            Decision::Rejected => self.store.update_status(
                &case.id,
                CaseStatus::Rejected,
                Some("execution failed for every fragment"),
                "controller.policy",
            ),
            Decision::PendingReview => Ok(case),
        }
    }
}

/// Fixed-size worker pool over an index queue; results come back in input
/// order. One slow job never reorders or drops the others.
fn run_pool<T: Sync, R: Send>(
    items: &[T],
    max_concurrency: usize,
    work: impl Fn(&T) -> R + Sync,
) -> Vec<R> {
    let workers = max_concurrency.max(1).min(items.len().max(1));
    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..items.len()).collect());
    let results: Vec<Mutex<Option<R>>> = items.iter().map(|_| Mutex::new(None)).collect();

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let next = queue.lock().expect("queue poisoned").pop_front();
                let Some(index) = next else {
                    break;
                };
                let output = work(&items[index]);
                *results[index].lock().expect("result poisoned") = Some(output);
            });
        }
    });

    results
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .expect("result poisoned")
                .expect("worker completed every claimed index")
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub case_id: String,
    pub gate_passed: bool,
    pub executed_clean: bool,
    pub degraded: usize,
    pub failing_scorers: Vec<String>,
    pub scores: Vec<ScoreResult>,
}

#[derive(Debug, Clone)]
pub struct EvalReport {
    pub skill_name: String,
    pub metrics: RunMetrics,
    pub cases: Vec<CaseReport>,
}

impl EvalReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.metrics.passed_cases == self.metrics.total_cases
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewAction {
    Approve,
    Reject {
        reason: String,
    },
    Skip,
    Edit {
        prompt: Option<String>,
        response: Option<String>,
        expected_facts: Option<Vec<String>>,
        guidelines: Option<Vec<String>>,
    },
}

#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub case: TestCase,
    pub promoted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReviewOutcome {
    pub reviewed: usize,
    pub approved: usize,
    pub skipped: usize,
    pub promoted: usize,
}

/// The manual entry point into the same state machine the controller drives.
/// Every transition goes through the store's shared validation, so the two
/// paths cannot diverge on invariants.
pub struct ReviewInterface<'a> {
    store: &'a SkillStore,
}

impl<'a> ReviewInterface<'a> {
    #[must_use]
    pub fn new(store: &'a SkillStore) -> Self {
        Self { store }
    }

    pub fn list_pending(&self) -> Result<Vec<TestCase>> {
        self.store.list_candidates(Some(CaseStatus::Pending))
    }

    pub fn decide(&self, id: &str, action: ReviewAction, reviewer: &str) -> Result<ReviewOutcome> {
        match action {
            ReviewAction::Approve => {
                let _lock = self.store.lock()?;
                self.store
                    .update_status(id, CaseStatus::Approved, None, reviewer)?;
                self.store.promote_approved("review_approved")?;
                let case = self.expect_case(id)?;
                Ok(ReviewOutcome {
                    case,
                    promoted: true,
                })
            }
            ReviewAction::Reject { reason } => {
                let _lock = self.store.lock()?;
                let case =
                    self.store
                        .update_status(id, CaseStatus::Rejected, Some(&reason), reviewer)?;
                Ok(ReviewOutcome {
                    case,
                    promoted: false,
                })
            }
            ReviewAction::Skip => {
                let case = self.expect_case(id)?;
                Ok(ReviewOutcome {
                    case,
                    promoted: false,
                })
            }
            ReviewAction::Edit {
                prompt,
                response,
                expected_facts,
                guidelines,
            } => {
                let _lock = self.store.lock()?;
                let mut candidates = self.store.load_candidates()?;
                let case = candidates
                    .iter_mut()
                    .find(|case| case.id == id)
                    .ok_or_else(|| HarnessError::ValidationFailed {
                        reason: format!("unknown test case id '{id}'"),
                    })?;
                if case.status != CaseStatus::Pending {
                    return Err(HarnessError::ValidationFailed {
                        reason: format!(
                            "only pending cases can be edited; '{id}' is {}",
                            case.status
                        ),
                    }
                    .into());
                }
                if let Some(prompt) = prompt {
                    case.prompt = prompt;
                }
                let response_changed = response.is_some();
                if let Some(response) = response {
                    case.response = response;
                }
                if let Some(facts) = expected_facts {
                    case.expectations.expected_facts = facts;
                }
                if let Some(guidelines) = guidelines {
                    case.expectations.guidelines = guidelines;
                }
                if response_changed {
                    // Prior execution and scores no longer describe this case.
                    case.execution_details.clear();
                    case.scores.clear();
                    case.execution_success = false;
                    case.code_blocks_found = 0;
                    case.code_blocks_passed = 0;
                }
                let updated = case.clone();
                self.store.save_candidates(&candidates)?;
                Ok(ReviewOutcome {
                    case: updated,
                    promoted: false,
                })
            }
        }
    }

    /// Bulk approval with the same invariants as the single-case path. With
    /// `filter_success`, exactly the pending candidates whose execution
    /// succeeded are approved; the rest stay pending.
    pub fn batch_approve(&self, filter_success: bool, reviewer: &str) -> Result<BatchReviewOutcome> {
        let _lock = self.store.lock()?;
        let pending = self.store.list_candidates(Some(CaseStatus::Pending))?;
        let mut approved = 0_usize;
        let mut skipped = 0_usize;
        for case in &pending {
            if !filter_success || case.execution_success {
                self.store
                    .update_status(&case.id, CaseStatus::Approved, None, reviewer)?;
                approved += 1;
            } else {
                skipped += 1;
            }
        }
        let promoted = self.store.promote_approved("review_approved")?;
        info!(
            skill = self.store.skill_name(),
            reviewed = pending.len(),
            approved,
            skipped,
            promoted,
            "batch review finished"
        );
        Ok(BatchReviewOutcome {
            reviewed: pending.len(),
            approved,
            skipped,
            promoted,
        })
    }

    fn expect_case(&self, id: &str) -> Result<TestCase> {
        self.store
            .get_candidate(id)?
            .ok_or_else(|| {
                HarnessError::ValidationFailed {
                    reason: format!("unknown test case id '{id}'"),
                }
                .into()
            })
    }
}

pub fn save_baseline(store: &SkillStore, metrics: &RunMetrics) -> Result<Baseline> {
    let baseline = Baseline {
        baseline_id: mint_baseline_id(store.skill_name()),
        skill_name: store.skill_name().to_string(),
        saved_at: now_rfc3339(),
        metrics: metrics.clone(),
    };
    let _lock = store.lock()?;
    store.append_baseline(&baseline)?;
    info!(
        skill = store.skill_name(),
        baseline_id = %baseline.baseline_id,
        "baseline saved"
    );
    Ok(baseline)
}

/// Compare current metrics against the latest (or a named) baseline. The
/// distinct `BaselineMissing` error lets the CLI exit with its own code when
/// no snapshot exists yet.
pub fn run_regression(
    store: &SkillStore,
    current: &RunMetrics,
    baseline_id: Option<&str>,
    tolerance: f64,
) -> Result<RegressionReport> {
    let baseline = match baseline_id {
        Some(id) => store.find_baseline(id)?,
        None => store.latest_baseline()?,
    }
    .ok_or_else(|| HarnessError::BaselineMissing {
        skill: store.skill_name().to_string(),
    })?;
    Ok(compare(current, &baseline, tolerance))
}
