use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use skilltest_core::{HarnessConfig, HarnessError, Manifest, RunMetrics};
use skilltest_exec::ExecutionAdapter;
use skilltest_runner::{
    run_regression, save_baseline, DecisionPolicy, EvalReport, Generator, HttpGenerator,
    PipelineController, PipelineOutcome, ProvidedResponse, ReviewAction, ReviewInterface,
};
use skilltest_scorers::{HttpJudge, Judge, ScorerSet};
use skilltest_store::SkillStore;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const EXIT_FAILURE: i32 = 1;
const EXIT_BASELINE_MISSING: i32 = 3;

#[derive(Parser)]
#[command(name = "skilltest", version, about = "Test-case lifecycle engine for skill suites")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold a new skill test suite
    Init {
        skill: String,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Generate, execute, score and file one new test case
    Add {
        skill: String,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        response: Option<String>,
        #[arg(long)]
        reject_on_failure: bool,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate the ground-truth collection
    Run {
        skill: String,
        #[arg(long = "test-id")]
        test_ids: Vec<String>,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List or decide pending candidates
    Review {
        skill: String,
        #[arg(long)]
        batch: bool,
        #[arg(long)]
        filter_success: bool,
        #[arg(long)]
        approve: Option<String>,
        #[arg(long)]
        reject: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        skip: Option<String>,
        #[arg(long)]
        edit: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        response: Option<String>,
        #[arg(long)]
        facts: Option<String>,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate ground truth and save the metrics as a baseline
    Baseline {
        skill: String,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Evaluate ground truth and diff against a saved baseline
    Regression {
        skill: String,
        #[arg(long)]
        baseline_id: Option<String>,
        #[arg(long, default_value_t = 0.0)]
        tolerance: f64,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show the scorer configuration for a skill
    Scorers {
        skill: String,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Update the scorer configuration for a skill
    ScorersUpdate {
        skill: String,
        #[arg(long = "add-scorer")]
        add_scorers: Vec<String>,
        #[arg(long = "remove-scorer")]
        remove_scorers: Vec<String>,
        #[arg(long = "add-guideline")]
        add_guidelines: Vec<String>,
        #[arg(long = "remove-guideline")]
        remove_guidelines: Vec<String>,
        #[arg(long)]
        set_guidelines: Option<String>,
        #[arg(long, default_value = "skills")]
        skills_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct CmdOutput {
    payload: Option<Value>,
    exit_code: i32,
}

impl CmdOutput {
    fn ok(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }

    fn with_code(payload: Option<Value>, exit_code: i32) -> Self {
        Self { payload, exit_code }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(output) => {
            if let Some(payload) = &output.payload {
                emit_json(payload);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
        }
        Err(err) => {
            let exit_code = exit_code_for(&err);
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{err:#}"), json!({})));
            } else {
                eprintln!("error: {err:#}");
            }
            std::process::exit(exit_code);
        }
    }
}

#[allow(clippy::too_many_lines)]
fn run_command(command: Commands) -> Result<CmdOutput> {
    match command {
        Commands::Init {
            skill,
            skills_root,
            json,
        } => {
            let store = SkillStore::init(&skills_root, &skill)?;
            if json {
                return Ok(CmdOutput::ok(Some(json!({
                    "ok": true,
                    "command": "init",
                    "skill": skill,
                    "skill_dir": store.skill_dir().display().to_string(),
                }))));
            }
            println!("initialized: {}", store.skill_dir().display());
            println!("next: edit {}/manifest.yaml", store.skill_dir().display());
            println!("next: skilltest add {skill} --prompt \"...\"");
            Ok(CmdOutput::ok(None))
        }
        Commands::Add {
            skill,
            prompt,
            response,
            reject_on_failure,
            skills_root,
            json,
        } => {
            let config = HarnessConfig::load(Path::new("."))?;
            let store = SkillStore::open(&skills_root, &skill)?;
            let manifest = store.load_manifest()?;
            let judge = judge_from(&config)?;
            let scorers = ScorerSet::from_manifest(&manifest, judge)?;
            let adapter = ExecutionAdapter::from_config(&config)?;
            let policy = if reject_on_failure {
                DecisionPolicy::RejectOnFullExecutionFailure
            } else {
                DecisionPolicy::PendingReview
            };
            let controller = PipelineController::new(&store, &adapter, &scorers, &manifest, policy);

            let prompt = match prompt {
                Some(prompt) => prompt,
                None => read_stdin_block("Enter the test prompt (press Ctrl-D when done):")?,
            };
            let generator: Box<dyn Generator> = match response {
                Some(text) => Box::new(ProvidedResponse(text)),
                None => match HttpGenerator::from_config(&config)? {
                    Some(generator) => Box::new(generator),
                    None => {
                        return Err(HarnessError::ValidationFailed {
                            reason: "no --response given and no generator endpoint configured"
                                .to_string(),
                        }
                        .into());
                    }
                },
            };

            let outcome = controller.add_case(&prompt, generator.as_ref())?;
            let exit_code = if outcome.gate_passed { 0 } else { EXIT_FAILURE };
            if json {
                return Ok(CmdOutput::with_code(
                    Some(json!({
                        "ok": true,
                        "command": "add",
                        "skill": skill,
                        "outcome": outcome_to_json(&outcome),
                    })),
                    exit_code,
                ));
            }
            print_outcome(&outcome);
            Ok(CmdOutput::with_code(None, exit_code))
        }
        Commands::Run {
            skill,
            test_ids,
            skills_root,
            json,
        } => {
            let ids = if test_ids.is_empty() {
                None
            } else {
                Some(test_ids)
            };
            let (_store, report) = evaluate_ground_truth(&skills_root, &skill, ids.as_deref())?;
            let exit_code = if report.all_passed() { 0 } else { EXIT_FAILURE };
            if json {
                return Ok(CmdOutput::with_code(
                    Some(json!({
                        "ok": true,
                        "command": "run",
                        "skill": skill,
                        "report": report_to_json(&report),
                    })),
                    exit_code,
                ));
            }
            print_report(&report);
            Ok(CmdOutput::with_code(None, exit_code))
        }
        Commands::Review {
            skill,
            batch,
            filter_success,
            approve,
            reject,
            reason,
            skip,
            edit,
            prompt,
            response,
            facts,
            skills_root,
            json,
        } => {
            let store = SkillStore::open(&skills_root, &skill)?;
            let review = ReviewInterface::new(&store);
            let reviewer = reviewer_name();

            let actions = usize::from(batch)
                + usize::from(approve.is_some())
                + usize::from(reject.is_some())
                + usize::from(skip.is_some())
                + usize::from(edit.is_some());
            if actions > 1 {
                return Err(HarnessError::ValidationFailed {
                    reason: "choose one of --batch, --approve, --reject, --skip, --edit"
                        .to_string(),
                }
                .into());
            }

            if batch {
                let outcome = review.batch_approve(filter_success, &reviewer)?;
                if json {
                    return Ok(CmdOutput::ok(Some(json!({
                        "ok": true,
                        "command": "review",
                        "mode": "batch",
                        "filter_success": filter_success,
                        "reviewed": outcome.reviewed,
                        "approved": outcome.approved,
                        "skipped": outcome.skipped,
                        "promoted": outcome.promoted,
                    }))));
                }
                println!("mode: batch");
                println!("reviewed: {}", outcome.reviewed);
                println!("approved: {}", outcome.approved);
                println!("skipped: {}", outcome.skipped);
                println!("promoted: {}", outcome.promoted);
                return Ok(CmdOutput::ok(None));
            }

            if let Some(id) = approve {
                let outcome = review.decide(&id, ReviewAction::Approve, &reviewer)?;
                return review_decision_output(json, "approve", &id, outcome.promoted);
            }
            if let Some(id) = reject {
                let reason = reason.unwrap_or_default();
                review.decide(&id, ReviewAction::Reject { reason }, &reviewer)?;
                return review_decision_output(json, "reject", &id, false);
            }
            if let Some(id) = skip {
                review.decide(&id, ReviewAction::Skip, &reviewer)?;
                return review_decision_output(json, "skip", &id, false);
            }
            if let Some(id) = edit {
                let expected_facts = facts.map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|fact| !fact.is_empty())
                        .map(str::to_string)
                        .collect()
                });
                review.decide(
                    &id,
                    ReviewAction::Edit {
                        prompt,
                        response,
                        expected_facts,
                        guidelines: None,
                    },
                    &reviewer,
                )?;
                return review_decision_output(json, "edit", &id, false);
            }

            let pending = review.list_pending()?;
            if json {
                return Ok(CmdOutput::ok(Some(json!({
                    "ok": true,
                    "command": "review",
                    "mode": "list",
                    "pending": pending.iter().map(pending_to_json).collect::<Vec<_>>(),
                }))));
            }
            if pending.is_empty() {
                println!("no pending candidates");
            }
            for case in &pending {
                println!(
                    "{}  execution_success={}  blocks={}/{}  {}",
                    case.id,
                    case.execution_success,
                    case.code_blocks_passed,
                    case.code_blocks_found,
                    first_line(&case.prompt)
                );
            }
            Ok(CmdOutput::ok(None))
        }
        Commands::Baseline {
            skill,
            skills_root,
            json,
        } => {
            let (store, report) = evaluate_ground_truth(&skills_root, &skill, None)?;
            let baseline = save_baseline(&store, &report.metrics)?;
            if json {
                return Ok(CmdOutput::ok(Some(json!({
                    "ok": true,
                    "command": "baseline",
                    "skill": skill,
                    "baseline_id": baseline.baseline_id,
                    "metrics": metrics_to_json(&report.metrics)?,
                }))));
            }
            println!("baseline_id: {}", baseline.baseline_id);
            print_metrics(&report.metrics);
            Ok(CmdOutput::ok(None))
        }
        Commands::Regression {
            skill,
            baseline_id,
            tolerance,
            skills_root,
            json,
        } => {
            let (store, report) = evaluate_ground_truth(&skills_root, &skill, None)?;
            let comparison =
                run_regression(&store, &report.metrics, baseline_id.as_deref(), tolerance)?;
            let exit_code = if comparison.has_regressions() {
                EXIT_FAILURE
            } else {
                0
            };
            if json {
                return Ok(CmdOutput::with_code(
                    Some(json!({
                        "ok": true,
                        "command": "regression",
                        "skill": skill,
                        "comparison": serde_json::to_value(&comparison)?,
                    })),
                    exit_code,
                ));
            }
            println!("baseline_id: {}", comparison.baseline_id);
            println!("tolerance: {}", comparison.tolerance);
            println!(
                "overall: {:.3} -> {:.3} ({:?})",
                comparison.overall.baseline_rate, comparison.overall.current_rate,
                comparison.overall.class
            );
            for delta in &comparison.per_scorer {
                println!(
                    "{}: {:.3} -> {:.3} ({:?})",
                    delta.scorer, delta.baseline_rate, delta.current_rate, delta.class
                );
            }
            println!("regressions: {}", comparison.regressions);
            println!("improvements: {}", comparison.improvements);
            Ok(CmdOutput::with_code(None, exit_code))
        }
        Commands::Scorers {
            skill,
            skills_root,
            json,
        } => {
            let store = SkillStore::open(&skills_root, &skill)?;
            let manifest = store.load_manifest()?;
            if json {
                return Ok(CmdOutput::ok(Some(json!({
                    "ok": true,
                    "command": "scorers",
                    "skill": skill,
                    "enabled": manifest.scorers.enabled,
                    "llm_scorers": manifest.scorers.llm_scorers,
                    "llm_gates": manifest.scorers.llm_gates,
                    "default_guidelines": manifest.scorers.default_guidelines,
                    "known": ScorerSet::known_deterministic(),
                }))));
            }
            println!("enabled: {}", manifest.scorers.enabled.join(", "));
            println!("llm_scorers: {}", manifest.scorers.llm_scorers.join(", "));
            println!("llm_gates: {}", manifest.scorers.llm_gates.join(", "));
            println!(
                "default_guidelines: {}",
                manifest.scorers.default_guidelines.join(" | ")
            );
            println!(
                "known deterministic scorers: {}",
                ScorerSet::known_deterministic().join(", ")
            );
            Ok(CmdOutput::ok(None))
        }
        Commands::ScorersUpdate {
            skill,
            add_scorers,
            remove_scorers,
            add_guidelines,
            remove_guidelines,
            set_guidelines,
            skills_root,
            json,
        } => {
            let store = SkillStore::open(&skills_root, &skill)?;
            let mut manifest = store.load_manifest()?;
            apply_scorer_updates(
                &mut manifest,
                &add_scorers,
                &remove_scorers,
                &add_guidelines,
                &remove_guidelines,
                set_guidelines.as_deref(),
            )?;
            store.save_manifest(&manifest)?;
            if json {
                return Ok(CmdOutput::ok(Some(json!({
                    "ok": true,
                    "command": "scorers-update",
                    "skill": skill,
                    "enabled": manifest.scorers.enabled,
                    "default_guidelines": manifest.scorers.default_guidelines,
                }))));
            }
            println!("enabled: {}", manifest.scorers.enabled.join(", "));
            println!(
                "default_guidelines: {}",
                manifest.scorers.default_guidelines.join(" | ")
            );
            Ok(CmdOutput::ok(None))
        }
    }
}

fn evaluate_ground_truth(
    skills_root: &Path,
    skill: &str,
    test_ids: Option<&[String]>,
) -> Result<(SkillStore, EvalReport)> {
    let config = HarnessConfig::load(Path::new("."))?;
    let store = SkillStore::open(skills_root, skill)?;
    let manifest = store.load_manifest()?;
    let judge = judge_from(&config)?;
    let scorers = ScorerSet::from_manifest(&manifest, judge)?;
    let adapter = ExecutionAdapter::from_config(&config)?;
    let controller = PipelineController::new(
        &store,
        &adapter,
        &scorers,
        &manifest,
        DecisionPolicy::PendingReview,
    );
    let report = controller.run_ground_truth(test_ids, config.max_concurrency)?;
    Ok((store, report))
}

fn judge_from(config: &HarnessConfig) -> Result<Option<Arc<dyn Judge>>> {
    Ok(HttpJudge::from_config(config)?.map(|judge| Arc::new(judge) as Arc<dyn Judge>))
}

fn apply_scorer_updates(
    manifest: &mut Manifest,
    add_scorers: &[String],
    remove_scorers: &[String],
    add_guidelines: &[String],
    remove_guidelines: &[String],
    set_guidelines: Option<&str>,
) -> Result<()> {
    for name in add_scorers {
        if !ScorerSet::known_deterministic().contains(&name.as_str()) {
            return Err(HarnessError::ValidationFailed {
                reason: format!(
                    "unknown scorer '{name}'; known scorers: {}",
                    ScorerSet::known_deterministic().join(", ")
                ),
            }
            .into());
        }
        if !manifest.scorers.enabled.contains(name) {
            manifest.scorers.enabled.push(name.clone());
        }
    }
    manifest
        .scorers
        .enabled
        .retain(|name| !remove_scorers.contains(name));

    if let Some(list) = set_guidelines {
        manifest.scorers.default_guidelines = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
    }
    for guideline in add_guidelines {
        if !manifest.scorers.default_guidelines.contains(guideline) {
            manifest.scorers.default_guidelines.push(guideline.clone());
        }
    }
    manifest
        .scorers
        .default_guidelines
        .retain(|guideline| !remove_guidelines.contains(guideline));
    Ok(())
}

fn review_decision_output(json: bool, action: &str, id: &str, promoted: bool) -> Result<CmdOutput> {
    if json {
        return Ok(CmdOutput::ok(Some(json!({
            "ok": true,
            "command": "review",
            "mode": action,
            "id": id,
            "promoted": promoted,
        }))));
    }
    println!("{action}: {id}");
    if promoted {
        println!("promoted: true");
    }
    Ok(CmdOutput::ok(None))
}

fn read_stdin_block(hint: &str) -> Result<String> {
    eprintln!("{hint}");
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(HarnessError::ValidationFailed {
            reason: "no prompt provided".to_string(),
        }
        .into());
    }
    Ok(text)
}

fn reviewer_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "reviewer".to_string())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn print_outcome(outcome: &PipelineOutcome) {
    println!("test_id: {}", outcome.case.id);
    println!("decision: {}", outcome.decision.as_str());
    println!("status: {}", outcome.case.status);
    println!("gate_passed: {}", outcome.gate_passed);
    println!(
        "execution: {}/{} passed, {} degraded",
        outcome.case.code_blocks_passed,
        outcome.case.code_blocks_found,
        outcome.case.degraded_fragments()
    );
    for score in &outcome.case.scores {
        println!(
            "scorer {} [{}]: {} - {}",
            score.scorer,
            if score.gating { "gating" } else { "advisory" },
            if score.passed { "pass" } else { "fail" },
            first_line(&score.rationale)
        );
    }
}

fn print_report(report: &EvalReport) {
    println!("skill: {}", report.skill_name);
    print_metrics(&report.metrics);
    for case in &report.cases {
        let verdict = if case.gate_passed && case.executed_clean {
            "pass"
        } else {
            "fail"
        };
        println!(
            "{}: {verdict} (degraded={}, failing_scorers=[{}])",
            case.case_id,
            case.degraded,
            case.failing_scorers.join(", ")
        );
    }
}

fn print_metrics(metrics: &RunMetrics) {
    println!(
        "cases: {}/{} passed ({:.1}%)",
        metrics.passed_cases,
        metrics.total_cases,
        metrics.pass_rate * 100.0
    );
    for (scorer, stats) in &metrics.per_scorer {
        println!(
            "scorer {scorer}: {}/{} passed",
            stats.passed,
            stats.passed + stats.failed
        );
    }
}

fn outcome_to_json(outcome: &PipelineOutcome) -> Value {
    json!({
        "test_id": outcome.case.id,
        "decision": outcome.decision.as_str(),
        "status": outcome.case.status.as_str(),
        "gate_passed": outcome.gate_passed,
        "execution": {
            "blocks_found": outcome.case.code_blocks_found,
            "blocks_passed": outcome.case.code_blocks_passed,
            "degraded": outcome.case.degraded_fragments(),
        },
        "scores": outcome.case.scores.iter().map(|score| json!({
            "scorer": score.scorer,
            "gating": score.gating,
            "passed": score.passed,
            "value": score.value,
            "rationale": score.rationale,
        })).collect::<Vec<_>>(),
    })
}

fn pending_to_json(case: &skilltest_core::TestCase) -> Value {
    json!({
        "id": case.id,
        "prompt": case.prompt,
        "execution_success": case.execution_success,
        "blocks_found": case.code_blocks_found,
        "blocks_passed": case.code_blocks_passed,
        "created_at": case.created_at,
    })
}

fn report_to_json(report: &EvalReport) -> Value {
    json!({
        "skill": report.skill_name,
        "metrics": metrics_to_json(&report.metrics).unwrap_or(Value::Null),
        "cases": report.cases.iter().map(|case| json!({
            "id": case.case_id,
            "gate_passed": case.gate_passed,
            "executed_clean": case.executed_clean,
            "degraded": case.degraded,
            "failing_scorers": case.failing_scorers,
        })).collect::<Vec<_>>(),
    })
}

fn metrics_to_json(metrics: &RunMetrics) -> Result<Value> {
    Ok(serde_json::to_value(metrics)?)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json, .. }
        | Commands::Add { json, .. }
        | Commands::Run { json, .. }
        | Commands::Review { json, .. }
        | Commands::Baseline { json, .. }
        | Commands::Regression { json, .. }
        | Commands::Scorers { json, .. }
        | Commands::ScorersUpdate { json, .. } => *json,
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::GenerationFailed { .. }) => "generation_failed",
        Some(HarnessError::InvalidTransition { .. }) => "invalid_transition",
        Some(HarnessError::BaselineMissing { .. }) => "baseline_missing",
        Some(HarnessError::SkillNotFound { .. }) => "skill_not_found",
        Some(HarnessError::ManifestInvalid { .. }) => "manifest_invalid",
        Some(HarnessError::ValidationFailed { .. }) => "validation_failed",
        None => "command_failed",
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::BaselineMissing { .. }) => EXIT_BASELINE_MISSING,
        _ => EXIT_FAILURE,
    }
}
