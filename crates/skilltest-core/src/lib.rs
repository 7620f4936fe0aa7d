use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Typed failures surfaced to callers; everything else travels as `anyhow`
/// context on the operation that hit it.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("generation failed: {reason}")]
    GenerationFailed { reason: String },
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: CaseStatus,
        to: CaseStatus,
    },
    #[error("no baseline saved for skill '{skill}'")]
    BaselineMissing { skill: String },
    #[error("skill not found: {skill}")]
    SkillNotFound { skill: String },
    #[error("invalid manifest: {reason}")]
    ManifestInvalid { reason: String },
    #[error("validation failed: {reason}")]
    ValidationFailed { reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Approved,
    Rejected,
    Promoted,
}

impl CaseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Pending => "pending",
            CaseStatus::Approved => "approved",
            CaseStatus::Rejected => "rejected",
            CaseStatus::Promoted => "promoted",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Rejected | CaseStatus::Promoted)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single transition table shared by the automatic DECIDE path and the manual
/// review path. Legal edges: pending -> approved, pending -> rejected,
/// approved -> promoted. Anything else is refused and leaves state unchanged.
pub fn validate_transition(id: &str, from: CaseStatus, to: CaseStatus) -> Result<(), HarnessError> {
    let legal = matches!(
        (from, to),
        (CaseStatus::Pending, CaseStatus::Approved)
            | (CaseStatus::Pending, CaseStatus::Rejected)
            | (CaseStatus::Approved, CaseStatus::Promoted)
    );
    if legal {
        Ok(())
    } else {
        Err(HarnessError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Sql,
    Python,
}

impl Language {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Sql => "sql",
            Language::Python => "python",
        }
    }

    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "sql" => Some(Language::Sql),
            "python" | "py" => Some(Language::Python),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FragmentOutcome {
    Passed,
    Failed,
    Degraded,
}

/// Per-fragment execution record. `degraded` means the fragment never ran
/// against the backend (unreachable or timed out) and only the local syntax
/// check was applied; it is distinct from a real execution failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FragmentResult {
    pub language: Language,
    pub line: usize,
    pub outcome: FragmentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FragmentResult {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == FragmentOutcome::Passed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    Deterministic,
    Llm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreResult {
    pub scorer: String,
    pub kind: ScorerKind,
    pub gating: bool,
    pub passed: bool,
    pub value: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Expectations {
    #[serde(default)]
    pub expected_facts: Vec<String>,
    #[serde(default)]
    pub expected_patterns: Vec<String>,
    #[serde(default)]
    pub guidelines: Vec<String>,
}

/// One prompt/response/expectation triple moving through the lifecycle.
/// Cases are never deleted; rejection is a terminal soft state kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: String,
    pub skill_name: String,
    pub status: CaseStatus,
    pub prompt: String,
    pub response: String,
    #[serde(default)]
    pub execution_success: bool,
    #[serde(default)]
    pub code_blocks_found: usize,
    #[serde(default)]
    pub code_blocks_passed: usize,
    #[serde(default)]
    pub execution_details: Vec<FragmentResult>,
    #[serde(default)]
    pub expectations: Expectations,
    #[serde(default)]
    pub scores: Vec<ScoreResult>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
}

impl TestCase {
    #[must_use]
    pub fn new(skill_name: &str, prompt: &str, response: &str) -> Self {
        Self {
            id: mint_case_id(skill_name, prompt),
            skill_name: skill_name.to_string(),
            status: CaseStatus::Pending,
            prompt: prompt.to_string(),
            response: response.to_string(),
            execution_success: false,
            code_blocks_found: 0,
            code_blocks_passed: 0,
            execution_details: Vec::new(),
            expectations: Expectations::default(),
            scores: Vec::new(),
            created_at: now_rfc3339(),
            reviewer: None,
            reviewed_at: None,
            review_reason: None,
        }
    }

    /// True when every fragment ran and passed. Vacuously true for a response
    /// with no executable fragments; degraded fragments count as not clean.
    #[must_use]
    pub fn executed_clean(&self) -> bool {
        self.execution_details.iter().all(FragmentResult::passed)
    }

    #[must_use]
    pub fn degraded_fragments(&self) -> usize {
        self.execution_details
            .iter()
            .filter(|f| f.outcome == FragmentOutcome::Degraded)
            .count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidatesFile {
    #[serde(default)]
    pub candidates: Vec<TestCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthInputs {
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthOutputs {
    pub response: String,
    #[serde(default)]
    pub execution_success: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthMeta {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthCase {
    pub id: String,
    pub inputs: GroundTruthInputs,
    pub outputs: GroundTruthOutputs,
    #[serde(default)]
    pub expectations: Expectations,
    #[serde(default)]
    pub metadata: GroundTruthMeta,
}

impl GroundTruthCase {
    #[must_use]
    pub fn from_case(case: &TestCase, source: &str) -> Self {
        Self {
            id: case.id.clone(),
            inputs: GroundTruthInputs {
                prompt: case.prompt.clone(),
            },
            outputs: GroundTruthOutputs {
                response: case.response.clone(),
                execution_success: case.execution_success,
            },
            expectations: case.expectations.clone(),
            metadata: GroundTruthMeta {
                category: "grp".to_string(),
                source: source.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionMeta {
    pub skill_name: String,
    pub version: String,
    pub created_at: String,
}

impl Default for CollectionMeta {
    fn default() -> Self {
        Self {
            skill_name: String::new(),
            version: "0.1.0".to_string(),
            created_at: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroundTruthFile {
    #[serde(default)]
    pub metadata: CollectionMeta,
    #[serde(default)]
    pub test_cases: Vec<GroundTruthCase>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBudget {
    pub max_total: u64,
}

/// Trace expectation limits carried in the manifest as configuration data.
/// Live trace evaluation happens outside this engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceExpectations {
    #[serde(default)]
    pub tool_limits: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_budget: Option<TokenBudget>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    #[serde(default)]
    pub banned_tools: Vec<String>,
    #[serde(default)]
    pub expected_files: Vec<String>,
    #[serde(default)]
    pub category_limits: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScorerConfig {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub llm_scorers: Vec<String>,
    #[serde(default)]
    pub llm_gates: Vec<String>,
    #[serde(default)]
    pub default_guidelines: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_expectations: Option<TraceExpectations>,
}

/// Per-skill test-suite configuration. Owned by the skill; the pipeline only
/// reads it, updates go through the explicit scorers-update operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub skill_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub scorers: ScorerConfig,
    #[serde(default)]
    pub quality_gates: BTreeMap<String, f64>,
}

impl Manifest {
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.skill_name.trim().is_empty() {
            return Err(HarnessError::ManifestInvalid {
                reason: "skill_name must be non-empty".to_string(),
            });
        }
        for gate in &self.scorers.llm_gates {
            if !self.scorers.llm_scorers.contains(gate) {
                return Err(HarnessError::ManifestInvalid {
                    reason: format!("llm gate '{gate}' is not listed in scorers.llm_scorers"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScorerMetrics {
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetrics {
    pub total_cases: usize,
    pub passed_cases: usize,
    pub pass_rate: f64,
    #[serde(default)]
    pub per_scorer: BTreeMap<String, ScorerMetrics>,
}

/// Immutable aggregate snapshot. Baselines reference numbers only, never
/// individual test cases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Baseline {
    pub baseline_id: String,
    pub skill_name: String,
    pub saved_at: String,
    pub metrics: RunMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BaselinesFile {
    #[serde(default)]
    pub baselines: Vec<Baseline>,
}

#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Case ids are stable for a given (skill, prompt) within a clock second:
/// a timestamp prefix for human ordering plus a content hash suffix.
#[must_use]
pub fn mint_case_id(skill_name: &str, prompt: &str) -> String {
    let digest = sha256_hex(format!("{skill_name}\n{prompt}").as_bytes());
    format!("tc_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &digest[..8])
}

#[must_use]
pub fn mint_baseline_id(skill_name: &str) -> String {
    let digest = sha256_hex(skill_name.as_bytes());
    format!("bl_{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &digest[..8])
}

pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), HarnessError> {
    if value.trim().is_empty() {
        return Err(HarnessError::ValidationFailed {
            reason: format!("{field_name} must be non-empty"),
        });
    }
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create dir {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value)?;
    atomic_write_bytes(path, text.as_bytes())
}

pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes =
        fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeFragment {
    pub language: Language,
    pub line: usize,
    pub code: String,
}

/// Extract executable fenced code blocks from a response, in order. Only
/// fences tagged `sql` or `python` count; untagged and foreign-language fences
/// are skipped. `line` is the 1-based line of the opening fence. An unclosed
/// fence runs to the end of the response.
#[must_use]
pub fn extract_fragments(response: &str) -> Vec<CodeFragment> {
    let mut fragments = Vec::new();
    let mut lines = response.lines().enumerate().peekable();

    while let Some((idx, line)) = lines.next() {
        let trimmed = line.trim_start();
        let Some(tag) = trimmed.strip_prefix("```") else {
            continue;
        };
        let language = Language::parse(tag);
        let mut body = String::new();
        for (_, inner) in lines.by_ref() {
            if inner.trim_start().starts_with("```") {
                break;
            }
            if language.is_some() {
                body.push_str(inner);
                body.push('\n');
            }
        }
        if let Some(language) = language {
            fragments.push(CodeFragment {
                language,
                line: idx + 1,
                code: body,
            });
        }
    }

    fragments
}

fn default_execution_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrency() -> usize {
    1
}

/// Engine configuration: collaborator endpoints and run knobs. Loaded from
/// `.skilltest/config.yaml` under the workspace root, then overlaid with
/// `SKILLTEST_*` environment variables. Bearer tokens are never stored in the
/// file; `auth_bearer_env` names the environment variable that holds one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    #[serde(default)]
    pub execution_endpoint: Option<String>,
    #[serde(default)]
    pub judge_endpoint: Option<String>,
    #[serde(default)]
    pub generator_endpoint: Option<String>,
    #[serde(default)]
    pub auth_bearer_env: Option<String>,
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            execution_endpoint: None,
            judge_endpoint: None,
            generator_endpoint: None,
            auth_bearer_env: None,
            execution_timeout_ms: default_execution_timeout_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl HarnessConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(".skilltest").join("config.yaml");
        let mut config = if path.exists() {
            load_yaml(&path)?
        } else {
            Self::default()
        };
        config.overlay_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn overlay_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(value) = get("SKILLTEST_EXECUTION_ENDPOINT") {
            self.execution_endpoint = Some(value);
        }
        if let Some(value) = get("SKILLTEST_JUDGE_ENDPOINT") {
            self.judge_endpoint = Some(value);
        }
        if let Some(value) = get("SKILLTEST_GENERATOR_ENDPOINT") {
            self.generator_endpoint = Some(value);
        }
        if let Some(value) = get("SKILLTEST_AUTH_BEARER_ENV") {
            self.auth_bearer_env = Some(value);
        }
        if let Some(value) = get("SKILLTEST_EXECUTION_TIMEOUT_MS") {
            if let Ok(ms) = value.parse() {
                self.execution_timeout_ms = ms;
            }
        }
        if let Some(value) = get("SKILLTEST_MAX_CONCURRENCY") {
            if let Ok(workers) = value.parse::<usize>() {
                self.max_concurrency = workers.max(1);
            }
        }
    }

    pub fn bearer_token(&self) -> Result<Option<String>> {
        let Some(env_name) = &self.auth_bearer_env else {
            return Ok(None);
        };
        std::env::var(env_name)
            .map(Some)
            .map_err(|_| anyhow!("missing env var '{env_name}' named by auth_bearer_env"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_accepts_only_legal_edges() {
        validate_transition("t1", CaseStatus::Pending, CaseStatus::Approved)
            .expect("pending -> approved");
        validate_transition("t1", CaseStatus::Pending, CaseStatus::Rejected)
            .expect("pending -> rejected");
        validate_transition("t1", CaseStatus::Approved, CaseStatus::Promoted)
            .expect("approved -> promoted");

        let illegal = [
            (CaseStatus::Pending, CaseStatus::Promoted),
            (CaseStatus::Rejected, CaseStatus::Promoted),
            (CaseStatus::Rejected, CaseStatus::Approved),
            (CaseStatus::Promoted, CaseStatus::Pending),
            (CaseStatus::Approved, CaseStatus::Rejected),
            (CaseStatus::Pending, CaseStatus::Pending),
        ];
        for (from, to) in illegal {
            let err = validate_transition("t1", from, to).expect_err("must be refused");
            match err {
                HarnessError::InvalidTransition { id, .. } => assert_eq!(id, "t1"),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn extract_fragments_finds_tagged_blocks_with_lines() {
        let response = "intro\n```sql\nSELECT 1;\n```\ntext\n```python\nprint(1)\n```\n";
        let fragments = extract_fragments(response);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].language, Language::Sql);
        assert_eq!(fragments[0].line, 2);
        assert_eq!(fragments[0].code, "SELECT 1;\n");
        assert_eq!(fragments[1].language, Language::Python);
        assert_eq!(fragments[1].line, 6);
        assert_eq!(fragments[1].code, "print(1)\n");
    }

    #[test]
    fn extract_fragments_skips_untagged_and_foreign_fences() {
        let response = "```\nplain\n```\n```bash\nls\n```\n```sql\nSELECT 2;\n```\n";
        let fragments = extract_fragments(response);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].language, Language::Sql);
        assert_eq!(fragments[0].code, "SELECT 2;\n");
    }

    #[test]
    fn extract_fragments_tolerates_unclosed_fence() {
        let response = "```python\nx = 1\ny = 2\n";
        let fragments = extract_fragments(response);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].code, "x = 1\ny = 2\n");
    }

    #[test]
    fn executed_clean_is_vacuous_without_fragments_and_strict_with() {
        let mut case = TestCase::new("s", "p", "r");
        assert!(case.executed_clean());
        case.execution_details.push(FragmentResult {
            language: Language::Sql,
            line: 1,
            outcome: FragmentOutcome::Degraded,
            output: None,
            error: None,
            detail: None,
        });
        assert!(!case.executed_clean());
        assert_eq!(case.degraded_fragments(), 1);
    }

    #[test]
    fn manifest_validation_rejects_unlisted_llm_gate() {
        let mut manifest = Manifest {
            skill_name: "demo".to_string(),
            ..Manifest::default()
        };
        manifest.scorers.llm_gates.push("safety".to_string());
        let err = manifest.validate().expect_err("gate without scorer");
        assert!(err.to_string().contains("safety"));

        manifest.scorers.llm_scorers.push("safety".to_string());
        manifest.validate().expect("gate listed as llm scorer");
    }

    #[test]
    fn atomic_write_round_trips_yaml() {
        let dir = std::env::temp_dir().join(format!(
            "skilltest_core_io_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        let path = dir.join("candidates.yaml");

        let doc = CandidatesFile {
            candidates: vec![TestCase::new("demo", "make a table", "```sql\nSELECT 1;\n```")],
        };
        atomic_write_yaml(&path, &doc).expect("write");
        let loaded: CandidatesFile = load_yaml(&path).expect("load");
        assert_eq!(loaded, doc);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn case_id_carries_prompt_hash_suffix() {
        let a = mint_case_id("skill", "prompt one");
        let b = mint_case_id("skill", "prompt one");
        let c = mint_case_id("skill", "prompt two");
        assert!(a.starts_with("tc_"));
        assert_eq!(a.rsplit('_').next(), b.rsplit('_').next());
        assert_ne!(a.rsplit('_').next(), c.rsplit('_').next());
    }

    #[test]
    fn config_env_overlay_wins_over_file_values() {
        let mut config = HarnessConfig {
            execution_endpoint: Some("http://file.example".to_string()),
            ..HarnessConfig::default()
        };
        config.overlay_env(|name| match name {
            "SKILLTEST_EXECUTION_ENDPOINT" => Some("http://env.example".to_string()),
            "SKILLTEST_MAX_CONCURRENCY" => Some("4".to_string()),
            _ => None,
        });
        assert_eq!(
            config.execution_endpoint.as_deref(),
            Some("http://env.example")
        );
        assert_eq!(config.max_concurrency, 4);
    }
}
