use anyhow::{anyhow, Result};
use skilltest_core::{
    atomic_write_yaml, ensure_dir, ensure_non_empty, load_yaml, now_rfc3339, validate_transition,
    Baseline, BaselinesFile, CandidatesFile, CaseStatus, CollectionMeta, GroundTruthCase,
    GroundTruthFile, HarnessError, Manifest, TestCase,
};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const MANIFEST_FILE: &str = "manifest.yaml";
const CANDIDATES_FILE: &str = "candidates.yaml";
const GROUND_TRUTH_FILE: &str = "ground_truth.yaml";
const BASELINES_FILE: &str = "baselines.yaml";
const LOCK_FILE: &str = ".skilltest.lock";

/// Serializes writers for one skill directory. Readers take no lock. The lock
/// file is removed on drop; a crash leaves it behind for the operator to
/// clear, which beats two writers interleaving ground-truth updates.
#[derive(Debug)]
pub struct SkillLock {
    path: PathBuf,
}

impl SkillLock {
    pub fn acquire(skill_dir: &Path, skill_name: &str) -> Result<Self> {
        let path = skill_dir.join(LOCK_FILE);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    now_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                Ok(Self { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
                "operation_in_progress: skill '{skill_name}' is already locked by another writer"
            )),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for SkillLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Handle to one skill's persisted state. Passed explicitly into every
/// pipeline and review call; there is no process-wide store.
#[derive(Debug, Clone)]
pub struct SkillStore {
    skill_dir: PathBuf,
    skill_name: String,
}

impl SkillStore {
    pub fn open(skills_root: &Path, skill_name: &str) -> Result<Self> {
        ensure_non_empty("skill_name", skill_name)?;
        let skill_dir = skills_root.join(skill_name);
        if !skill_dir.join(MANIFEST_FILE).exists() {
            return Err(HarnessError::SkillNotFound {
                skill: skill_name.to_string(),
            }
            .into());
        }
        Ok(Self {
            skill_dir,
            skill_name: skill_name.to_string(),
        })
    }

    /// Scaffold a new skill directory: manifest template, empty candidates
    /// collection, empty ground truth collection.
    pub fn init(skills_root: &Path, skill_name: &str) -> Result<Self> {
        ensure_non_empty("skill_name", skill_name)?;
        let skill_dir = skills_root.join(skill_name);
        if skill_dir.join(MANIFEST_FILE).exists() {
            return Err(HarnessError::ValidationFailed {
                reason: format!("skill '{skill_name}' is already initialized"),
            }
            .into());
        }
        ensure_dir(&skill_dir)?;

        let manifest = default_manifest(skill_name);
        atomic_write_yaml(&skill_dir.join(MANIFEST_FILE), &manifest)?;
        atomic_write_yaml(&skill_dir.join(CANDIDATES_FILE), &CandidatesFile::default())?;
        let ground_truth = GroundTruthFile {
            metadata: CollectionMeta {
                skill_name: skill_name.to_string(),
                ..CollectionMeta::default()
            },
            test_cases: Vec::new(),
        };
        atomic_write_yaml(&skill_dir.join(GROUND_TRUTH_FILE), &ground_truth)?;

        info!(skill = skill_name, dir = %skill_dir.display(), "initialized skill scaffolding");
        Ok(Self {
            skill_dir,
            skill_name: skill_name.to_string(),
        })
    }

    #[must_use]
    pub fn skill_name(&self) -> &str {
        &self.skill_name
    }

    #[must_use]
    pub fn skill_dir(&self) -> &Path {
        &self.skill_dir
    }

    pub fn lock(&self) -> Result<SkillLock> {
        SkillLock::acquire(&self.skill_dir, &self.skill_name)
    }

    pub fn load_manifest(&self) -> Result<Manifest> {
        let manifest: Manifest = load_yaml(&self.skill_dir.join(MANIFEST_FILE)).map_err(|err| {
            HarnessError::ManifestInvalid {
                reason: format!("{err:#}"),
            }
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        manifest.validate()?;
        atomic_write_yaml(&self.skill_dir.join(MANIFEST_FILE), manifest)
    }

    pub fn load_candidates(&self) -> Result<Vec<TestCase>> {
        let path = self.skill_dir.join(CANDIDATES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file: CandidatesFile = load_yaml(&path)?;
        Ok(file.candidates)
    }

    pub fn save_candidates(&self, candidates: &[TestCase]) -> Result<()> {
        atomic_write_yaml(
            &self.skill_dir.join(CANDIDATES_FILE),
            &CandidatesFile {
                candidates: candidates.to_vec(),
            },
        )
    }

    pub fn get_candidate(&self, id: &str) -> Result<Option<TestCase>> {
        Ok(self
            .load_candidates()?
            .into_iter()
            .find(|case| case.id == id))
    }

    pub fn list_candidates(&self, status: Option<CaseStatus>) -> Result<Vec<TestCase>> {
        let mut candidates = self.load_candidates()?;
        if let Some(status) = status {
            candidates.retain(|case| case.status == status);
        }
        Ok(candidates)
    }

    /// Append-only: a candidate id is written once and never removed.
    pub fn append_candidate(&self, case: &TestCase) -> Result<()> {
        let mut candidates = self.load_candidates()?;
        if candidates.iter().any(|existing| existing.id == case.id) {
            return Err(HarnessError::ValidationFailed {
                reason: format!("duplicate test case id '{}'", case.id),
            }
            .into());
        }
        candidates.push(case.clone());
        self.save_candidates(&candidates)?;
        debug!(skill = %self.skill_name, id = %case.id, "candidate appended");
        Ok(())
    }

    /// The one place statuses change. Both the automatic DECIDE path and the
    /// manual review path come through here, so the transition table cannot
    /// diverge between them. Refused transitions leave the file untouched.
    pub fn update_status(
        &self,
        id: &str,
        new_status: CaseStatus,
        reason: Option<&str>,
        decided_by: &str,
    ) -> Result<TestCase> {
        let mut candidates = self.load_candidates()?;
        let case = candidates
            .iter_mut()
            .find(|case| case.id == id)
            .ok_or_else(|| HarnessError::ValidationFailed {
                reason: format!("unknown test case id '{id}'"),
            })?;

        validate_transition(id, case.status, new_status)?;
        if new_status == CaseStatus::Rejected {
            let reason = reason.unwrap_or("");
            if reason.trim().is_empty() {
                return Err(HarnessError::ValidationFailed {
                    reason: format!("rejecting '{id}' requires a non-empty reason"),
                }
                .into());
            }
        }

        case.status = new_status;
        if matches!(new_status, CaseStatus::Approved | CaseStatus::Rejected) {
            case.reviewer = Some(decided_by.to_string());
            case.reviewed_at = Some(now_rfc3339());
            case.review_reason = reason.map(str::to_string);
        }
        let updated = case.clone();
        self.save_candidates(&candidates)?;
        info!(
            skill = %self.skill_name,
            id,
            status = new_status.as_str(),
            decided_by,
            "status updated"
        );
        Ok(updated)
    }

    pub fn load_ground_truth(&self) -> Result<GroundTruthFile> {
        let path = self.skill_dir.join(GROUND_TRUTH_FILE);
        if !path.exists() {
            return Ok(GroundTruthFile {
                metadata: CollectionMeta {
                    skill_name: self.skill_name.clone(),
                    ..CollectionMeta::default()
                },
                test_cases: Vec::new(),
            });
        }
        load_yaml(&path)
    }

    /// Move every approved candidate into the ground-truth collection and mark
    /// it promoted. Existing ground-truth entries are preserved; candidate
    /// rows are retained with their terminal status for audit.
    pub fn promote_approved(&self, source: &str) -> Result<usize> {
        let mut candidates = self.load_candidates()?;
        let mut ground_truth = self.load_ground_truth()?;
        if ground_truth.metadata.skill_name.is_empty() {
            ground_truth.metadata.skill_name = self.skill_name.clone();
        }

        let mut promoted = 0_usize;
        for case in candidates
            .iter_mut()
            .filter(|case| case.status == CaseStatus::Approved)
        {
            validate_transition(&case.id, case.status, CaseStatus::Promoted)?;
            case.status = CaseStatus::Promoted;
            if !ground_truth.test_cases.iter().any(|gt| gt.id == case.id) {
                ground_truth
                    .test_cases
                    .push(GroundTruthCase::from_case(case, source));
            }
            promoted += 1;
        }

        if promoted > 0 {
            atomic_write_yaml(&self.skill_dir.join(GROUND_TRUTH_FILE), &ground_truth)?;
            self.save_candidates(&candidates)?;
            info!(skill = %self.skill_name, promoted, "candidates promoted to ground truth");
        }
        Ok(promoted)
    }

    pub fn load_baselines(&self) -> Result<Vec<Baseline>> {
        let path = self.skill_dir.join(BASELINES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file: BaselinesFile = load_yaml(&path)?;
        Ok(file.baselines)
    }

    /// Baselines are append-only snapshots; a later save supersedes but never
    /// rewrites an earlier one.
    pub fn append_baseline(&self, baseline: &Baseline) -> Result<()> {
        let mut baselines = self.load_baselines()?;
        baselines.push(baseline.clone());
        atomic_write_yaml(
            &self.skill_dir.join(BASELINES_FILE),
            &BaselinesFile { baselines },
        )
    }

    pub fn latest_baseline(&self) -> Result<Option<Baseline>> {
        Ok(self.load_baselines()?.into_iter().last())
    }

    pub fn find_baseline(&self, baseline_id: &str) -> Result<Option<Baseline>> {
        Ok(self
            .load_baselines()?
            .into_iter()
            .find(|baseline| baseline.baseline_id == baseline_id))
    }
}

fn default_manifest(skill_name: &str) -> Manifest {
    let mut manifest = Manifest {
        skill_name: skill_name.to_string(),
        description: String::new(),
        ..Manifest::default()
    };
    manifest.scorers.enabled = vec![
        "sql_syntax".to_string(),
        "python_syntax".to_string(),
        "execution_success".to_string(),
        "expected_facts".to_string(),
    ];
    manifest.scorers.llm_scorers = vec!["guideline_adherence".to_string()];
    manifest
}

/// Skill directories under the root, identified by the presence of a
/// manifest.
pub fn list_skills(skills_root: &Path) -> Vec<String> {
    let mut skills: Vec<String> = WalkDir::new(skills_root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_dir())
        .filter(|entry| entry.path().join(MANIFEST_FILE).exists())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    skills.sort();
    skills
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skilltest_core::HarnessError;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "skilltest_store_{tag}_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn pending_case(id: &str, execution_success: bool) -> TestCase {
        let mut case = TestCase::new("demo", "make a table", "```sql\nSELECT 1;\n```");
        case.id = id.to_string();
        case.execution_success = execution_success;
        case
    }

    #[test]
    fn init_scaffolds_and_refuses_double_init() {
        let root = temp_root("init");
        let store = SkillStore::init(&root, "demo").expect("init");
        assert!(store.skill_dir().join("manifest.yaml").exists());
        assert!(store.skill_dir().join("candidates.yaml").exists());
        assert!(store.skill_dir().join("ground_truth.yaml").exists());

        let err = SkillStore::init(&root, "demo").expect_err("double init");
        assert!(err.to_string().contains("already initialized"));

        let manifest = store.load_manifest().expect("manifest");
        assert_eq!(manifest.skill_name, "demo");
        assert!(manifest
            .scorers
            .enabled
            .contains(&"execution_success".to_string()));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn open_missing_skill_is_typed() {
        let root = temp_root("missing");
        let err = SkillStore::open(&root, "ghost").expect_err("missing");
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::SkillNotFound { skill }) => assert_eq!(skill, "ghost"),
            other => panic!("unexpected error: {other:?}"),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn append_get_and_filter_by_status() {
        let root = temp_root("filter");
        let store = SkillStore::init(&root, "demo").expect("init");
        store
            .append_candidate(&pending_case("tc_a", true))
            .expect("append a");
        store
            .append_candidate(&pending_case("tc_b", false))
            .expect("append b");
        store
            .update_status("tc_b", CaseStatus::Rejected, Some("syntax error"), "tester")
            .expect("reject b");

        let pending = store
            .list_candidates(Some(CaseStatus::Pending))
            .expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "tc_a");
        assert!(store.get_candidate("tc_b").expect("get").is_some());

        let err = store
            .append_candidate(&pending_case("tc_a", true))
            .expect_err("duplicate id");
        assert!(err.to_string().contains("duplicate"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn illegal_transition_is_refused_and_state_unchanged() {
        let root = temp_root("transition");
        let store = SkillStore::init(&root, "demo").expect("init");
        store
            .append_candidate(&pending_case("tc_a", false))
            .expect("append");
        store
            .update_status("tc_a", CaseStatus::Rejected, Some("bad output"), "tester")
            .expect("reject");

        let err = store
            .update_status("tc_a", CaseStatus::Approved, None, "tester")
            .expect_err("rejected cases stay rejected");
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::InvalidTransition { from, to, .. }) => {
                assert_eq!(*from, CaseStatus::Rejected);
                assert_eq!(*to, CaseStatus::Approved);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let reloaded = store.get_candidate("tc_a").expect("get").expect("exists");
        assert_eq!(reloaded.status, CaseStatus::Rejected);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn reject_without_reason_fails_validation_and_keeps_pending() {
        let root = temp_root("reason");
        let store = SkillStore::init(&root, "demo").expect("init");
        store
            .append_candidate(&pending_case("tc_a", false))
            .expect("append");

        for reason in [None, Some(""), Some("   ")] {
            let err = store
                .update_status("tc_a", CaseStatus::Rejected, reason, "tester")
                .expect_err("reason required");
            assert!(err.to_string().contains("non-empty reason"));
        }
        let reloaded = store.get_candidate("tc_a").expect("get").expect("exists");
        assert_eq!(reloaded.status, CaseStatus::Pending);
        assert!(reloaded.reviewer.is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn promote_moves_approved_and_preserves_existing_ground_truth() {
        let root = temp_root("promote");
        let store = SkillStore::init(&root, "demo").expect("init");

        let mut existing = store.load_ground_truth().expect("gt");
        existing.test_cases.push(GroundTruthCase {
            id: "existing_001".to_string(),
            inputs: skilltest_core::GroundTruthInputs {
                prompt: "old".to_string(),
            },
            outputs: skilltest_core::GroundTruthOutputs {
                response: "old response".to_string(),
                execution_success: true,
            },
            expectations: Default::default(),
            metadata: Default::default(),
        });
        atomic_write_yaml(&store.skill_dir().join("ground_truth.yaml"), &existing)
            .expect("seed gt");

        store
            .append_candidate(&pending_case("tc_new", true))
            .expect("append");
        store
            .append_candidate(&pending_case("tc_stays", true))
            .expect("append");
        store
            .update_status("tc_new", CaseStatus::Approved, None, "tester")
            .expect("approve");

        let promoted = store.promote_approved("review_approved").expect("promote");
        assert_eq!(promoted, 1);

        let ground_truth = store.load_ground_truth().expect("gt");
        let ids: Vec<&str> = ground_truth
            .test_cases
            .iter()
            .map(|case| case.id.as_str())
            .collect();
        assert!(ids.contains(&"existing_001"));
        assert!(ids.contains(&"tc_new"));

        let candidates = store.load_candidates().expect("candidates");
        assert_eq!(candidates.len(), 2, "promoted rows are retained for audit");
        let promoted_case = candidates.iter().find(|c| c.id == "tc_new").expect("row");
        assert_eq!(promoted_case.status, CaseStatus::Promoted);

        // Re-running changes nothing.
        assert_eq!(store.promote_approved("review_approved").expect("rerun"), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn skill_lock_is_exclusive_per_skill() {
        let root = temp_root("lock");
        let store = SkillStore::init(&root, "demo").expect("init");

        let lock1 = store.lock().expect("first lock");
        let err = store.lock().expect_err("second lock must fail");
        assert!(
            err.to_string().contains("operation_in_progress"),
            "unexpected lock error: {err}"
        );
        drop(lock1);
        let lock2 = store.lock().expect("lock re-acquirable after drop");
        drop(lock2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn baselines_append_and_resolve_latest_or_by_id() {
        let root = temp_root("baselines");
        let store = SkillStore::init(&root, "demo").expect("init");
        assert!(store.latest_baseline().expect("none yet").is_none());

        let first = Baseline {
            baseline_id: "bl_one".to_string(),
            skill_name: "demo".to_string(),
            saved_at: now_rfc3339(),
            metrics: Default::default(),
        };
        let second = Baseline {
            baseline_id: "bl_two".to_string(),
            ..first.clone()
        };
        store.append_baseline(&first).expect("first");
        store.append_baseline(&second).expect("second");

        assert_eq!(
            store
                .latest_baseline()
                .expect("latest")
                .expect("some")
                .baseline_id,
            "bl_two"
        );
        assert_eq!(
            store
                .find_baseline("bl_one")
                .expect("find")
                .expect("some")
                .baseline_id,
            "bl_one"
        );
        assert_eq!(store.load_baselines().expect("all").len(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn list_skills_reports_initialized_directories_only() {
        let root = temp_root("list");
        SkillStore::init(&root, "alpha").expect("alpha");
        SkillStore::init(&root, "beta").expect("beta");
        ensure_dir(&root.join("not-a-skill")).expect("stray dir");

        assert_eq!(list_skills(&root), ["alpha", "beta"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn candidates_document_matches_published_shape() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["candidates"],
            "properties": {
                "candidates": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": [
                            "id", "skill_name", "status", "prompt", "response",
                            "execution_success", "execution_details", "created_at"
                        ],
                        "properties": {
                            "status": {
                                "enum": ["pending", "approved", "rejected", "promoted"]
                            },
                            "execution_details": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["language", "line", "outcome"]
                                }
                            }
                        }
                    }
                }
            }
        });
        let compiled = jsonschema::JSONSchema::compile(&schema).expect("schema");

        let mut case = pending_case("tc_shape", true);
        case.execution_details.push(skilltest_core::FragmentResult {
            language: skilltest_core::Language::Sql,
            line: 1,
            outcome: skilltest_core::FragmentOutcome::Passed,
            output: Some("[{\"1\": 1}]".to_string()),
            error: None,
            detail: None,
        });
        let document = serde_json::to_value(CandidatesFile {
            candidates: vec![case],
        })
        .expect("to value");
        assert!(compiled.is_valid(&document));
    }
}
