//! Durable run state.
//!
//! One JSON snapshot per run under `runs/`, plus an idempotency pointer file
//! per `(spec, key)` under `idem/`. Both are written atomically.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use famos_types::{Envelope, EventType};

use crate::WorkflowError;

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    /// Created, no step executed yet.
    Pending,
    /// Currently executing a step.
    Running,
    /// Suspended on a `wait_event` step.
    Waiting,
    /// All steps finished.
    Completed,
    /// A step failed terminally.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl RunState {
    /// Whether the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed | RunState::Cancelled)
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step id from the spec.
    pub step_id: String,
    /// What happened.
    pub status: StepStatus,
    /// When the step finished.
    pub finished_at: DateTime<Utc>,
}

/// Terminal status of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepStatus {
    /// Step completed.
    Ok,
    /// Step failed after exhausting retries.
    Failed {
        /// Error class.
        error_kind: String,
        /// Human-readable reason.
        reason: String,
    },
    /// `wait_event` deadline expired.
    TimedOut,
}

/// Persisted wait filter for a suspended run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    /// Topic being watched.
    pub topic: String,
    /// Required envelope type.
    pub event_type: EventType,
    /// Resolved correlation id the envelope must carry, if any.
    pub correlation_id: Option<String>,
    /// Absolute deadline.
    pub deadline: DateTime<Utc>,
    /// Variable the payload lands in.
    pub output_var: String,
}

/// Full snapshot of one run, persisted on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run id.
    pub run_id: Uuid,
    /// Spec this run executes.
    pub spec_id: String,
    /// Trigger idempotency key the run is deduped by.
    pub idempotency_key: String,
    /// Index of the next step to execute.
    pub current_step: usize,
    /// Lifecycle state.
    pub state: RunState,
    /// Active wait filter when `state == Waiting`.
    pub waits: Option<WaitState>,
    /// Run variables, readable and writable by steps.
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Ordered step results.
    pub history: Vec<StepResult>,
    /// The trigger envelope that started the run.
    pub trigger: Envelope,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Fresh run for a trigger.
    pub fn new(spec_id: &str, trigger: Envelope) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            spec_id: spec_id.to_string(),
            idempotency_key: trigger.idempotency_key.clone(),
            current_step: 0,
            state: RunState::Pending,
            waits: None,
            variables: serde_json::Map::new(),
            history: Vec::new(),
            trigger,
            created_at: Utc::now(),
        }
    }
}

//─────────────────────────────
//  Store
//─────────────────────────────

/// Filesystem store for runs and idempotency pointers.
#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
    idem_dir: PathBuf,
}

impl RunStore {
    /// Open (creating directories) under `root` (usually
    /// `workspace/workflows/`).
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let root = root.into();
        let runs_dir = root.join("runs");
        let idem_dir = root.join("idem");
        std::fs::create_dir_all(&runs_dir)?;
        std::fs::create_dir_all(&idem_dir)?;
        Ok(Self { runs_dir, idem_dir })
    }

    fn run_path(&self, run_id: &Uuid) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id.simple()))
    }

    fn idem_path(&self, spec_id: &str, key: &str) -> PathBuf {
        // Keys are caller-chosen; hash anything path-hostile.
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.idem_dir.join(format!("{spec_id}__{safe}"))
    }

    /// Persist a run snapshot atomically.
    pub fn save(&self, run: &WorkflowRun) -> Result<(), WorkflowError> {
        let bytes = serde_json::to_vec_pretty(run).map_err(|e| WorkflowError::Codec(e.to_string()))?;
        atomic_write(&self.run_path(&run.run_id), &bytes)?;
        Ok(())
    }

    /// Load a run snapshot.
    pub fn load(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, WorkflowError> {
        read_json(&self.run_path(run_id))
    }

    /// Record the `(spec, key) → run` pointer; first writer wins.
    pub fn claim_idempotency(
        &self,
        spec_id: &str,
        key: &str,
        run_id: &Uuid,
    ) -> Result<Option<Uuid>, WorkflowError> {
        let path = self.idem_path(spec_id, key);
        if let Some(existing) = read_json::<Uuid>(&path)? {
            return Ok(Some(existing));
        }
        let bytes =
            serde_json::to_vec(run_id).map_err(|e| WorkflowError::Codec(e.to_string()))?;
        atomic_write(&path, &bytes)?;
        Ok(None)
    }

    /// Resolve an idempotency pointer.
    pub fn lookup_idempotency(
        &self,
        spec_id: &str,
        key: &str,
    ) -> Result<Option<Uuid>, WorkflowError> {
        read_json(&self.idem_path(spec_id, key))
    }

    /// All persisted runs that have not reached a terminal state.
    pub fn open_runs(&self) -> Result<Vec<WorkflowRun>, WorkflowError> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(run) = read_json::<WorkflowRun>(&path)? {
                    if !run.state.is_terminal() {
                        out.push(run);
                    }
                }
            }
        }
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    /// Delete a terminal run after its retention window.
    pub fn remove(&self, run_id: &Uuid) -> Result<(), WorkflowError> {
        match std::fs::remove_file(self.run_path(run_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), WorkflowError> {
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_data()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, WorkflowError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| WorkflowError::Codec(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use famos_types::{EventType, SpaceId, SpaceKind};

    fn trigger() -> Envelope {
        Envelope::builder(
            "workflow.trigger",
            EventType::RecallQuery,
            SpaceId::new(SpaceKind::Shared, "household").unwrap(),
            "alice",
            "alice-phone",
        )
        .idempotency_key("t-1")
        .seal(Utc::now())
        .unwrap()
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let run = WorkflowRun::new("recall", trigger());
        store.save(&run).unwrap();
        let loaded = store.load(&run.run_id).unwrap().unwrap();
        assert_eq!(loaded, run);
    }

    #[test]
    fn idempotency_pointer_first_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(store.claim_idempotency("recall", "t-1", &a).unwrap(), None);
        assert_eq!(
            store.claim_idempotency("recall", "t-1", &b).unwrap(),
            Some(a)
        );
        assert_eq!(store.lookup_idempotency("recall", "t-1").unwrap(), Some(a));
    }

    #[test]
    fn open_runs_excludes_terminal_states() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path()).unwrap();
        let mut active = WorkflowRun::new("recall", trigger());
        active.state = RunState::Waiting;
        let mut done = WorkflowRun::new("recall", trigger());
        done.state = RunState::Completed;
        store.save(&active).unwrap();
        store.save(&done).unwrap();

        let open = store.open_runs().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].run_id, active.run_id);
    }
}
