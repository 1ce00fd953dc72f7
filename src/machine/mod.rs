//! Generic resumable state-machine framework.
//!
//! Every agent role (architect, coder, project manager) is an instance of
//! this framework: a named set of states with a role-supplied transition
//! table, two universal terminals (DONE, ERROR), an open working-memory
//! map, a bounded transition history, and a retry ceiling enforced in one
//! place. The [`driver`] module runs the loop and persists a checkpoint
//! after every committed transition.

pub mod driver;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::persistence::{CheckpointRecord, PersistenceError};

pub use driver::{Driver, DriverHarness, Inbox, RoleBehavior, StepContext};

/// Universal terminal state: work finished.
pub const DONE: &str = "DONE";
/// Universal terminal state: work failed.
pub const ERROR: &str = "ERROR";

/// Default bound on the diagnostic transition history.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Name of one state in a role's closed state set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateName(pub String);

impl StateName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn done() -> Self {
        Self(DONE.to_string())
    }

    pub fn error() -> Self {
        Self(ERROR.to_string())
    }

    /// Terminal states accept no outgoing transitions, ever.
    pub fn is_terminal(&self) -> bool {
        self.0 == DONE || self.0 == ERROR
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StateName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Role-specific working memory: an open, serializable key/value map.
/// Roles declare the keys they rely on via [`RoleSpec::require_key`];
/// shape is validated when a checkpoint is loaded, never trusted silently.
pub type StateData = BTreeMap<String, Value>;

/// One committed transition, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: StateName,
    pub to: StateName,
    pub at: DateTime<Utc>,
    /// Retry count at the moment the transition committed.
    pub retry_count: u32,
}

/// Bounded ring buffer of [`TransitionRecord`]s.
///
/// Once the cap is exceeded the oldest entries are dropped. Compaction
/// only ever touches this diagnostic history, never the authoritative
/// `current_state`/`data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionHistory {
    cap: usize,
    records: VecDeque<TransitionRecord>,
}

impl TransitionHistory {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: VecDeque::new(),
        }
    }

    /// Append a record, trimming to the retention cap.
    pub fn push(&mut self, record: TransitionRecord) {
        self.records.push_back(record);
        while self.records.len() > self.cap {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn records(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.records.iter()
    }

    pub fn latest(&self) -> Option<&TransitionRecord> {
        self.records.back()
    }

    pub fn oldest(&self) -> Option<&TransitionRecord> {
        self.records.front()
    }
}

/// Declared per-role resume behavior after a process restart.
///
/// The divergence between "restore everything" and "coordinator restored,
/// workers fresh" is an explicit declaration here, never inferred from
/// restart-site code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Reload the full durable checkpoint on resume.
    FullRestore,
    /// Restart from the initial state; only the owning coordinator's
    /// checkpoint carries durable context.
    FreshStart,
}

/// A role's closed state set: initial state, transition table, declared
/// working-memory keys, retry ceiling, and resume policy.
#[derive(Debug, Clone)]
pub struct RoleSpec {
    pub role: String,
    pub initial_state: StateName,
    transitions: HashMap<StateName, HashSet<StateName>>,
    pub required_keys: Vec<String>,
    pub max_retries: u32,
    pub resume_policy: ResumePolicy,
    pub history_cap: usize,
}

impl RoleSpec {
    pub fn new(role: impl Into<String>, initial_state: impl Into<StateName>) -> Self {
        Self {
            role: role.into(),
            initial_state: initial_state.into(),
            transitions: HashMap::new(),
            required_keys: Vec::new(),
            max_retries: 3,
            resume_policy: ResumePolicy::FullRestore,
            history_cap: DEFAULT_HISTORY_CAP,
        }
    }

    /// Builder: declare the legal targets of `from`. Terminal states are
    /// never legal sources; declaring one is ignored (fails closed at
    /// [`RoleSpec::allows`]).
    pub fn transition<S: Into<StateName>>(
        mut self,
        from: impl Into<StateName>,
        targets: impl IntoIterator<Item = S>,
    ) -> Self {
        let from = from.into();
        if from.is_terminal() {
            log::warn!(
                "role '{}': ignoring transition table entry out of terminal state {}",
                self.role,
                from
            );
            return self;
        }
        self.transitions
            .entry(from)
            .or_default()
            .extend(targets.into_iter().map(Into::into));
        self
    }

    /// Builder: declare a working-memory key the role reads or writes.
    pub fn require_key(mut self, key: impl Into<String>) -> Self {
        self.required_keys.push(key.into());
        self
    }

    /// Builder: retry ceiling for transient failures in one state.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder: resume policy after process restart.
    pub fn resume_policy(mut self, policy: ResumePolicy) -> Self {
        self.resume_policy = policy;
        self
    }

    /// Builder: transition-history retention cap.
    pub fn history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    /// Whether `(from -> to)` appears in the transition table. Terminal
    /// sources always fail closed.
    pub fn allows(&self, from: &StateName, to: &StateName) -> bool {
        if from.is_terminal() {
            return false;
        }
        self.transitions
            .get(from)
            .map_or(false, |targets| targets.contains(to))
    }

    /// Validate working-memory shape against the declared keys. Called
    /// whenever a checkpoint is loaded; a missing declared key fails
    /// loudly instead of resuming on silently bad data.
    pub fn validate_data(&self, data: &StateData) -> Result<(), MachineError> {
        for key in &self.required_keys {
            if !data.contains_key(key) {
                return Err(MachineError::MissingStateKey {
                    role: self.role.clone(),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Classification a state handler gives its failures; the single boundary
/// where retryable and fatal external-collaborator errors diverge.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Recoverable; the framework re-enters the same state on the next
    /// step, up to the retry ceiling.
    #[error("transient handler failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// Unrecoverable; the framework forces ERROR immediately.
    #[error("fatal handler failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(err.into())
    }
}

/// Errors surfaced by the state-machine framework.
#[derive(Debug, Error)]
pub enum MachineError {
    /// Requested transition is not in the role's table. The instance
    /// stays in its current state.
    #[error("illegal transition {from} -> {to} for role '{role}'")]
    IllegalTransition {
        role: String,
        from: StateName,
        to: StateName,
    },

    /// No further steps are accepted from a terminal state.
    #[error("agent '{agent_id}' is in terminal state {state}")]
    Terminal { agent_id: String, state: StateName },

    /// Handler failed; the state is unchanged and will be retried.
    #[error("handler failed in state {state} (attempt {attempt}): {source}")]
    HandlerFailed {
        state: StateName,
        attempt: u32,
        #[source]
        source: anyhow::Error,
    },

    /// A resumed checkpoint is missing a declared working-memory key.
    #[error("checkpoint for role '{role}' is missing required key '{key}'")]
    MissingStateKey { role: String, key: String },

    /// No durable record to restore from.
    #[error("no checkpoint found for agent '{agent_id}' in session '{session_id}'")]
    CheckpointNotFound {
        agent_id: String,
        session_id: String,
    },

    /// The step was cancelled before completing.
    #[error("step cancelled for agent '{agent_id}'")]
    Cancelled { agent_id: String },

    /// Durability failure; fatal for the process.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One agent's in-memory state-machine instance.
///
/// Mutated only by the driver's own transition function; the durable
/// checkpoint survives independently in the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub agent_id: String,
    pub agent_type: String,
    pub current_state: StateName,
    pub data: StateData,
    pub history: TransitionHistory,
    pub retry_count: u32,
}

impl MachineState {
    /// Fresh instance in the role's initial state.
    pub fn initial(agent_id: impl Into<String>, spec: &RoleSpec) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: spec.role.clone(),
            current_state: spec.initial_state.clone(),
            data: StateData::new(),
            history: TransitionHistory::new(spec.history_cap),
            retry_count: 0,
        }
    }

    /// Snapshot for the durable store: `{current_state, data,
    /// retry_count}`. History is diagnostic only and stays in memory.
    pub fn to_checkpoint(&self, session_id: &str) -> CheckpointRecord {
        CheckpointRecord {
            agent_id: self.agent_id.clone(),
            session_id: session_id.to_string(),
            current_state: self.current_state.as_str().to_string(),
            state_data: serde_json::to_value(&self.data).unwrap_or(Value::Null),
            retry_count: self.retry_count,
            updated_at: Utc::now(),
        }
    }

    /// Rebuild an instance from a durable record, validating the
    /// working-memory shape against the role's declared keys.
    pub fn from_checkpoint(
        spec: &RoleSpec,
        record: &CheckpointRecord,
    ) -> Result<Self, MachineError> {
        let data: StateData = serde_json::from_value(record.state_data.clone())
            .map_err(PersistenceError::from)?;
        spec.validate_data(&data)?;
        Ok(Self {
            agent_id: record.agent_id.clone(),
            agent_type: spec.role.clone(),
            current_state: StateName::new(record.current_state.clone()),
            data,
            history: TransitionHistory::new(spec.history_cap),
            retry_count: record.retry_count,
        })
    }
}
