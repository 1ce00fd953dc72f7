//! Fleet lifecycle: create agents, attach them to the dispatcher,
//! restart agents that terminate, and resume interrupted sessions.
//!
//! The supervisor is a consumer of the substrate: it owns no routing or
//! transition logic. Restart policy lives here, outside the driver, as an
//! observer of the shared state-change stream; resume behavior follows
//! each role's declared [`ResumePolicy`], never inference from
//! restart-site code.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dispatch::event_log::EventLog;
use crate::dispatch::{Dispatcher, StateChange};
use crate::limiter::RateLimiter;
use crate::machine::{
    Driver, DriverHarness, MachineError, ResumePolicy, RoleBehavior, RoleSpec, DONE, ERROR,
};
use crate::persistence::{
    CheckpointWriter, PersistenceError, SessionStatus, SqliteStateStore, StateStore,
};

/// Errors surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Machine(#[from] MachineError),

    #[error("no resumable session found")]
    NoResumableSession,

    #[error("role '{role}' is not registered")]
    UnknownRole { role: String },

    #[error("no session started; call start() or resume_latest() first")]
    NoSession,

    #[error("state-change stream already taken")]
    StreamTaken,

    /// A checkpoint write failed. Durability is gone; the process must
    /// halt rather than continue with unsound crash recovery.
    #[error("durability lost: a checkpoint write failed")]
    DurabilityLost,
}

struct RoleRegistration {
    spec: RoleSpec,
    behavior: Arc<dyn RoleBehavior>,
    instances: Vec<String>,
}

struct AgentHandle {
    role: String,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchMode {
    /// First launch in a brand-new session.
    Fresh,
    /// Launch inside a resumed session; per-role resume policy applies.
    Resume,
    /// In-session restart after DONE/ERROR; always a fresh machine.
    Restart,
}

/// Creates agents, attaches them to the dispatcher, watches the shared
/// state-change stream, and drains persistence on shutdown.
pub struct Supervisor {
    config: OrchestratorConfig,
    dispatcher: Dispatcher,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn StateStore>,
    checkpoints: Arc<CheckpointWriter>,
    fatal: CancellationToken,
    cancel: CancellationToken,
    state_changes: Option<mpsc::Receiver<StateChange>>,
    roles: HashMap<String, RoleRegistration>,
    agents: HashMap<String, AgentHandle>,
    restart_counts: HashMap<String, u32>,
    session_id: Option<String>,
}

impl Supervisor {
    /// Build a supervisor over the configured SQLite store.
    pub fn new(config: OrchestratorConfig) -> Result<Self, SupervisorError> {
        let store = Arc::new(SqliteStateStore::open(config.db_path.clone())?);
        Ok(Self::with_store(config, store))
    }

    /// Build a supervisor over an injected store (tests, in-memory runs).
    pub fn with_store(config: OrchestratorConfig, store: Arc<dyn StateStore>) -> Self {
        let event_log = config
            .event_log_dir
            .as_ref()
            .map(|dir| EventLog::new(dir.as_str()));
        let dispatcher = Dispatcher::new(
            config.queue_capacity,
            config.state_change_capacity,
            event_log,
        );
        let state_changes = dispatcher.take_state_changes();
        let limiter = Arc::new(RateLimiter::new(config.models.clone()));
        let fatal = CancellationToken::new();
        let checkpoints = Arc::new(CheckpointWriter::spawn(
            Arc::clone(&store),
            config.checkpoint_queue_capacity,
            fatal.clone(),
        ));

        Self {
            config,
            dispatcher,
            limiter,
            store,
            checkpoints,
            fatal,
            cancel: CancellationToken::new(),
            state_changes,
            roles: HashMap::new(),
            agents: HashMap::new(),
            restart_counts: HashMap::new(),
            session_id: None,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Token cancelled when the run should wind down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token cancelled when durability is lost; the process must exit.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Register a role: its state table, its behavior, and the agent ids
    /// to run (e.g. `["coder-001", "coder-002"]`).
    pub fn register_role(
        &mut self,
        spec: RoleSpec,
        behavior: Arc<dyn RoleBehavior>,
        instances: Vec<String>,
    ) {
        self.roles.insert(
            spec.role.clone(),
            RoleRegistration {
                spec,
                behavior,
                instances,
            },
        );
    }

    /// Begin a brand-new session and launch every registered agent.
    pub async fn start(&mut self) -> Result<String, SupervisorError> {
        let session_id = format!("session-{}", Uuid::new_v4());
        self.store.begin_session(&session_id)?;
        self.session_id = Some(session_id.clone());
        log::info!("session '{}' started", session_id);
        self.launch_all(&session_id, LaunchMode::Fresh)?;
        Ok(session_id)
    }

    /// Resume the most recent resumable session.
    ///
    /// A session left active by an unclean exit is found as crashed; its
    /// in-flight work items are reset to pending before agents launch.
    /// Each role then follows its declared resume policy: FullRestore
    /// roles reload their checkpoint, FreshStart roles begin at their
    /// initial state.
    pub async fn resume_latest(&mut self) -> Result<String, SupervisorError> {
        self.store.mark_active_crashed()?;
        let session = self
            .store
            .most_recent_resumable()?
            .ok_or(SupervisorError::NoResumableSession)?;

        if session.status == SessionStatus::Crashed {
            let reset = self.store.reset_in_flight(&session.session_id)?;
            log::info!(
                "resuming crashed session '{}': {} in-flight work item(s) reset",
                session.session_id,
                reset
            );
        } else {
            log::info!("resuming session '{}'", session.session_id);
        }

        self.store
            .update_session_status(&session.session_id, SessionStatus::Active)?;
        self.session_id = Some(session.session_id.clone());
        self.launch_all(&session.session_id, LaunchMode::Resume)?;
        Ok(session.session_id)
    }

    fn launch_all(&mut self, session_id: &str, mode: LaunchMode) -> Result<(), SupervisorError> {
        let plan: Vec<(String, String)> = self
            .roles
            .values()
            .flat_map(|reg| {
                reg.instances
                    .iter()
                    .map(|agent_id| (reg.spec.role.clone(), agent_id.clone()))
            })
            .collect();

        for (role, agent_id) in plan {
            self.spawn_agent(&role, &agent_id, session_id, mode)?;
        }
        Ok(())
    }

    fn spawn_agent(
        &mut self,
        role: &str,
        agent_id: &str,
        session_id: &str,
        mode: LaunchMode,
    ) -> Result<(), SupervisorError> {
        let registration = self
            .roles
            .get(role)
            .ok_or_else(|| SupervisorError::UnknownRole {
                role: role.to_string(),
            })?;
        let spec = registration.spec.clone();
        let behavior = Arc::clone(&registration.behavior);

        let inbox = self.dispatcher.attach(agent_id);
        let harness = DriverHarness {
            session_id: session_id.to_string(),
            inbox,
            checkpoints: Arc::clone(&self.checkpoints),
            state_changes: self.dispatcher.state_change_sender(),
            step_timeout: self.config.step_timeout(),
            retry_backoff: self.config.retry_backoff(),
        };
        let mut driver = Driver::new(agent_id, spec.clone(), behavior, harness);

        match (mode, spec.resume_policy) {
            (LaunchMode::Resume, ResumePolicy::FullRestore) => {
                match driver.restore_state(self.store.as_ref(), session_id) {
                    Ok(()) => {}
                    Err(MachineError::CheckpointNotFound { .. }) => {
                        log::warn!(
                            "agent '{}' has no checkpoint in session '{}'; starting fresh",
                            agent_id,
                            session_id
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            (LaunchMode::Resume, ResumePolicy::FreshStart) => {
                log::info!(
                    "agent '{}' starts fresh on resume per role policy",
                    agent_id
                );
            }
            (LaunchMode::Fresh, _) => driver.initialize(self.store.as_ref())?,
            (LaunchMode::Restart, _) => {}
        }

        let cancel = self.cancel.child_token();
        let grace = self.config.shutdown_grace();
        let handle = tokio::spawn(async move {
            match driver.run(&cancel).await {
                Ok(terminal) => {
                    log::info!("agent '{}' reached {}", driver.agent_id(), terminal)
                }
                Err(e) => log::warn!("agent '{}' stopped: {}", driver.agent_id(), e),
            }
            if let Err(e) = driver.shutdown(grace).await {
                log::error!(
                    "final checkpoint for agent '{}' failed: {}",
                    driver.agent_id(),
                    e
                );
            }
        });

        self.agents.insert(
            agent_id.to_string(),
            AgentHandle {
                role: role.to_string(),
                handle,
            },
        );
        Ok(())
    }

    /// Watch the shared state-change stream and restart agents that reach
    /// DONE/ERROR, up to the configured restart limit. Returns when the
    /// run is cancelled; returns [`SupervisorError::DurabilityLost`] if a
    /// checkpoint write fails anywhere in the fleet.
    pub async fn supervise(&mut self) -> Result<(), SupervisorError> {
        let mut changes = self
            .state_changes
            .take()
            .ok_or(SupervisorError::StreamTaken)?;
        let fatal = self.fatal.clone();
        let cancel = self.cancel.clone();

        let result = loop {
            tokio::select! {
                _ = fatal.cancelled() => break Err(SupervisorError::DurabilityLost),
                _ = cancel.cancelled() => break Ok(()),
                change = changes.recv() => match change {
                    None => break Ok(()),
                    Some(change) => {
                        log::debug!(
                            "state change: {} {} -> {}",
                            change.agent_id,
                            change.from_state,
                            change.to_state
                        );
                        if change.to_state == DONE || change.to_state == ERROR {
                            if let Err(e) = self.handle_terminal(&change) {
                                break Err(e);
                            }
                        }
                    }
                }
            }
        };

        self.state_changes = Some(changes);
        result
    }

    fn handle_terminal(&mut self, change: &StateChange) -> Result<(), SupervisorError> {
        if change.to_state == ERROR {
            let _ = self
                .dispatcher
                .send_requeue(&change.agent_id, "agent reached ERROR");
        } else if let Some(lease) = self.dispatcher.clear_lease(&change.agent_id) {
            log::info!(
                "lease '{}' cleared: agent '{}' is DONE",
                lease.work_id,
                change.agent_id
            );
        }

        let restarts = *self.restart_counts.get(&change.agent_id).unwrap_or(&0);
        if restarts >= self.config.restart_limit {
            log::error!(
                "agent '{}' exceeded restart limit {}; detaching",
                change.agent_id,
                self.config.restart_limit
            );
            self.dispatcher.detach(&change.agent_id);
            return Ok(());
        }

        let role = match self.agents.get(&change.agent_id) {
            Some(agent) => agent.role.clone(),
            None => {
                log::warn!("terminal notification for unknown agent '{}'", change.agent_id);
                return Ok(());
            }
        };
        let session_id = self.session_id.clone().ok_or(SupervisorError::NoSession)?;

        self.restart_counts
            .insert(change.agent_id.clone(), restarts + 1);
        log::info!(
            "restarting agent '{}' ({}/{})",
            change.agent_id,
            restarts + 1,
            self.config.restart_limit
        );
        self.spawn_agent(&role, &change.agent_id, &session_id, LaunchMode::Restart)
    }

    /// Stop the dispatcher (SHUTDOWN broadcast + drain), join agent
    /// tasks, flush the checkpoint writer, and mark the session
    /// resumable.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        log::info!("supervisor shutting down");
        self.cancel.cancel();
        self.dispatcher.stop(self.config.shutdown_grace()).await;

        for (agent_id, agent) in self.agents.drain() {
            if let Err(e) = agent.handle.await {
                log::warn!("agent task '{}' did not join cleanly: {}", agent_id, e);
            }
        }

        self.checkpoints.flush().await?;
        if let Some(session_id) = self.session_id.clone() {
            self.store
                .update_session_status(&session_id, SessionStatus::Shutdown)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("session_id", &self.session_id)
            .field("roles", &self.roles.len())
            .field("agents", &self.agents.len())
            .finish()
    }
}
