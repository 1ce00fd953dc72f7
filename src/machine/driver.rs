//! The state-machine driver loop.
//!
//! A [`Driver`] owns one agent's [`MachineState`] and advances it one
//! handler execution at a time: validate the requested transition,
//! enforce the retry ceiling, persist a checkpoint after every committed
//! transition, and emit state-change notifications for the supervisor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dispatch::StateChange;
use crate::persistence::{CheckpointWriter, StateStore};
use crate::protocol::AgentMsg;

use super::{HandlerError, MachineError, MachineState, RoleSpec, StateName, TransitionRecord};

/// Inbound-channel handle exposed to a state handler. At most one
/// message may be consumed per step; further takes return `None` without
/// touching the channel.
pub struct Inbox<'a> {
    rx: &'a mut mpsc::Receiver<AgentMsg>,
    consumed: bool,
    cancel: CancellationToken,
}

impl<'a> Inbox<'a> {
    fn new(rx: &'a mut mpsc::Receiver<AgentMsg>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            consumed: false,
            cancel,
        }
    }

    /// Wait for one message, bounded by the step's cancellation token.
    /// Returns `None` once this step's allowance is used, on
    /// cancellation, or when the channel has closed.
    pub async fn take_one(&mut self) -> Option<AgentMsg> {
        if self.consumed {
            return None;
        }
        self.consumed = true;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    /// Non-blocking variant: consume a message only if one is already
    /// queued. Does not use up the step's allowance when empty.
    pub fn try_take_one(&mut self) -> Option<AgentMsg> {
        if self.consumed {
            return None;
        }
        match self.rx.try_recv() {
            Ok(msg) => {
                self.consumed = true;
                Some(msg)
            }
            Err(_) => None,
        }
    }
}

/// Everything a state handler may touch during one step: the role's
/// working memory, the inbound channel (one message max), and the step's
/// cancellation token to thread into external-collaborator calls.
pub struct StepContext<'a> {
    pub data: &'a mut super::StateData,
    pub inbox: Inbox<'a>,
    pub cancel: CancellationToken,
}

/// A role's state handlers. The framework calls [`RoleBehavior::handle`]
/// with the current state; the implementation dispatches internally and
/// returns the state to transition to (returning the current state is a
/// legal "stay put"). External-collaborator failures are classified as
/// [`HandlerError::Transient`] or [`HandlerError::Fatal`]; the framework
/// owns all retry accounting.
#[async_trait]
pub trait RoleBehavior: Send + Sync {
    async fn handle(
        &self,
        state: &StateName,
        ctx: &mut StepContext<'_>,
    ) -> Result<StateName, HandlerError>;
}

/// Wiring handed to a driver by the supervisor.
pub struct DriverHarness {
    pub session_id: String,
    pub inbox: mpsc::Receiver<AgentMsg>,
    pub checkpoints: Arc<CheckpointWriter>,
    pub state_changes: mpsc::Sender<StateChange>,
    /// Per-state step timeout; an overrunning handler counts as a
    /// transient failure.
    pub step_timeout: Duration,
    /// Base delay between retries of a failed state; doubled per attempt.
    pub retry_backoff: Duration,
}

/// The resumable state-machine driver for one agent.
pub struct Driver {
    spec: RoleSpec,
    behavior: Arc<dyn RoleBehavior>,
    state: MachineState,
    session_id: String,
    inbox: mpsc::Receiver<AgentMsg>,
    checkpoints: Arc<CheckpointWriter>,
    state_changes: mpsc::Sender<StateChange>,
    step_timeout: Duration,
    retry_backoff: Duration,
}

impl Driver {
    pub fn new(
        agent_id: impl Into<String>,
        spec: RoleSpec,
        behavior: Arc<dyn RoleBehavior>,
        harness: DriverHarness,
    ) -> Self {
        let state = MachineState::initial(agent_id, &spec);
        Self {
            spec,
            behavior,
            state,
            session_id: harness.session_id,
            inbox: harness.inbox,
            checkpoints: harness.checkpoints,
            state_changes: harness.state_changes,
            step_timeout: harness.step_timeout,
            retry_backoff: harness.retry_backoff,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.state.agent_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn current_state(&self) -> &StateName {
        &self.state.current_state
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    /// Load this agent's checkpoint for the session if one exists,
    /// otherwise start in the role's initial state.
    pub fn initialize(&mut self, store: &dyn StateStore) -> Result<(), MachineError> {
        match store.load_checkpoint(&self.state.agent_id, &self.session_id)? {
            Some(record) => {
                self.state = MachineState::from_checkpoint(&self.spec, &record)?;
                log::info!(
                    "agent '{}' initialized from checkpoint in state {}",
                    self.state.agent_id,
                    self.state.current_state
                );
            }
            None => {
                log::info!(
                    "agent '{}' initialized fresh in state {}",
                    self.state.agent_id,
                    self.spec.initial_state
                );
            }
        }
        Ok(())
    }

    /// Resume-only: overwrite in-memory state from the durable record of
    /// `session_id`, before `run` is first called. Fails if no record
    /// exists.
    pub fn restore_state(
        &mut self,
        store: &dyn StateStore,
        session_id: &str,
    ) -> Result<(), MachineError> {
        let record = store
            .load_checkpoint(&self.state.agent_id, session_id)?
            .ok_or_else(|| MachineError::CheckpointNotFound {
                agent_id: self.state.agent_id.clone(),
                session_id: session_id.to_string(),
            })?;
        self.state = MachineState::from_checkpoint(&self.spec, &record)?;
        self.session_id = session_id.to_string();
        log::info!(
            "agent '{}' restored from session '{}' in state {}",
            self.state.agent_id,
            session_id,
            self.state.current_state
        );
        Ok(())
    }

    /// Execute exactly one state's handler and commit the outcome.
    ///
    /// Terminal states accept no steps. If the retry ceiling is already
    /// exceeded, ERROR is forced without running the handler, regardless
    /// of what it would have requested; this is the single place retries
    /// are enforced. An illegal transition request leaves the state
    /// unchanged, counts one attempt, and surfaces the validation error.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<StateName, MachineError> {
        let current = self.state.current_state.clone();
        if current.is_terminal() {
            return Err(MachineError::Terminal {
                agent_id: self.state.agent_id.clone(),
                state: current,
            });
        }

        if self.state.retry_count > self.spec.max_retries {
            log::error!(
                "agent '{}': retry ceiling {} exceeded in state {}; forcing ERROR",
                self.state.agent_id,
                self.spec.max_retries,
                current
            );
            self.commit(StateName::error()).await?;
            return Ok(StateName::error());
        }

        let agent_id = self.state.agent_id.clone();
        let behavior = Arc::clone(&self.behavior);
        let step_timeout = self.step_timeout;
        let step_cancel = cancel.child_token();
        let outcome = {
            let mut ctx = StepContext {
                data: &mut self.state.data,
                inbox: Inbox::new(&mut self.inbox, step_cancel.clone()),
                cancel: step_cancel.clone(),
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MachineError::Cancelled { agent_id });
                }
                res = tokio::time::timeout(step_timeout, behavior.handle(&current, &mut ctx)) => res,
            }
        };

        match outcome {
            Err(_elapsed) => {
                self.state.retry_count += 1;
                Err(MachineError::HandlerFailed {
                    state: current,
                    attempt: self.state.retry_count,
                    source: anyhow::anyhow!("state handler exceeded {:?} timeout", self.step_timeout),
                })
            }
            Ok(Err(HandlerError::Transient(source))) => {
                self.state.retry_count += 1;
                Err(MachineError::HandlerFailed {
                    state: current,
                    attempt: self.state.retry_count,
                    source,
                })
            }
            Ok(Err(HandlerError::Fatal(source))) => {
                log::error!(
                    "agent '{}': fatal handler failure in state {}: {}; forcing ERROR",
                    self.state.agent_id,
                    current,
                    source
                );
                self.commit(StateName::error()).await?;
                Ok(StateName::error())
            }
            Ok(Ok(target)) => {
                if target == current {
                    // Stay put; nothing committed, nothing persisted.
                    return Ok(target);
                }
                if !self.spec.allows(&current, &target) {
                    self.state.retry_count += 1;
                    return Err(MachineError::IllegalTransition {
                        role: self.spec.role.clone(),
                        from: current,
                        to: target,
                    });
                }
                self.commit(target.clone()).await?;
                Ok(target)
            }
        }
    }

    /// Commit a transition: history, authoritative state, checkpoint,
    /// state-change notification. Forced ERROR goes through here too.
    async fn commit(&mut self, to: StateName) -> Result<(), MachineError> {
        let from = self.state.current_state.clone();
        self.state.history.push(TransitionRecord {
            from: from.clone(),
            to: to.clone(),
            at: Utc::now(),
            retry_count: self.state.retry_count,
        });
        self.state.current_state = to.clone();
        self.state.retry_count = 0;

        self.checkpoints
            .save(self.state.to_checkpoint(&self.session_id))
            .await?;

        log::debug!(
            "agent '{}': {} -> {}",
            self.state.agent_id,
            from,
            to
        );
        let notification = StateChange {
            agent_id: self.state.agent_id.clone(),
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
        };
        if self.state_changes.send(notification).await.is_err() {
            log::warn!(
                "state-change stream closed; notification from agent '{}' dropped",
                self.state.agent_id
            );
        }
        Ok(())
    }

    /// Loop [`Driver::step`] until a terminal state is reached or the
    /// token is cancelled. Transient failures back off in place; routing
    /// and validation errors are logged and the loop continues.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<StateName, MachineError> {
        loop {
            if self.state.current_state.is_terminal() {
                return Ok(self.state.current_state.clone());
            }
            if cancel.is_cancelled() {
                return Err(MachineError::Cancelled {
                    agent_id: self.state.agent_id.clone(),
                });
            }

            match self.step(cancel).await {
                Ok(_) => {}
                Err(MachineError::HandlerFailed {
                    state,
                    attempt,
                    source,
                }) => {
                    let backoff = self
                        .retry_backoff
                        .saturating_mul(1u32 << (attempt - 1).min(6));
                    log::warn!(
                        "agent '{}': attempt {} failed in state {}: {}; retrying in {:?}",
                        self.state.agent_id,
                        attempt,
                        state,
                        source,
                        backoff
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(MachineError::Cancelled {
                                agent_id: self.state.agent_id.clone(),
                            });
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(MachineError::IllegalTransition { role, from, to }) => {
                    log::error!(
                        "agent '{}': handler requested illegal transition {} -> {} (role '{}'); state unchanged",
                        self.state.agent_id,
                        from,
                        to,
                        role
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persist a final checkpoint regardless of which state the machine
    /// stopped in, bounded by `grace`. Call after `run` has returned or
    /// been cancelled.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<(), MachineError> {
        self.checkpoints
            .save(self.state.to_checkpoint(&self.session_id))
            .await?;
        match tokio::time::timeout(grace, self.checkpoints.flush()).await {
            Ok(result) => result.map_err(MachineError::from),
            Err(_) => {
                log::warn!(
                    "agent '{}': final checkpoint flush did not finish within {:?}",
                    self.state.agent_id,
                    grace
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("agent_id", &self.state.agent_id)
            .field("role", &self.spec.role)
            .field("current_state", &self.state.current_state)
            .field("retry_count", &self.state.retry_count)
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{StateData, DONE, ERROR};
    use crate::persistence::SqliteStateStore;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coder_spec() -> RoleSpec {
        RoleSpec::new("coder", "CODING")
            .transition("CODING", ["TESTING", ERROR])
            .transition("TESTING", ["CODING", DONE, ERROR])
            .max_retries(2)
    }

    struct ScriptedBehavior {
        script: Mutex<VecDeque<Result<StateName, HandlerError>>>,
        calls: AtomicU32,
    }

    impl ScriptedBehavior {
        fn new(script: impl IntoIterator<Item = Result<StateName, HandlerError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RoleBehavior for ScriptedBehavior {
        async fn handle(
            &self,
            state: &StateName,
            _ctx: &mut StepContext<'_>,
        ) -> Result<StateName, HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(state.clone()))
        }
    }

    struct TestRig {
        store: Arc<SqliteStateStore>,
        state_rx: mpsc::Receiver<StateChange>,
        inbox_tx: mpsc::Sender<AgentMsg>,
    }

    fn driver_with(behavior: Arc<dyn RoleBehavior>, spec: RoleSpec) -> (Driver, TestRig) {
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let writer = Arc::new(CheckpointWriter::spawn(
            Arc::clone(&store) as Arc<dyn StateStore>,
            32,
            CancellationToken::new(),
        ));
        let (inbox_tx, inbox_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = mpsc::channel(64);

        let driver = Driver::new(
            "coder-001",
            spec,
            behavior,
            DriverHarness {
                session_id: "sess-1".into(),
                inbox: inbox_rx,
                checkpoints: writer,
                state_changes: state_tx,
                step_timeout: Duration::from_secs(5),
                retry_backoff: Duration::from_millis(10),
            },
        );
        (
            driver,
            TestRig {
                store,
                state_rx,
                inbox_tx,
            },
        )
    }

    #[tokio::test]
    async fn test_illegal_transition_fails_closed() {
        let behavior = ScriptedBehavior::new([Ok(StateName::new("AWAIT_APPROVAL"))]);
        let (mut driver, _rig) = driver_with(behavior, coder_spec());
        let cancel = CancellationToken::new();

        let err = driver.step(&cancel).await.unwrap_err();
        assert!(matches!(err, MachineError::IllegalTransition { .. }));
        assert_eq!(driver.current_state().as_str(), "CODING");
    }

    #[tokio::test]
    async fn test_legal_transition_commits_and_checkpoints() {
        let behavior = ScriptedBehavior::new([Ok(StateName::new("TESTING"))]);
        let (mut driver, mut rig) = driver_with(behavior, coder_spec());
        let cancel = CancellationToken::new();

        let next = driver.step(&cancel).await.unwrap();
        assert_eq!(next.as_str(), "TESTING");
        assert_eq!(driver.state().history.len(), 1);

        let change = rig.state_rx.recv().await.unwrap();
        assert_eq!(change.from_state, "CODING");
        assert_eq!(change.to_state, "TESTING");

        driver.shutdown(Duration::from_secs(1)).await.unwrap();
        let record = rig.store.load_checkpoint("coder-001", "sess-1").unwrap().unwrap();
        assert_eq!(record.current_state, "TESTING");
    }

    #[tokio::test]
    async fn test_terminal_state_accepts_no_steps() {
        let behavior = ScriptedBehavior::new([
            Ok(StateName::new("TESTING")),
            Ok(StateName::done()),
        ]);
        let (mut driver, _rig) = driver_with(behavior, coder_spec());
        let cancel = CancellationToken::new();

        let terminal = driver.run(&cancel).await.unwrap();
        assert_eq!(terminal.as_str(), DONE);

        let err = driver.step(&cancel).await.unwrap_err();
        assert!(matches!(err, MachineError::Terminal { .. }));
        assert_eq!(driver.current_state().as_str(), DONE);
    }

    #[tokio::test]
    async fn test_retry_ceiling_forces_error() {
        // max_retries = 2: three consecutive transient failures, then the
        // next step forces ERROR without consulting the handler, even
        // though the script would return a legal target.
        let behavior = ScriptedBehavior::new([
            Err(HandlerError::transient(anyhow::anyhow!("flaky 1"))),
            Err(HandlerError::transient(anyhow::anyhow!("flaky 2"))),
            Err(HandlerError::transient(anyhow::anyhow!("flaky 3"))),
            Ok(StateName::new("TESTING")),
        ]);
        let (mut driver, _rig) = driver_with(Arc::clone(&behavior) as Arc<dyn RoleBehavior>, coder_spec());
        let cancel = CancellationToken::new();

        for attempt in 1..=3u32 {
            let err = driver.step(&cancel).await.unwrap_err();
            match err {
                MachineError::HandlerFailed { attempt: a, .. } => assert_eq!(a, attempt),
                other => panic!("expected HandlerFailed, got {:?}", other),
            }
            assert_eq!(driver.current_state().as_str(), "CODING");
        }

        let next = driver.step(&cancel).await.unwrap();
        assert_eq!(next.as_str(), ERROR);
        assert_eq!(behavior.calls(), 3);
    }

    #[tokio::test]
    async fn test_run_recovers_from_transient_failure() {
        let behavior = ScriptedBehavior::new([
            Err(HandlerError::transient(anyhow::anyhow!("blip"))),
            Ok(StateName::new("TESTING")),
            Ok(StateName::done()),
        ]);
        let (mut driver, _rig) = driver_with(behavior, coder_spec());
        let cancel = CancellationToken::new();

        let terminal = driver.run(&cancel).await.unwrap();
        assert_eq!(terminal.as_str(), DONE);
    }

    #[tokio::test]
    async fn test_fatal_handler_error_forces_error_immediately() {
        let behavior = ScriptedBehavior::new([Err(HandlerError::fatal(anyhow::anyhow!(
            "container image gone"
        )))]);
        let (mut driver, _rig) = driver_with(behavior, coder_spec());
        let cancel = CancellationToken::new();

        let next = driver.step(&cancel).await.unwrap();
        assert_eq!(next.as_str(), ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_counts_as_transient() {
        struct SlowBehavior;
        #[async_trait]
        impl RoleBehavior for SlowBehavior {
            async fn handle(
                &self,
                _state: &StateName,
                _ctx: &mut StepContext<'_>,
            ) -> Result<StateName, HandlerError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StateName::done())
            }
        }

        let (mut driver, _rig) = driver_with(Arc::new(SlowBehavior), coder_spec());
        let cancel = CancellationToken::new();

        let err = driver.step(&cancel).await.unwrap_err();
        assert!(matches!(err, MachineError::HandlerFailed { attempt: 1, .. }));
        assert_eq!(driver.current_state().as_str(), "CODING");
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_cancellation_returns_promptly() {
        struct SlowBehavior;
        #[async_trait]
        impl RoleBehavior for SlowBehavior {
            async fn handle(
                &self,
                _state: &StateName,
                _ctx: &mut StepContext<'_>,
            ) -> Result<StateName, HandlerError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(StateName::done())
            }
        }

        let (mut driver, _rig) = driver_with(Arc::new(SlowBehavior), coder_spec());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = driver.step(&cancel).await.unwrap_err();
        assert!(matches!(err, MachineError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_inbox_allows_one_message_per_step() {
        struct InboxProbe {
            seen: Mutex<Vec<Option<String>>>,
        }
        #[async_trait]
        impl RoleBehavior for InboxProbe {
            async fn handle(
                &self,
                state: &StateName,
                ctx: &mut StepContext<'_>,
            ) -> Result<StateName, HandlerError> {
                let first = ctx.inbox.take_one().await.map(|m| m.id);
                let second = ctx.inbox.take_one().await.map(|m| m.id);
                self.seen.lock().push(first);
                self.seen.lock().push(second);
                match state.as_str() {
                    "CODING" => Ok(StateName::new("TESTING")),
                    _ => Ok(StateName::done()),
                }
            }
        }

        let probe = Arc::new(InboxProbe {
            seen: Mutex::new(Vec::new()),
        });
        let (mut driver, rig) = driver_with(Arc::clone(&probe) as Arc<dyn RoleBehavior>, coder_spec());

        let first = AgentMsg::new(crate::protocol::MsgType::Task, "architect", "coder-001");
        let second = AgentMsg::new(crate::protocol::MsgType::Spec, "architect", "coder-001");
        rig.inbox_tx.send(first.clone()).await.unwrap();
        rig.inbox_tx.send(second.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        driver.step(&cancel).await.unwrap();
        driver.step(&cancel).await.unwrap();

        let seen = probe.seen.lock();
        // Step one: first message, then None (allowance used). Step two:
        // second message survives in the channel and is delivered next.
        assert_eq!(*seen, vec![Some(first.id), None, Some(second.id), None]);
    }

    #[tokio::test]
    async fn test_initialize_prefers_existing_checkpoint() {
        let behavior = ScriptedBehavior::new([]);
        let (mut driver, rig) = driver_with(behavior, coder_spec());

        let mut data = StateData::new();
        data.insert("story_id".into(), Value::from("story-7"));
        rig.store
            .save_checkpoint(&crate::persistence::CheckpointRecord {
                agent_id: "coder-001".into(),
                session_id: "sess-1".into(),
                current_state: "TESTING".into(),
                state_data: serde_json::to_value(&data).unwrap(),
                retry_count: 1,
                updated_at: Utc::now(),
            })
            .unwrap();

        driver.initialize(rig.store.as_ref()).unwrap();
        assert_eq!(driver.current_state().as_str(), "TESTING");
        assert_eq!(driver.state().retry_count, 1);
        assert_eq!(driver.state().data.get("story_id"), Some(&Value::from("story-7")));
    }

    #[tokio::test]
    async fn test_initialize_fresh_without_checkpoint() {
        let behavior = ScriptedBehavior::new([]);
        let (mut driver, rig) = driver_with(behavior, coder_spec());
        driver.initialize(rig.store.as_ref()).unwrap();
        assert_eq!(driver.current_state().as_str(), "CODING");
    }

    #[tokio::test]
    async fn test_restore_state_requires_checkpoint() {
        let behavior = ScriptedBehavior::new([]);
        let (mut driver, rig) = driver_with(behavior, coder_spec());
        let err = driver.restore_state(rig.store.as_ref(), "sess-0").unwrap_err();
        assert!(matches!(err, MachineError::CheckpointNotFound { .. }));
    }

    #[tokio::test]
    async fn test_restore_state_validates_declared_keys() {
        let behavior = ScriptedBehavior::new([]);
        let spec = coder_spec().require_key("story_id");
        let (mut driver, rig) = driver_with(behavior, spec);

        rig.store
            .save_checkpoint(&crate::persistence::CheckpointRecord {
                agent_id: "coder-001".into(),
                session_id: "sess-1".into(),
                current_state: "CODING".into(),
                state_data: serde_json::json!({}),
                retry_count: 0,
                updated_at: Utc::now(),
            })
            .unwrap();

        let err = driver.restore_state(rig.store.as_ref(), "sess-1").unwrap_err();
        assert!(matches!(err, MachineError::MissingStateKey { .. }));
    }

    /// A store whose checkpoint writes always fail.
    #[derive(Debug)]
    struct FailingStore;

    impl StateStore for FailingStore {
        fn init_db(&self) -> Result<(), crate::persistence::PersistenceError> {
            Ok(())
        }
        fn save_checkpoint(
            &self,
            _c: &crate::persistence::CheckpointRecord,
        ) -> Result<(), crate::persistence::PersistenceError> {
            Err(crate::persistence::PersistenceError::Corrupt {
                detail: "disk gone".into(),
            })
        }
        fn load_checkpoint(
            &self,
            _a: &str,
            _s: &str,
        ) -> Result<Option<crate::persistence::CheckpointRecord>, crate::persistence::PersistenceError>
        {
            Ok(None)
        }
        fn begin_session(
            &self,
            _s: &str,
        ) -> Result<crate::persistence::SessionRecord, crate::persistence::PersistenceError> {
            Err(crate::persistence::PersistenceError::Corrupt {
                detail: "disk gone".into(),
            })
        }
        fn update_session_status(
            &self,
            _s: &str,
            _st: crate::persistence::SessionStatus,
        ) -> Result<(), crate::persistence::PersistenceError> {
            Ok(())
        }
        fn mark_active_crashed(&self) -> Result<usize, crate::persistence::PersistenceError> {
            Ok(0)
        }
        fn most_recent_resumable(
            &self,
        ) -> Result<Option<crate::persistence::SessionRecord>, crate::persistence::PersistenceError>
        {
            Ok(None)
        }
        fn upsert_work_item(
            &self,
            _i: &crate::persistence::WorkItem,
        ) -> Result<(), crate::persistence::PersistenceError> {
            Ok(())
        }
        fn reset_in_flight(
            &self,
            _s: &str,
        ) -> Result<usize, crate::persistence::PersistenceError> {
            Ok(0)
        }
        fn pending_work(
            &self,
            _s: &str,
        ) -> Result<Vec<crate::persistence::WorkItem>, crate::persistence::PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_as_fatal() {
        let fatal = CancellationToken::new();
        let writer = Arc::new(CheckpointWriter::spawn(
            Arc::new(FailingStore),
            4,
            fatal.clone(),
        ));
        let (_inbox_tx, inbox_rx) = mpsc::channel(16);
        let (state_tx, _state_rx) = mpsc::channel(64);

        let behavior = ScriptedBehavior::new([
            Ok(StateName::new("TESTING")),
            Ok(StateName::new("CODING")),
        ]);
        let mut driver = Driver::new(
            "coder-001",
            coder_spec(),
            behavior,
            DriverHarness {
                session_id: "sess-1".into(),
                inbox: inbox_rx,
                checkpoints: writer,
                state_changes: state_tx,
                step_timeout: Duration::from_secs(5),
                retry_backoff: Duration::from_millis(10),
            },
        );
        let cancel = CancellationToken::new();

        // First commit enqueues fine; the worker then hits the broken
        // store and closes the queue.
        driver.step(&cancel).await.unwrap();
        fatal.cancelled().await;

        // The next commit finds the queue closed: durability is gone and
        // the error is fatal for the process.
        let err = driver.step(&cancel).await.unwrap_err();
        assert!(matches!(
            err,
            MachineError::Persistence(crate::persistence::PersistenceError::QueueClosed)
        ));
    }
}
