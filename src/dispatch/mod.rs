//! Message routing hub between attached agents.
//!
//! The dispatcher owns one bounded inbound channel per attached agent,
//! validates every message at the boundary, routes or fans out, tracks
//! per-agent work leases, carries the shared state-change stream the
//! supervisor consumes, and coordinates broadcast shutdown.
//!
//! Ordering guarantee: messages to the same target are delivered in
//! `dispatch` call order (single FIFO channel per agent). No ordering is
//! guaranteed across different targets; request/response correlation
//! relies on `parent_id`, never arrival order.

pub mod event_log;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{AgentMsg, MsgType, Payload, ProtocolError};
use event_log::EventLog;

/// Sender identity the dispatcher uses for its own messages (protocol
/// rejections, the SHUTDOWN broadcast).
pub const DISPATCHER_ID: &str = "dispatcher";

/// How often the drain loop re-checks queue occupancy during stop.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One `(agent, from, to)` transition notification, emitted by the driver
/// framework on every committed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub agent_id: String,
    pub from_state: String,
    pub to_state: String,
}

/// The dispatcher's record of which unit of work an agent currently owns.
/// At most one per agent; agents reference the work id but never hold the
/// lease itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub agent_id: String,
    pub work_id: String,
    pub acquired_at: DateTime<Utc>,
}

/// Routing and lease errors, returned synchronously to the caller. The
/// dispatcher's own loop is unaffected by any of these.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Message rejected at the boundary; never enqueued.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Target agent is not attached.
    #[error("agent '{agent_id}' is not attached")]
    AgentNotFound { agent_id: String },

    /// Target channel is full; fail fast instead of buffering unboundedly.
    #[error("inbound queue full for agent '{agent_id}'")]
    Backpressure { agent_id: String },

    /// The agent already owns a unit of work.
    #[error("agent '{agent_id}' already holds a lease for '{work_id}'")]
    LeaseHeld { agent_id: String, work_id: String },

    /// Dispatcher has begun shutdown; no new messages are accepted.
    #[error("dispatcher is stopped")]
    Stopped,
}

/// Teardown hook for external collaborators (container registry and
/// friends). The dispatcher runs registered hooks uniformly during
/// shutdown without understanding what they clean up.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    /// Name used in shutdown logs.
    fn name(&self) -> &'static str;

    /// Perform the teardown. Bounded by the shutdown grace period.
    async fn cleanup(&self) -> anyhow::Result<()>;
}

struct DispatcherInner {
    queue_capacity: usize,
    channels: DashMap<String, mpsc::Sender<AgentMsg>>,
    leases: DashMap<String, Lease>,
    pending: Mutex<VecDeque<String>>,
    state_tx: mpsc::Sender<StateChange>,
    state_rx: Mutex<Option<mpsc::Receiver<StateChange>>>,
    event_log: Option<EventLog>,
    cleanup_hooks: Mutex<Vec<Arc<dyn CleanupHook>>>,
    shutdown: CancellationToken,
}

/// The routing hub. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher with the given per-agent queue capacity and
    /// state-change stream capacity. `event_log` is optional: `None`
    /// disables the audit side channel.
    pub fn new(
        queue_capacity: usize,
        state_change_capacity: usize,
        event_log: Option<EventLog>,
    ) -> Self {
        let (state_tx, state_rx) = mpsc::channel(state_change_capacity);
        Self {
            inner: Arc::new(DispatcherInner {
                queue_capacity,
                channels: DashMap::new(),
                leases: DashMap::new(),
                pending: Mutex::new(VecDeque::new()),
                state_tx,
                state_rx: Mutex::new(Some(state_rx)),
                event_log,
                cleanup_hooks: Mutex::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Attachment
    // -----------------------------------------------------------------------

    /// Allocate a dedicated bounded inbound channel for `agent_id` and
    /// register it. Idempotent per id: re-attaching replaces the channel,
    /// which is how restarted agents get a fresh inbox.
    pub fn attach(&self, agent_id: impl Into<String>) -> mpsc::Receiver<AgentMsg> {
        let agent_id = agent_id.into();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        if self.inner.channels.insert(agent_id.clone(), tx).is_some() {
            log::info!("agent '{}' re-attached; previous channel replaced", agent_id);
        } else {
            log::info!("agent '{}' attached", agent_id);
        }
        rx
    }

    /// Close and remove the agent's channel. Safe to call on an agent
    /// that is not currently attached.
    pub fn detach(&self, agent_id: &str) {
        if self.inner.channels.remove(agent_id).is_some() {
            log::info!("agent '{}' detached", agent_id);
        }
    }

    /// Whether an agent is currently attached.
    pub fn is_attached(&self, agent_id: &str) -> bool {
        self.inner.channels.contains_key(agent_id)
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Validate and route one message.
    ///
    /// Protocol violations are rejected before routing, echoed back to
    /// the sender as an ERROR message, and never reach the event log.
    /// Routing failures (`AgentNotFound`, `Backpressure`) are returned to
    /// the caller without affecting other agents.
    pub fn dispatch(&self, msg: AgentMsg) -> Result<(), DispatchError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::Stopped);
        }

        if let Err(e) = msg.validate() {
            log::warn!(
                "rejected malformed message from '{}' to '{}': {}",
                msg.from_agent,
                msg.to_agent,
                e
            );
            self.report_rejection(&msg, &e);
            return Err(e.into());
        }

        if let Some(ref event_log) = self.inner.event_log {
            event_log.append(&msg);
        }

        if msg.is_broadcast() {
            self.fan_out(msg);
            Ok(())
        } else {
            self.send_to(msg)
        }
    }

    /// Echo a protocol rejection back to the sender as an ERROR message,
    /// best-effort: an unattached or unidentifiable sender just gets the
    /// synchronous error.
    fn report_rejection(&self, original: &AgentMsg, error: &ProtocolError) {
        if original.from_agent.is_empty() || !self.is_attached(&original.from_agent) {
            return;
        }
        let report = AgentMsg::new(MsgType::Error, DISPATCHER_ID, original.from_agent.clone())
            .with_parent(original.id.clone())
            .with_payload(Payload::Fault {
                code: "protocol_violation".to_string(),
                message: error.to_string(),
                retryable: false,
            });
        if let Some(tx) = self.inner.channels.get(&original.from_agent) {
            if tx.try_send(report).is_err() {
                log::warn!(
                    "could not deliver protocol rejection to '{}'",
                    original.from_agent
                );
            }
        }
    }

    fn send_to(&self, msg: AgentMsg) -> Result<(), DispatchError> {
        let agent_id = msg.to_agent.clone();
        let tx = match self.inner.channels.get(&agent_id) {
            Some(entry) => entry.value().clone(),
            None => return Err(DispatchError::AgentNotFound { agent_id }),
        };

        match tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(DispatchError::Backpressure { agent_id })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Receiver dropped without detaching; clean up the stale
                // entry.
                self.inner.channels.remove(&agent_id);
                Err(DispatchError::AgentNotFound { agent_id })
            }
        }
    }

    /// Fan a broadcast out to every attached agent, best-effort. A full
    /// or closed channel skips that agent; the rest still receive.
    fn fan_out(&self, msg: AgentMsg) {
        let mut delivered = 0usize;
        for entry in self.inner.channels.iter() {
            let mut copy = msg.clone();
            copy.to_agent = entry.key().clone();
            match entry.value().try_send(copy) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!(
                    "broadcast {} not delivered to '{}': {}",
                    msg.msg_type,
                    entry.key(),
                    match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "channel closed",
                    }
                ),
            }
        }
        log::debug!(
            "broadcast {} from '{}' delivered to {} agent(s)",
            msg.msg_type,
            msg.from_agent,
            delivered
        );
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Record that `agent_id` now owns `work_id`. Fails if the agent
    /// already holds a lease.
    pub fn assign_lease(
        &self,
        agent_id: impl Into<String>,
        work_id: impl Into<String>,
    ) -> Result<Lease, DispatchError> {
        let agent_id = agent_id.into();
        if let Some(existing) = self.inner.leases.get(&agent_id) {
            return Err(DispatchError::LeaseHeld {
                agent_id,
                work_id: existing.work_id.clone(),
            });
        }
        let lease = Lease {
            agent_id: agent_id.clone(),
            work_id: work_id.into(),
            acquired_at: Utc::now(),
        };
        self.inner.leases.insert(agent_id, lease.clone());
        Ok(lease)
    }

    /// Clear an agent's lease (work completed or errored). Returns the
    /// cleared lease, if any.
    pub fn clear_lease(&self, agent_id: &str) -> Option<Lease> {
        self.inner.leases.remove(agent_id).map(|(_, lease)| lease)
    }

    /// Current lease of an agent, if any.
    pub fn lease_of(&self, agent_id: &str) -> Option<Lease> {
        self.inner.leases.get(agent_id).map(|entry| entry.clone())
    }

    /// Return an agent's current unit of work to the pending pool, e.g.
    /// after a crash or forced restart. Clears the lease. Returns the
    /// requeued work id, or `None` if the agent held nothing.
    pub fn send_requeue(&self, agent_id: &str, reason: &str) -> Option<String> {
        let lease = self.clear_lease(agent_id)?;
        log::info!(
            "work '{}' requeued from agent '{}': {}",
            lease.work_id,
            agent_id,
            reason
        );
        self.inner.pending.lock().push_back(lease.work_id.clone());
        Some(lease.work_id)
    }

    /// Pop the oldest requeued work id, if any. Consumed by whoever
    /// hands out work (the supervisor or a coordinating agent).
    pub fn take_pending(&self) -> Option<String> {
        self.inner.pending.lock().pop_front()
    }

    // -----------------------------------------------------------------------
    // State-change stream
    // -----------------------------------------------------------------------

    /// Sender side of the shared transition stream, handed to each
    /// driver.
    pub fn state_change_sender(&self) -> mpsc::Sender<StateChange> {
        self.inner.state_tx.clone()
    }

    /// Take the single shared receiver of transition notifications.
    /// Yields `None` after the first call; there is exactly one consumer
    /// (the supervisor).
    pub fn take_state_changes(&self) -> Option<mpsc::Receiver<StateChange>> {
        self.inner.state_rx.lock().take()
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Token cancelled when `stop` begins; drivers watch it to wind down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Register a teardown hook to be run during `stop`.
    pub fn register_cleanup(&self, hook: Arc<dyn CleanupHook>) {
        self.inner.cleanup_hooks.lock().push(hook);
    }

    /// Broadcast SHUTDOWN to all attached agents, wait (bounded by
    /// `grace`) for inbound queues to drain, run cleanup hooks, then
    /// close all channels.
    pub async fn stop(&self, grace: Duration) {
        log::info!("dispatcher stopping: broadcasting SHUTDOWN");
        let shutdown_msg = AgentMsg::new(MsgType::Shutdown, DISPATCHER_ID, crate::protocol::BROADCAST_TARGET);
        if let Some(ref event_log) = self.inner.event_log {
            event_log.append(&shutdown_msg);
        }
        self.fan_out(shutdown_msg);

        // No new messages are accepted past this point.
        self.inner.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let drained = self
                .inner
                .channels
                .iter()
                .all(|entry| entry.value().capacity() == entry.value().max_capacity());
            if drained {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("dispatcher stop: queues not drained within grace period");
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let hooks: Vec<Arc<dyn CleanupHook>> = self.inner.cleanup_hooks.lock().clone();
        for hook in hooks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let budget = remaining.max(DRAIN_POLL_INTERVAL);
            match tokio::time::timeout(budget, hook.cleanup()).await {
                Ok(Ok(())) => log::info!("cleanup hook '{}' completed", hook.name()),
                Ok(Err(e)) => log::warn!("cleanup hook '{}' failed: {}", hook.name(), e),
                Err(_) => log::warn!("cleanup hook '{}' timed out", hook.name()),
            }
        }

        self.inner.channels.clear();
        log::info!("dispatcher stopped");
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("attached", &self.inner.channels.len())
            .field("leases", &self.inner.leases.len())
            .field("stopped", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}
