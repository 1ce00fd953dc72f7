//! # Foreman
//!
//! Resumable multi-agent orchestration substrate for LLM-driven
//! development workflows.
//!
//! Foreman coordinates a small fleet of long-running worker agents
//! (architect, coder, project manager) that cooperate through a central
//! message dispatcher, are individually rate- and budget-limited against
//! model providers, and survive process crashes by checkpointing their
//! state machines into an embedded SQLite store.
//!
//! The crate is the substrate only: the typed message protocol, the
//! dispatcher, the rate/budget limiter, the resumable state-machine
//! driver framework, the durable session layer, and the supervisor that
//! ties them together. Agent decision logic, container mechanics, and
//! any UI are clients behind narrow trait seams.

pub mod config;
pub mod dispatch;
pub mod limiter;
pub mod machine;
pub mod persistence;
pub mod protocol;
pub mod roles;
pub mod supervisor;

pub use config::OrchestratorConfig;
pub use dispatch::{DispatchError, Dispatcher, Lease, StateChange};
pub use limiter::{LimiterError, LimiterStatus, ModelLimits, RateLimiter};
pub use machine::{
    Driver, DriverHarness, HandlerError, MachineError, MachineState, ResumePolicy, RoleBehavior,
    RoleSpec, StateName, StepContext,
};
pub use persistence::{
    CheckpointRecord, CheckpointWriter, PersistenceError, SessionRecord, SessionStatus,
    SqliteStateStore, StateStore,
};
pub use protocol::{AgentMsg, MsgType, Payload, ProtocolError};
pub use supervisor::{Supervisor, SupervisorError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
