//! Typed message protocol for agent-to-agent communication.
//!
//! Defines the [`AgentMsg`] envelope exchanged through the dispatcher, the
//! closed [`MsgType`] enumeration, the tagged [`Payload`] union, and the
//! validation rules enforced once at the dispatcher boundary.
//!
//! Serialization is stable: struct fields encode in declaration order and
//! all maps are `BTreeMap`, so encode→decode→encode is byte-identical.
//! Messages are persisted to an append-only event log and replayed by
//! auxiliary tooling, which depends on this.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Logical broadcast target: a message addressed here fans out to every
/// attached agent.
pub const BROADCAST_TARGET: &str = "all";

/// Closed enumeration of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MsgType {
    /// A unit of work assigned to an agent.
    Task,
    /// Completion report for a previously received TASK.
    Result,
    /// A request expecting a RESPONSE (e.g. an approval request).
    Request,
    /// Reply to a REQUEST.
    Response,
    /// A question expecting an ANSWER.
    Question,
    /// Reply to a QUESTION.
    Answer,
    /// An error report, including protocol rejections echoed to senders.
    Error,
    /// Specification content handed between agents.
    Spec,
    /// Lifecycle signal broadcast during dispatcher shutdown.
    Shutdown,
}

impl MsgType {
    /// Reply types must reference the message they answer via `parent_id`.
    pub fn requires_parent(&self) -> bool {
        matches!(self, MsgType::Result | MsgType::Response | MsgType::Answer)
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MsgType::Task => "TASK",
            MsgType::Result => "RESULT",
            MsgType::Request => "REQUEST",
            MsgType::Response => "RESPONSE",
            MsgType::Question => "QUESTION",
            MsgType::Answer => "ANSWER",
            MsgType::Error => "ERROR",
            MsgType::Spec => "SPEC",
            MsgType::Shutdown => "SHUTDOWN",
        };
        write!(f, "{}", s)
    }
}

/// Tagged payload union, keyed by a `kind` tag.
///
/// Typed shapes are validated against the envelope's [`MsgType`] once at
/// the dispatcher boundary; consumers match on the variant instead of
/// re-asserting shapes ad hoc. [`Payload::Table`] carries untyped legacy
/// key-value payloads for forward compatibility and is accepted on any
/// message type, as is [`Payload::Empty`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// No payload.
    Empty,
    /// Work assignment carried by a TASK message.
    Task {
        story_id: String,
        title: String,
        description: String,
    },
    /// Approval request carried by a REQUEST message.
    Approval {
        approval_kind: String,
        content: String,
        reason: String,
        metadata: BTreeMap<String, String>,
    },
    /// Completion report carried by a RESULT or RESPONSE message.
    Outcome {
        success: bool,
        summary: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        detail: Option<String>,
    },
    /// Question carried by a QUESTION message.
    Question {
        prompt: String,
        options: Vec<String>,
    },
    /// Error report carried by an ERROR message.
    Fault {
        code: String,
        message: String,
        retryable: bool,
    },
    /// Specification content carried by a SPEC message.
    Spec { content: String },
    /// Untyped legacy key-value payload, valid on any message type.
    Table { entries: BTreeMap<String, Value> },
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Empty
    }
}

impl Payload {
    /// Short name of the payload variant, used in error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Task { .. } => "task",
            Payload::Approval { .. } => "approval",
            Payload::Outcome { .. } => "outcome",
            Payload::Question { .. } => "question",
            Payload::Fault { .. } => "fault",
            Payload::Spec { .. } => "spec",
            Payload::Table { .. } => "table",
        }
    }

    /// Whether this payload shape is legal on a message of type `msg_type`.
    pub fn compatible_with(&self, msg_type: MsgType) -> bool {
        match self {
            // Untyped shapes ride on anything.
            Payload::Empty | Payload::Table { .. } => true,
            Payload::Task { .. } => msg_type == MsgType::Task,
            Payload::Approval { .. } => msg_type == MsgType::Request,
            Payload::Outcome { .. } => {
                matches!(msg_type, MsgType::Result | MsgType::Response)
            }
            Payload::Question { .. } => msg_type == MsgType::Question,
            Payload::Fault { .. } => msg_type == MsgType::Error,
            Payload::Spec { .. } => msg_type == MsgType::Spec,
        }
    }
}

/// Validation failures surfaced at the dispatcher boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A required envelope field is empty.
    #[error("message is missing required field: {field}")]
    MissingField { field: &'static str },

    /// RESULT/RESPONSE/ANSWER messages must reference their originating
    /// request.
    #[error("message type {msg_type} requires a non-empty parent_id")]
    MissingParent { msg_type: MsgType },

    /// Typed payload carried by the wrong message type.
    #[error("payload kind '{payload_kind}' is not valid for message type {msg_type}")]
    PayloadMismatch {
        payload_kind: &'static str,
        msg_type: MsgType,
    },

    /// Message could not be decoded at all.
    #[error("message decode failed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// One immutable, versioned message envelope.
///
/// Construct with [`AgentMsg::new`], fill in payload/metadata via the
/// builder methods, and hand the message to the dispatcher. `id` and
/// `timestamp` are set at creation and never change; correlation between
/// requests and responses goes through `parent_id`, never arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMsg {
    /// Unique message identity, generated at creation.
    pub id: String,
    /// Links a reply to its originating request.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<String>,
    /// Message type.
    pub msg_type: MsgType,
    /// Sending agent identifier.
    pub from_agent: String,
    /// Receiving agent identifier, or [`BROADCAST_TARGET`].
    pub to_agent: String,
    /// Typed payload.
    #[serde(default)]
    pub payload: Payload,
    /// Open string map for cross-cutting concerns (correlation tokens,
    /// routing hints). Pass-through only; the dispatcher never interprets
    /// it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    /// Creation time, immutable thereafter.
    pub timestamp: DateTime<Utc>,
}

impl AgentMsg {
    /// Construct a message with a fresh id and timestamp. Payload and
    /// metadata are left for the caller to fill in.
    pub fn new(msg_type: MsgType, from_agent: impl Into<String>, to_agent: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            msg_type,
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            payload: Payload::Empty,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Builder: set the payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Builder: set the parent message id.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Builder: insert one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Construct a reply to this message: addressed back to the sender,
    /// with `parent_id` set to this message's id.
    pub fn reply(&self, msg_type: MsgType, payload: Payload) -> Self {
        Self::new(msg_type, self.to_agent.clone(), self.from_agent.clone())
            .with_parent(self.id.clone())
            .with_payload(payload)
    }

    /// Whether this message is addressed to every attached agent.
    pub fn is_broadcast(&self) -> bool {
        self.to_agent == BROADCAST_TARGET
    }

    /// Check the envelope invariants. Pure; no side effects.
    ///
    /// Required fields must be non-empty, reply types must carry a
    /// `parent_id`, and typed payloads must match the message type.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.id.is_empty() {
            return Err(ProtocolError::MissingField { field: "id" });
        }
        if self.from_agent.is_empty() {
            return Err(ProtocolError::MissingField { field: "from_agent" });
        }
        if self.to_agent.is_empty() {
            return Err(ProtocolError::MissingField { field: "to_agent" });
        }
        if self.msg_type.requires_parent()
            && self.parent_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(ProtocolError::MissingParent {
                msg_type: self.msg_type,
            });
        }
        if !self.payload.compatible_with(self.msg_type) {
            return Err(ProtocolError::PayloadMismatch {
                payload_kind: self.payload.kind(),
                msg_type: self.msg_type,
            });
        }
        Ok(())
    }

    /// Encode to a single JSON line. Stable across round trips.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::from)
    }

    /// Decode from JSON produced by [`AgentMsg::to_json`].
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sets_identity() {
        let msg = AgentMsg::new(MsgType::Task, "architect", "coder-001");
        assert!(!msg.id.is_empty());
        assert!(msg.parent_id.is_none());
        assert_eq!(msg.from_agent, "architect");
        assert_eq!(msg.to_agent, "coder-001");
        assert_eq!(msg.payload, Payload::Empty);
    }

    #[test]
    fn test_validate_ok() {
        let msg = AgentMsg::new(MsgType::Task, "architect", "coder-001").with_payload(
            Payload::Task {
                story_id: "story-1".into(),
                title: "Add login".into(),
                description: "Implement the login flow".into(),
            },
        );
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_required_fields() {
        let mut msg = AgentMsg::new(MsgType::Task, "architect", "coder-001");
        msg.id = String::new();
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::MissingField { field: "id" })
        ));

        let mut msg = AgentMsg::new(MsgType::Task, "", "coder-001");
        msg.id = "x".into();
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::MissingField { field: "from_agent" })
        ));

        let msg = AgentMsg::new(MsgType::Task, "architect", "");
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::MissingField { field: "to_agent" })
        ));
    }

    #[test]
    fn test_reply_types_require_parent() {
        for msg_type in [MsgType::Result, MsgType::Response, MsgType::Answer] {
            let msg = AgentMsg::new(msg_type, "coder-001", "architect");
            assert!(
                matches!(msg.validate(), Err(ProtocolError::MissingParent { .. })),
                "{} without parent_id must fail validation",
                msg_type
            );
        }

        // Empty parent_id is as bad as a missing one.
        let msg = AgentMsg::new(MsgType::Result, "coder-001", "architect").with_parent("");
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::MissingParent { .. })
        ));
    }

    #[test]
    fn test_reply_builder_correlates() {
        let request = AgentMsg::new(MsgType::Request, "coder-001", "architect").with_payload(
            Payload::Approval {
                approval_kind: "merge".into(),
                content: "diff".into(),
                reason: "story complete".into(),
                metadata: BTreeMap::new(),
            },
        );
        let response = request.reply(
            MsgType::Response,
            Payload::Outcome {
                success: true,
                summary: "approved".into(),
                detail: None,
            },
        );
        assert_eq!(response.parent_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(response.from_agent, "architect");
        assert_eq!(response.to_agent, "coder-001");
        assert!(response.validate().is_ok());
    }

    #[test]
    fn test_payload_type_mismatch_rejected() {
        let msg = AgentMsg::new(MsgType::Task, "architect", "coder-001").with_payload(
            Payload::Fault {
                code: "E1".into(),
                message: "boom".into(),
                retryable: false,
            },
        );
        assert!(matches!(
            msg.validate(),
            Err(ProtocolError::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn test_table_payload_valid_on_any_type() {
        let mut entries = BTreeMap::new();
        entries.insert("legacy_key".to_string(), Value::from(42));
        for msg_type in [MsgType::Task, MsgType::Error, MsgType::Spec, MsgType::Shutdown] {
            let msg = AgentMsg::new(msg_type, "a", "b").with_payload(Payload::Table {
                entries: entries.clone(),
            });
            assert!(msg.validate().is_ok());
        }
    }

    #[test]
    fn test_serialization_round_trip_is_byte_identical() {
        let msg = AgentMsg::new(MsgType::Request, "coder-001", "architect")
            .with_payload(Payload::Approval {
                approval_kind: "merge".into(),
                content: "diff content".into(),
                reason: "tests pass".into(),
                metadata: BTreeMap::from([("branch".to_string(), "story-1".to_string())]),
            })
            .with_metadata("corr", "token-9")
            .with_metadata("hint", "fast-lane");

        let first = msg.to_json().unwrap();
        let decoded = AgentMsg::from_json(&first).unwrap();
        let second = decoded.to_json().unwrap();
        assert_eq!(first, second);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_msg_type_fails_decode() {
        let raw = r#"{"id":"1","msg_type":"GOSSIP","from_agent":"a","to_agent":"b","payload":{"kind":"empty"},"timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(AgentMsg::from_json(raw).is_err());
    }

    #[test]
    fn test_broadcast_target() {
        let msg = AgentMsg::new(MsgType::Shutdown, "dispatcher", BROADCAST_TARGET);
        assert!(msg.is_broadcast());
        assert!(msg.validate().is_ok());
    }
}
