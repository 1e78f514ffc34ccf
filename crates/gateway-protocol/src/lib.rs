//! gateway-protocol: the WebSocket wire envelope for the community gateway.
//!
//! All frames share a single JSON envelope (`Frame`) keyed by an integer
//! opcode. Only `Dispatch` frames carry both a sequence number and an event
//! type tag; control frames carry neither. This mirrors Discord's own
//! gateway framing, which this server's wire protocol is modelled on.

use serde::de::{Deserializer, Error as DeError, Unexpected};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Stable integer opcodes. Values are part of the wire contract and must
/// never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

impl Serialize for Opcode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        Opcode::from_u8(v).ok_or_else(|| {
            DeError::invalid_value(Unexpected::Unsigned(v as u64), &"a known gateway opcode")
        })
    }
}

/// The wire envelope for every frame exchanged over the gateway socket.
///
/// Only `Dispatch` populates both `s` and `t`; ephemeral dispatches (typing)
/// populate `t` but never `s`. Control frames populate neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub op: Opcode,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub d: Option<serde_json::Value>,
}

impl Frame {
    pub fn hello(heartbeat_interval_ms: u64) -> Self {
        Self {
            op: Opcode::Hello,
            s: None,
            t: None,
            d: Some(serde_json::json!({ "heartbeat_interval": heartbeat_interval_ms })),
        }
    }

    pub fn heartbeat() -> Self {
        Self { op: Opcode::Heartbeat, s: None, t: None, d: None }
    }

    pub fn heartbeat_ack() -> Self {
        Self { op: Opcode::HeartbeatAck, s: None, t: None, d: None }
    }

    pub fn identify(token: impl Into<String>) -> Self {
        Self {
            op: Opcode::Identify,
            s: None,
            t: None,
            d: Some(serde_json::json!({ "token": token.into() })),
        }
    }

    pub fn resume(token: impl Into<String>, session_id: impl Into<String>, seq: i64) -> Self {
        Self {
            op: Opcode::Resume,
            s: None,
            t: None,
            d: Some(serde_json::json!({
                "token": token.into(),
                "session_id": session_id.into(),
                "seq": seq,
            })),
        }
    }

    pub fn presence_update(status: impl Into<String>) -> Self {
        Self {
            op: Opcode::PresenceUpdate,
            s: None,
            t: None,
            d: Some(serde_json::json!({ "status": status.into() })),
        }
    }

    /// A sequenced dispatch. Consumes one sequence number on the connection
    /// it is enqueued to, and is eligible for replay.
    pub fn dispatch(seq: i64, event_type: &str, data: serde_json::Value) -> Self {
        Self {
            op: Opcode::Dispatch,
            s: Some(seq),
            t: Some(event_type.to_owned()),
            d: Some(data),
        }
    }

    /// An unsequenced dispatch. Never enters the replay buffer.
    pub fn ephemeral_dispatch(event_type: &str, data: serde_json::Value) -> Self {
        Self { op: Opcode::Dispatch, s: None, t: Some(event_type.to_owned()), d: Some(data) }
    }

    pub fn reconnect() -> Self {
        Self { op: Opcode::Reconnect, s: None, t: None, d: None }
    }

    pub fn invalid_session(resumable: bool) -> Self {
        Self {
            op: Opcode::InvalidSession,
            s: None,
            t: None,
            d: Some(serde_json::json!({ "resumable": resumable })),
        }
    }

    /// Whether this frame carries a sequence number, per the ephemeral
    /// event-type rule: `Dispatch` frames for an ephemeral type never do.
    pub fn is_sequenced_dispatch(&self) -> bool {
        self.op == Opcode::Dispatch && self.s.is_some()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode an inbound frame. Callers are responsible for enforcing the
    /// 4096-byte size limit before calling this (§6.1).
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Maximum size, in bytes, of an inbound frame (§6.1).
pub const MAX_FRAME_BYTES: usize = 4096;

/// The 4xxx application close codes plus the standard 1001 used on
/// graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    GoingAway = 1001,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::UnknownError => "unknown error",
            Self::UnknownOpcode => "unknown opcode",
            Self::DecodeError => "malformed frame",
            Self::NotAuthenticated => "identify timeout",
            Self::AuthFailed => "authentication failed",
            Self::AlreadyAuthenticated => "already authenticated",
            Self::InvalidSequence => "invalid sequence",
            Self::RateLimited => "rate limited",
            Self::SessionTimedOut => "session timed out",
            Self::GoingAway => "going away",
        }
    }
}

/// Dispatch event type tags (§6.1, non-exhaustive per spec; this lists the
/// ones the gateway itself originates or special-cases).
pub mod event_type {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
    pub const MESSAGE_CREATE: &str = "MESSAGE_CREATE";
    pub const MESSAGE_UPDATE: &str = "MESSAGE_UPDATE";
    pub const MESSAGE_DELETE: &str = "MESSAGE_DELETE";
    pub const CHANNEL_CREATE: &str = "CHANNEL_CREATE";
    pub const CHANNEL_UPDATE: &str = "CHANNEL_UPDATE";
    pub const CHANNEL_DELETE: &str = "CHANNEL_DELETE";
    pub const ROLE_CREATE: &str = "ROLE_CREATE";
    pub const ROLE_UPDATE: &str = "ROLE_UPDATE";
    pub const ROLE_DELETE: &str = "ROLE_DELETE";
    pub const MEMBER_ADD: &str = "MEMBER_ADD";
    pub const MEMBER_UPDATE: &str = "MEMBER_UPDATE";
    pub const MEMBER_REMOVE: &str = "MEMBER_REMOVE";
    pub const PRESENCE_UPDATE: &str = "PRESENCE_UPDATE";
    pub const TYPING_START: &str = "TYPING_START";
    pub const TYPING_STOP: &str = "TYPING_STOP";
    pub const SERVER_UPDATE: &str = "SERVER_UPDATE";

    /// Ephemeral event types never consume a sequence number and are never
    /// appended to a session's replay buffer (§3 invariants, §8 property 5).
    pub fn is_ephemeral(event_type: &str) -> bool {
        matches!(event_type, TYPING_START | TYPING_STOP)
    }
}

/// Minimal READY payload DTOs (§6.1). Field shapes mirror what the CORE
/// needs to hand back to a freshly identified client; the REST tier's real
/// entity types are out of scope, so these are deliberately thin summaries
/// built from the collaborator traits in `gateway-core::collab`.
pub mod ready {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserSummary {
        pub id: String,
        pub username: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ServerSummary {
        pub id: String,
        pub name: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ChannelSummary {
        pub id: String,
        pub name: String,
        pub category_id: Option<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RoleSummary {
        pub id: String,
        pub name: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MemberSummary {
        pub user_id: String,
        pub nickname: Option<String>,
        pub role_ids: Vec<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PresenceSummary {
        pub user_id: String,
        pub status: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OnboardingSnapshot {
        pub enabled: bool,
        pub documents: Vec<String>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReadyPayload {
        pub user: UserSummary,
        pub server: ServerSummary,
        pub channels: Vec<ChannelSummary>,
        pub roles: Vec<RoleSummary>,
        pub members: Vec<MemberSummary>,
        pub presences: Vec<PresenceSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub onboarding: Option<OnboardingSnapshot>,
        pub session_id: String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_round_trips_op_seq_type_and_payload() {
        let frame = Frame::dispatch(42, event_type::MESSAGE_CREATE, serde_json::json!({"a": 1}));
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.op, Opcode::Dispatch);
        assert_eq!(decoded.s, Some(42));
        assert_eq!(decoded.t.as_deref(), Some(event_type::MESSAGE_CREATE));
        assert_eq!(decoded.d, frame.d);
    }

    #[test]
    fn ephemeral_dispatch_has_no_sequence() {
        let frame = Frame::ephemeral_dispatch(event_type::TYPING_START, serde_json::json!({}));
        assert!(!frame.is_sequenced_dispatch());
        let encoded = frame.encode().unwrap();
        assert!(!encoded.contains("\"s\":"));
    }

    #[test]
    fn hello_round_trips_heartbeat_interval() {
        let frame = Frame::hello(45_000);
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.op, Opcode::Hello);
        assert_eq!(decoded.d.unwrap()["heartbeat_interval"], 45_000);
    }

    #[test]
    fn malformed_json_fails_to_decode() {
        assert!(Frame::decode(b"{not-json").is_err());
    }

    #[test]
    fn unknown_opcode_fails_to_decode() {
        assert!(Frame::decode(br#"{"op":99}"#).is_err());
    }

    #[test]
    fn typing_start_and_stop_are_ephemeral_everything_else_is_not() {
        assert!(event_type::is_ephemeral(event_type::TYPING_START));
        assert!(event_type::is_ephemeral(event_type::TYPING_STOP));
        assert!(!event_type::is_ephemeral(event_type::MESSAGE_CREATE));
        assert!(!event_type::is_ephemeral(event_type::READY));
    }

    #[test]
    fn invalid_session_payload_carries_resumable_flag() {
        let frame = Frame::invalid_session(false);
        let encoded = frame.encode().unwrap();
        let decoded = Frame::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.d.unwrap()["resumable"], false);
    }
}
