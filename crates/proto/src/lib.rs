use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Upper bound for a single inbound text frame.
pub const MAX_TEXT_FRAME_LEN: usize = 64 * 1024;
pub const MAX_BODY_LEN: usize = 4096;
pub const MAX_FRIEND_NOTE_LEN: usize = 256;
pub const MAX_SDP_LEN: usize = 120_000;
pub const MAX_ICE_LEN: usize = 4096;
pub const MAX_CALL_REASON_LEN: usize = 64;

/// Stable reason codes carried by `ERROR`, `AUTH_FAIL` and `CALL_ERROR` frames.
pub mod reason {
    pub const BAD_JSON: &str = "bad_json";
    pub const MISSING_TYPE: &str = "missing_type";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const TOKEN_EXPIRED: &str = "token_expired";
    pub const MISSING_TOKEN: &str = "missing_token";
    pub const INVALID_TOKEN: &str = "invalid_token";
    pub const SESSION_INVALID: &str = "session_invalid";
    pub const REAUTH_UID_MISMATCH: &str = "reauth_uid_mismatch";
    pub const MISSING_MSG_ID: &str = "missing_msg_id";
    pub const MISSING_TO: &str = "missing_to";
    pub const MISSING_BODY: &str = "missing_body";
    pub const BODY_TOO_LONG: &str = "body_too_long";
    pub const CANNOT_SEND_TO_SELF: &str = "cannot_send_to_self";
    pub const NOT_GROUP_MEMBER: &str = "not_group_member";
    pub const SERVER_BUSY: &str = "server_busy";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const MISSING_ACK_TYPE: &str = "missing_ack_type";
    pub const UNKNOWN_ACK_TYPE: &str = "unknown_ack_type";
    pub const MISSING_SERVER_MSG_ID: &str = "missing_server_msg_id";
    pub const MESSAGE_NOT_FOUND: &str = "message_not_found";
    pub const ACK_NOT_ALLOWED: &str = "ack_not_allowed";
    pub const NOT_IMPLEMENTED: &str = "not_implemented";
    pub const CANNOT_CALL_SELF: &str = "cannot_call_self";
    pub const NOT_FRIEND: &str = "not_friend";
    pub const BUSY: &str = "busy";
    pub const CALLEE_OFFLINE: &str = "callee_offline";
    pub const MISSING_CALL_ID: &str = "missing_call_id";
    pub const CALL_NOT_FOUND: &str = "call_not_found";
    pub const CALL_NOT_PARTICIPANT: &str = "call_not_participant";
    pub const ONLY_CALLEE_CAN_ACCEPT: &str = "only_callee_can_accept";
    pub const ONLY_CALLEE_CAN_REJECT: &str = "only_callee_can_reject";
    pub const ONLY_CALLER_CAN_CANCEL: &str = "only_caller_can_cancel";
    pub const CALL_NOT_RINGING: &str = "call_not_ringing";
    pub const UNSUPPORTED_CALL_KIND: &str = "unsupported_call_kind";
    pub const MISSING_SDP: &str = "missing_sdp";
    pub const SDP_TOO_LONG: &str = "sdp_too_long";
    pub const MISSING_ICE_CANDIDATE: &str = "missing_ice_candidate";
    pub const ICE_CANDIDATE_TOO_LONG: &str = "ice_candidate_too_long";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Auth,
    AuthOk,
    AuthFail,
    Reauth,
    Ping,
    Pong,
    SingleChat,
    GroupChat,
    GroupNotify,
    Ack,
    Error,
    FriendRequest,
    MessageRevoke,
    MessageRevoked,
    CallInvite,
    CallInviteOk,
    CallAccept,
    CallReject,
    CallCancel,
    CallEnd,
    CallIce,
    CallTimeout,
    CallError,
    /// Any `type` value the gateway does not know.
    Unrecognized,
}

impl FrameType {
    pub fn parse(value: &str) -> Self {
        match value {
            "AUTH" => Self::Auth,
            "AUTH_OK" => Self::AuthOk,
            "AUTH_FAIL" => Self::AuthFail,
            "REAUTH" => Self::Reauth,
            "PING" => Self::Ping,
            "PONG" => Self::Pong,
            "SINGLE_CHAT" => Self::SingleChat,
            "GROUP_CHAT" => Self::GroupChat,
            "GROUP_NOTIFY" => Self::GroupNotify,
            "ACK" => Self::Ack,
            "ERROR" => Self::Error,
            "FRIEND_REQUEST" => Self::FriendRequest,
            "MESSAGE_REVOKE" => Self::MessageRevoke,
            "MESSAGE_REVOKED" => Self::MessageRevoked,
            "CALL_INVITE" => Self::CallInvite,
            "CALL_INVITE_OK" => Self::CallInviteOk,
            "CALL_ACCEPT" => Self::CallAccept,
            "CALL_REJECT" => Self::CallReject,
            "CALL_CANCEL" => Self::CallCancel,
            "CALL_END" => Self::CallEnd,
            "CALL_ICE" => Self::CallIce,
            "CALL_TIMEOUT" => Self::CallTimeout,
            "CALL_ERROR" => Self::CallError,
            _ => Self::Unrecognized,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "AUTH",
            Self::AuthOk => "AUTH_OK",
            Self::AuthFail => "AUTH_FAIL",
            Self::Reauth => "REAUTH",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::SingleChat => "SINGLE_CHAT",
            Self::GroupChat => "GROUP_CHAT",
            Self::GroupNotify => "GROUP_NOTIFY",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::FriendRequest => "FRIEND_REQUEST",
            Self::MessageRevoke => "MESSAGE_REVOKE",
            Self::MessageRevoked => "MESSAGE_REVOKED",
            Self::CallInvite => "CALL_INVITE",
            Self::CallInviteOk => "CALL_INVITE_OK",
            Self::CallAccept => "CALL_ACCEPT",
            Self::CallReject => "CALL_REJECT",
            Self::CallCancel => "CALL_CANCEL",
            Self::CallEnd => "CALL_END",
            Self::CallIce => "CALL_ICE",
            Self::CallTimeout => "CALL_TIMEOUT",
            Self::CallError => "CALL_ERROR",
            Self::Unrecognized => "UNRECOGNIZED",
        }
    }
}

/// Delivery receipt kinds. `read` accepts the legacy alias `ack_read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Saved,
    Delivered,
    Read,
}

impl AckKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "saved" => Some(Self::Saved),
            "delivered" => Some(Self::Delivered),
            "read" | "ack_read" => Some(Self::Read),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Saved,
    Delivered,
    Read,
    Revoked,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "saved" => Some(Self::Saved),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Conversation scope; doubles as the idempotency operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Single,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "SINGLE_CHAT",
            Self::Group => "GROUP_CHAT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SINGLE_CHAT" => Some(Self::Single),
            "GROUP_CHAT" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Accepted,
    Rejected,
    Canceled,
    Ended,
    Missed,
    Failed,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Ringing | Self::Accepted)
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidJson,
    MissingType,
    FrameTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid json frame"),
            Self::MissingType => write!(f, "missing type discriminator"),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
        }
    }
}

impl Error for CodecError {}

/// The single JSON object exchanged in both directions. Absent fields are
/// omitted from the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_seq: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_server_msg_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub important: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_candidate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_sdp_mid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_sdp_m_line_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_reason: Option<String>,
}

impl Envelope {
    pub fn of(frame_type: FrameType) -> Self {
        Envelope {
            kind: frame_type.as_str().to_string(),
            ..Envelope::default()
        }
    }

    pub fn frame_type(&self) -> FrameType {
        FrameType::parse(&self.kind)
    }

    /// Serializes the envelope into a single JSON text frame.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|_| CodecError::InvalidJson)
    }

    /// Decodes one inbound text frame, enforcing the frame-size ceiling and
    /// the presence of the `type` discriminator.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        if text.len() > MAX_TEXT_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let envelope =
            serde_json::from_str::<Envelope>(text).map_err(|_| CodecError::InvalidJson)?;
        if envelope.kind.trim().is_empty() {
            return Err(CodecError::MissingType);
        }
        Ok(envelope)
    }
}

/// Truncates a call reason instead of rejecting it.
pub fn clamp_call_reason(raw: Option<&str>) -> Option<String> {
    let trimmed = raw.map(str::trim).filter(|value| !value.is_empty())?;
    if trimmed.len() > MAX_CALL_REASON_LEN {
        let mut end = MAX_CALL_REASON_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        Some(trimmed[..end].to_string())
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_roundtrip_chat_envelope() {
        let mut envelope = Envelope::of(FrameType::SingleChat);
        envelope.client_msg_id = Some("c-1".to_string());
        envelope.to = Some(42);
        envelope.body = Some("hello".to_string());
        envelope.ts = Some(1_700_000_000_000);
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded.frame_type(), FrameType::SingleChat);
        assert_eq!(decoded.client_msg_id.as_deref(), Some("c-1"));
        assert_eq!(decoded.to, Some(42));
        assert_eq!(decoded.body.as_deref(), Some("hello"));
    }

    #[test]
    fn encode_omits_absent_fields() {
        let mut envelope = Envelope::of(FrameType::Pong);
        envelope.ts = Some(7);
        let encoded = envelope.encode().unwrap();
        assert_eq!(encoded, "{\"type\":\"PONG\",\"ts\":7}");
    }

    #[test]
    fn decode_unknown_type_is_unrecognized() {
        let decoded = Envelope::decode("{\"type\":\"TELEPORT\"}").unwrap();
        assert_eq!(decoded.frame_type(), FrameType::Unrecognized);
    }

    #[test]
    fn decode_rejects_missing_type() {
        assert!(matches!(
            Envelope::decode("{\"body\":\"hi\"}"),
            Err(CodecError::MissingType)
        ));
        assert!(matches!(
            Envelope::decode("{\"type\":\"  \"}"),
            Err(CodecError::MissingType)
        ));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(matches!(
            Envelope::decode("{not json"),
            Err(CodecError::InvalidJson)
        ));
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let padding = "x".repeat(MAX_TEXT_FRAME_LEN);
        let frame = format!("{{\"type\":\"PING\",\"body\":\"{padding}\"}}");
        assert!(matches!(
            Envelope::decode(&frame),
            Err(CodecError::FrameTooLarge)
        ));
    }

    #[test]
    fn ack_kind_accepts_read_alias() {
        assert_eq!(AckKind::parse("read"), Some(AckKind::Read));
        assert_eq!(AckKind::parse("ack_read"), Some(AckKind::Read));
        assert_eq!(AckKind::parse("delivered"), Some(AckKind::Delivered));
        assert_eq!(AckKind::parse("shrug"), None);
    }

    #[test]
    fn call_state_terminality() {
        assert!(!CallState::Ringing.is_terminal());
        assert!(!CallState::Accepted.is_terminal());
        assert!(CallState::Missed.is_terminal());
        assert!(CallState::Ended.is_terminal());
    }

    #[test]
    fn call_reason_is_clamped() {
        assert_eq!(clamp_call_reason(None), None);
        assert_eq!(clamp_call_reason(Some("  ")), None);
        assert_eq!(clamp_call_reason(Some(" hang up ")).as_deref(), Some("hang up"));
        let long = "r".repeat(MAX_CALL_REASON_LEN + 20);
        assert_eq!(
            clamp_call_reason(Some(&long)).map(|value| value.len()),
            Some(MAX_CALL_REASON_LEN)
        );
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let decoded = Envelope::decode(
            "{\"type\":\"ACK\",\"serverMsgId\":\"s-9\",\"ackType\":\"ack_read\",\"msgSeq\":12}",
        )
        .unwrap();
        assert_eq!(decoded.server_msg_id.as_deref(), Some("s-9"));
        assert_eq!(decoded.ack_type.as_deref(), Some("ack_read"));
        assert_eq!(decoded.msg_seq, Some(12));
    }
}
