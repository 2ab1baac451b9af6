use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ── Wire protocol types ────────────────────────────────────────

/// Body of `POST /receive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub sender_public_key: String,
    pub encrypted_message: String,
    #[serde(default)]
    pub sender_id: String,
}

/// Response body of `POST /receive`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiveResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReceiveResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: Some(message.into()),
        }
    }
}

/// Structured payload carried inside an encrypted message for group traffic.
///
/// Direct messages are sent as bare text; the receiver tells them apart by
/// attempting to parse this form first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupEnvelope {
    GroupMessage {
        group_id: String,
        /// Empty when the peer left it out; the request's `sender_id` is used.
        #[serde(default)]
        sender_id: String,
        content: serde_json::Value,
        /// 0 when absent; read as receipt time.
        #[serde(default)]
        timestamp: f64,
        #[serde(default)]
        message_id: String,
    },
    GroupInvitation {
        group_id: String,
        #[serde(default)]
        sender_id: String,
        group_name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        created_by: String,
        #[serde(default)]
        members: Vec<String>,
        #[serde(default)]
        avatar_path: Option<String>,
        #[serde(default)]
        timestamp: f64,
        #[serde(default)]
        message_id: String,
    },
}

// ── Delivery state ─────────────────────────────────────────────

/// Delivery state of one tracked message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Timeout,
    ConnectionError,
    Error,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sending => "sending",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
            DeliveryState::Failed => "failed",
            DeliveryState::Timeout => "timeout",
            DeliveryState::ConnectionError => "connection_error",
            DeliveryState::Error => "error",
        }
    }

    /// One of the per-attempt failure outcomes.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DeliveryState::Failed
                | DeliveryState::Timeout
                | DeliveryState::ConnectionError
                | DeliveryState::Error
        )
    }

    /// No further transition is possible from this state.
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || *self == DeliveryState::Read
    }

    /// Whether `next` may follow `current` (`None` = registered, never announced).
    pub fn can_follow(current: Option<DeliveryState>, next: DeliveryState) -> bool {
        match current {
            None => next == DeliveryState::Sending,
            Some(DeliveryState::Sending) => next == DeliveryState::Sent || next.is_failure(),
            Some(DeliveryState::Sent) => next == DeliveryState::Delivered || next.is_failure(),
            Some(DeliveryState::Delivered) => next == DeliveryState::Read,
            Some(_) => false,
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change pushed to status observers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub message_id: String,
    pub state: DeliveryState,
    pub detail: Option<String>,
}

// ── Peers and groups ───────────────────────────────────────────

/// Connection info for one peer, as supplied by the contact directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerAddress {
    pub onion_address: String,
    pub public_key: String,
    pub user_id: String,
}

/// Our own connection info, shared with contacts out of band.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub onion_address: String,
    pub public_key: String,
    pub user_id: String,
}

/// A group member; address and key are optional because the directory may
/// not know them yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMember {
    pub user_id: String,
    #[serde(default)]
    pub onion_address: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

impl GroupMember {
    /// Both address and key, if present and non-empty.
    pub fn connection(&self) -> Option<(&str, &str)> {
        let addr = self.onion_address.as_deref().filter(|a| !a.is_empty())?;
        let key = self.public_key.as_deref().filter(|k| !k.is_empty())?;
        Some((addr, key))
    }
}

impl From<PeerAddress> for GroupMember {
    fn from(peer: PeerAddress) -> Self {
        Self {
            user_id: peer.user_id,
            onion_address: Some(peer.onion_address),
            public_key: Some(peer.public_key),
        }
    }
}

/// Group metadata sent with an invitation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupDescriptor {
    pub group_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub avatar_path: Option<String>,
}

/// Outcome of submitting one member's send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberResult {
    pub member_id: String,
    pub message_id: String,
    pub accepted: bool,
}

/// Aggregate result of a group fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendSummary {
    pub success: bool,
    pub sent_count: usize,
    pub total_members: usize,
    pub base_message_id: String,
    pub per_member_results: Vec<MemberResult>,
}

// ── Inbound events ─────────────────────────────────────────────

/// A demultiplexed inbound message handed to message observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundEvent {
    Direct {
        sender_id: String,
        message: String,
        sender_public_key: String,
        timestamp: DateTime<Utc>,
    },
    GroupMessage {
        sender_id: String,
        group_id: String,
        message: String,
        message_id: String,
        timestamp: DateTime<Utc>,
    },
    GroupInvitation {
        sender_id: String,
        group_id: String,
        group_name: String,
        description: String,
        created_by: String,
        members: Vec<String>,
        avatar_path: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

// ── Time helpers ───────────────────────────────────────────────

/// Current time as Unix seconds with sub-second precision.
pub fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert wire Unix seconds to a UTC timestamp. Missing (zero), negative or
/// non-finite values fall back to now.
pub fn from_unix(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() || secs <= 0.0 {
        return Utc::now();
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1_000_000_000.0).round() as u32;
    Utc.timestamp_opt(whole, nanos.min(999_999_999))
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeliveryState::ConnectionError).unwrap(),
            "\"connection_error\""
        );
        assert_eq!(DeliveryState::Delivered.to_string(), "delivered");
    }

    #[test]
    fn test_state_graph() {
        use DeliveryState::*;
        assert!(DeliveryState::can_follow(None, Sending));
        assert!(!DeliveryState::can_follow(None, Sent));
        assert!(DeliveryState::can_follow(Some(Sending), Sent));
        assert!(DeliveryState::can_follow(Some(Sending), Timeout));
        assert!(DeliveryState::can_follow(Some(Sent), Delivered));
        assert!(DeliveryState::can_follow(Some(Sent), ConnectionError));
        assert!(DeliveryState::can_follow(Some(Delivered), Read));
        assert!(!DeliveryState::can_follow(Some(Sent), Read));
        assert!(!DeliveryState::can_follow(Some(Failed), Delivered));
        assert!(!DeliveryState::can_follow(Some(Read), Delivered));
        assert!(!DeliveryState::can_follow(Some(Delivered), Sending));
    }

    #[test]
    fn test_group_envelope_tagging() {
        let env = GroupEnvelope::GroupMessage {
            group_id: "g1".into(),
            sender_id: "alice".into(),
            content: serde_json::Value::String("hello".into()),
            timestamp: 1700000000.5,
            message_id: "grp_1".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "group_message");
        assert_eq!(json["content"], "hello");

        let parsed: GroupEnvelope = serde_json::from_str(
            r#"{"type":"group_message","group_id":"g1","sender_id":"a","content":"hi","timestamp":1}"#,
        )
        .unwrap();
        assert!(matches!(parsed, GroupEnvelope::GroupMessage { .. }));
    }

    #[test]
    fn test_group_envelope_optional_fields() {
        let parsed: GroupEnvelope = serde_json::from_str(
            r#"{"type":"group_message","group_id":"g1","content":"hello"}"#,
        )
        .unwrap();
        match parsed {
            GroupEnvelope::GroupMessage {
                sender_id,
                timestamp,
                message_id,
                ..
            } => {
                assert!(sender_id.is_empty());
                assert_eq!(timestamp, 0.0);
                assert!(message_id.is_empty());
            }
            other => panic!("unexpected envelope {:?}", other),
        }

        let parsed: GroupEnvelope = serde_json::from_str(
            r#"{"type":"group_invitation","group_id":"g2","group_name":"Team"}"#,
        )
        .unwrap();
        assert!(matches!(
            parsed,
            GroupEnvelope::GroupInvitation { ref created_by, .. } if created_by.is_empty()
        ));
    }

    #[test]
    fn test_group_member_connection() {
        let full = GroupMember {
            user_id: "bob".into(),
            onion_address: Some("bob.onion".into()),
            public_key: Some("aa".into()),
        };
        assert_eq!(full.connection(), Some(("bob.onion", "aa")));

        let blank = GroupMember {
            user_id: "carol".into(),
            onion_address: Some(String::new()),
            public_key: Some("aa".into()),
        };
        assert!(blank.connection().is_none());
    }

    #[test]
    fn test_from_unix() {
        let dt = from_unix(1_700_000_000.25);
        assert_eq!(dt.timestamp(), 1_700_000_000);
        assert_eq!(dt.timestamp_subsec_millis(), 250);
        assert!(from_unix(f64::NAN) <= Utc::now());

        let before = Utc::now();
        assert!(from_unix(0.0) >= before);
    }
}
