//! Shared-store wire shapes.
//!
//! These are the field-level contract for everything persisted in the shared
//! real-time store: call records, signaling messages and theater sessions.
//! Field names are camelCase on the wire so other clients of the same store
//! can interoperate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Media kind requested when a call is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Status of a call record. Only moves forward:
/// `ringing -> answered -> ended` or `ringing -> ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Answered,
    Ended,
}

impl CallStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Ringing => 0,
            Self::Answered => 1,
            Self::Ended => 2,
        }
    }

    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_advance_to(self, next: CallStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// One call attempt within a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub room_id: String,
    pub caller_id: String,
    pub caller_display_name: String,
    pub kind: CallKind,
    pub status: CallStatus,
    #[serde(default)]
    pub participants: Vec<String>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
}

impl CallRecord {
    /// A freshly placed call: ringing, with the caller as sole participant.
    pub fn ringing(
        id: impl Into<String>,
        room_id: impl Into<String>,
        caller_id: impl Into<String>,
        caller_display_name: impl Into<String>,
        kind: CallKind,
    ) -> Self {
        let caller_id = caller_id.into();
        Self {
            id: id.into(),
            room_id: room_id.into(),
            participants: vec![caller_id.clone()],
            caller_id,
            caller_display_name: caller_display_name.into(),
            kind,
            status: CallStatus::Ringing,
            created_at: now_millis(),
            ended_at: None,
        }
    }

    /// True when `participant` placed the call or has joined it.
    pub fn involves(&self, participant: &str) -> bool {
        self.caller_id == participant || self.participants.iter().any(|p| p == participant)
    }

    /// The first participant that is not `me`.
    pub fn other_participant(&self, me: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != me)
    }

    /// Participants after `joiner` is added, preserving order and uniqueness.
    pub fn participants_with(&self, joiner: &str) -> Vec<String> {
        let mut participants = self.participants.clone();
        if !participants.iter().any(|p| p == &self.caller_id) {
            participants.insert(0, self.caller_id.clone());
        }
        if !participants.iter().any(|p| p == joiner) {
            participants.push(joiner.to_string());
        }
        participants
    }

    /// Still ringing after `timeout_ms` have elapsed since creation.
    pub fn is_stale_ringing(&self, now_ms: i64, timeout_ms: i64) -> bool {
        self.status == CallStatus::Ringing && now_ms.saturating_sub(self.created_at) > timeout_ms
    }
}

/// Handshake step carried by a [`SignalMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// A point-to-point handshake message relayed through the signal channel.
/// The payload is opaque to the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Value,
    pub from: String,
    pub to: String,
    pub timestamp: i64,
}

impl SignalMessage {
    pub fn new(
        kind: SignalKind,
        payload: Value,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            from: from.into(),
            to: to.into(),
            timestamp: now_millis(),
        }
    }
}

/// Playback status of a theater session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TheaterStatus {
    Playing,
    Paused,
    Ended,
}

/// Host playback command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TheaterActionKind {
    Play,
    Pause,
    Seek,
}

/// One authoritative host action, stored as `lastAction` and appended to the
/// theater action feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TheaterAction {
    #[serde(rename = "type")]
    pub kind: TheaterActionKind,
    pub current_time: f64,
    pub user_id: String,
    pub timestamp: i64,
}

impl TheaterAction {
    pub fn new(kind: TheaterActionKind, current_time: f64, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            current_time,
            user_id: user_id.into(),
            timestamp: now_millis(),
        }
    }
}

/// A video waiting in (or promoted from) the theater queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueVideo {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub added_by: String,
    pub added_at: i64,
}

/// Host-authoritative watch-together session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TheaterSession {
    pub id: String,
    pub room_id: String,
    pub host_id: String,
    #[serde(default)]
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<QueueVideo>,
    pub status: TheaterStatus,
    pub current_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<TheaterAction>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(default)]
    pub queue: Vec<QueueVideo>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TheaterSession {
    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_status_is_monotonic() {
        use CallStatus::*;
        assert!(Ringing.can_advance_to(Answered));
        assert!(Ringing.can_advance_to(Ended));
        assert!(Answered.can_advance_to(Ended));
        assert!(!Answered.can_advance_to(Ringing));
        assert!(!Ended.can_advance_to(Ringing));
        assert!(!Ended.can_advance_to(Answered));
        assert!(!Ended.can_advance_to(Ended));
    }

    #[test]
    fn test_call_record_wire_shape() {
        let record = CallRecord::ringing("c1", "room", "alice", "Alice", CallKind::Video);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["callerId"], "alice");
        assert_eq!(json["callerDisplayName"], "Alice");
        assert_eq!(json["roomId"], "room");
        assert_eq!(json["status"], "ringing");
        assert_eq!(json["kind"], "video");
        assert_eq!(json["participants"], serde_json::json!(["alice"]));
        assert!(json.get("endedAt").is_none());
    }

    #[test]
    fn test_signal_kind_uses_kebab_case() {
        let msg = SignalMessage::new(
            SignalKind::IceCandidate,
            serde_json::json!({"candidate": "candidate:1"}),
            "alice",
            "bob",
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ice-candidate");
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "bob");
    }

    #[test]
    fn test_participants_with_keeps_caller_first_and_unique() {
        let record = CallRecord::ringing("c1", "room", "alice", "Alice", CallKind::Audio);
        assert_eq!(record.participants_with("bob"), vec!["alice", "bob"]);

        let mut answered = record.clone();
        answered.participants = answered.participants_with("bob");
        assert_eq!(answered.participants_with("bob"), vec!["alice", "bob"]);
        assert_eq!(answered.other_participant("alice"), Some("bob"));
        assert_eq!(answered.other_participant("bob"), Some("alice"));
    }

    #[test]
    fn test_stale_ringing_detection() {
        let mut record = CallRecord::ringing("c1", "room", "alice", "Alice", CallKind::Audio);
        record.created_at = 1_000;
        assert!(!record.is_stale_ringing(50_000, 60_000));
        assert!(record.is_stale_ringing(62_000, 60_000));
        record.status = CallStatus::Answered;
        assert!(!record.is_stale_ringing(62_000, 60_000));
    }

    #[test]
    fn test_theater_action_wire_shape() {
        let action = TheaterAction::new(TheaterActionKind::Seek, 42.5, "host");
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "seek");
        assert_eq!(json["currentTime"], 42.5);
        assert_eq!(json["userId"], "host");
    }
}
