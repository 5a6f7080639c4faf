//! Peer transport contract.
//!
//! The platform supplies point-to-point links that negotiate via session
//! descriptions and ICE candidates. Link callbacks (local candidates, remote
//! streams, connection state) arrive on the event receiver returned with the
//! link.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use huddle_common::Result;

use crate::stream::{MediaStream, MediaTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Offer or answer, in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network path candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }
}

/// Offer/answer negotiation state as reported by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local network candidate to send to the remote side.
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished.
    GatheringComplete,
    /// The remote side's media arrived (or a new stream after renegotiation).
    RemoteStream(MediaStream),
    ConnectionState(ConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SenderId(pub String);

impl fmt::Display for SenderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outgoing track slot on a link. The kind survives track replacement.
#[derive(Debug, Clone)]
pub struct TrackSender {
    pub id: SenderId,
    pub kind: TrackKind,
    pub track: Option<MediaTrack>,
}

/// Settings for a new link.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkConfig {
    pub ice_servers: Vec<String>,
}

/// One negotiated point-to-point connection.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> &str;

    async fn add_track(&self, track: MediaTrack, stream_id: &str) -> Result<SenderId>;

    fn senders(&self) -> Vec<TrackSender>;

    /// Swap the track on an existing sender without renegotiating.
    async fn replace_track(&self, sender: &SenderId, track: MediaTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate. Only valid once a remote description is set.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    /// Close the link. Valid from every state; idempotent.
    fn close(&self);
}

/// A freshly created link and its event feed.
pub struct PeerLinkHandle {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Factory for peer links.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_link(&self, config: &LinkConfig) -> Result<PeerLinkHandle>;
}
