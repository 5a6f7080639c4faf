//! Media plumbing for Huddle calls.
//!
//! The platform supplies two things: device capture ([`MediaCapture`]) and
//! negotiated peer links ([`PeerTransport`]). Both are traits so the call
//! engine can run against the in-process [`loopback`] platform in tests and
//! the CLI.

#![forbid(unsafe_code)]

pub mod capture;
pub mod loopback;
pub mod peer;
pub mod stream;

pub use capture::{MediaCapture, MediaConstraints};
pub use loopback::{LoopbackCapture, LoopbackLink, LoopbackTransport};
pub use peer::{
    ConnectionState, IceCandidate, LinkConfig, PeerEvent, PeerLink, PeerLinkHandle,
    PeerTransport, SdpType, SenderId, SessionDescription, SignalingState, TrackSender,
};
pub use stream::{FacingMode, MediaStream, MediaTrack, TrackKind};
