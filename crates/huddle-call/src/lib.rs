//! Peer-to-peer call negotiation for Huddle.
//!
//! - [`MediaSessionManager`]: one peer link per call, driven through the
//!   offer/answer handshake with remote-candidate buffering
//! - [`CallCoordinator`]: call records in the shared store, missed-call
//!   timeout, delayed cleanup and the room listener
//! - [`IncomingCallGate`]: once-only incoming-call notification

#![forbid(unsafe_code)]

pub mod coordinator;
pub mod presence;
pub mod session;
pub mod state;

pub use coordinator::{CallCoordinator, CallEvent, CallListener};
pub use presence::IncomingCallGate;
pub use session::{CallTarget, MediaSessionManager, Role, SessionEvent, SessionSnapshot};
pub use state::{EndReason, Handshake, HandshakeEvent, PhaseEvent, SessionPhase};
