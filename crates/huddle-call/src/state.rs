//! Negotiation state machines.
//!
//! Two machines run per call:
//! - [`Handshake`]: the offer/answer exchange
//!   (`stable -> have-local-offer -> stable` on the caller,
//!   `stable -> have-remote-offer -> stable` on the callee)
//! - [`SessionPhase`]: the session lifecycle
//!   (`Idle -> Negotiating -> Connected -> Ended`)
//!
//! Transitions are exhaustive tables; `None` means the event is illegal in
//! that state and must be dropped by the caller.

/// Offer/answer negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handshake {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Our offer was set as local description.
    LocalOffer,
    /// The remote answer was applied.
    RemoteAnswer,
    /// A remote offer was applied.
    RemoteOffer,
    /// Our answer was set as local description.
    LocalAnswer,
}

impl Handshake {
    pub fn next(self, event: HandshakeEvent) -> Option<Handshake> {
        use Handshake::*;
        use HandshakeEvent::*;

        match (self, event) {
            (Stable, LocalOffer) => Some(HaveLocalOffer),
            (Stable, RemoteOffer) => Some(HaveRemoteOffer),
            (HaveLocalOffer, RemoteAnswer) => Some(Stable),
            (HaveRemoteOffer, LocalAnswer) => Some(Stable),
            (Stable, RemoteAnswer | LocalAnswer)
            | (HaveLocalOffer, LocalOffer | RemoteOffer | LocalAnswer)
            | (HaveRemoteOffer, LocalOffer | RemoteOffer | RemoteAnswer) => None,
        }
    }

    pub fn is_stable(self) -> bool {
        self == Handshake::Stable
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Hangup,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Negotiating,
    Connected,
    Ended(EndReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Start or answer was invoked.
    Begin,
    /// The handshake returned to stable with both descriptions applied.
    HandshakeComplete,
    /// The transport reported an unrecoverable failure.
    TransportFailed,
    /// Local teardown.
    Hangup,
}

impl SessionPhase {
    pub fn next(self, event: PhaseEvent) -> Option<SessionPhase> {
        use PhaseEvent::*;
        use SessionPhase::*;

        match (self, event) {
            (Idle, Begin) => Some(Negotiating),
            (Negotiating, HandshakeComplete) => Some(Connected),
            // Renegotiation while connected.
            (Connected, HandshakeComplete) => Some(Connected),
            (Negotiating | Connected, TransportFailed) => {
                Some(Ended(EndReason::TransportFailed))
            }
            (Idle | Negotiating | Connected, Hangup) => Some(Ended(EndReason::Hangup)),
            (Idle, HandshakeComplete | TransportFailed)
            | (Negotiating | Connected, Begin)
            | (Ended(_), Begin | HandshakeComplete | TransportFailed | Hangup) => None,
        }
    }

    pub fn is_ended(self) -> bool {
        matches!(self, SessionPhase::Ended(_))
    }
}
