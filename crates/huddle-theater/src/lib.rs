//! Theater mode for Huddle.
//!
//! One participant hosts a video; everyone else follows. The host's
//! session record is authoritative and viewers correct their own players
//! against it with [`DriftPolicy`].

#![forbid(unsafe_code)]

pub mod drift;
pub mod session;
pub mod viewer;

pub use drift::{expected_position, DriftAction, DriftPolicy};
pub use session::{TheaterCoordinator, TheaterWatch};
pub use viewer::{follow, PlaybackClock, SimulatedClock, ViewerSync};
