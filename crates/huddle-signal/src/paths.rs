//! Hierarchical key layout inside the shared store.
//!
//! ```text
//! rooms/{room}/calls/{call_id}                 CallRecord
//! rooms/{room}/signals/{call_id}/{key}         SignalMessage
//! rooms/{room}/theater/{session_id}            TheaterSession
//! rooms/{room}/theater-actions/{session}/{key} TheaterAction
//! ```

use huddle_common::{Error, Result};

/// Feed name for call handshake messages.
pub const CALL_SIGNAL_FEED: &str = "signals";

/// Feed name for theater host actions.
pub const THEATER_ACTION_FEED: &str = "theater-actions";

const MAX_SEGMENT_LEN: usize = 128;

/// Split a path into its non-empty segments.
pub fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Append `key` to `base`.
pub fn join(base: &str, key: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{}/{}", base, key)
    }
}

/// A room id, call id or participant id usable as a single path segment.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment.len() <= MAX_SEGMENT_LEN
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '@'))
}

pub fn validate_segment(kind: &str, segment: &str) -> Result<()> {
    if is_valid_segment(segment) {
        Ok(())
    } else {
        Err(Error::invalid_state(format!("invalid {}: {:?}", kind, segment)))
    }
}

pub fn calls(room: &str) -> String {
    format!("rooms/{}/calls", room)
}

pub fn call(room: &str, call_id: &str) -> String {
    join(&calls(room), call_id)
}

pub fn feed(feed: &str, room: &str, session: &str) -> String {
    format!("rooms/{}/{}/{}", room, feed, session)
}

pub fn theaters(room: &str) -> String {
    format!("rooms/{}/theater", room)
}

pub fn theater(room: &str, session: &str) -> String {
    join(&theaters(room), session)
}
