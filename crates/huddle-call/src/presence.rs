//! Presence-gated incoming-call notification.
//!
//! A participant is told about a ringing call exactly once, and never about
//! a call they placed themselves. The store may re-deliver the same ringing
//! record many times; the gate remembers what it already announced until the
//! record is deleted.

use std::collections::HashSet;

use huddle_common::{CallRecord, CallStatus};

#[derive(Debug, Clone)]
pub struct IncomingCallGate {
    local_id: String,
    announced: HashSet<String>,
    dismissed: HashSet<String>,
}

impl IncomingCallGate {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            announced: HashSet::new(),
            dismissed: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Whether `record` should be announced as incoming now. True at most
    /// once per record id.
    pub fn admit(&mut self, record: &CallRecord) -> bool {
        if record.status != CallStatus::Ringing || record.caller_id == self.local_id {
            return false;
        }
        self.announced.insert(record.id.clone())
    }

    /// Mark an announced call as dismissed. True the first time only, and
    /// only for calls that were announced.
    pub fn dismiss(&mut self, call_id: &str) -> bool {
        self.announced.contains(call_id) && self.dismissed.insert(call_id.to_string())
    }

    pub fn is_announced(&self, call_id: &str) -> bool {
        self.announced.contains(call_id)
    }

    /// Drop state for a deleted record.
    pub fn forget(&mut self, call_id: &str) {
        self.announced.remove(call_id);
        self.dismissed.remove(call_id);
    }

    /// Drop state for every record not in `present`.
    pub fn retain<'a>(&mut self, present: impl IntoIterator<Item = &'a str>) {
        let present: HashSet<&str> = present.into_iter().collect();
        self.announced.retain(|id| present.contains(id.as_str()));
        self.dismissed.retain(|id| present.contains(id.as_str()));
    }
}
