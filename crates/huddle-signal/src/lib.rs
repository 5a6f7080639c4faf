//! Shared-store plumbing for Huddle.
//!
//! - [`SharedStore`]: the hierarchical real-time store every participant writes to
//! - [`MemoryStore`]: in-process implementation
//! - [`SignalChannel`]: per-session message relay with at-most-once consumption
//! - [`CleanupScheduler`]: cancellable deferred tasks

#![forbid(unsafe_code)]

pub mod channel;
pub mod cleanup;
pub mod memory;
pub mod paths;
pub mod store;

pub use channel::{ChannelMessage, ChannelSubscription, Envelope, Inbox, SignalChannel};
pub use cleanup::CleanupScheduler;
pub use memory::MemoryStore;
pub use store::{children, read_json, write_json, SharedStore, Subscription};
