//! foreman-sdk: the coordination substrate shared by foreman agents.
//!
//! Agents never call each other directly. Every unit of work is a
//! [`message::Message`] written into a per-agent mailbox on disk, so the
//! orchestrator, the agents and separately invoked tools (the stop gate,
//! inspection scripts) all see the same durable state.
//!
//! - [`message`]: immutable messages, kinds and priorities
//! - [`mailbox`]: inbox / processed / broadcast directories
//! - [`verdict`]: the externally written test verdict
//! - [`gate`]: the persisted attempt counter that bounds autonomous retries

pub mod atomic;
pub mod gate;
pub mod mailbox;
pub mod message;
pub mod msgid;
pub mod verdict;

pub use atomic::write_atomic;
pub use gate::{AttemptGate, GateDecision};
pub use mailbox::{Mailbox, MailboxError};
pub use message::{Message, MessageKind, Priority};
pub use verdict::Verdict;
