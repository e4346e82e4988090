//! foreman-bots: role-scoped LLM agents coordinated through mailboxes.
//!
//! - Agents: poll a mailbox, call the model with retry, reply exactly once
//! - Factory: phase-by-phase delivery workflow with a bounded fix loop
//! - Delegation: `@mention` commands fanned out by the lead agent
//! - Spawner: dynamic agents created from a JSON specification

pub mod agent;
pub mod config;
pub mod context;
pub mod delegation;
pub mod factory;
pub mod llm;
pub mod retry;
pub mod spawner;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
