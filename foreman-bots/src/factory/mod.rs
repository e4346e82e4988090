//! The delivery factory.
//!
//! A fixed pipeline of roster agents, driven entirely through mailboxes:
//!
//! - MetaAgent (optional): task graph and context map
//! - Researcher: investigates the problem space
//! - TechLead: writes the primary specification
//! - ProductOwner and Architect: backlog and design, in parallel
//! - QA: runs the end-to-end suite
//! - SelfHealing: bounded fix loop while the verdict is failing
//! - DeliveryLead: finalizes the delivery

mod orchestrator;
mod phase;
mod reply;

pub use orchestrator::{
    ARCHITECT, DELIVERY_LEAD, META_AGENT, ORCHESTRATOR, Orchestrator, PRODUCT_OWNER, QA,
    RESEARCHER, SELF_HEALING, SPECIFIER, TaskError,
};
pub use phase::{HealingOutcome, Phase, PhaseReport, TaskOutcome, TaskRecord, WorkflowReport};
pub use reply::{Delivery, ReplyRouter};
