//! User-driven delegation through the lead agent.
//!
//! A command such as `@TechLead ask @QA, and @Architect: review the API`
//! fans one request out to each mentioned agent the lead may invoke, then
//! the lead answers the command itself.

use foreman_sdk::Message;
use serde_json::json;
use tracing::{info, warn};

use crate::agent::Agent;

/// The lead's answer to one user command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadReply {
    pub text: String,
    /// Agents a request was sent to.
    pub delegated: Vec<String>,
    /// Mentions the lead is not allowed to invoke.
    pub refused: Vec<String>,
    pub is_error: bool,
}

/// `@name` mentions in `command`, in order of first appearance, without the
/// lead itself. Trailing `:`, `,` and `.` are not part of a name.
pub fn parse_mentions(command: &str, lead: &str) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();
    for word in command.split_whitespace() {
        let Some(name) = word.strip_prefix('@') else {
            continue;
        };
        let name = name.trim_end_matches([':', ',', '.']);
        if name.is_empty() || name == lead || mentions.iter().any(|m| m == name) {
            continue;
        }
        mentions.push(name.to_string());
    }
    mentions
}

/// Handle one user command with `lead`. Never fails: any error is returned
/// as a reply flagged `is_error`.
pub async fn handle_user_command(lead: &Agent, command: &str) -> LeadReply {
    info!(agent = %lead.name(), command, "Handling user command");

    let mut delegated = Vec::new();
    let mut refused = Vec::new();
    for name in parse_mentions(command, lead.name()) {
        if !lead.config().may_invoke(&name) {
            warn!(agent = %lead.name(), target = %name, "Not allowed to delegate");
            refused.push(name);
            continue;
        }
        let request = Message::request(lead.name(), &name, json!({ "command": command }));
        match lead.mailbox().send(&request) {
            Ok(_) => delegated.push(name),
            Err(e) => {
                return LeadReply {
                    text: format!("Failed to delegate to {name}: {e}"),
                    delegated,
                    refused,
                    is_error: true,
                };
            }
        }
    }

    let answer = match lead.load_context() {
        Ok(context) => lead.invoke_model(command, &context).await,
        Err(e) => Err(e),
    };
    match answer {
        Ok(text) => LeadReply {
            text,
            delegated,
            refused,
            is_error: false,
        },
        Err(e) => LeadReply {
            text: format!("Error: {e:#}"),
            delegated,
            refused,
            is_error: true,
        },
    }
}
