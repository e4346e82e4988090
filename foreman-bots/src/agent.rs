//! A roster agent: one mailbox, one role, one model.
//!
//! Work arrives only through the agent's inbox. For every request that asks
//! for an answer, [`Agent::process_message`] sends exactly one reply: the
//! model's response, or an error message when the model could not be
//! reached after retries. Failures never leave the agent stuck; it is idle
//! again before the next message is picked up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use foreman_sdk::{Mailbox, MailboxError, Message, MessageKind};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, Settings};
use crate::llm::ModelService;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Idle,
    Busy,
    Error,
    /// Set by the agent's owner to signal it has no more work this run.
    Completed,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Completed => write!(f, "completed"),
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    /// Root that `files_allowed` globs are resolved against.
    root: PathBuf,
    model: Arc<dyn ModelService>,
    mailbox: Mailbox,
    retry: RetryPolicy,
    poll_interval: Duration,
    error_cooldown: Duration,
    status: Mutex<AgentStatus>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        root: impl Into<PathBuf>,
        model: Arc<dyn ModelService>,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            config,
            root: root.into(),
            model,
            mailbox,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(5),
            status: Mutex::new(AgentStatus::Idle),
        }
    }

    /// Build an agent with retry and loop timing taken from `settings`.
    pub fn from_settings(
        config: AgentConfig,
        settings: &Settings,
        model: Arc<dyn ModelService>,
        mailbox: Mailbox,
    ) -> Self {
        Self::new(config, settings.project_dir.clone(), model, mailbox)
            .with_retry(RetryPolicy::from_settings(&settings.retry))
            .with_timing(
                Duration::from_millis(settings.agent.poll_interval_ms),
                Duration::from_millis(settings.agent.error_cooldown_ms),
            )
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timing(mut self, poll_interval: Duration, error_cooldown: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.error_cooldown = error_cooldown;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: AgentStatus) {
        *self.status.lock() = status;
    }

    /// Signal that this agent has nothing further to do in the current run.
    pub fn mark_completed(&self) {
        self.set_status(AgentStatus::Completed);
    }

    /// Role plus every allowed file, read fresh from disk.
    pub fn load_context(&self) -> Result<String> {
        crate::context::load_context(
            &self.root,
            &self.config.role_file,
            &self.config.files_allowed,
        )
    }

    /// Call the model with this agent's retry policy.
    pub async fn invoke_model(&self, prompt: &str, context: &str) -> Result<String> {
        let model = self.config.model.as_str();
        self.retry
            .run(&self.config.name, |attempt| {
                debug!(agent = %self.config.name, model, attempt, "Invoking model");
                self.model.complete(model, context, prompt)
            })
            .await
    }

    /// Handle one inbound message.
    ///
    /// Returns the reply that was sent, if any. The only error surfaced is a
    /// failure to write the error reply itself. A failed request becomes an
    /// error message to the sender; a failed reply or notification is only
    /// logged.
    pub async fn process_message(&self, message: &Message) -> Result<Option<Message>, MailboxError> {
        self.set_status(AgentStatus::Busy);
        info!(
            agent = %self.config.name,
            id = %message.id(),
            from = %message.from(),
            kind = %message.kind(),
            priority = %message.priority(),
            "Processing message"
        );

        let result = match self.answer(message).await {
            Ok(text) if message.requires_response() => {
                let reply = message.reply(&self.config.name, &text);
                match self.mailbox.send(&reply) {
                    Ok(_) => Ok(Some(reply)),
                    Err(e) => {
                        error!(agent = %self.config.name, error = %e, "Failed to send response");
                        self.set_status(AgentStatus::Error);
                        self.send_error(message, &e.to_string())
                    }
                }
            }
            Ok(_) => Ok(None),
            Err(e) => {
                let detail = format!("{e:#}");
                error!(
                    agent = %self.config.name,
                    id = %message.id(),
                    kind = %message.kind(),
                    error = %detail,
                    "Error processing message"
                );
                self.set_status(AgentStatus::Error);
                if expects_answer(message) {
                    self.send_error(message, &detail)
                } else {
                    // Replies and notifications have no requester to answer.
                    warn!(
                        agent = %self.config.name,
                        id = %message.id(),
                        "Dropping failed message"
                    );
                    Ok(None)
                }
            }
        };

        self.set_status(AgentStatus::Idle);
        result
    }

    async fn answer(&self, message: &Message) -> Result<String> {
        let context = self.load_context()?;
        let prompt = build_prompt(message);
        self.invoke_model(&prompt, &context).await
    }

    fn send_error(&self, message: &Message, error: &str) -> Result<Option<Message>, MailboxError> {
        let reply = message.error_reply(&self.config.name, error);
        self.mailbox.send(&reply)?;
        Ok(Some(reply))
    }

    /// Poll the inbox until `shutdown` flips to true.
    ///
    /// An empty inbox waits `poll_interval`; a failed cycle is logged and
    /// waits `error_cooldown` before the agent goes idle and polls again.
    /// Shutdown is observed between cycles, never mid-call.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(agent = %self.config.name, emoji = %self.config.emoji, "Agent started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.mailbox.receive(&self.config.name) {
                Ok(Some(message)) => match self.process_message(&message).await {
                    Ok(_) => None,
                    Err(e) => {
                        error!(agent = %self.config.name, error = %e, "Agent cycle failed");
                        self.set_status(AgentStatus::Error);
                        Some(self.error_cooldown)
                    }
                },
                Ok(None) => Some(self.poll_interval),
                Err(e) => {
                    error!(agent = %self.config.name, error = %e, "Agent cycle failed");
                    self.set_status(AgentStatus::Error);
                    Some(self.error_cooldown)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            warn!(agent = %self.config.name, "Shutdown sender dropped");
                            break;
                        }
                    }
                }
                if self.status() == AgentStatus::Error {
                    self.set_status(AgentStatus::Idle);
                }
            }
        }
        info!(agent = %self.config.name, "Agent stopped");
    }
}

/// Whether a failure on `message` is reported back to its sender.
fn expects_answer(message: &Message) -> bool {
    message.kind() == MessageKind::Request || message.requires_response()
}

/// The user prompt sent for `message`.
pub fn build_prompt(message: &Message) -> String {
    let payload = serde_json::to_string_pretty(message.payload()).unwrap_or_default();
    let context = message
        .context()
        .and_then(|c| serde_json::to_string_pretty(c).ok())
        .unwrap_or_else(|| "{}".to_string());
    format!(
        "Message Type: {kind}\n\
         Priority: {priority}\n\
         From: {from}\n\
         \n\
         Payload:\n{payload}\n\
         \n\
         Context:\n{context}\n\
         \n\
         Please process this message according to your role and respond appropriately.",
        kind = message.kind(),
        priority = message.priority(),
        from = message.from(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedModel;
    use foreman_sdk::Priority;
    use serde_json::json;

    fn agent(model: Arc<ScriptedModel>, dir: &std::path::Path) -> Agent {
        let mailbox = Mailbox::open(dir.join("messages")).unwrap();
        Agent::new(AgentConfig::new("Reviewer", "m"), dir, model, mailbox)
    }

    #[test]
    fn prompt_carries_message_fields() {
        let msg = Message::builder("QA", "Reviewer", MessageKind::Request)
            .priority(Priority::Critical)
            .payload(json!({"action": "review"}))
            .context(json!({"branch": "main"}))
            .build();
        let prompt = build_prompt(&msg);
        assert!(prompt.contains("Message Type: request"));
        assert!(prompt.contains("Priority: critical"));
        assert!(prompt.contains("From: QA"));
        assert!(prompt.contains("\"action\": \"review\""));
        assert!(prompt.contains("\"branch\": \"main\""));
        assert!(prompt.ends_with("respond appropriately."));
    }

    #[tokio::test]
    async fn successful_request_gets_one_response() {
        let temp = tempfile::tempdir().unwrap();
        let model = Arc::new(ScriptedModel::replying("looks good"));
        let agent = agent(model.clone(), temp.path());
        let request = Message::request("Orchestrator", "Reviewer", json!({"action": "review"}));

        let reply = agent.process_message(&request).await.unwrap().unwrap();
        assert_eq!(reply.kind(), MessageKind::Response);
        assert_eq!(reply.thread_id(), Some(request.id()));
        assert_eq!(reply.reply_text(), Some("looks good"));
        assert!(!reply.requires_response());
        assert_eq!(agent.status(), AgentStatus::Idle);

        let mailbox = agent.mailbox();
        assert_eq!(mailbox.receive("Orchestrator").unwrap(), Some(reply));
        assert!(mailbox.receive("Orchestrator").unwrap().is_none());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn notification_sends_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let agent = agent(Arc::new(ScriptedModel::replying("ok")), temp.path());
        let note = Message::builder("QA", "Reviewer", MessageKind::Notification).build();
        assert!(agent.process_message(&note).await.unwrap().is_none());
        assert_eq!(agent.mailbox().pending("QA").unwrap(), 0);
    }

    #[tokio::test]
    async fn model_sees_role_and_system_context() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("roles")).unwrap();
        std::fs::write(temp.path().join("roles/reviewer.md"), "You review code.").unwrap();
        let model = Arc::new(ScriptedModel::replying("ok"));
        let mailbox = Mailbox::open(temp.path().join("messages")).unwrap();
        let mut config = AgentConfig::new("Reviewer", "claude-test");
        config.role_file = temp.path().join("roles/reviewer.md");
        let agent = Agent::new(config, temp.path(), model.clone(), mailbox);

        let request = Message::request("Orchestrator", "Reviewer", json!({}));
        agent.process_message(&request).await.unwrap();
        let call = model.last_call().unwrap();
        assert_eq!(call.model, "claude-test");
        assert_eq!(call.system, "You review code.");
        assert!(call.prompt.contains("From: Orchestrator"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_is_not_answered() {
        let temp = tempfile::tempdir().unwrap();
        let agent = agent(Arc::new(ScriptedModel::always_failing()), temp.path());
        let request = Message::request("Reviewer", "QA", json!({}));
        let error = request.error_reply("QA", "model unavailable");

        assert!(agent.process_message(&error).await.unwrap().is_none());
        assert_eq!(agent.mailbox().pending("QA").unwrap(), 0);
        assert_eq!(agent.status(), AgentStatus::Idle);
    }

    #[test]
    fn completed_is_explicit() {
        let temp = tempfile::tempdir().unwrap();
        let agent = agent(Arc::new(ScriptedModel::replying("ok")), temp.path());
        assert_eq!(agent.status(), AgentStatus::Idle);
        agent.mark_completed();
        assert_eq!(agent.status(), AgentStatus::Completed);
    }
}
