//! Test doubles and fixtures shared by unit and integration tests.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::Settings;
use crate::llm::ModelService;

/// One recorded model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCall {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// When the call started, on tokio's clock.
    pub at: Instant,
}

#[derive(Default)]
struct Script {
    reply: String,
    /// Calls left to fail, per model id (`None` key = any model).
    failures: HashMap<Option<String>, u32>,
    always_fail: bool,
    replies: HashMap<String, String>,
    delays: HashMap<String, Duration>,
}

/// A [`ModelService`] that answers from a script.
///
/// Behaviour can be keyed by model id, so one instance can stand in for a
/// whole roster where every agent has its own model name.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<Script>,
    calls: Mutex<Vec<ModelCall>>,
}

impl ScriptedModel {
    /// Always answers `text`.
    pub fn replying(text: &str) -> Self {
        let model = Self::default();
        model.script.lock().reply = text.to_string();
        model
    }

    /// Fails the first `times` calls, then answers `text`.
    pub fn failing(times: u32, text: &str) -> Self {
        let model = Self::replying(text);
        model.script.lock().failures.insert(None, times);
        model
    }

    /// Never succeeds.
    pub fn always_failing() -> Self {
        let model = Self::default();
        model.script.lock().always_fail = true;
        model
    }

    /// Answer `text` when called with model id `model`.
    pub fn with_reply(self, model: &str, text: &str) -> Self {
        self.script
            .lock()
            .replies
            .insert(model.to_string(), text.to_string());
        self
    }

    /// Fail the first `times` calls made with model id `model`.
    pub fn with_failures(self, model: &str, times: u32) -> Self {
        self.script
            .lock()
            .failures
            .insert(Some(model.to_string()), times);
        self
    }

    /// Take `delay` to answer calls made with model id `model`.
    pub fn with_delay(self, model: &str, delay: Duration) -> Self {
        self.script.lock().delays.insert(model.to_string(), delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, model: &str) -> Vec<ModelCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.model == model)
            .cloned()
            .collect()
    }

    pub fn last_call(&self) -> Option<ModelCall> {
        self.calls.lock().last().cloned()
    }
}

#[async_trait]
impl ModelService for ScriptedModel {
    async fn complete(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        self.calls.lock().push(ModelCall {
            model: model.to_string(),
            system: system.to_string(),
            prompt: prompt.to_string(),
            at: Instant::now(),
        });

        let delay = self.script.lock().delays.get(model).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        if script.always_fail {
            anyhow::bail!("model unavailable");
        }
        for key in [Some(model.to_string()), None] {
            if let Some(left) = script.failures.get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    anyhow::bail!("transient model failure");
                }
            }
        }
        Ok(script
            .replies
            .get(model)
            .cloned()
            .unwrap_or_else(|| script.reply.clone()))
    }
}

/// Agent names of the standard delivery roster, with the model id each one
/// is given by [`write_roster`] (the name, lowercased).
pub const ROSTER: &[&str] = &[
    "MetaAgent",
    "Researcher",
    "TechLead",
    "ProductOwner",
    "Architect",
    "QA",
    "SelfHealing",
    "DeliveryLead",
];

/// Model id given to `agent` by [`write_roster`].
pub fn model_for(agent: &str) -> String {
    agent.to_ascii_lowercase()
}

/// Write one agent record into the settings' agents directory.
pub fn write_agent(settings: &Settings, stem: &str, toml: &str) {
    let dir = settings.agents_dir();
    std::fs::create_dir_all(&dir).unwrap_or_else(|e| panic!("create {}: {e}", dir.display()));
    let path = dir.join(format!("{stem}.toml"));
    std::fs::write(&path, toml).unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
}

/// Write records for each of `names` (a subset of [`ROSTER`] or any other
/// names). The lead may invoke everyone.
pub fn write_roster(settings: &Settings, names: &[&str]) {
    for name in names {
        let can_invoke = if *name == settings.workflow.lead {
            r#"["all"]"#
        } else {
            "[]"
        };
        write_agent(
            settings,
            &name.to_ascii_lowercase(),
            &format!(
                "name = \"{name}\"\nmodel = \"{model}\"\ncan_invoke = {can_invoke}\n",
                model = model_for(name),
            ),
        );
    }
}

/// Settings rooted at `dir` with fast loop timing and no backoff wait worth
/// mentioning.
pub fn settings_in(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.project_dir = dir.to_path_buf();
    settings.agent.poll_interval_ms = 10;
    settings.agent.error_cooldown_ms = 50;
    settings.retry.min_delay_ms = 1;
    settings.retry.max_delay_ms = 4;
    settings.workflow.reply_timeout_secs = 30;
    settings
}

/// Write the test verdict file.
pub fn write_verdict(settings: &Settings, passed: bool) {
    let path = settings.verdict_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .unwrap_or_else(|e| panic!("create {}: {e}", parent.display()));
    }
    let body = serde_json::json!({ "passed": passed, "total": 1, "failed": u32::from(!passed) });
    std::fs::write(&path, body.to_string())
        .unwrap_or_else(|e| panic!("write {}: {e}", path.display()));
}
