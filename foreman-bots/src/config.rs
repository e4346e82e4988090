//! Project settings and agent configuration records.
//!
//! Settings come from an optional `foreman.toml` at the project root, then
//! environment overrides, then CLI flags (applied by the binaries). Agent
//! records are one TOML file per agent under `paths.agents`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Settings file looked up in the project directory.
pub const SETTINGS_FILE: &str = "foreman.toml";

/// Wildcard accepted in `can_invoke`.
pub const INVOKE_ALL: &str = "all";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory every relative path is resolved against.
    #[serde(skip)]
    pub project_dir: PathBuf,
    pub paths: PathSettings,
    pub llm: LlmSettings,
    pub retry: RetrySettings,
    pub agent: AgentSettings,
    pub workflow: WorkflowSettings,
    pub gate: GateSettings,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            paths: PathSettings::default(),
            llm: LlmSettings::default(),
            retry: RetrySettings::default(),
            agent: AgentSettings::default(),
            workflow: WorkflowSettings::default(),
            gate: GateSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub workspace: PathBuf,
    pub mailbox: PathBuf,
    pub agents: PathBuf,
    pub roles: PathBuf,
    pub problem: PathBuf,
    pub verdict: PathBuf,
    pub gate_state: PathBuf,
    pub dynamic_registry: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            workspace: "workspace".into(),
            mailbox: "workspace/messages".into(),
            agents: "agents".into(),
            roles: "roles".into(),
            problem: "inputs/problem.md".into(),
            verdict: "workspace/reports/last_test_result.json".into(),
            gate_state: ".foreman/state.json".into(),
            dynamic_registry: "workspace/outputs/dynamic_agents.json".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub endpoint: String,
    /// Filled from `ANTHROPIC_API_KEY`; never read from the file.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_model: "claude-3-5-sonnet-20241022".to_string(),
            max_tokens: 4000,
            temperature: 0.3,
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub poll_interval_ms: u64,
    pub error_cooldown_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            error_cooldown_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// Agent that handles interactive `@mention` commands.
    pub lead: String,
    pub parallel_planning: bool,
    pub reply_timeout_secs: u64,
    pub max_healing_iterations: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            lead: "TechLead".to_string(),
            parallel_planning: true,
            reply_timeout_secs: 600,
            max_healing_iterations: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    pub max_attempts: u32,
    pub lock_timeout_ms: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lock_timeout_ms: 5000,
        }
    }
}

impl Settings {
    /// Load settings for `project_dir`.
    ///
    /// `explicit` names a settings file that must exist; otherwise
    /// `foreman.toml` in the project directory is used when present.
    /// Environment overrides are applied, then the result is validated.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = project_dir.join(SETTINGS_FILE);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.project_dir = project_dir.to_path_buf();
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Invalid settings {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("MAX_RETRIES") {
            self.retry.max_retries = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_RETRIES must be an integer, got {v:?}"))?;
        }
        if let Some(v) = lookup("PARALLEL_EXECUTION") {
            self.workflow.parallel_planning = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => bail!("PARALLEL_EXECUTION must be true or false, got {v:?}"),
            };
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v.trim().to_ascii_lowercase();
        }
        if let Some(v) = lookup("ANTHROPIC_API_KEY").filter(|v| !v.trim().is_empty()) {
            self.llm.api_key = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            bail!("retry.max_retries must be at least 1");
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.min_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.min_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            bail!("retry.backoff_factor must be >= 1.0");
        }
        if self.agent.poll_interval_ms == 0 {
            bail!("agent.poll_interval_ms must be positive");
        }
        if self.gate.max_attempts == 0 {
            bail!("gate.max_attempts must be at least 1");
        }
        if self.workflow.reply_timeout_secs == 0 {
            bail!("workflow.reply_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.resolve(&self.paths.workspace)
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.resolve(&self.paths.mailbox)
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.resolve(&self.paths.agents)
    }

    pub fn roles_dir(&self) -> PathBuf {
        self.resolve(&self.paths.roles)
    }

    pub fn problem_file(&self) -> PathBuf {
        self.resolve(&self.paths.problem)
    }

    pub fn verdict_file(&self) -> PathBuf {
        self.resolve(&self.paths.verdict)
    }

    pub fn gate_state_file(&self) -> PathBuf {
        self.resolve(&self.paths.gate_state)
    }

    pub fn dynamic_registry_file(&self) -> PathBuf {
        self.resolve(&self.paths.dynamic_registry)
    }
}

/// One agent's static configuration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
    #[serde(default)]
    pub model: String,
    /// Derived from the record's file name; not part of the file.
    #[serde(skip)]
    pub role_file: PathBuf,
    #[serde(default)]
    pub files_allowed: Vec<String>,
    #[serde(default)]
    pub can_invoke: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default = "default_true")]
    pub parallel_safe: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context_policy: BTreeMap<String, toml::Value>,
}

fn default_emoji() -> String {
    "🤖".to_string()
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// A minimal record, mostly for tests and the spawner.
    pub fn new(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            emoji: default_emoji(),
            model: model.to_string(),
            role_file: PathBuf::new(),
            files_allowed: Vec::new(),
            can_invoke: Vec::new(),
            blocked_by: Vec::new(),
            parallel_safe: true,
            description: String::new(),
            context_policy: BTreeMap::new(),
        }
    }

    /// Whether this agent may send work to `target`.
    pub fn may_invoke(&self, target: &str) -> bool {
        self.can_invoke
            .iter()
            .any(|name| name == INVOKE_ALL || name == target)
    }

    /// Parse one record. `stem` names the role file under `roles_dir`.
    pub fn from_toml(raw: &str, stem: &str, roles_dir: &Path, default_model: &str) -> Result<Self> {
        let mut config: AgentConfig = toml::from_str(raw)?;
        if config.name.trim().is_empty() {
            bail!("agent name must not be empty");
        }
        config.model = resolve_model(&config.model, default_model, |k| std::env::var(k).ok());
        config.role_file = roles_dir.join(format!("{stem}.md"));
        Ok(config)
    }
}

/// Resolve a configured model id. `${VAR}` reads the environment; an empty
/// or unresolvable value falls back to `default_model`.
pub fn resolve_model(
    raw: &str,
    default_model: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    let raw = raw.trim();
    let resolved = match raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(var) => lookup(var).unwrap_or_default(),
        None => raw.to_string(),
    };
    if resolved.trim().is_empty() {
        default_model.to_string()
    } else {
        resolved
    }
}

/// Load every `*.toml` agent record in `settings`' agents directory, in
/// file-name order. A missing directory yields an empty roster.
pub fn load_agent_configs(settings: &Settings) -> Result<Vec<AgentConfig>> {
    let dir = settings.agents_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(dir = %dir.display(), "No agents directory, roster is empty");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
        }
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "toml") && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let roles = settings.roles_dir();
    let mut configs: Vec<AgentConfig> = Vec::with_capacity(paths.len());
    for path in paths {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = AgentConfig::from_toml(&raw, &stem, &roles, &settings.llm.default_model)
            .with_context(|| format!("Invalid agent config {}", path.display()))?;
        if configs.iter().any(|c| c.name == config.name) {
            bail!("Duplicate agent name {:?} in {}", config.name, path.display());
        }
        tracing::debug!(agent = %config.name, model = %config.model, "Loaded agent config");
        configs.push(config);
    }
    Ok(configs)
}
