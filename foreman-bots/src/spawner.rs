//! Dynamic agents created at runtime from a free-form specification.
//!
//! A spawned agent is an ordinary roster entry: a role file, an agent
//! record and an [`AgentConfig`]. The dynamic registry tracks when each one
//! was created, when it expires, and whether it has been retired.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use foreman_sdk::write_atomic;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AgentConfig, Settings};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Template {
    Analyzer,
    #[default]
    Implementer,
    Optimizer,
    Integrator,
    Validator,
}

impl Template {
    pub fn base_expertise(self) -> &'static str {
        match self {
            Template::Analyzer => "analysis and investigation",
            Template::Implementer => "implementation and coding",
            Template::Optimizer => "performance optimization",
            Template::Integrator => "system integration",
            Template::Validator => "validation and quality assurance",
        }
    }

    pub fn responsibilities(self) -> &'static [&'static str] {
        match self {
            Template::Analyzer => &[
                "Analyze the specific domain area",
                "Identify patterns and anomalies",
                "Generate actionable insights",
                "Document findings comprehensively",
            ],
            Template::Implementer => &[
                "Implement specified functionality",
                "Follow existing code patterns",
                "Ensure test coverage",
                "Document code changes",
            ],
            Template::Optimizer => &[
                "Identify performance bottlenecks",
                "Implement optimization strategies",
                "Measure improvements",
                "Ensure no regression",
            ],
            Template::Integrator => &[
                "Connect disparate systems",
                "Implement API integrations",
                "Handle data transformation",
                "Ensure reliable communication",
            ],
            Template::Validator => &[
                "Validate implementation against requirements",
                "Create comprehensive test cases",
                "Ensure edge cases are covered",
                "Report validation results",
            ],
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Template::Analyzer => "analyzer",
            Template::Implementer => "implementer",
            Template::Optimizer => "optimizer",
            Template::Integrator => "integrator",
            Template::Validator => "validator",
        };
        f.write_str(name)
    }
}

const DEFAULT_SUCCESS_CRITERIA: &[&str] = &[
    "Complete assigned task successfully",
    "All tests pass",
    "No regression in existing functionality",
    "Clear documentation of changes",
];

const DEFAULT_LIFETIME_HOURS: i64 = 24;
const ID_ATTEMPTS: usize = 16;

/// Request for a new agent, as written by a user or another agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentSpec {
    pub expertise: Option<String>,
    pub purpose: Option<String>,
    pub responsibilities: Option<Vec<String>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub files_allowed: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub template: Template,
    #[serde(default)]
    pub lifetime_hours: Option<i64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("missing required fields: {}", .0.join(", "))]
pub struct MissingFields(pub Vec<&'static str>);

impl AgentSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("Invalid agent specification")
    }

    /// Check the required fields, reporting every missing one at once.
    pub fn validate(&self) -> Result<(), MissingFields> {
        let mut missing = Vec::new();
        if self.expertise.as_deref().is_none_or(|s| s.trim().is_empty()) {
            missing.push("expertise");
        }
        if self.purpose.as_deref().is_none_or(|s| s.trim().is_empty()) {
            missing.push("purpose");
        }
        if self.responsibilities.is_none() {
            missing.push("responsibilities");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MissingFields(missing))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Retired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub status: EntryStatus,
    pub template: Template,
    pub purpose: String,
    pub definition_path: PathBuf,
}

/// The dynamic-agent registry file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub agents: BTreeMap<String, RegistryEntry>,
    #[serde(default)]
    pub total_created: u64,
    #[serde(default)]
    pub active_count: u64,
    #[serde(default)]
    pub retired_count: u64,
}

/// A freshly created agent.
#[derive(Debug, Clone)]
pub struct SpawnedAgent {
    pub id: String,
    pub config: AgentConfig,
    pub expires: DateTime<Utc>,
}

pub struct Spawner {
    roles_dir: PathBuf,
    agents_dir: PathBuf,
    registry_path: PathBuf,
    default_model: String,
}

impl Spawner {
    pub fn new(
        roles_dir: impl Into<PathBuf>,
        agents_dir: impl Into<PathBuf>,
        registry_path: impl Into<PathBuf>,
        default_model: &str,
    ) -> Self {
        Self {
            roles_dir: roles_dir.into(),
            agents_dir: agents_dir.into(),
            registry_path: registry_path.into(),
            default_model: default_model.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.roles_dir(),
            settings.agents_dir(),
            settings.dynamic_registry_file(),
            &settings.llm.default_model,
        )
    }

    pub fn spawn(&self, spec: &AgentSpec) -> Result<SpawnedAgent> {
        self.spawn_at(spec, Utc::now())
    }

    /// Create the agent described by `spec` as of `now`: role file, agent
    /// record and registry entry.
    pub fn spawn_at(&self, spec: &AgentSpec, now: DateTime<Utc>) -> Result<SpawnedAgent> {
        spec.validate()?;
        let expertise = spec.expertise.as_deref().unwrap_or_default().trim();
        let purpose = spec.purpose.as_deref().unwrap_or_default().trim();

        let hours = spec.lifetime_hours.unwrap_or(DEFAULT_LIFETIME_HOURS).max(0);
        let expires = Duration::try_hours(hours)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .with_context(|| format!("lifetime_hours {hours} is out of range"))?;

        let mut registry = self.registry()?;
        let mut rng = rand::thread_rng();
        let id = self.fresh_id(&snake_case(expertise), &registry, || rng.r#gen())?;
        let template = spec.template;

        let mut responsibilities: Vec<String> =
            template.responsibilities().iter().map(|s| s.to_string()).collect();
        responsibilities.extend(spec.responsibilities.iter().flatten().cloned());

        let files_allowed = if spec.files_allowed.is_empty() {
            vec![
                "workspace/**".to_string(),
                format!("workspace/outputs/{id}/**"),
            ]
        } else {
            spec.files_allowed.clone()
        };

        let success_criteria = if spec.success_criteria.is_empty() {
            DEFAULT_SUCCESS_CRITERIA.iter().map(|s| s.to_string()).collect()
        } else {
            spec.success_criteria.clone()
        };

        let model = spec
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model)
            .to_string();

        let mut config = AgentConfig::new(&id, &model);
        config.files_allowed = files_allowed;
        config.description = format!("Dynamically created agent for {purpose}");
        config.role_file = self.roles_dir.join(format!("{id}.md"));
        config
            .context_policy
            .insert("receive_only_curated".into(), toml::Value::Boolean(true));
        config
            .context_policy
            .insert("max_context_files".into(), toml::Value::Integer(10));

        let role = role_definition(&RoleParts {
            id: &id,
            purpose,
            expertise: &format!("{expertise} ({})", template.base_expertise()),
            model: &model,
            template,
            created: now,
            expires,
            responsibilities: &responsibilities,
            files_allowed: &config.files_allowed,
            success_criteria: &success_criteria,
        });
        write_atomic(&config.role_file, role.as_bytes())
            .with_context(|| format!("Failed to write {}", config.role_file.display()))?;

        let record = toml::to_string_pretty(&config).context("Failed to encode agent record")?;
        let record_path = self.record_path(&id);
        write_atomic(&record_path, record.as_bytes())
            .with_context(|| format!("Failed to write {}", record_path.display()))?;

        registry.agents.insert(
            id.clone(),
            RegistryEntry {
                created: now,
                expires,
                status: EntryStatus::Active,
                template,
                purpose: purpose.to_string(),
                definition_path: config.role_file.clone(),
            },
        );
        registry.total_created += 1;
        registry.active_count += 1;
        self.save(&registry)?;

        info!(agent = %id, %template, %expires, "Spawned dynamic agent");
        Ok(SpawnedAgent {
            id,
            config,
            expires,
        })
    }

    /// Current registry; empty when the file does not exist yet.
    pub fn registry(&self) -> Result<Registry> {
        match std::fs::read_to_string(&self.registry_path) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Malformed registry {}", self.registry_path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Registry::default()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read {}", self.registry_path.display())),
        }
    }

    /// Mark `id` retired and remove its agent record so it is not loaded
    /// again. Returns false when `id` is unknown or already retired.
    pub fn retire(&self, id: &str) -> Result<bool> {
        let mut registry = self.registry()?;
        let Some(entry) = registry.agents.get_mut(id) else {
            return Ok(false);
        };
        if entry.status == EntryStatus::Retired {
            return Ok(false);
        }
        entry.status = EntryStatus::Retired;
        registry.active_count = registry.active_count.saturating_sub(1);
        registry.retired_count += 1;
        self.save(&registry)?;

        let record = self.record_path(id);
        match std::fs::remove_file(&record) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", record.display()));
            }
        }
        info!(agent = %id, "Retired dynamic agent");
        Ok(true)
    }

    /// Active agents whose lifetime has passed at `now`.
    pub fn expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        Ok(self
            .registry()?
            .agents
            .into_iter()
            .filter(|(_, e)| e.status == EntryStatus::Active && e.expires <= now)
            .map(|(id, _)| id)
            .collect())
    }

    /// `dynamic_<stem>_<4 hex>`, redrawing the suffix while it names an
    /// agent the registry or the agents directory already has.
    fn fresh_id(
        &self,
        stem: &str,
        registry: &Registry,
        mut suffix: impl FnMut() -> u16,
    ) -> Result<String> {
        for _ in 0..ID_ATTEMPTS {
            let id = format!("dynamic_{stem}_{:04x}", suffix());
            if !registry.agents.contains_key(&id) && !self.record_path(&id).exists() {
                return Ok(id);
            }
            debug!(agent = %id, "Agent id taken, drawing again");
        }
        bail!("No free agent id for {stem:?} after {ID_ATTEMPTS} attempts")
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.agents_dir.join(format!("{id}.toml"))
    }

    fn save(&self, registry: &Registry) -> Result<()> {
        let body = serde_json::to_vec_pretty(registry)?;
        write_atomic(&self.registry_path, &body)
            .with_context(|| format!("Failed to write {}", self.registry_path.display()))
    }
}

/// `"Data Pipelines!"` → `"data_pipelines"`.
pub fn snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_end_matches('_');
    if out.is_empty() {
        "agent".to_string()
    } else {
        out.to_string()
    }
}

struct RoleParts<'a> {
    id: &'a str,
    purpose: &'a str,
    expertise: &'a str,
    model: &'a str,
    template: Template,
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
    responsibilities: &'a [String],
    files_allowed: &'a [String],
    success_criteria: &'a [String],
}

fn bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn role_definition(p: &RoleParts<'_>) -> String {
    format!(
        "---\n\
         name: {id}\n\
         description: Dynamically created agent for {purpose}\n\
         model: {model}\n\
         template: {template}\n\
         created: {created}\n\
         expires: {expires}\n\
         ---\n\
         \n\
         You are {id}, a specialized agent created for: {purpose}\n\
         \n\
         **Core Expertise**: {expertise}\n\
         \n\
         **Primary Responsibilities**:\n{responsibilities}\n\
         \n\
         **Context Access**:\n{files}\n\
         \n\
         **Success Criteria**:\n{criteria}\n\
         \n\
         **Output Format**:\n\
         Provide clear, actionable results that can be validated through tests.\n",
        id = p.id,
        purpose = p.purpose,
        model = p.model,
        template = p.template,
        created = p.created.to_rfc3339(),
        expires = p.expires.to_rfc3339(),
        expertise = p.expertise,
        responsibilities = bullets(p.responsibilities),
        files = bullets(p.files_allowed),
        criteria = bullets(p.success_criteria),
    )
}
