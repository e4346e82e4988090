//! Factory orchestrator: owns the roster and drives the delivery pipeline.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use foreman_sdk::{Mailbox, MailboxError, Message, MessageKind, Verdict};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::phase::{HealingOutcome, Phase, PhaseReport, TaskOutcome, TaskRecord, WorkflowReport};
use super::reply::ReplyRouter;
use crate::agent::Agent;
use crate::config::{AgentConfig, Settings, load_agent_configs};
use crate::delegation::{LeadReply, handle_user_command};
use crate::llm::ModelService;

/// Mailbox the orchestrator sends from and receives replies in.
pub const ORCHESTRATOR: &str = "Orchestrator";

pub const META_AGENT: &str = "MetaAgent";
pub const RESEARCHER: &str = "Researcher";
pub const SPECIFIER: &str = "TechLead";
pub const PRODUCT_OWNER: &str = "ProductOwner";
pub const ARCHITECT: &str = "Architect";
pub const QA: &str = "QA";
pub const SELF_HEALING: &str = "SelfHealing";
pub const DELIVERY_LEAD: &str = "DeliveryLead";

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{agent} did not reply on thread {thread_id} within {waited:?}")]
    Timeout {
        agent: String,
        thread_id: String,
        waited: Duration,
    },
    #[error("reply wait for {agent} on thread {thread_id} was cancelled")]
    Cancelled { agent: String, thread_id: String },
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
}

/// Owns the agents, their loops and the orchestrator mailbox.
pub struct Orchestrator {
    settings: Settings,
    model: Arc<dyn ModelService>,
    mailbox: Mailbox,
    agents: RwLock<BTreeMap<String, Arc<Agent>>>,
    router: Arc<ReplyRouter>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Orchestrator {
    /// Load the roster from the configured agents directory and build one
    /// agent per record.
    pub fn new(settings: Settings, model: Arc<dyn ModelService>) -> Result<Self> {
        let configs = load_agent_configs(&settings)?;
        Self::with_configs(settings, model, configs)
    }

    pub fn with_configs(
        settings: Settings,
        model: Arc<dyn ModelService>,
        configs: Vec<AgentConfig>,
    ) -> Result<Self> {
        let mailbox = Mailbox::open(settings.mailbox_dir())
            .context("Failed to open mailbox root")?;
        let (shutdown, _) = watch::channel(false);
        // A reply nobody claims within one reply timeout is never claimed.
        let retention = Duration::from_secs(settings.workflow.reply_timeout_secs);
        let orchestrator = Self {
            settings,
            model,
            mailbox,
            agents: RwLock::new(BTreeMap::new()),
            router: Arc::new(ReplyRouter::new(retention)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        };
        for config in configs {
            orchestrator.register_agent(config)?;
        }
        Ok(orchestrator)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn agent(&self, name: &str) -> Option<Arc<Agent>> {
        self.agents.read().get(name).cloned()
    }

    /// Agent records in name order.
    pub fn roster(&self) -> Vec<AgentConfig> {
        self.agents
            .read()
            .values()
            .map(|a| a.config().clone())
            .collect()
    }

    /// Add an agent. Its loop starts right away when the orchestrator is
    /// running.
    pub fn register_agent(&self, config: AgentConfig) -> Result<Arc<Agent>> {
        if config.name == ORCHESTRATOR {
            bail!("{ORCHESTRATOR:?} is reserved for the orchestrator mailbox");
        }
        let agent = {
            let mut agents = self.agents.write();
            if agents.contains_key(&config.name) {
                bail!("Agent {:?} is already on the roster", config.name);
            }
            let agent = Arc::new(Agent::from_settings(
                config,
                &self.settings,
                self.model.clone(),
                self.mailbox.clone(),
            ));
            agents.insert(agent.name().to_string(), agent.clone());
            agent
        };
        info!(agent = %agent.name(), emoji = %agent.config().emoji, "Created agent");
        if self.running.load(Ordering::SeqCst) {
            self.spawn_agent(agent.clone());
        }
        Ok(agent)
    }

    fn spawn_agent(&self, agent: Arc<Agent>) {
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move { agent.run(shutdown).await });
        self.tasks.lock().push(handle);
    }

    /// Start every agent loop and the reply pump. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(false);
        let agents: Vec<_> = self.agents.read().values().cloned().collect();
        for agent in agents {
            self.spawn_agent(agent);
        }

        let router = self.router.clone();
        let mailbox = self.mailbox.clone();
        let poll = Duration::from_millis(self.settings.agent.poll_interval_ms);
        let cooldown = Duration::from_millis(self.settings.agent.error_cooldown_ms);
        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            router
                .pump(mailbox, ORCHESTRATOR, poll, cooldown, shutdown)
                .await
        });
        self.tasks.lock().push(handle);
        info!(agents = self.agents.read().len(), "Orchestrator started");
    }

    /// Signal every loop to stop and wait for them. In-flight model calls
    /// finish first.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Agent task panicked");
            }
        }
        info!("Orchestrator stopped");
    }

    /// Send `payload` to `agent` as a request and wait for its reply.
    ///
    /// An agent that is not on the roster is skipped with a log line. The
    /// wait is bounded by `workflow.reply_timeout_secs`.
    pub async fn run_agent_task(&self, agent: &str, payload: Value) -> Result<TaskOutcome, TaskError> {
        if self.agent(agent).is_none() {
            warn!(agent, "Agent not found, skipping task");
            return Ok(TaskOutcome::Skipped);
        }

        let request = Message::request(ORCHESTRATOR, agent, payload);
        let thread_id = request.id().to_string();
        let reply = self.router.register(&thread_id);
        if let Err(e) = self.mailbox.send(&request) {
            self.router.abandon(&thread_id);
            return Err(e.into());
        }

        let waited = Duration::from_secs(self.settings.workflow.reply_timeout_secs);
        match tokio::time::timeout(waited, reply).await {
            Ok(Ok(message)) => {
                let text = message.reply_text().unwrap_or_default().to_string();
                if message.kind() == MessageKind::Error {
                    warn!(agent, thread_id = %thread_id, error = %text, "Task failed");
                    Ok(TaskOutcome::Failed { error: text })
                } else {
                    info!(agent, thread_id = %thread_id, "Task complete");
                    Ok(TaskOutcome::Responded { text })
                }
            }
            Ok(Err(_)) => Err(TaskError::Cancelled {
                agent: agent.to_string(),
                thread_id,
            }),
            Err(_) => {
                self.router.abandon(&thread_id);
                Err(TaskError::Timeout {
                    agent: agent.to_string(),
                    thread_id,
                    waited,
                })
            }
        }
    }

    /// Run one task and record its outcome; failures never stop the
    /// workflow.
    async fn task(&self, agent: &str, payload: Value) -> TaskRecord {
        let outcome = match self.run_agent_task(agent, payload).await {
            Ok(outcome) => outcome,
            Err(e @ TaskError::Timeout { .. }) => {
                warn!(agent, error = %e, "Task timed out");
                TaskOutcome::TimedOut
            }
            Err(e) => {
                error!(agent, error = %e, "Task could not run");
                TaskOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        TaskRecord {
            agent: agent.to_string(),
            outcome,
        }
    }

    /// Run the full pipeline for the problem statement in `problem_file`
    /// (missing file: empty problem). Agent loops must be running.
    pub async fn execute_workflow(&self, problem_file: &Path) -> WorkflowReport {
        info!(problem = %problem_file.display(), "Starting workflow");
        let problem = read_or_empty(problem_file);
        let mut phases = Vec::new();

        if self.agent(META_AGENT).is_some() {
            let record = self
                .task(
                    META_AGENT,
                    json!({
                        "action": "orchestrate",
                        "problem": problem,
                        "mode": "autonomous",
                        "outputs": [
                            "workspace/outputs/task_graph.json",
                            "workspace/outputs/context_map.json",
                        ],
                    }),
                )
                .await;
            phases.push(single(Phase::MetaOrchestration, record));
        }

        let record = self
            .task(RESEARCHER, json!({ "action": "research", "problem": problem }))
            .await;
        phases.push(single(Phase::Research, record));

        let research = read_or_empty(&self.settings.workspace_dir().join("research/summary.md"));
        let record = self
            .task(
                SPECIFIER,
                json!({ "action": "create_spec", "research": research, "problem": problem }),
            )
            .await;
        phases.push(single(Phase::Specification, record));

        phases.push(self.planning().await);

        let record = self
            .task(QA, json!({ "action": "test", "test_plan": "e2e" }))
            .await;
        phases.push(single(Phase::Testing, record));

        let (healing, report) = self.self_heal().await;
        if let Some(report) = report {
            phases.push(report);
        }

        let test_results = read_or_empty(&self.settings.verdict_file());
        let record = self
            .task(
                DELIVERY_LEAD,
                json!({ "action": "finalize", "test_results": test_results }),
            )
            .await;
        phases.push(single(Phase::Delivery, record));
        phases.push(PhaseReport {
            phase: Phase::Done,
            tasks: Vec::new(),
        });

        let verdict = Verdict::load(&self.settings.verdict_file());
        info!(passed = verdict.passed, %healing, "Workflow complete");
        WorkflowReport {
            phases,
            healing,
            verdict,
        }
    }

    /// Backlog and architecture from the same spec: concurrently when both
    /// agents allow it, otherwise one after the other.
    async fn planning(&self) -> PhaseReport {
        let spec = read_or_empty(&self.settings.resolve(Path::new("specs/PRIMARY_SPEC.md")));
        let backlog = json!({ "action": "create_backlog", "spec": spec });
        let design = json!({ "action": "design", "spec": spec });

        let parallel = self.settings.workflow.parallel_planning
            && [PRODUCT_OWNER, ARCHITECT]
                .iter()
                .all(|name| self.agent(name).is_none_or(|a| a.config().parallel_safe));

        let tasks = if parallel {
            info!("Planning in parallel");
            let (a, b) = futures::future::join(
                self.task(PRODUCT_OWNER, backlog),
                self.task(ARCHITECT, design),
            )
            .await;
            vec![a, b]
        } else {
            info!("Planning sequentially");
            let a = self.task(PRODUCT_OWNER, backlog).await;
            let b = self.task(ARCHITECT, design).await;
            vec![a, b]
        };
        PhaseReport {
            phase: Phase::Planning,
            tasks,
        }
    }

    /// Ask for fixes until the verdict passes or the iteration bound is hit.
    async fn self_heal(&self) -> (HealingOutcome, Option<PhaseReport>) {
        let verdict_file = self.settings.verdict_file();
        if Verdict::load(&verdict_file).passed {
            return (HealingOutcome::NotNeeded, None);
        }

        let max = self.settings.workflow.max_healing_iterations;
        let mut tasks = Vec::new();
        let mut iterations = 0;
        while iterations < max {
            let record = self
                .task(
                    SELF_HEALING,
                    json!({ "action": "fix", "test_results": read_or_empty(&verdict_file) }),
                )
                .await;
            let skipped = record.outcome == TaskOutcome::Skipped;
            tasks.push(record);
            if skipped {
                break;
            }
            iterations += 1;
            info!(iteration = iterations, max, "Self-healing iteration done");
            if Verdict::load(&verdict_file).passed {
                let report = PhaseReport {
                    phase: Phase::SelfHealing,
                    tasks,
                };
                return (HealingOutcome::Healed { iterations }, Some(report));
            }
        }
        warn!(iterations, "Self-healing exhausted, delivering anyway");
        let report = PhaseReport {
            phase: Phase::SelfHealing,
            tasks,
        };
        (HealingOutcome::Exhausted { iterations }, Some(report))
    }

    /// Route a user command through the lead agent.
    pub async fn handle_user_command(&self, command: &str) -> LeadReply {
        let lead_name = &self.settings.workflow.lead;
        match self.agent(lead_name) {
            Some(lead) => handle_user_command(&lead, command).await,
            None => LeadReply {
                text: format!("{lead_name} agent not found"),
                delegated: Vec::new(),
                refused: Vec::new(),
                is_error: true,
            },
        }
    }

    /// Line-oriented session: `@` commands go to the lead, `exit`/`quit`
    /// ends it.
    pub async fn interactive<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let lead = self.settings.workflow.lead.clone();
        if self.agent(&lead).is_none() {
            writer
                .write_all(format!("{lead} agent not found!\n").as_bytes())
                .await?;
            writer.flush().await?;
            return Ok(());
        }
        writer
            .write_all(format!("Interactive mode - use @{lead} to interact\n").as_bytes())
            .await?;

        let mut lines = reader.lines();
        loop {
            writer.write_all(b"You> ").await?;
            writer.flush().await?;
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let command = line.trim();
            if command.is_empty() {
                continue;
            }
            if command.eq_ignore_ascii_case("exit") || command.eq_ignore_ascii_case("quit") {
                break;
            }
            let out = if command.starts_with('@') {
                let reply = self.handle_user_command(command).await;
                if reply.is_error {
                    format!("{lead} (error)> {}\n", reply.text)
                } else {
                    format!("{lead}> {}\n", reply.text)
                }
            } else {
                format!("Use @{lead} to interact with the system\n")
            };
            writer.write_all(out.as_bytes()).await?;
        }
        writer.write_all(b"Goodbye!\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

fn single(phase: Phase, record: TaskRecord) -> PhaseReport {
    PhaseReport {
        phase,
        tasks: vec![record],
    }
}

fn read_or_empty(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}
