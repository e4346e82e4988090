//! Workflow phases and the report a run produces.

use foreman_sdk::Verdict;

/// Delivery pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    MetaOrchestration,
    Research,
    Specification,
    Planning,
    Testing,
    SelfHealing,
    Delivery,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::MetaOrchestration => write!(f, "meta-orchestration"),
            Phase::Research => write!(f, "research"),
            Phase::Specification => write!(f, "specification"),
            Phase::Planning => write!(f, "planning"),
            Phase::Testing => write!(f, "testing"),
            Phase::SelfHealing => write!(f, "self-healing"),
            Phase::Delivery => write!(f, "delivery"),
            Phase::Done => write!(f, "done"),
        }
    }
}

/// How one request to one agent ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Responded { text: String },
    /// The agent answered with an error message, or the request could not
    /// be delivered.
    Failed { error: String },
    /// The agent is not on the roster; nothing was sent.
    Skipped,
    TimedOut,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Responded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Responded { .. } => "responded",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::Skipped => "skipped",
            TaskOutcome::TimedOut => "timed out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub agent: String,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub tasks: Vec<TaskRecord>,
}

/// Result of the bounded self-healing loop. Exhaustion is an outcome, not
/// an error: delivery runs either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealingOutcome {
    /// Tests were already green after the testing phase.
    NotNeeded,
    Healed { iterations: u32 },
    Exhausted { iterations: u32 },
}

impl std::fmt::Display for HealingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealingOutcome::NotNeeded => write!(f, "not needed"),
            HealingOutcome::Healed { iterations } => {
                write!(f, "healed after {iterations} iteration(s)")
            }
            HealingOutcome::Exhausted { iterations } => {
                write!(f, "exhausted after {iterations} iteration(s)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReport {
    pub phases: Vec<PhaseReport>,
    pub healing: HealingOutcome,
    pub verdict: Verdict,
}

impl WorkflowReport {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    /// Phases in the order they ran, ending with [`Phase::Done`].
    pub fn phase_order(&self) -> Vec<Phase> {
        self.phases.iter().map(|p| p.phase).collect()
    }

    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    /// Plain-text summary, one line per task.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for report in &self.phases {
            if report.tasks.is_empty() {
                out.push_str(&format!("{}\n", report.phase));
                continue;
            }
            for task in &report.tasks {
                let detail = match &task.outcome {
                    TaskOutcome::Failed { error } => format!(": {error}"),
                    _ => String::new(),
                };
                out.push_str(&format!(
                    "{:<20} {:<14} {}{}\n",
                    report.phase,
                    task.agent,
                    task.outcome.label(),
                    detail
                ));
            }
        }
        out.push_str(&format!("self-healing: {}\n", self.healing));
        out.push_str(&format!(
            "tests: {}\n",
            if self.verdict.passed { "passing" } else { "failing" }
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_tasks_and_outcome() {
        let report = WorkflowReport {
            phases: vec![
                PhaseReport {
                    phase: Phase::Research,
                    tasks: vec![TaskRecord {
                        agent: "Researcher".into(),
                        outcome: TaskOutcome::Responded { text: "done".into() },
                    }],
                },
                PhaseReport {
                    phase: Phase::Testing,
                    tasks: vec![TaskRecord {
                        agent: "QA".into(),
                        outcome: TaskOutcome::Failed {
                            error: "model unavailable".into(),
                        },
                    }],
                },
                PhaseReport {
                    phase: Phase::Done,
                    tasks: vec![],
                },
            ],
            healing: HealingOutcome::Exhausted { iterations: 5 },
            verdict: Verdict::default(),
        };
        let summary = report.summary();
        assert!(summary.contains("Researcher"));
        assert!(summary.contains("failed: model unavailable"));
        assert!(summary.contains("exhausted after 5 iteration(s)"));
        assert!(summary.ends_with("tests: failing\n"));
        assert_eq!(
            report.phase_order(),
            vec![Phase::Research, Phase::Testing, Phase::Done]
        );
        assert!(!report.passed());
    }
}
