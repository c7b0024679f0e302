//! Outcome of handling a ticket at one stage.

use serde::{Deserialize, Serialize};

/// An artifact produced while handling a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    PullRequest(u64),
    Plan(String),
    Text(String),
}

/// How the handler result classifies against the stage's transition rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OutcomeKind {
    /// Advance to the stage's declared successor; retry counter resets.
    Advance,
    /// Consume one unit of retry budget and fall back to the declared
    /// retry-from stage, carrying feedback for the re-run.
    Retryable { feedback: String },
    /// Unconditional transition to the terminal escalation stage.
    Escalate { reason: String },
    /// The awaited external condition has not resolved; no state change.
    Pending,
    /// The ticket leaves the pipeline: stage marker and entry flag removed.
    Complete,
}

/// What a stage handler returns to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub kind: OutcomeKind,
    pub artifact: Option<Artifact>,
    /// Free-form note recorded in the stage metrics comment.
    pub notes: String,
    /// Agent that ran for this stage, if any, with its spend.
    pub agent: Option<String>,
    pub cost_usd: f64,
    pub turns: u32,
}

impl StageOutcome {
    fn of(kind: OutcomeKind) -> Self {
        Self {
            kind,
            artifact: None,
            notes: String::new(),
            agent: None,
            cost_usd: 0.0,
            turns: 0,
        }
    }

    pub fn advance() -> Self {
        Self::of(OutcomeKind::Advance)
    }

    pub fn retryable(feedback: impl Into<String>) -> Self {
        Self::of(OutcomeKind::Retryable {
            feedback: feedback.into(),
        })
    }

    pub fn escalate(reason: impl Into<String>) -> Self {
        Self::of(OutcomeKind::Escalate {
            reason: reason.into(),
        })
    }

    pub fn pending() -> Self {
        Self::of(OutcomeKind::Pending)
    }

    pub fn complete() -> Self {
        Self::of(OutcomeKind::Complete)
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifact = Some(artifact);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    /// Attach the agent name and spend from its report.
    pub fn with_agent(mut self, agent: impl Into<String>, cost_usd: f64, turns: u32) -> Self {
        self.agent = Some(agent.into());
        self.cost_usd = cost_usd;
        self.turns = turns;
        self
    }
}
