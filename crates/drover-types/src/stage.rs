//! The pipeline stage enumeration.
//!
//! Stages are represented externally as mutable tracker markers (labels).
//! Conversion between marker strings and `Stage` happens only at the tracker
//! adapter boundary — everything above it works with the enum.

use serde::{Deserialize, Serialize};

/// Who acts on a ticket sitting at a given stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOwner {
    Agent,
    Human,
}

/// One discrete state in the pipeline.
///
/// A ticket carries exactly one stage marker at a time, alongside the
/// permanent entry flag. All stages except [`Stage::Stuck`] are mutable by
/// the engine; `Stuck` and `MergeReady` wait on a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    // Spec-driven path (engineering repo tickets)
    Spec,
    SpecReview,
    SpecApproved,
    BacklogGen,
    BacklogReview,
    // Dev planning & implementation path
    Planning,
    PlanReview,
    Plan,
    Implementing,
    PrMonitor,
    CiFix,
    SelfReview,
    Review,
    AddressingReview,
    MergeReady,
    Retro,
    Stuck,
}

impl Stage {
    pub const ALL: [Stage; 17] = [
        Stage::Spec,
        Stage::SpecReview,
        Stage::SpecApproved,
        Stage::BacklogGen,
        Stage::BacklogReview,
        Stage::Planning,
        Stage::PlanReview,
        Stage::Plan,
        Stage::Implementing,
        Stage::PrMonitor,
        Stage::CiFix,
        Stage::SelfReview,
        Stage::Review,
        Stage::AddressingReview,
        Stage::MergeReady,
        Stage::Retro,
        Stage::Stuck,
    ];

    /// The external marker string for this stage.
    pub fn as_marker(&self) -> &'static str {
        match self {
            Stage::Spec => "agentSpec",
            Stage::SpecReview => "agentSpecReview",
            Stage::SpecApproved => "agentSpecApproved",
            Stage::BacklogGen => "agentBacklogGen",
            Stage::BacklogReview => "agentBacklogReview",
            Stage::Planning => "agentPlanning",
            Stage::PlanReview => "agentPlanReview",
            Stage::Plan => "agentPlan",
            Stage::Implementing => "agentImplementing",
            Stage::PrMonitor => "agentPR",
            Stage::CiFix => "agentCIFix",
            Stage::SelfReview => "agentSelfReview",
            Stage::Review => "agentReview",
            Stage::AddressingReview => "agentAddressingReview",
            Stage::MergeReady => "agentMergeReady",
            Stage::Retro => "agentRetro",
            Stage::Stuck => "agentStuck",
        }
    }

    /// Parse an external marker string. Unknown markers return `None`.
    pub fn from_marker(marker: &str) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| s.as_marker() == marker)
    }

    /// Which actor owns tickets at this stage.
    pub fn owner(&self) -> StageOwner {
        match self {
            Stage::MergeReady | Stage::Stuck => StageOwner::Human,
            _ => StageOwner::Agent,
        }
    }

    /// The terminal escalation stage requiring human intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Stuck)
    }

    /// Whether the scheduler may dispatch a ticket sitting at this stage.
    pub fn is_actionable(&self) -> bool {
        self.owner() == StageOwner::Agent
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_marker())
    }
}
