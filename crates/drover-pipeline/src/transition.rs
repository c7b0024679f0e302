//! Static stage transition table.
//!
//! Every stage's successor, retry target, and retry budget is declared
//! here once. Handlers decide *what happened*; this table decides *where
//! that leads*. Nothing else in the crate hardcodes a stage-to-stage hop.

use drover_types::{DroverConfig, Stage, StageOwner};

/// Where a successful run of the stage goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnSuccess {
    Advance(Stage),
    /// Ticket leaves the pipeline entirely (markers and entry flag removed).
    Complete,
    /// Human-owned or terminal: success is not a machine transition.
    None,
}

/// Which configured ceiling bounds retries out of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Budget {
    Plan,
    Implement,
    CiFix,
    Review,
}

impl Budget {
    pub fn ceiling(&self, config: &DroverConfig) -> u32 {
        match self {
            Budget::Plan => config.max_plan_retries,
            Budget::Implement => config.max_implement_retries,
            Budget::CiFix => config.max_ci_fix_retries,
            Budget::Review => config.max_review_retries,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageRule {
    pub owner: StageOwner,
    pub on_success: OnSuccess,
    /// Stage a retryable failure falls back to. `None` means retryable
    /// failures escalate immediately.
    pub retry_from: Option<Stage>,
    pub budget: Option<Budget>,
}

pub const fn rule(stage: Stage) -> StageRule {
    use OnSuccess::{Advance, Complete, None as NoHop};
    use Stage::*;
    match stage {
        Spec => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(SpecReview),
            retry_from: None,
            budget: None,
        },
        SpecReview => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(SpecApproved),
            retry_from: None,
            budget: None,
        },
        SpecApproved => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(BacklogGen),
            retry_from: None,
            budget: None,
        },
        BacklogGen => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(BacklogReview),
            retry_from: None,
            budget: None,
        },
        BacklogReview => StageRule {
            owner: StageOwner::Agent,
            on_success: Complete,
            retry_from: None,
            budget: None,
        },
        Planning => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(PlanReview),
            retry_from: None,
            budget: None,
        },
        PlanReview => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(Plan),
            retry_from: Some(Planning),
            budget: Some(Budget::Plan),
        },
        Plan => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(Implementing),
            retry_from: None,
            budget: None,
        },
        Implementing => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(PrMonitor),
            retry_from: Some(Implementing),
            budget: Some(Budget::Implement),
        },
        PrMonitor => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(SelfReview),
            retry_from: Some(CiFix),
            budget: Some(Budget::CiFix),
        },
        CiFix => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(PrMonitor),
            retry_from: None,
            budget: None,
        },
        SelfReview => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(Review),
            retry_from: Some(Implementing),
            budget: Some(Budget::Implement),
        },
        Review => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(MergeReady),
            retry_from: Some(AddressingReview),
            budget: Some(Budget::Review),
        },
        AddressingReview => StageRule {
            owner: StageOwner::Agent,
            on_success: Advance(PrMonitor),
            retry_from: None,
            budget: None,
        },
        MergeReady => StageRule {
            owner: StageOwner::Human,
            on_success: NoHop,
            retry_from: None,
            budget: None,
        },
        Retro => StageRule {
            owner: StageOwner::Agent,
            on_success: Complete,
            retry_from: None,
            budget: None,
        },
        Stuck => StageRule {
            owner: StageOwner::Human,
            on_success: NoHop,
            retry_from: None,
            budget: None,
        },
    }
}
