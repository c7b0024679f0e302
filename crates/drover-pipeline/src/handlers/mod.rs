//! Stage handlers.
//!
//! Each handler performs exactly one external operation (one agent run or
//! one status check) and classifies what happened as a [`StageOutcome`].
//! All marker writes, retry accounting, and escalations happen in the
//! dispatcher, never here.

mod implement;
mod planning;
mod review;
mod spec_path;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use drover_agent::Agent;
use drover_tracker::Tracker;
use drover_types::{DroverConfig, Result, Stage, StageOutcome, Ticket};

use crate::rules::ResolvedRules;

pub use implement::{CiFixHandler, ImplementingHandler, PrMonitorHandler};
pub use planning::{PlanHandler, PlanReviewHandler, PlanningHandler};
pub use review::{AddressingReviewHandler, RetroHandler, ReviewHandler, SelfReviewHandler};
pub use spec_path::{
    BacklogGenHandler, BacklogReviewHandler, SpecApprovedHandler, SpecHandler, SpecReviewHandler,
};

/// Everything a handler may touch.
pub struct StageContext {
    pub tracker: Arc<dyn Tracker>,
    pub agent: Arc<dyn Agent>,
    pub config: DroverConfig,
    pub rules: ResolvedRules,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome>;
}

/// Maps actionable stages to their handlers.
pub struct HandlerRegistry {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(handler.stage(), handler);
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(&stage).cloned()
    }

    /// All built-in handlers. Human-owned stages have none.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SpecHandler));
        registry.register(Arc::new(SpecReviewHandler));
        registry.register(Arc::new(SpecApprovedHandler));
        registry.register(Arc::new(BacklogGenHandler));
        registry.register(Arc::new(BacklogReviewHandler));
        registry.register(Arc::new(PlanningHandler));
        registry.register(Arc::new(PlanReviewHandler));
        registry.register(Arc::new(PlanHandler));
        registry.register(Arc::new(ImplementingHandler));
        registry.register(Arc::new(PrMonitorHandler));
        registry.register(Arc::new(CiFixHandler));
        registry.register(Arc::new(SelfReviewHandler));
        registry.register(Arc::new(ReviewHandler));
        registry.register(Arc::new(AddressingReviewHandler));
        registry.register(Arc::new(RetroHandler));
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Agent run collapsed to "report" or "failed": rate limits and fatal
/// errors propagate, everything else becomes a stage-level failure the
/// handler classifies.
pub(crate) enum AgentRun {
    Report(drover_agent::AgentReport),
    Failed(String),
}

pub(crate) async fn run_agent(
    ctx: &StageContext,
    task: &drover_agent::AgentTask,
) -> Result<AgentRun> {
    match ctx.agent.invoke(task).await {
        Ok(report) => Ok(AgentRun::Report(report)),
        Err(err) if err.is_rate_limit() || err.is_fatal() => Err(err),
        Err(err) => {
            tracing::warn!(agent = %task.agent, error = %err, "agent run failed");
            Ok(AgentRun::Failed(err.to_string()))
        }
    }
}

/// Latest feedback comment posted by the dispatcher for a retry, if any.
pub(crate) async fn latest_feedback(ticket: &Ticket, ctx: &StageContext) -> Result<Option<String>> {
    let comments = ctx.tracker.comments(&ticket.id).await?;
    Ok(comments.iter().rev().find_map(|comment| {
        comment
            .strip_prefix("## Retry Feedback")
            .map(|rest| rest.trim().to_string())
    }))
}

/// Cached plan text, falling back to the latest plan comment on the ticket.
pub(crate) async fn plan_for(ticket: &Ticket, ctx: &StageContext) -> Result<String> {
    if let Some(plan) = &ticket.plan {
        return Ok(plan.clone());
    }
    let comments = ctx.tracker.comments(&ticket.id).await?;
    for comment in comments.iter().rev() {
        if let Some(rest) = comment.strip_prefix("## Development Plan") {
            return Ok(rest.trim().to_string());
        }
    }
    Ok(String::new())
}

/// Cached PR number, falling back to a tracker search; `Ok(None)` when the
/// PR has already merged and the stage marker should simply come off.
pub(crate) async fn pr_for(ticket: &mut Ticket, ctx: &StageContext) -> Result<Option<u64>> {
    if let Some(pr) = ticket.pr_number {
        return Ok(Some(pr));
    }
    match ctx.tracker.find_pr(&ticket.id).await? {
        Some((pr, _)) => {
            tracing::info!(ticket = %ticket.id, pr, "discovered PR from tracker");
            ticket.pr_number = Some(pr);
            Ok(Some(pr))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_types::StageOwner;

    #[test]
    fn defaults_cover_every_agent_stage() {
        let registry = HandlerRegistry::with_defaults();
        for stage in Stage::ALL {
            match stage.owner() {
                StageOwner::Agent => {
                    assert!(registry.get(stage).is_some(), "missing handler for {stage}")
                }
                StageOwner::Human => {
                    assert!(registry.get(stage).is_none(), "unexpected handler for {stage}")
                }
            }
        }
    }

    #[test]
    fn registered_handlers_answer_for_their_stage() {
        let registry = HandlerRegistry::with_defaults();
        let handler = registry.get(Stage::Planning).unwrap();
        assert_eq!(handler.stage(), Stage::Planning);
    }
}
