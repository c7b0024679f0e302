//! Review path: self-review, the human review gate, comment addressing,
//! and the retrospective.

use async_trait::async_trait;

use drover_agent::{prompts, verdict, AgentTask, AgentVerdict};
use drover_tracker::{CiStatus, PrState, ReviewStatus};
use drover_types::{Result, Stage, StageOutcome, Ticket};

use crate::metrics;

use super::{plan_for, pr_for, run_agent, AgentRun, StageContext, StageHandler};

/// Reviews the PR diff against the plan before asking humans to look.
pub struct SelfReviewHandler;

#[async_trait]
impl StageHandler for SelfReviewHandler {
    fn stage(&self) -> Stage {
        Stage::SelfReview
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let Some(pr) = pr_for(ticket, ctx).await? else {
            return Ok(StageOutcome::escalate("self-review requested but no PR found"));
        };

        let plan = plan_for(ticket, ctx).await?;
        let diff = ctx.tracker.pr_diff(&ticket.id, pr).await?;
        let prompt = prompts::reviewer(&ticket.id, pr, &plan, &diff);
        let task = AgentTask::new("reviewer", prompt);

        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!("reviewer errored: {}", message)))
            }
        };

        match verdict::review_verdict(&report.text) {
            verdict::ReviewVerdict::Clean => {
                if !ctx.rules.notify_team.is_empty() {
                    ctx.tracker
                        .request_review(&ticket.id, pr, &ctx.rules.notify_team)
                        .await?;
                }
                Ok(StageOutcome::advance().with_agent("reviewer", report.cost_usd, report.turns))
            }
            verdict::ReviewVerdict::IssuesFound { summary } => {
                Ok(StageOutcome::retryable(summary)
                    .with_agent("reviewer", report.cost_usd, report.turns))
            }
        }
    }
}

/// Watches the human review gate. Purely a status check.
pub struct ReviewHandler;

#[async_trait]
impl StageHandler for ReviewHandler {
    fn stage(&self) -> Stage {
        Stage::Review
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        if ticket.pr_number.is_none() {
            match ctx.tracker.find_pr(&ticket.id).await? {
                Some((_, PrState::Merged)) => return Ok(StageOutcome::complete()),
                Some((pr, _)) => ticket.pr_number = Some(pr),
                None => return Ok(StageOutcome::pending()),
            }
        }
        let pr = ticket.pr_number.unwrap_or_default();

        match ctx.tracker.review_status(&ticket.id, pr).await? {
            ReviewStatus::Approved => {
                // Only merge-ready once CI is also green.
                match ctx.tracker.ci_status(&ticket.id, pr).await? {
                    CiStatus::Passed => Ok(StageOutcome::advance()),
                    _ => Ok(StageOutcome::pending()),
                }
            }
            ReviewStatus::ChangesRequested | ReviewStatus::Commented => Ok(
                StageOutcome::retryable(format!("review comments to address on PR #{}", pr)),
            ),
            ReviewStatus::Pending => Ok(StageOutcome::pending()),
        }
    }
}

/// Runs the review responder against unresolved review comments.
pub struct AddressingReviewHandler;

#[async_trait]
impl StageHandler for AddressingReviewHandler {
    fn stage(&self) -> Stage {
        Stage::AddressingReview
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let Some(pr) = pr_for(ticket, ctx).await? else {
            return Ok(StageOutcome::escalate("review comments to address but no PR found"));
        };

        let comments = ctx.tracker.pr_review_comments(&ticket.id, pr).await?;
        if comments.is_empty() {
            // Nothing actionable left; fall back into the monitoring loop.
            return Ok(StageOutcome::advance().with_notes("no unresolved review comments"));
        }

        let prompt = prompts::review_responder(&ticket.id, pr, &comments);
        let mut task = AgentTask::new("review-responder", prompt);
        if let Some(dir) = &ticket.work_dir {
            task = task.in_dir(dir);
        }

        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!(
                    "review responder errored: {}",
                    message
                )))
            }
        };

        if report.verdict() == AgentVerdict::Blocked {
            return Ok(StageOutcome::escalate(format!(
                "review comment requires a human decision: {}",
                verdict::marker_reason(&report.text)
            ))
            .with_agent("review-responder", report.cost_usd, report.turns));
        }

        Ok(StageOutcome::advance().with_agent("review-responder", report.cost_usd, report.turns))
    }
}

/// Retrospective over a finished ticket's recorded metrics.
pub struct RetroHandler;

#[async_trait]
impl StageHandler for RetroHandler {
    fn stage(&self) -> Stage {
        Stage::Retro
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let summary = metrics::summarize(ctx.tracker.as_ref(), &ticket.id).await?;
        let plan = plan_for(ticket, ctx).await?;
        let prompt = prompts::retro(&ticket.id, &plan, &summary.render(), &ctx.rules.agent_context);
        let task = AgentTask::new("retro", prompt);

        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!("retro errored: {}", message)))
            }
        };

        let summary_line: String = report.text.chars().take(200).collect();
        ctx.tracker
            .comment(&ticket.id, &format!("Retro complete. {}", summary_line))
            .await?;

        Ok(StageOutcome::complete().with_agent("retro", report.cost_usd, report.turns))
    }
}
