//! Planning path: plan generation, the quality gate, and the approved-plan
//! checkpoint.

use async_trait::async_trait;

use drover_agent::{prompts, verdict, AgentTask, AgentVerdict};
use drover_types::{Artifact, Result, Stage, StageOutcome, Ticket};

use super::{latest_feedback, plan_for, run_agent, AgentRun, StageContext, StageHandler};

/// Runs the planner against the issue and records the plan on the ticket.
pub struct PlanningHandler;

#[async_trait]
impl StageHandler for PlanningHandler {
    fn stage(&self) -> Stage {
        Stage::Planning
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let issue = ctx.tracker.issue(&ticket.id).await?;
        let mut description = issue.body;
        if let Some(feedback) = latest_feedback(ticket, ctx).await? {
            description.push_str(&format!("\n\n## Previous Plan Feedback\n{}", feedback));
        }

        let prompt = prompts::planner(&ticket.id, &description, &ctx.rules.agent_context);
        let task = AgentTask::new("planner", prompt);
        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!("planner errored: {}", message)))
            }
        };

        if report.verdict() == AgentVerdict::NeedsInput {
            return Ok(StageOutcome::escalate(format!(
                "planner needs more input: {}",
                verdict::marker_reason(&report.text)
            ))
            .with_agent("planner", report.cost_usd, report.turns));
        }

        let plan = report.text.trim().to_string();
        if plan.is_empty() {
            return Ok(StageOutcome::escalate("planner produced no plan output")
                .with_agent("planner", report.cost_usd, report.turns));
        }

        // Persisted as a comment so later cycles can recover it.
        ctx.tracker
            .comment(&ticket.id, &format!("## Development Plan\n\n{}", plan))
            .await?;
        ticket.plan = Some(plan.clone());

        Ok(StageOutcome::advance()
            .with_artifact(Artifact::Plan(plan))
            .with_agent("planner", report.cost_usd, report.turns))
    }
}

/// Quality gate over the plan.
pub struct PlanReviewHandler;

#[async_trait]
impl StageHandler for PlanReviewHandler {
    fn stage(&self) -> Stage {
        Stage::PlanReview
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let plan = plan_for(ticket, ctx).await?;
        if plan.is_empty() {
            return Ok(StageOutcome::escalate("no plan recorded for review"));
        }
        let issue = ctx.tracker.issue(&ticket.id).await?;

        let prompt = prompts::quality_gate(&ticket.id, &plan, &issue.body);
        let task = AgentTask::new("quality-gate", prompt);
        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!(
                    "quality gate errored: {}",
                    message
                )))
            }
        };

        let outcome = match verdict::quality_verdict(&report.text) {
            verdict::QualityVerdict::Pass => StageOutcome::advance(),
            verdict::QualityVerdict::FailRetryable { feedback } => StageOutcome::retryable(feedback),
            verdict::QualityVerdict::FailEscalate { reason } => StageOutcome::escalate(format!(
                "quality gate escalated: {}",
                reason
            )),
        };
        Ok(outcome.with_agent("quality-gate", report.cost_usd, report.turns))
    }
}

/// Approved-plan checkpoint: confirm the plan is still recoverable before
/// handing it to the implementer.
pub struct PlanHandler;

#[async_trait]
impl StageHandler for PlanHandler {
    fn stage(&self) -> Stage {
        Stage::Plan
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let plan = plan_for(ticket, ctx).await?;
        if plan.is_empty() {
            return Ok(StageOutcome::escalate("approved plan not found on ticket"));
        }
        ticket.plan = Some(plan);
        Ok(StageOutcome::advance())
    }
}
