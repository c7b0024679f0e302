//! Implementation path: implementer runs, CI monitoring, and CI fixes.

use async_trait::async_trait;

use drover_agent::{prompts, verdict, AgentTask, AgentVerdict};
use drover_tracker::{CiStatus, PrState};
use drover_types::{Artifact, Result, Stage, StageOutcome, Ticket};

use super::{latest_feedback, plan_for, pr_for, run_agent, AgentRun, StageContext, StageHandler};

/// Runs the implementer against the approved plan; success is a PR.
pub struct ImplementingHandler;

#[async_trait]
impl StageHandler for ImplementingHandler {
    fn stage(&self) -> Stage {
        Stage::Implementing
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let mut plan = plan_for(ticket, ctx).await?;
        if plan.is_empty() {
            return Ok(StageOutcome::escalate("no plan available to implement"));
        }
        if let Some(feedback) = latest_feedback(ticket, ctx).await? {
            plan.push_str(&format!("\n\n## Review Feedback To Address\n{}", feedback));
        }

        let branch = prompts::branch_name(&ctx.rules.branch_pattern, ticket.id.number, &plan);
        let prompt = prompts::implementer(&ticket.id, &plan, &branch, &ctx.rules.agent_context);
        let mut task = AgentTask::new("implementer", prompt);
        if let Some(dir) = &ticket.work_dir {
            task = task.in_dir(dir);
        }

        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::retryable(format!(
                    "implementer errored: {}",
                    message
                )))
            }
        };

        if report.verdict() == AgentVerdict::Blocked {
            return Ok(StageOutcome::retryable(format!(
                "implementation blocked: {}",
                verdict::marker_reason(&report.text)
            ))
            .with_agent("implementer", report.cost_usd, report.turns));
        }

        match verdict::extract_pr_number(&report.text) {
            Some(pr) => {
                ticket.pr_number = Some(pr);
                ctx.tracker
                    .comment(&ticket.id, &format!("PR created: #{}", pr))
                    .await?;
                Ok(StageOutcome::advance()
                    .with_artifact(Artifact::PullRequest(pr))
                    .with_agent("implementer", report.cost_usd, report.turns))
            }
            None => Ok(StageOutcome::escalate(
                "implementer finished but no PR number found in output",
            )
            .with_agent("implementer", report.cost_usd, report.turns)),
        }
    }
}

/// Watches CI on the open PR. Purely a status check.
pub struct PrMonitorHandler;

#[async_trait]
impl StageHandler for PrMonitorHandler {
    fn stage(&self) -> Stage {
        Stage::PrMonitor
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        if ticket.pr_number.is_none() {
            match ctx.tracker.find_pr(&ticket.id).await? {
                Some((pr, PrState::Merged)) => {
                    tracing::info!(ticket = %ticket.id, pr, "PR already merged");
                    return Ok(StageOutcome::complete());
                }
                Some((pr, _)) => ticket.pr_number = Some(pr),
                None => {
                    return Ok(StageOutcome::escalate("PR marker present but no PR found"));
                }
            }
        }
        let pr = ticket.pr_number.unwrap_or_default();

        match ctx.tracker.ci_status(&ticket.id, pr).await? {
            CiStatus::Passed => Ok(StageOutcome::advance()),
            CiStatus::Pending => Ok(StageOutcome::pending()),
            CiStatus::Failed => Ok(StageOutcome::retryable(format!("CI failed on PR #{}", pr))),
        }
    }
}

/// Runs the CI fixer against the failing PR's logs.
pub struct CiFixHandler;

#[async_trait]
impl StageHandler for CiFixHandler {
    fn stage(&self) -> Stage {
        Stage::CiFix
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let Some(pr) = pr_for(ticket, ctx).await? else {
            return Ok(StageOutcome::escalate("CI fix requested but no PR found"));
        };

        let failure_logs = ctx.tracker.ci_failure_logs(&ticket.id, pr).await?;
        let prompt = prompts::ci_fixer(&ticket.id, pr, &failure_logs);
        let mut task = AgentTask::new("ci-fixer", prompt);
        if let Some(dir) = &ticket.work_dir {
            task = task.in_dir(dir);
        }

        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!("CI fixer errored: {}", message)))
            }
        };

        if report.verdict() == AgentVerdict::Blocked {
            return Ok(StageOutcome::escalate(format!(
                "CI fix blocked: {}",
                verdict::marker_reason(&report.text)
            ))
            .with_agent("ci-fixer", report.cost_usd, report.turns));
        }

        Ok(StageOutcome::advance().with_agent("ci-fixer", report.cost_usd, report.turns))
    }
}
