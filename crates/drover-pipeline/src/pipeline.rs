//! The stage dispatcher.
//!
//! Routes a ticket to its stage handler, classifies the result through the
//! static transition table, and applies it: marker swaps, retry
//! accounting, escalation, and the metrics comment. The only component
//! that writes stage markers.

use drover_tracker::MarkerSwap;
use drover_types::{OutcomeKind, Result, Stage, StageOutcome, Ticket};

use crate::events::{DroverEvent, EventEmitter};
use crate::handlers::{HandlerRegistry, StageContext};
use crate::metrics::StageRecord;
use crate::retry::{should_retry, RetryLedger};
use crate::transition::{rule, OnSuccess};

pub struct Pipeline {
    registry: HandlerRegistry,
    ledger: RetryLedger,
    events: EventEmitter,
}

/// Stage name as recorded in metrics comments ("plan_review", not the
/// tracker marker).
fn slug(stage: Stage) -> String {
    serde_json::to_value(stage)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| stage.to_string())
}

impl Pipeline {
    pub fn new(events: EventEmitter) -> Self {
        Self {
            registry: HandlerRegistry::with_defaults(),
            ledger: RetryLedger::new(),
            events,
        }
    }

    pub fn with_registry(registry: HandlerRegistry, events: EventEmitter) -> Self {
        Self {
            registry,
            ledger: RetryLedger::new(),
            events,
        }
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    /// Push one ticket through exactly one stage.
    ///
    /// Rate-limit and fatal errors propagate to the caller; everything
    /// else resolves to an applied [`StageOutcome`].
    pub async fn handle(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let Some(stage) = ticket.stage() else {
            return self.bootstrap(ticket, ctx).await;
        };

        if !stage.is_actionable() {
            tracing::debug!(ticket = %ticket.id, %stage, "human-owned stage, nothing to do");
            return Ok(StageOutcome::pending());
        }

        let handler = self
            .registry
            .get(stage)
            .ok_or(drover_types::DroverError::NoHandler {
                stage: stage.to_string(),
            })?;

        let outcome = handler.run(ticket, ctx).await?;
        self.apply(ticket, ctx, stage, outcome).await
    }

    /// Entry-flagged ticket without a stage marker: assign the first stage.
    /// Engineering-repo tickets start on the spec path, everything else
    /// goes straight to planning.
    async fn bootstrap(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        if !ticket.entry_flag {
            // Stage marker without the entry flag is an operator edit;
            // surface it, never repair it.
            tracing::warn!(ticket = %ticket.id, "markerless ticket without entry flag, skipping");
            return Ok(StageOutcome::pending());
        }

        let first = if ticket.id.repo == ctx.config.engineering_repo {
            Stage::Spec
        } else {
            Stage::Planning
        };
        ctx.tracker.add_marker(&ticket.id, first.as_marker()).await?;
        ticket.markers.insert(first.as_marker().to_string());
        tracing::info!(ticket = %ticket.id, stage = %first, "ticket entered the pipeline");
        Ok(StageOutcome::pending().with_notes(format!("bootstrapped to {}", first)))
    }

    async fn apply(
        &self,
        ticket: &mut Ticket,
        ctx: &StageContext,
        stage: Stage,
        outcome: StageOutcome,
    ) -> Result<StageOutcome> {
        let stage_rule = rule(stage);
        let mut record = StageRecord::now(&slug(stage));
        record.agent = outcome.agent.clone();
        record.cost_usd = outcome.cost_usd;
        record.turns = outcome.turns;

        match outcome.kind.clone() {
            OutcomeKind::Pending => {
                // Idempotent by construction: nothing written, nothing counted.
                return Ok(outcome);
            }
            OutcomeKind::Advance => match stage_rule.on_success {
                OnSuccess::Advance(next) => {
                    if !self.swap(ticket, ctx, stage, next).await? {
                        return Ok(conflict_outcome(ticket, stage));
                    }
                    if stage_rule.budget.is_some() {
                        self.ledger.reset(&ticket.id, stage);
                    }
                    self.events.emit(DroverEvent::StageCompleted {
                        ticket: ticket.id.to_string(),
                        stage: slug(stage),
                        outcome: "advance".into(),
                    });
                }
                OnSuccess::Complete => return self.finish(ticket, ctx, stage, outcome, record).await,
                OnSuccess::None => {
                    tracing::warn!(ticket = %ticket.id, %stage, "advance from a human-owned stage ignored");
                    return Ok(StageOutcome::pending());
                }
            },
            OutcomeKind::Complete => {
                return self.finish(ticket, ctx, stage, outcome, record).await;
            }
            OutcomeKind::Retryable { feedback } => {
                let (Some(budget), Some(retry_from)) = (stage_rule.budget, stage_rule.retry_from)
                else {
                    return self
                        .escalate(ticket, ctx, stage, &feedback, outcome, record)
                        .await;
                };
                let count = self.ledger.count(&ticket.id, stage) + 1;
                record.retry_number = count;
                if !should_retry(budget.ceiling(&ctx.config), count) {
                    let reason = format!("retry limit exceeded at {}: {}", slug(stage), feedback);
                    return self.escalate(ticket, ctx, stage, &reason, outcome, record).await;
                }
                if !self.swap(ticket, ctx, stage, retry_from).await? {
                    // A stale read consumes no budget.
                    return Ok(conflict_outcome(ticket, stage));
                }
                self.ledger.record_failure(&ticket.id, stage);
                ctx.tracker
                    .comment(&ticket.id, &format!("## Retry Feedback\n\n{}", feedback))
                    .await?;
                self.events.emit(DroverEvent::TicketRetried {
                    ticket: ticket.id.to_string(),
                    stage: slug(stage),
                    retry_number: count,
                });
                tracing::info!(
                    ticket = %ticket.id,
                    from = %stage,
                    to = %retry_from,
                    retry_number = count,
                    "retrying"
                );
            }
            OutcomeKind::Escalate { reason } => {
                return self.escalate(ticket, ctx, stage, &reason, outcome, record).await;
            }
        }

        ctx.tracker.comment(&ticket.id, &record.to_comment()).await?;
        Ok(outcome)
    }

    /// Remove the ticket from the pipeline: stage marker and entry flag off.
    async fn finish(
        &self,
        ticket: &mut Ticket,
        ctx: &StageContext,
        stage: Stage,
        outcome: StageOutcome,
        record: StageRecord,
    ) -> Result<StageOutcome> {
        ctx.tracker
            .remove_marker(&ticket.id, stage.as_marker())
            .await?;
        ctx.tracker
            .remove_marker(&ticket.id, &ctx.rules.entry_label)
            .await?;
        self.ledger.forget(&ticket.id);
        ctx.tracker.comment(&ticket.id, &record.to_comment()).await?;
        self.events.emit(DroverEvent::TicketCompleted {
            ticket: ticket.id.to_string(),
        });
        tracing::info!(ticket = %ticket.id, %stage, "ticket complete");
        Ok(outcome)
    }

    /// Unconditional transition to the terminal escalation stage.
    async fn escalate(
        &self,
        ticket: &mut Ticket,
        ctx: &StageContext,
        stage: Stage,
        reason: &str,
        outcome: StageOutcome,
        mut record: StageRecord,
    ) -> Result<StageOutcome> {
        if !self.swap(ticket, ctx, stage, Stage::Stuck).await? {
            return Ok(conflict_outcome(ticket, stage));
        }
        record.was_stuck = true;
        record.stuck_reason = Some(reason.to_string());

        ctx.tracker
            .comment(&ticket.id, &format!("Stuck: {}", reason))
            .await?;
        if !ctx.rules.notify_team.is_empty() {
            ctx.tracker
                .mention(
                    &ticket.id,
                    &ctx.rules.notify_team,
                    &format!("this ticket needs attention: {}", reason),
                )
                .await?;
        }
        self.ledger.forget(&ticket.id);
        ctx.tracker.comment(&ticket.id, &record.to_comment()).await?;
        self.events.emit(DroverEvent::TicketEscalated {
            ticket: ticket.id.to_string(),
            stage: slug(stage),
            reason: reason.to_string(),
        });
        tracing::warn!(ticket = %ticket.id, %stage, reason, "ticket stuck");
        Ok(outcome)
    }

    /// Read-modify-write of the stage marker. `false` means the marker
    /// moved underneath us; the next cycle re-derives from tracker truth.
    async fn swap(
        &self,
        ticket: &mut Ticket,
        ctx: &StageContext,
        from: Stage,
        to: Stage,
    ) -> Result<bool> {
        match ctx
            .tracker
            .swap_marker(&ticket.id, from.as_marker(), to.as_marker())
            .await?
        {
            MarkerSwap::Applied => {
                ticket.markers.remove(from.as_marker());
                ticket.markers.insert(to.as_marker().to_string());
                Ok(true)
            }
            MarkerSwap::Conflict => Ok(false),
        }
    }
}

fn conflict_outcome(ticket: &Ticket, stage: Stage) -> StageOutcome {
    tracing::warn!(
        ticket = %ticket.id,
        %stage,
        "stage marker changed underneath us, deferring to next cycle"
    );
    StageOutcome::pending().with_notes("marker conflict")
}
