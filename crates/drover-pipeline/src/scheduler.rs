//! The polling scheduler.
//!
//! Single-threaded dispatch loop: discovery, candidate filtering, and the
//! in-flight check-and-set all happen inside one task, so no ticket can be
//! dispatched twice. Units run on `tokio::spawn` and report back over an
//! mpsc channel; the loop is the only writer of the rate-limit guard.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use drover_agent::Agent;
use drover_tracker::Tracker;
use drover_types::{DroverConfig, DroverError, Result, StageOutcome, Ticket, TicketId};

use crate::events::{DroverEvent, EventEmitter};
use crate::guard::RateLimitGuard;
use crate::handlers::StageContext;
use crate::pipeline::Pipeline;
use crate::rules;
use crate::workspace;

struct UnitDone {
    id: TicketId,
    rate_limited: bool,
    fatal: Option<DroverError>,
}

pub struct Scheduler {
    tracker: Arc<dyn Tracker>,
    agent: Arc<dyn Agent>,
    config: DroverConfig,
    pipeline: Arc<Pipeline>,
    events: EventEmitter,
    guard: RateLimitGuard,
    in_flight: HashSet<TicketId>,
}

impl Scheduler {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        agent: Arc<dyn Agent>,
        config: DroverConfig,
        events: EventEmitter,
    ) -> Self {
        let guard = RateLimitGuard::from_config(&config);
        let pipeline = Arc::new(Pipeline::new(events.clone()));
        Self {
            tracker,
            agent,
            config,
            pipeline,
            events,
            guard,
            in_flight: HashSet::new(),
        }
    }

    /// Poll and dispatch until `shutdown` flips. In-flight units run to
    /// completion; only dispatching stops.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            poll_interval_secs = self.config.poll_interval_secs,
            "scheduler started"
        );
        let (tx, mut rx) = mpsc::unbounded_channel::<UnitDone>();

        while !*shutdown.borrow() {
            if let Some(fatal) = self.drain_completions(&mut rx) {
                return Err(fatal);
            }

            if let Some(remaining) = self.guard.backoff_remaining(Instant::now()) {
                tracing::info!(remaining_secs = remaining.as_secs(), "backing off, skipping poll");
                let wait = remaining.min(self.config.poll_interval());
                if sleep_or_shutdown(wait, &mut shutdown).await {
                    break;
                }
                continue;
            }

            match self.poll_and_dispatch(&tx).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, "discovery failed, backing off");
                    let delay = self.guard.on_rate_limit(Instant::now());
                    self.events.emit(DroverEvent::RateLimitBackoff {
                        streak: self.guard.streak(),
                        delay_secs: delay.as_secs(),
                    });
                }
            }

            if sleep_or_shutdown(self.config.poll_interval(), &mut shutdown).await {
                break;
            }
        }

        // Graceful shutdown: no mid-write aborts.
        tracing::info!(in_flight = self.in_flight.len(), "scheduler stopping");
        while !self.in_flight.is_empty() {
            match rx.recv().await {
                Some(done) => {
                    self.in_flight.remove(&done.id);
                }
                None => break,
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }

    /// Pull every queued unit completion and update the guard. Returns the
    /// fatal error to exit with, if a unit hit one.
    fn drain_completions(&mut self, rx: &mut mpsc::UnboundedReceiver<UnitDone>) -> Option<DroverError> {
        let mut saw_completion = false;
        let mut saw_rate_limit = false;
        while let Ok(done) = rx.try_recv() {
            self.in_flight.remove(&done.id);
            saw_completion = true;
            if let Some(fatal) = done.fatal {
                return Some(fatal);
            }
            if done.rate_limited {
                saw_rate_limit = true;
                let delay = self.guard.on_rate_limit(Instant::now());
                self.events.emit(DroverEvent::RateLimitBackoff {
                    streak: self.guard.streak(),
                    delay_secs: delay.as_secs(),
                });
            }
        }
        if saw_completion && !saw_rate_limit {
            if let Some(cooldown) = self.guard.on_clean_cycle(Instant::now()) {
                self.events.emit(DroverEvent::CooldownEntered {
                    cooldown_secs: cooldown.as_secs(),
                });
            }
        }
        None
    }

    async fn poll_and_dispatch(&mut self, tx: &mpsc::UnboundedSender<UnitDone>) -> Result<()> {
        let snapshots = self
            .tracker
            .find_actionable(&self.config.org, &self.config.entry_label)
            .await?;
        self.events.emit(DroverEvent::CycleStarted {
            actionable: snapshots.len(),
            in_flight: self.in_flight.len(),
        });

        for snapshot in snapshots {
            if self.in_flight.len() >= self.config.max_concurrent {
                tracing::debug!("concurrency cap reached, deferring remaining candidates");
                break;
            }
            let ticket = snapshot.into_ticket(&self.config.entry_label);
            if self.in_flight.contains(&ticket.id) {
                continue;
            }
            match ticket.stage() {
                Some(stage) if !stage.is_actionable() => continue,
                None if !ticket.entry_flag => {
                    tracing::warn!(ticket = %ticket.id, "markerless ticket without entry flag, skipping");
                    continue;
                }
                _ => {}
            }

            self.in_flight.insert(ticket.id.clone());
            self.events.emit(DroverEvent::TicketDispatched {
                ticket: ticket.id.to_string(),
                stage: ticket
                    .stage()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "bootstrap".into()),
            });
            self.spawn_unit(ticket, tx.clone());
        }

        // A successful discovery with nothing in flight is itself a clean
        // cycle; with units in flight their completions decide instead.
        if self.in_flight.is_empty() {
            if let Some(cooldown) = self.guard.on_clean_cycle(Instant::now()) {
                self.events.emit(DroverEvent::CooldownEntered {
                    cooldown_secs: cooldown.as_secs(),
                });
            }
        }
        Ok(())
    }

    fn spawn_unit(&self, mut ticket: Ticket, tx: mpsc::UnboundedSender<UnitDone>) {
        let tracker = Arc::clone(&self.tracker);
        let agent = Arc::clone(&self.agent);
        let config = self.config.clone();
        let pipeline = Arc::clone(&self.pipeline);

        tokio::spawn(async move {
            let id = ticket.id.clone();
            let result = run_unit(&pipeline, tracker, agent, config, &mut ticket).await;
            let done = match result {
                Ok(_) => UnitDone {
                    id,
                    rate_limited: false,
                    fatal: None,
                },
                Err(err) if err.is_fatal() => UnitDone {
                    id,
                    rate_limited: false,
                    fatal: Some(err),
                },
                Err(err) if err.is_rate_limit() => {
                    tracing::warn!(ticket = %ticket.id, error = %err, "unit hit a rate limit");
                    UnitDone {
                        id,
                        rate_limited: true,
                        fatal: None,
                    }
                }
                Err(err) => {
                    tracing::error!(ticket = %ticket.id, error = %err, "unit failed");
                    UnitDone {
                        id,
                        rate_limited: false,
                        fatal: None,
                    }
                }
            };
            // The receiver only drops after the loop has exited.
            let _ = tx.send(done);
        });
    }
}

async fn run_unit(
    pipeline: &Pipeline,
    tracker: Arc<dyn Tracker>,
    agent: Arc<dyn Agent>,
    config: DroverConfig,
    ticket: &mut Ticket,
) -> Result<StageOutcome> {
    let rules = rules::load_rules(tracker.as_ref(), &ticket.id.owner, &ticket.id.repo, &config).await?;
    ticket.work_dir = workspace::ensure_workspace(&config, &ticket.id).await?;
    let ctx = StageContext {
        tracker,
        agent,
        config,
        rules,
    };
    pipeline.handle(ticket, &ctx).await
}

/// Drive a single ticket through exactly one stage, outside the loop.
pub async fn step_ticket(
    tracker: Arc<dyn Tracker>,
    agent: Arc<dyn Agent>,
    config: DroverConfig,
    id: &TicketId,
) -> Result<StageOutcome> {
    let markers = tracker.markers(id).await?;
    let issue = tracker.issue(id).await?;
    let mut ticket = Ticket {
        id: id.clone(),
        entry_flag: markers.contains(&config.entry_label),
        markers,
        title: issue.title,
        pr_number: None,
        plan: None,
        work_dir: None,
    };

    let pipeline = Pipeline::new(EventEmitter::default());
    run_unit(&pipeline, tracker, agent, config, &mut ticket).await
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use drover_agent::ScriptedAgent;
    use drover_tracker::MemoryTracker;

    fn idle_scheduler() -> Scheduler {
        let config = DroverConfig {
            org: "acme".into(),
            clone_workspaces: false,
            ..DroverConfig::default()
        };
        Scheduler::new(
            Arc::new(MemoryTracker::new()),
            Arc::new(ScriptedAgent::new()),
            config,
            EventEmitter::default(),
        )
    }

    #[tokio::test]
    async fn idle_clean_poll_ends_a_rate_limit_streak() {
        let mut scheduler = idle_scheduler();
        let (tx, _rx) = mpsc::unbounded_channel();

        // Two discovery-driven signals double the delay.
        let now = Instant::now();
        assert_eq!(scheduler.guard.on_rate_limit(now).as_secs(), 60);
        assert_eq!(scheduler.guard.on_rate_limit(now).as_secs(), 120);

        // A successful poll with an empty tracker and nothing in flight
        // ends the streak and holds the cooldown window.
        scheduler.poll_and_dispatch(&tx).await.unwrap();
        assert_eq!(scheduler.guard.streak(), 0);
        assert!(scheduler.guard.backoff_remaining(Instant::now()).is_some());

        // A later isolated signal backs off at the base delay again.
        let later = Instant::now() + Duration::from_secs(1000);
        assert_eq!(scheduler.guard.on_rate_limit(later).as_secs(), 60);
    }

    #[tokio::test]
    async fn clean_poll_without_a_streak_is_a_no_op() {
        let mut scheduler = idle_scheduler();
        let (tx, _rx) = mpsc::unbounded_channel();

        scheduler.poll_and_dispatch(&tx).await.unwrap();
        assert_eq!(scheduler.guard.streak(), 0);
        assert!(scheduler.guard.backoff_remaining(Instant::now()).is_none());
    }
}
