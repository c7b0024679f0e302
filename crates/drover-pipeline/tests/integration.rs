//! End-to-end pipeline behavior against the in-memory tracker and a
//! scripted agent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use drover_agent::{Agent, AgentReport, AgentTask, ScriptedAgent};
use drover_pipeline::{EventEmitter, DroverEvent, Pipeline, Scheduler, StageContext};
use drover_tracker::{CiStatus, MemoryTracker, PrState, ReviewStatus, Tracker};
use drover_types::{DroverConfig, DroverError, OutcomeKind, Stage, Ticket, TicketId};

fn config() -> DroverConfig {
    DroverConfig {
        org: "acme".into(),
        clone_workspaces: false,
        ..DroverConfig::default()
    }
}

fn tid() -> TicketId {
    TicketId::new("acme", "api", 7)
}

fn ctx(tracker: Arc<MemoryTracker>, agent: Arc<dyn Agent>) -> StageContext {
    StageContext {
        tracker,
        agent,
        config: config(),
        rules: Default::default(),
    }
}

/// Rebuild the ticket from tracker truth, as a fresh poll cycle would.
async fn rebuild(tracker: &MemoryTracker, id: &TicketId) -> Ticket {
    let markers = tracker.markers_of(id);
    Ticket {
        id: id.clone(),
        entry_flag: markers.contains("drover"),
        markers,
        title: String::new(),
        pr_number: None,
        plan: None,
        work_dir: None,
    }
}

// --- Scenario: planner cannot proceed, ticket escalates ---

#[tokio::test]
async fn planner_needing_input_escalates_to_stuck() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "please add auth", &["drover", "agentPlanning"]);
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_text("[NEEDS_MORE_INFO] which identity provider?");

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    let mut ticket = rebuild(&tracker, &tid()).await;
    let outcome = pipeline.handle(&mut ticket, &ctx).await.unwrap();

    assert!(matches!(outcome.kind, OutcomeKind::Escalate { .. }));
    let markers = tracker.markers_of(&tid());
    assert!(markers.contains("agentStuck"));
    assert!(!markers.contains("agentPlanning"));
    let comments = tracker.comments_of(&tid());
    assert!(comments
        .iter()
        .any(|c| c.starts_with("Stuck:") && c.contains("which identity provider?")));
}

// --- Scenario: quality gate rejects, plan retries within budget ---

#[tokio::test]
async fn plan_review_failure_retries_from_planning() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "please add auth", &["drover", "agentPlanReview"]);
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_text(r#"{"verdict": "fail_retryable", "feedback": "no rollout plan"}"#);

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    tracker
        .comment(&tid(), "## Development Plan\n\nship it")
        .await
        .unwrap();

    let mut ticket = rebuild(&tracker, &tid()).await;
    let outcome = pipeline.handle(&mut ticket, &ctx).await.unwrap();

    assert!(matches!(outcome.kind, OutcomeKind::Retryable { .. }));
    let markers = tracker.markers_of(&tid());
    assert!(markers.contains("agentPlanning"));
    assert!(!markers.contains("agentPlanReview"));
    assert!(tracker
        .comments_of(&tid())
        .iter()
        .any(|c| c.starts_with("## Retry Feedback") && c.contains("no rollout plan")));
}

// --- Scenario: budget exhaustion escalates on the failure past the ceiling ---

#[tokio::test]
async fn plan_retry_budget_exhaustion_escalates() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "please add auth", &["drover", "agentPlanReview"]);
    let agent = Arc::new(ScriptedAgent::new());
    for _ in 0..3 {
        agent.push_text(r#"{"verdict": "fail_retryable", "feedback": "still wrong"}"#);
    }

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    tracker
        .comment(&tid(), "## Development Plan\n\nship it")
        .await
        .unwrap();

    // Default plan budget is 2: failures 1 and 2 retry, failure 3 escalates.
    for attempt in 1..=3u32 {
        let mut ticket = rebuild(&tracker, &tid()).await;
        pipeline.handle(&mut ticket, &ctx).await.unwrap();
        let markers = tracker.markers_of(&tid());
        if attempt < 3 {
            assert!(markers.contains("agentPlanning"), "attempt {attempt} should retry");
            // Simulate the planner advancing back to review for the next cycle.
            tracker
                .swap_marker(&tid(), "agentPlanning", "agentPlanReview")
                .await
                .unwrap();
        } else {
            assert!(markers.contains("agentStuck"), "attempt {attempt} should escalate");
        }
    }
    assert!(tracker
        .comments_of(&tid())
        .iter()
        .any(|c| c.contains("retry limit exceeded")));
}

// --- Scenario: CI pending is a pure no-op ---

#[tokio::test]
async fn pending_ci_writes_nothing() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "", &["drover", "agentPR"]);
    tracker.seed_pr(&tid(), 42, PrState::Open, CiStatus::Pending, ReviewStatus::Pending);
    let agent = Arc::new(ScriptedAgent::new());

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);

    let markers_before = tracker.markers_of(&tid());
    let comments_before = tracker.comments_of(&tid()).len();
    for _ in 0..3 {
        let mut ticket = rebuild(&tracker, &tid()).await;
        let outcome = pipeline.handle(&mut ticket, &ctx).await.unwrap();
        assert!(matches!(outcome.kind, OutcomeKind::Pending));
    }
    assert_eq!(tracker.markers_of(&tid()), markers_before);
    assert_eq!(tracker.comments_of(&tid()).len(), comments_before);

    // The moment CI resolves, the same stage advances.
    tracker.set_ci(&tid(), 42, CiStatus::Passed);
    let mut ticket = rebuild(&tracker, &tid()).await;
    pipeline.handle(&mut ticket, &ctx).await.unwrap();
    assert!(tracker.markers_of(&tid()).contains("agentSelfReview"));
}

#[tokio::test]
async fn failed_ci_falls_back_to_ci_fix() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "", &["drover", "agentPR"]);
    tracker.seed_pr(&tid(), 42, PrState::Open, CiStatus::Failed, ReviewStatus::Pending);
    let agent = Arc::new(ScriptedAgent::new());

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    let mut ticket = rebuild(&tracker, &tid()).await;
    pipeline.handle(&mut ticket, &ctx).await.unwrap();

    assert!(tracker.markers_of(&tid()).contains("agentCIFix"));
}

// --- Scenario: repeated self-review failures accumulate across the loop ---

#[tokio::test]
async fn self_review_loop_escalates_at_the_implement_ceiling() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "please add auth", &["drover", "agentSelfReview"]);
    tracker.seed_pr(&tid(), 42, PrState::Open, CiStatus::Passed, ReviewStatus::Pending);
    let agent = Arc::new(ScriptedAgent::new());
    // Reviewer keeps finding issues; the implementer keeps "fixing" them.
    agent.push_text(r#"{"verdict": "issues_found", "summary": "missing error path"}"#);
    agent.push_text("Pushed fix, see https://github.com/acme/api/pull/42");
    agent.push_text(r#"{"verdict": "issues_found", "summary": "still missing"}"#);
    agent.push_text("Pushed fix, see https://github.com/acme/api/pull/42");
    agent.push_text(r#"{"verdict": "issues_found", "summary": "again"}"#);

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    tracker
        .comment(&tid(), "## Development Plan\n\nship it")
        .await
        .unwrap();

    // Default implement ceiling is 2: the third consecutive self-review
    // failure must escalate even though Implementing advanced in between.
    let mut guard = 0;
    while !tracker.markers_of(&tid()).contains("agentStuck") {
        let mut ticket = rebuild(&tracker, &tid()).await;
        pipeline.handle(&mut ticket, &ctx).await.unwrap();
        guard += 1;
        assert!(guard < 12, "self-review loop never escalated");
    }
    assert!(tracker
        .comments_of(&tid())
        .iter()
        .any(|c| c.contains("retry limit exceeded at self_review")));
}

// --- Marker conflicts defer without consuming budget ---

#[tokio::test]
async fn stale_marker_read_defers_and_charges_nothing() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "please add auth", &["drover", "agentPlanReview"]);
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_text(r#"{"verdict": "fail_retryable", "feedback": "thin plan"}"#);

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    tracker
        .comment(&tid(), "## Development Plan\n\nship it")
        .await
        .unwrap();

    let mut ticket = rebuild(&tracker, &tid()).await;
    // Another writer moves the marker after the snapshot was taken.
    tracker
        .swap_marker(&tid(), "agentPlanReview", "agentImplementing")
        .await
        .unwrap();

    let outcome = pipeline.handle(&mut ticket, &ctx).await.unwrap();
    assert!(matches!(outcome.kind, OutcomeKind::Pending));
    assert_eq!(outcome.notes, "marker conflict");

    // Tracker state is whatever the other writer left; no budget consumed,
    // no feedback comment written.
    let markers = tracker.markers_of(&tid());
    assert!(markers.contains("agentImplementing"));
    assert!(!markers.contains("agentPlanning"));
    assert_eq!(pipeline.ledger().count(&tid(), Stage::PlanReview), 0);
    assert!(!tracker
        .comments_of(&tid())
        .iter()
        .any(|c| c.starts_with("## Retry Feedback")));
}

// --- Rate limits propagate untouched ---

#[tokio::test]
async fn rate_limited_agent_leaves_no_trace() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "body", &["drover", "agentPlanning"]);
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_err(DroverError::RateLimited { retry_after_secs: 30 });

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    let mut ticket = rebuild(&tracker, &tid()).await;
    let err = pipeline.handle(&mut ticket, &ctx).await.unwrap_err();

    assert!(err.is_rate_limit());
    assert!(tracker.markers_of(&tid()).contains("agentPlanning"));
    assert!(tracker.comments_of(&tid()).is_empty());
}

// --- Bootstrap ---

#[tokio::test]
async fn bootstrap_assigns_first_stage_by_repo() {
    let tracker = Arc::new(MemoryTracker::new());
    let dev = TicketId::new("acme", "api", 1);
    let eng = TicketId::new("acme", "engineering", 2);
    tracker.seed_issue(dev.clone(), "story", "", &["drover"]);
    tracker.seed_issue(eng.clone(), "initiative", "", &["drover"]);
    let agent = Arc::new(ScriptedAgent::new());

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);

    let mut ticket = rebuild(&tracker, &dev).await;
    pipeline.handle(&mut ticket, &ctx).await.unwrap();
    assert!(tracker.markers_of(&dev).contains("agentPlanning"));

    let mut ticket = rebuild(&tracker, &eng).await;
    pipeline.handle(&mut ticket, &ctx).await.unwrap();
    assert!(tracker.markers_of(&eng).contains("agentSpec"));
}

// --- Full happy path from planning to merge-ready ---

#[tokio::test]
async fn happy_path_reaches_merge_ready() {
    let tracker = Arc::new(MemoryTracker::new());
    tracker.seed_issue(tid(), "add auth", "please add auth", &["drover", "agentPlanning"]);
    let agent = Arc::new(ScriptedAgent::new());
    agent.push_text("1. add login route\n2. add tests");
    agent.push_text(r#"{"verdict": "pass", "feedback": ""}"#);
    agent.push_text("Opened https://github.com/acme/api/pull/42");
    agent.push_text(r#"{"verdict": "clean", "summary": "matches the plan"}"#);

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);

    let mut guard = 0;
    loop {
        let mut ticket = rebuild(&tracker, &tid()).await;
        let stage = ticket.stage().unwrap();
        if stage == Stage::MergeReady {
            break;
        }
        pipeline.handle(&mut ticket, &ctx).await.unwrap();

        // The implementer's PR materializes in the tracker.
        if tracker.markers_of(&tid()).contains("agentPR") {
            tracker.seed_pr(&tid(), 42, PrState::Open, CiStatus::Passed, ReviewStatus::Approved);
        }
        guard += 1;
        assert!(guard < 20, "pipeline did not converge, stuck at {:?}", stage);
    }

    let swaps = tracker.swaps_of(&tid());
    let path: Vec<&str> = swaps.iter().map(|(_, to)| to.as_str()).collect();
    assert_eq!(
        path,
        vec![
            "agentPlanReview",
            "agentPlan",
            "agentImplementing",
            "agentPR",
            "agentSelfReview",
            "agentReview",
            "agentMergeReady",
        ]
    );
    // Every non-pending stage left a metrics record.
    let comments = tracker.comments_of(&tid());
    assert!(comments.iter().filter(|c| c.contains("<!-- drover:")).count() >= 7);
}

// --- Scheduler: concurrency bound and no duplicate dispatch ---

struct SlowAgent {
    delay: Duration,
}

#[async_trait]
impl Agent for SlowAgent {
    async fn invoke(&self, _task: &AgentTask) -> drover_types::Result<AgentReport> {
        tokio::time::sleep(self.delay).await;
        Ok(AgentReport {
            text: "[NEEDS_MORE_INFO] placeholder".into(),
            cost_usd: 0.0,
            turns: 1,
        })
    }
}

#[tokio::test]
async fn scheduler_respects_concurrency_bound_and_never_duplicates() {
    let tracker = Arc::new(MemoryTracker::new());
    for n in 1..=4 {
        tracker.seed_issue(
            TicketId::new("acme", "api", n),
            "story",
            "",
            &["drover", "agentPlanning"],
        );
    }
    let agent = Arc::new(SlowAgent {
        delay: Duration::from_millis(300),
    });

    let cfg = DroverConfig {
        max_concurrent: 2,
        poll_interval_secs: 1,
        ..config()
    };
    let events = EventEmitter::new(256);
    let mut rx = events.subscribe();
    let scheduler = Scheduler::new(tracker.clone(), agent, cfg, events);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    // Let a few cycles pass while the first two units are still running.
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let mut dispatched = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let DroverEvent::TicketDispatched { ticket, .. } = event {
            dispatched.push(ticket);
        }
    }
    assert_eq!(dispatched.len(), 2, "dispatched: {:?}", dispatched);
    assert_ne!(dispatched[0], dispatched[1]);
}

// --- Scenario: backoff doubles per signal, then a fixed cooldown ---

#[test]
fn backoff_sequence_and_post_success_cooldown() {
    use drover_pipeline::RateLimitGuard;
    use std::time::Instant;

    let mut guard = RateLimitGuard::new(
        Duration::from_secs(60),
        Duration::from_secs(600),
        Duration::from_secs(300),
    );
    let now = Instant::now();

    assert_eq!(guard.on_rate_limit(now), Duration::from_secs(60));
    assert_eq!(guard.on_rate_limit(now), Duration::from_secs(120));
    assert_eq!(guard.on_rate_limit(now), Duration::from_secs(240));

    // First clean batch ends the streak but holds a cooldown window.
    assert_eq!(guard.on_clean_cycle(now), Some(Duration::from_secs(300)));
    assert_eq!(guard.streak(), 0);
    assert!(guard.backoff_remaining(now).is_some());
    assert!(guard
        .backoff_remaining(now + Duration::from_secs(301))
        .is_none());

    // A fresh signal after recovery starts over at the base delay.
    let later = now + Duration::from_secs(400);
    assert_eq!(guard.on_rate_limit(later), Duration::from_secs(60));
}

// --- Spec path: backlog approval fans stories out ---

#[tokio::test]
async fn backlog_approval_creates_story_issues() {
    let tracker = Arc::new(MemoryTracker::new());
    let eng = TicketId::new("acme", "engineering", 3);
    tracker.seed_issue(eng.clone(), "big initiative", "", &["drover", "agentBacklogReview"]);
    tracker
        .comment(
            &eng,
            "## Generated Backlog\n\n```json\n[{\"title\": \"story one\", \"repo\": \"api\", \"description\": \"do it\", \"estimate\": \"S\", \"dependencies\": [], \"notes\": \"\"}]\n```",
        )
        .await
        .unwrap();
    tracker.comment(&eng, "Backlog approved").await.unwrap();
    let agent = Arc::new(ScriptedAgent::new());

    let pipeline = Pipeline::new(EventEmitter::default());
    let ctx = ctx(tracker.clone(), agent);
    let mut ticket = rebuild(&tracker, &eng).await;
    let outcome = pipeline.handle(&mut ticket, &ctx).await.unwrap();

    assert!(matches!(outcome.kind, OutcomeKind::Complete));
    // Ticket left the pipeline.
    let markers = tracker.markers_of(&eng);
    assert!(!markers.contains("agentBacklogReview"));
    assert!(!markers.contains("drover"));
    // The story landed in the target repo with the entry flag.
    let found = tracker.find_actionable("acme", "drover").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id.repo, "api");
    assert_eq!(found[0].title, "story one");
    assert!(tracker
        .comments_of(&eng)
        .iter()
        .any(|c| c.starts_with("## Stories Created")));
}
