//! Retry accounting: a pure policy and a per-(ticket, stage) ledger.

use std::collections::HashMap;
use std::sync::Mutex;

use drover_types::{Stage, TicketId};

/// Pure retry decision. `count` is the number of failures recorded so
/// far, including the one being decided; a ticket gets exactly `ceiling`
/// retries before escalation.
pub fn should_retry(ceiling: u32, count: u32) -> bool {
    count <= ceiling
}

/// Per-(ticket, stage) failure counters, keyed by the stage whose handler
/// reported the failure. Stages that share a configured ceiling still
/// count independently, so a gate that keeps failing accumulates toward
/// escalation even while its retry-from stage succeeds in between.
/// In-memory only: a restart forgets counts, which errs on the side of
/// retrying.
#[derive(Default)]
pub struct RetryLedger {
    counts: Mutex<HashMap<(TicketId, Stage), u32>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retryable failure and return the new count.
    pub fn record_failure(&self, id: &TicketId, stage: Stage) -> u32 {
        let mut counts = self.counts.lock().unwrap();
        let entry = counts.entry((id.clone(), stage)).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Clear the counter once the ticket advances past the stage.
    pub fn reset(&self, id: &TicketId, stage: Stage) {
        self.counts.lock().unwrap().remove(&(id.clone(), stage));
    }

    /// Drop all counters for a ticket (completion or escalation).
    pub fn forget(&self, id: &TicketId) {
        self.counts
            .lock()
            .unwrap()
            .retain(|(tid, _), _| tid != id);
    }

    pub fn count(&self, id: &TicketId, stage: Stage) -> u32 {
        self.counts
            .lock()
            .unwrap()
            .get(&(id.clone(), stage))
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TicketId {
        TicketId::new("acme", "api", 1)
    }

    #[test]
    fn ceiling_allows_exactly_n_retries() {
        // ceiling 2: failures 1 and 2 retry, failure 3 escalates.
        assert!(should_retry(2, 1));
        assert!(should_retry(2, 2));
        assert!(!should_retry(2, 3));
    }

    #[test]
    fn counts_are_monotone_and_reset_on_success() {
        let ledger = RetryLedger::new();
        assert_eq!(ledger.record_failure(&tid(), Stage::PlanReview), 1);
        assert_eq!(ledger.record_failure(&tid(), Stage::PlanReview), 2);
        ledger.reset(&tid(), Stage::PlanReview);
        assert_eq!(ledger.count(&tid(), Stage::PlanReview), 0);
        assert_eq!(ledger.record_failure(&tid(), Stage::PlanReview), 1);
    }

    #[test]
    fn stages_count_independently() {
        let ledger = RetryLedger::new();
        ledger.record_failure(&tid(), Stage::SelfReview);
        ledger.record_failure(&tid(), Stage::SelfReview);
        // The retry-from stage advancing must not touch the gate's count.
        ledger.reset(&tid(), Stage::Implementing);
        assert_eq!(ledger.count(&tid(), Stage::SelfReview), 2);
        assert_eq!(ledger.count(&tid(), Stage::PrMonitor), 0);
    }

    #[test]
    fn forget_clears_every_stage() {
        let ledger = RetryLedger::new();
        ledger.record_failure(&tid(), Stage::PlanReview);
        ledger.record_failure(&tid(), Stage::Review);
        ledger.forget(&tid());
        assert_eq!(ledger.count(&tid(), Stage::PlanReview), 0);
        assert_eq!(ledger.count(&tid(), Stage::Review), 0);
    }
}
