//! Ticket tracker collaborator contract.
//!
//! The tracker owns the durable truth: each ticket's markers. Everything the
//! orchestration engine knows about a ticket is re-derived from a tracker
//! snapshot on every cycle. This crate defines the [`Tracker`] trait plus two
//! adapters: [`GithubTracker`] (REST) and [`MemoryTracker`] (tests, dry runs).

pub mod github;
pub mod memory;

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use drover_types::{Result, Ticket, TicketId};

pub use github::GithubTracker;
pub use memory::MemoryTracker;

/// Point-in-time view of a ticket, as-of query time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketSnapshot {
    pub id: TicketId,
    pub markers: BTreeSet<String>,
    pub title: String,
}

impl TicketSnapshot {
    /// Materialize a [`Ticket`] cache from this snapshot.
    pub fn into_ticket(self, entry_label: &str) -> Ticket {
        let entry_flag = self.markers.contains(entry_label);
        Ticket {
            id: self.id,
            markers: self.markers,
            entry_flag,
            title: self.title,
            pr_number: None,
            plan: None,
            work_dir: None,
        }
    }
}

/// Issue title and body in one fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueInfo {
    pub title: String,
    pub body: String,
}

/// Result of an atomic marker replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSwap {
    Applied,
    /// The `from` marker was absent: the read was stale. Callers re-derive
    /// current state; they never force the write.
    Conflict,
}

/// CI state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Passed,
    Failed,
}

/// Human review state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    ChangesRequested,
    Commented,
}

/// Lifecycle state of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Merged,
    Closed,
}

/// CRUD surface the engine consumes. Implementations must be safe to call
/// concurrently from many in-flight handler units.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Tickets in `org` carrying `entry_label`, excluding closed ones.
    async fn find_actionable(&self, org: &str, entry_label: &str) -> Result<Vec<TicketSnapshot>>;

    async fn issue(&self, id: &TicketId) -> Result<IssueInfo>;

    /// Current markers, re-read from the tracker.
    async fn markers(&self, id: &TicketId) -> Result<BTreeSet<String>>;

    /// Atomically replace `from` with `to`. Returns `Conflict` when `from`
    /// is no longer present.
    async fn swap_marker(&self, id: &TicketId, from: &str, to: &str) -> Result<MarkerSwap>;

    async fn add_marker(&self, id: &TicketId, marker: &str) -> Result<()>;

    async fn remove_marker(&self, id: &TicketId, marker: &str) -> Result<()>;

    async fn comment(&self, id: &TicketId, body: &str) -> Result<()>;

    /// All comment bodies, oldest first.
    async fn comments(&self, id: &TicketId) -> Result<Vec<String>>;

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        markers: &[String],
    ) -> Result<u64>;

    /// The open or merged PR referencing this ticket, if any.
    async fn find_pr(&self, id: &TicketId) -> Result<Option<(u64, PrState)>>;

    async fn pr_state(&self, id: &TicketId, pr: u64) -> Result<PrState>;

    async fn ci_status(&self, id: &TicketId, pr: u64) -> Result<CiStatus>;

    async fn ci_failure_logs(&self, id: &TicketId, pr: u64) -> Result<String>;

    async fn pr_diff(&self, id: &TicketId, pr: u64) -> Result<String>;

    async fn review_status(&self, id: &TicketId, pr: u64) -> Result<ReviewStatus>;

    /// Review comments on a PR, formatted `@author: body`, oldest first.
    async fn pr_review_comments(&self, id: &TicketId, pr: u64) -> Result<Vec<String>>;

    async fn request_review(&self, id: &TicketId, pr: u64, reviewer: &str) -> Result<()>;

    /// Post a comment mentioning `who`.
    async fn mention(&self, id: &TicketId, who: &str, message: &str) -> Result<()>;

    /// Fetch a file's content at `git_ref`, or `None` when it does not exist.
    async fn fetch_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_into_ticket_detects_entry_flag() {
        let snap = TicketSnapshot {
            id: TicketId::new("acme", "api", 5),
            markers: ["drover", "agentPlanning"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            title: "do the thing".into(),
        };
        let ticket = snap.into_ticket("drover");
        assert!(ticket.entry_flag);
        assert_eq!(ticket.stage(), Some(drover_types::Stage::Planning));
    }

    #[test]
    fn snapshot_without_entry_label() {
        let snap = TicketSnapshot {
            id: TicketId::new("acme", "api", 5),
            markers: ["bug"].iter().map(|s| s.to_string()).collect(),
            title: "t".into(),
        };
        assert!(!snap.into_ticket("drover").entry_flag);
    }

    #[test]
    fn status_enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&ReviewStatus::ChangesRequested).unwrap(),
            "\"changes_requested\""
        );
        assert_eq!(serde_json::to_string(&CiStatus::Passed).unwrap(), "\"passed\"");
        assert_eq!(serde_json::to_string(&PrState::Merged).unwrap(), "\"merged\"");
    }
}
