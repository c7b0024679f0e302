//! Tickets: the unit of work moving through the pipeline.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Tracker identity of a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl TicketId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }

    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// Parse `owner/repo#number`.
    pub fn parse(s: &str) -> Option<TicketId> {
        let (repo_part, number) = s.split_once('#')?;
        let (owner, repo) = repo_part.split_once('/')?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        Some(TicketId::new(owner, repo, number.parse().ok()?))
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

/// A ticket as observed during one handling cycle.
///
/// The tracker's marker is the source of truth; a `Ticket` is a point-in-time
/// cache of it, rebuilt from a snapshot on every dispatch. Artifact references
/// (`pr_number`, `plan`) are re-derived from the tracker when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    /// All markers currently on the ticket, verbatim.
    pub markers: BTreeSet<String>,
    /// Whether the permanent entry flag is present.
    pub entry_flag: bool,
    pub title: String,
    pub pr_number: Option<u64>,
    pub plan: Option<String>,
    pub work_dir: Option<String>,
}

impl Ticket {
    /// The current stage, derived from the markers. `None` means bootstrap
    /// (entry flag only) or a mis-labeled ticket.
    pub fn stage(&self) -> Option<Stage> {
        // Stage markers are mutually exclusive by invariant; take the first hit.
        Stage::ALL
            .iter()
            .copied()
            .find(|s| self.markers.contains(s.as_marker()))
    }

    /// True when the ticket is in the valid bootstrap state: entry flag
    /// present, no stage marker yet.
    pub fn is_bootstrap(&self) -> bool {
        self.entry_flag && self.stage().is_none()
    }
}
