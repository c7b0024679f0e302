//! In-memory [`Tracker`] for tests and dry runs.
//!
//! Behaves like a tiny tracker: markers, comments, PRs with scripted CI and
//! review states. Every marker swap is recorded so tests can assert the
//! exact transition history.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;

use drover_types::{DroverError, Result, TicketId};

use crate::{CiStatus, IssueInfo, MarkerSwap, PrState, ReviewStatus, TicketSnapshot, Tracker};

#[derive(Debug, Clone, Default)]
struct IssueRec {
    title: String,
    body: String,
    markers: BTreeSet<String>,
    comments: Vec<String>,
}

#[derive(Debug, Clone)]
struct PrRec {
    state: PrState,
    ci: CiStatus,
    review: ReviewStatus,
    diff: String,
    failure_logs: String,
    review_comments: Vec<String>,
}

impl Default for PrRec {
    fn default() -> Self {
        Self {
            state: PrState::Open,
            ci: CiStatus::Pending,
            review: ReviewStatus::Pending,
            diff: String::new(),
            failure_logs: String::new(),
            review_comments: Vec::new(),
        }
    }
}

#[derive(Default)]
struct State {
    issues: BTreeMap<TicketId, IssueRec>,
    prs: BTreeMap<(String, String, u64), PrRec>,
    pr_links: BTreeMap<TicketId, u64>,
    files: BTreeMap<(String, String, String), String>,
    next_number: u64,
    swaps: Vec<(TicketId, String, String)>,
    find_errors: Vec<DroverError>,
    review_requests: Vec<(TicketId, u64, String)>,
}

#[derive(Default)]
pub struct MemoryTracker {
    state: Mutex<State>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_issue(&self, id: TicketId, title: &str, body: &str, markers: &[&str]) {
        let mut st = self.state.lock().unwrap();
        st.next_number = st.next_number.max(id.number + 1);
        st.issues.insert(
            id,
            IssueRec {
                title: title.into(),
                body: body.into(),
                markers: markers.iter().map(|s| s.to_string()).collect(),
                comments: Vec::new(),
            },
        );
    }

    pub fn seed_pr(&self, id: &TicketId, pr: u64, state: PrState, ci: CiStatus, review: ReviewStatus) {
        let mut st = self.state.lock().unwrap();
        st.prs.insert(
            (id.owner.clone(), id.repo.clone(), pr),
            PrRec {
                state,
                ci,
                review,
                ..Default::default()
            },
        );
        st.pr_links.insert(id.clone(), pr);
    }

    pub fn set_ci(&self, id: &TicketId, pr: u64, ci: CiStatus) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.prs.get_mut(&(id.owner.clone(), id.repo.clone(), pr)) {
            rec.ci = ci;
        }
    }

    pub fn set_review(&self, id: &TicketId, pr: u64, review: ReviewStatus) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.prs.get_mut(&(id.owner.clone(), id.repo.clone(), pr)) {
            rec.review = review;
        }
    }

    pub fn set_pr_state(&self, id: &TicketId, pr: u64, state: PrState) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.prs.get_mut(&(id.owner.clone(), id.repo.clone(), pr)) {
            rec.state = state;
        }
    }

    pub fn set_failure_logs(&self, id: &TicketId, pr: u64, logs: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.prs.get_mut(&(id.owner.clone(), id.repo.clone(), pr)) {
            rec.failure_logs = logs.into();
        }
    }

    pub fn set_diff(&self, id: &TicketId, pr: u64, diff: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.prs.get_mut(&(id.owner.clone(), id.repo.clone(), pr)) {
            rec.diff = diff.into();
        }
    }

    pub fn add_review_comment(&self, id: &TicketId, pr: u64, comment: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(rec) = st.prs.get_mut(&(id.owner.clone(), id.repo.clone(), pr)) {
            rec.review_comments.push(comment.into());
        }
    }

    pub fn seed_file(&self, owner: &str, repo: &str, path: &str, content: &str) {
        let mut st = self.state.lock().unwrap();
        st.files
            .insert((owner.into(), repo.into(), path.into()), content.into());
    }

    /// Queue an error to be returned by the next `find_actionable` call.
    pub fn inject_find_error(&self, err: DroverError) {
        self.state.lock().unwrap().find_errors.push(err);
    }

    /// Marker set of one issue.
    pub fn markers_of(&self, id: &TicketId) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(id)
            .map(|rec| rec.markers.clone())
            .unwrap_or_default()
    }

    /// Full (from, to) swap history of one issue.
    pub fn swaps_of(&self, id: &TicketId) -> Vec<(String, String)> {
        self.state
            .lock()
            .unwrap()
            .swaps
            .iter()
            .filter(|(sid, _, _)| sid == id)
            .map(|(_, from, to)| (from.clone(), to.clone()))
            .collect()
    }

    pub fn comments_of(&self, id: &TicketId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .issues
            .get(id)
            .map(|rec| rec.comments.clone())
            .unwrap_or_default()
    }

    pub fn review_requests(&self) -> Vec<(TicketId, u64, String)> {
        self.state.lock().unwrap().review_requests.clone()
    }

    fn with_issue<T>(&self, id: &TicketId, f: impl FnOnce(&mut IssueRec) -> T) -> Result<T> {
        let mut st = self.state.lock().unwrap();
        let rec = st
            .issues
            .get_mut(id)
            .ok_or_else(|| DroverError::TrackerError {
                status: 404,
                message: format!("no such issue {}", id),
                retryable: false,
            })?;
        Ok(f(rec))
    }

    fn with_pr<T>(&self, id: &TicketId, pr: u64, f: impl FnOnce(&PrRec) -> T) -> Result<T> {
        let st = self.state.lock().unwrap();
        let rec = st
            .prs
            .get(&(id.owner.clone(), id.repo.clone(), pr))
            .ok_or_else(|| DroverError::TrackerError {
                status: 404,
                message: format!("no such PR {}#{}", id.full_repo(), pr),
                retryable: false,
            })?;
        Ok(f(rec))
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn find_actionable(&self, _org: &str, entry_label: &str) -> Result<Vec<TicketSnapshot>> {
        let mut st = self.state.lock().unwrap();
        if let Some(err) = st.find_errors.pop() {
            return Err(err);
        }
        Ok(st
            .issues
            .iter()
            .filter(|(_, rec)| rec.markers.contains(entry_label))
            .map(|(id, rec)| TicketSnapshot {
                id: id.clone(),
                markers: rec.markers.clone(),
                title: rec.title.clone(),
            })
            .collect())
    }

    async fn issue(&self, id: &TicketId) -> Result<IssueInfo> {
        self.with_issue(id, |rec| IssueInfo {
            title: rec.title.clone(),
            body: rec.body.clone(),
        })
    }

    async fn markers(&self, id: &TicketId) -> Result<BTreeSet<String>> {
        self.with_issue(id, |rec| rec.markers.clone())
    }

    async fn swap_marker(&self, id: &TicketId, from: &str, to: &str) -> Result<MarkerSwap> {
        let mut st = self.state.lock().unwrap();
        let rec = st
            .issues
            .get_mut(id)
            .ok_or_else(|| DroverError::TrackerError {
                status: 404,
                message: format!("no such issue {}", id),
                retryable: false,
            })?;
        if !rec.markers.remove(from) {
            return Ok(MarkerSwap::Conflict);
        }
        rec.markers.insert(to.to_string());
        st.swaps.push((id.clone(), from.to_string(), to.to_string()));
        Ok(MarkerSwap::Applied)
    }

    async fn add_marker(&self, id: &TicketId, marker: &str) -> Result<()> {
        self.with_issue(id, |rec| {
            rec.markers.insert(marker.to_string());
        })
    }

    async fn remove_marker(&self, id: &TicketId, marker: &str) -> Result<()> {
        self.with_issue(id, |rec| {
            rec.markers.remove(marker);
        })
    }

    async fn comment(&self, id: &TicketId, body: &str) -> Result<()> {
        self.with_issue(id, |rec| rec.comments.push(body.to_string()))
    }

    async fn comments(&self, id: &TicketId) -> Result<Vec<String>> {
        self.with_issue(id, |rec| rec.comments.clone())
    }

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        markers: &[String],
    ) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        st.next_number += 1;
        let number = st.next_number;
        st.issues.insert(
            TicketId::new(owner, repo, number),
            IssueRec {
                title: title.into(),
                body: body.into(),
                markers: markers.iter().cloned().collect(),
                comments: Vec::new(),
            },
        );
        Ok(number)
    }

    async fn find_pr(&self, id: &TicketId) -> Result<Option<(u64, PrState)>> {
        let st = self.state.lock().unwrap();
        let Some(pr) = st.pr_links.get(id).copied() else {
            return Ok(None);
        };
        let state = st
            .prs
            .get(&(id.owner.clone(), id.repo.clone(), pr))
            .map(|rec| rec.state)
            .unwrap_or(PrState::Open);
        Ok(Some((pr, state)))
    }

    async fn pr_state(&self, id: &TicketId, pr: u64) -> Result<PrState> {
        self.with_pr(id, pr, |rec| rec.state)
    }

    async fn ci_status(&self, id: &TicketId, pr: u64) -> Result<CiStatus> {
        self.with_pr(id, pr, |rec| rec.ci)
    }

    async fn ci_failure_logs(&self, id: &TicketId, pr: u64) -> Result<String> {
        self.with_pr(id, pr, |rec| rec.failure_logs.clone())
    }

    async fn pr_diff(&self, id: &TicketId, pr: u64) -> Result<String> {
        self.with_pr(id, pr, |rec| rec.diff.clone())
    }

    async fn review_status(&self, id: &TicketId, pr: u64) -> Result<ReviewStatus> {
        self.with_pr(id, pr, |rec| rec.review)
    }

    async fn pr_review_comments(&self, id: &TicketId, pr: u64) -> Result<Vec<String>> {
        self.with_pr(id, pr, |rec| rec.review_comments.clone())
    }

    async fn request_review(&self, id: &TicketId, pr: u64, reviewer: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.review_requests.push((id.clone(), pr, reviewer.to_string()));
        Ok(())
    }

    async fn mention(&self, id: &TicketId, who: &str, message: &str) -> Result<()> {
        self.comment(id, &format!("@{} {}", who.trim_start_matches('@'), message))
            .await
    }

    async fn fetch_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        _git_ref: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .files
            .get(&(owner.into(), repo.into(), path.into()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid() -> TicketId {
        TicketId::new("acme", "api", 1)
    }

    #[tokio::test]
    async fn swap_marker_applies_and_records() {
        let tracker = MemoryTracker::new();
        tracker.seed_issue(tid(), "t", "", &["drover", "agentPlanning"]);

        let swap = tracker
            .swap_marker(&tid(), "agentPlanning", "agentPlanReview")
            .await
            .unwrap();
        assert_eq!(swap, MarkerSwap::Applied);
        assert!(tracker.markers_of(&tid()).contains("agentPlanReview"));
        assert!(!tracker.markers_of(&tid()).contains("agentPlanning"));
        assert_eq!(
            tracker.swaps_of(&tid()),
            vec![("agentPlanning".to_string(), "agentPlanReview".to_string())]
        );
    }

    #[tokio::test]
    async fn swap_marker_conflict_on_stale_read() {
        let tracker = MemoryTracker::new();
        tracker.seed_issue(tid(), "t", "", &["drover"]);

        let swap = tracker
            .swap_marker(&tid(), "agentPlanning", "agentPlanReview")
            .await
            .unwrap();
        assert_eq!(swap, MarkerSwap::Conflict);
        // Nothing was written.
        assert_eq!(tracker.markers_of(&tid()).len(), 1);
    }

    #[tokio::test]
    async fn find_actionable_filters_by_entry_label() {
        let tracker = MemoryTracker::new();
        tracker.seed_issue(tid(), "in", "", &["drover"]);
        tracker.seed_issue(TicketId::new("acme", "api", 2), "out", "", &["bug"]);

        let found = tracker.find_actionable("acme", "drover").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.number, 1);
    }

    #[tokio::test]
    async fn injected_error_surfaces_once() {
        let tracker = MemoryTracker::new();
        tracker.inject_find_error(DroverError::RateLimited { retry_after_secs: 1 });
        assert!(tracker.find_actionable("acme", "drover").await.is_err());
        assert!(tracker.find_actionable("acme", "drover").await.is_ok());
    }

    #[tokio::test]
    async fn create_issue_allocates_numbers() {
        let tracker = MemoryTracker::new();
        tracker.seed_issue(tid(), "t", "", &["drover"]);
        let a = tracker
            .create_issue("acme", "api", "s1", "", &["drover".into()])
            .await
            .unwrap();
        let b = tracker
            .create_issue("acme", "api", "s2", "", &["drover".into()])
            .await
            .unwrap();
        assert!(b > a);
        assert!(a > 1);
    }

    #[tokio::test]
    async fn pr_lookup_round_trip() {
        let tracker = MemoryTracker::new();
        tracker.seed_issue(tid(), "t", "", &["drover"]);
        tracker.seed_pr(&tid(), 9, PrState::Open, CiStatus::Failed, ReviewStatus::Pending);

        assert_eq!(
            tracker.find_pr(&tid()).await.unwrap(),
            Some((9, PrState::Open))
        );
        assert_eq!(tracker.ci_status(&tid(), 9).await.unwrap(), CiStatus::Failed);
        tracker.set_ci(&tid(), 9, CiStatus::Passed);
        assert_eq!(tracker.ci_status(&tid(), 9).await.unwrap(), CiStatus::Passed);
    }
}
