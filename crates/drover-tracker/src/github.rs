//! GitHub REST adapter for the [`Tracker`] contract.
//!
//! Marker strings cross into [`drover_types::Stage`] territory only above
//! this boundary; here everything is labels, issues, and pulls.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;

use drover_types::{DroverError, Result, TicketId};

use crate::{CiStatus, IssueInfo, MarkerSwap, PrState, ReviewStatus, TicketSnapshot, Tracker};

const API_BASE: &str = "https://api.github.com";

pub struct GithubTracker {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WireLabel {
    name: String,
}

#[derive(Deserialize)]
struct WireIssue {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<WireLabel>,
    #[serde(default)]
    repository_url: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireSearch {
    items: Vec<WireIssue>,
}

#[derive(Deserialize)]
struct WireComment {
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct WireReviewComment {
    #[serde(default)]
    body: String,
    user: WireUser,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Deserialize)]
struct WirePull {
    number: u64,
    state: String,
    #[serde(default)]
    merged_at: Option<String>,
    head: WireRef,
}

#[derive(Deserialize)]
struct WireRef {
    sha: String,
}

#[derive(Deserialize)]
struct WireCheckRuns {
    check_runs: Vec<WireCheckRun>,
}

#[derive(Deserialize)]
struct WireCheckRun {
    name: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    output: WireCheckOutput,
}

#[derive(Deserialize, Default)]
struct WireCheckOutput {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Deserialize)]
struct WireReview {
    state: String,
    user: WireUser,
}

#[derive(Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Deserialize)]
struct WireCreated {
    number: u64,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse `owner/repo` out of a `repository_url` like
/// `https://api.github.com/repos/acme/api`.
fn repo_from_url(url: &str) -> Option<(String, String)> {
    let tail = url.split("/repos/").nth(1)?;
    let (owner, repo) = tail.split_once('/')?;
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

fn pr_state_of(state: &str, merged_at: Option<&str>) -> PrState {
    if merged_at.is_some() {
        PrState::Merged
    } else if state.eq_ignore_ascii_case("closed") {
        PrState::Closed
    } else {
        PrState::Open
    }
}

/// Reduce a set of check runs to a single CI verdict: any failure loses,
/// anything unfinished holds the whole set pending.
fn reduce_check_runs(runs: &[WireCheckRun]) -> CiStatus {
    if runs.iter().any(|r| {
        matches!(
            r.conclusion.as_deref(),
            Some("failure") | Some("timed_out") | Some("cancelled")
        )
    }) {
        return CiStatus::Failed;
    }
    if runs.iter().any(|r| r.status != "completed") {
        return CiStatus::Pending;
    }
    CiStatus::Passed
}

/// Latest review per author wins; any changes-requested outranks comments,
/// approval only counts when nothing later contradicts it.
fn reduce_reviews(reviews: &[WireReview]) -> ReviewStatus {
    use std::collections::HashMap;
    let mut latest: HashMap<&str, &str> = HashMap::new();
    for review in reviews {
        if review.state == "PENDING" {
            continue;
        }
        latest.insert(review.user.login.as_str(), review.state.as_str());
    }
    if latest.values().any(|s| *s == "CHANGES_REQUESTED") {
        return ReviewStatus::ChangesRequested;
    }
    if latest.values().any(|s| *s == "APPROVED") {
        return ReviewStatus::Approved;
    }
    if latest.values().any(|s| *s == "COMMENTED") {
        return ReviewStatus::Commented;
    }
    ReviewStatus::Pending
}

impl GithubTracker {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: API_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn from_env() -> Result<Self> {
        let token = std::env::var("GITHUB_TOKEN").map_err(|_| DroverError::AuthFailed {
            message: "GITHUB_TOKEN is not set".into(),
        })?;
        Ok(Self::new(token))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("User-Agent", "drover")
            .header("Accept", "application/vnd.github+json")
    }

    /// Map a non-success response to the error taxonomy. 401 is fatal; 429
    /// and secondary rate limits throttle the whole scheduler; 5xx retries.
    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        let remaining = resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false);
        let body = resp.text().await.unwrap_or_default();

        match status.as_u16() {
            401 => Err(DroverError::AuthFailed { message: body }),
            429 => Err(DroverError::RateLimited {
                retry_after_secs: retry_after,
            }),
            403 if remaining || body.contains("rate limit") => Err(DroverError::RateLimited {
                retry_after_secs: retry_after,
            }),
            code => Err(DroverError::TrackerError {
                status: code,
                message: body,
                retryable: status.is_server_error(),
            }),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(wrap_transport)?;
        let resp = self.check(resp).await?;
        resp.json().await.map_err(wrap_transport)
    }

    async fn pull(&self, id: &TicketId, pr: u64) -> Result<WirePull> {
        self.get_json(&format!(
            "/repos/{}/{}/pulls/{}",
            id.owner, id.repo, pr
        ))
        .await
    }
}

fn wrap_transport(err: reqwest::Error) -> DroverError {
    if err.is_timeout() {
        DroverError::Timeout { timeout_secs: 0 }
    } else {
        DroverError::TrackerError {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
            retryable: true,
        }
    }
}

#[async_trait]
impl Tracker for GithubTracker {
    async fn find_actionable(&self, org: &str, entry_label: &str) -> Result<Vec<TicketSnapshot>> {
        let query = format!(
            "org:{} label:{} is:issue is:open",
            org, entry_label
        );
        let search: WireSearch = self
            .get_json(&format!(
                "/search/issues?q={}&per_page=100",
                urlencode(&query)
            ))
            .await?;

        let mut snapshots = Vec::new();
        for issue in search.items {
            if issue.pull_request.is_some() {
                continue;
            }
            let Some((owner, repo)) = repo_from_url(&issue.repository_url) else {
                tracing::warn!(number = issue.number, "search hit without repository url");
                continue;
            };
            snapshots.push(TicketSnapshot {
                id: TicketId::new(owner, repo, issue.number),
                markers: issue.labels.into_iter().map(|l| l.name).collect(),
                title: issue.title,
            });
        }
        Ok(snapshots)
    }

    async fn issue(&self, id: &TicketId) -> Result<IssueInfo> {
        let issue: WireIssue = self
            .get_json(&format!(
                "/repos/{}/{}/issues/{}",
                id.owner, id.repo, id.number
            ))
            .await?;
        Ok(IssueInfo {
            title: issue.title,
            body: issue.body.unwrap_or_default(),
        })
    }

    async fn markers(&self, id: &TicketId) -> Result<BTreeSet<String>> {
        let labels: Vec<WireLabel> = self
            .get_json(&format!(
                "/repos/{}/{}/issues/{}/labels?per_page=100",
                id.owner, id.repo, id.number
            ))
            .await?;
        Ok(labels.into_iter().map(|l| l.name).collect())
    }

    async fn swap_marker(&self, id: &TicketId, from: &str, to: &str) -> Result<MarkerSwap> {
        // Remove-then-add; a 404 on the remove means the marker was already
        // gone, i.e. our read was stale.
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!(
                    "/repos/{}/{}/issues/{}/labels/{}",
                    id.owner,
                    id.repo,
                    id.number,
                    urlencode(from)
                ),
            )
            .send()
            .await
            .map_err(wrap_transport)?;
        if resp.status().as_u16() == 404 {
            return Ok(MarkerSwap::Conflict);
        }
        self.check(resp).await?;
        self.add_marker(id, to).await?;
        Ok(MarkerSwap::Applied)
    }

    async fn add_marker(&self, id: &TicketId, marker: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/issues/{}/labels", id.owner, id.repo, id.number),
            )
            .json(&serde_json::json!({ "labels": [marker] }))
            .send()
            .await
            .map_err(wrap_transport)?;
        self.check(resp).await?;
        Ok(())
    }

    async fn remove_marker(&self, id: &TicketId, marker: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!(
                    "/repos/{}/{}/issues/{}/labels/{}",
                    id.owner,
                    id.repo,
                    id.number,
                    urlencode(marker)
                ),
            )
            .send()
            .await
            .map_err(wrap_transport)?;
        // Already absent is fine for a plain remove.
        if resp.status().as_u16() != 404 {
            self.check(resp).await?;
        }
        Ok(())
    }

    async fn comment(&self, id: &TicketId, body: &str) -> Result<()> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/repos/{}/{}/issues/{}/comments",
                    id.owner, id.repo, id.number
                ),
            )
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(wrap_transport)?;
        self.check(resp).await?;
        Ok(())
    }

    async fn comments(&self, id: &TicketId) -> Result<Vec<String>> {
        let comments: Vec<WireComment> = self
            .get_json(&format!(
                "/repos/{}/{}/issues/{}/comments?per_page=100",
                id.owner, id.repo, id.number
            ))
            .await?;
        Ok(comments.into_iter().map(|c| c.body).collect())
    }

    async fn create_issue(
        &self,
        owner: &str,
        repo: &str,
        title: &str,
        body: &str,
        markers: &[String],
    ) -> Result<u64> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/issues", owner, repo),
            )
            .json(&serde_json::json!({
                "title": title,
                "body": body,
                "labels": markers,
            }))
            .send()
            .await
            .map_err(wrap_transport)?;
        let resp = self.check(resp).await?;
        let created: WireCreated = resp.json().await.map_err(wrap_transport)?;
        Ok(created.number)
    }

    async fn find_pr(&self, id: &TicketId) -> Result<Option<(u64, PrState)>> {
        let query = format!(
            "repo:{}/{} is:pr {} in:title,body",
            id.owner, id.repo, id.number
        );
        let search: WireSearch = self
            .get_json(&format!("/search/issues?q={}", urlencode(&query)))
            .await?;
        let Some(hit) = search.items.first() else {
            return Ok(None);
        };
        let state = self.pr_state(id, hit.number).await?;
        Ok(Some((hit.number, state)))
    }

    async fn pr_state(&self, id: &TicketId, pr: u64) -> Result<PrState> {
        let pull = self.pull(id, pr).await?;
        Ok(pr_state_of(&pull.state, pull.merged_at.as_deref()))
    }

    async fn ci_status(&self, id: &TicketId, pr: u64) -> Result<CiStatus> {
        let pull = self.pull(id, pr).await?;
        let runs: WireCheckRuns = self
            .get_json(&format!(
                "/repos/{}/{}/commits/{}/check-runs",
                id.owner, id.repo, pull.head.sha
            ))
            .await?;
        Ok(reduce_check_runs(&runs.check_runs))
    }

    async fn ci_failure_logs(&self, id: &TicketId, pr: u64) -> Result<String> {
        let pull = self.pull(id, pr).await?;
        let runs: WireCheckRuns = self
            .get_json(&format!(
                "/repos/{}/{}/commits/{}/check-runs",
                id.owner, id.repo, pull.head.sha
            ))
            .await?;
        let mut out = String::new();
        for run in runs
            .check_runs
            .iter()
            .filter(|r| matches!(r.conclusion.as_deref(), Some("failure") | Some("timed_out")))
        {
            out.push_str(&format!(
                "### {}\n{}\n{}\n\n",
                run.name,
                run.output.title.as_deref().unwrap_or(""),
                run.output.summary.as_deref().unwrap_or("")
            ));
        }
        Ok(out)
    }

    async fn pr_diff(&self, id: &TicketId, pr: u64) -> Result<String> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/{}/pulls/{}", id.owner, id.repo, pr),
            )
            .header("Accept", "application/vnd.github.diff")
            .send()
            .await
            .map_err(wrap_transport)?;
        let resp = self.check(resp).await?;
        resp.text().await.map_err(wrap_transport)
    }

    async fn review_status(&self, id: &TicketId, pr: u64) -> Result<ReviewStatus> {
        let reviews: Vec<WireReview> = self
            .get_json(&format!(
                "/repos/{}/{}/pulls/{}/reviews?per_page=100",
                id.owner, id.repo, pr
            ))
            .await?;
        Ok(reduce_reviews(&reviews))
    }

    async fn pr_review_comments(&self, id: &TicketId, pr: u64) -> Result<Vec<String>> {
        let comments: Vec<WireReviewComment> = self
            .get_json(&format!(
                "/repos/{}/{}/pulls/{}/comments?per_page=100",
                id.owner, id.repo, pr
            ))
            .await?;
        Ok(comments
            .into_iter()
            .map(|c| match c.path {
                Some(path) => format!("@{} ({}): {}", c.user.login, path, c.body),
                None => format!("@{}: {}", c.user.login, c.body),
            })
            .collect())
    }

    async fn request_review(&self, id: &TicketId, pr: u64, reviewer: &str) -> Result<()> {
        let (key, value) = if let Some(team) = reviewer.strip_prefix('@') {
            match team.split_once('/') {
                Some((_, slug)) => ("team_reviewers", slug.to_string()),
                None => ("reviewers", team.to_string()),
            }
        } else {
            ("reviewers", reviewer.to_string())
        };
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!(
                    "/repos/{}/{}/pulls/{}/requested_reviewers",
                    id.owner, id.repo, pr
                ),
            )
            .json(&serde_json::json!({ key: [value] }))
            .send()
            .await
            .map_err(wrap_transport)?;
        self.check(resp).await?;
        Ok(())
    }

    async fn mention(&self, id: &TicketId, who: &str, message: &str) -> Result<()> {
        let who = if who.starts_with('@') {
            who.to_string()
        } else {
            format!("@{}", who)
        };
        self.comment(id, &format!("{} {}", who, message)).await
    }

    async fn fetch_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Option<String>> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("/repos/{}/{}/contents/{}?ref={}", owner, repo, path, git_ref),
            )
            .header("Accept", "application/vnd.github.raw+json")
            .send()
            .await
            .map_err(wrap_transport)?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = self.check(resp).await?;
        Ok(Some(resp.text().await.map_err(wrap_transport)?))
    }
}

/// Percent-encode the characters GitHub query strings trip over.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            ' ' => out.push_str("%20"),
            '#' => out.push_str("%23"),
            '&' => out.push_str("%26"),
            '+' => out.push_str("%2B"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            '?' => out.push_str("%3F"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_from_url_parses() {
        assert_eq!(
            repo_from_url("https://api.github.com/repos/acme/api"),
            Some(("acme".into(), "api".into()))
        );
        assert_eq!(repo_from_url("https://example.com/nope"), None);
    }

    #[test]
    fn pr_state_prefers_merged() {
        assert_eq!(pr_state_of("closed", Some("2026-01-01")), PrState::Merged);
        assert_eq!(pr_state_of("closed", None), PrState::Closed);
        assert_eq!(pr_state_of("open", None), PrState::Open);
    }

    fn run(status: &str, conclusion: Option<&str>) -> WireCheckRun {
        WireCheckRun {
            name: "ci".into(),
            status: status.into(),
            conclusion: conclusion.map(String::from),
            output: WireCheckOutput::default(),
        }
    }

    #[test]
    fn check_runs_any_failure_fails() {
        let runs = vec![run("completed", Some("success")), run("completed", Some("failure"))];
        assert_eq!(reduce_check_runs(&runs), CiStatus::Failed);
    }

    #[test]
    fn check_runs_unfinished_is_pending() {
        let runs = vec![run("completed", Some("success")), run("in_progress", None)];
        assert_eq!(reduce_check_runs(&runs), CiStatus::Pending);
    }

    #[test]
    fn check_runs_all_green_passes() {
        let runs = vec![run("completed", Some("success")), run("completed", Some("skipped"))];
        assert_eq!(reduce_check_runs(&runs), CiStatus::Passed);
    }

    #[test]
    fn empty_check_runs_pass() {
        // No CI configured counts as green, matching the original behavior.
        assert_eq!(reduce_check_runs(&[]), CiStatus::Passed);
    }

    fn review(login: &str, state: &str) -> WireReview {
        WireReview {
            state: state.into(),
            user: WireUser {
                login: login.into(),
            },
        }
    }

    #[test]
    fn reviews_changes_requested_outranks_approval() {
        let reviews = vec![review("a", "APPROVED"), review("b", "CHANGES_REQUESTED")];
        assert_eq!(reduce_reviews(&reviews), ReviewStatus::ChangesRequested);
    }

    #[test]
    fn reviews_latest_per_author_wins() {
        let reviews = vec![review("a", "CHANGES_REQUESTED"), review("a", "APPROVED")];
        assert_eq!(reduce_reviews(&reviews), ReviewStatus::Approved);
    }

    #[test]
    fn reviews_none_is_pending() {
        assert_eq!(reduce_reviews(&[]), ReviewStatus::Pending);
    }

    #[test]
    fn urlencode_escapes_query_characters() {
        assert_eq!(urlencode("org:acme label:drover"), "org%3Aacme%20label%3Adrover");
    }
}
