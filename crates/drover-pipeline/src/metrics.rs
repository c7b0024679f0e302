//! Tracker-hosted stage metrics.
//!
//! Each stage completion is mirrored into an HTML comment on the ticket
//! (`<!-- drover:{json} -->`), invisible on the rendered page but fully
//! recoverable. No database.

use serde::{Deserialize, Serialize};

use drover_tracker::Tracker;
use drover_types::{Result, TicketId};

const MARKER_PREFIX: &str = "<!-- drover:";
const MARKER_SUFFIX: &str = " -->";

/// One stage execution, as recorded on the ticket.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageRecord {
    pub stage: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub turns: u32,
    #[serde(default)]
    pub retry_number: u32,
    #[serde(default)]
    pub was_stuck: bool,
    #[serde(default)]
    pub stuck_reason: Option<String>,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub at: String,
}

impl StageRecord {
    pub fn now(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    /// Render as a hidden tracker comment.
    pub fn to_comment(&self) -> String {
        // Serialization of this struct cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}{}", MARKER_PREFIX, json, MARKER_SUFFIX)
    }
}

/// Recover stage records from raw ticket comments, skipping anything
/// that is not a well-formed record.
pub fn parse_stage_records(comments: &[String]) -> Vec<StageRecord> {
    comments
        .iter()
        .filter_map(|comment| {
            let start = comment.find(MARKER_PREFIX)? + MARKER_PREFIX.len();
            let end = comment[start..].find(MARKER_SUFFIX)? + start;
            serde_json::from_str(&comment[start..end]).ok()
        })
        .collect()
}

/// Rolled-up metrics for one ticket.
#[derive(Debug, Clone, Default)]
pub struct TicketSummary {
    pub total_stages: usize,
    pub total_retries: u32,
    pub total_cost_usd: f64,
    pub was_stuck: bool,
    pub stuck_reasons: Vec<String>,
    pub stages: Vec<StageRecord>,
}

impl TicketSummary {
    /// A ticket that retried or got stuck is worth a retrospective.
    pub fn needs_attention(&self) -> bool {
        self.total_retries > 0 || self.was_stuck
    }

    pub fn from_records(stages: Vec<StageRecord>) -> Self {
        let total_retries = stages.iter().filter(|s| s.retry_number > 0).count() as u32;
        let total_cost_usd = stages.iter().map(|s| s.cost_usd).sum();
        let was_stuck = stages.iter().any(|s| s.was_stuck);
        let stuck_reasons = stages
            .iter()
            .filter(|s| s.was_stuck)
            .filter_map(|s| s.stuck_reason.clone())
            .collect();
        Self {
            total_stages: stages.len(),
            total_retries,
            total_cost_usd,
            was_stuck,
            stuck_reasons,
            stages,
        }
    }

    /// Markdown block for the retrospective prompt.
    pub fn render(&self) -> String {
        let mut out = format!(
            "- Total stages: {}\n- Total retries: {}\n- Total cost: ${:.2}\n- Was stuck: {}\n",
            self.total_stages, self.total_retries, self.total_cost_usd, self.was_stuck
        );
        if !self.stuck_reasons.is_empty() {
            out.push_str(&format!("- Stuck reasons: {}\n", self.stuck_reasons.join(", ")));
        }
        for s in &self.stages {
            out.push_str(&format!("- **{}**", s.stage));
            if let Some(agent) = &s.agent {
                out.push_str(&format!(" (agent: {})", agent));
            }
            if s.retry_number > 0 {
                out.push_str(&format!(" -- retry #{}", s.retry_number));
            }
            if s.was_stuck {
                out.push_str(&format!(
                    " -- STUCK: {}",
                    s.stuck_reason.as_deref().unwrap_or("unknown")
                ));
            }
            out.push('\n');
        }
        out
    }
}

/// Fetch a ticket's comments and roll its records up.
pub async fn summarize(tracker: &dyn Tracker, id: &TicketId) -> Result<TicketSummary> {
    let comments = tracker.comments(id).await?;
    Ok(TicketSummary::from_records(parse_stage_records(&comments)))
}
