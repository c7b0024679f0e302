//! Spec path: initiatives in the engineering repo flow through spec
//! generation, spec approval, and backlog generation before stories fan
//! out as ordinary development tickets.

use async_trait::async_trait;
use serde::Deserialize;

use drover_agent::{prompts, verdict, AgentTask, AgentVerdict};
use drover_tracker::PrState;
use drover_types::{Result, Stage, StageOutcome, Ticket};

use super::{run_agent, AgentRun, StageContext, StageHandler};

fn spec_path(issue_number: u64) -> String {
    format!("specs/{}/SPEC.md", issue_number)
}

/// Generates a product spec from an initiative issue.
pub struct SpecHandler;

#[async_trait]
impl StageHandler for SpecHandler {
    fn stage(&self) -> Stage {
        Stage::Spec
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let comments = ctx.tracker.comments(&ticket.id).await?;
        if comments.iter().any(|c| c.contains("Spec PR:")) {
            tracing::info!(ticket = %ticket.id, "spec already exists");
            return Ok(StageOutcome::advance().with_notes("spec already generated"));
        }

        let issue = ctx.tracker.issue(&ticket.id).await?;
        let prompt = prompts::spec(&ticket.id, &issue.body, &ctx.rules.agent_context);
        let mut task = AgentTask::new("spec-writer", prompt);
        if let Some(dir) = &ticket.work_dir {
            task = task.in_dir(dir);
        }

        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!("spec agent errored: {}", message)))
            }
        };

        if report.verdict() == AgentVerdict::NeedsInput {
            return Ok(StageOutcome::escalate(format!(
                "spec agent needs more input: {}",
                verdict::marker_reason(&report.text)
            ))
            .with_agent("spec-writer", report.cost_usd, report.turns));
        }

        let pr_note = match verdict::extract_pr_number(&report.text) {
            Some(pr) => format!("Spec PR: #{}", pr),
            None => "Spec PR: opened in engineering repo".to_string(),
        };
        ctx.tracker.comment(&ticket.id, &pr_note).await?;

        Ok(StageOutcome::advance().with_agent("spec-writer", report.cost_usd, report.turns))
    }
}

/// Waits for the spec PR to merge. Purely a status check.
pub struct SpecReviewHandler;

#[async_trait]
impl StageHandler for SpecReviewHandler {
    fn stage(&self) -> Stage {
        Stage::SpecReview
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let comments = ctx.tracker.comments(&ticket.id).await?;
        let spec_pr = comments.iter().rev().find_map(|c| {
            let idx = c.find("Spec PR: #")?;
            c[idx + "Spec PR: #".len()..]
                .split(|ch: char| !ch.is_ascii_digit())
                .next()?
                .parse::<u64>()
                .ok()
        });

        let Some(pr) = spec_pr else {
            // Spec PR not referenced yet; keep waiting.
            return Ok(StageOutcome::pending());
        };

        match ctx.tracker.pr_state(&ticket.id, pr).await? {
            PrState::Merged => Ok(StageOutcome::advance()),
            PrState::Closed => Ok(StageOutcome::escalate("spec PR was closed without merging")),
            PrState::Open => Ok(StageOutcome::pending()),
        }
    }
}

/// Confirms the approved spec is fetchable before backlog generation.
pub struct SpecApprovedHandler;

#[async_trait]
impl StageHandler for SpecApprovedHandler {
    fn stage(&self) -> Stage {
        Stage::SpecApproved
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let spec = ctx
            .tracker
            .fetch_file(
                &ticket.id.owner,
                &ticket.id.repo,
                &spec_path(ticket.id.number),
                &ctx.config.default_branch,
            )
            .await?;
        match spec {
            Some(_) => Ok(StageOutcome::advance()),
            None => Ok(StageOutcome::escalate("could not find approved spec content")),
        }
    }
}

/// One backlog story as the generator emits it.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Story {
    pub title: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimate: String,
    #[serde(default)]
    pub notes: String,
}

/// First JSON array in `text`, parsed as stories.
pub(crate) fn extract_stories(text: &str) -> Vec<Story> {
    serde_json::from_value(extract_raw_array(text)).unwrap_or_default()
}

/// First JSON array in `text` as a raw value, tolerating surrounding prose
/// and markdown fences. Bracket matching respects string literals.
fn extract_raw_array(text: &str) -> serde_json::Value {
    let empty = serde_json::Value::Array(Vec::new());
    let Some(start) = text.find('[') else {
        return empty;
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str(&text[start..start + idx + 1]).unwrap_or(empty);
                }
            }
            _ => {}
        }
    }
    empty
}

/// Breaks the approved spec into stories and posts them for review.
pub struct BacklogGenHandler;

#[async_trait]
impl StageHandler for BacklogGenHandler {
    fn stage(&self) -> Stage {
        Stage::BacklogGen
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let spec = ctx
            .tracker
            .fetch_file(
                &ticket.id.owner,
                &ticket.id.repo,
                &spec_path(ticket.id.number),
                &ctx.config.default_branch,
            )
            .await?;
        let Some(spec_text) = spec else {
            return Ok(StageOutcome::escalate("approved spec disappeared before backlog"));
        };

        let prompt = prompts::backlog(&ticket.id, &spec_text, &ctx.rules.agent_context);
        let task = AgentTask::new("backlog-generator", prompt);
        let report = match run_agent(ctx, &task).await? {
            AgentRun::Report(report) => report,
            AgentRun::Failed(message) => {
                return Ok(StageOutcome::escalate(format!(
                    "backlog generation errored: {}",
                    message
                )))
            }
        };

        if !report.text.contains(verdict::BACKLOG_COMPLETE) {
            return Ok(StageOutcome::escalate("backlog generation did not complete")
                .with_agent("backlog-generator", report.cost_usd, report.turns));
        }

        let stories = extract_stories(&report.text);
        if stories.is_empty() {
            return Ok(StageOutcome::escalate("backlog output contained no stories")
                .with_agent("backlog-generator", report.cost_usd, report.turns));
        }

        // Mirror the raw JSON onto the ticket for the review stage.
        let json = serde_json::to_string_pretty(&extract_raw_array(&report.text))
            .unwrap_or_default();
        ctx.tracker
            .comment(
                &ticket.id,
                &format!("## Generated Backlog\n\n```json\n{}\n```", json),
            )
            .await?;

        Ok(StageOutcome::advance()
            .with_notes(format!("{} stories generated", stories.len()))
            .with_agent("backlog-generator", report.cost_usd, report.turns))
    }
}

/// Waits for a human verdict on the generated backlog, then fans the
/// stories out as tracker issues.
pub struct BacklogReviewHandler;

#[async_trait]
impl StageHandler for BacklogReviewHandler {
    fn stage(&self) -> Stage {
        Stage::BacklogReview
    }

    async fn run(&self, ticket: &mut Ticket, ctx: &StageContext) -> Result<StageOutcome> {
        let comments = ctx.tracker.comments(&ticket.id).await?;

        let approved = comments.iter().any(|c| {
            let lower = c.to_lowercase();
            lower.contains("backlog approved") || lower.contains("stories approved")
        });
        let rejected = comments
            .iter()
            .any(|c| c.to_lowercase().contains("backlog rejected"));

        if rejected {
            return Ok(StageOutcome::escalate("backlog rejected by reviewer"));
        }
        if !approved {
            return Ok(StageOutcome::pending());
        }

        let stories = comments
            .iter()
            .rev()
            .filter(|c| c.contains("Generated Backlog"))
            .map(|c| extract_stories(c))
            .find(|stories| !stories.is_empty())
            .unwrap_or_default();
        if stories.is_empty() {
            return Ok(StageOutcome::escalate("backlog approved but no stories found"));
        }

        let mut created = Vec::new();
        for story in &stories {
            let target_repo = if story.repo.is_empty() {
                ticket.id.repo.clone()
            } else {
                story.repo.clone()
            };
            let mut body = story.description.clone();
            if !story.notes.is_empty() {
                body.push_str(&format!("\n\n### Notes\n{}", story.notes));
            }
            if !story.estimate.is_empty() {
                body.push_str(&format!("\n\nEstimate: {}", story.estimate));
            }
            let number = ctx
                .tracker
                .create_issue(
                    &ticket.id.owner,
                    &target_repo,
                    &story.title,
                    &body,
                    &[ctx.rules.entry_label.clone()],
                )
                .await?;
            created.push(format!("{}/{}#{}", ticket.id.owner, target_repo, number));
        }

        ctx.tracker
            .comment(
                &ticket.id,
                &format!("## Stories Created\n\n{}", created.join(", ")),
            )
            .await?;

        Ok(StageOutcome::complete().with_notes(format!("{} stories created", created.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stories_parse_from_fenced_json() {
        let text = "Here is the backlog:\n```json\n[\n  {\"title\": \"Add login\", \"repo\": \"api\", \"description\": \"...\", \"estimate\": \"M\", \"dependencies\": [], \"notes\": \"\"}\n]\n```\n[BACKLOG_COMPLETE]";
        let stories = extract_stories(text);
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].title, "Add login");
        assert_eq!(stories[0].repo, "api");
    }

    #[test]
    fn nested_arrays_do_not_truncate() {
        let text = r#"[{"title": "a", "dependencies": ["b", "c"]}]"#;
        let stories = extract_stories(text);
        assert_eq!(stories.len(), 1);
    }

    #[test]
    fn garbage_yields_no_stories() {
        assert!(extract_stories("no json here").is_empty());
        assert!(extract_stories("[unterminated").is_empty());
    }
}
