//! Three-layer rules resolution for per-repo agent configuration.
//!
//! Layers, most specific wins:
//! 1. Built-in defaults
//! 2. Org layer: `.drover/config.toml` + `.drover/rules.md` in the
//!    engineering repo
//! 3. Repo layer: the same files in the target repo
//!
//! Fetches go through the [`Tracker`]; missing files fall back silently.

use serde::Deserialize;

use drover_tracker::Tracker;
use drover_types::{DroverConfig, Result};

const CONFIG_PATH: &str = ".drover/config.toml";
const RULES_PATH: &str = ".drover/rules.md";

/// Merged rules for one repo context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRules {
    pub branch_pattern: String,
    pub commit_format: String,
    pub notify_team: String,
    pub entry_label: String,
    /// Prose context injected into agent prompts.
    pub agent_context: String,
}

impl Default for ResolvedRules {
    fn default() -> Self {
        Self {
            branch_pattern: "{number}/{slug}".into(),
            commit_format: "#{number} - {description}".into(),
            notify_team: String::new(),
            entry_label: "drover".into(),
            agent_context: String::new(),
        }
    }
}

/// Partial overlay parsed from one `.drover/config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
struct RulesOverlay {
    branch_pattern: Option<String>,
    commit_format: Option<String>,
    notify_team: Option<String>,
    entry_label: Option<String>,
}

fn apply_overlay(rules: &mut ResolvedRules, overlay: RulesOverlay) {
    if let Some(v) = overlay.branch_pattern {
        rules.branch_pattern = v;
    }
    if let Some(v) = overlay.commit_format {
        rules.commit_format = v;
    }
    if let Some(v) = overlay.notify_team {
        rules.notify_team = v;
    }
    if let Some(v) = overlay.entry_label {
        rules.entry_label = v;
    }
}

fn parse_overlay(text: &str, owner: &str, repo: &str) -> RulesOverlay {
    match toml::from_str(text) {
        Ok(overlay) => overlay,
        Err(err) => {
            tracing::warn!(owner, repo, error = %err, "ignoring unparseable rules config");
            RulesOverlay::default()
        }
    }
}

async fn load_layer(
    tracker: &dyn Tracker,
    owner: &str,
    repo: &str,
    git_ref: &str,
) -> Result<(RulesOverlay, String)> {
    let overlay = match tracker.fetch_file(owner, repo, CONFIG_PATH, git_ref).await? {
        Some(text) => parse_overlay(&text, owner, repo),
        None => RulesOverlay::default(),
    };
    let rules_md = tracker
        .fetch_file(owner, repo, RULES_PATH, git_ref)
        .await?
        .unwrap_or_default();
    Ok((overlay, rules_md))
}

fn merge_agent_context(org_rules_md: &str, repo_rules_md: &str) -> String {
    let mut parts = Vec::new();
    if !org_rules_md.trim().is_empty() {
        parts.push(format!("# Organization Guidelines\n\n{}", org_rules_md.trim()));
    }
    if !repo_rules_md.trim().is_empty() {
        parts.push(format!("# Repository Guidelines\n\n{}", repo_rules_md.trim()));
    }
    parts.join("\n\n---\n\n")
}

/// Load and merge rules for `owner/repo`.
pub async fn load_rules(
    tracker: &dyn Tracker,
    owner: &str,
    repo: &str,
    config: &DroverConfig,
) -> Result<ResolvedRules> {
    let mut rules = ResolvedRules {
        notify_team: config.notify_team.clone(),
        entry_label: config.entry_label.clone(),
        ..ResolvedRules::default()
    };
    let git_ref = config.default_branch.as_str();

    let (org_overlay, org_rules_md) =
        load_layer(tracker, owner, &config.engineering_repo, git_ref).await?;
    apply_overlay(&mut rules, org_overlay);

    let mut repo_rules_md = String::new();
    if repo != config.engineering_repo {
        let (repo_overlay, md) = load_layer(tracker, owner, repo, git_ref).await?;
        apply_overlay(&mut rules, repo_overlay);
        repo_rules_md = md;
    }

    rules.agent_context = merge_agent_context(&org_rules_md, &repo_rules_md);
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_tracker::MemoryTracker;

    fn config() -> DroverConfig {
        DroverConfig {
            org: "acme".into(),
            notify_team: "@acme/platform".into(),
            ..DroverConfig::default()
        }
    }

    #[tokio::test]
    async fn defaults_when_no_layer_defines_anything() {
        let tracker = MemoryTracker::new();
        let rules = load_rules(&tracker, "acme", "api", &config()).await.unwrap();
        assert_eq!(rules.branch_pattern, "{number}/{slug}");
        assert_eq!(rules.notify_team, "@acme/platform");
        assert_eq!(rules.entry_label, "drover");
        assert!(rules.agent_context.is_empty());
    }

    #[tokio::test]
    async fn repo_layer_wins_over_org_layer() {
        let tracker = MemoryTracker::new();
        tracker.seed_file(
            "acme",
            "engineering",
            ".drover/config.toml",
            "branch_pattern = \"org/{number}\"\nnotify_team = \"@acme/org-team\"\n",
        );
        tracker.seed_file(
            "acme",
            "api",
            ".drover/config.toml",
            "branch_pattern = \"api/{number}-{slug}\"\n",
        );

        let rules = load_rules(&tracker, "acme", "api", &config()).await.unwrap();
        assert_eq!(rules.branch_pattern, "api/{number}-{slug}");
        // Unset in the repo layer, inherited from the org layer.
        assert_eq!(rules.notify_team, "@acme/org-team");
    }

    #[tokio::test]
    async fn prose_layers_are_concatenated() {
        let tracker = MemoryTracker::new();
        tracker.seed_file("acme", "engineering", ".drover/rules.md", "always squash");
        tracker.seed_file("acme", "api", ".drover/rules.md", "api uses sqlx");

        let rules = load_rules(&tracker, "acme", "api", &config()).await.unwrap();
        assert!(rules.agent_context.contains("# Organization Guidelines"));
        assert!(rules.agent_context.contains("always squash"));
        assert!(rules.agent_context.contains("# Repository Guidelines"));
        assert!(rules.agent_context.contains("api uses sqlx"));
    }

    #[tokio::test]
    async fn engineering_repo_skips_repo_layer() {
        let tracker = MemoryTracker::new();
        tracker.seed_file("acme", "engineering", ".drover/rules.md", "org prose");
        let rules = load_rules(&tracker, "acme", "engineering", &config())
            .await
            .unwrap();
        assert!(rules.agent_context.contains("org prose"));
        assert!(!rules.agent_context.contains("# Repository Guidelines"));
    }

    #[tokio::test]
    async fn bad_toml_is_ignored() {
        let tracker = MemoryTracker::new();
        tracker.seed_file("acme", "api", ".drover/config.toml", "not = [valid");
        let rules = load_rules(&tracker, "acme", "api", &config()).await.unwrap();
        assert_eq!(rules.branch_pattern, "{number}/{slug}");
    }
}
