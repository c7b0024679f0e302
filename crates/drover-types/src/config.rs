//! Configuration, read from `DROVER_*` environment variables over defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroverConfig {
    // Tracker
    pub org: String,
    pub engineering_repo: String,
    pub default_branch: String,
    pub username: String,
    pub entry_label: String,
    pub notify_team: String,

    // Scheduler
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,

    // Retry budgets (per-stage ceilings)
    pub max_plan_retries: u32,
    pub max_implement_retries: u32,
    pub max_ci_fix_retries: u32,
    pub max_review_retries: u32,

    // Rate limiting
    pub rate_limit_base_delay_secs: u64,
    pub rate_limit_max_delay_secs: u64,
    pub rate_limit_cooldown_secs: u64,

    // External calls
    pub call_timeout_secs: u64,

    // Paths
    pub workspace_dir: PathBuf,
    /// Clone target repos into per-ticket workspaces before dispatch.
    /// Off in dry runs and tests.
    pub clone_workspaces: bool,
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            org: String::new(),
            engineering_repo: "engineering".into(),
            default_branch: "main".into(),
            username: String::new(),
            entry_label: "drover".into(),
            notify_team: String::new(),
            max_concurrent: 3,
            poll_interval_secs: 30,
            max_plan_retries: 2,
            max_implement_retries: 2,
            max_ci_fix_retries: 3,
            max_review_retries: 5,
            rate_limit_base_delay_secs: 60,
            rate_limit_max_delay_secs: 600,
            rate_limit_cooldown_secs: 300,
            call_timeout_secs: 1800,
            workspace_dir: PathBuf::from(".drover/workspaces"),
            clone_workspaces: true,
        }
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *target = v;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparseable env override"),
        }
    }
}

impl DroverConfig {
    /// Defaults overridden by any `DROVER_*` variables present in the environment.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        env_string("DROVER_ORG", &mut cfg.org);
        env_string("DROVER_ENGINEERING_REPO", &mut cfg.engineering_repo);
        env_string("DROVER_DEFAULT_BRANCH", &mut cfg.default_branch);
        env_string("DROVER_USERNAME", &mut cfg.username);
        env_string("DROVER_ENTRY_LABEL", &mut cfg.entry_label);
        env_string("DROVER_NOTIFY_TEAM", &mut cfg.notify_team);
        env_parse("DROVER_MAX_CONCURRENT", &mut cfg.max_concurrent);
        env_parse("DROVER_POLL_INTERVAL_SECS", &mut cfg.poll_interval_secs);
        env_parse("DROVER_MAX_PLAN_RETRIES", &mut cfg.max_plan_retries);
        env_parse("DROVER_MAX_IMPLEMENT_RETRIES", &mut cfg.max_implement_retries);
        env_parse("DROVER_MAX_CI_FIX_RETRIES", &mut cfg.max_ci_fix_retries);
        env_parse("DROVER_MAX_REVIEW_RETRIES", &mut cfg.max_review_retries);
        env_parse(
            "DROVER_RATE_LIMIT_BASE_DELAY_SECS",
            &mut cfg.rate_limit_base_delay_secs,
        );
        env_parse(
            "DROVER_RATE_LIMIT_MAX_DELAY_SECS",
            &mut cfg.rate_limit_max_delay_secs,
        );
        env_parse(
            "DROVER_RATE_LIMIT_COOLDOWN_SECS",
            &mut cfg.rate_limit_cooldown_secs,
        );
        env_parse("DROVER_CALL_TIMEOUT_SECS", &mut cfg.call_timeout_secs);
        if let Ok(v) = std::env::var("DROVER_WORKSPACE_DIR") {
            cfg.workspace_dir = PathBuf::from(v);
        }
        env_parse("DROVER_CLONE_WORKSPACES", &mut cfg.clone_workspaces);
        cfg
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn engineering_repo_full(&self) -> String {
        format!("{}/{}", self.org, self.engineering_repo)
    }
}
