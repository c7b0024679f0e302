//! Production [`Agent`] backed by the `claude` CLI.

use std::time::Duration;

use async_trait::async_trait;

use drover_types::{DroverError, Result};

use crate::verdict;
use crate::{Agent, AgentReport, AgentTask};

/// Result shape from `claude -p --output-format json`.
#[derive(serde::Deserialize)]
struct ClaudeOutput {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    num_turns: u32,
}

pub struct CliAgent {
    timeout: Duration,
}

impl CliAgent {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_command(task: &AgentTask) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("claude");
        cmd.arg("-p")
            .arg(&task.prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--dangerously-skip-permissions");
        if let Some(dir) = &task.workdir {
            cmd.current_dir(dir);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd
    }
}

#[async_trait]
impl Agent for CliAgent {
    async fn invoke(&self, task: &AgentTask) -> Result<AgentReport> {
        tracing::info!(agent = %task.agent, workdir = ?task.workdir, "invoking agent");

        let mut cmd = Self::build_command(task);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| DroverError::Timeout {
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|e| DroverError::AgentError {
                agent: task.agent.clone(),
                message: format!("failed to spawn claude: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if stdout.trim().is_empty() {
            if looks_rate_limited(&stderr) {
                return Err(DroverError::RateLimited { retry_after_secs: 0 });
            }
            return Err(DroverError::AgentError {
                agent: task.agent.clone(),
                message: format!(
                    "claude produced no output. stderr: {}",
                    verdict::snippet(&stderr)
                ),
            });
        }

        let parsed: ClaudeOutput =
            serde_json::from_str(&stdout).map_err(|e| DroverError::AgentError {
                agent: task.agent.clone(),
                message: format!(
                    "failed to parse claude output: {}, raw: {}",
                    e,
                    verdict::snippet(&stdout)
                ),
            })?;

        if parsed.is_error || parsed.subtype == "error" {
            if looks_rate_limited(&parsed.result) || looks_rate_limited(&stderr) {
                return Err(DroverError::RateLimited { retry_after_secs: 0 });
            }
            return Err(DroverError::AgentError {
                agent: task.agent.clone(),
                message: parsed.result,
            });
        }

        tracing::debug!(
            agent = %task.agent,
            cost_usd = parsed.total_cost_usd,
            turns = parsed.num_turns,
            "agent run finished"
        );
        Ok(AgentReport {
            text: parsed.result,
            cost_usd: parsed.total_cost_usd,
            turns: parsed.num_turns,
        })
    }
}

/// Heuristic rate-limit detection on CLI error text.
fn looks_rate_limited(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("overloaded")
        || lower.contains("429")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection() {
        assert!(looks_rate_limited("API Error: 429 Too Many Requests"));
        assert!(looks_rate_limited("rate_limit_error: slow down"));
        assert!(looks_rate_limited("Overloaded"));
        assert!(!looks_rate_limited("compile error in main.rs"));
    }

    #[test]
    fn claude_output_parses_with_defaults() {
        let parsed: ClaudeOutput = serde_json::from_str(r#"{"result": "done"}"#).unwrap();
        assert_eq!(parsed.result, "done");
        assert!(!parsed.is_error);
        assert_eq!(parsed.num_turns, 0);
    }
}
