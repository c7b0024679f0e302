//! Agent invocation layer.
//!
//! A stage handler describes the work it wants done as an [`AgentTask`];
//! the [`Agent`] runs it and returns a normalized [`AgentReport`]. The
//! production implementation ([`CliAgent`]) shells out to the `claude`
//! CLI; tests use [`ScriptedAgent`].

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use drover_types::Result;

pub mod cli;
pub mod prompts;
pub mod verdict;

pub use cli::CliAgent;

/// Coarse classification of an agent run, before any stage-specific
/// verdict parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentVerdict {
    /// The agent finished the task.
    Complete,
    /// The agent emitted a blocked marker.
    Blocked,
    /// The agent emitted a needs-input marker.
    NeedsInput,
}

/// One unit of agent work.
#[derive(Debug, Clone)]
pub struct AgentTask {
    /// Short name used in logs and error messages ("planner", "reviewer", ...).
    pub agent: String,
    pub prompt: String,
    /// Working directory for the invocation, when the task touches a checkout.
    pub workdir: Option<String>,
}

impl AgentTask {
    pub fn new(agent: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            prompt: prompt.into(),
            workdir: None,
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

/// Normalized agent output.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub text: String,
    pub cost_usd: f64,
    pub turns: u32,
}

impl AgentReport {
    /// Classify the report by the completion markers the prompts ask for.
    pub fn verdict(&self) -> AgentVerdict {
        verdict::classify(&self.text)
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, task: &AgentTask) -> Result<AgentReport>;
}

/// Test double that replays canned responses in order.
///
/// Each queued entry is either a report or an error; `invoke` pops the
/// front. An exhausted script returns an empty completed report so tests
/// that only care about earlier calls do not have to pad the queue.
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<VecDeque<Result<AgentReport>>>,
    calls: Mutex<Vec<AgentTask>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, text: &str) {
        self.script.lock().unwrap().push_back(Ok(AgentReport {
            text: text.to_string(),
            cost_usd: 0.0,
            turns: 1,
        }));
    }

    pub fn push_err(&self, err: drover_types::DroverError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Tasks seen so far, in invocation order.
    pub fn calls(&self) -> Vec<AgentTask> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, task: &AgentTask) -> Result<AgentReport> {
        self.calls.lock().unwrap().push(task.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(AgentReport {
                text: String::new(),
                cost_usd: 0.0,
                turns: 0,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_agent_replays_in_order() {
        let agent = ScriptedAgent::new();
        agent.push_text("first");
        agent.push_err(drover_types::DroverError::RateLimited { retry_after_secs: 5 });

        let task = AgentTask::new("planner", "do the thing");
        assert_eq!(agent.invoke(&task).await.unwrap().text, "first");
        assert!(agent.invoke(&task).await.is_err());
        // Exhausted script yields an empty report.
        assert_eq!(agent.invoke(&task).await.unwrap().text, "");
        assert_eq!(agent.calls().len(), 3);
    }

    #[test]
    fn report_verdict_uses_markers() {
        let report = AgentReport {
            text: "analysis...\n[IMPLEMENTATION_BLOCKED] missing credentials".into(),
            cost_usd: 0.1,
            turns: 3,
        };
        assert_eq!(report.verdict(), AgentVerdict::Blocked);
    }
}
