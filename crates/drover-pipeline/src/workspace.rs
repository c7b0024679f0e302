//! Per-ticket working copies for agents that touch a checkout.

use std::path::PathBuf;

use drover_types::{DroverConfig, DroverError, Result, TicketId};

pub fn workspace_path(config: &DroverConfig, id: &TicketId) -> PathBuf {
    config
        .workspace_dir
        .join(format!("{}_{}_{}", id.owner, id.repo, id.number))
}

/// Ensure a clone of the ticket's repo exists and return its path.
/// Returns `None` when workspace cloning is disabled (dry runs, tests).
pub async fn ensure_workspace(config: &DroverConfig, id: &TicketId) -> Result<Option<String>> {
    if !config.clone_workspaces {
        return Ok(None);
    }

    let path = workspace_path(config, id);
    if path.exists() {
        return Ok(Some(path.to_string_lossy().into_owned()));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let output = tokio::process::Command::new("gh")
        .args(["repo", "clone", &id.full_repo()])
        .arg(&path)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DroverError::Other(format!(
            "failed to clone {}: {}",
            id.full_repo(),
            stderr.trim()
        )));
    }
    tracing::info!(repo = %id.full_repo(), path = %path.display(), "workspace created");
    Ok(Some(path.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_per_ticket() {
        let config = DroverConfig::default();
        let a = workspace_path(&config, &TicketId::new("acme", "api", 1));
        let b = workspace_path(&config, &TicketId::new("acme", "api", 2));
        assert_ne!(a, b);
        assert!(a.ends_with("acme_api_1"));
    }

    #[tokio::test]
    async fn disabled_cloning_yields_no_workspace() {
        let config = DroverConfig {
            clone_workspaces: false,
            ..DroverConfig::default()
        };
        let got = ensure_workspace(&config, &TicketId::new("acme", "api", 1))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn existing_clone_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let config = DroverConfig {
            clone_workspaces: true,
            workspace_dir: dir.path().to_path_buf(),
            ..DroverConfig::default()
        };
        let id = TicketId::new("acme", "api", 9);
        std::fs::create_dir_all(workspace_path(&config, &id)).unwrap();

        // Present on disk, so no clone is attempted.
        let got = ensure_workspace(&config, &id).await.unwrap();
        assert_eq!(got, Some(workspace_path(&config, &id).to_string_lossy().into_owned()));
    }
}
