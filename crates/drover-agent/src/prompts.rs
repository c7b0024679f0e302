//! Prompt builders, one per agent role.

use drover_types::TicketId;

fn rules_section(agent_context: &str) -> String {
    if agent_context.is_empty() {
        String::new()
    } else {
        format!("\n### Project Context\n{}\n", agent_context)
    }
}

pub fn spec(id: &TicketId, description: &str, agent_context: &str) -> String {
    format!(
        "## Initiative: {id}\n\n\
         ### Description\n{description}\n\n\
         ### Repository\n{repo}\n\
         {rules}\n\
         Generate a comprehensive product specification for this initiative. \
         Write the spec to SPEC.md and open a PR in the engineering repo.\n\n\
         End with [SPEC_NEEDS_INPUT] if critical information is missing.\n",
        id = id,
        description = description,
        repo = id.full_repo(),
        rules = rules_section(agent_context),
    )
}

pub fn backlog(id: &TicketId, spec_body: &str, agent_context: &str) -> String {
    format!(
        "## Initiative: {id}\n\n\
         ### Approved Specification\n{spec_body}\n\
         {rules}\n\
         Break this specification into small, atomic implementation stories (issues).\n\n\
         CRITICAL: Your output must be ONLY a JSON array. Do NOT write files. \
         Do NOT produce markdown. Output raw JSON to stdout and nothing else.\n\n\
         Each story object must have these keys:\n\
         - \"title\": short issue title\n\
         - \"repo\": target repository name\n\
         - \"description\": issue body with acceptance criteria\n\
         - \"estimate\": \"S\", \"M\", or \"L\"\n\
         - \"dependencies\": array of story titles this depends on\n\
         - \"notes\": technical implementation notes\n\n\
         End your response with [BACKLOG_COMPLETE] after the JSON array.\n",
        id = id,
        spec_body = spec_body,
        rules = rules_section(agent_context),
    )
}

pub fn planner(id: &TicketId, description: &str, agent_context: &str) -> String {
    format!(
        "## Issue: {id}\n\n\
         ### Description\n{description}\n\n\
         ### Repository\n{repo}\n\
         {rules}\n\
         Analyze the codebase and produce a development plan for this issue. \
         Write it to PLAN.md on a feature branch.\n\n\
         End with [NEEDS_MORE_INFO] if the issue cannot be planned as written.\n",
        id = id,
        description = description,
        repo = id.full_repo(),
        rules = rules_section(agent_context),
    )
}

pub fn quality_gate(id: &TicketId, plan: &str, description: &str) -> String {
    format!(
        "## Issue: {id}\n\n\
         ### Issue Description\n{description}\n\n\
         ### Development Plan to Evaluate\n{plan}\n\n\
         Evaluate this plan. Respond with a JSON object:\n\
         {{\"verdict\": \"pass\" | \"fail_retryable\" | \"fail_escalate\", \"feedback\": \"...\"}}\n",
        id = id,
        description = description,
        plan = plan,
    )
}

pub fn implementer(id: &TicketId, plan: &str, branch_name: &str, agent_context: &str) -> String {
    format!(
        "## Issue: {id}\n\n\
         ### Branch\nCreate branch: `{branch}` from the default branch.\n\n\
         ### Development Plan\n{plan}\n\
         {rules}\n\
         Implement this plan following TDD. Create the PR when done and include \
         its URL in your final message.\n\n\
         End with [IMPLEMENTATION_BLOCKED] if you cannot complete the work.\n",
        id = id,
        branch = branch_name,
        plan = plan,
        rules = rules_section(agent_context),
    )
}

pub fn ci_fixer(id: &TicketId, pr_number: u64, failure_logs: &str) -> String {
    format!(
        "## Issue: {id}\n## PR: #{pr}\n## Repo: {repo}\n\n\
         ### CI Failure Logs\n{logs}\n\n\
         Fix the CI failures and push.\n\n\
         End with [CI_FIX_BLOCKED] if the failure is not fixable from the code.\n",
        id = id,
        pr = pr_number,
        repo = id.full_repo(),
        logs = failure_logs,
    )
}

pub fn reviewer(id: &TicketId, pr_number: u64, plan: &str, diff: &str) -> String {
    format!(
        "## Issue: {id}\n## PR: #{pr}\n## Repo: {repo}\n\n\
         ### Original Plan\n{plan}\n\n\
         ### PR Diff\n{diff}\n\n\
         Review this PR against the plan. Respond with a JSON object:\n\
         {{\"verdict\": \"clean\" | \"issues_found\", \"summary\": \"...\"}}\n",
        id = id,
        pr = pr_number,
        repo = id.full_repo(),
        plan = plan,
        diff = diff,
    )
}

pub fn review_responder(id: &TicketId, pr_number: u64, comments: &[String]) -> String {
    let comments_text = comments.join("\n\n");
    format!(
        "## Issue: {id}\n## PR: #{pr}\n## Repo: {repo}\n\n\
         ### Review Comments to Address\n{comments}\n\n\
         Address each comment with code changes and push. Reply inline using gh api.\n\n\
         End with [REVIEW_ESCALATE] if a comment requires a human decision.\n",
        id = id,
        pr = pr_number,
        repo = id.full_repo(),
        comments = comments_text,
    )
}

pub fn retro(id: &TicketId, plan: &str, metrics_summary: &str, agent_context: &str) -> String {
    format!(
        "## Retrospective: {id}\n\n\
         ### Development Plan\n{plan}\n\n\
         ### Pipeline Metrics\n{metrics}\n\
         {rules}\n\
         Analyze what went wrong during this issue and propose improvements \
         to the engineering repo.\n",
        id = id,
        plan = if plan.is_empty() { "No plan recorded." } else { plan },
        metrics = metrics_summary,
        rules = rules_section(agent_context),
    )
}

/// Branch name from the issue number and plan text, following the repo's
/// branch pattern (`{number}` and `{slug}` placeholders).
pub fn branch_name(pattern: &str, issue_number: u64, plan: &str) -> String {
    let slug = slugify(plan.lines().next().unwrap_or(""), 40);
    let slug = if slug.is_empty() { "work".to_string() } else { slug };
    pattern
        .replace("{number}", &issue_number.to_string())
        .replace("{slug}", &slug)
}

fn slugify(text: &str, max_len: usize) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for ch in text.chars() {
        if out.len() >= max_len {
            break;
        }
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}
