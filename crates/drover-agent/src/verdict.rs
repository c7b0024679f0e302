//! Parsing of agent output into verdicts.
//!
//! Prompts ask the agent to finish with a bracketed completion marker,
//! and review-style prompts ask for a small JSON verdict object. Parsing
//! is deliberately forgiving: anything unrecognized degrades to the
//! conservative outcome (escalation) rather than a guess at success.

use crate::AgentVerdict;

const BLOCKED_MARKERS: [&str; 3] = [
    "[IMPLEMENTATION_BLOCKED]",
    "[CI_FIX_BLOCKED]",
    "[REVIEW_ESCALATE]",
];

const NEEDS_INPUT_MARKERS: [&str; 2] = ["[NEEDS_MORE_INFO]", "[SPEC_NEEDS_INPUT]"];

/// Marker the backlog generator emits when every story has been filed.
pub const BACKLOG_COMPLETE: &str = "[BACKLOG_COMPLETE]";

pub fn classify(text: &str) -> AgentVerdict {
    if BLOCKED_MARKERS.iter().any(|m| text.contains(m)) {
        AgentVerdict::Blocked
    } else if NEEDS_INPUT_MARKERS.iter().any(|m| text.contains(m)) {
        AgentVerdict::NeedsInput
    } else {
        AgentVerdict::Complete
    }
}

/// Reason the agent gave alongside a blocked / needs-input marker: the
/// text after the marker, or the whole output when there is none.
pub fn marker_reason(text: &str) -> String {
    for marker in BLOCKED_MARKERS.iter().chain(NEEDS_INPUT_MARKERS.iter()) {
        if let Some(idx) = text.find(marker) {
            let after = text[idx + marker.len()..].trim();
            if !after.is_empty() {
                return after.to_string();
            }
        }
    }
    text.trim().to_string()
}

/// Outcome of a quality-gate review (plan review, self review).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityVerdict {
    Pass,
    FailRetryable { feedback: String },
    FailEscalate { reason: String },
}

#[derive(serde::Deserialize)]
struct WireQuality {
    verdict: String,
    #[serde(default)]
    feedback: String,
}

/// Parse a quality-gate verdict from review output.
///
/// Expects a JSON object `{"verdict": "pass" | "fail_retryable" |
/// "fail_escalate", "feedback": "..."}` somewhere in the text. Anything
/// unparseable escalates.
pub fn quality_verdict(text: &str) -> QualityVerdict {
    let Some(parsed) = extract_json::<WireQuality>(text) else {
        return QualityVerdict::FailEscalate {
            reason: format!("unparseable review verdict: {}", snippet(text)),
        };
    };
    match parsed.verdict.as_str() {
        "pass" => QualityVerdict::Pass,
        "fail_retryable" => QualityVerdict::FailRetryable {
            feedback: parsed.feedback,
        },
        "fail_escalate" => QualityVerdict::FailEscalate {
            reason: parsed.feedback,
        },
        other => QualityVerdict::FailEscalate {
            reason: format!("unknown review verdict {:?}", other),
        },
    }
}

/// Outcome of a code-review pass over a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Clean,
    IssuesFound { summary: String },
}

#[derive(serde::Deserialize)]
struct WireReview {
    verdict: String,
    #[serde(default)]
    summary: String,
}

/// Parse a code-review verdict: `{"verdict": "clean" | "issues_found",
/// "summary": "..."}`. Unparseable output counts as issues found so a
/// garbled review never waves a change through.
pub fn review_verdict(text: &str) -> ReviewVerdict {
    let Some(parsed) = extract_json::<WireReview>(text) else {
        return ReviewVerdict::IssuesFound {
            summary: format!("unparseable review output: {}", snippet(text)),
        };
    };
    match parsed.verdict.as_str() {
        "clean" => ReviewVerdict::Clean,
        _ => ReviewVerdict::IssuesFound {
            summary: parsed.summary,
        },
    }
}

/// Pull a PR number out of agent output: a `pull/123` URL first, then a
/// bare `#123` reference.
pub fn extract_pr_number(text: &str) -> Option<u64> {
    let url = regex::Regex::new(r"pull/(\d+)").ok()?;
    if let Some(caps) = url.captures(text) {
        if let Ok(n) = caps[1].parse() {
            return Some(n);
        }
    }
    let hash = regex::Regex::new(r"#(\d+)").ok()?;
    hash.captures(text).and_then(|caps| caps[1].parse().ok())
}

/// Find and parse the first JSON object in `text`, tolerating markdown
/// code fences around it.
fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> Option<T> {
    let start = text.find('{')?;
    // Walk to the matching close brace, respecting string literals.
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
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + idx + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn snippet(text: &str) -> &str {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .map(|(i, c)| i + c.len_utf8())
        .take_while(|&i| i <= 200)
        .last()
        .unwrap_or(0);
    &trimmed[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_markers() {
        assert_eq!(classify("all done, PR opened"), AgentVerdict::Complete);
        assert_eq!(
            classify("can't proceed [IMPLEMENTATION_BLOCKED] no test creds"),
            AgentVerdict::Blocked
        );
        assert_eq!(
            classify("[NEEDS_MORE_INFO] which database?"),
            AgentVerdict::NeedsInput
        );
    }

    #[test]
    fn marker_reason_takes_trailing_text() {
        assert_eq!(
            marker_reason("[NEEDS_MORE_INFO] which database?"),
            "which database?"
        );
        assert_eq!(marker_reason("no marker here"), "no marker here");
    }

    #[test]
    fn quality_verdict_parses_fenced_json() {
        let text = "Review complete.\n```json\n{\"verdict\": \"fail_retryable\", \"feedback\": \"missing rollout plan\"}\n```";
        assert_eq!(
            quality_verdict(text),
            QualityVerdict::FailRetryable {
                feedback: "missing rollout plan".into()
            }
        );
    }

    #[test]
    fn quality_verdict_escalates_on_garbage() {
        assert!(matches!(
            quality_verdict("lgtm i guess"),
            QualityVerdict::FailEscalate { .. }
        ));
        assert!(matches!(
            quality_verdict(r#"{"verdict": "maybe"}"#),
            QualityVerdict::FailEscalate { .. }
        ));
    }

    #[test]
    fn review_verdict_defaults_to_issues() {
        assert_eq!(
            review_verdict(r#"{"verdict": "clean", "summary": ""}"#),
            ReviewVerdict::Clean
        );
        assert!(matches!(
            review_verdict("the diff looks fine"),
            ReviewVerdict::IssuesFound { .. }
        ));
    }

    #[test]
    fn pr_number_prefers_url() {
        assert_eq!(
            extract_pr_number("opened https://github.com/acme/api/pull/42 for issue #7"),
            Some(42)
        );
        assert_eq!(extract_pr_number("see PR #42"), Some(42));
        assert_eq!(extract_pr_number("no reference"), None);
    }

    #[test]
    fn extract_json_handles_nested_and_strings() {
        #[derive(serde::Deserialize)]
        struct T {
            verdict: String,
        }
        let text = r#"prefix {"verdict": "pass", "meta": {"note": "brace } in string"}} suffix"#;
        let parsed: T = extract_json(text).unwrap();
        assert_eq!(parsed.verdict, "pass");
    }

    #[test]
    fn snippet_cuts_on_char_boundaries() {
        // 2-byte chars put byte 200 inside a character.
        let text = "é".repeat(300);
        let cut = snippet(&text);
        assert!(cut.len() <= 200);
        assert!(text.starts_with(cut));
        assert_eq!(snippet("short"), "short");
    }
}
