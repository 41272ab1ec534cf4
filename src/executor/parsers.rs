//! Sentinel parsers over accumulated agent output. Every pattern here has a
//! matching builder in [`crate::prompts`] that embeds the literal sentinel it
//! searches for, so these parsers are total with respect to a well-behaved
//! agent.

use std::sync::LazyLock;

use regex::Regex;

use ralph_common::event::TestOutcome;

static BLOCKING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)cannot (complete|proceed)").unwrap(),
        Regex::new(r"(?i)unclear requirements").unwrap(),
        Regex::new(r"(?i)missing.*dependencies").unwrap(),
    ]
});

static TOKEN_USAGE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)input:\s*([\d,]+).*?output:\s*([\d,]+)").unwrap()
});

static TEST_RESULT_VERIFIED: &str = "<test-result>PRD_VERIFIED</test-result>";
static TEST_RESULT_FAILED: &str = "<test-result>PRD_FAILED</test-result>";
static COMPLETION_PROMISE: &str = "<promise>COMPLETE</promise>";

static ISSUES_BLOCK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<issues>(.*?)</issues>").unwrap());

static HEALTHCHECK_RESULT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<healthcheck-result>(FIXED|NOT_FIXABLE)</healthcheck-result>").unwrap());

static CHECKLIST_ITEM_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*-\s*\[( |x|X)\]\s*(.+?)(?:\s*\*\*Reason:\*\*\s*(.*))?$").unwrap());

/// `true` when `<promise>COMPLETE</promise>` appears literally.
pub fn has_completion_signal(output: &str) -> bool {
    output.contains(COMPLETION_PROMISE)
}

/// Derived status for a story from free-text agent output: blocking patterns
/// win over completion hints; two or more independent completion hints are
/// required before declaring `completed`, to avoid a single stray phrase
/// flipping status. Falls back to a `{"status":"completed"|"blocked"}` JSON
/// fragment if neither textual rule fires.
pub fn parse_status(output: &str, story_id: &str) -> Option<&'static str> {
    let blocked_by_id = output.contains(&format!("{story_id} blocked"));
    let blocked_by_pattern = BLOCKING_PATTERNS.iter().any(|re| re.is_match(output));
    if blocked_by_id || blocked_by_pattern {
        return Some("blocked");
    }

    let completion_hints = [
        format!("{story_id} completed"),
        format!("marked {story_id} as completed"),
        format!("{story_id} status completed"),
        "All checks pass".to_string(),
        "Committed changes".to_string(),
    ];
    let hits = completion_hints.iter().filter(|hint| output.contains(hint.as_str())).count();
    if hits >= 2 {
        return Some("completed");
    }

    if let Some(json) = crate::util::extract_json_object(output)
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&json)
        && let Some(status) = value.get("status").and_then(|s| s.as_str())
    {
        return match status {
            "completed" => Some("completed"),
            "blocked" => Some("blocked"),
            _ => None,
        };
    }

    None
}

/// `Input: <n>` / `Output: <n>` token counts, comma-separators tolerated.
pub fn parse_token_usage(output: &str) -> Option<(u64, u64)> {
    let caps = TOKEN_USAGE_REGEX.captures(output)?;
    let input: u64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let output_tokens: u64 = caps.get(2)?.as_str().replace(',', "").parse().ok()?;
    Some((input, output_tokens))
}

pub fn detect_test_result(output: &str) -> Option<TestOutcome> {
    if output.contains(TEST_RESULT_VERIFIED) {
        Some(TestOutcome::Verified)
    } else if output.contains(TEST_RESULT_FAILED) {
        Some(TestOutcome::Failed)
    } else {
        None
    }
}

/// Hyphen-prefixed lines inside `<issues>...</issues>`.
pub fn extract_issues(output: &str) -> Vec<String> {
    extract_hyphen_items(&ISSUES_BLOCK_REGEX, output)
}

fn extract_hyphen_items(block_re: &Regex, output: &str) -> Vec<String> {
    let Some(caps) = block_re.captures(output) else {
        return Vec::new();
    };
    caps[1]
        .lines()
        .filter_map(|line| line.trim().strip_prefix('-'))
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthCheckFixResult {
    Fixed,
    NotFixable,
}

pub fn detect_health_check_result(output: &str) -> Option<HealthCheckFixResult> {
    let caps = HEALTHCHECK_RESULT_REGEX.captures(output)?;
    match &caps[1] {
        "FIXED" => Some(HealthCheckFixResult::Fixed),
        "NOT_FIXABLE" => Some(HealthCheckFixResult::NotFixable),
        _ => None,
    }
}

/// Parse a `test-results/report.md` document (or raw agent output containing
/// the same checklist shape) into a `(outcome, issues)` pair: scans `[x]`
/// and `[ ]` items, counting pass/fail, and prefers an explicit
/// `detect_test_result` sentinel for the outcome when present.
pub fn parse_test_report(text: &str) -> (TestOutcome, Vec<String>) {
    let outcome = detect_test_result(text).unwrap_or_else(|| {
        let (passed, failed) = count_checklist(text);
        if failed > 0 {
            TestOutcome::Failed
        } else if passed > 0 {
            TestOutcome::Verified
        } else {
            TestOutcome::Unknown
        }
    });

    let mut issues = extract_issues(text);
    if issues.is_empty() {
        issues = failed_checklist_items(text);
    }
    (outcome, issues)
}

fn count_checklist(text: &str) -> (u32, u32) {
    let mut passed = 0;
    let mut failed = 0;
    for caps in CHECKLIST_ITEM_REGEX.captures_iter(text) {
        match &caps[1] {
            "x" | "X" => passed += 1,
            _ => failed += 1,
        }
    }
    (passed, failed)
}

/// `[ ]` items, with their `**Reason:**` suffix folded in when present.
fn failed_checklist_items(text: &str) -> Vec<String> {
    CHECKLIST_ITEM_REGEX
        .captures_iter(text)
        .filter(|caps| &caps[1] == " ")
        .map(|caps| match caps.get(3) {
            Some(reason) if !reason.as_str().trim().is_empty() => {
                format!("{} - {}", caps[2].trim(), reason.as_str().trim())
            }
            _ => caps[2].trim().to_string(),
        })
        .collect()
}
