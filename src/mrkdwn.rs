//! GitHub-flavored markdown to Slack mrkdwn conversion.
//!
//! Agent output arrives as regular markdown; Slack renders its own dialect.
//! The conversion is a fence-aware line pass: code block bodies are left
//! untouched, everything else gets the inline rewrites. Applying the
//! transform twice yields the same result as applying it once.

use once_cell::sync::Lazy;
use regex::Regex;

static BOLD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold regex"));
static STRIKE: Lazy<Regex> = Lazy::new(|| Regex::new(r"~~([^~]+)~~").expect("strike regex"));
static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("link regex"));
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s+(.*)$").expect("heading regex"));
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\s*)[*-]\s+(.*)$").expect("bullet regex"));

/// Convert GitHub-flavored markdown to Slack's mrkdwn format.
#[must_use]
pub fn markdown_to_mrkdwn(markdown: &str) -> String {
    let mut out = Vec::new();
    let mut in_fence = false;

    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            // Opening fences lose their language tag; closing fences are
            // already bare.
            out.push(if in_fence {
                line.to_owned()
            } else {
                let indent = &line[..line.len() - trimmed.len()];
                format!("{indent}```")
            });
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push(line.to_owned());
            continue;
        }

        out.push(convert_line(line));
    }

    out.join("\n").trim().to_owned()
}

fn convert_line(line: &str) -> String {
    let line = HEADING.replace(line, "*$1*");
    let line = BULLET.replace(&line, "$1\u{2022} $2");
    let line = BOLD.replace_all(&line, "*$1*");
    let line = STRIKE.replace_all(&line, "~$1~");
    let line = LINK.replace_all(&line, "<$2|$1>");
    line.into_owned()
}
