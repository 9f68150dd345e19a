//! Reviewer: deterministic citation checks plus an LLM tone review.

use super::writer::{INSUFFICIENT_DATA, REFERENCES_HEADING};
use super::{Stage, StageContext, StageFailure, StageKind, citation_markers, prompts};
use crate::error::ProviderError;
use crate::providers::failover::LlmRequest;
use crate::state::{ResearchState, ReviewNote, Severity, StageErrorRecord, StateDelta};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

pub struct Reviewer;

const PLACEHOLDER_PATTERNS: &[&str] = &[
    r"\b(?:TODO|TBD|FIXME)\b",
    r"(?i)\blorem ipsum\b",
    r"(?i)\[citation needed\]",
];

static PLACEHOLDERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PLACEHOLDER_PATTERNS
        .iter()
        .map(|pat| Regex::new(pat).expect("valid placeholder pattern"))
        .collect()
});

/// Level-two sections of a report as `(heading, body)` pairs.
fn sections(report: &str) -> Vec<(&str, String)> {
    let mut out: Vec<(&str, String)> = Vec::new();
    for line in report.lines() {
        if let Some(heading) = line.strip_prefix("## ") {
            out.push((heading.trim(), String::new()));
        } else if let Some((_, body)) = out.last_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }
    out
}

/// Numbered entries under the references heading.
fn reference_count(report: &str) -> usize {
    let Some(start) = report.find(REFERENCES_HEADING) else {
        return 0;
    };
    report[start + REFERENCES_HEADING.len()..]
        .lines()
        .take_while(|l| !l.starts_with("## "))
        .filter(|l| {
            let digits = l.chars().take_while(|c| c.is_ascii_digit()).count();
            digits > 0 && l[digits..].starts_with(". ")
        })
        .count()
}

/// Checks that need no model: dangling markers, uncited sections and
/// leftover placeholders.
pub fn citation_checks(report: &str) -> Vec<ReviewNote> {
    let mut notes = Vec::new();
    let references = reference_count(report);
    let body = report
        .find(REFERENCES_HEADING)
        .map_or(report, |end| &report[..end]);

    let mut dangling: Vec<usize> = citation_markers(body)
        .into_iter()
        .filter(|n| *n == 0 || *n > references)
        .collect();
    dangling.sort_unstable();
    dangling.dedup();
    if !dangling.is_empty() {
        notes.push(ReviewNote {
            severity: Severity::Critical,
            location: "References".to_string(),
            suggestion: format!(
                "citation marker(s) {dangling:?} point outside the {references} listed reference(s)"
            ),
        });
    }

    for (heading, text) in sections(body) {
        if heading.eq_ignore_ascii_case("summary") || text.contains(INSUFFICIENT_DATA) {
            continue;
        }
        if !text.trim().is_empty() && citation_markers(&text).is_empty() {
            notes.push(ReviewNote {
                severity: Severity::Warning,
                location: heading.to_string(),
                suggestion: "section makes claims without citing any source".to_string(),
            });
        }
    }

    for (heading, text) in sections(body) {
        if PLACEHOLDERS.iter().any(|re| re.is_match(&text)) {
            notes.push(ReviewNote {
                severity: Severity::Warning,
                location: heading.to_string(),
                suggestion: "remove placeholder text".to_string(),
            });
        }
    }

    notes
}

/// Parse `severity | location | suggestion` lines; anything else is ignored.
pub fn parse_review_notes(text: &str) -> Vec<ReviewNote> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['-', '*']).trim();
            let mut parts = line.splitn(3, '|').map(str::trim);
            let severity = parts.next()?.trim_matches(['[', ']']).parse::<Severity>().ok()?;
            let location = parts.next()?;
            let suggestion = parts.next()?;
            if suggestion.is_empty() {
                return None;
            }
            Some(ReviewNote {
                severity,
                location: location.to_string(),
                suggestion: suggestion.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl Stage for Reviewer {
    fn kind(&self) -> StageKind {
        StageKind::Reviewer
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let draft = state
            .draft_report
            .as_deref()
            .ok_or_else(|| StageFailure::Fatal("no draft to review".into()))?;

        let mut delta = StateDelta::new();
        let mut notes = citation_checks(draft);

        let request = LlmRequest::new(prompts::reviewer(draft, state.tone, &state.guidelines))
            .with_system(prompts::REVIEWER_SYSTEM);
        match ctx.coordinator.complete(&request, &ctx.cancel).await {
            Ok(text) => notes.extend(parse_review_notes(&text)),
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
            Err(e) => {
                warn!(run_id = %ctx.run_id, error = %e, "Tone review skipped");
                delta = delta.with_error(StageErrorRecord::warning(
                    StageKind::Reviewer,
                    format!("tone review skipped: {e}"),
                ));
            }
        }

        debug!(run_id = %ctx.run_id, notes = notes.len(), "Review finished");
        if notes.is_empty() {
            delta = delta.with_final_report(draft);
        }
        Ok(delta.with_review_notes(notes))
    }
}
