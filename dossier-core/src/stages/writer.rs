//! Writer: assembles the section findings into one Markdown draft.
//!
//! Section-local citation markers are renumbered against a single
//! deduplicated reference list appended as `## References`.

use super::{Stage, StageContext, StageFailure, StageKind, prompts, rewrite_citations};
use crate::error::ProviderError;
use crate::providers::failover::LlmRequest;
use crate::state::{Citation, ResearchState, StageErrorRecord, StateDelta, insert_citation};
use async_trait::async_trait;
use tracing::{debug, warn};

pub const REFERENCES_HEADING: &str = "## References";
const SUMMARY_MAX_TOKENS: usize = 400;

pub const INSUFFICIENT_DATA: &str = "_Insufficient data: no usable sources were found for this section._";

pub struct Writer;

/// A rendered draft and the references it cites.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembled {
    pub body: String,
    pub references: Vec<Citation>,
    /// Markers that pointed outside their section's citation list.
    pub dropped_markers: usize,
}

/// Render sections in plan order with globally numbered citations.
///
/// `summary` goes under its own heading right after the title.
pub fn assemble(state: &ResearchState, summary: Option<&str>) -> Assembled {
    let mut references: Vec<Citation> = Vec::new();
    let mut dropped_markers = 0;
    let mut out = format!("# {}\n", title_case(&state.query));

    if let Some(summary) = summary {
        out.push_str("\n## Summary\n\n");
        out.push_str(summary.trim());
        out.push('\n');
    }

    let count = state
        .plan
        .len()
        .max(state.section_results.keys().next_back().map_or(0, |k| k + 1));
    for index in 0..count {
        let title = state
            .plan
            .get(index)
            .map(|e| e.title.as_str())
            .unwrap_or("Untitled section");
        out.push_str(&format!("\n## {title}\n\n"));

        match state.section_results.get(&index).filter(|r| !r.is_empty()) {
            Some(result) => {
                let mapping: Vec<usize> = result
                    .citations
                    .iter()
                    .map(|c| insert_citation(&mut references, c.clone()))
                    .collect();
                let body = rewrite_citations(result.findings.trim(), |local| {
                    match local.checked_sub(1).and_then(|i| mapping.get(i)) {
                        Some(global) => format!("[{global}]"),
                        None => {
                            dropped_markers += 1;
                            String::new()
                        }
                    }
                });
                out.push_str(&body);
                out.push('\n');
            }
            None => {
                out.push_str(INSUFFICIENT_DATA);
                out.push('\n');
            }
        }
    }

    out.push('\n');
    out.push_str(REFERENCES_HEADING);
    out.push_str("\n\n");
    if references.is_empty() {
        out.push_str("_No sources._\n");
    }
    for (i, citation) in references.iter().enumerate() {
        let title = if citation.title.trim().is_empty() {
            citation.url.as_str()
        } else {
            citation.title.trim()
        };
        out.push_str(&format!("{}. {} <{}>\n", i + 1, title, citation.url));
    }

    Assembled {
        body: out,
        references,
        dropped_markers,
    }
}

fn title_case(query: &str) -> String {
    let query = query.trim();
    let mut chars = query.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Research Report".to_string(),
    }
}

#[async_trait]
impl Stage for Writer {
    fn kind(&self) -> StageKind {
        StageKind::Writer
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let mut delta = StateDelta::new();

        let summary = if ctx.options.summary_enabled {
            let preview = assemble(state, None);
            let request = LlmRequest::new(prompts::summary(&state.query, &preview.body))
                .with_system(prompts::SUMMARY_SYSTEM)
                .with_max_tokens(SUMMARY_MAX_TOKENS);
            match ctx.coordinator.complete(&request, &ctx.cancel).await {
                Ok(text) if !text.trim().is_empty() => Some(text),
                Ok(_) => None,
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
                Err(e) => {
                    warn!(run_id = %ctx.run_id, error = %e, "Summary skipped");
                    delta = delta.with_error(StageErrorRecord::warning(
                        StageKind::Writer,
                        format!("summary skipped: {e}"),
                    ));
                    None
                }
            }
        } else {
            None
        };

        let assembled = assemble(state, summary.as_deref());
        if assembled.dropped_markers > 0 {
            delta = delta.with_error(StageErrorRecord::warning(
                StageKind::Writer,
                format!(
                    "dropped {} citation marker(s) with no matching source",
                    assembled.dropped_markers
                ),
            ));
        }
        debug!(
            run_id = %ctx.run_id,
            references = assembled.references.len(),
            bytes = assembled.body.len(),
            "Draft assembled"
        );

        if !ctx.options.review_enabled {
            delta = delta.with_final_report(assembled.body.clone());
        }
        Ok(delta.with_draft_report(assembled.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{citation_markers, heading_count};
    use crate::state::{PlanEntry, SectionResult, Tone};
    use pretty_assertions::assert_eq;

    fn section(findings: &str, urls: &[&str]) -> SectionResult {
        SectionResult {
            findings: findings.into(),
            citations: urls.iter().map(|u| Citation::new(*u, u.to_uppercase())).collect(),
        }
    }

    fn state() -> ResearchState {
        let mut state = ResearchState::new("renewable energy trends", Tone::Objective, "en", vec![]);
        state.plan = vec![
            PlanEntry::new("Solar", "solar", 1),
            PlanEntry::new("Wind", "wind", 2),
            PlanEntry::new("Storage", "storage", 3),
        ];
        state.section_results.insert(0, section("Solar grew [1] and [2].", &["https://a", "https://b"]));
        state.section_results.insert(1, SectionResult::empty());
        state.section_results.insert(2, section("Batteries [1], see also [2].", &["https://b", "https://c"]));
        state
    }

    #[test]
    fn test_assemble_renumbers_globally() {
        let assembled = assemble(&state(), None);
        assert!(assembled.body.starts_with("# Renewable energy trends\n"));
        assert!(assembled.body.contains("Solar grew [1] and [2]."));
        assert!(assembled.body.contains("Batteries [2], see also [3]."));
        assert_eq!(assembled.references.len(), 3);
        assert!(assembled.body.contains("3. HTTPS://C <https://c>"));
        assert_eq!(assembled.dropped_markers, 0);
    }

    #[test]
    fn test_empty_section_renders_note() {
        let assembled = assemble(&state(), None);
        let wind = assembled.body.split("## Wind").nth(1).unwrap();
        assert!(wind.trim_start().starts_with(INSUFFICIENT_DATA));
    }

    #[test]
    fn test_sections_in_index_order_and_heading_count() {
        let assembled = assemble(&state(), Some("All good."));
        let solar = assembled.body.find("## Solar").unwrap();
        let wind = assembled.body.find("## Wind").unwrap();
        let storage = assembled.body.find("## Storage").unwrap();
        assert!(solar < wind && wind < storage);
        assert_eq!(heading_count(&assembled.body), 6);
        assert!(assembled.body.ends_with("3. HTTPS://C <https://c>\n"));
    }

    #[test]
    fn test_out_of_range_markers_dropped() {
        let mut state = state();
        state
            .section_results
            .insert(1, section("Wind [1] and [4].", &["https://d"]));
        let assembled = assemble(&state, None);
        assert_eq!(assembled.dropped_markers, 1);
        let max = citation_markers(&assembled.body).into_iter().max().unwrap();
        assert!(max <= assembled.references.len());
    }
}
