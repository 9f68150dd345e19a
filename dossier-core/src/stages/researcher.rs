//! Researcher: gathers findings for one planned section.
//!
//! Invoked once per plan entry by the orchestrator's fan-out. The section
//! index comes from [`StageContext::section`].

use super::{Stage, StageContext, StageFailure, StageKind, prompts};
use crate::error::ProviderError;
use crate::providers::SearchHit;
use crate::providers::failover::{LlmRequest, SearchRequest};
use crate::state::{Citation, ResearchState, SectionResult, StageErrorRecord, StateDelta, insert_citation};
use async_trait::async_trait;
use tracing::{debug, warn};

pub struct Researcher;

/// Deduplicate hits by URL, keeping first-seen order.
fn dedup_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = Vec::new();
    let mut unique = Vec::with_capacity(hits.len());
    for hit in hits {
        let before = seen.len();
        insert_citation(&mut seen, Citation::new(hit.url.clone(), hit.title.clone()));
        if seen.len() > before {
            unique.push(hit);
        }
    }
    unique
}

/// Findings built straight from the snippets when extraction fails.
fn raw_findings(hits: &[SearchHit]) -> String {
    hits.iter()
        .enumerate()
        .filter(|(_, h)| !h.snippet.trim().is_empty())
        .map(|(i, h)| format!("{} [{}]", h.snippet.trim(), i + 1))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl Stage for Researcher {
    fn kind(&self) -> StageKind {
        StageKind::Researcher
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let index = ctx
            .section
            .ok_or_else(|| StageFailure::Fatal("researcher invoked without a section".into()))?;
        let entry = state.plan.get(index).ok_or_else(|| {
            StageFailure::Recoverable(format!("section {index} is not in the plan"))
        })?;

        let mut hits = ctx
            .coordinator
            .search(&SearchRequest::new(&entry.search_query), &ctx.cancel)
            .await?;

        if hits.len() < ctx.options.min_search_results && entry.title != entry.search_query {
            debug!(
                run_id = %ctx.run_id,
                section = index,
                hits = hits.len(),
                "Too few results, searching by title"
            );
            match ctx
                .coordinator
                .search(&SearchRequest::new(&entry.title), &ctx.cancel)
                .await
            {
                Ok(more) => hits.extend(more),
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
                Err(e) => warn!(run_id = %ctx.run_id, section = index, error = %e, "Second search failed"),
            }
        }

        let hits = dedup_hits(hits);
        if hits.is_empty() {
            return Ok(StateDelta::new().with_section(index, SectionResult::empty()));
        }
        let citations: Vec<Citation> = hits
            .iter()
            .map(|h| Citation::new(h.url.clone(), h.title.clone()))
            .collect();

        let request = LlmRequest::new(prompts::researcher(&state.query, &entry.title, &hits))
            .with_system(prompts::RESEARCHER_SYSTEM);
        let mut delta = StateDelta::new();
        let findings = match ctx.coordinator.complete(&request, &ctx.cancel).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                delta = delta.with_error(StageErrorRecord::section(
                    StageKind::Researcher,
                    index,
                    "extraction returned nothing; using raw snippets",
                ));
                raw_findings(&hits)
            }
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
            Err(e) => {
                warn!(run_id = %ctx.run_id, section = index, error = %e, "Extraction failed");
                delta = delta.with_error(StageErrorRecord::section(
                    StageKind::Researcher,
                    index,
                    format!("extraction failed, using raw snippets: {e}"),
                ));
                raw_findings(&hits)
            }
        };

        Ok(delta.with_section(
            index,
            SectionResult {
                findings,
                citations,
            },
        ))
    }
}
