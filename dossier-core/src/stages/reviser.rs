//! Reviser: applies review notes to the draft.
//!
//! A rewrite is only accepted when it keeps the draft's structure: the same
//! number of headings and of citation markers. Otherwise the draft itself
//! becomes the final report.

use super::{Stage, StageContext, StageFailure, StageKind, citation_markers, heading_count, prompts};
use crate::error::ProviderError;
use crate::providers::failover::LlmRequest;
use crate::state::{ResearchState, StageErrorRecord, StateDelta};
use async_trait::async_trait;
use tracing::{info, warn};

pub struct Reviser;

/// Strip a surrounding ```markdown fence some models add.
fn unfence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body_start) = rest.find('\n') else {
        return trimmed;
    };
    rest[body_start + 1..]
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Why `revised` cannot replace `draft`, if it cannot.
pub fn structure_mismatch(draft: &str, revised: &str) -> Option<String> {
    let (dh, rh) = (heading_count(draft), heading_count(revised));
    if dh != rh {
        return Some(format!("heading count changed from {dh} to {rh}"));
    }
    let (dc, rc) = (citation_markers(draft).len(), citation_markers(revised).len());
    if dc != rc {
        return Some(format!("citation count changed from {dc} to {rc}"));
    }
    None
}

#[async_trait]
impl Stage for Reviser {
    fn kind(&self) -> StageKind {
        StageKind::Reviser
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let draft = state
            .draft_report
            .as_deref()
            .ok_or_else(|| StageFailure::Fatal("no draft to revise".into()))?;
        let notes = state.review_notes.as_deref().unwrap_or_default();

        let request =
            LlmRequest::new(prompts::reviser(draft, notes)).with_system(prompts::REVISER_SYSTEM);
        let rejection = match ctx.coordinator.complete(&request, &ctx.cancel).await {
            Ok(text) => {
                let revised = unfence(&text);
                match structure_mismatch(draft, revised) {
                    None => {
                        info!(run_id = %ctx.run_id, notes = notes.len(), "Revision accepted");
                        return Ok(StateDelta::new().with_final_report(format!("{revised}\n")));
                    }
                    Some(reason) => format!("revision rejected: {reason}"),
                }
            }
            Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled.into()),
            Err(e) => format!("revision failed: {e}"),
        };

        warn!(run_id = %ctx.run_id, reason = %rejection, "Keeping the draft");
        Ok(StateDelta::new()
            .with_final_report(draft)
            .with_error(StageErrorRecord::warning(StageKind::Reviser, rejection)))
    }
}
