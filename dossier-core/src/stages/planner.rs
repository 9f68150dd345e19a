//! Planner: turns the query into an ordered list of research sections.

use super::{Stage, StageContext, StageFailure, StageKind, prompts};
use crate::error::ProviderError;
use crate::providers::failover::LlmRequest;
use crate::state::{PlanEntry, ResearchState, StateDelta};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

pub struct Planner;

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default, alias = "section", alias = "name")]
    title: String,
    #[serde(default, alias = "query", alias = "search")]
    search_query: Option<String>,
    #[serde(default)]
    priority: Option<serde_json::Value>,
}

impl RawEntry {
    fn priority(&self) -> Option<u32> {
        match self.priority.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64().map(|v| v.min(u32::MAX as u64) as u32),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Parse a planner answer into at most `max_sections` entries.
///
/// Accepts a JSON array (surrounding prose is ignored) or, failing that, a
/// bulleted or numbered list. Entries are sorted by priority; ties keep their
/// original order.
pub fn parse_plan(text: &str, max_sections: usize) -> Vec<PlanEntry> {
    let mut plan = parse_json_plan(text).unwrap_or_else(|| parse_list_plan(text));
    plan.sort_by_key(|e| e.priority);
    plan.truncate(max_sections);
    plan
}

fn parse_json_plan(text: &str) -> Option<Vec<PlanEntry>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    let raw: Vec<RawEntry> = serde_json::from_str(&text[start..=end]).ok()?;
    let plan: Vec<PlanEntry> = raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            let title = entry.title.trim().to_string();
            if title.is_empty() {
                return None;
            }
            let priority = entry.priority().unwrap_or(i as u32 + 1);
            let search_query = entry
                .search_query
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| title.clone());
            Some(PlanEntry::new(title, search_query, priority))
        })
        .collect();
    Some(plan)
}

fn parse_list_plan(text: &str) -> Vec<PlanEntry> {
    text.lines()
        .filter_map(list_item)
        .enumerate()
        .map(|(i, item)| {
            let title = item.trim_matches('*').trim().to_string();
            PlanEntry::new(title.clone(), title, i as u32 + 1)
        })
        .filter(|e| !e.title.is_empty())
        .collect()
}

/// Text of a `- item`, `* item`, `1. item` or `1) item` line.
fn list_item(line: &str) -> Option<&str> {
    let line = line.trim();
    if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("+ "))
    {
        return Some(rest);
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
}

#[async_trait]
impl Stage for Planner {
    fn kind(&self) -> StageKind {
        StageKind::Planner
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let options = &ctx.options;
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=options.planner_attempts {
            let request = LlmRequest::new(prompts::planner(
                &state.query,
                state.tone,
                &state.guidelines,
                options.max_sections,
                attempt,
            ))
            .with_system(prompts::PLANNER_SYSTEM);

            match ctx.coordinator.complete(&request, &ctx.cancel).await {
                Ok(text) => {
                    let plan = parse_plan(&text, options.max_sections);
                    if !plan.is_empty() {
                        info!(run_id = %ctx.run_id, sections = plan.len(), attempt, "Plan ready");
                        return Ok(StateDelta::new().with_plan(plan));
                    }
                    warn!(run_id = %ctx.run_id, attempt, "Planner answer had no sections");
                }
                Err(ProviderError::Cancelled) => {
                    return Err(ProviderError::Cancelled.into());
                }
                Err(e) => {
                    debug!(run_id = %ctx.run_id, attempt, error = %e, "Planner call failed");
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| format!(": {e}"))
            .unwrap_or_default();
        Err(StageFailure::Fatal(format!(
            "planner produced no sections after {} attempt(s){reason}",
            options.planner_attempts
        )))
    }
}
