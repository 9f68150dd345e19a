//! Prompt text for the LLM-backed stages.
//!
//! Deliberately minimal; the system prompts double as stable identifiers so
//! scripted backends can tell stages apart.

use crate::providers::SearchHit;
use crate::state::{ReviewNote, Tone};

pub const PLANNER_SYSTEM: &str = "You are a research planner. Break the user's question into \
focused sub-topics. Answer with a JSON array of objects with the keys \"title\", \
\"search_query\" and \"priority\" (1 is most important). No other text.";

pub const RESEARCHER_SYSTEM: &str = "You are a research assistant. Condense the numbered search \
results into factual findings for the given section. Cite sources with their bracketed number, \
for example [1]. Use only the provided results.";

pub const SUMMARY_SYSTEM: &str = "You write executive summaries. Summarize the report in one \
paragraph without citations or headings.";

pub const REVIEWER_SYSTEM: &str = "You are an editor. Review the report for tone, clarity and \
adherence to the guidelines. Reply with one issue per line formatted as \
`severity | location | suggestion` where severity is info, warning or critical. Reply with \
NONE when there is nothing to change.";

pub const REVISER_SYSTEM: &str = "You are an editor. Rewrite the report applying the review \
notes. Keep every heading and every bracketed citation marker. Reply with the full revised \
Markdown report only.";

fn guidelines_block(guidelines: &[String]) -> String {
    if guidelines.is_empty() {
        return String::new();
    }
    let mut block = String::from("\nGuidelines:\n");
    for g in guidelines {
        block.push_str("- ");
        block.push_str(g);
        block.push('\n');
    }
    block
}

pub fn planner(
    query: &str,
    tone: Tone,
    guidelines: &[String],
    max_sections: usize,
    attempt: u32,
) -> String {
    let mut prompt = format!(
        "Question: {query}\nTone: {tone}\nPlan at most {max_sections} sections.{}",
        guidelines_block(guidelines)
    );
    if attempt > 1 {
        prompt.push_str("\nThe previous answer contained no usable sections. Return at least one.");
    }
    prompt
}

pub fn researcher(query: &str, title: &str, hits: &[SearchHit]) -> String {
    let mut prompt = format!("Research question: {query}\nSection: {title}\n\nSearch results:\n");
    for (i, hit) in hits.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {} ({})\n{}\n\n",
            i + 1,
            hit.title,
            hit.url,
            hit.snippet
        ));
    }
    prompt
}

pub fn summary(query: &str, report: &str) -> String {
    format!("Question: {query}\n\nReport:\n{report}")
}

pub fn reviewer(report: &str, tone: Tone, guidelines: &[String]) -> String {
    format!(
        "Expected tone: {tone}{}\n\nReport:\n{report}",
        guidelines_block(guidelines)
    )
}

pub fn reviser(report: &str, notes: &[ReviewNote]) -> String {
    let mut prompt = String::from("Review notes:\n");
    for note in notes {
        prompt.push_str(&format!(
            "- [{:?}] {}: {}\n",
            note.severity, note.location, note.suggestion
        ));
    }
    prompt.push_str("\nReport:\n");
    prompt.push_str(report);
    prompt
}
