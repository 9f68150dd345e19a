//! The research state threaded through the pipeline and the deltas stages
//! return.
//!
//! Stages never mutate a [`ResearchState`]; they return a [`StateDelta`] and
//! the orchestrator merges it with [`ResearchState::apply`]. A present delta
//! key replaces the state's value, an absent key leaves it untouched.
//! `section_results` and `published_artifacts` merge per key, and `errors`
//! only ever grows. Applying the same delta twice gives the same state as
//! applying it once.

use crate::stages::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Voice the report is written in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    #[default]
    Objective,
    Critical,
    Optimistic,
    Analytical,
    Informative,
    Formal,
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tone::Objective => "objective",
            Tone::Critical => "critical",
            Tone::Optimistic => "optimistic",
            Tone::Analytical => "analytical",
            Tone::Informative => "informative",
            Tone::Formal => "formal",
        };
        f.write_str(s)
    }
}

impl FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "objective" => Ok(Tone::Objective),
            "critical" => Ok(Tone::Critical),
            "optimistic" => Ok(Tone::Optimistic),
            "analytical" => Ok(Tone::Analytical),
            "informative" => Ok(Tone::Informative),
            "formal" => Ok(Tone::Formal),
            other => Err(format!(
                "unknown tone '{other}' (expected objective, critical, optimistic, analytical, informative or formal)"
            )),
        }
    }
}

/// One planned sub-topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub title: String,
    pub search_query: String,
    /// Lower is more important.
    pub priority: u32,
}

impl PlanEntry {
    pub fn new(title: impl Into<String>, search_query: impl Into<String>, priority: u32) -> Self {
        Self {
            title: title.into(),
            search_query: search_query.into(),
            priority,
        }
    }
}

/// A source backing a section's findings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: String,
}

impl Citation {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

/// Insert `citation` unless one with the same URL is present.
///
/// Returns the 1-based position of the citation in `set`.
pub fn insert_citation(set: &mut Vec<Citation>, citation: Citation) -> usize {
    if let Some(pos) = set.iter().position(|c| c.url == citation.url) {
        return pos + 1;
    }
    set.push(citation);
    set.len()
}

/// Findings gathered for one planned section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionResult {
    /// Findings text; `[n]` markers refer to `citations[n - 1]`.
    pub findings: String,
    pub citations: Vec<Citation>,
}

impl SectionResult {
    /// Placeholder for a section whose research failed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "minor" | "low" => Ok(Severity::Info),
            "warning" | "warn" | "medium" | "moderate" => Ok(Severity::Warning),
            "critical" | "high" | "major" | "error" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// A reviewer remark about the draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewNote {
    pub severity: Severity,
    /// Heading or marker the note refers to.
    pub location: String,
    pub suggestion: String,
}

/// Classification of an entry in [`ResearchState::errors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Aborted the run.
    Fatal,
    /// One research section failed; the run continued.
    Section,
    /// The translation was incomplete or rejected.
    TranslationDegraded,
    /// Anything else recoverable.
    Warning,
}

/// An entry in the append-only error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageErrorRecord {
    pub stage: StageKind,
    pub message: String,
    pub fatal: bool,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<usize>,
}

impl StageErrorRecord {
    pub fn fatal(stage: StageKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            fatal: true,
            kind: ErrorKind::Fatal,
            section: None,
        }
    }

    pub fn warning(stage: StageKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            fatal: false,
            kind: ErrorKind::Warning,
            section: None,
        }
    }

    pub fn section(stage: StageKind, section: usize, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            fatal: false,
            kind: ErrorKind::Section,
            section: Some(section),
        }
    }

    pub fn translation_degraded(message: impl Into<String>) -> Self {
        Self {
            stage: StageKind::Translator,
            message: message.into(),
            fatal: false,
            kind: ErrorKind::TranslationDegraded,
            section: None,
        }
    }
}

/// The single record threaded through a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchState {
    pub query: String,
    pub tone: Tone,
    pub target_language: String,
    pub guidelines: Vec<String>,
    #[serde(default)]
    pub plan: Vec<PlanEntry>,
    #[serde(default)]
    pub section_results: BTreeMap<usize, SectionResult>,
    #[serde(default)]
    pub draft_report: Option<String>,
    #[serde(default)]
    pub final_report: Option<String>,
    #[serde(default)]
    pub translated_report: Option<String>,
    #[serde(default)]
    pub review_notes: Option<Vec<ReviewNote>>,
    #[serde(default)]
    pub errors: Vec<StageErrorRecord>,
    #[serde(default)]
    pub published_artifacts: BTreeMap<String, PathBuf>,
}

impl ResearchState {
    /// Fresh state with only the run inputs populated.
    pub fn new(
        query: impl Into<String>,
        tone: Tone,
        target_language: impl Into<String>,
        guidelines: Vec<String>,
    ) -> Self {
        Self {
            query: query.into(),
            tone,
            target_language: target_language.into(),
            guidelines,
            ..Self::default()
        }
    }

    /// Merge a stage's delta into this state.
    pub fn apply(&mut self, delta: &StateDelta) {
        if let Some(plan) = &delta.plan {
            self.plan = plan.clone();
        }
        if let Some(results) = &delta.section_results {
            for (index, result) in results {
                self.section_results.insert(*index, result.clone());
            }
        }
        if let Some(draft) = &delta.draft_report {
            self.draft_report = Some(draft.clone());
        }
        if let Some(report) = &delta.final_report {
            self.final_report = Some(report.clone());
        }
        if let Some(translated) = &delta.translated_report {
            self.translated_report = Some(translated.clone());
        }
        if let Some(notes) = &delta.review_notes {
            self.review_notes = Some(notes.clone());
        }
        // Records already logged before this delta are skipped; the delta's own
        // records are all kept, even when two of them read the same.
        let logged = self.errors.len();
        for error in &delta.errors {
            if !self.errors[..logged].contains(error) {
                self.errors.push(error.clone());
            }
        }
        if let Some(artifacts) = &delta.published_artifacts {
            for (format, path) in artifacts {
                self.published_artifacts.insert(format.clone(), path.clone());
            }
        }
    }

    /// The report downstream stages should work from.
    pub fn report_body(&self) -> Option<&str> {
        self.final_report
            .as_deref()
            .or(self.draft_report.as_deref())
    }

    pub fn has_fatal_error(&self) -> bool {
        self.errors.iter().any(|e| e.fatal)
    }
}

/// Partial update returned by a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<PlanEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_results: Option<BTreeMap<usize, SectionResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_notes: Option<Vec<ReviewNote>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StageErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_artifacts: Option<BTreeMap<String, PathBuf>>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: Vec<PlanEntry>) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_section(mut self, index: usize, result: SectionResult) -> Self {
        self.section_results
            .get_or_insert_with(BTreeMap::new)
            .insert(index, result);
        self
    }

    pub fn with_draft_report(mut self, report: impl Into<String>) -> Self {
        self.draft_report = Some(report.into());
        self
    }

    pub fn with_final_report(mut self, report: impl Into<String>) -> Self {
        self.final_report = Some(report.into());
        self
    }

    pub fn with_translated_report(mut self, report: impl Into<String>) -> Self {
        self.translated_report = Some(report.into());
        self
    }

    pub fn with_review_notes(mut self, notes: Vec<ReviewNote>) -> Self {
        self.review_notes = Some(notes);
        self
    }

    pub fn with_error(mut self, error: StageErrorRecord) -> Self {
        self.errors.push(error);
        self
    }

    pub fn with_artifact(mut self, format: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.published_artifacts
            .get_or_insert_with(BTreeMap::new)
            .insert(format.into(), path.into());
        self
    }

    /// Whether merging this delta would change nothing.
    pub fn is_empty(&self) -> bool {
        self == &StateDelta::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base_state() -> ResearchState {
        ResearchState::new(
            "renewable energy trends",
            Tone::Objective,
            "en",
            vec!["cite sources".into()],
        )
    }

    #[test]
    fn test_new_state_only_has_inputs() {
        let state = base_state();
        assert!(state.plan.is_empty());
        assert!(state.section_results.is_empty());
        assert!(state.draft_report.is_none());
        assert!(state.errors.is_empty());
    }

    #[test]
    fn test_apply_replaces_present_keys_only() {
        let mut state = base_state();
        state.apply(&StateDelta::new().with_draft_report("draft"));
        state.apply(&StateDelta::new().with_plan(vec![PlanEntry::new("A", "a", 1)]));
        assert_eq!(state.draft_report.as_deref(), Some("draft"));
        assert_eq!(state.plan.len(), 1);
    }

    #[test]
    fn test_sections_merge_per_index() {
        let mut state = base_state();
        state.apply(&StateDelta::new().with_section(
            1,
            SectionResult {
                findings: "one".into(),
                citations: vec![],
            },
        ));
        state.apply(&StateDelta::new().with_section(
            0,
            SectionResult {
                findings: "zero".into(),
                citations: vec![],
            },
        ));
        let keys: Vec<usize> = state.section_results.keys().copied().collect();
        assert_eq!(keys, vec![0, 1]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let delta = StateDelta::new()
            .with_section(0, SectionResult::empty())
            .with_error(StageErrorRecord::section(StageKind::Researcher, 0, "timeout"))
            .with_artifact("markdown", "/tmp/report.md");

        let mut once = base_state();
        once.apply(&delta);
        let mut twice = once.clone();
        twice.apply(&delta);
        assert_eq!(once, twice);
        assert_eq!(twice.errors.len(), 1);
    }

    #[test]
    fn test_apply_keeps_every_record_of_a_delta() {
        let delta = StateDelta::new()
            .with_error(StageErrorRecord::section(StageKind::Researcher, 0, "timeout"))
            .with_error(StageErrorRecord::section(StageKind::Researcher, 2, "timeout"))
            .with_error(StageErrorRecord::warning(StageKind::Publisher, "no converter"))
            .with_error(StageErrorRecord::warning(StageKind::Publisher, "no converter"));
        let mut state = base_state();
        state.apply(&delta);
        assert_eq!(state.errors.len(), 4);
        let sections: Vec<Option<usize>> = state.errors.iter().map(|e| e.section).collect();
        assert_eq!(sections, vec![Some(0), Some(2), None, None]);

        state.apply(&delta);
        assert_eq!(state.errors.len(), 4);
    }

    #[test]
    fn test_errors_are_append_only() {
        let mut state = base_state();
        state.apply(&StateDelta::new().with_error(StageErrorRecord::warning(
            StageKind::Writer,
            "summary skipped",
        )));
        state.apply(&StateDelta::new().with_draft_report("x"));
        assert_eq!(state.errors.len(), 1);
        state.apply(&StateDelta::new().with_error(StageErrorRecord::fatal(
            StageKind::Planner,
            "no sections",
        )));
        assert_eq!(state.errors.len(), 2);
        assert!(state.has_fatal_error());
    }

    #[test]
    fn test_report_body_prefers_final() {
        let mut state = base_state();
        assert!(state.report_body().is_none());
        state.apply(&StateDelta::new().with_draft_report("draft"));
        assert_eq!(state.report_body(), Some("draft"));
        state.apply(&StateDelta::new().with_final_report("final"));
        assert_eq!(state.report_body(), Some("final"));
    }

    #[test]
    fn test_insert_citation_dedups_by_url() {
        let mut set = Vec::new();
        assert_eq!(insert_citation(&mut set, Citation::new("https://a", "A")), 1);
        assert_eq!(insert_citation(&mut set, Citation::new("https://b", "B")), 2);
        assert_eq!(
            insert_citation(&mut set, Citation::new("https://a", "A again")),
            1
        );
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].title, "A");
    }

    #[test]
    fn test_tone_parse() {
        assert_eq!("Critical".parse::<Tone>().unwrap(), Tone::Critical);
        assert!("sarcastic".parse::<Tone>().is_err());
        assert_eq!(Tone::Optimistic.to_string(), "optimistic");
    }

    #[test]
    fn test_severity_parse_aliases() {
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("minor".parse::<Severity>().unwrap(), Severity::Info);
        assert!("??".parse::<Severity>().is_err());
    }

    #[test]
    fn test_state_json_roundtrip_keeps_section_order() {
        let mut state = base_state();
        state.apply(&StateDelta::new().with_section(2, SectionResult::empty()));
        state.apply(&StateDelta::new().with_section(0, SectionResult::empty()));
        let json = serde_json::to_string(&state).unwrap();
        let back: ResearchState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_empty_delta() {
        assert!(StateDelta::new().is_empty());
        assert!(!StateDelta::new().with_draft_report("x").is_empty());
    }
}
