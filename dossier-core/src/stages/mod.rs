//! Pipeline stages.
//!
//! A stage reads the fields of [`ResearchState`] it needs and returns a
//! [`StateDelta`]; it never mutates the state it is given. The orchestrator
//! owns sequencing and merging.

pub mod planner;
pub mod prompts;
pub mod publisher;
pub mod researcher;
pub mod reviewer;
pub mod reviser;
pub mod translator;
pub mod writer;

use crate::config::RunOptions;
use crate::error::ProviderError;
use crate::providers::FailoverCoordinator;
use crate::state::{ResearchState, StateDelta};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use planner::Planner;
pub use publisher::{DocumentConverter, Publisher};
pub use researcher::Researcher;
pub use reviewer::Reviewer;
pub use reviser::Reviser;
pub use translator::Translator;
pub use writer::Writer;

/// Identifies a node of the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Planner,
    Researcher,
    Writer,
    Reviewer,
    Reviser,
    Translator,
    Publisher,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Planner,
        StageKind::Researcher,
        StageKind::Writer,
        StageKind::Reviewer,
        StageKind::Reviser,
        StageKind::Translator,
        StageKind::Publisher,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Planner => "planner",
            StageKind::Researcher => "researcher",
            StageKind::Writer => "writer",
            StageKind::Reviewer => "reviewer",
            StageKind::Reviser => "reviser",
            StageKind::Translator => "translator",
            StageKind::Publisher => "publisher",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// Why a stage could not produce a delta.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageFailure {
    /// The run cannot continue.
    #[error("fatal: {0}")]
    Fatal(String),
    /// Recorded in `errors`; the run continues.
    #[error("recoverable: {0}")]
    Recoverable(String),
}

impl StageFailure {
    pub fn message(&self) -> &str {
        match self {
            StageFailure::Fatal(m) | StageFailure::Recoverable(m) => m,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StageFailure::Fatal(_))
    }
}

impl From<ProviderError> for StageFailure {
    fn from(err: ProviderError) -> Self {
        StageFailure::Recoverable(err.to_string())
    }
}

/// Everything a stage may use besides the state.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: Uuid,
    pub coordinator: Arc<FailoverCoordinator>,
    pub options: Arc<RunOptions>,
    pub cancel: CancellationToken,
    /// Section index for a fan-out invocation of the researcher.
    pub section: Option<usize>,
}

impl StageContext {
    pub fn new(
        run_id: Uuid,
        coordinator: Arc<FailoverCoordinator>,
        options: Arc<RunOptions>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            coordinator,
            options,
            cancel,
            section: None,
        }
    }

    /// Copy of this context bound to one research section.
    pub fn for_section(&self, index: usize) -> Self {
        Self {
            section: Some(index),
            ..self.clone()
        }
    }
}

/// One node of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure>;
}

/// One implementation per [`StageKind`].
#[derive(Clone)]
pub struct StageSet {
    planner: Arc<dyn Stage>,
    researcher: Arc<dyn Stage>,
    writer: Arc<dyn Stage>,
    reviewer: Arc<dyn Stage>,
    reviser: Arc<dyn Stage>,
    translator: Arc<dyn Stage>,
    publisher: Arc<dyn Stage>,
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet").finish_non_exhaustive()
    }
}

impl Default for StageSet {
    fn default() -> Self {
        Self::standard(None)
    }
}

impl StageSet {
    /// The built-in stages. `converter` renders extra publish formats.
    pub fn standard(converter: Option<Arc<dyn DocumentConverter>>) -> Self {
        Self {
            planner: Arc::new(Planner),
            researcher: Arc::new(Researcher),
            writer: Arc::new(Writer),
            reviewer: Arc::new(Reviewer),
            reviser: Arc::new(Reviser),
            translator: Arc::new(Translator),
            publisher: Arc::new(Publisher::new(converter)),
        }
    }

    /// Replace the implementation for `stage.kind()`.
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        let slot = match stage.kind() {
            StageKind::Planner => &mut self.planner,
            StageKind::Researcher => &mut self.researcher,
            StageKind::Writer => &mut self.writer,
            StageKind::Reviewer => &mut self.reviewer,
            StageKind::Reviser => &mut self.reviser,
            StageKind::Translator => &mut self.translator,
            StageKind::Publisher => &mut self.publisher,
        };
        *slot = stage;
        self
    }

    pub fn get(&self, kind: StageKind) -> &Arc<dyn Stage> {
        match kind {
            StageKind::Planner => &self.planner,
            StageKind::Researcher => &self.researcher,
            StageKind::Writer => &self.writer,
            StageKind::Reviewer => &self.reviewer,
            StageKind::Reviser => &self.reviser,
            StageKind::Translator => &self.translator,
            StageKind::Publisher => &self.publisher,
        }
    }
}

/// Byte ranges and numbers of citation markers like `[3]`.
///
/// A bracketed number directly followed by `(` is a Markdown link, not a
/// citation.
pub(crate) fn citation_spans(text: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() && j - i <= 4 {
                j += 1;
            }
            if j > i + 1
                && bytes.get(j) == Some(&b']')
                && bytes.get(j + 1) != Some(&b'(')
                && let Ok(n) = text[i + 1..j].parse()
            {
                spans.push((i..j + 1, n));
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    spans
}

/// Numbers of all `[n]` citation markers in `text`, in order.
pub fn citation_markers(text: &str) -> Vec<usize> {
    citation_spans(text).into_iter().map(|(_, n)| n).collect()
}

/// Replace every citation marker with `replace(n)`.
pub(crate) fn rewrite_citations(text: &str, mut replace: impl FnMut(usize) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (range, n) in citation_spans(text) {
        out.push_str(&text[last..range.start]);
        out.push_str(&replace(n));
        last = range.end;
    }
    out.push_str(&text[last..]);
    out
}

/// Number of ATX headings outside fenced code blocks.
pub fn heading_count(text: &str) -> usize {
    let mut in_fence = false;
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") {
                in_fence = !in_fence;
                return false;
            }
            !in_fence && is_heading(trimmed)
        })
        .count()
}

pub(crate) fn is_heading(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes) && line[hashes..].starts_with(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_kind_roundtrip() {
        for kind in StageKind::ALL {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
        }
        assert!("editor".parse::<StageKind>().is_err());
        assert_eq!(
            serde_json::to_string(&StageKind::Translator).unwrap(),
            "\"translator\""
        );
    }

    #[test]
    fn test_stage_set_replaces_by_kind() {
        struct Noop;

        #[async_trait]
        impl Stage for Noop {
            fn kind(&self) -> StageKind {
                StageKind::Reviewer
            }

            async fn execute(
                &self,
                _state: &ResearchState,
                _ctx: &StageContext,
            ) -> Result<StateDelta, StageFailure> {
                Ok(StateDelta::new())
            }
        }

        let noop: Arc<dyn Stage> = Arc::new(Noop);
        let set = StageSet::default().with_stage(noop.clone());
        assert!(Arc::ptr_eq(set.get(StageKind::Reviewer), &noop));
        assert_eq!(set.get(StageKind::Writer).kind(), StageKind::Writer);
    }

    #[test]
    fn test_citation_markers_skip_links() {
        let text = "Solar grew [1], wind too [2][3]. See [docs](https://x) and [4].";
        assert_eq!(citation_markers(text), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rewrite_citations() {
        let out = rewrite_citations("a [1] b [2][1] [x] [12345]", |n| format!("[{}]", n + 10));
        assert_eq!(out, "a [11] b [12][11] [x] [12345]");
    }

    #[test]
    fn test_heading_count_ignores_code() {
        let text = "# Title\n\n## A\n```\n# not a heading\n```\n#hashtag\n### B";
        assert_eq!(heading_count(text), 3);
    }

    #[test]
    fn test_failure_from_provider_error() {
        let failure: StageFailure = ProviderError::Cancelled.into();
        assert!(!failure.is_fatal());
        assert_eq!(failure.message(), "Provider call cancelled");
    }
}
