//! Translator: translates the final report segment by segment.
//!
//! The report is split into headings, paragraphs, list items, code blocks,
//! blank lines and the references section. Only the text of headings,
//! paragraphs and list items is sent to the `translation` role; Markdown
//! prefixes, code and references are kept verbatim. Citation markers are
//! swapped for opaque placeholders before translation and restored after, so
//! a backend cannot renumber or drop them silently.

use super::writer::REFERENCES_HEADING;
use super::{
    Stage, StageContext, StageFailure, StageKind, citation_markers, heading_count, is_heading,
    rewrite_citations,
};
use crate::error::ProviderError;
use crate::state::{ResearchState, StageErrorRecord, StateDelta};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

pub struct Translator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Heading,
    Paragraph,
    ListItem,
    Code,
    References,
    Blank,
}

impl SegmentKind {
    pub fn is_translatable(&self) -> bool {
        matches!(
            self,
            SegmentKind::Heading | SegmentKind::Paragraph | SegmentKind::ListItem
        )
    }
}

/// One unit of the report. `prefix + text` reproduces the source lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub prefix: String,
    pub text: String,
}

impl Segment {
    fn new(kind: SegmentKind, prefix: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            prefix: prefix.into(),
            text: text.into(),
        }
    }

    fn verbatim(kind: SegmentKind, lines: &[&str]) -> Self {
        Self::new(kind, "", lines.join("\n"))
    }
}

fn flush_paragraph(segments: &mut Vec<Segment>, paragraph: &mut Vec<&str>) {
    if !paragraph.is_empty() {
        segments.push(Segment::verbatim(SegmentKind::Paragraph, paragraph));
        paragraph.clear();
    }
}

/// Length of a list marker (`- `, `* `, `+ `, `1. `, `1) `) after indentation.
fn list_marker_len(line: &str) -> Option<usize> {
    if line.starts_with("- ") || line.starts_with("* ") || line.starts_with("+ ") {
        return Some(2);
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    (rest.starts_with(". ") || rest.starts_with(") ")).then_some(digits + 2)
}

/// Split a Markdown report into translation segments.
pub fn segment(report: &str) -> Vec<Segment> {
    let lines: Vec<&str> = report.lines().collect();
    let mut segments = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let indent = line.len() - line.trim_start().len();
        let trimmed = &line[indent..];

        if trimmed.starts_with("```") {
            flush_paragraph(&mut segments, &mut paragraph);
            let start = i;
            i += 1;
            while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                i += 1;
            }
            let end = (i + 1).min(lines.len());
            segments.push(Segment::verbatim(SegmentKind::Code, &lines[start..end]));
            i = end;
            continue;
        }

        if line.trim_end() == REFERENCES_HEADING {
            flush_paragraph(&mut segments, &mut paragraph);
            let start = i;
            i += 1;
            while i < lines.len() && !lines[i].starts_with("## ") {
                i += 1;
            }
            segments.push(Segment::verbatim(SegmentKind::References, &lines[start..i]));
            continue;
        }

        if trimmed.is_empty() {
            flush_paragraph(&mut segments, &mut paragraph);
            segments.push(Segment::new(SegmentKind::Blank, "", line));
        } else if is_heading(trimmed) {
            flush_paragraph(&mut segments, &mut paragraph);
            let hashes = trimmed.chars().take_while(|c| *c == '#').count();
            let split = indent + hashes + 1;
            segments.push(Segment::new(
                SegmentKind::Heading,
                &line[..split],
                &line[split..],
            ));
        } else if let Some(marker) = list_marker_len(trimmed) {
            flush_paragraph(&mut segments, &mut paragraph);
            let split = indent + marker;
            segments.push(Segment::new(
                SegmentKind::ListItem,
                &line[..split],
                &line[split..],
            ));
        } else {
            paragraph.push(line);
        }
        i += 1;
    }
    flush_paragraph(&mut segments, &mut paragraph);
    segments
}

/// Rebuild a document from segments.
pub fn reassemble(segments: &[Segment], trailing_newline: bool) -> String {
    let mut out = segments
        .iter()
        .map(|s| format!("{}{}", s.prefix, s.text))
        .collect::<Vec<_>>()
        .join("\n");
    if trailing_newline {
        out.push('\n');
    }
    out
}

const OPEN: char = '\u{27E6}';
const CLOSE: char = '\u{27E7}';

/// Replace citation markers with numbered placeholders.
///
/// Returns the masked text and the original markers in order.
pub fn mask_citations(text: &str) -> (String, Vec<String>) {
    let mut markers = Vec::new();
    let masked = rewrite_citations(text, |n| {
        let token = format!("{OPEN}{}{CLOSE}", markers.len());
        markers.push(format!("[{n}]"));
        token
    });
    (masked, markers)
}

/// Restore placeholders, or `None` if any was lost, duplicated or invented,
/// or if the translation introduced citation markers of its own.
pub fn unmask_citations(text: &str, markers: &[String]) -> Option<String> {
    if text.matches(OPEN).count() != markers.len() || !citation_markers(text).is_empty() {
        return None;
    }
    let mut out = text.to_string();
    for (i, marker) in markers.iter().enumerate() {
        let token = format!("{OPEN}{i}{CLOSE}");
        if out.matches(token.as_str()).count() != 1 {
            return None;
        }
        out = out.replacen(token.as_str(), marker, 1);
    }
    Some(out)
}

enum SegmentOutcome {
    Translated(String),
    Kept(String),
}

async fn translate_segment(
    ctx: &StageContext,
    text: &str,
    target_lang: &str,
) -> Result<SegmentOutcome, ProviderError> {
    let (masked, markers) = mask_citations(text);
    match ctx
        .coordinator
        .translate(&masked, target_lang, &ctx.cancel)
        .await
    {
        Ok(translated) => {
            // Headings and list items are single-line.
            let translated = translated.trim();
            match unmask_citations(translated, &markers) {
                Some(restored) => Ok(SegmentOutcome::Translated(restored)),
                None => Ok(SegmentOutcome::Kept("citation placeholders lost".to_string())),
            }
        }
        Err(ProviderError::Cancelled) => Err(ProviderError::Cancelled),
        Err(e) => Ok(SegmentOutcome::Kept(e.to_string())),
    }
}

/// Result of translating a whole report.
#[derive(Debug, Clone, PartialEq)]
pub struct Translation {
    pub text: String,
    /// Segments left in the source language.
    pub degraded: usize,
    pub translated: usize,
}

/// Translate `report` into `target_lang` through the context's coordinator.
pub async fn translate_report(
    ctx: &StageContext,
    report: &str,
    target_lang: &str,
) -> Result<Translation, ProviderError> {
    let mut segments = segment(report);
    let jobs: Vec<(usize, String)> = segments
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind.is_translatable() && !s.text.trim().is_empty())
        .map(|(i, s)| (i, s.text.clone()))
        .collect();

    let outcomes: Vec<(usize, Result<SegmentOutcome, ProviderError>)> =
        futures::stream::iter(jobs)
            .map(|(index, text)| async move {
                (index, translate_segment(ctx, &text, target_lang).await)
            })
            .buffered(ctx.options.translation_concurrency.max(1))
            .collect()
            .await;

    let mut degraded = 0;
    let mut translated = 0;
    for (index, outcome) in outcomes {
        match outcome? {
            SegmentOutcome::Translated(text) => {
                let single_line = segments[index].kind != SegmentKind::Paragraph;
                segments[index].text = if single_line {
                    text.split_whitespace().collect::<Vec<_>>().join(" ")
                } else {
                    text
                };
                translated += 1;
            }
            SegmentOutcome::Kept(reason) => {
                debug!(run_id = %ctx.run_id, segment = index, reason = %reason, "Segment kept in source language");
                degraded += 1;
            }
        }
    }

    Ok(Translation {
        text: reassemble(&segments, report.ends_with('\n')),
        degraded,
        translated,
    })
}

/// Why `translated` is not a faithful rendering of `source`, if it is not.
pub fn structure_check(source: &str, translated: &str) -> Option<String> {
    let (sh, th) = (heading_count(source), heading_count(translated));
    if sh != th {
        return Some(format!("heading count {th} differs from source {sh}"));
    }
    let (sc, tc) = (citation_markers(source), citation_markers(translated));
    if sc.len() != tc.len() {
        return Some(format!(
            "citation count {} differs from source {}",
            tc.len(),
            sc.len()
        ));
    }
    None
}

#[async_trait]
impl Stage for Translator {
    fn kind(&self) -> StageKind {
        StageKind::Translator
    }

    async fn execute(
        &self,
        state: &ResearchState,
        ctx: &StageContext,
    ) -> Result<StateDelta, StageFailure> {
        let source = state
            .report_body()
            .ok_or_else(|| StageFailure::Fatal("no report to translate".into()))?;
        let lang = state.target_language.trim();

        let translation = translate_report(ctx, source, lang).await?;
        let mut delta = StateDelta::new();

        if let Some(reason) = structure_check(source, &translation.text) {
            warn!(run_id = %ctx.run_id, lang = %lang, reason = %reason, "Translation rejected");
            return Ok(delta.with_error(StageErrorRecord::translation_degraded(format!(
                "translation to '{lang}' rejected: {reason}"
            ))));
        }

        if translation.degraded > 0 {
            delta = delta.with_error(StageErrorRecord::translation_degraded(format!(
                "{} of {} segment(s) kept in the source language",
                translation.degraded,
                translation.degraded + translation.translated
            )));
        }
        info!(
            run_id = %ctx.run_id,
            lang = %lang,
            translated = translation.translated,
            degraded = translation.degraded,
            "Translation finished"
        );
        Ok(delta.with_translated_report(translation.text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunOptions;
    use crate::providers::mock::{ScriptedLlm, ScriptedSearch, ScriptedTranslate, scripted_coordinator};
    use crate::state::{ErrorKind, Tone};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    const REPORT: &str = "# Energy\n\n## Solar\n\nSolar grew [1] fast.\nIt keeps growing [2].\n\n\
- panels [1]\n2. storage\n\n```\nlet x = [1];\n```\n\n## References\n\n1. A <https://a>\n2. B <https://b>\n";

    fn context(translate: ScriptedTranslate) -> StageContext {
        let coordinator = scripted_coordinator(
            Arc::new(ScriptedLlm::always("l", "unused")),
            Arc::new(ScriptedSearch::with_hits("s", vec![])),
            Arc::new(translate),
        )
        .unwrap();
        StageContext::new(
            Uuid::new_v4(),
            Arc::new(coordinator),
            Arc::new(RunOptions::default()),
            CancellationToken::new(),
        )
    }

    fn state() -> ResearchState {
        let mut state = ResearchState::new("energy", Tone::Objective, "de", vec![]);
        state.final_report = Some(REPORT.to_string());
        state
    }

    #[test]
    fn test_segment_kinds() {
        let kinds: Vec<SegmentKind> = segment(REPORT).iter().map(|s| s.kind).collect();
        use SegmentKind::*;
        assert_eq!(
            kinds,
            vec![
                Heading, Blank, Heading, Blank, Paragraph, Blank, ListItem, ListItem, Blank, Code,
                Blank, References
            ]
        );
    }

    #[test]
    fn test_segment_reassemble_is_lossless() {
        assert_eq!(reassemble(&segment(REPORT), true), REPORT);
    }

    #[test]
    fn test_mask_and_unmask() {
        let (masked, markers) = mask_citations("a [1] b [2] c [1]");
        assert_eq!(markers, vec!["[1]", "[2]", "[1]"]);
        assert!(!masked.contains('['));
        assert_eq!(
            unmask_citations(&masked, &markers).as_deref(),
            Some("a [1] b [2] c [1]")
        );
        let dropped = masked.replacen("\u{27E6}1\u{27E7}", "", 1);
        assert_eq!(unmask_citations(&dropped, &markers), None);
        assert_eq!(unmask_citations("x [3]", &[]), None);
    }

    #[tokio::test]
    async fn test_translation_keeps_structure() {
        let ctx = context(ScriptedTranslate::tagging("tr"));
        let delta = Translator.execute(&state(), &ctx).await.unwrap();
        let text = delta.translated_report.unwrap();
        assert!(text.contains("## [de] Solar"));
        assert!(text.contains("[de] Solar grew [1] fast."));
        assert!(text.contains("- [de] panels [1]"));
        assert!(text.contains("let x = [1];"));
        assert!(text.ends_with("2. B <https://b>\n"));
        assert_eq!(structure_check(REPORT, &text), None);
        assert!(delta.errors.is_empty());
    }

    #[tokio::test]
    async fn test_lost_placeholders_revert_segment() {
        let translate = ScriptedTranslate::new("tr", |segment, _| {
            Ok(segment.replace(['\u{27E6}', '\u{27E7}'], ""))
        });
        let ctx = context(translate);
        let delta = Translator.execute(&state(), &ctx).await.unwrap();
        let text = delta.translated_report.unwrap();
        assert!(text.contains("Solar grew [1] fast."));
        assert_eq!(delta.errors.len(), 1);
        assert_eq!(delta.errors[0].kind, ErrorKind::TranslationDegraded);
        assert!(!delta.errors[0].fatal);
    }

    #[tokio::test]
    async fn test_heading_translation_stays_on_one_line() {
        let translate = ScriptedTranslate::new("tr", |segment, _| {
            Ok(if segment == "Solar" {
                "Sonne\n## Extra".to_string()
            } else {
                segment.to_string()
            })
        });
        let ctx = context(translate);
        let delta = Translator.execute(&state(), &ctx).await.unwrap();
        let text = delta.translated_report.unwrap();
        assert!(text.contains("\n## Sonne ## Extra\n"));
        assert_eq!(heading_count(&text), heading_count(REPORT));
    }

    #[tokio::test]
    async fn test_paragraph_can_break_heading_count() {
        let translate = ScriptedTranslate::new("tr", |segment, _| {
            Ok(if segment.starts_with("Solar grew") {
                format!("{segment}\n# Surprise")
            } else {
                segment.to_string()
            })
        });
        let ctx = context(translate);
        let delta = Translator.execute(&state(), &ctx).await.unwrap();
        assert_eq!(delta.translated_report, None);
        assert_eq!(delta.errors[0].kind, ErrorKind::TranslationDegraded);
    }

    #[tokio::test]
    async fn test_order_preserved_under_uneven_latency() {
        let translate = ScriptedTranslate::tagging("tr").with_latency(|segment| {
            Duration::from_millis(if segment.starts_with("Energy") { 40 } else { 1 })
        });
        let ctx = context(translate);
        let delta = Translator.execute(&state(), &ctx).await.unwrap();
        let text = delta.translated_report.unwrap();
        assert!(text.starts_with("# [de] Energy\n"));
    }
}
