//! Property tests for plan parsing, delta merging and translation structure.

use dossier_core::RunOptions;
use dossier_core::providers::mock::{ScriptedLlm, ScriptedSearch, ScriptedTranslate, scripted_coordinator};
use dossier_core::stages::planner::parse_plan;
use dossier_core::stages::translator::{segment, reassemble, structure_check, translate_report};
use dossier_core::stages::{StageContext, StageKind, citation_markers, heading_count};
use dossier_core::state::{
    Citation, PlanEntry, ResearchState, SectionResult, StageErrorRecord, StateDelta, Tone,
};
use proptest::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn word() -> impl Strategy<Value = String> {
    "[A-Za-z]{1,8}"
}

fn phrase() -> impl Strategy<Value = String> {
    prop::collection::vec(word(), 1..5).prop_map(|w| w.join(" "))
}

fn plan_json(titles: &[String]) -> String {
    let entries: Vec<serde_json::Value> = titles
        .iter()
        .enumerate()
        .map(|(i, t)| {
            serde_json::json!({
                "title": t,
                "search_query": t.to_lowercase(),
                "priority": i + 1,
            })
        })
        .collect();
    format!("Sure, here it is:\n{}\nGood luck.", serde_json::Value::from(entries))
}

fn plan_list(titles: &[String]) -> String {
    titles
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. {t}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

proptest! {
    #[test]
    fn prop_plan_length_is_bounded(
        titles in prop::collection::vec(phrase(), 1..15),
        max_sections in 1usize..8,
        as_json in any::<bool>(),
    ) {
        let text = if as_json { plan_json(&titles) } else { plan_list(&titles) };
        let plan = parse_plan(&text, max_sections);
        prop_assert!(!plan.is_empty());
        prop_assert!(plan.len() <= max_sections);
        prop_assert_eq!(plan.len(), titles.len().min(max_sections));
        prop_assert_eq!(&plan[0].title, &titles[0]);
    }

    #[test]
    fn prop_plan_is_sorted_by_priority(
        priorities in prop::collection::vec(1u32..20, 1..10),
    ) {
        let entries: Vec<serde_json::Value> = priorities
            .iter()
            .enumerate()
            .map(|(i, p)| serde_json::json!({ "title": format!("T{i}"), "priority": p }))
            .collect();
        let plan = parse_plan(&serde_json::Value::from(entries).to_string(), 20);
        prop_assert!(plan.windows(2).all(|w| w[0].priority <= w[1].priority));
    }
}

fn section_result() -> impl Strategy<Value = SectionResult> {
    (phrase(), prop::collection::vec(word(), 0..4)).prop_map(|(findings, hosts)| SectionResult {
        findings,
        citations: hosts
            .iter()
            .map(|h| Citation::new(format!("https://{h}.example"), h.clone()))
            .collect(),
    })
}

fn delta() -> impl Strategy<Value = StateDelta> {
    (
        prop::option::of(prop::collection::vec(phrase(), 1..4)),
        prop::collection::btree_map(0usize..6, section_result(), 0..4),
        prop::option::of(phrase()),
        prop::option::of(phrase()),
        prop::collection::vec((0usize..6, phrase()), 0..3),
        prop::collection::btree_map("[a-z]{2,6}", word(), 0..3),
    )
        .prop_map(|(plan, sections, draft, final_report, errors, artifacts)| {
            let mut delta = StateDelta::new();
            if let Some(titles) = plan {
                delta = delta.with_plan(
                    titles
                        .iter()
                        .enumerate()
                        .map(|(i, t)| PlanEntry::new(t.clone(), t.clone(), i as u32 + 1))
                        .collect(),
                );
            }
            for (index, result) in sections {
                delta = delta.with_section(index, result);
            }
            if let Some(draft) = draft {
                delta = delta.with_draft_report(draft);
            }
            if let Some(report) = final_report {
                delta = delta.with_final_report(report);
            }
            for (index, message) in errors {
                delta = delta.with_error(StageErrorRecord::section(
                    StageKind::Researcher,
                    index,
                    message,
                ));
            }
            for (format, file) in artifacts {
                delta = delta.with_artifact(format, format!("/tmp/{file}"));
            }
            delta
        })
}

proptest! {
    #[test]
    fn prop_delta_merge_is_idempotent(
        earlier in prop::collection::vec(delta(), 0..3),
        delta in delta(),
    ) {
        let mut state = ResearchState::new("q", Tone::Objective, "en", vec![]);
        for d in &earlier {
            state.apply(d);
        }
        let mut once = state.clone();
        once.apply(&delta);
        let mut twice = once.clone();
        twice.apply(&delta);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_errors_never_shrink(deltas in prop::collection::vec(delta(), 1..5)) {
        let mut state = ResearchState::new("q", Tone::Objective, "en", vec![]);
        let mut seen = 0;
        for d in &deltas {
            state.apply(d);
            prop_assert!(state.errors.len() >= seen);
            seen = state.errors.len();
        }
    }
}

fn paragraph() -> impl Strategy<Value = String> {
    prop::collection::vec((phrase(), prop::option::of(1usize..9)), 1..4).prop_map(|sentences| {
        sentences
            .into_iter()
            .map(|(text, marker)| match marker {
                Some(n) => format!("{text} [{n}]."),
                None => format!("{text}."),
            })
            .collect::<Vec<_>>()
            .join(" ")
    })
}

fn report() -> impl Strategy<Value = String> {
    (
        phrase(),
        prop::collection::vec((phrase(), prop::collection::vec(paragraph(), 1..3)), 1..5),
        prop::collection::vec(word(), 0..4),
    )
        .prop_map(|(title, sections, sources)| {
            let mut out = format!("# {title}\n");
            for (heading, paragraphs) in sections {
                out.push_str(&format!("\n## {heading}\n\n"));
                out.push_str(&paragraphs.join("\n\n"));
                out.push('\n');
            }
            if !sources.is_empty() {
                out.push_str("\n## References\n\n");
                for (i, s) in sources.iter().enumerate() {
                    out.push_str(&format!("{}. {s} <https://{s}.example>\n", i + 1));
                }
            }
            out
        })
}

fn translation_context() -> StageContext {
    let coordinator = scripted_coordinator(
        Arc::new(ScriptedLlm::always("llm", "")),
        Arc::new(ScriptedSearch::with_hits("search", vec![])),
        Arc::new(ScriptedTranslate::tagging("tr")),
    )
    .unwrap();
    StageContext::new(
        Uuid::new_v4(),
        Arc::new(coordinator),
        Arc::new(RunOptions::default()),
        CancellationToken::new(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_segments_reassemble_losslessly(report in report()) {
        prop_assert_eq!(reassemble(&segment(&report), true), report);
    }

    #[test]
    fn prop_translation_preserves_structure(report in report()) {
        let ctx = translation_context();
        let translation = tokio_test::block_on(translate_report(&ctx, &report, "de")).unwrap();

        prop_assert_eq!(translation.degraded, 0);
        prop_assert_eq!(structure_check(&report, &translation.text), None);
        prop_assert_eq!(heading_count(&translation.text), heading_count(&report));
        prop_assert_eq!(
            citation_markers(&translation.text),
            citation_markers(&report)
        );
        if let Some(refs) = report.find("## References") {
            prop_assert!(translation.text.ends_with(&report[refs..]));
        }
    }
}
