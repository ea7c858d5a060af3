//! Recall engine integration tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{
    consolidation_none, extraction_response, fact_json, sync_engine, ScriptedLlm,
};
use engram::models::{IncludeOptions, TagMatch};
use engram::{RecallOptions, RetainOptions};

fn recall_llm() -> std::sync::Arc<ScriptedLlm> {
    ScriptedLlm::new(|request| match request.scope {
        "extraction" => {
            let chunk = request.messages.last().unwrap().content.clone();
            Ok(extraction_response(&[fact_json(&chunk, "world", None, &[], &[])]))
        },
        "consolidation" => Ok(consolidation_none()),
        other => panic!("unexpected scope {other}"),
    })
}

/// Extraction that echoes the chunk with a fixed event date per marker.
fn dated_llm() -> std::sync::Arc<ScriptedLlm> {
    ScriptedLlm::new(|request| match request.scope {
        "extraction" => {
            let chunk = request.messages.last().unwrap().content.clone();
            let event_date = if chunk.contains("June") {
                Some("2024-06-15T10:00:00Z")
            } else {
                Some("2023-11-02T10:00:00Z")
            };
            Ok(extraction_response(&[fact_json(
                &chunk,
                "world",
                event_date,
                &[("Melanie", "person")],
                &[],
            )]))
        },
        "consolidation" => Ok(consolidation_none()),
        other => panic!("unexpected scope {other}"),
    })
}

#[test]
fn test_insert_then_get() {
    let engine = sync_engine(recall_llm());
    engine
        .retain(
            "b1",
            "The library added a rooftop reading garden.",
            RetainOptions::default(),
        )
        .unwrap();

    let result = engine
        .recall(
            "b1",
            "The library added a rooftop reading garden.",
            RecallOptions::default(),
        )
        .unwrap();
    assert!(!result.results.is_empty());
    assert!(result.results[0]
        .unit
        .text
        .contains("rooftop reading garden"));
}

#[test]
fn test_empty_bank_returns_empty_result() {
    let engine = sync_engine(recall_llm());
    let result = engine
        .recall("empty-bank", "anything at all", RecallOptions::default())
        .unwrap();
    assert!(result.results.is_empty());
}

#[test]
fn test_bank_isolation() {
    let engine = sync_engine(recall_llm());
    engine
        .retain("b1", "Secret launch planned for spring.", RetainOptions::default())
        .unwrap();
    engine
        .retain("b2", "Public picnic planned for summer.", RetainOptions::default())
        .unwrap();

    let result = engine
        .recall("b2", "launch planned", RecallOptions::default())
        .unwrap();
    for recalled in &result.results {
        assert_eq!(recalled.unit.bank_id, "b2");
    }
}

#[test]
fn test_recall_determinism() {
    let engine = sync_engine(recall_llm());
    for text in [
        "Ada fixed the compiler bug on Monday.",
        "Ada reviewed the parser patch on Tuesday.",
        "Grace profiled the allocator on Wednesday.",
        "The build farm was upgraded over the weekend.",
    ] {
        engine.retain("b1", text, RetainOptions::default()).unwrap();
    }

    let options = RecallOptions::default();
    let first: Vec<String> = engine
        .recall("b1", "what did Ada do", options.clone())
        .unwrap()
        .results
        .iter()
        .map(|r| r.unit.id.to_string())
        .collect();
    let second: Vec<String> = engine
        .recall("b1", "what did Ada do", options)
        .unwrap()
        .results
        .iter()
        .map(|r| r.unit.id.to_string())
        .collect();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_temporal_constraint_filters() {
    let engine = sync_engine(dated_llm());
    engine
        .retain(
            "b1",
            "Melanie hiked the coastal trail in June 2024.",
            RetainOptions::default(),
        )
        .unwrap();
    engine
        .retain(
            "b1",
            "Melanie attended a pottery class last autumn.",
            RetainOptions::default(),
        )
        .unwrap();

    let result = engine
        .recall(
            "b1",
            "melanie activities in June 2024",
            RecallOptions::default(),
        )
        .unwrap();
    assert!(!result.results.is_empty());
    for recalled in &result.results {
        assert_eq!(recalled.unit.event_date.format("%Y-%m").to_string(), "2024-06");
    }
}

#[test]
fn test_tag_filtering_modes() {
    let engine = sync_engine(recall_llm());
    engine
        .retain(
            "b1",
            "Tagged work note about the audit.",
            RetainOptions {
                tags: vec!["work".to_string()],
                ..RetainOptions::default()
            },
        )
        .unwrap();
    engine
        .retain("b1", "Untagged note about the audit.", RetainOptions::default())
        .unwrap();

    let lenient = engine
        .recall(
            "b1",
            "note about the audit",
            RecallOptions {
                tags: vec!["work".to_string()],
                tags_match: TagMatch::Any,
                ..RecallOptions::default()
            },
        )
        .unwrap();
    assert_eq!(lenient.results.len(), 2);

    let strict = engine
        .recall(
            "b1",
            "note about the audit",
            RecallOptions {
                tags: vec!["work".to_string()],
                tags_match: TagMatch::AnyStrict,
                ..RecallOptions::default()
            },
        )
        .unwrap();
    assert_eq!(strict.results.len(), 1);
    assert_eq!(strict.results[0].unit.tags, vec!["work".to_string()]);
}

#[test]
fn test_trace_emits_all_fields() {
    let engine = sync_engine(recall_llm());
    engine
        .retain("b1", "A fact worth tracing.", RetainOptions::default())
        .unwrap();

    let result = engine
        .recall(
            "b1",
            "fact worth tracing",
            RecallOptions {
                enable_trace: true,
                ..RecallOptions::default()
            },
        )
        .unwrap();

    let trace = result.trace.expect("trace requested");
    assert_eq!(trace.query_info.query, "fact worth tracing");
    assert_eq!(trace.entry_points.len(), 4);
    assert!(!trace.node_visits.is_empty());
    assert!(!trace.pruning_decisions.is_empty());
    assert!(!trace.phase_metrics.is_empty());
    assert!(trace.summary.selected_count >= 1);

    // The wire shape stays stable even for empty sections.
    let value = serde_json::to_value(&trace).unwrap();
    for field in [
        "query_info",
        "entry_points",
        "node_visits",
        "weight_components",
        "link_info",
        "pruning_decisions",
        "selection",
        "summary",
        "phase_metrics",
    ] {
        assert!(value.get(field).is_some(), "missing {field}");
    }
}

#[test]
fn test_token_budget_truncates() {
    let engine = sync_engine(recall_llm());
    for text in [
        "Recurring topic: the garden redesign needs a drainage plan.",
        "Recurring topic: the kitchen renovation is waiting on permits.",
        "Recurring topic: the book club picked a new mystery novel.",
        "Recurring topic: the marathon training schedule slipped a week.",
        "Recurring topic: the budget review moved to Thursday morning.",
        "Recurring topic: the greenhouse tomatoes finally ripened.",
    ] {
        engine.retain("b1", text, RetainOptions::default()).unwrap();
    }

    let tight = engine
        .recall(
            "b1",
            "recurring topic",
            RecallOptions {
                max_tokens: 30,
                ..RecallOptions::default()
            },
        )
        .unwrap();
    let loose = engine
        .recall(
            "b1",
            "recurring topic",
            RecallOptions {
                max_tokens: 4096,
                ..RecallOptions::default()
            },
        )
        .unwrap();
    assert!(tight.results.len() < loose.results.len());
    assert!(!tight.results.is_empty());
}

#[test_case::test_case(engram::RecallBudget::Low; "low budget")]
#[test_case::test_case(engram::RecallBudget::Mid; "mid budget")]
#[test_case::test_case(engram::RecallBudget::High; "high budget")]
fn test_every_budget_finds_results(budget: engram::RecallBudget) {
    let engine = sync_engine(recall_llm());
    engine
        .retain("b1", "The observatory reopened after repairs.", RetainOptions::default())
        .unwrap();

    let result = engine
        .recall(
            "b1",
            "observatory reopened",
            RecallOptions {
                budget,
                ..RecallOptions::default()
            },
        )
        .unwrap();
    assert!(!result.results.is_empty());
}

#[test]
fn test_include_entities_and_reflections() {
    let engine = sync_engine(dated_llm());
    engine
        .retain("b1", "Melanie hiked in June.", RetainOptions::default())
        .unwrap();
    engine
        .create_reflection(
            "b1",
            "melanie-profile",
            "who is melanie?",
            "Melanie is an avid hiker and potter.",
            &[],
            None,
        )
        .unwrap();

    let result = engine
        .recall(
            "b1",
            "what does Melanie do",
            RecallOptions {
                include: IncludeOptions {
                    entities: true,
                    reflections: true,
                    mental_models: false,
                },
                ..RecallOptions::default()
            },
        )
        .unwrap();

    assert!(result
        .entities
        .iter()
        .any(|e| e.canonical_name == "Melanie"));
    assert!(result
        .reflections
        .iter()
        .any(|r| r.content.contains("avid hiker")));
}
