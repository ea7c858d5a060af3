//! Retain pipeline integration tests.
//!
//! Drives the full content -> extraction -> entities -> dedup -> links
//! path with a scripted LLM and the deterministic hash embedder.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::{
    consolidation_none, extraction_response, fact_json, no_opinions, sync_engine, ScriptedLlm,
};
use engram::models::UnitId;
use engram::{Error, FactType, RetainOptions};

/// Scripted client for retain tests: extraction facts come from the
/// handler, consolidation is a no-op.
fn retain_llm(
    extraction: impl Fn(&str) -> String + Send + Sync + 'static,
) -> std::sync::Arc<ScriptedLlm> {
    ScriptedLlm::new(move |request| match request.scope {
        "extraction" => {
            let chunk = &request.messages.last().unwrap().content;
            Ok(extraction(chunk))
        },
        "consolidation" => Ok(consolidation_none()),
        "opinion_extraction" => Ok(no_opinions()),
        other => panic!("unexpected LLM scope {other}"),
    })
}

#[test]
fn test_first_person_rewriting() {
    let llm = retain_llm(|_| {
        extraction_response(&[fact_json(
            "I won the marathon.",
            "experience",
            Some("2023-05-07T09:00:00Z"),
            &[("Marcus", "person")],
            &[],
        )])
    });
    let engine = sync_engine(llm);
    engine
        .set_bank_mission("b1", "Long-term memories of Marcus, amateur runner.")
        .unwrap();

    let op_id = engine
        .retain("b1", "Marcus won the marathon in 2023.", RetainOptions::default())
        .unwrap();

    let operation = engine.get_operation(&op_id).unwrap().unwrap();
    let unit_ids = operation.result.unwrap()["unit_ids"].clone();
    assert_eq!(unit_ids.as_array().unwrap().len(), 1);

    let id = UnitId::new(unit_ids[0].as_str().unwrap());
    let unit = engine.store().get_unit("b1", &id).unwrap().unwrap();
    assert_eq!(unit.fact_type, FactType::Experience);
    assert!(unit.text.starts_with("I "), "text: {}", unit.text);
    assert_eq!(unit.event_date.format("%Y").to_string(), "2023");
}

#[test]
fn test_causal_chain_recorded_in_metadata() {
    let llm = retain_llm(|_| {
        extraction_response(&[
            fact_json(
                "I lost my job in January.",
                "experience",
                Some("2024-01-10T00:00:00Z"),
                &[],
                &[],
            ),
            fact_json(
                "Because I lost my job, I could not pay rent.",
                "experience",
                Some("2024-02-01T00:00:00Z"),
                &[],
                &[(0, "caused_by")],
            ),
            fact_json(
                "So I moved apartments.",
                "experience",
                Some("2024-03-01T00:00:00Z"),
                &[],
                &[(1, "caused_by")],
            ),
        ])
    });
    let engine = sync_engine(llm);

    let op_id = engine
        .retain(
            "b1",
            "I lost my job in January. Because I lost my job, I couldn't pay rent. \
             So I moved apartments.",
            RetainOptions::default(),
        )
        .unwrap();

    let operation = engine.get_operation(&op_id).unwrap().unwrap();
    let ids: Vec<UnitId> = operation.result.unwrap()["unit_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| UnitId::new(v.as_str().unwrap()))
        .collect();
    assert!(ids.len() >= 3);

    let second = engine.store().get_unit("b1", &ids[1]).unwrap().unwrap();
    let causal = second.metadata.get("causal_relations").expect("causal metadata");
    let causal: serde_json::Value = serde_json::from_str(causal).unwrap();
    assert_eq!(causal[0]["target_unit_id"], ids[0].as_str());
    assert_eq!(causal[0]["relation_type"], "caused_by");

    let third = engine.store().get_unit("b1", &ids[2]).unwrap().unwrap();
    let causal: serde_json::Value =
        serde_json::from_str(third.metadata.get("causal_relations").unwrap()).unwrap();
    assert_eq!(causal[0]["target_unit_id"], ids[1].as_str());
}

#[test]
fn test_dedup_idempotence() {
    let llm = retain_llm(|_| {
        extraction_response(&[fact_json(
            "The office moved to Berlin.",
            "world",
            None,
            &[],
            &[],
        )])
    });
    let engine = sync_engine(llm);

    let first = engine
        .retain("b1", "The office moved to Berlin.", RetainOptions::default())
        .unwrap();
    let second = engine
        .retain("b1", "The office moved to Berlin.", RetainOptions::default())
        .unwrap();

    assert_eq!(engine.store().count_units("b1").unwrap(), 1);

    let first_ids = engine.get_operation(&first).unwrap().unwrap().result.unwrap()["unit_ids"]
        .clone();
    let second_op = engine.get_operation(&second).unwrap().unwrap();
    let result = second_op.result.unwrap();
    assert_eq!(result["units_created"], 0);
    assert_eq!(result["duplicates"], 1);
    // The duplicate resolves to the same canonical unit id.
    assert_eq!(result["unit_ids"], first_ids);
}

#[test]
fn test_empty_content_rejected() {
    let llm = retain_llm(|_| extraction_response(&[]));
    let engine = sync_engine(llm);
    let result = engine.retain("b1", "   ", RetainOptions::default());
    assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[test]
fn test_shared_entity_creates_links() {
    let llm = retain_llm(|chunk| {
        if chunk.contains("New York") {
            extraction_response(&[fact_json(
                "John lives in New York.",
                "world",
                Some("2024-01-01T00:00:00Z"),
                &[("John", "person"), ("New York", "place")],
                &[],
            )])
        } else {
            extraction_response(&[fact_json(
                "John adopted a dog.",
                "world",
                Some("2024-05-01T00:00:00Z"),
                &[("John", "person")],
                &[],
            )])
        }
    });
    let engine = sync_engine(llm);

    engine
        .retain("b1", "John lives in New York.", RetainOptions::default())
        .unwrap();
    let op = engine
        .retain("b1", "John adopted a dog.", RetainOptions::default())
        .unwrap();

    let ids = engine.get_operation(&op).unwrap().unwrap().result.unwrap()["unit_ids"].clone();
    let new_id = UnitId::new(ids[0].as_str().unwrap());
    let links = engine
        .store()
        .links_from_units("b1", &[new_id])
        .unwrap();
    assert!(
        links
            .iter()
            .any(|l| l.link_type == engram::LinkType::Entity && l.entity_id.is_some()),
        "expected an entity link, got {links:?}"
    );
    // Exactly one John across both retains.
    let entities = engine.list_entities("b1").unwrap();
    let johns: Vec<_> = entities
        .iter()
        .filter(|e| e.canonical_name == "John")
        .collect();
    assert_eq!(johns.len(), 1);
}

#[test]
fn test_document_upsert_replaces_units() {
    let llm = retain_llm(|chunk| {
        if chunk.contains("version two") {
            extraction_response(&[fact_json(
                "The handbook now describes version two.",
                "world",
                None,
                &[],
                &[],
            )])
        } else {
            extraction_response(&[fact_json(
                "The handbook describes version one.",
                "world",
                None,
                &[],
                &[],
            )])
        }
    });
    let engine = sync_engine(llm);

    let first = engine
        .retain(
            "b1",
            "handbook text version one",
            RetainOptions {
                document_id: Some("handbook".to_string()),
                ..RetainOptions::default()
            },
        )
        .unwrap();
    let first_ids = engine.get_operation(&first).unwrap().unwrap().result.unwrap()["unit_ids"]
        .clone();
    let old_id = UnitId::new(first_ids[0].as_str().unwrap());

    engine
        .retain(
            "b1",
            "handbook text version two",
            RetainOptions {
                document_id: Some("handbook".to_string()),
                ..RetainOptions::default()
            },
        )
        .unwrap();

    // Prior units are gone, replacement exists, no orphan links remain.
    assert!(engine.store().get_unit("b1", &old_id).unwrap().is_none());
    assert_eq!(engine.store().count_units("b1").unwrap(), 1);
    assert!(engine
        .store()
        .links_from_units("b1", &[old_id])
        .unwrap()
        .is_empty());
    let document = engine.get_document("b1", "handbook").unwrap().unwrap();
    assert!(document.original_text.contains("version two"));
}

#[test]
fn test_delete_bank_cascades() {
    let llm = retain_llm(|_| {
        extraction_response(&[fact_json(
            "Mary plays the violin.",
            "world",
            None,
            &[("Mary", "person")],
            &[],
        )])
    });
    let engine = sync_engine(llm);
    engine
        .retain("b1", "Mary plays the violin.", RetainOptions::default())
        .unwrap();
    engine
        .create_reflection("b1", "mary", "mary?", "Mary is musical.", &[], None)
        .unwrap();

    assert!(engine.delete_bank("b1").unwrap());
    assert_eq!(engine.store().count_units("b1").unwrap(), 0);
    assert_eq!(engine.store().count_links("b1").unwrap(), 0);
    assert!(engine.list_entities("b1").unwrap().is_empty());
    assert!(engine.list_reflections("b1").unwrap().is_empty());
}

#[test]
fn test_store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("engram.db");

    let llm = retain_llm(|_| {
        extraction_response(&[fact_json(
            "The cellar flooded during the storm.",
            "world",
            None,
            &[],
            &[],
        )])
    });
    {
        let engine = engram::MemoryEngine::open(
            engram::EngramConfig::default()
                .synchronous()
                .with_db_path(&db_path),
            llm.clone(),
            std::sync::Arc::new(engram::embedding::HashEmbedder::new()),
        )
        .unwrap();
        engine
            .retain("b1", "The cellar flooded during the storm.", RetainOptions::default())
            .unwrap();
    }

    let reopened = engram::MemoryEngine::open(
        engram::EngramConfig::default()
            .synchronous()
            .with_db_path(&db_path),
        llm,
        std::sync::Arc::new(engram::embedding::HashEmbedder::new()),
    )
    .unwrap();
    assert_eq!(reopened.store().count_units("b1").unwrap(), 1);
    let found = reopened
        .recall("b1", "cellar flooded", engram::RecallOptions::default())
        .unwrap();
    assert!(!found.results.is_empty());
}

#[test]
fn test_failed_chunk_is_isolated() {
    // Extraction fails validation permanently; the retain still completes
    // with zero units instead of failing the batch.
    let llm = ScriptedLlm::new(|request| match request.scope {
        "extraction" => Ok("not json".to_string()),
        "consolidation" => Ok(consolidation_none()),
        other => panic!("unexpected scope {other}"),
    });
    let engine = sync_engine(llm);

    let op_id = engine
        .retain("b1", "something to remember", RetainOptions::default())
        .unwrap();
    let operation = engine.get_operation(&op_id).unwrap().unwrap();
    assert_eq!(operation.status, engram::OperationStatus::Completed);
    assert_eq!(operation.result.unwrap()["units_created"], 0);
}
