//! The recall engine.
//!
//! Multi-signal candidate gathering (vector, lexical, entity, recency),
//! spreading activation over the memory graph, cross-encoder reranking,
//! MMR diversification, and token-budget truncation, with an optional
//! full retrieval trace.
//!
//! Recall never fails because of upstream LLM issues: the language model
//! is not on this path. An empty bank yields an empty result.

// Score arithmetic tolerates f32 precision loss.
#![allow(clippy::cast_precision_loss)]

use super::entity_resolver::EntityResolver;
use super::query_analyzer::QueryAnalyzer;
use crate::config::{BudgetCaps, RecallConfig};
use crate::embedding::Embedder;
use crate::models::trace::{
    EntryPoint, LinkInfo, NodeVisit, PhaseMetric, PruningDecision, QueryInfo, RecallTrace,
    SelectionScore, WeightComponents,
};
use crate::models::{
    Entity, FactType, MemoryUnit, RecallOptions, RecallResult, RecalledUnit, UnitId,
};
use crate::rerank::CrossEncoder;
use crate::storage::vector::cosine_similarity;
use crate::storage::SqliteStore;
use crate::Result;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Fact types searched when the caller does not restrict them.
const DEFAULT_FACT_TYPES: &[FactType] = &[
    FactType::World,
    FactType::Experience,
    FactType::Opinion,
    FactType::Observation,
];

#[derive(Debug, Default, Clone, Copy)]
struct SeedComponents {
    vector: f32,
    lexical: f32,
    entity: f32,
    recent: f32,
}

/// The recall engine.
pub struct RecallEngine {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    cross_encoder: Arc<dyn CrossEncoder>,
    resolver: Arc<EntityResolver>,
    analyzer: QueryAnalyzer,
    config: RecallConfig,
}

impl RecallEngine {
    /// Creates a new engine.
    #[must_use]
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        cross_encoder: Arc<dyn CrossEncoder>,
        resolver: Arc<EntityResolver>,
        config: RecallConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            cross_encoder,
            resolver,
            analyzer: QueryAnalyzer::new(),
            config,
        }
    }

    /// The engine's embedder handle, shared with collaborating services.
    #[must_use]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Recalls memories for a query.
    ///
    /// # Errors
    ///
    /// Returns an error only for storage or embedding failures; an empty
    /// bank or an unmatched query returns an empty result.
    pub fn recall(
        &self,
        bank_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> Result<RecallResult> {
        let caps = options.budget.caps();
        let fact_types: Vec<FactType> = if options.fact_types.is_empty() {
            DEFAULT_FACT_TYPES.to_vec()
        } else {
            options.fact_types.clone()
        };

        let mut trace = options.enable_trace.then(RecallTrace::default);
        let mut result = RecallResult::default();

        if self.store.count_units(bank_id)? == 0 {
            if let Some(trace) = trace.take() {
                result.trace = Some(trace);
            }
            return Ok(result);
        }

        // Phase 1: temporal extraction.
        let phase_start = Instant::now();
        let reference = options.reference_time.unwrap_or_else(Utc::now);
        let temporal = self.analyzer.analyze(query, reference).temporal_constraint;
        if let Some(trace) = trace.as_mut() {
            trace.query_info = QueryInfo {
                query: query.to_string(),
                fact_types: fact_types.iter().map(|ft| ft.as_str().to_string()).collect(),
                budget: format!("{:?}", options.budget).to_lowercase(),
                temporal_constraint: temporal
                    .map(|t| (t.start.to_rfc3339(), t.end.to_rfc3339())),
            };
            trace.weight_components = WeightComponents {
                vector: self.config.weight_vector,
                lexical: self.config.weight_lexical,
                entity: self.config.weight_entity,
                recent: self.config.weight_recent,
                activation: self.config.activation_decay,
            };
            trace.phase_metrics.push(phase_metric("temporal", phase_start));
        }

        // Phase 2: seed gathering.
        let phase_start = Instant::now();
        let query_embedding = self.embedder.embed(query)?;
        let (seeds, seed_components) =
            self.gather_seeds(bank_id, query, &query_embedding, &fact_types, &caps, trace.as_mut())?;
        if let Some(trace) = trace.as_mut() {
            trace.summary.seed_count = seeds.len();
            trace.phase_metrics.push(phase_metric("seeds", phase_start));
        }

        // Phase 3: spreading activation.
        let phase_start = Instant::now();
        let mut units: HashMap<UnitId, MemoryUnit> = HashMap::new();
        self.fetch_units(bank_id, seeds.keys(), &mut units)?;
        let activation = self.spread_activation(
            bank_id,
            seeds,
            &seed_components,
            &fact_types,
            &caps,
            &mut units,
            trace.as_mut(),
        )?;
        if let Some(trace) = trace.as_mut() {
            trace.summary.activated_count = activation.len();
            trace.phase_metrics.push(phase_metric("activation", phase_start));
        }

        // Phases 4-5: temporal and tag filters.
        let phase_start = Instant::now();
        let mut ranked: Vec<(UnitId, f32)> = activation.into_iter().collect();
        sort_ranked(&mut ranked, &units);

        let before = ranked.len();
        if let Some(constraint) = temporal {
            ranked.retain(|(id, _)| {
                units
                    .get(id)
                    .is_some_and(|u| constraint.contains(u.event_date))
            });
            push_pruning(trace.as_mut(), "temporal_filter", before, ranked.len());
        }

        let before = ranked.len();
        ranked.retain(|(id, _)| {
            units
                .get(id)
                .is_some_and(|u| options.tags_match.matches(&options.tags, &u.tags))
        });
        push_pruning(trace.as_mut(), "tag_filter", before, ranked.len());

        let before = ranked.len();
        ranked.truncate(caps.shortlist);
        push_pruning(trace.as_mut(), "shortlist", before, ranked.len());
        if let Some(trace) = trace.as_mut() {
            trace.summary.shortlist_count = ranked.len();
            trace.phase_metrics.push(phase_metric("filters", phase_start));
        }

        // Phase 6: cross-encoder rerank.
        let phase_start = Instant::now();
        let final_scores = self.rerank(query, &ranked, &units, trace.as_mut())?;
        if let Some(trace) = trace.as_mut() {
            trace.phase_metrics.push(phase_metric("rerank", phase_start));
        }

        // Phases 7-8: MMR diversification under the token budget.
        let phase_start = Instant::now();
        let selected = self.mmr_select(
            &final_scores,
            &units,
            caps.mmr_lambda,
            options.max_tokens,
            trace.as_mut(),
        );
        if let Some(trace) = trace.as_mut() {
            trace.summary.selected_count = selected.len();
            trace.phase_metrics.push(phase_metric("mmr", phase_start));
        }

        result.results = selected
            .into_iter()
            .filter_map(|(id, score)| {
                units.remove(&id).map(|unit| RecalledUnit { unit, score })
            })
            .collect();

        // Phase 9: includes.
        if options.include.entities {
            result.entities = self.collect_entities(bank_id, &result.results)?;
        }
        if options.include.reflections {
            let hits = self.store.reflections_top_k(
                bank_id,
                &query_embedding,
                &options.tags,
                options.tags_match,
                caps.shortlist.min(10),
            )?;
            result.reflections = hits.into_iter().map(|(r, _)| r).collect();
        }
        if options.include.mental_models {
            result.mental_models = self.recall_mental_models(bank_id, query, options)?;
        }

        result.trace = trace;
        Ok(result)
    }

    /// Gathers the four seed signals and combines them into one weighted
    /// seed score per unit.
    fn gather_seeds(
        &self,
        bank_id: &str,
        query: &str,
        query_embedding: &[f32],
        fact_types: &[FactType],
        caps: &BudgetCaps,
        mut trace: Option<&mut RecallTrace>,
    ) -> Result<(HashMap<UnitId, f32>, HashMap<UnitId, SeedComponents>)> {
        let mut components: HashMap<UnitId, SeedComponents> = HashMap::new();

        let vector_hits =
            self.store
                .vector_top_k(bank_id, query_embedding, fact_types, caps.candidate_k, 0.0)?;
        record_signal(&mut trace, "vector", &vector_hits);
        for (id, score) in normalize_by_max(vector_hits) {
            components.entry(id).or_default().vector = score;
        }

        let lexical_hits =
            self.store
                .lexical_top_k(bank_id, query, fact_types, caps.candidate_k)?;
        record_signal(&mut trace, "lexical", &lexical_hits);
        for (id, score) in normalize_by_max(lexical_hits) {
            components.entry(id).or_default().lexical = score;
        }

        let entity_ids = self.resolver.lookup_query_entities(bank_id, query)?;
        let entity_hits: Vec<(UnitId, f32)> = self
            .store
            .units_mentioning_entities(bank_id, &entity_ids)?
            .into_iter()
            .map(|(unit, _)| (unit, 1.0))
            .collect();
        record_signal(&mut trace, "entity", &entity_hits);
        for (id, score) in normalize_by_max(entity_hits) {
            components.entry(id).or_default().entity = score;
        }

        let recent_hits: Vec<(UnitId, f32)> = self
            .store
            .recent_units(bank_id, fact_types, (caps.candidate_k / 4).max(1))?
            .into_iter()
            .enumerate()
            .map(|(rank, (id, _))| (id, 1.0 / (rank as f32 + 1.0)))
            .collect();
        record_signal(&mut trace, "recent", &recent_hits);
        for (id, score) in normalize_by_max(recent_hits) {
            components.entry(id).or_default().recent = score;
        }

        let seeds = components
            .iter()
            .map(|(id, c)| {
                let score = self.config.weight_vector * c.vector
                    + self.config.weight_lexical * c.lexical
                    + self.config.weight_entity * c.entity
                    + self.config.weight_recent * c.recent;
                (id.clone(), score)
            })
            .collect();
        Ok((seeds, components))
    }

    /// Runs bounded spreading activation:
    /// `A_r[v] = decay * A_{r-1}[v] + Σ A_{r-1}[u] * w(u→v) * type_coef`.
    #[allow(clippy::too_many_arguments)]
    fn spread_activation(
        &self,
        bank_id: &str,
        seeds: HashMap<UnitId, f32>,
        seed_components: &HashMap<UnitId, SeedComponents>,
        fact_types: &[FactType],
        caps: &BudgetCaps,
        units: &mut HashMap<UnitId, MemoryUnit>,
        mut trace: Option<&mut RecallTrace>,
    ) -> Result<HashMap<UnitId, f32>> {
        if let Some(trace) = trace.as_deref_mut() {
            for (id, score) in &seeds {
                let c = seed_components.get(id).copied().unwrap_or_default();
                trace.node_visits.push(NodeVisit {
                    unit_id: id.to_string(),
                    round: 0,
                    activation: *score,
                    components: WeightComponents {
                        vector: c.vector,
                        lexical: c.lexical,
                        entity: c.entity,
                        recent: c.recent,
                        activation: *score,
                    },
                    context: units.get(id).and_then(|u| u.context.clone()),
                });
            }
        }

        let mut activation = seeds;
        for round in 1..=caps.activation_rounds {
            let frontier: Vec<UnitId> = activation.keys().cloned().collect();
            let links = self.store.links_from_units(bank_id, &frontier)?;

            let mut next: HashMap<UnitId, f32> = activation
                .iter()
                .map(|(id, score)| (id.clone(), score * self.config.activation_decay))
                .collect();

            for link in &links {
                let Some(&source) = activation.get(&link.from_unit) else {
                    continue;
                };
                let contribution =
                    source * link.weight * link.link_type.activation_coefficient();
                *next.entry(link.to_unit.clone()).or_insert(0.0) += contribution;
                if let Some(trace) = trace.as_deref_mut() {
                    trace.link_info.push(LinkInfo {
                        from_unit: link.from_unit.to_string(),
                        to_unit: link.to_unit.to_string(),
                        link_type: link.link_type.as_str().to_string(),
                        weight: link.weight,
                        contribution,
                    });
                }
            }

            // Activation may reach units outside the requested fact types;
            // those nodes are dropped here.
            self.fetch_units(bank_id, next.keys(), units)?;
            next.retain(|id, _| {
                units
                    .get(id)
                    .is_some_and(|u| fact_types.contains(&u.fact_type))
            });

            let before = next.len();
            let mut ranked: Vec<(UnitId, f32)> = next.into_iter().collect();
            sort_ranked(&mut ranked, units);
            ranked.truncate(caps.candidate_k);
            push_pruning(trace.as_deref_mut(), "activation_topk", before, ranked.len());

            if let Some(trace) = trace.as_deref_mut() {
                for (id, score) in &ranked {
                    trace.node_visits.push(NodeVisit {
                        unit_id: id.to_string(),
                        round,
                        activation: *score,
                        components: WeightComponents::default(),
                        // Mental-model units may carry no context; the
                        // tracer must tolerate the null.
                        context: units.get(id).and_then(|u| u.context.clone()),
                    });
                }
            }

            activation = ranked.into_iter().collect();
        }
        Ok(activation)
    }

    /// Cross-encodes the shortlist and blends with activation:
    /// `final = blend * normalize(cross) + (1 - blend) * activation`.
    fn rerank(
        &self,
        query: &str,
        shortlist: &[(UnitId, f32)],
        units: &HashMap<UnitId, MemoryUnit>,
        trace: Option<&mut RecallTrace>,
    ) -> Result<Vec<(UnitId, f32)>> {
        if shortlist.is_empty() {
            return Ok(Vec::new());
        }
        let passages: Vec<&str> = shortlist
            .iter()
            .map(|(id, _)| units.get(id).map_or("", |u| u.text.as_str()))
            .collect();
        let cross_scores = self.cross_encoder.score(query, &passages)?;
        let normalized_cross = min_max_normalize(&cross_scores);

        let mut scored: Vec<(UnitId, f32)> = shortlist
            .iter()
            .zip(normalized_cross.iter())
            .map(|((id, activation), cross)| {
                let final_score = self.config.rerank_blend * cross
                    + (1.0 - self.config.rerank_blend) * activation;
                (id.clone(), final_score)
            })
            .collect();
        sort_ranked(&mut scored, units);

        if let Some(trace) = trace {
            for (index, (id, activation)) in shortlist.iter().enumerate() {
                trace.selection.push(SelectionScore {
                    unit_id: id.to_string(),
                    final_score: scored
                        .iter()
                        .find(|(s, _)| s == id)
                        .map_or(0.0, |(_, f)| *f),
                    cross_score: cross_scores.get(index).copied().unwrap_or(0.0),
                    activation: *activation,
                });
            }
        }
        Ok(scored)
    }

    /// MMR diversification under the token budget: pick the unit
    /// maximizing `λ·score − (1−λ)·max_sim(selected)` until the budget or
    /// the shortlist runs out.
    fn mmr_select(
        &self,
        ranked: &[(UnitId, f32)],
        units: &HashMap<UnitId, MemoryUnit>,
        lambda: f32,
        max_tokens: usize,
        trace: Option<&mut RecallTrace>,
    ) -> Vec<(UnitId, f32)> {
        let mut remaining: Vec<(UnitId, f32)> = ranked.to_vec();
        let mut selected: Vec<(UnitId, f32)> = Vec::new();
        let mut spent_tokens = 0usize;

        while !remaining.is_empty() {
            let mut best_index = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (index, (id, score)) in remaining.iter().enumerate() {
                let Some(unit) = units.get(id) else { continue };
                let redundancy = selected
                    .iter()
                    .filter_map(|(sid, _)| units.get(sid))
                    .map(|s| cosine_similarity(&unit.embedding, &s.embedding))
                    .fold(0.0f32, f32::max);
                let value = lambda * score - (1.0 - lambda) * redundancy;
                if value > best_value {
                    best_value = value;
                    best_index = index;
                }
            }

            let (id, score) = remaining.remove(best_index);
            let cost = units
                .get(&id)
                .map_or(self.config.token_overhead, |u| {
                    u.estimated_tokens(self.config.token_overhead)
                });
            if spent_tokens + cost > max_tokens && !selected.is_empty() {
                break;
            }
            spent_tokens += cost;
            selected.push((id, score));
        }

        if let Some(trace) = trace {
            trace.pruning_decisions.push(PruningDecision {
                stage: "token_budget".to_string(),
                before: ranked.len(),
                after: selected.len(),
            });
        }
        selected
    }

    fn recall_mental_models(
        &self,
        bank_id: &str,
        query: &str,
        options: &RecallOptions,
    ) -> Result<Vec<RecalledUnit>> {
        let mut inner = options.clone();
        inner.fact_types = vec![FactType::MentalModel];
        inner.include = crate::models::IncludeOptions::default();
        inner.enable_trace = false;
        Ok(self.recall(bank_id, query, &inner)?.results)
    }

    fn collect_entities(
        &self,
        bank_id: &str,
        results: &[RecalledUnit],
    ) -> Result<Vec<Entity>> {
        let ids: Vec<UnitId> = results.iter().map(|r| r.unit.id.clone()).collect();
        let pairs = self.store.entities_for_units(bank_id, &ids)?;
        let mut seen = HashSet::new();
        Ok(pairs
            .into_iter()
            .filter(|(_, entity)| seen.insert(entity.id.clone()))
            .map(|(_, entity)| entity)
            .collect())
    }

    fn fetch_units<'a>(
        &self,
        bank_id: &str,
        ids: impl Iterator<Item = &'a UnitId>,
        units: &mut HashMap<UnitId, MemoryUnit>,
    ) -> Result<()> {
        let missing: Vec<UnitId> = ids.filter(|id| !units.contains_key(*id)).cloned().collect();
        for unit in self.store.get_units_by_ids(bank_id, &missing)? {
            units.insert(unit.id.clone(), unit);
        }
        Ok(())
    }
}

/// Normalizes raw signal scores to `[0, 1]` by the signal maximum.
fn normalize_by_max(hits: Vec<(UnitId, f32)>) -> Vec<(UnitId, f32)> {
    let max = hits.iter().map(|(_, s)| *s).fold(f32::NEG_INFINITY, f32::max);
    if max <= 0.0 || !max.is_finite() {
        return hits.into_iter().map(|(id, _)| (id, 0.0)).collect();
    }
    hits.into_iter().map(|(id, s)| (id, s / max)).collect()
}

/// Min-max normalizes a score slice; constant slices map to 0.5.
fn min_max_normalize(scores: &[f32]) -> Vec<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() < f32::EPSILON {
        return vec![0.5; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Sorts by score descending with the documented tie-breaks: newer
/// `created_at` first, then id ascending.
fn sort_ranked(ranked: &mut [(UnitId, f32)], units: &HashMap<UnitId, MemoryUnit>) {
    ranked.sort_by(|(a_id, a_score), (b_id, b_score)| {
        b_score
            .partial_cmp(a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let a_created = units.get(a_id).map(|u| u.created_at);
                let b_created = units.get(b_id).map(|u| u.created_at);
                b_created.cmp(&a_created)
            })
            .then_with(|| a_id.cmp(b_id))
    });
}

fn record_signal(
    trace: &mut Option<&mut RecallTrace>,
    signal: &str,
    hits: &[(UnitId, f32)],
) {
    if let Some(trace) = trace.as_deref_mut() {
        trace.entry_points.push(EntryPoint {
            signal: signal.to_string(),
            count: hits.len(),
            max_score: hits.iter().map(|(_, s)| *s).fold(0.0, f32::max),
        });
    }
}

fn push_pruning(trace: Option<&mut RecallTrace>, stage: &str, before: usize, after: usize) {
    if let Some(trace) = trace {
        trace.pruning_decisions.push(PruningDecision {
            stage: stage.to_string(),
            before,
            after,
        });
    }
}

fn phase_metric(phase: &str, start: Instant) -> PhaseMetric {
    PhaseMetric {
        phase: phase.to_string(),
        elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_by_max() {
        let hits = vec![
            (UnitId::new("a"), 2.0),
            (UnitId::new("b"), 1.0),
            (UnitId::new("c"), 0.0),
        ];
        let normalized = normalize_by_max(hits);
        assert!((normalized[0].1 - 1.0).abs() < 1e-6);
        assert!((normalized[1].1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_by_max_all_zero() {
        let hits = vec![(UnitId::new("a"), 0.0)];
        let normalized = normalize_by_max(hits);
        assert!(normalized[0].1.abs() < f32::EPSILON);
    }

    #[test]
    fn test_min_max_normalize_constant() {
        assert_eq!(min_max_normalize(&[3.0, 3.0]), vec![0.5, 0.5]);
    }

    #[test]
    fn test_min_max_normalize_range() {
        let normalized = min_max_normalize(&[1.0, 3.0, 2.0]);
        assert!((normalized[0]).abs() < 1e-6);
        assert!((normalized[1] - 1.0).abs() < 1e-6);
        assert!((normalized[2] - 0.5).abs() < 1e-6);
    }
}
