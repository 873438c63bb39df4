use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use muse_contracts::candidates::{CandidateImage, SourceOutcome};
use muse_contracts::events::{EventWriter, SessionEvent};
use muse_contracts::images::{ImageCategory, ImageId, ImageKind};
use tracing::{info, warn};

use crate::aggregate::{aggregate, AggregatedPool};
use crate::config::SelectorConfig;
use crate::emit_event;
use crate::grid::{GridCellInput, GridCompositor, GridRequest};
use crate::oracle::{SelectionOracle, SelectionQuery};
use crate::registry::ImageRegistry;
use crate::sources::{SourceQuery, SourceRegistry};

mod per_source;
mod tournament;

pub use tournament::winners_per_page;

/// Narrows candidate pools to a shortlist by asking the oracle about grids.
pub struct Selector {
    registry: Arc<ImageRegistry>,
    compositor: Arc<GridCompositor>,
    oracle: SelectionOracle,
    sources: SourceRegistry,
    config: SelectorConfig,
    events: Option<EventWriter>,
}

impl Selector {
    pub fn new(
        compositor: Arc<GridCompositor>,
        oracle: SelectionOracle,
        config: SelectorConfig,
    ) -> Self {
        Self {
            registry: compositor.registry().clone(),
            compositor,
            oracle,
            sources: SourceRegistry::new(),
            config,
            events: None,
        }
    }

    pub fn with_sources(mut self, sources: SourceRegistry) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Searches every query, pools the results and runs the tournament.
    pub async fn search_and_select(
        &self,
        queries: &[SourceQuery],
        final_count: usize,
    ) -> Vec<CandidateImage> {
        if queries.is_empty() {
            return Vec::new();
        }
        let outcomes = self.search(queries).await;
        let pool = self.pool(&outcomes);
        let selected = self.tournament(pool.candidates, final_count).await;
        self.selection_finished("tournament", final_count, &selected);
        selected
    }

    /// Ranks each query's results on their own before merging them.
    pub async fn search_and_select_per_source(
        &self,
        queries: &[SourceQuery],
        final_count: usize,
        criteria: &str,
    ) -> Vec<CandidateImage> {
        if queries.is_empty() {
            return Vec::new();
        }
        let hinted: Vec<SourceQuery> = queries
            .iter()
            .map(|query| SourceQuery {
                limit: query.limit.or(Some(self.config.per_source_limit)),
                ..query.clone()
            })
            .collect();
        let outcomes = self.search(&hinted).await;
        let batches = outcomes.into_iter().map(|outcome| outcome.candidates).collect();
        let selected = self.select_per_source(batches, final_count, criteria).await;
        self.selection_finished("per_source", final_count, &selected);
        selected
    }

    async fn search(&self, queries: &[SourceQuery]) -> Vec<SourceOutcome> {
        let outcomes = self.sources.search_all(queries).await;
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|outcome| outcome.is_failed())
            .map(|outcome| format!("{}:{}", outcome.source, outcome.query))
            .collect();
        let found: usize = outcomes.iter().map(|outcome| outcome.candidates.len()).sum();
        info!(queries = queries.len(), found, failed = failed.len(), "searches finished");

        emit_event(
            self.events.as_ref(),
            SessionEvent::SearchFinished {
                queries: queries.len(),
                found,
                failed,
            },
        );
        outcomes
    }

    fn pool(&self, outcomes: &[SourceOutcome]) -> AggregatedPool {
        let pool = aggregate(outcomes.iter().map(|outcome| outcome.candidates.clone()));
        info!(
            pool = pool.candidates.len(),
            invalid = pool.invalid,
            duplicates = pool.duplicates,
            "aggregated candidates"
        );
        pool
    }

    fn selection_finished(&self, strategy: &str, final_count: usize, selected: &[CandidateImage]) {
        info!(strategy, final_count, selected = selected.len(), "selection finished");
        emit_event(
            self.events.as_ref(),
            SessionEvent::SelectionFinished {
                strategy: strategy.to_string(),
                final_count,
                selected: selected
                    .iter()
                    .map(|candidate| candidate.canonical_key().to_string())
                    .collect(),
            },
        );
    }

    /// Registers, draws and judges one page. Any failure along the way makes
    /// the page contribute no winners.
    async fn evaluate_page(
        &self,
        page: &[CandidateImage],
        label: &str,
        limit: usize,
        context: &str,
    ) -> Vec<CandidateImage> {
        let registrations = page.iter().map(|candidate| async move {
            let reference = candidate.image_ref().unwrap_or_default();
            let result = self
                .registry
                .register_image(
                    reference,
                    ImageKind::Reference,
                    ImageCategory::Inspiration,
                    candidate.title.as_deref(),
                )
                .await;
            (candidate, result)
        });

        let mut by_id: HashMap<ImageId, &CandidateImage> = HashMap::new();
        let mut cells = Vec::new();
        for (candidate, result) in join_all(registrations).await {
            match result {
                Ok(id) => {
                    if by_id.contains_key(&id) {
                        continue;
                    }
                    by_id.insert(id, candidate);
                    cells.push(GridCellInput {
                        id,
                        reference: candidate.image_ref().unwrap_or_default().to_string(),
                        title: candidate.title.clone(),
                    });
                }
                Err(err) => {
                    warn!(label, page_url = %candidate.page_url, "skipping candidate: {err}")
                }
            }
        }
        if cells.is_empty() {
            return Vec::new();
        }

        let request = GridRequest {
            label: label.to_string(),
            aspect: self.config.aspect,
            cells,
        };
        let render = match self.compositor.compose(&request).await {
            Ok(render) => render,
            Err(err) => {
                warn!(label, "page dropped: {err}");
                return Vec::new();
            }
        };

        let query = SelectionQuery {
            grid_path: &render.path,
            label,
            context,
            guide: self.config.judge_guide.as_deref(),
            total: render.len(),
            limit: limit.min(render.len()),
        };
        let picks = match self.oracle.select(query).await {
            Ok(picks) => picks,
            Err(err) => {
                warn!(label, judge = self.oracle.judge_name(), "page dropped: {err}");
                return Vec::new();
            }
        };

        picks
            .iter()
            .filter_map(|pick| render.id_at(pick.position))
            .filter_map(|id| by_id.get(&id).map(|candidate| (*candidate).clone()))
            .collect()
    }
}
