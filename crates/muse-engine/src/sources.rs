use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use muse_contracts::candidates::{CandidateImage, SourceOutcome};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One search to run: which source, what to ask it, and an optional size hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceQuery {
    pub source: String,
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SourceQuery {
    pub fn new(source: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            query: query.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A site or index that turns a text query into candidate images.
///
/// Implementations report failure through [`SourceOutcome::failed`] and never
/// return invented candidates.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, limit: Option<usize>) -> SourceOutcome;
}

#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn CandidateSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.register(source);
        self
    }

    pub fn register(&mut self, source: Arc<dyn CandidateSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CandidateSource>> {
        self.sources.get(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub async fn search(&self, query: &SourceQuery) -> SourceOutcome {
        let Some(source) = self.get(&query.source) else {
            warn!(source = %query.source, "unknown candidate source");
            return SourceOutcome::failed(
                &query.source,
                &query.query,
                format!("unknown source '{}'", query.source),
            );
        };
        let outcome = source.search(&query.query, query.limit).await;
        match &outcome.error {
            Some(error) => {
                warn!(source = %query.source, query = %query.query, "search failed: {error}")
            }
            None => debug!(
                source = %query.source,
                query = %query.query,
                found = outcome.candidates.len(),
                "search finished"
            ),
        }
        outcome
    }

    /// Runs every query concurrently; outcomes come back in query order.
    pub async fn search_all(&self, queries: &[SourceQuery]) -> Vec<SourceOutcome> {
        join_all(queries.iter().map(|query| self.search(query))).await
    }
}

/// Serves pre-fetched outcomes keyed by query text.
pub struct FixtureSource {
    name: String,
    outcomes: HashMap<String, SourceOutcome>,
    calls: AtomicUsize,
}

impl FixtureSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcomes: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_results(self, query: &str, candidates: Vec<CandidateImage>) -> Self {
        let outcome = SourceOutcome::ok(self.name.clone(), query, candidates);
        self.with_outcome(outcome)
    }

    pub fn with_failure(self, query: &str, error: &str) -> Self {
        let outcome = SourceOutcome::failed(self.name.clone(), query, error);
        self.with_outcome(outcome)
    }

    pub fn with_outcome(mut self, outcome: SourceOutcome) -> Self {
        self.outcomes.insert(outcome.query.clone(), outcome);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateSource for FixtureSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, limit: Option<usize>) -> SourceOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcome = self
            .outcomes
            .get(query)
            .cloned()
            .unwrap_or_else(|| SourceOutcome::ok(self.name.clone(), query, Vec::new()));
        outcome.source = self.name.clone();
        if let Some(limit) = limit {
            outcome.candidates.truncate(limit);
        }
        outcome
    }
}
