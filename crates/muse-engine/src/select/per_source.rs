use futures::future::join_all;
use muse_contracts::candidates::CandidateImage;
use tracing::info;

use super::Selector;
use crate::aggregate::dedup_by_key;
use crate::grid::MAX_CELLS;

fn ranking_context(context: &str, criteria: &str) -> String {
    let criteria = criteria.trim();
    match (context.trim().is_empty(), criteria.is_empty()) {
        (_, true) => context.trim().to_string(),
        (true, false) => format!("Selection criteria: {criteria}"),
        (false, false) => format!("{}\n\nSelection criteria: {criteria}", context.trim()),
    }
}

impl Selector {
    /// Ranks every source batch on its own grid, merges the winners and runs
    /// one more tournament round only if the merge is still too large.
    pub async fn select_per_source(
        &self,
        batches: Vec<Vec<CandidateImage>>,
        final_count: usize,
        criteria: &str,
    ) -> Vec<CandidateImage> {
        if final_count == 0 {
            return Vec::new();
        }
        let context = ranking_context(&self.config.context, criteria);
        let limit = self.config.per_source_limit.clamp(1, MAX_CELLS);
        let picks = self.config.per_source_picks.max(1);

        let batches: Vec<Vec<CandidateImage>> = batches
            .into_iter()
            .map(|batch| {
                let mut batch = dedup_by_key(batch);
                batch.truncate(limit);
                batch
            })
            .filter(|batch| !batch.is_empty())
            .collect();
        let labels: Vec<String> = (1..=batches.len())
            .map(|index| format!("{}_source{index}", self.config.label_prefix))
            .collect();

        let rankings = batches.iter().zip(&labels).map(|(batch, label)| {
            let context = context.as_str();
            async move {
                if batch.len() <= picks {
                    return batch.clone();
                }
                self.evaluate_page(batch, label, picks, context).await
            }
        });
        let merged = dedup_by_key(join_all(rankings).await.into_iter().flatten().collect());
        info!(
            batches = batches.len(),
            merged = merged.len(),
            final_count,
            "per-source ranking finished"
        );
        if merged.len() <= final_count {
            return merged;
        }

        let refined = self.run_round(&merged, final_count, 2, &context).await;
        let mut pool = refined.unwrap_or(merged);
        pool.truncate(final_count);
        pool
    }
}
