use futures::future::join_all;
use muse_contracts::candidates::CandidateImage;
use muse_contracts::events::SessionEvent;
use tracing::{info, warn};

use super::Selector;
use crate::aggregate::dedup_by_key;
use crate::emit_event;
use crate::grid::MAX_CELLS;

/// Winners requested from one page: at most half the page, and a fair share
/// of the final count plus one.
pub fn winners_per_page(page_len: usize, final_count: usize, pages: usize) -> usize {
    let half = page_len.div_ceil(2);
    let share = final_count.div_ceil(pages.max(1)) + 1;
    half.min(share)
}

impl Selector {
    /// Repeated grid rounds until the pool fits `final_count` or the round cap
    /// is reached, then truncation. Small pools come back untouched.
    pub async fn tournament(
        &self,
        pool: Vec<CandidateImage>,
        final_count: usize,
    ) -> Vec<CandidateImage> {
        let mut pool = dedup_by_key(pool);
        if final_count == 0 {
            return Vec::new();
        }
        if pool.len() <= final_count {
            return pool;
        }

        for round in 1..=self.config.round_cap {
            if pool.len() <= final_count {
                break;
            }
            match self.run_round(&pool, final_count, round, &self.config.context).await {
                Some(winners) => pool = winners,
                None => break,
            }
        }
        pool.truncate(final_count);
        pool
    }

    /// One round over pages of up to nine. `None` when the round timed out.
    pub(super) async fn run_round(
        &self,
        pool: &[CandidateImage],
        final_count: usize,
        round: usize,
        context: &str,
    ) -> Option<Vec<CandidateImage>> {
        let pages: Vec<&[CandidateImage]> = pool.chunks(MAX_CELLS).collect();
        let page_count = pages.len();
        let labels: Vec<String> = (1..=page_count)
            .map(|group| format!("{}_round{round}_group{group}", self.config.label_prefix))
            .collect();
        let evaluations = pages.iter().zip(&labels).map(|(page, label)| {
            let limit = winners_per_page(page.len(), final_count, page_count);
            self.evaluate_page(page, label, limit, context)
        });

        let all = join_all(evaluations);
        let results = match self.config.round_timeout {
            Some(limit) => match tokio::time::timeout(limit, all).await {
                Ok(results) => results,
                Err(_) => {
                    warn!(round, pages = page_count, "round timed out; keeping previous pool");
                    self.round_finished(round, page_count, pool.len(), None);
                    return None;
                }
            },
            None => all.await,
        };

        let winners = dedup_by_key(results.into_iter().flatten().collect());
        info!(
            round,
            pages = page_count,
            input = pool.len(),
            winners = winners.len(),
            "round finished"
        );
        self.round_finished(round, page_count, pool.len(), Some(winners.len()));
        Some(winners)
    }

    fn round_finished(&self, round: usize, pages: usize, input: usize, winners: Option<usize>) {
        emit_event(
            self.events.as_ref(),
            SessionEvent::RoundFinished {
                round,
                pages,
                input,
                winners,
                timed_out: winners.is_none(),
            },
        );
    }
}
