use indexmap::IndexMap;
use muse_contracts::candidates::CandidateImage;

/// A deduplicated, ordered pool and what was thrown away to build it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedPool {
    pub candidates: Vec<CandidateImage>,
    pub invalid: usize,
    pub duplicates: usize,
}

/// Merges per-source lists in discovery order, dropping candidates without an
/// image reference and later occurrences of an already seen canonical key.
pub fn aggregate<I>(lists: I) -> AggregatedPool
where
    I: IntoIterator<Item = Vec<CandidateImage>>,
{
    let mut unique: IndexMap<String, CandidateImage> = IndexMap::new();
    let mut invalid = 0;
    let mut duplicates = 0;
    for candidate in lists.into_iter().flatten() {
        if !candidate.is_valid() {
            invalid += 1;
            continue;
        }
        let key = candidate.canonical_key().to_string();
        if unique.contains_key(&key) {
            duplicates += 1;
            continue;
        }
        unique.insert(key, candidate);
    }
    AggregatedPool {
        candidates: unique.into_values().collect(),
        invalid,
        duplicates,
    }
}

/// Keeps the first candidate per canonical key, preserving order.
pub fn dedup_by_key(candidates: Vec<CandidateImage>) -> Vec<CandidateImage> {
    aggregate([candidates]).candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shot(page: &str, screenshot: &str) -> CandidateImage {
        CandidateImage::new(page).with_screenshot(screenshot)
    }

    #[test]
    fn shared_screenshot_collapses_to_first_seen() {
        let dribbble = vec![
            shot("https://dribbble.com/1", "https://cdn/a.png"),
            shot("https://dribbble.com/2", "https://cdn/b.png"),
        ];
        let behance = vec![
            shot("https://behance.net/9", "https://cdn/a.png"),
            shot("https://behance.net/8", "https://cdn/c.png"),
        ];

        let pool = aggregate([dribbble, behance]);
        let pages: Vec<&str> = pool.candidates.iter().map(|c| c.page_url.as_str()).collect();
        assert_eq!(
            pages,
            vec!["https://dribbble.com/1", "https://dribbble.com/2", "https://behance.net/8"]
        );
        assert_eq!(pool.duplicates, 1);
        assert_eq!(pool.invalid, 0);
    }

    #[test]
    fn candidates_without_images_are_dropped() {
        let pool = aggregate([vec![
            CandidateImage::new("https://site/no-image"),
            CandidateImage::new("https://site/thumb").with_thumbnail("https://cdn/t.jpg"),
        ]]);
        assert_eq!(pool.candidates.len(), 1);
        assert_eq!(pool.invalid, 1);
    }

    #[test]
    fn thumbnail_and_screenshot_keys_do_not_collide() {
        let pool = aggregate([vec![
            CandidateImage::new("https://site/1")
                .with_thumbnail("https://cdn/x.jpg")
                .with_screenshot("https://cdn/x_full.png"),
            CandidateImage::new("https://site/2").with_thumbnail("https://cdn/x.jpg"),
        ]]);
        assert_eq!(pool.candidates.len(), 2);
    }

    #[test]
    fn empty_input_gives_empty_pool() {
        let pool = aggregate(Vec::<Vec<CandidateImage>>::new());
        assert_eq!(pool, AggregatedPool::default());
    }
}
