//! Missing-range detection over the indexed heights.

use std::sync::Arc;

use blockindex_core::error::IndexerError;
use blockindex_core::gaps;
use blockindex_core::schema::HeightRange;
use blockindex_core::store::IndexStore;

/// Finds the heights of `[from, to]` that have no indexed block.
#[derive(Clone)]
pub struct GapFinder {
    store: Arc<dyn IndexStore>,
    bootstrap_threshold: u64,
}

impl GapFinder {
    pub fn new(store: Arc<dyn IndexStore>, bootstrap_threshold: u64) -> Self {
        Self {
            store,
            bootstrap_threshold,
        }
    }

    /// Missing ranges of `[from, to]`, ascending, disjoint and inclusive.
    ///
    /// A range with fewer than `bootstrap_threshold` indexed blocks is
    /// reported missing as a whole, unless every height in it is indexed.
    pub async fn find_missing_ranges(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<HeightRange>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        let indexed = self.store.count_blocks(from, to).await?;
        let span = HeightRange::new(from, to);
        if span.is_covered_by(indexed) {
            return Ok(vec![]);
        }
        if indexed < self.bootstrap_threshold {
            return Ok(vec![span]);
        }

        let mut ranges = self.store.gap_ranges(from, to).await?;
        let highest = self.store.max_height_in_range(from, to).await?;
        if let Some(trailing) = gaps::trailing_gap(from, to, highest) {
            ranges.push(trailing);
        }
        Ok(ranges)
    }

    /// Missing heights of `[from, to]`, ascending.
    pub async fn missing_heights(&self, from: u64, to: u64) -> Result<Vec<u64>, IndexerError> {
        Ok(gaps::expand(&self.find_missing_ranges(from, to).await?))
    }
}

impl std::fmt::Debug for GapFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapFinder")
            .field("bootstrap_threshold", &self.bootstrap_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockindex_core::schema::BlockRow;
    use blockindex_storage::MemoryStore;

    async fn store_with(heights: &[u64]) -> Arc<dyn IndexStore> {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
        let mut tx = store.begin().await.unwrap();
        for &height in heights {
            tx.upsert_block(&BlockRow {
                id: format!("b{height}"),
                height,
                timestamp: 0,
                generator_address: "gen".into(),
                previous_block_id: String::new(),
                size: 0,
                is_final: false,
                assets_modules: vec![],
                number_of_events: 0,
                reward: 0,
            })
            .await
            .unwrap();
        }
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn empty_index_is_one_range() {
        let finder = GapFinder::new(store_with(&[]).await, 3);
        assert_eq!(
            finder.find_missing_ranges(1, 100).await.unwrap(),
            vec![HeightRange::new(1, 100)]
        );
    }

    #[tokio::test]
    async fn interior_gaps_are_found() {
        let finder = GapFinder::new(store_with(&[1, 2, 5, 6, 9]).await, 3);
        assert_eq!(
            finder.find_missing_ranges(1, 9).await.unwrap(),
            vec![HeightRange::new(3, 4), HeightRange::new(7, 8)]
        );
        assert_eq!(finder.missing_heights(1, 9).await.unwrap(), vec![3, 4, 7, 8]);
    }

    #[tokio::test]
    async fn trailing_gap_is_reported() {
        let finder = GapFinder::new(store_with(&[1, 2, 3, 5]).await, 3);
        assert_eq!(
            finder.find_missing_ranges(1, 8).await.unwrap(),
            vec![HeightRange::new(4, 4), HeightRange::new(6, 8)]
        );
    }

    #[tokio::test]
    async fn sparse_index_below_threshold_is_one_range() {
        let finder = GapFinder::new(store_with(&[4, 7]).await, 3);
        assert_eq!(
            finder.find_missing_ranges(1, 9).await.unwrap(),
            vec![HeightRange::new(1, 9)]
        );

        let eager = GapFinder::new(store_with(&[4, 7]).await, 1);
        assert_eq!(
            eager.find_missing_ranges(1, 9).await.unwrap(),
            vec![
                HeightRange::new(1, 3),
                HeightRange::new(5, 6),
                HeightRange::new(8, 9)
            ]
        );
    }

    #[tokio::test]
    async fn full_width_range_is_searchable() {
        let finder = GapFinder::new(store_with(&[1, 2, 5, 6, 9]).await, 3);
        assert_eq!(
            finder.find_missing_ranges(0, u64::MAX).await.unwrap(),
            vec![
                HeightRange::new(0, 0),
                HeightRange::new(3, 4),
                HeightRange::new(7, 8),
                HeightRange::new(10, u64::MAX)
            ]
        );

        let empty = GapFinder::new(store_with(&[]).await, 3);
        assert_eq!(
            empty.find_missing_ranges(0, u64::MAX).await.unwrap(),
            vec![HeightRange::new(0, u64::MAX)]
        );
    }

    #[tokio::test]
    async fn complete_range_has_no_gaps() {
        let finder = GapFinder::new(store_with(&[10, 11]).await, 3);
        assert!(finder.find_missing_ranges(10, 11).await.unwrap().is_empty());
        assert!(finder.find_missing_ranges(11, 10).await.unwrap().is_empty());
    }
}
