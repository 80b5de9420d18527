//! In-memory storage backend.
//!
//! Transactions take a writer lock, work on a private copy of the tables,
//! and publish it on commit. Readers always see the last committed state.
//! Useful for tests and short-lived indexers that don't need persistence.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use blockindex_core::error::StorageError;
use blockindex_core::gaps;
use blockindex_core::schema::{
    AccountRow, BlockRow, EventRow, EventTopicRow, HeightRange, TransactionRow,
    ValidatorAggregate, ValidatorContribution,
};
use blockindex_core::store::{IndexStore, StoreTx};
use blockindex_core::types::TokenBalance;

#[derive(Debug, Default, Clone)]
struct Tables {
    blocks: BTreeMap<u64, BlockRow>,
    transactions: HashMap<String, TransactionRow>,
    events: HashMap<String, EventRow>,
    /// Keyed by `(event_id, topic)`.
    topics: BTreeMap<(String, String), EventTopicRow>,
    /// Address → name.
    validators: HashMap<String, String>,
    /// Block id → contribution.
    contributions: HashMap<String, ValidatorContribution>,
    module_state: HashMap<String, String>,
}

impl Tables {
    fn upsert_block(&mut self, block: &BlockRow) {
        let mut row = block.clone();
        if let Some(existing) = self.blocks.get(&block.height) {
            row.is_final |= existing.is_final;
        }
        self.blocks.insert(row.height, row);
    }

    fn transactions_by_block(&self, block_id: &str) -> Vec<TransactionRow> {
        let mut rows: Vec<_> = self
            .transactions
            .values()
            .filter(|t| t.block_id == block_id)
            .cloned()
            .collect();
        rows.sort_by_key(|t| t.index);
        rows
    }

    fn events_by_block(&self, block_id: &str) -> Vec<EventRow> {
        let mut rows: Vec<_> = self
            .events
            .values()
            .filter(|e| e.block_id == block_id)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.index);
        rows
    }
}

/// In-memory relational index.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    accounts: Mutex<HashMap<String, AccountRow>>,
    kv: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed blocks.
    pub fn block_count(&self) -> usize {
        self.tables.read().unwrap().blocks.len()
    }

    /// Number of indexed transactions.
    pub fn transaction_count(&self) -> usize {
        self.tables.read().unwrap().transactions.len()
    }

    /// Number of indexed events.
    pub fn event_count(&self) -> usize {
        self.tables.read().unwrap().events.len()
    }

    /// Number of event-topic rows.
    pub fn topic_count(&self) -> usize {
        self.tables.read().unwrap().topics.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap()
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError> {
        let guard = self.writer.clone().lock_owned().await;
        let working = self.read().clone();
        Ok(Box::new(MemoryTx {
            tables: Arc::clone(&self.tables),
            working,
            _guard: guard,
        }))
    }

    async fn block_at_height(&self, height: u64) -> Result<Option<BlockRow>, StorageError> {
        Ok(self.read().blocks.get(&height).cloned())
    }

    async fn block_by_id(&self, id: &str) -> Result<Option<BlockRow>, StorageError> {
        Ok(self.read().blocks.values().find(|b| b.id == id).cloned())
    }

    async fn blocks_in_range(
        &self,
        from: u64,
        to: u64,
        limit: u32,
    ) -> Result<Vec<BlockRow>, StorageError> {
        if to < from {
            return Ok(vec![]);
        }
        Ok(self
            .read()
            .blocks
            .range(from..=to)
            .take(limit as usize)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn max_height(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.read().blocks.keys().next_back().copied())
    }

    async fn non_final_blocks(
        &self,
        max_height: u64,
        limit: u32,
    ) -> Result<Vec<BlockRow>, StorageError> {
        Ok(self
            .read()
            .blocks
            .range(..=max_height)
            .filter(|(_, b)| !b.is_final)
            .take(limit as usize)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn count_blocks(&self, from: u64, to: u64) -> Result<u64, StorageError> {
        if to < from {
            return Ok(0);
        }
        Ok(self.read().blocks.range(from..=to).count() as u64)
    }

    async fn max_height_in_range(&self, from: u64, to: u64) -> Result<Option<u64>, StorageError> {
        if to < from {
            return Ok(None);
        }
        Ok(self.read().blocks.range(from..=to).next_back().map(|(h, _)| *h))
    }

    async fn gap_ranges(&self, from: u64, to: u64) -> Result<Vec<HeightRange>, StorageError> {
        if to < from {
            return Ok(vec![]);
        }
        let tables = self.read();
        let heights: Vec<u64> = tables
            .blocks
            .range(..from)
            .next_back()
            .map(|(h, _)| *h)
            .into_iter()
            .chain(tables.blocks.range(from..=to).map(|(h, _)| *h))
            .collect();
        Ok(gaps::interior_gaps(from, to, &heights))
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionRow>, StorageError> {
        Ok(self.read().transactions.get(id).cloned())
    }

    async fn transactions_by_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<TransactionRow>, StorageError> {
        Ok(self.read().transactions_by_block(block_id))
    }

    async fn events_by_block(&self, block_id: &str) -> Result<Vec<EventRow>, StorageError> {
        Ok(self.read().events_by_block(block_id))
    }

    async fn events_by_topic(&self, topic: &str) -> Result<Vec<EventRow>, StorageError> {
        let tables = self.read();
        let mut rows: Vec<EventRow> = tables
            .topics
            .values()
            .filter(|t| t.topic == topic)
            .filter_map(|t| tables.events.get(&t.event_id).cloned())
            .collect();
        rows.sort_by_key(|e| (e.height, e.index));
        Ok(rows)
    }

    async fn validator(&self, address: &str) -> Result<Option<ValidatorAggregate>, StorageError> {
        let tables = self.read();
        let Some(name) = tables.validators.get(address) else {
            return Ok(None);
        };
        Ok(Some(ValidatorAggregate::from_contributions(
            address,
            name,
            tables.contributions.values().filter(|c| c.address == address),
        )))
    }

    async fn module_state(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read().module_state.get(key).cloned())
    }

    async fn account(&self, address: &str) -> Result<Option<AccountRow>, StorageError> {
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }

    async fn merge_public_key(&self, address: &str, public_key: &str) -> Result<(), StorageError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry(address.to_string())
            .or_insert_with(|| AccountRow {
                address: address.to_string(),
                ..Default::default()
            });
        if account.public_key.is_none() {
            account.public_key = Some(public_key.to_string());
            account.updated_at = chrono::Utc::now().timestamp();
        }
        Ok(())
    }

    async fn set_balances(
        &self,
        address: &str,
        balances: &[TokenBalance],
    ) -> Result<(), StorageError> {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry(address.to_string())
            .or_insert_with(|| AccountRow {
                address: address.to_string(),
                ..Default::default()
            });
        account.balances = balances.to_vec();
        account.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.kv.lock().unwrap().get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.kv.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<(), StorageError> {
        self.kv.lock().unwrap().remove(key);
        Ok(())
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// A pending in-memory transaction. Holds the writer lock until it ends.
struct MemoryTx {
    tables: Arc<RwLock<Tables>>,
    working: Tables,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn block_at_height(&mut self, height: u64) -> Result<Option<BlockRow>, StorageError> {
        Ok(self.working.blocks.get(&height).cloned())
    }

    async fn upsert_block(&mut self, block: &BlockRow) -> Result<(), StorageError> {
        self.working.upsert_block(block);
        Ok(())
    }

    async fn mark_final(&mut self, block_ids: &[String]) -> Result<u64, StorageError> {
        let mut changed = 0;
        for block in self.working.blocks.values_mut() {
            if !block.is_final && block_ids.contains(&block.id) {
                block.is_final = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn delete_blocks(&mut self, block_ids: &[String]) -> Result<(), StorageError> {
        self.working.blocks.retain(|_, b| !block_ids.contains(&b.id));
        Ok(())
    }

    async fn upsert_transaction(&mut self, tx: &TransactionRow) -> Result<(), StorageError> {
        self.working.transactions.insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn transactions_by_block(
        &mut self,
        block_id: &str,
    ) -> Result<Vec<TransactionRow>, StorageError> {
        Ok(self.working.transactions_by_block(block_id))
    }

    async fn delete_transactions(&mut self, ids: &[String]) -> Result<(), StorageError> {
        for id in ids {
            self.working.transactions.remove(id);
        }
        Ok(())
    }

    async fn upsert_events(&mut self, events: &[EventRow]) -> Result<(), StorageError> {
        for event in events {
            self.working.topics.retain(|(event_id, _), _| event_id != &event.id);
            for topic in event.topic_rows() {
                self.working
                    .topics
                    .insert((topic.event_id.clone(), topic.topic.clone()), topic);
            }
            self.working.events.insert(event.id.clone(), event.clone());
        }
        Ok(())
    }

    async fn delete_events_by_blocks(&mut self, block_ids: &[String]) -> Result<(), StorageError> {
        self.working.events.retain(|_, e| !block_ids.contains(&e.block_id));
        self.working.topics.retain(|_, t| !block_ids.contains(&t.block_id));
        Ok(())
    }

    async fn ensure_validator(&mut self, address: &str, name: &str) -> Result<(), StorageError> {
        self.working
            .validators
            .entry(address.to_string())
            .or_insert_with(|| name.to_string());
        Ok(())
    }

    async fn upsert_contribution(
        &mut self,
        contribution: &ValidatorContribution,
    ) -> Result<(), StorageError> {
        self.working
            .contributions
            .insert(contribution.block_id.clone(), contribution.clone());
        Ok(())
    }

    async fn delete_contributions(&mut self, block_ids: &[String]) -> Result<(), StorageError> {
        for id in block_ids {
            self.working.contributions.remove(id);
        }
        Ok(())
    }

    async fn module_state(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.working.module_state.get(key).cloned())
    }

    async fn set_module_state(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.working
            .module_state
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_module_state(&mut self, key: &str) -> Result<(), StorageError> {
        self.working.module_state.remove(key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTx {
            tables,
            working,
            _guard,
        } = *self;
        *tables.write().unwrap() = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use blockindex_core::metadata::IndexMetadata;
    use blockindex_core::schema::ExecutionStatus;
    use serde_json::{json, Value};

    fn block(height: u64, id: &str) -> BlockRow {
        BlockRow {
            id: id.into(),
            height,
            timestamp: height as i64 * 10,
            generator_address: "gen".into(),
            previous_block_id: String::new(),
            size: 100,
            is_final: false,
            assets_modules: vec!["token".into()],
            number_of_events: 0,
            reward: 0,
        }
    }

    fn transaction(id: &str, block_id: &str, index: u32) -> TransactionRow {
        TransactionRow {
            id: id.into(),
            block_id: block_id.into(),
            height: 1,
            index,
            module_command: "token:transfer".into(),
            nonce: 0,
            fee: 10,
            sender_public_key: "00".into(),
            sender_address: "addr".into(),
            timestamp: 10,
            execution_status: ExecutionStatus::Success,
            params: Value::Null,
        }
    }

    fn event(block_id: &str, index: u32, topics: &[&str]) -> EventRow {
        EventRow {
            id: EventRow::derive_id(block_id, index),
            block_id: block_id.into(),
            height: 1,
            index,
            module: "token".into(),
            name: "transfer".into(),
            timestamp: 10,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: json!({}),
        }
    }

    async fn index(store: &MemoryStore, heights: &[u64]) {
        let mut tx = store.begin().await.unwrap();
        for h in heights {
            tx.upsert_block(&block(*h, &format!("b{h}"))).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_block(&block(1, "a")).await.unwrap();
        assert!(store.block_at_height(1).await.unwrap().is_none());
        tx.commit().await.unwrap();
        assert_eq!(store.block_at_height(1).await.unwrap().unwrap().id, "a");
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_block(&block(1, "a")).await.unwrap();
        tx.upsert_transaction(&transaction("t1", "a", 0)).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.block_count(), 0);
        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes_and_releases_lock() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.upsert_block(&block(1, "a")).await.unwrap();
        }
        let tx = store.begin().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test]
    async fn finality_never_reverts() {
        let store = MemoryStore::new();
        index(&store, &[1]).await;

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.mark_final(&["b1".to_string()]).await.unwrap(), 1);
        assert_eq!(tx.mark_final(&["b1".to_string()]).await.unwrap(), 0);
        tx.commit().await.unwrap();

        // Re-indexing with is_final = false keeps the flag.
        index(&store, &[1]).await;
        assert!(store.block_at_height(1).await.unwrap().unwrap().is_final);
    }

    #[tokio::test]
    async fn range_queries() {
        let store = MemoryStore::new();
        index(&store, &[1, 2, 5, 6, 9]).await;

        assert_eq!(store.count_blocks(1, 9).await.unwrap(), 5);
        assert_eq!(store.count_blocks(3, 4).await.unwrap(), 0);
        assert_eq!(store.max_height().await.unwrap(), Some(9));
        assert_eq!(store.max_height_in_range(1, 7).await.unwrap(), Some(6));
        assert_eq!(
            store.gap_ranges(1, 9).await.unwrap(),
            vec![HeightRange::new(3, 4), HeightRange::new(7, 8)]
        );
        let in_range = store.blocks_in_range(2, 6, 2).await.unwrap();
        assert_eq!(in_range.iter().map(|b| b.height).collect::<Vec<_>>(), vec![2, 5]);
    }

    #[tokio::test]
    async fn non_final_blocks_respects_height_and_limit() {
        let store = MemoryStore::new();
        index(&store, &[1, 2, 3, 4]).await;
        let mut tx = store.begin().await.unwrap();
        tx.mark_final(&["b1".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store.non_final_blocks(3, 1000).await.unwrap();
        assert_eq!(rows.iter().map(|b| b.height).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(store.non_final_blocks(3, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_and_topics_cascade_with_block() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_block(&block(1, "a")).await.unwrap();
        tx.upsert_events(&[event("a", 0, &["t1", "addr"]), event("a", 1, &["addr"])])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.event_count(), 2);
        assert_eq!(store.topic_count(), 3);
        assert_eq!(store.events_by_topic("addr").await.unwrap().len(), 2);

        let mut tx = store.begin().await.unwrap();
        tx.delete_events_by_blocks(&["a".to_string()]).await.unwrap();
        tx.delete_blocks(&["a".to_string()]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.event_count(), 0);
        assert_eq!(store.topic_count(), 0);
        assert_eq!(store.block_count(), 0);
    }

    #[tokio::test]
    async fn validator_aggregate_is_a_projection() {
        let store = MemoryStore::new();
        let contribution = |block_id: &str| ValidatorContribution {
            block_id: block_id.into(),
            height: 1,
            address: "val".into(),
            commission: 7,
            self_stake_reward: 3,
        };

        let mut tx = store.begin().await.unwrap();
        tx.ensure_validator("val", "genesis_0").await.unwrap();
        tx.upsert_contribution(&contribution("a")).await.unwrap();
        tx.upsert_contribution(&contribution("a")).await.unwrap();
        tx.upsert_contribution(&contribution("b")).await.unwrap();
        tx.commit().await.unwrap();

        let agg = store.validator("val").await.unwrap().unwrap();
        assert_eq!(agg.generated_blocks, 2);
        assert_eq!(agg.total_commission, 14);
        assert_eq!(agg.name, "genesis_0");

        let mut tx = store.begin().await.unwrap();
        tx.delete_contributions(&["b".to_string()]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.validator("val").await.unwrap().unwrap().generated_blocks, 1);
        assert!(store.validator("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn public_key_is_merged_once() {
        let store = MemoryStore::new();
        store.merge_public_key("addr", "aa").await.unwrap();
        store.merge_public_key("addr", "bb").await.unwrap();
        let account = store.account("addr").await.unwrap().unwrap();
        assert_eq!(account.public_key.as_deref(), Some("aa"));
    }

    #[tokio::test]
    async fn metadata_heights_roundtrip() {
        let store: Arc<dyn IndexStore> = Arc::new(MemoryStore::new());
        let meta = IndexMetadata::new(store.clone());

        assert!(meta.index_verified_height().await.unwrap().is_none());
        meta.set_index_verified_height(42).await.unwrap();
        assert_eq!(meta.index_verified_height().await.unwrap(), Some(42));

        assert_eq!(meta.advance_finalized_height(10).await.unwrap(), 10);
        assert_eq!(meta.advance_finalized_height(8).await.unwrap(), 10);
        assert_eq!(meta.finalized_height().await.unwrap(), Some(10));

        store.kv_set("genesisHeight", "not-a-number").await.unwrap();
        assert!(meta.genesis_height().await.is_err());
    }
}
