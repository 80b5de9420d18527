//! Storage traits for the relational index.
//!
//! [`IndexStore`] covers reads, the non-transactional tables (accounts and
//! the scalar key/value store), and opening transactions. Every write that
//! belongs to a block goes through a [`StoreTx`] and becomes visible only on
//! [`StoreTx::commit`].
//!
//! Implementations live in `blockindex-storage` (memory, SQLite, Postgres).

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{
    AccountRow, BlockRow, EventRow, HeightRange, TransactionRow, ValidatorAggregate,
    ValidatorContribution,
};
use crate::types::TokenBalance;

/// A single storage transaction.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTx: Send {
    /// Block currently stored at `height`, as seen by this transaction.
    async fn block_at_height(&mut self, height: u64) -> Result<Option<BlockRow>, StorageError>;

    /// Insert or replace the block row at `block.height`.
    ///
    /// `is_final` is merged with the stored flag and never goes back to `false`.
    async fn upsert_block(&mut self, block: &BlockRow) -> Result<(), StorageError>;

    /// Flip `is_final` to `true` for the given block ids. Returns the number changed.
    async fn mark_final(&mut self, block_ids: &[String]) -> Result<u64, StorageError>;

    async fn delete_blocks(&mut self, block_ids: &[String]) -> Result<(), StorageError>;

    async fn upsert_transaction(&mut self, tx: &TransactionRow) -> Result<(), StorageError>;

    /// Transactions of a block, ordered by index.
    async fn transactions_by_block(
        &mut self,
        block_id: &str,
    ) -> Result<Vec<TransactionRow>, StorageError>;

    async fn delete_transactions(&mut self, ids: &[String]) -> Result<(), StorageError>;

    /// Upsert events together with their topic rows.
    async fn upsert_events(&mut self, events: &[EventRow]) -> Result<(), StorageError>;

    /// Delete events and topic rows belonging to the given blocks.
    async fn delete_events_by_blocks(&mut self, block_ids: &[String]) -> Result<(), StorageError>;

    /// Register a validator if it is not known yet.
    async fn ensure_validator(&mut self, address: &str, name: &str) -> Result<(), StorageError>;

    /// Insert or replace the contribution of one block.
    async fn upsert_contribution(
        &mut self,
        contribution: &ValidatorContribution,
    ) -> Result<(), StorageError>;

    async fn delete_contributions(&mut self, block_ids: &[String]) -> Result<(), StorageError>;

    /// Module-owned state, read inside the transaction.
    async fn module_state(&mut self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_module_state(&mut self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn delete_module_state(&mut self, key: &str) -> Result<(), StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// The relational index.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError>;

    // ─── Blocks ───────────────────────────────────────────────────────────────

    async fn block_at_height(&self, height: u64) -> Result<Option<BlockRow>, StorageError>;

    async fn block_by_id(&self, id: &str) -> Result<Option<BlockRow>, StorageError>;

    /// Blocks with `from <= height <= to`, ascending, at most `limit` rows.
    async fn blocks_in_range(
        &self,
        from: u64,
        to: u64,
        limit: u32,
    ) -> Result<Vec<BlockRow>, StorageError>;

    /// Highest indexed height.
    async fn max_height(&self) -> Result<Option<u64>, StorageError>;

    /// Non-final blocks at or below `max_height`, ascending, at most `limit`.
    async fn non_final_blocks(
        &self,
        max_height: u64,
        limit: u32,
    ) -> Result<Vec<BlockRow>, StorageError>;

    /// Number of blocks with `from <= height <= to`.
    async fn count_blocks(&self, from: u64, to: u64) -> Result<u64, StorageError>;

    /// Highest indexed height within `[from, to]`.
    async fn max_height_in_range(&self, from: u64, to: u64) -> Result<Option<u64>, StorageError>;

    /// Interior gaps of `[from, to]`: for every indexed `h` in `(from, to]`
    /// whose predecessor is missing, the range between the closest indexed
    /// height below `h` (or `from`) and `h - 1`.
    async fn gap_ranges(&self, from: u64, to: u64) -> Result<Vec<HeightRange>, StorageError>;

    // ─── Transactions / events ────────────────────────────────────────────────

    async fn transaction(&self, id: &str) -> Result<Option<TransactionRow>, StorageError>;

    async fn transactions_by_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<TransactionRow>, StorageError>;

    async fn events_by_block(&self, block_id: &str) -> Result<Vec<EventRow>, StorageError>;

    /// Events carrying `topic`, ordered by height then index.
    async fn events_by_topic(&self, topic: &str) -> Result<Vec<EventRow>, StorageError>;

    // ─── Validators ───────────────────────────────────────────────────────────

    /// Aggregate of a registered validator, `None` if unknown.
    async fn validator(&self, address: &str) -> Result<Option<ValidatorAggregate>, StorageError>;

    async fn module_state(&self, key: &str) -> Result<Option<String>, StorageError>;

    // ─── Accounts (non-transactional) ─────────────────────────────────────────

    async fn account(&self, address: &str) -> Result<Option<AccountRow>, StorageError>;

    /// Record the public key of `address` if none is known yet.
    async fn merge_public_key(&self, address: &str, public_key: &str) -> Result<(), StorageError>;

    async fn set_balances(
        &self,
        address: &str,
        balances: &[TokenBalance],
    ) -> Result<(), StorageError>;

    // ─── Scalar key/value (non-transactional) ─────────────────────────────────

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn kv_delete(&self, key: &str) -> Result<(), StorageError>;
}
