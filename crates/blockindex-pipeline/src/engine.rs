//! The indexing engine.
//!
//! [`Indexer`] owns the store, the connector, the module registry and the
//! named work queues. Block writes happen in [`Indexer::index_block`] and
//! [`Indexer::delete_indexed_blocks`], each inside one storage transaction;
//! everything else decides *what* to enqueue.
//!
//! ```text
//! NewBlock ──► index_new_block ──► fork::decide ─┬─► indexBlocksQueue ──► index_block
//!                                                └─► deleteIndexedBlocksQueue ──► delete_indexed_blocks
//! ChainNewBlock ──► refresh_finality ──► updateBlockFinalityQueue ──► update_block_finality
//! index_block (after commit) ──► updateAccountBalanceQueue ──► refresh_balance
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use blockindex_core::address::address_from_public_key;
use blockindex_core::config::IndexerConfig;
use blockindex_core::connector::ChainConnector;
use blockindex_core::error::IndexerError;
use blockindex_core::events::{EventBus, IndexerEvent};
use blockindex_core::fork::{self, IngestDecision};
use blockindex_core::metadata::IndexMetadata;
use blockindex_core::module::{EffectContext, ModuleRegistry};
use blockindex_core::rewards::{minted_reward, reward_shares, RewardShares};
use blockindex_core::schema::{
    BlockRow, EventRow, ExecutionStatus, HeightRange, TransactionRow, ValidatorContribution,
};
use blockindex_core::store::{IndexStore, StoreTx};
use blockindex_core::types::{Block, BlockHeader, Transaction};

use crate::gaps::GapFinder;
use crate::jobs::{BalanceJob, DeleteJob, FinalityJob, IndexJob, QueueRunners, Queues};
use crate::queue::JobHandler;

/// Rows derived from a block before the storage transaction opens.
struct PreparedBlock {
    row: BlockRow,
    transactions: Vec<TransactionRow>,
    events: Vec<EventRow>,
    contribution: ValidatorContribution,
}

/// The reorg-safe block indexer.
pub struct Indexer {
    config: IndexerConfig,
    store: Arc<dyn IndexStore>,
    connector: Arc<dyn ChainConnector>,
    registry: Arc<ModuleRegistry>,
    metadata: IndexMetadata,
    gaps: GapFinder,
    events: EventBus,
    queues: Queues,
}

impl Indexer {
    /// Create the engine and its queues. The returned runners must be
    /// spawned with the engine for any queued job to execute.
    pub fn new(
        config: IndexerConfig,
        store: Arc<dyn IndexStore>,
        connector: Arc<dyn ChainConnector>,
        registry: Arc<ModuleRegistry>,
    ) -> (Arc<Self>, QueueRunners) {
        let (queues, runners) = Queues::new(&config.queues);
        let indexer = Self {
            metadata: IndexMetadata::new(Arc::clone(&store)),
            gaps: GapFinder::new(Arc::clone(&store), config.gap_bootstrap_threshold),
            events: EventBus::new(config.event_capacity),
            config,
            store,
            connector,
            registry,
            queues,
        };
        (Arc::new(indexer), runners)
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn connector(&self) -> &Arc<dyn ChainConnector> {
        &self.connector
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn gap_finder(&self) -> &GapFinder {
        &self.gaps
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    // ─── Block writes ─────────────────────────────────────────────────────────

    /// Index one block in a single storage transaction.
    ///
    /// A different non-final block already stored at the same height is
    /// reverted and removed in the same transaction. Re-indexing the same
    /// block reverts and rewrites its rows, so the result is identical.
    pub async fn index_block(&self, block: &Block) -> Result<(), IndexerError> {
        let prepared = self.prepare(block).await?;
        let height = prepared.row.height;

        let mut tx = self.store.begin().await?;
        let result = self.write_block(tx.as_mut(), &prepared).await;
        let replaced = finish(tx, result)
            .await
            .map_err(|e| report("index", height, &prepared.row.id, e))?;

        if !replaced.is_empty() {
            self.events.emit(IndexerEvent::DeleteTransactions(replaced));
        }
        self.after_index(&prepared).await;

        info!(
            height,
            block_id = %prepared.row.id,
            transactions = prepared.transactions.len(),
            events = prepared.events.len(),
            is_final = prepared.row.is_final,
            "block indexed"
        );
        Ok(())
    }

    async fn prepare(&self, block: &Block) -> Result<PreparedBlock, IndexerError> {
        block.validate()?;
        let header = &block.header;

        let mut transactions = Vec::with_capacity(block.transactions.len());
        for (index, tx) in block.transactions.iter().enumerate() {
            transactions.push(TransactionRow {
                id: tx.id.clone(),
                block_id: header.id.clone(),
                height: header.height,
                index: index as u32,
                module_command: tx.module_command(),
                nonce: tx.nonce,
                fee: tx.fee,
                sender_public_key: tx.sender_public_key.clone(),
                sender_address: address_from_public_key(&tx.sender_public_key)?,
                timestamp: header.timestamp,
                execution_status: execution_status(block, tx)?,
                params: tx.params.clone(),
            });
        }

        let events: Vec<EventRow> = block
            .events
            .iter()
            .map(|event| EventRow {
                id: EventRow::derive_id(&header.id, event.index),
                block_id: header.id.clone(),
                height: header.height,
                index: event.index,
                module: event.module.clone(),
                name: event.name.clone(),
                timestamp: header.timestamp,
                topics: event.topics.clone(),
                data: event.data.clone(),
            })
            .collect();

        let reward = minted_reward(&block.events).unwrap_or(0);
        let shares = if reward > 0 {
            match self
                .connector
                .get_pos_validator(&header.generator_address)
                .await?
            {
                Some(stake) => reward_shares(reward, &stake),
                None => {
                    debug!(
                        generator = %header.generator_address,
                        "no stake info for generator, reward shares left at zero"
                    );
                    RewardShares::default()
                }
            }
        } else {
            RewardShares::default()
        };

        // Read before the transaction opens: single-connection pools would
        // otherwise wait on themselves.
        let finalized = self.metadata.finalized_height().await?;
        let is_final = header.is_final || finalized.is_some_and(|f| header.height <= f);

        Ok(PreparedBlock {
            row: BlockRow {
                id: header.id.clone(),
                height: header.height,
                timestamp: header.timestamp,
                generator_address: header.generator_address.clone(),
                previous_block_id: header.previous_block_id.clone(),
                size: header.size,
                is_final,
                assets_modules: block.assets_modules(),
                number_of_events: block.events.len() as u32,
                reward,
            },
            contribution: ValidatorContribution {
                block_id: header.id.clone(),
                height: header.height,
                address: header.generator_address.clone(),
                commission: shares.commission,
                self_stake_reward: shares.self_stake_reward,
            },
            transactions,
            events,
        })
    }

    /// Returns the transactions of a replaced block, if one was replaced.
    async fn write_block(
        &self,
        tx: &mut dyn StoreTx,
        prepared: &PreparedBlock,
    ) -> Result<Vec<TransactionRow>, IndexerError> {
        let mut row = prepared.row.clone();
        let mut replaced = Vec::new();

        if let Some(existing) = tx.block_at_height(row.height).await? {
            if existing.id == row.id {
                row.is_final |= existing.is_final;
                self.remove_block(tx, &existing).await?;
            } else if existing.is_final {
                return Err(IndexerError::FinalityViolation {
                    height: row.height,
                    existing: existing.id,
                    incoming: row.id,
                });
            } else {
                warn!(
                    height = row.height,
                    replaced = %existing.id,
                    incoming = %row.id,
                    "replacing block at height"
                );
                replaced = self.remove_block(tx, &existing).await?;
            }
        }

        let header = row.header();
        for transaction in &prepared.transactions {
            tx.upsert_transaction(transaction).await?;
            let mut ctx = EffectContext {
                header: &header,
                transaction,
                store: &mut *tx,
            };
            self.registry.apply(&mut ctx).await?;
        }

        tx.ensure_validator(&header.generator_address, "").await?;
        tx.upsert_contribution(&prepared.contribution).await?;
        if !prepared.events.is_empty() {
            tx.upsert_events(&prepared.events).await?;
        }
        tx.upsert_block(&row).await?;
        debug!(height = row.height, block_id = %row.id, "block rows written");
        Ok(replaced)
    }

    /// Revert the effects of a stored block and delete its rows by id.
    async fn remove_block(
        &self,
        tx: &mut dyn StoreTx,
        block: &BlockRow,
    ) -> Result<Vec<TransactionRow>, IndexerError> {
        let header = block.header();
        let transactions = tx.transactions_by_block(&block.id).await?;
        for transaction in transactions.iter().rev() {
            let mut ctx = EffectContext {
                header: &header,
                transaction,
                store: &mut *tx,
            };
            self.registry.revert(&mut ctx).await?;
        }

        let ids: Vec<String> = transactions.iter().map(|t| t.id.clone()).collect();
        let block_ids = [block.id.clone()];
        tx.delete_transactions(&ids).await?;
        tx.delete_events_by_blocks(&block_ids).await?;
        tx.delete_contributions(&block_ids).await?;
        tx.delete_blocks(&block_ids).await?;
        debug!(height = block.height, block_id = %block.id, transactions = ids.len(), "block rows removed");
        Ok(transactions)
    }

    async fn remove_blocks(
        &self,
        tx: &mut dyn StoreTx,
        blocks: &[BlockRow],
    ) -> Result<Vec<TransactionRow>, IndexerError> {
        let mut reverted = Vec::new();
        for block in blocks.iter().rev() {
            reverted.extend(self.remove_block(tx, block).await?);
        }
        Ok(reverted)
    }

    /// Account bookkeeping that never fails the block.
    async fn after_index(&self, prepared: &PreparedBlock) {
        let mut addresses = BTreeSet::new();
        addresses.insert(prepared.row.generator_address.clone());
        for transaction in &prepared.transactions {
            if let Err(e) = self
                .store
                .merge_public_key(&transaction.sender_address, &transaction.sender_public_key)
                .await
            {
                warn!(address = %transaction.sender_address, error = %e, "public key merge failed");
            }
            addresses.insert(transaction.sender_address.clone());
        }
        for address in addresses {
            if let Err(e) = self
                .queues
                .account_balance
                .try_enqueue(BalanceJob { address })
            {
                warn!(error = %e, "balance refresh not enqueued");
            }
        }
    }

    /// Revert and remove `blocks` in one storage transaction.
    ///
    /// Blocks are processed from the last to the first, and transactions of
    /// each block in reverse index order. Returns the reverted transactions,
    /// which are also published as [`IndexerEvent::DeleteTransactions`].
    pub async fn delete_indexed_blocks(
        &self,
        blocks: &[BlockRow],
    ) -> Result<Vec<TransactionRow>, IndexerError> {
        let Some(first) = blocks.first() else {
            return Ok(vec![]);
        };
        let mut tx = self.store.begin().await?;
        let result = self.remove_blocks(tx.as_mut(), blocks).await;
        let reverted = finish(tx, result)
            .await
            .map_err(|e| report("delete", first.height, &first.id, e))?;

        info!(
            blocks = blocks.len(),
            transactions = reverted.len(),
            from = first.height,
            "indexed blocks deleted"
        );
        self.events
            .emit(IndexerEvent::DeleteTransactions(reverted.clone()));
        Ok(reverted)
    }

    /// Flip the given blocks to final. Returns the number changed.
    pub async fn update_block_finality(&self, block_ids: &[String]) -> Result<u64, IndexerError> {
        if block_ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.store.begin().await?;
        let result = tx.mark_final(block_ids).await.map_err(IndexerError::from);
        let changed = finish(tx, result).await?;
        info!(requested = block_ids.len(), changed, "blocks finalized");
        Ok(changed)
    }

    // ─── Ingestion ────────────────────────────────────────────────────────────

    /// Decide what to do with a block announced by the node and enqueue it.
    ///
    /// Finality promotion is recomputed whatever the decision.
    pub async fn index_new_block(&self, block: Block) -> Result<IngestDecision, IndexerError> {
        block.validate()?;
        let height = block.height();
        let existing = self.store.block_at_height(height).await?;
        let decision = fork::decide(existing.as_ref(), &block.header);

        let outcome = match &decision {
            IngestDecision::Index | IngestDecision::UpdateFinality => {
                self.queues
                    .index_blocks
                    .enqueue(IndexJob::Block(Box::new(block)))
                    .await
            }
            IngestDecision::Fork { .. } => self.enqueue_fork_repair(block).await,
            IngestDecision::Skip => {
                debug!(height, block_id = %block.id(), "block already indexed");
                Ok(())
            }
            IngestDecision::FinalityViolation { existing } => Err(IndexerError::FinalityViolation {
                height,
                existing: existing.clone(),
                incoming: block.id().to_string(),
            }),
        };

        let refreshed = self.refresh_finality().await;
        outcome?;
        refreshed?;
        Ok(decision)
    }

    /// [`index_new_block`](Self::index_new_block) for each block, in order.
    pub async fn index_new_blocks(
        &self,
        blocks: Vec<Block>,
    ) -> Result<Vec<IngestDecision>, IndexerError> {
        let mut decisions = Vec::with_capacity(blocks.len());
        for block in blocks {
            decisions.push(self.index_new_block(block).await?);
        }
        Ok(decisions)
    }

    async fn enqueue_fork_repair(&self, block: Block) -> Result<(), IndexerError> {
        let height = block.height();
        if let Some(max) = self.store.max_height().await? {
            if max > height {
                let stale = self.store.blocks_in_range(height + 1, max, u32::MAX).await?;
                if !stale.is_empty() {
                    warn!(height, count = stale.len(), "deleting blocks above fork point");
                    self.queues
                        .delete_blocks
                        .enqueue(DeleteJob { blocks: stale })
                        .await?;
                }
            }
        }
        self.queues
            .index_blocks
            .enqueue(IndexJob::Block(Box::new(block)))
            .await
    }

    /// Handle a block removed by the node: enqueue deletion of it and of
    /// every indexed block above it. Returns the number of blocks enqueued.
    pub async fn delete_block(&self, header: &BlockHeader) -> Result<usize, IndexerError> {
        let Some(existing) = self.store.block_at_height(header.height).await? else {
            return Ok(0);
        };
        if existing.id != header.id {
            debug!(height = header.height, block_id = %header.id, "deleted block is not indexed");
            return Ok(0);
        }
        if existing.is_final {
            return Err(IndexerError::Other(format!(
                "refusing to delete final block {} at height {}",
                existing.id, existing.height
            )));
        }
        let max = self.store.max_height().await?.unwrap_or(header.height);
        let blocks = self
            .store
            .blocks_in_range(header.height, max, u32::MAX)
            .await?;
        let count = blocks.len();
        self.queues.delete_blocks.enqueue(DeleteJob { blocks }).await?;
        info!(height = header.height, count, "block deletion enqueued");
        Ok(count)
    }

    /// Persist the node's finalized height and enqueue the non-final blocks
    /// at or below it for promotion. Returns the number of blocks enqueued.
    pub async fn refresh_finality(&self) -> Result<usize, IndexerError> {
        let info = self.connector.get_node_info().await?;
        let finalized = self
            .metadata
            .advance_finalized_height(info.finalized_height)
            .await?;
        let blocks = self
            .store
            .non_final_blocks(finalized, self.config.finality_batch_limit)
            .await?;
        if blocks.is_empty() {
            return Ok(0);
        }
        let count = blocks.len();
        self.queues
            .update_finality
            .enqueue(FinalityJob {
                block_ids: blocks.into_iter().map(|b| b.id).collect(),
            })
            .await?;
        debug!(finalized, count, "finality promotion enqueued");
        Ok(count)
    }

    // ─── Backfill ─────────────────────────────────────────────────────────────

    /// Enqueue one index job per height of `[from, to]`, walking from high
    /// to low in pages of `backfill_page_size`. Returns the number enqueued.
    pub async fn build_index(&self, from: u64, to: u64) -> Result<u64, IndexerError> {
        if to < from {
            return Ok(0);
        }
        let page = self.config.backfill_page_size.max(1);
        let mut enqueued = 0;
        let mut page_end = to;
        loop {
            let page_start = page_end.saturating_sub(page - 1).max(from);
            for height in (page_start..=page_end).rev() {
                self.queues
                    .index_blocks
                    .enqueue(IndexJob::Height(height))
                    .await?;
                enqueued += 1;
            }
            if page_start == from {
                break;
            }
            page_end = page_start - 1;
        }
        info!(from, to, enqueued, "backfill enqueued");
        Ok(enqueued)
    }

    /// Enqueue every missing height between the verified height and the
    /// chain tip, and move the verified height forward.
    pub async fn index_missing_blocks(&self) -> Result<u64, IndexerError> {
        let current = self.current_height().await?;
        let genesis = self.genesis_height().await?;
        let verified = self.metadata.index_verified_height().await?;
        let from = verified.map_or(genesis, |v| v.max(genesis));
        if from > current {
            return Ok(0);
        }

        let ranges = self.gaps.find_missing_ranges(from, current).await?;
        let Some(first) = ranges.first() else {
            if verified.map_or(true, |v| v < current) {
                self.metadata.set_index_verified_height(current).await?;
            }
            debug!(from, to = current, "no missing blocks");
            return Ok(0);
        };

        if first.from > from {
            let candidate = first.from - 1;
            if verified.map_or(true, |v| candidate > v) {
                self.metadata.set_index_verified_height(candidate).await?;
            }
        }

        let limit = self.config.max_missing_blocks_per_run;
        let mut enqueued = 0;
        for height in ranges.iter().flat_map(HeightRange::heights) {
            if enqueued >= limit {
                break;
            }
            self.queues
                .index_blocks
                .enqueue(IndexJob::Height(height))
                .await?;
            enqueued += 1;
        }
        info!(
            from,
            to = current,
            ranges = ranges.len(),
            enqueued,
            "missing blocks enqueued"
        );
        Ok(enqueued)
    }

    /// Missing ranges of `[from, to]`.
    pub async fn missing_blocks_list(
        &self,
        from: u64,
        to: u64,
    ) -> Result<Vec<HeightRange>, IndexerError> {
        self.gaps.find_missing_ranges(from, to).await
    }

    pub async fn index_verified_height(&self) -> Result<Option<u64>, IndexerError> {
        self.metadata.index_verified_height().await
    }

    pub async fn set_index_verified_height(&self, height: u64) -> Result<(), IndexerError> {
        self.metadata.set_index_verified_height(height).await
    }

    /// Height of the node's chain tip.
    pub async fn current_height(&self) -> Result<u64, IndexerError> {
        Ok(self.connector.get_node_info().await?.height)
    }

    /// Recorded genesis height, or the node's when none is recorded yet.
    pub async fn genesis_height(&self) -> Result<u64, IndexerError> {
        match self.metadata.genesis_height().await? {
            Some(height) => Ok(height),
            None => Ok(self.connector.get_node_info().await?.genesis_height),
        }
    }

    // ─── Genesis / accounts ───────────────────────────────────────────────────

    /// Register the genesis validators and stakers, and record `height` as
    /// the genesis height.
    pub async fn index_genesis(&self, height: u64) -> Result<(), IndexerError> {
        let validators = self.connector.get_pos_genesis_validators(height).await?;
        let stakers = self.connector.get_pos_genesis_stakers(height).await?;

        let mut tx = self.store.begin().await?;
        let mut result: Result<(), IndexerError> = Ok(());
        for validator in &validators {
            if let Err(e) = tx.ensure_validator(&validator.address, &validator.name).await {
                result = Err(e.into());
                break;
            }
        }
        finish(tx, result).await?;

        for staker in &stakers {
            self.queues
                .account_balance
                .enqueue(BalanceJob {
                    address: staker.address.clone(),
                })
                .await?;
        }
        self.metadata.set_genesis_height(height).await?;
        info!(
            height,
            validators = validators.len(),
            stakers = stakers.len(),
            "genesis indexed"
        );
        Ok(())
    }

    /// Fetch the token balances of `address` and store them.
    pub async fn refresh_balance(&self, address: &str) -> Result<(), IndexerError> {
        let balances = self.connector.get_token_balances(address).await?;
        self.store.set_balances(address, &balances).await?;
        debug!(address, tokens = balances.len(), "balances refreshed");
        Ok(())
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("chain", &self.config.chain)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Execution status from the `commandExecutionResult` event of `tx`.
fn execution_status(block: &Block, tx: &Transaction) -> Result<ExecutionStatus, IndexerError> {
    let unresolved = || IndexerError::ExecutionStatusUnresolved {
        transaction_id: tx.id.clone(),
        block_id: block.header.id.clone(),
    };
    let event = block
        .events
        .iter()
        .find(|e| e.is_execution_result_of(tx))
        .ok_or_else(unresolved)?;
    match event.data.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(ExecutionStatus::Success),
        Some(false) => Ok(ExecutionStatus::Fail),
        None => Err(unresolved()),
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Box<dyn StoreTx>,
    result: Result<T, IndexerError>,
) -> Result<T, IndexerError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

fn report(operation: &str, height: u64, block_id: &str, err: IndexerError) -> IndexerError {
    if err.is_retryable() {
        warn!(operation, height, block_id, error = %err, "transient failure");
    } else {
        error!(operation, height, block_id, error = %err, "failed");
    }
    err
}

// ─── Job handlers ─────────────────────────────────────────────────────────────

#[async_trait]
impl JobHandler<IndexJob> for Indexer {
    async fn handle(&self, job: &IndexJob) -> Result<(), IndexerError> {
        match job {
            IndexJob::Block(block) => self.index_block(block).await,
            IndexJob::Height(height) => {
                let block = self
                    .connector
                    .get_block_by_height(*height)
                    .await?
                    .ok_or_else(|| IndexerError::Rpc(format!("node has no block at height {height}")))?;
                self.index_block(&block).await
            }
        }
    }
}

#[async_trait]
impl JobHandler<FinalityJob> for Indexer {
    async fn handle(&self, job: &FinalityJob) -> Result<(), IndexerError> {
        self.update_block_finality(&job.block_ids).await.map(|_| ())
    }
}

#[async_trait]
impl JobHandler<DeleteJob> for Indexer {
    async fn handle(&self, job: &DeleteJob) -> Result<(), IndexerError> {
        self.delete_indexed_blocks(&job.blocks).await.map(|_| ())
    }
}

#[async_trait]
impl JobHandler<BalanceJob> for Indexer {
    async fn handle(&self, job: &BalanceJob) -> Result<(), IndexerError> {
        self.refresh_balance(&job.address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use blockindex_core::types::{GenesisStaker, GenesisValidator, TokenBalance, ValidatorStake};
    use std::sync::atomic::AtomicU32;

    fn transfers() -> Harness {
        Harness::new(registry_with(vec![Arc::new(Transfers)]))
    }

    #[tokio::test]
    async fn index_block_writes_every_row() {
        let h = transfers();
        let b = block(5, "b5", vec![transfer("t1", "alice", 30), transfer("t2", "bob", 12)]);
        h.indexer.index_block(&b).await.unwrap();

        let row = h.store.block_at_height(5).await.unwrap().unwrap();
        assert_eq!(row.id, "b5");
        assert_eq!(row.number_of_events, 2);
        assert!(!row.is_final);

        let txs = h.store.transactions_by_block("b5").await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[1].index, 1);
        assert_eq!(txs[0].module_command, "token:transfer");
        assert_eq!(txs[0].sender_address, SENDER_ADDRESS);
        assert_eq!(txs[0].execution_status, ExecutionStatus::Success);
        assert_eq!(txs[0].timestamp, b.header.timestamp);

        assert_eq!(h.store.events_by_block("b5").await.unwrap().len(), 2);
        assert_eq!(h.store.events_by_topic("t2").await.unwrap().len(), 1);
        assert_eq!(credited(h.store.as_ref(), "alice").await, 30);

        let validator = h.store.validator(GENERATOR).await.unwrap().unwrap();
        assert_eq!(validator.generated_blocks, 1);

        let account = h.store.account(SENDER_ADDRESS).await.unwrap().unwrap();
        assert_eq!(account.public_key.as_deref(), Some(SENDER_KEY));
        assert_eq!(h.indexer.queues().account_balance.counts().waiting, 2);
    }

    #[tokio::test]
    async fn failed_execution_is_recorded() {
        let h = transfers();
        let mut b = block(1, "b1", vec![transfer("t1", "alice", 1)]);
        b.events[0].data = serde_json::json!({ "success": false });
        h.indexer.index_block(&b).await.unwrap();
        let tx = h.store.transaction("t1").await.unwrap().unwrap();
        assert_eq!(tx.execution_status, ExecutionStatus::Fail);
    }

    #[tokio::test]
    async fn missing_execution_result_is_fatal() {
        let h = transfers();
        let mut b = block(1, "b1", vec![transfer("t1", "alice", 1)]);
        b.events.clear();
        let err = h.indexer.index_block(&b).await.unwrap_err();
        assert!(matches!(err, IndexerError::ExecutionStatusUnresolved { .. }));
        assert!(!err.is_retryable());
        assert!(h.store.block_at_height(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_block_is_rejected() {
        let h = transfers();
        let b = block(1, "", vec![]);
        let err = h.indexer.index_block(&b).await.unwrap_err();
        assert!(matches!(err, IndexerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn shared_event_index_is_rejected() {
        let h = transfers();
        let mut b = block(2, "b2", vec![transfer("t1", "alice", 1), transfer("t2", "bob", 1)]);
        b.events[1].index = 0;
        let err = h.indexer.index_block(&b).await.unwrap_err();
        assert!(matches!(err, IndexerError::InvalidInput(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.store.block_count(), 0);
        assert_eq!(h.store.event_count(), 0);
    }

    #[tokio::test]
    async fn reindex_is_idempotent() {
        let h = transfers();
        let b = block(3, "b3", vec![transfer("t1", "alice", 30)]);
        h.indexer.index_block(&b).await.unwrap();
        h.indexer.index_block(&b).await.unwrap();

        assert_eq!(h.store.block_count(), 1);
        assert_eq!(h.store.transaction_count(), 1);
        assert_eq!(h.store.event_count(), 1);
        assert_eq!(credited(h.store.as_ref(), "alice").await, 30);
        let validator = h.store.validator(GENERATOR).await.unwrap().unwrap();
        assert_eq!(validator.generated_blocks, 1);
    }

    #[tokio::test]
    async fn failing_effect_leaves_no_rows() {
        let h = Harness::new(registry_with(vec![Arc::new(Failing("token:transfer"))]));
        let b = block(1, "b1", vec![transfer("t1", "alice", 1)]);
        let err = h.indexer.index_block(&b).await.unwrap_err();
        assert!(matches!(err, IndexerError::Module { .. }));
        assert_eq!(h.store.block_count(), 0);
        assert_eq!(h.store.transaction_count(), 0);
        assert_eq!(h.store.event_count(), 0);
        assert!(h.store.validator(GENERATOR).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reward_is_shared_by_stake() {
        let h = transfers();
        h.connector.set_validator_stake(
            GENERATOR,
            ValidatorStake {
                commission: 1_000,
                self_stake: 1,
                total_stake: 4,
            },
        );
        let b = with_reward(block(1, "b1", vec![]), 1_000);
        h.indexer.index_block(&b).await.unwrap();

        let row = h.store.block_at_height(1).await.unwrap().unwrap();
        assert_eq!(row.reward, 1_000);
        let validator = h.store.validator(GENERATOR).await.unwrap().unwrap();
        assert_eq!(validator.total_commission, 100);
        assert_eq!(validator.total_self_stake_rewards, 225);
    }

    #[tokio::test]
    async fn blocks_below_finalized_height_are_final() {
        let h = transfers();
        h.indexer.metadata().advance_finalized_height(10).await.unwrap();
        h.indexer.index_block(&block(10, "b10", vec![])).await.unwrap();
        h.indexer.index_block(&block(11, "b11", vec![])).await.unwrap();
        assert!(h.store.block_at_height(10).await.unwrap().unwrap().is_final);
        assert!(!h.store.block_at_height(11).await.unwrap().unwrap().is_final);
    }

    #[tokio::test]
    async fn replacing_block_reverts_previous_effects() {
        let h = transfers();
        let mut deletions = h.indexer.events().subscribe();
        h.indexer
            .index_block(&block(7, "a7", vec![transfer("ta", "alice", 50)]))
            .await
            .unwrap();
        h.indexer
            .index_block(&block(7, "b7", vec![transfer("tb", "bob", 20)]))
            .await
            .unwrap();

        assert_eq!(h.store.block_at_height(7).await.unwrap().unwrap().id, "b7");
        assert!(h.store.transaction("ta").await.unwrap().is_none());
        assert_eq!(credited(h.store.as_ref(), "alice").await, 0);
        assert_eq!(credited(h.store.as_ref(), "bob").await, 20);
        assert_eq!(h.store.block_count(), 1);

        match deletions.recv().await.unwrap() {
            IndexerEvent::DeleteTransactions(txs) => {
                assert_eq!(txs.len(), 1);
                assert_eq!(txs[0].id, "ta");
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn final_block_cannot_be_replaced() {
        let h = transfers();
        let mut a = block(7, "a7", vec![]);
        a.header.is_final = true;
        h.indexer.index_block(&a).await.unwrap();
        let err = h.indexer.index_block(&block(7, "b7", vec![])).await.unwrap_err();
        assert!(matches!(err, IndexerError::FinalityViolation { height: 7, .. }));
        assert_eq!(h.store.block_at_height(7).await.unwrap().unwrap().id, "a7");
    }

    #[tokio::test]
    async fn delete_reverts_in_reverse_and_emits() {
        let h = transfers();
        h.indexer
            .index_block(&block(1, "b1", vec![transfer("t1", "alice", 5)]))
            .await
            .unwrap();
        h.indexer
            .index_block(&block(2, "b2", vec![transfer("t2", "alice", 7), transfer("t3", "bob", 1)]))
            .await
            .unwrap();
        let mut events = h.indexer.events().subscribe();

        let rows = h.store.blocks_in_range(1, 2, 10).await.unwrap();
        let reverted = h.indexer.delete_indexed_blocks(&rows).await.unwrap();
        let ids: Vec<&str> = reverted.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t3", "t2", "t1"]);

        assert_eq!(h.store.block_count(), 0);
        assert_eq!(h.store.transaction_count(), 0);
        assert_eq!(h.store.event_count(), 0);
        assert_eq!(h.store.topic_count(), 0);
        assert_eq!(credited(h.store.as_ref(), "alice").await, 0);
        assert_eq!(h.store.validator(GENERATOR).await.unwrap().unwrap().generated_blocks, 0);
        assert!(matches!(
            events.recv().await.unwrap(),
            IndexerEvent::DeleteTransactions(txs) if txs.len() == 3
        ));
    }

    #[tokio::test]
    async fn new_block_decisions_enqueue_work() {
        let h = transfers();
        let decision = h.indexer.index_new_block(block(1, "b1", vec![])).await.unwrap();
        assert_eq!(decision, IngestDecision::Index);
        assert_eq!(h.indexer.queues().index_blocks.counts().waiting, 1);

        h.indexer.index_block(&block(1, "b1", vec![])).await.unwrap();
        let decision = h.indexer.index_new_block(block(1, "b1", vec![])).await.unwrap();
        assert_eq!(decision, IngestDecision::Skip);
        assert_eq!(h.indexer.queues().index_blocks.counts().waiting, 1);
    }

    #[tokio::test]
    async fn fork_enqueues_descendant_deletion() {
        let h = transfers();
        for height in 1..=4 {
            h.indexer
                .index_block(&block(height, &format!("a{height}"), vec![]))
                .await
                .unwrap();
        }
        let decision = h.indexer.index_new_block(block(2, "b2", vec![])).await.unwrap();
        assert_eq!(decision, IngestDecision::Fork { replaced: "a2".into() });
        assert_eq!(h.indexer.queues().delete_blocks.counts().waiting, 1);
        assert_eq!(h.indexer.queues().index_blocks.counts().waiting, 1);
    }

    #[tokio::test]
    async fn conflicting_final_block_is_rejected() {
        let h = transfers();
        let mut a = block(1, "a1", vec![]);
        a.header.is_final = true;
        h.indexer.index_block(&a).await.unwrap();
        let err = h.indexer.index_new_block(block(1, "b1", vec![])).await.unwrap_err();
        assert!(matches!(err, IndexerError::FinalityViolation { .. }));
        assert_eq!(h.indexer.queues().index_blocks.counts().waiting, 0);
    }

    #[tokio::test]
    async fn finality_refresh_enqueues_non_final_blocks() {
        let h = transfers();
        for height in 1..=3 {
            h.indexer
                .index_block(&block(height, &format!("b{height}"), vec![]))
                .await
                .unwrap();
        }
        h.connector.set_finalized_height(2);
        assert_eq!(h.indexer.refresh_finality().await.unwrap(), 2);
        assert_eq!(h.indexer.metadata().finalized_height().await.unwrap(), Some(2));

        let changed = h
            .indexer
            .update_block_finality(&["b1".to_string(), "b2".to_string()])
            .await
            .unwrap();
        assert_eq!(changed, 2);
        assert_eq!(h.indexer.refresh_finality().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn build_index_walks_high_to_low() {
        let mut config = IndexerConfig::default();
        config.backfill_page_size = 2;
        let h = Harness::with_config(config, ModuleRegistry::new());
        assert_eq!(h.indexer.build_index(3, 7).await.unwrap(), 5);
        assert_eq!(h.indexer.queues().index_blocks.counts().waiting, 5);
        assert_eq!(h.indexer.build_index(7, 3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_blocks_advance_verified_height() {
        let h = transfers();
        for height in 0..=5 {
            h.connector.push_block(block(height, &format!("b{height}"), vec![]));
        }
        for height in [0, 1, 2, 4, 5] {
            h.indexer
                .index_block(&block(height, &format!("b{height}"), vec![]))
                .await
                .unwrap();
        }

        assert_eq!(h.indexer.index_missing_blocks().await.unwrap(), 1);
        assert_eq!(h.indexer.index_verified_height().await.unwrap(), Some(2));
        assert_eq!(
            h.indexer.missing_blocks_list(0, 5).await.unwrap(),
            vec![HeightRange::new(3, 3)]
        );

        h.indexer.index_block(&block(3, "b3", vec![])).await.unwrap();
        assert_eq!(h.indexer.index_missing_blocks().await.unwrap(), 0);
        assert_eq!(h.indexer.index_verified_height().await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn contention_is_retried_by_the_queue() {
        let mut h = Harness::new(registry_with(vec![Arc::new(Contended {
            remaining: AtomicU32::new(2),
        })]));
        h.start();
        h.indexer
            .index_new_block(block(1, "b1", vec![transfer("t1", "alice", 1)]))
            .await
            .unwrap();
        h.indexer.queues().wait_idle().await;

        let counts = h.indexer.queues().index_blocks.counts();
        assert_eq!(counts.retried, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 0);
        assert!(h.store.block_at_height(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn genesis_registers_validators_and_stakers() {
        let mut h = transfers();
        h.start();
        h.connector.set_genesis(
            vec![GenesisValidator {
                address: "val1".into(),
                name: "genesis_0".into(),
            }],
            vec![GenesisStaker {
                address: "staker1".into(),
            }],
        );
        h.connector.set_balances(
            "staker1",
            vec![TokenBalance {
                token_id: "0000000000000000".into(),
                available_balance: 500,
                locked_balance: 100,
            }],
        );
        h.indexer.index_genesis(0).await.unwrap();
        h.indexer.queues().wait_idle().await;

        let validator = h.store.validator("val1").await.unwrap().unwrap();
        assert_eq!(validator.name, "genesis_0");
        let account = h.store.account("staker1").await.unwrap().unwrap();
        assert_eq!(account.balances[0].available_balance, 500);
        assert_eq!(h.indexer.genesis_height().await.unwrap(), 0);
    }

    #[cfg(feature = "sqlite")]
    mod sqlite_backend {
        use super::*;
        use blockindex_core::connector::MemoryConnector;
        use blockindex_storage::sqlite::SqliteStorage;

        async fn indexer(registry: ModuleRegistry) -> (Arc<Indexer>, Arc<SqliteStorage>) {
            let store = Arc::new(SqliteStorage::in_memory().await.unwrap());
            let (indexer, _runners) = Indexer::new(
                IndexerConfig::default(),
                store.clone(),
                Arc::new(MemoryConnector::new()),
                Arc::new(registry),
            );
            (indexer, store)
        }

        #[tokio::test]
        async fn failing_effect_rolls_back_sql_rows() {
            let (indexer, store) =
                indexer(registry_with(vec![Arc::new(Failing("token:transfer"))])).await;
            let b = block(1, "b1", vec![transfer("t1", "alice", 1)]);
            let err = indexer.index_block(&b).await.unwrap_err();
            assert!(matches!(err, IndexerError::Module { .. }));

            assert!(store.block_at_height(1).await.unwrap().is_none());
            assert!(store.transaction("t1").await.unwrap().is_none());
            assert!(store.events_by_block("b1").await.unwrap().is_empty());
            assert!(store.events_by_topic("t1").await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn replacement_and_delete_run_in_sql_transactions() {
            let (indexer, store) = indexer(registry_with(vec![Arc::new(Transfers)])).await;
            let first = block(7, "a7", vec![transfer("ta", "alice", 50)]);
            indexer.index_block(&first).await.unwrap();
            indexer.index_block(&first).await.unwrap();
            assert_eq!(credited(store.as_ref(), "alice").await, 50);

            indexer
                .index_block(&block(7, "b7", vec![transfer("tb", "bob", 20)]))
                .await
                .unwrap();
            assert_eq!(store.block_at_height(7).await.unwrap().unwrap().id, "b7");
            assert!(store.transaction("ta").await.unwrap().is_none());
            assert!(store.events_by_block("a7").await.unwrap().is_empty());
            assert_eq!(credited(store.as_ref(), "alice").await, 0);
            assert_eq!(credited(store.as_ref(), "bob").await, 20);
            assert_eq!(store.validator(GENERATOR).await.unwrap().unwrap().generated_blocks, 1);

            let rows = store.blocks_in_range(7, 7, 10).await.unwrap();
            let reverted = indexer.delete_indexed_blocks(&rows).await.unwrap();
            assert_eq!(reverted.len(), 1);
            assert_eq!(store.count_blocks(0, 10).await.unwrap(), 0);
            assert!(store.transaction("tb").await.unwrap().is_none());
            assert_eq!(credited(store.as_ref(), "bob").await, 0);
        }
    }
}
