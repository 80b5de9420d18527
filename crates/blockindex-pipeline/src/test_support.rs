//! Shared fixtures for the pipeline unit tests.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use blockindex_core::config::IndexerConfig;
use blockindex_core::connector::MemoryConnector;
use blockindex_core::error::{IndexerError, StorageError};
use blockindex_core::module::{EffectContext, ModuleEffect, ModuleRegistry};
use blockindex_core::store::IndexStore;
use blockindex_core::types::{
    Block, BlockHeader, Event, Transaction, COMMAND_EXECUTION_RESULT, REWARD_MINTED,
    REWARD_MODULE,
};
use blockindex_storage::MemoryStore;

use crate::engine::Indexer;
use crate::jobs::QueueRunners;

/// Public key of every fixture sender.
pub const SENDER_KEY: &str = "00";
/// Address derived from [`SENDER_KEY`].
pub const SENDER_ADDRESS: &str = "6e340b9cffb37a989ca544e6bb780a2c78901d3f";
pub const GENERATOR: &str = "generator";

pub fn transfer(id: &str, recipient: &str, amount: u64) -> Transaction {
    Transaction {
        id: id.into(),
        module: "token".into(),
        command: "transfer".into(),
        nonce: 0,
        fee: 10,
        sender_public_key: SENDER_KEY.into(),
        params: json!({ "recipient": recipient, "amount": amount.to_string() }),
    }
}

/// A block whose transactions all executed successfully.
pub fn block(height: u64, id: &str, transactions: Vec<Transaction>) -> Block {
    let events = transactions
        .iter()
        .enumerate()
        .map(|(i, tx)| Event {
            module: tx.module.clone(),
            name: COMMAND_EXECUTION_RESULT.into(),
            index: i as u32,
            topics: vec![tx.id.clone()],
            data: json!({ "success": true }),
            height: Some(height),
        })
        .collect();
    Block {
        header: BlockHeader {
            id: id.into(),
            height,
            timestamp: 1_700_000_000 + height as i64,
            generator_address: GENERATOR.into(),
            previous_block_id: String::new(),
            size: 128,
            is_final: false,
        },
        assets: vec![],
        transactions,
        events,
    }
}

pub fn with_reward(mut block: Block, amount: u128) -> Block {
    let index = block.events.len() as u32;
    block.events.push(Event {
        module: REWARD_MODULE.into(),
        name: REWARD_MINTED.into(),
        index,
        topics: vec![block.header.generator_address.clone()],
        data: json!({ "amount": amount.to_string() }),
        height: Some(block.header.height),
    });
    block
}

fn balance_key(recipient: &str) -> String {
    format!("token:balance:{recipient}")
}

/// Module-state balance credited by [`Transfers`].
pub async fn credited(store: &dyn IndexStore, recipient: &str) -> u128 {
    store
        .module_state(&balance_key(recipient))
        .await
        .unwrap()
        .map(|v| v.parse().unwrap())
        .unwrap_or(0)
}

/// Credits `params.amount` to `params.recipient` in module state.
pub struct Transfers;

impl Transfers {
    async fn adjust(ctx: &mut EffectContext<'_>, credit: bool) -> Result<(), IndexerError> {
        let params = &ctx.transaction.params;
        let recipient = params["recipient"]
            .as_str()
            .ok_or_else(|| IndexerError::invalid("transfer without recipient"))?;
        let amount: u128 = params["amount"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| IndexerError::invalid("transfer without amount"))?;

        let key = balance_key(recipient);
        let current: u128 = ctx
            .store
            .module_state(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let next = if credit {
            current + amount
        } else {
            current.saturating_sub(amount)
        };
        ctx.store.set_module_state(&key, &next.to_string()).await?;
        Ok(())
    }
}

#[async_trait]
impl ModuleEffect for Transfers {
    fn module_command(&self) -> &str {
        "token:transfer"
    }
    async fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        Self::adjust(ctx, true).await
    }
    async fn revert(&self, ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        Self::adjust(ctx, false).await
    }
}

/// Fails every apply of its `module:command`.
pub struct Failing(pub &'static str);

#[async_trait]
impl ModuleEffect for Failing {
    fn module_command(&self) -> &str {
        self.0
    }
    async fn apply(&self, _ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        Err(IndexerError::Other("effect rejected the transaction".into()))
    }
    async fn revert(&self, _ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        Ok(())
    }
}

/// Reports storage contention for the first `remaining` applies.
pub struct Contended {
    pub remaining: AtomicU32,
}

#[async_trait]
impl ModuleEffect for Contended {
    fn module_command(&self) -> &str {
        "token:transfer"
    }
    async fn apply(&self, _ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(StorageError::Contention("database is locked".into()).into());
        }
        Ok(())
    }
    async fn revert(&self, _ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        Ok(())
    }
}

pub fn registry_with(effects: Vec<Arc<dyn ModuleEffect>>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    for effect in effects {
        registry.register(effect);
    }
    registry
}

pub struct Harness {
    pub indexer: Arc<Indexer>,
    pub runners: Option<QueueRunners>,
    pub store: Arc<MemoryStore>,
    pub connector: Arc<MemoryConnector>,
}

impl Harness {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self::with_config(IndexerConfig::default(), registry)
    }

    pub fn with_config(mut config: IndexerConfig, registry: ModuleRegistry) -> Self {
        for settings in [
            &mut config.queues.index_blocks,
            &mut config.queues.update_finality,
            &mut config.queues.delete_blocks,
            &mut config.queues.account_balance,
        ] {
            settings.backoff_ms = 1;
            settings.max_backoff_ms = 5;
        }
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(MemoryConnector::new());
        let (indexer, runners) = Indexer::new(
            config,
            store.clone(),
            connector.clone(),
            Arc::new(registry),
        );
        Self {
            indexer,
            runners: Some(runners),
            store,
            connector,
        }
    }

    /// Start the queue workers.
    pub fn start(&mut self) {
        if let Some(runners) = self.runners.take() {
            runners.spawn(Arc::clone(&self.indexer));
        }
    }
}
