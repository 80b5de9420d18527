//! The chain connector boundary.
//!
//! The connector wraps the node's request/response RPC. Every call must be
//! safe to repeat; transport failures surface as [`IndexerError::Rpc`] and
//! are retried by the work queues.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::IndexerError;
use crate::types::{
    Block, GenesisStaker, GenesisValidator, NodeInfo, SystemMetadata, TokenBalance,
    ValidatorStake,
};

/// Request/response interface of a blockchain node.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, IndexerError>;

    async fn get_last_block(&self) -> Result<Block, IndexerError>;

    /// Blocks for the ids that are known; unknown ids are skipped.
    async fn get_blocks_by_ids(&self, ids: &[String]) -> Result<Vec<Block>, IndexerError>;

    async fn get_node_info(&self) -> Result<NodeInfo, IndexerError>;

    async fn get_system_metadata(&self) -> Result<SystemMetadata, IndexerError>;

    async fn get_pos_genesis_validators(
        &self,
        height: u64,
    ) -> Result<Vec<GenesisValidator>, IndexerError>;

    async fn get_pos_genesis_stakers(&self, height: u64) -> Result<Vec<GenesisStaker>, IndexerError>;

    /// Reward-sharing parameters of a validator, `None` if not registered.
    async fn get_pos_validator(&self, address: &str) -> Result<Option<ValidatorStake>, IndexerError>;

    async fn get_token_balances(&self, address: &str) -> Result<Vec<TokenBalance>, IndexerError>;
}

// ─── In-memory connector (for testing) ────────────────────────────────────────

#[derive(Default)]
struct ChainState {
    blocks: BTreeMap<u64, Block>,
    finalized_height: u64,
    genesis_height: u64,
    metadata: SystemMetadata,
    genesis_validators: Vec<GenesisValidator>,
    genesis_stakers: Vec<GenesisStaker>,
    stakes: HashMap<String, ValidatorStake>,
    balances: HashMap<String, Vec<TokenBalance>>,
}

/// In-memory connector for tests and replaying recorded chains.
#[derive(Default)]
pub struct MemoryConnector {
    state: Mutex<ChainState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the canonical block at its height.
    pub fn push_block(&self, block: Block) {
        self.state.lock().unwrap().blocks.insert(block.height(), block);
    }

    /// Drop every block above `height` (simulates a node rewinding).
    pub fn truncate_above(&self, height: u64) {
        self.state.lock().unwrap().blocks.retain(|h, _| *h <= height);
    }

    pub fn set_finalized_height(&self, height: u64) {
        self.state.lock().unwrap().finalized_height = height;
    }

    pub fn set_genesis_height(&self, height: u64) {
        self.state.lock().unwrap().genesis_height = height;
    }

    pub fn set_system_metadata(&self, metadata: SystemMetadata) {
        self.state.lock().unwrap().metadata = metadata;
    }

    pub fn set_genesis(&self, validators: Vec<GenesisValidator>, stakers: Vec<GenesisStaker>) {
        let mut state = self.state.lock().unwrap();
        state.genesis_validators = validators;
        state.genesis_stakers = stakers;
    }

    pub fn set_validator_stake(&self, address: impl Into<String>, stake: ValidatorStake) {
        self.state.lock().unwrap().stakes.insert(address.into(), stake);
    }

    pub fn set_balances(&self, address: impl Into<String>, balances: Vec<TokenBalance>) {
        self.state.lock().unwrap().balances.insert(address.into(), balances);
    }
}

#[async_trait]
impl ChainConnector for MemoryConnector {
    async fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, IndexerError> {
        Ok(self.state.lock().unwrap().blocks.get(&height).cloned())
    }

    async fn get_last_block(&self) -> Result<Block, IndexerError> {
        self.state
            .lock()
            .unwrap()
            .blocks
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| IndexerError::Rpc("node has no blocks".into()))
    }

    async fn get_blocks_by_ids(&self, ids: &[String]) -> Result<Vec<Block>, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| state.blocks.values().find(|b| b.id() == id).cloned())
            .collect())
    }

    async fn get_node_info(&self) -> Result<NodeInfo, IndexerError> {
        let state = self.state.lock().unwrap();
        Ok(NodeInfo {
            height: state
                .blocks
                .keys()
                .next_back()
                .copied()
                .unwrap_or(state.genesis_height),
            finalized_height: state.finalized_height,
            genesis_height: state.genesis_height,
        })
    }

    async fn get_system_metadata(&self) -> Result<SystemMetadata, IndexerError> {
        Ok(self.state.lock().unwrap().metadata.clone())
    }

    async fn get_pos_genesis_validators(
        &self,
        _height: u64,
    ) -> Result<Vec<GenesisValidator>, IndexerError> {
        Ok(self.state.lock().unwrap().genesis_validators.clone())
    }

    async fn get_pos_genesis_stakers(&self, _height: u64) -> Result<Vec<GenesisStaker>, IndexerError> {
        Ok(self.state.lock().unwrap().genesis_stakers.clone())
    }

    async fn get_pos_validator(&self, address: &str) -> Result<Option<ValidatorStake>, IndexerError> {
        Ok(self.state.lock().unwrap().stakes.get(address).copied())
    }

    async fn get_token_balances(&self, address: &str) -> Result<Vec<TokenBalance>, IndexerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(address)
            .cloned()
            .unwrap_or_default())
    }
}
