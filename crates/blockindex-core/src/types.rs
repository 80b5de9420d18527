//! Shared types consumed from the chain connector.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;

/// Module and event name of the per-transaction execution result event.
pub const COMMAND_EXECUTION_RESULT: &str = "commandExecutionResult";
/// Module emitting the block reward event.
pub const REWARD_MODULE: &str = "reward";
/// Name of the block reward event.
pub const REWARD_MINTED: &str = "rewardMinted";

// ─── Block ────────────────────────────────────────────────────────────────────

/// Block header as produced by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub id: String,
    pub height: u64,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub generator_address: String,
    #[serde(default)]
    pub previous_block_id: String,
    /// Encoded size of the block in bytes.
    #[serde(default)]
    pub size: u64,
    /// Set by the node when the block is already below the finalized height.
    #[serde(default)]
    pub is_final: bool,
}

/// A module-specific asset attached to a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockAsset {
    pub module: String,
    #[serde(default)]
    pub data: Value,
}

/// A fully materialized block: header, transactions, and execution events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: BlockHeader,
    #[serde(default)]
    pub assets: Vec<BlockAsset>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Block {
    /// Decode a block from the node's JSON representation.
    ///
    /// Anything that does not fit the schema, including a negative height,
    /// is reported as [`IndexerError::InvalidInput`].
    pub fn from_json(value: Value) -> Result<Self, IndexerError> {
        let block: Self = serde_json::from_value(value)
            .map_err(|e| IndexerError::invalid(format!("undecodable block: {e}")))?;
        block.validate()?;
        Ok(block)
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Check the structural preconditions for indexing.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.header.id.is_empty() {
            return Err(IndexerError::invalid(format!(
                "block at height {} has an empty id",
                self.header.height
            )));
        }
        if self.header.generator_address.is_empty() {
            return Err(IndexerError::invalid(format!(
                "block {} has no generator address",
                self.header.id
            )));
        }

        let mut seen = HashSet::with_capacity(self.transactions.len());
        for tx in &self.transactions {
            if tx.id.is_empty() {
                return Err(IndexerError::invalid(format!(
                    "block {} contains a transaction with an empty id",
                    self.header.id
                )));
            }
            if !seen.insert(tx.id.as_str()) {
                return Err(IndexerError::invalid(format!(
                    "block {} contains transaction {} twice",
                    self.header.id, tx.id
                )));
            }
        }

        if let Some(ev) = self
            .events
            .iter()
            .find(|e| e.height.is_some_and(|h| h != self.header.height))
        {
            return Err(IndexerError::invalid(format!(
                "event {} of block {} declares height {:?}",
                ev.index, self.header.id, ev.height
            )));
        }

        let mut indexes = HashSet::with_capacity(self.events.len());
        for ev in &self.events {
            if !indexes.insert(ev.index) {
                return Err(IndexerError::invalid(format!(
                    "block {} contains event index {} twice",
                    self.header.id, ev.index
                )));
            }
        }
        Ok(())
    }

    /// Module names of the block assets, in block order.
    pub fn assets_modules(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.module.clone()).collect()
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// A transaction as included in a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub module: String,
    pub command: String,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default, with = "amount")]
    pub fee: u128,
    /// Hex encoded public key of the sender.
    pub sender_public_key: String,
    #[serde(default)]
    pub params: Value,
}

impl Transaction {
    /// The `module:command` pair used for effect dispatch.
    pub fn module_command(&self) -> String {
        format!("{}:{}", self.module, self.command)
    }
}

// ─── Event ────────────────────────────────────────────────────────────────────

/// A state-change notification emitted while executing a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub module: String,
    pub name: String,
    /// Position of the event within the block.
    pub index: u32,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub data: Value,
    /// Height reported by the node, if any.
    #[serde(default)]
    pub height: Option<u64>,
}

impl Event {
    /// Returns `true` if this is the execution result of `tx`.
    pub fn is_execution_result_of(&self, tx: &Transaction) -> bool {
        self.name == COMMAND_EXECUTION_RESULT
            && self.module == tx.module
            && self.topics.iter().any(|t| t == &tx.id)
    }

    /// Returns `true` if this is a block reward mint event.
    pub fn is_reward_minted(&self) -> bool {
        self.module == REWARD_MODULE && self.name == REWARD_MINTED
    }
}

// ─── Node / PoS ───────────────────────────────────────────────────────────────

/// Chain progress as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub height: u64,
    pub finalized_height: u64,
    pub genesis_height: u64,
}

/// A module registered on the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    pub name: String,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// The node's registered modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetadata {
    pub modules: Vec<ModuleMetadata>,
}

impl SystemMetadata {
    /// All `module:command` pairs known to the node.
    pub fn module_commands(&self) -> Vec<String> {
        self.modules
            .iter()
            .flat_map(|m| m.commands.iter().map(move |c| format!("{}:{c}", m.name)))
            .collect()
    }
}

/// A validator registered in the genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisValidator {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

/// A staker registered in the genesis block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisStaker {
    pub address: String,
}

/// Reward-sharing parameters of a validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorStake {
    /// Commission in basis points out of 10000.
    pub commission: u32,
    #[serde(with = "amount")]
    pub self_stake: u128,
    #[serde(with = "amount")]
    pub total_stake: u128,
}

/// Balance of one token held by an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub token_id: String,
    #[serde(with = "amount")]
    pub available_balance: u128,
    #[serde(default, with = "amount")]
    pub locked_balance: u128,
}

/// Parse a token amount that the node may encode as a string or a number.
pub fn parse_amount(value: &Value) -> Option<u128> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(u128::from),
        _ => None,
    }
}

/// Serde adapter for big-integer amounts carried as decimal strings.
pub mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::parse_amount(&value)
            .ok_or_else(|| de::Error::custom(format!("invalid amount: {value}")))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
