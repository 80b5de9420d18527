//! Row types of the relational index.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::types::{amount, BlockHeader, TokenBalance};

// ─── Blocks ───────────────────────────────────────────────────────────────────

/// A row of the `blocks` table. One row per height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRow {
    pub id: String,
    pub height: u64,
    pub timestamp: i64,
    pub generator_address: String,
    pub previous_block_id: String,
    pub size: u64,
    pub is_final: bool,
    pub assets_modules: Vec<String>,
    pub number_of_events: u32,
    #[serde(with = "amount")]
    pub reward: u128,
}

impl BlockRow {
    /// The header fields of this row, as handed to module effects.
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            id: self.id.clone(),
            height: self.height,
            timestamp: self.timestamp,
            generator_address: self.generator_address.clone(),
            previous_block_id: self.previous_block_id.clone(),
            size: self.size,
            is_final: self.is_final,
        }
    }
}

// ─── Transactions ─────────────────────────────────────────────────────────────

/// Outcome of executing a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Fail,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `transactions` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRow {
    pub id: String,
    pub block_id: String,
    pub height: u64,
    /// Position within the block.
    pub index: u32,
    pub module_command: String,
    pub nonce: u64,
    #[serde(with = "amount")]
    pub fee: u128,
    pub sender_public_key: String,
    pub sender_address: String,
    pub timestamp: i64,
    pub execution_status: ExecutionStatus,
    pub params: Value,
}

impl TransactionRow {
    /// The module half of `module:command`.
    pub fn module(&self) -> &str {
        self.module_command
            .split_once(':')
            .map(|(m, _)| m)
            .unwrap_or(&self.module_command)
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// A row of the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRow {
    pub id: String,
    pub block_id: String,
    pub height: u64,
    pub index: u32,
    pub module: String,
    pub name: String,
    pub timestamp: i64,
    pub topics: Vec<String>,
    pub data: Value,
}

impl EventRow {
    /// Deterministic id of the `index`-th event of `block_id`.
    pub fn derive_id(block_id: &str, index: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(block_id.as_bytes());
        hasher.update(index.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// One topic row per distinct topic of this event.
    pub fn topic_rows(&self) -> Vec<EventTopicRow> {
        let mut rows: Vec<EventTopicRow> = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            if rows.iter().any(|r| &r.topic == topic) {
                continue;
            }
            rows.push(EventTopicRow {
                event_id: self.id.clone(),
                topic: topic.clone(),
                block_id: self.block_id.clone(),
                height: self.height,
                index: self.index,
                module: self.module.clone(),
                name: self.name.clone(),
                timestamp: self.timestamp,
            });
        }
        rows
    }
}

/// A row of the `event_topics` table, keyed by `(event_id, topic)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTopicRow {
    pub event_id: String,
    pub topic: String,
    pub block_id: String,
    pub height: u64,
    pub index: u32,
    pub module: String,
    pub name: String,
    pub timestamp: i64,
}

// ─── Validators ───────────────────────────────────────────────────────────────

/// What one block contributes to its generator's aggregate.
///
/// Keyed by block id: re-indexing a block overwrites its contribution and
/// deleting a block removes it, so the aggregate stays exact under retries
/// and forks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorContribution {
    pub block_id: String,
    pub height: u64,
    pub address: String,
    #[serde(with = "amount")]
    pub commission: u128,
    #[serde(with = "amount")]
    pub self_stake_reward: u128,
}

/// Aggregate view of a validator, summed over its contributions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorAggregate {
    pub address: String,
    pub name: String,
    pub generated_blocks: u64,
    #[serde(with = "amount")]
    pub total_commission: u128,
    #[serde(with = "amount")]
    pub total_self_stake_rewards: u128,
}

impl ValidatorAggregate {
    /// Fold contributions into an aggregate for `address`.
    pub fn from_contributions<'a>(
        address: &str,
        name: &str,
        contributions: impl IntoIterator<Item = &'a ValidatorContribution>,
    ) -> Self {
        contributions.into_iter().fold(
            Self {
                address: address.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            |mut agg, c| {
                agg.generated_blocks += 1;
                agg.total_commission = agg.total_commission.saturating_add(c.commission);
                agg.total_self_stake_rewards =
                    agg.total_self_stake_rewards.saturating_add(c.self_stake_reward);
                agg
            },
        )
    }
}

// ─── Accounts ─────────────────────────────────────────────────────────────────

/// A row of the `accounts` table. Maintained outside block transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRow {
    pub address: String,
    pub public_key: Option<String>,
    pub balances: Vec<TokenBalance>,
    pub updated_at: i64,
}

// ─── Ranges ───────────────────────────────────────────────────────────────────

/// An inclusive span of heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeightRange {
    pub from: u64,
    pub to: u64,
}

impl HeightRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of heights covered. `0..=u64::MAX` saturates at `u64::MAX`.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        (self.to - self.from).saturating_add(1)
    }

    /// Returns `true` if `count` distinct heights fill the whole range.
    pub fn is_covered_by(&self, count: u64) -> bool {
        !self.is_empty() && count > self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.to < self.from
    }

    /// Explicit heights, ascending.
    pub fn heights(&self) -> impl Iterator<Item = u64> {
        self.from..=self.to
    }
}
