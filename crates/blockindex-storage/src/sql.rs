//! Row decoding and error mapping shared by the SQL backends.
//!
//! Big integers (fees, rewards, balances) are stored as decimal TEXT and
//! JSON columns as TEXT, so the same raw row types decode on SQLite and
//! Postgres.

use sqlx::FromRow;

use blockindex_core::error::StorageError;
use blockindex_core::schema::{
    AccountRow, BlockRow, EventRow, ExecutionStatus, TransactionRow, ValidatorContribution,
};

/// Map a `sqlx` error, treating codes accepted by `is_contention` as transient.
pub(crate) fn classify(err: sqlx::Error, is_contention: fn(&str) -> bool) -> StorageError {
    match &err {
        sqlx::Error::PoolTimedOut => StorageError::Contention(err.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref().is_some_and(is_contention) => {
            StorageError::Contention(err.to_string())
        }
        _ => StorageError::Backend(err.to_string()),
    }
}

fn amount(raw: &str, column: &str) -> Result<u128, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::Backend(format!("invalid amount in {column}: {raw:?}")))
}

fn unsigned(raw: i64, column: &str) -> Result<u64, StorageError> {
    u64::try_from(raw).map_err(|_| StorageError::Backend(format!("negative {column}: {raw}")))
}

/// Height bound for a range query. Stored heights fit in BIGINT, so larger
/// bounds clamp to `i64::MAX`.
pub(crate) fn bound(height: u64) -> i64 {
    i64::try_from(height).unwrap_or(i64::MAX)
}

pub(crate) const BLOCK_COLUMNS: &str = "id, height, timestamp, generator_address, \
     previous_block_id, size, is_final, assets_modules, number_of_events, reward";

#[derive(FromRow)]
pub(crate) struct RawBlock {
    id: String,
    height: i64,
    timestamp: i64,
    generator_address: String,
    previous_block_id: String,
    size: i64,
    is_final: bool,
    assets_modules: String,
    number_of_events: i64,
    reward: String,
}

impl TryFrom<RawBlock> for BlockRow {
    type Error = StorageError;

    fn try_from(raw: RawBlock) -> Result<Self, Self::Error> {
        Ok(BlockRow {
            height: unsigned(raw.height, "blocks.height")?,
            size: unsigned(raw.size, "blocks.size")?,
            number_of_events: u32::try_from(raw.number_of_events)
                .map_err(|_| StorageError::Backend("blocks.number_of_events out of range".into()))?,
            reward: amount(&raw.reward, "blocks.reward")?,
            assets_modules: serde_json::from_str(&raw.assets_modules)?,
            id: raw.id,
            timestamp: raw.timestamp,
            generator_address: raw.generator_address,
            previous_block_id: raw.previous_block_id,
            is_final: raw.is_final,
        })
    }
}

pub(crate) const TRANSACTION_COLUMNS: &str = "id, block_id, height, tx_index, module_command, \
     nonce, fee, sender_public_key, sender_address, timestamp, execution_status, params";

#[derive(FromRow)]
pub(crate) struct RawTransaction {
    id: String,
    block_id: String,
    height: i64,
    tx_index: i64,
    module_command: String,
    nonce: i64,
    fee: String,
    sender_public_key: String,
    sender_address: String,
    timestamp: i64,
    execution_status: String,
    params: String,
}

impl TryFrom<RawTransaction> for TransactionRow {
    type Error = StorageError;

    fn try_from(raw: RawTransaction) -> Result<Self, Self::Error> {
        let execution_status = ExecutionStatus::parse(&raw.execution_status).ok_or_else(|| {
            StorageError::Backend(format!(
                "invalid execution status {:?} for transaction {}",
                raw.execution_status, raw.id
            ))
        })?;
        Ok(TransactionRow {
            height: unsigned(raw.height, "transactions.height")?,
            index: u32::try_from(raw.tx_index)
                .map_err(|_| StorageError::Backend("transactions.tx_index out of range".into()))?,
            nonce: unsigned(raw.nonce, "transactions.nonce")?,
            fee: amount(&raw.fee, "transactions.fee")?,
            params: serde_json::from_str(&raw.params)?,
            execution_status,
            id: raw.id,
            block_id: raw.block_id,
            module_command: raw.module_command,
            sender_public_key: raw.sender_public_key,
            sender_address: raw.sender_address,
            timestamp: raw.timestamp,
        })
    }
}

pub(crate) const EVENT_COLUMNS: &str =
    "id, block_id, height, event_index, module, name, timestamp, topics, data";

#[derive(FromRow)]
pub(crate) struct RawEvent {
    id: String,
    block_id: String,
    height: i64,
    event_index: i64,
    module: String,
    name: String,
    timestamp: i64,
    topics: String,
    data: String,
}

impl TryFrom<RawEvent> for EventRow {
    type Error = StorageError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        Ok(EventRow {
            height: unsigned(raw.height, "events.height")?,
            index: u32::try_from(raw.event_index)
                .map_err(|_| StorageError::Backend("events.event_index out of range".into()))?,
            topics: serde_json::from_str(&raw.topics)?,
            data: serde_json::from_str(&raw.data)?,
            id: raw.id,
            block_id: raw.block_id,
            module: raw.module,
            name: raw.name,
            timestamp: raw.timestamp,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct RawContribution {
    block_id: String,
    height: i64,
    address: String,
    commission: String,
    self_stake_reward: String,
}

impl TryFrom<RawContribution> for ValidatorContribution {
    type Error = StorageError;

    fn try_from(raw: RawContribution) -> Result<Self, Self::Error> {
        Ok(ValidatorContribution {
            height: unsigned(raw.height, "validator_contributions.height")?,
            commission: amount(&raw.commission, "validator_contributions.commission")?,
            self_stake_reward: amount(
                &raw.self_stake_reward,
                "validator_contributions.self_stake_reward",
            )?,
            block_id: raw.block_id,
            address: raw.address,
        })
    }
}

#[derive(FromRow)]
pub(crate) struct RawAccount {
    address: String,
    public_key: Option<String>,
    balances: String,
    updated_at: i64,
}

impl TryFrom<RawAccount> for AccountRow {
    type Error = StorageError;

    fn try_from(raw: RawAccount) -> Result<Self, Self::Error> {
        Ok(AccountRow {
            balances: serde_json::from_str(&raw.balances)?,
            address: raw.address,
            public_key: raw.public_key,
            updated_at: raw.updated_at,
        })
    }
}

/// Decode a batch of raw rows.
pub(crate) fn decode_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StorageError>
where
    T: TryFrom<R, Error = StorageError>,
{
    rows.into_iter().map(T::try_from).collect()
}
