//! SQLite storage backend.
//!
//! Persists the whole relational index to a single SQLite file, using `sqlx`
//! with WAL mode for concurrent read performance. Block-scoped writes run
//! inside SQLite transactions; `SQLITE_BUSY` / `SQLITE_LOCKED` surface as
//! [`StorageError::Contention`] so the work queues retry them.
//!
//! # Usage
//! ```rust,no_run
//! use blockindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./index.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use blockindex_core::error::StorageError;
use blockindex_core::schema::{
    AccountRow, BlockRow, EventRow, HeightRange, TransactionRow, ValidatorAggregate,
    ValidatorContribution,
};
use blockindex_core::store::{IndexStore, StoreTx};
use blockindex_core::types::TokenBalance;

use crate::sql::{
    self, decode_all, RawAccount, RawBlock, RawContribution, RawEvent, RawTransaction,
    BLOCK_COLUMNS, EVENT_COLUMNS, TRANSACTION_COLUMNS,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        height            INTEGER PRIMARY KEY,
        id                TEXT    NOT NULL,
        timestamp         INTEGER NOT NULL,
        generator_address TEXT    NOT NULL,
        previous_block_id TEXT    NOT NULL,
        size              INTEGER NOT NULL,
        is_final          INTEGER NOT NULL DEFAULT 0,
        assets_modules    TEXT    NOT NULL,
        number_of_events  INTEGER NOT NULL,
        reward            TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_blocks_id ON blocks (id)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_final ON blocks (is_final, height)",
    "CREATE INDEX IF NOT EXISTS idx_blocks_generator ON blocks (generator_address)",
    "CREATE TABLE IF NOT EXISTS transactions (
        id                TEXT    PRIMARY KEY,
        block_id          TEXT    NOT NULL,
        height            INTEGER NOT NULL,
        tx_index          INTEGER NOT NULL,
        module_command    TEXT    NOT NULL,
        nonce             INTEGER NOT NULL,
        fee               TEXT    NOT NULL,
        sender_public_key TEXT    NOT NULL,
        sender_address    TEXT    NOT NULL,
        timestamp         INTEGER NOT NULL,
        execution_status  TEXT    NOT NULL,
        params            TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions (block_id, tx_index)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_height ON transactions (height)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_sender ON transactions (sender_address)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_command ON transactions (module_command)",
    "CREATE TABLE IF NOT EXISTS events (
        id          TEXT    PRIMARY KEY,
        block_id    TEXT    NOT NULL,
        height      INTEGER NOT NULL,
        event_index INTEGER NOT NULL,
        module      TEXT    NOT NULL,
        name        TEXT    NOT NULL,
        timestamp   INTEGER NOT NULL,
        topics      TEXT    NOT NULL,
        data        TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_block ON events (block_id, event_index)",
    "CREATE INDEX IF NOT EXISTS idx_events_height ON events (height)",
    "CREATE TABLE IF NOT EXISTS event_topics (
        event_id    TEXT    NOT NULL,
        topic       TEXT    NOT NULL,
        block_id    TEXT    NOT NULL,
        height      INTEGER NOT NULL,
        event_index INTEGER NOT NULL,
        module      TEXT    NOT NULL,
        name        TEXT    NOT NULL,
        timestamp   INTEGER NOT NULL,
        PRIMARY KEY (event_id, topic)
    )",
    "CREATE INDEX IF NOT EXISTS idx_event_topics_topic ON event_topics (topic, height)",
    "CREATE INDEX IF NOT EXISTS idx_event_topics_block ON event_topics (block_id)",
    "CREATE INDEX IF NOT EXISTS idx_event_topics_height ON event_topics (height, event_index)",
    "CREATE INDEX IF NOT EXISTS idx_event_topics_time ON event_topics (timestamp, event_index)",
    "CREATE INDEX IF NOT EXISTS idx_event_topics_module ON event_topics (module)",
    "CREATE INDEX IF NOT EXISTS idx_event_topics_name ON event_topics (name)",
    "CREATE TABLE IF NOT EXISTS validators (
        address TEXT PRIMARY KEY,
        name    TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS validator_contributions (
        block_id          TEXT    PRIMARY KEY,
        height            INTEGER NOT NULL,
        address           TEXT    NOT NULL,
        commission        TEXT    NOT NULL,
        self_stake_reward TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_contributions_address ON validator_contributions (address)",
    "CREATE TABLE IF NOT EXISTS module_state (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS accounts (
        address    TEXT    PRIMARY KEY,
        public_key TEXT,
        balances   TEXT    NOT NULL DEFAULT '[]',
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS key_value_store (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// `SQLITE_BUSY` (5) and `SQLITE_LOCKED` (6), including extended codes.
fn is_busy(code: &str) -> bool {
    code.parse::<i32>()
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

fn db(err: sqlx::Error) -> StorageError {
    sql::classify(err, is_busy)
}

/// SQLite-backed relational index.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full
    /// SQLite URL (`"sqlite:./index.db"`).
    pub async fn open(path: &str) -> Result<Self, StorageError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(db)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        debug!(path, "sqlite index opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Uses a single pooled connection that is never recycled, since every
    /// connection to `:memory:` is a separate database. All data is lost when
    /// the pool is dropped.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;

        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and indexes if they don't already exist.
    async fn init_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    /// Access the underlying pool for custom queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl IndexStore for SqliteStorage {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError> {
        let tx = self.pool.begin().await.map_err(db)?;
        Ok(Box::new(SqliteTx { tx }))
    }

    async fn block_at_height(&self, height: u64) -> Result<Option<BlockRow>, StorageError> {
        let raw = sqlx::query_as::<_, RawBlock>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE height = ?"
        ))
        .bind(height as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        raw.map(BlockRow::try_from).transpose()
    }

    async fn block_by_id(&self, id: &str) -> Result<Option<BlockRow>, StorageError> {
        let raw = sqlx::query_as::<_, RawBlock>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        raw.map(BlockRow::try_from).transpose()
    }

    async fn blocks_in_range(
        &self,
        from: u64,
        to: u64,
        limit: u32,
    ) -> Result<Vec<BlockRow>, StorageError> {
        let rows = sqlx::query_as::<_, RawBlock>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE height >= ? AND height <= ? ORDER BY height LIMIT ?"
        ))
        .bind(sql::bound(from))
        .bind(sql::bound(to))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        decode_all(rows)
    }

    async fn max_height(&self) -> Result<Option<u64>, StorageError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(max.map(|h| h as u64))
    }

    async fn non_final_blocks(
        &self,
        max_height: u64,
        limit: u32,
    ) -> Result<Vec<BlockRow>, StorageError> {
        let rows = sqlx::query_as::<_, RawBlock>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE is_final = 0 AND height <= ? ORDER BY height LIMIT ?"
        ))
        .bind(max_height as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        decode_all(rows)
    }

    async fn count_blocks(&self, from: u64, to: u64) -> Result<u64, StorageError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE height >= ? AND height <= ?")
                .bind(sql::bound(from))
                .bind(sql::bound(to))
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;
        Ok(count as u64)
    }

    async fn max_height_in_range(&self, from: u64, to: u64) -> Result<Option<u64>, StorageError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(height) FROM blocks WHERE height >= ? AND height <= ?")
                .bind(sql::bound(from))
                .bind(sql::bound(to))
                .fetch_one(&self.pool)
                .await
                .map_err(db)?;
        Ok(max.map(|h| h as u64))
    }

    async fn gap_ranges(&self, from: u64, to: u64) -> Result<Vec<HeightRange>, StorageError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT COALESCE((SELECT MAX(p.height) FROM blocks p WHERE p.height < b.height), -1) + 1,
                    b.height - 1
             FROM blocks b
             WHERE b.height > ?1 AND b.height <= ?2
               AND NOT EXISTS (SELECT 1 FROM blocks q WHERE q.height = b.height - 1)
             ORDER BY b.height",
        )
        .bind(sql::bound(from))
        .bind(sql::bound(to))
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(gap_from, gap_to)| HeightRange::new((gap_from as u64).max(from), gap_to as u64))
            .collect())
    }

    async fn transaction(&self, id: &str) -> Result<Option<TransactionRow>, StorageError> {
        let raw = sqlx::query_as::<_, RawTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        raw.map(TransactionRow::try_from).transpose()
    }

    async fn transactions_by_block(
        &self,
        block_id: &str,
    ) -> Result<Vec<TransactionRow>, StorageError> {
        let rows = sqlx::query_as::<_, RawTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE block_id = ? ORDER BY tx_index"
        ))
        .bind(block_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        decode_all(rows)
    }

    async fn events_by_block(&self, block_id: &str) -> Result<Vec<EventRow>, StorageError> {
        let rows = sqlx::query_as::<_, RawEvent>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE block_id = ? ORDER BY event_index"
        ))
        .bind(block_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        decode_all(rows)
    }

    async fn events_by_topic(&self, topic: &str) -> Result<Vec<EventRow>, StorageError> {
        let rows = sqlx::query_as::<_, RawEvent>(
            "SELECT e.id, e.block_id, e.height, e.event_index, e.module, e.name,
                    e.timestamp, e.topics, e.data
             FROM event_topics t JOIN events e ON e.id = t.event_id
             WHERE t.topic = ? ORDER BY e.height, e.event_index",
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        decode_all(rows)
    }

    async fn validator(&self, address: &str) -> Result<Option<ValidatorAggregate>, StorageError> {
        let name: Option<String> =
            sqlx::query_scalar("SELECT name FROM validators WHERE address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        let Some(name) = name else {
            return Ok(None);
        };
        let rows = sqlx::query_as::<_, RawContribution>(
            "SELECT block_id, height, address, commission, self_stake_reward
             FROM validator_contributions WHERE address = ?",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        let contributions: Vec<ValidatorContribution> = decode_all(rows)?;
        Ok(Some(ValidatorAggregate::from_contributions(
            address,
            &name,
            &contributions,
        )))
    }

    async fn module_state(&self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar("SELECT value FROM module_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)
    }

    async fn account(&self, address: &str) -> Result<Option<AccountRow>, StorageError> {
        let raw = sqlx::query_as::<_, RawAccount>(
            "SELECT address, public_key, balances, updated_at FROM accounts WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        raw.map(AccountRow::try_from).transpose()
    }

    async fn merge_public_key(&self, address: &str, public_key: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO accounts (address, public_key, balances, updated_at)
             VALUES (?1, ?2, '[]', ?3)
             ON CONFLICT(address) DO UPDATE SET
                updated_at = CASE WHEN accounts.public_key IS NULL
                                  THEN excluded.updated_at ELSE accounts.updated_at END,
                public_key = COALESCE(accounts.public_key, excluded.public_key)",
        )
        .bind(address)
        .bind(public_key)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn set_balances(
        &self,
        address: &str,
        balances: &[TokenBalance],
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO accounts (address, public_key, balances, updated_at)
             VALUES (?1, NULL, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET
                balances = excluded.balances,
                updated_at = excluded.updated_at",
        )
        .bind(address)
        .bind(serde_json::to_string(balances)?)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar("SELECT value FROM key_value_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR REPLACE INTO key_value_store (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn kv_delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM key_value_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn block_at_height(&mut self, height: u64) -> Result<Option<BlockRow>, StorageError> {
        let raw = sqlx::query_as::<_, RawBlock>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE height = ?"
        ))
        .bind(height as i64)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db)?;
        raw.map(BlockRow::try_from).transpose()
    }

    async fn upsert_block(&mut self, block: &BlockRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO blocks (id, height, timestamp, generator_address, previous_block_id,
                                 size, is_final, assets_modules, number_of_events, reward)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(height) DO UPDATE SET
                id                = excluded.id,
                timestamp         = excluded.timestamp,
                generator_address = excluded.generator_address,
                previous_block_id = excluded.previous_block_id,
                size              = excluded.size,
                is_final          = blocks.is_final OR excluded.is_final,
                assets_modules    = excluded.assets_modules,
                number_of_events  = excluded.number_of_events,
                reward            = excluded.reward",
        )
        .bind(&block.id)
        .bind(block.height as i64)
        .bind(block.timestamp)
        .bind(&block.generator_address)
        .bind(&block.previous_block_id)
        .bind(block.size as i64)
        .bind(block.is_final)
        .bind(serde_json::to_string(&block.assets_modules)?)
        .bind(block.number_of_events as i64)
        .bind(block.reward.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn mark_final(&mut self, block_ids: &[String]) -> Result<u64, StorageError> {
        let mut changed = 0;
        for id in block_ids {
            changed += sqlx::query("UPDATE blocks SET is_final = 1 WHERE id = ? AND is_final = 0")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?
                .rows_affected();
        }
        Ok(changed)
    }

    async fn delete_blocks(&mut self, block_ids: &[String]) -> Result<(), StorageError> {
        for id in block_ids {
            sqlx::query("DELETE FROM blocks WHERE id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;
        }
        Ok(())
    }

    async fn upsert_transaction(&mut self, tx: &TransactionRow) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO transactions
                (id, block_id, height, tx_index, module_command, nonce, fee,
                 sender_public_key, sender_address, timestamp, execution_status, params)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tx.id)
        .bind(&tx.block_id)
        .bind(tx.height as i64)
        .bind(tx.index as i64)
        .bind(&tx.module_command)
        .bind(tx.nonce as i64)
        .bind(tx.fee.to_string())
        .bind(&tx.sender_public_key)
        .bind(&tx.sender_address)
        .bind(tx.timestamp)
        .bind(tx.execution_status.as_str())
        .bind(serde_json::to_string(&tx.params)?)
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn transactions_by_block(
        &mut self,
        block_id: &str,
    ) -> Result<Vec<TransactionRow>, StorageError> {
        let rows = sqlx::query_as::<_, RawTransaction>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE block_id = ? ORDER BY tx_index"
        ))
        .bind(block_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db)?;
        decode_all(rows)
    }

    async fn delete_transactions(&mut self, ids: &[String]) -> Result<(), StorageError> {
        for id in ids {
            sqlx::query("DELETE FROM transactions WHERE id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;
        }
        Ok(())
    }

    async fn upsert_events(&mut self, events: &[EventRow]) -> Result<(), StorageError> {
        for event in events {
            sqlx::query(
                "INSERT OR REPLACE INTO events
                    (id, block_id, height, event_index, module, name, timestamp, topics, data)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.id)
            .bind(&event.block_id)
            .bind(event.height as i64)
            .bind(event.index as i64)
            .bind(&event.module)
            .bind(&event.name)
            .bind(event.timestamp)
            .bind(serde_json::to_string(&event.topics)?)
            .bind(serde_json::to_string(&event.data)?)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;

            sqlx::query("DELETE FROM event_topics WHERE event_id = ?")
                .bind(&event.id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;

            for topic in event.topic_rows() {
                sqlx::query(
                    "INSERT INTO event_topics
                        (event_id, topic, block_id, height, event_index, module, name, timestamp)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&topic.event_id)
                .bind(&topic.topic)
                .bind(&topic.block_id)
                .bind(topic.height as i64)
                .bind(topic.index as i64)
                .bind(&topic.module)
                .bind(&topic.name)
                .bind(topic.timestamp)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;
            }
        }
        Ok(())
    }

    async fn delete_events_by_blocks(&mut self, block_ids: &[String]) -> Result<(), StorageError> {
        for id in block_ids {
            sqlx::query("DELETE FROM event_topics WHERE block_id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;
            sqlx::query("DELETE FROM events WHERE block_id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;
        }
        Ok(())
    }

    async fn ensure_validator(&mut self, address: &str, name: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR IGNORE INTO validators (address, name) VALUES (?, ?)")
            .bind(address)
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn upsert_contribution(
        &mut self,
        contribution: &ValidatorContribution,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO validator_contributions
                (block_id, height, address, commission, self_stake_reward)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&contribution.block_id)
        .bind(contribution.height as i64)
        .bind(&contribution.address)
        .bind(contribution.commission.to_string())
        .bind(contribution.self_stake_reward.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn delete_contributions(&mut self, block_ids: &[String]) -> Result<(), StorageError> {
        for id in block_ids {
            sqlx::query("DELETE FROM validator_contributions WHERE block_id = ?")
                .bind(id)
                .execute(&mut *self.tx)
                .await
                .map_err(db)?;
        }
        Ok(())
    }

    async fn module_state(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar("SELECT value FROM module_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db)
    }

    async fn set_module_state(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR REPLACE INTO module_state (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn delete_module_state(&mut self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM module_state WHERE key = ?")
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        this.tx.commit().await.map_err(db)
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        let this = *self;
        this.tx.rollback().await.map_err(db)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
