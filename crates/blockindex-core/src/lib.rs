//! blockindex-core: foundation for the reorg-safe relational block index.
//!
//! # Architecture
//!
//! ```text
//! ChainConnector ──► Indexing engine (blockindex-pipeline)
//!                      ├── fork::decide      (index / skip / fork repair)
//!                      ├── ModuleRegistry    (per module:command apply/revert)
//!                      ├── IndexStore/StoreTx (transactional relational store)
//!                      ├── IndexMetadata     (verified / genesis / finalized heights)
//!                      ├── gaps              (missing-range computation)
//!                      └── EventBus          (deleteTransactions, indexStatUpdate, ...)
//! ```

pub mod address;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod fork;
pub mod gaps;
pub mod metadata;
pub mod module;
pub mod rewards;
pub mod schema;
pub mod store;
pub mod types;

pub use config::{IndexerConfig, IndexerState, QueueSettings, QueuesConfig};
pub use connector::{ChainConnector, MemoryConnector};
pub use error::{IndexerError, StorageError};
pub use events::{ChainNotification, EventBus, IndexStatus, IndexerEvent, JobCounts};
pub use fork::IngestDecision;
pub use metadata::IndexMetadata;
pub use module::{EffectContext, ModuleEffect, ModuleRegistry};
pub use schema::{
    AccountRow, BlockRow, EventRow, EventTopicRow, ExecutionStatus, HeightRange, TransactionRow,
    ValidatorAggregate, ValidatorContribution,
};
pub use store::{IndexStore, StoreTx};
pub use types::{Block, BlockAsset, BlockHeader, Event, NodeInfo, Transaction};
