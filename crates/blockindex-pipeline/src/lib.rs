//! blockindex-pipeline: work queues, indexing engine, gap finder, and status reporter.

pub mod builder;
pub mod engine;
pub mod gaps;
pub mod jobs;
pub mod queue;
pub mod retry;
pub mod service;
pub mod status;

#[cfg(test)]
mod test_support;

pub use builder::IndexerBuilder;
pub use engine::Indexer;
pub use gaps::GapFinder;
pub use jobs::{BalanceJob, DeleteJob, FinalityJob, IndexJob, QueueRunners, Queues};
pub use queue::{JobHandler, WorkQueue};
pub use retry::RetryPolicy;
pub use service::IndexerService;
pub use status::StatusReporter;
