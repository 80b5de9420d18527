//! Ingestion decisions for newly announced blocks.
//!
//! Compares an incoming header against the row already indexed at the same
//! height:
//! 1. **New height**: nothing indexed yet → index
//! 2. **Finality update**: same block, incoming final, stored not → re-index
//! 3. **Duplicate**: same block, nothing new → skip
//! 4. **Fork**: different block at the height → replace it and drop descendants
//! 5. **Finality violation**: different block at a final height → reject

use crate::schema::BlockRow;
use crate::types::BlockHeader;

/// What to do with an announced block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestDecision {
    /// Nothing is indexed at this height.
    Index,
    /// The same block is indexed but not yet marked final.
    UpdateFinality,
    /// The same block is already indexed with the same finality.
    Skip,
    /// A different, non-final block occupies the height.
    Fork {
        /// Id of the superseded block.
        replaced: String,
    },
    /// A different block occupies a height that is already final.
    FinalityViolation {
        /// Id of the final block.
        existing: String,
    },
}

impl IngestDecision {
    /// Returns `true` if an index job should be enqueued.
    pub fn needs_index(&self) -> bool {
        matches!(self, Self::Index | Self::UpdateFinality | Self::Fork { .. })
    }
}

impl std::fmt::Display for IngestDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "index"),
            Self::UpdateFinality => write!(f, "update finality"),
            Self::Skip => write!(f, "skip"),
            Self::Fork { .. } => write!(f, "fork"),
            Self::FinalityViolation { .. } => write!(f, "finality violation"),
        }
    }
}

/// Classify `incoming` against the block indexed at its height.
pub fn decide(existing: Option<&BlockRow>, incoming: &BlockHeader) -> IngestDecision {
    let Some(existing) = existing else {
        return IngestDecision::Index;
    };

    if existing.id == incoming.id {
        if !existing.is_final && incoming.is_final {
            IngestDecision::UpdateFinality
        } else {
            IngestDecision::Skip
        }
    } else if existing.is_final {
        tracing::error!(
            height = incoming.height,
            existing = %existing.id,
            incoming = %incoming.id,
            "Conflicting block announced at a final height"
        );
        IngestDecision::FinalityViolation {
            existing: existing.id.clone(),
        }
    } else {
        tracing::warn!(
            height = incoming.height,
            replaced = %existing.id,
            incoming = %incoming.id,
            "Fork detected"
        );
        IngestDecision::Fork {
            replaced: existing.id.clone(),
        }
    }
}
