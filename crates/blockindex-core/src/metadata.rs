//! Scalar index metadata: heights kept in the key/value table.
//!
//! These values are process-wide state with no transactional coupling to
//! the block rows. The engine reads them through [`IndexMetadata`] instead
//! of ambient globals.

use std::sync::Arc;

use crate::error::{IndexerError, StorageError};
use crate::store::IndexStore;

/// Key of the highest height below which the index has been verified complete.
pub const INDEX_VERIFIED_HEIGHT: &str = "indexVerifiedHeight";
/// Key of the chain's genesis height.
pub const GENESIS_HEIGHT: &str = "genesisHeight";
/// Key of the last finalized height reported by the node.
pub const FINALIZED_HEIGHT: &str = "finalizedHeight";

/// Typed accessor over the scalar key/value table.
#[derive(Clone)]
pub struct IndexMetadata {
    store: Arc<dyn IndexStore>,
}

impl IndexMetadata {
    pub fn new(store: Arc<dyn IndexStore>) -> Self {
        Self { store }
    }

    pub async fn index_verified_height(&self) -> Result<Option<u64>, IndexerError> {
        self.height(INDEX_VERIFIED_HEIGHT).await
    }

    pub async fn set_index_verified_height(&self, height: u64) -> Result<(), IndexerError> {
        self.set_height(INDEX_VERIFIED_HEIGHT, height).await
    }

    pub async fn genesis_height(&self) -> Result<Option<u64>, IndexerError> {
        self.height(GENESIS_HEIGHT).await
    }

    pub async fn set_genesis_height(&self, height: u64) -> Result<(), IndexerError> {
        self.set_height(GENESIS_HEIGHT, height).await
    }

    pub async fn finalized_height(&self) -> Result<Option<u64>, IndexerError> {
        self.height(FINALIZED_HEIGHT).await
    }

    /// Record a newly reported finalized height. Lower values are ignored.
    ///
    /// Returns the stored value after the update.
    pub async fn advance_finalized_height(&self, height: u64) -> Result<u64, IndexerError> {
        match self.finalized_height().await? {
            Some(current) if current >= height => Ok(current),
            _ => {
                self.set_height(FINALIZED_HEIGHT, height).await?;
                Ok(height)
            }
        }
    }

    async fn height(&self, key: &str) -> Result<Option<u64>, IndexerError> {
        let Some(raw) = self.store.kv_get(key).await? else {
            return Ok(None);
        };
        raw.parse::<u64>().map(Some).map_err(|e| {
            StorageError::Backend(format!("corrupt value for '{key}': {raw:?} ({e})")).into()
        })
    }

    async fn set_height(&self, key: &str, height: u64) -> Result<(), IndexerError> {
        self.store.kv_set(key, &height.to_string()).await?;
        tracing::debug!(key, height, "metadata updated");
        Ok(())
    }
}

impl std::fmt::Debug for IndexMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexMetadata").finish_non_exhaustive()
    }
}
