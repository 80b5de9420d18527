//! Module effect trait + registry.
//!
//! Each `module:command` pair may register one effect. `apply` runs while
//! the containing block is indexed and `revert` while it is removed during
//! fork repair; both run inside the block's storage transaction, so their
//! writes commit or roll back together with the block rows.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::IndexerError;
use crate::schema::TransactionRow;
use crate::store::StoreTx;
use crate::types::BlockHeader;

/// Everything an effect may look at or write.
pub struct EffectContext<'a> {
    /// Header of the block containing the transaction.
    pub header: &'a BlockHeader,
    /// The indexed transaction row.
    pub transaction: &'a TransactionRow,
    /// The open storage transaction.
    pub store: &'a mut dyn StoreTx,
}

/// Apply/revert pair for one `module:command`.
#[async_trait]
pub trait ModuleEffect: Send + Sync {
    /// The `module:command` this effect handles (e.g. `"token:transfer"`).
    fn module_command(&self) -> &str;

    async fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<(), IndexerError>;

    /// Inverse of [`apply`](Self::apply).
    async fn revert(&self, ctx: &mut EffectContext<'_>) -> Result<(), IndexerError>;
}

/// Lookup table of effects, built once at startup.
#[derive(Default)]
pub struct ModuleRegistry {
    effects: HashMap<String, Arc<dyn ModuleEffect>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an effect. A later registration for the same pair replaces the earlier one.
    pub fn register(&mut self, effect: Arc<dyn ModuleEffect>) {
        let key = effect.module_command().to_string();
        if self.effects.insert(key.clone(), effect).is_some() {
            tracing::warn!(module_command = %key, "module effect replaced");
        }
    }

    pub fn get(&self, module_command: &str) -> Option<&Arc<dyn ModuleEffect>> {
        self.effects.get(module_command)
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Registered pairs, sorted.
    pub fn module_commands(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.effects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run the apply function of the transaction's `module:command`, if any.
    pub async fn apply(&self, ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        let transaction = ctx.transaction;
        match self.effects.get(&transaction.module_command) {
            Some(effect) => effect
                .apply(ctx)
                .await
                .map_err(|e| wrap(&transaction.module_command, e)),
            None => Ok(()),
        }
    }

    /// Run the revert function of the transaction's `module:command`, if any.
    pub async fn revert(&self, ctx: &mut EffectContext<'_>) -> Result<(), IndexerError> {
        let transaction = ctx.transaction;
        match self.effects.get(&transaction.module_command) {
            Some(effect) => effect
                .revert(ctx)
                .await
                .map_err(|e| wrap(&transaction.module_command, e)),
            None => Ok(()),
        }
    }
}

/// Storage errors keep their class so contention stays retryable.
fn wrap(module_command: &str, err: IndexerError) -> IndexerError {
    match err {
        IndexerError::Storage(_) | IndexerError::Rpc(_) | IndexerError::Module { .. } => err,
        other => IndexerError::Module {
            module_command: module_command.to_string(),
            reason: other.to_string(),
        },
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("module_commands", &self.module_commands())
            .finish()
    }
}
