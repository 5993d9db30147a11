//! Engine factory.
//!
//! Validates the full configuration, then constructs the engine the
//! config names. The LSM engine is constructed by its own crate (it
//! carries paths and background threads this factory knows nothing
//! about); asking for it here is an `InvalidArg`, not a panic.

use crate::engine::{ArrayEngine, BPlusTreeEngine, HashEngine, RBTreeEngine};
use concord_core::config::EngineConfig;
use concord_core::engine::KvEngine;
use concord_core::error::{Error, Result};
use concord_core::types::EngineKind;
use std::sync::Arc;
use tracing::debug;

/// Build the configured in-memory engine.
pub fn create_engine(config: &EngineConfig) -> Result<Arc<dyn KvEngine>> {
    config.validate()?;
    let engine: Arc<dyn KvEngine> = match config.kind {
        EngineKind::Array => Arc::new(ArrayEngine::new()),
        EngineKind::Hash => Arc::new(HashEngine::new(&config.hash)?),
        EngineKind::RBTree => Arc::new(RBTreeEngine::new()),
        EngineKind::BPlusTree => Arc::new(BPlusTreeEngine::new(&config.btree)?),
        EngineKind::Lsm => {
            return Err(Error::InvalidArg(
                "the LSM engine is built by concord-lsm, not the in-memory factory".into(),
            ))
        }
    };
    debug!(target: "concord::storage", kind = %config.kind, "engine created");
    Ok(engine)
}
