// The DORA execution core.
//
// Data-oriented transaction execution: tables are split into logical
// partitions, each bound to one worker thread; transactions are decomposed
// into per-partition actions that meet again at rendez-vous points. The
// modules here are the partition runtime, its logical lock manager, the
// action/RVP state machine, the worker scheduler and the group-commit
// pipeline.

pub mod action;
pub mod cache;
pub mod env;
pub mod flusher;
pub mod key;
pub mod lock;
pub mod lockman;
pub mod part_table;
pub mod partition;
pub mod queue;
pub mod rvp;
pub mod stats;
pub mod worker;

use std::sync::Arc;

use crate::config::DoraConfig;
use crate::storage::StorageEngine;

use self::stats::EnvStats;

/// Shared context threaded through the execution layer.
///
/// Carries the configuration, the storage collaborator and the global
/// counters. Passed explicitly to every component constructor; there are no
/// process-wide singletons.
pub struct Runtime {
    config: DoraConfig,
    storage: Arc<dyn StorageEngine>,
    stats: EnvStats,
}

impl Runtime {
    /// Creates a runtime context.
    pub fn new(config: DoraConfig, storage: Arc<dyn StorageEngine>) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            stats: EnvStats::new(),
        })
    }

    /// The configuration.
    pub fn config(&self) -> &DoraConfig {
        &self.config
    }

    /// The storage engine.
    pub fn storage(&self) -> &dyn StorageEngine {
        self.storage.as_ref()
    }

    /// Environment-wide commit/abort counters.
    pub fn stats(&self) -> &EnvStats {
        &self.stats
    }
}
