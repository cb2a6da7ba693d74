// RustyDB DORA - data-oriented transaction execution layer
// Core library module

pub mod common;
pub mod config;
pub mod dora;
pub mod error;
pub mod storage;

pub use common::{ClientHandle, DataField, Lsn, PartitionId, TableId, TransactionId, TrxOutcome};
pub use config::DoraConfig;
pub use dora::action::{Action, ActionLogic, ActionPtr, ClosureLogic, ExecContext, LockRequest, RoutingHint};
pub use dora::env::DoraEnv;
pub use dora::key::Key;
pub use dora::lock::LockMode;
pub use dora::part_table::{split_integer_range, PartTable};
pub use dora::rvp::{Decision, RendezvousPoint};
pub use dora::stats::Stats;
pub use dora::Runtime;
pub use error::{DoraError, DoraResult};
pub use storage::{MemStorage, StorageEngine, XctHandle};
