//! Durable repair state.
//!
//! [`RepairStore`] is the persistence seam of the repair engine. It holds
//! clusters, repair units, runs with their segments, and schedules. Records
//! are never patched field by field: every update goes through a `modify_*`
//! call that applies a whole-record transform under the store's write lock.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`] keeps everything in process memory (tests, demo mode)
//! - [`FjallStore`] persists records in Fjall keyspaces as postcard values

mod error;
mod fjall_store;
mod memory_store;
mod traits;


pub use error::MetaError;
pub use fjall_store::FjallStore;
pub use memory_store::MemoryStore;
pub use traits::{RepairStore, RunFilter, ScheduleFilter, Transform};
