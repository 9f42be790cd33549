mod dashboard;
mod export;
mod helpers;
mod history;
mod import;
mod log;

use vitals_core::blob::BlobStore;
use vitals_core::store::RecordStore;

pub(crate) use dashboard::cmd_dashboard;
pub(crate) use export::{cmd_export, cmd_restore};
pub(crate) use history::{cmd_history, cmd_trend};
pub(crate) use import::cmd_import;
pub(crate) use log::{MeasurementArgs, cmd_delete, cmd_log, cmd_show};

/// The record store as the CLI and server use it, over whichever backend was picked.
pub(crate) type Store = RecordStore<Box<dyn BlobStore>>;

/// Attempts for a write that races another writer.
pub(crate) const LOG_ATTEMPTS: u32 = 3;

#[cfg(test)]
pub(crate) fn test_store() -> Store {
    RecordStore::new(
        Box::new(vitals_core::blob::MemoryBlobStore::new()),
        "health.csv",
    )
}
