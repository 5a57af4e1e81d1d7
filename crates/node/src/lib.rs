//! Server-side roles: the master, which owns a port's request region and
//! registers its endpoints, and the workers, which poll their columns and
//! serve requests.

mod master;
mod worker;

pub use fabric::Shutdown;
pub use master::{Master, MasterConfig};
pub use worker::{Worker, WorkerConfig, WorkerStats, EMPTY_PROBE_FLUSH, STATS_EVERY};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] engine::Error),
    #[error(transparent)]
    Fabric(#[from] fabric::Error),
    #[error(transparent)]
    Region(#[from] region::Error),
    #[error("response encoding failed: {0}")]
    Codec(#[from] wire::Error),
}
