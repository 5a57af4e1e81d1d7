//! The fabric: endpoint rendezvous, one-sided region writes, and
//! unreliable datagram replies.
//!
//! The wider deployment story puts these verbs on an RDMA provider; this
//! crate carries the loopback provider, which gives the same contract
//! in-process: writes land in ascending address order with the final byte
//! published last, datagram sends without a posted receive are silently
//! dropped, and send completions are only reaped for signalled work.

mod dgram;
mod names;
mod registry;
mod writer;

pub use dgram::{Datagram, DgramAddr, SendDesc};
pub use names::{client_conn, client_dgram, master_endpoint};
pub use registry::{Endpoint, Registry};
pub use writer::RegionWriter;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A raisable stop flag, shared by every data-path loop. The loops check
/// it once per iteration and otherwise stay busy-wait.
#[derive(Clone, Debug, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Every `UNSIG_BATCH`-th send on an endpoint is signalled; polling its
/// completion before the next signalled post bounds the send queue depth.
/// A power of two, so the "every Nth" check is a bitmask.
pub const UNSIG_BATCH: u64 = 64;
/// Largest payload a send may carry inline in its descriptor.
pub const MAX_INLINE: usize = 128;

const _: () = assert!(UNSIG_BATCH.is_power_of_two());

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("endpoint name `{0}` is already published")]
    NameTaken(String),
    #[error("no endpoint named `{0}`")]
    NotFound(String),
    #[error("timed out waiting for endpoint `{0}`")]
    LookupTimeout(String),
    #[error("endpoint `{name}` is not a {want} endpoint")]
    WrongKind { name: String, want: &'static str },
    #[error(
        "remote rendezvous directory `{0}` is owned by the deployment layer; \
         unset REGISTRY_IP or set it to `local`"
    )]
    RemoteRegistry(String),
    #[error(transparent)]
    Region(#[from] region::Error),
}
