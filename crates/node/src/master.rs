use crate::Error;
use fabric::{master_endpoint, Endpoint, Registry};
use region::{RegionLayout, RequestRegion};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub server_id: usize,
    pub port_index: usize,
    pub layout: RegionLayout,
    /// Key of the shared segment backing the region, or `None` for an
    /// anonymous region when every role shares one process.
    pub shm_key: Option<i32>,
}

/// The master runs once per (server, port): it allocates the request
/// region, creates one connected endpoint per client with the region as
/// its registered memory, publishes each endpoint, and then stays out of
/// the data plane entirely.
pub struct Master {
    region: Arc<RequestRegion>,
    server_id: usize,
    port_index: usize,
}

impl Master {
    pub fn start(cfg: MasterConfig, registry: &Registry) -> Result<Self, Error> {
        let region = Arc::new(match cfg.shm_key {
            Some(key) => RequestRegion::shared(key, cfg.layout)?,
            None => RequestRegion::anonymous(cfg.layout)?,
        });

        for client_gid in 0..cfg.layout.num_clients {
            registry.publish(
                &master_endpoint(cfg.server_id, cfg.port_index, client_gid),
                Endpoint::Region(Arc::clone(&region)),
            )?;
        }

        tracing::info!(
            server = cfg.server_id,
            port = cfg.port_index,
            clients = cfg.layout.num_clients,
            region_bytes = cfg.layout.len(),
            "request region registered"
        );
        Ok(Self {
            region,
            server_id: cfg.server_id,
            port_index: cfg.port_index,
        })
    }

    /// The region workers attach their columns to.
    pub fn region(&self) -> &Arc<RequestRegion> {
        &self.region
    }

    pub fn server_id(&self) -> usize {
        self.server_id
    }

    pub fn port_index(&self) -> usize {
        self.port_index
    }
}
