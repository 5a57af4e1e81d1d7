use crate::{client_conn, master_endpoint, Endpoint, Error, Registry};
use region::RequestRegion;
use std::sync::Arc;
use std::time::Duration;

/// A client's connected write channel to one server's request region.
/// Writes are one-sided: the server never sees a receive, only the bytes
/// landing in its region.
pub struct RegionWriter {
    region: Arc<RequestRegion>,
    // Signalled write completions not yet reaped.
    pending: usize,
}

impl RegionWriter {
    /// Connect to a server's per-client endpoint: resolve the master's
    /// publication, then publish our own side so the handshake is visible
    /// to the deployment.
    pub fn connect(
        registry: &Registry,
        server_id: usize,
        port: usize,
        client_gid: usize,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let region = registry.lookup_region(&master_endpoint(server_id, port, client_gid), timeout)?;
        registry.publish(&client_conn(server_id, client_gid), Endpoint::Peer)?;
        Ok(Self::for_region(region))
    }

    /// Wrap an already-connected region. Used by in-process harnesses.
    pub fn for_region(region: Arc<RequestRegion>) -> Self {
        Self { region, pending: 0 }
    }

    /// Post one remote write of `bytes` at `offset` into the region. The
    /// receiver observes bytes in ascending address order.
    pub fn post_write(&mut self, offset: usize, bytes: &[u8], signalled: bool) -> Result<(), Error> {
        self.region.write_bytes(offset, bytes)?;
        if signalled {
            self.pending += 1;
        }
        Ok(())
    }

    /// Reap one signalled write completion, if any is outstanding.
    pub fn poll_completion(&mut self) -> bool {
        if self.pending > 0 {
            self.pending -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use region::{RegionLayout, CACHE_LINE};

    fn region() -> Arc<RequestRegion> {
        let layout = RegionLayout::new(1, 2, 2, CACHE_LINE).unwrap();
        Arc::new(RequestRegion::anonymous(layout).unwrap())
    }

    #[test]
    fn connect_resolves_master_and_publishes_client_side() {
        let registry = Registry::in_process();
        let region = region();
        registry
            .publish(&master_endpoint(0, 0, 1), Endpoint::Region(Arc::clone(&region)))
            .unwrap();

        let mut writer =
            RegionWriter::connect(&registry, 0, 0, 1, Duration::from_millis(50)).unwrap();
        assert!(registry.lookup(&client_conn(0, 1)).is_some());

        let mut slot = [0u8; CACHE_LINE];
        slot[0] = 0x42;
        slot[CACHE_LINE - 1] = 3;
        let offset = region.layout().slot_offset(0, 1, 0);
        writer.post_write(offset, &slot, false).unwrap();

        let view = region.slot(0, 1, 0);
        assert_eq!(view.opcode(), 3);
        assert_eq!(view.body()[0], 0x42);
    }

    #[test]
    fn completions_track_signalled_writes_only() {
        let mut writer = RegionWriter::for_region(region());
        writer.post_write(0, &[0; CACHE_LINE], false).unwrap();
        writer.post_write(64, &[0; CACHE_LINE], true).unwrap();

        assert!(writer.poll_completion());
        assert!(!writer.poll_completion());
    }

    #[test]
    fn out_of_range_writes_surface_the_region_error() {
        let mut writer = RegionWriter::for_region(region());
        assert!(matches!(
            writer.post_write(usize::MAX, &[1], false),
            Err(Error::Region(_))
        ));
    }
}
