//! The client role: keep a fixed window of requests in flight per
//! (server, worker) pair, route each key to its primary, and collect
//! replies on per-pair datagram endpoints.

use fabric::{client_dgram, Datagram, Endpoint, RegionWriter, Registry, Shutdown, UNSIG_BATCH};
use placement::Placement;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use region::{RegionLayout, CACHE_LINE};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use wire::{decode_response, encode_slot, keyspace, Key, OpKind, MAX_SLOT_VALUE_LEN, SLOT_SIZE};

/// Report throughput every so many completed requests.
pub const K_512: u64 = 524288;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("update_percentage must be at most 100 (got {0})")]
    UpdatePercentage(u8),
    #[error("value_len {len} exceeds the {max}-byte slot budget")]
    ValueLen { len: usize, max: usize },
    #[error("num_keys must be nonzero")]
    NoKeys,
    #[error("shut down while awaiting a reply")]
    Interrupted,
    #[error(transparent)]
    Fabric(#[from] fabric::Error),
    #[error(transparent)]
    Region(#[from] region::Error),
    #[error(transparent)]
    Wire(#[from] wire::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// This client's global id: its column position in every region and
    /// the id its endpoints are published under.
    pub clt_gid: usize,
    pub placement: Placement,
    /// Region geometry of the servers being addressed.
    pub num_workers: usize,
    pub num_clients: usize,
    pub window_size: usize,
    /// Percentage of operations that are PUTs.
    pub update_percentage: u8,
    pub num_keys: usize,
    /// Length of PUT values.
    pub value_len: usize,
    pub port_index: usize,
    pub lookup_timeout: Duration,
    /// Seed of the op/key draw stream.
    pub seed: u64,
}

impl ClientConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.update_percentage > 100 {
            return Err(Error::UpdatePercentage(self.update_percentage));
        }
        if self.value_len > MAX_SLOT_VALUE_LEN {
            return Err(Error::ValueLen {
                len: self.value_len,
                max: MAX_SLOT_VALUE_LEN,
            });
        }
        if self.num_keys == 0 {
            return Err(Error::NoKeys);
        }
        Ok(())
    }
}

/// A decoded reply, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Value(Vec<u8>),
    Empty,
    Rejected,
}

/// One client's connections: a write channel per server, and one reply
/// datagram endpoint, window counter, and outstanding count per
/// (server, worker) pair. Replies from a worker arrive on that pair's
/// endpoint in post order, so the pair's own count is exact.
pub struct Conn {
    cfg: ClientConfig,
    layout: RegionLayout,
    writers: Vec<RegionWriter>,
    // Per-server write sequence, for the signalling discipline.
    seqs: Vec<u64>,
    // dgrams[server][worker]: where that pair's replies land.
    dgrams: Vec<Vec<Datagram>>,
    // inflight[server][worker]: requests posted but not yet reaped.
    inflight: Vec<Vec<u64>>,
    // Replies reaped while making window room, awaiting recv().
    ready: VecDeque<Reply>,
    // ws[server][worker]: the next window slot to use.
    ws: Vec<Vec<usize>>,
    next_worker: usize,
    // Fair-scan cursor over pairs for try_recv.
    next_pair: usize,
}

impl Conn {
    /// Establish endpoints: publish one reply datagram per (server,
    /// worker) pair, then connect to every server. All traffic still goes
    /// to primaries only; the non-primary connections are where replica
    /// reads would attach.
    pub fn connect(cfg: ClientConfig, registry: &Registry) -> Result<Self, Error> {
        cfg.validate()?;
        let layout = RegionLayout::new(
            cfg.num_workers,
            cfg.num_clients,
            cfg.window_size,
            CACHE_LINE,
        )?;

        let num_servers = cfg.placement.num_servers();
        let mut dgrams = Vec::with_capacity(num_servers);
        for server_id in 0..num_servers {
            let mut row = Vec::with_capacity(cfg.num_workers);
            for worker in 0..cfg.num_workers {
                let dgram = Datagram::bind();
                registry.publish(
                    &client_dgram(cfg.clt_gid, server_id, worker),
                    Endpoint::Dgram(dgram.addr()),
                )?;
                row.push(dgram);
            }
            dgrams.push(row);
        }

        let mut writers = Vec::with_capacity(num_servers);
        for server_id in 0..num_servers {
            writers.push(RegionWriter::connect(
                registry,
                server_id,
                cfg.port_index,
                cfg.clt_gid,
                cfg.lookup_timeout,
            )?);
        }
        tracing::debug!(client = cfg.clt_gid, servers = num_servers, "client connected");

        Ok(Self {
            layout,
            writers,
            seqs: vec![0; num_servers],
            dgrams,
            inflight: vec![vec![0; cfg.num_workers]; num_servers],
            ready: VecDeque::new(),
            ws: vec![vec![0; cfg.num_workers]; num_servers],
            next_worker: 0,
            next_pair: 0,
            cfg,
        })
    }

    /// Post one request, routing to the key's primary and fanning out
    /// across workers round-robin. Returns the server it went to.
    pub fn post(&mut self, key: Key, kind: OpKind, value: &[u8]) -> Result<usize, Error> {
        let server = self.cfg.placement.route(key.bucket());
        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % self.cfg.num_workers;
        self.post_to(server, worker, key, kind, value)?;
        Ok(server)
    }

    /// Post one request at an explicit (server, worker) pair.
    ///
    /// At most `window_size` requests are outstanding per pair: a slot is
    /// reused only after the reply to its previous occupant has come back
    /// on the pair's own endpoint, so a full pair reaps before posting.
    /// Replies taken while making room queue up for `recv`.
    pub fn post_to(
        &mut self,
        server: usize,
        worker: usize,
        key: Key,
        kind: OpKind,
        value: &[u8],
    ) -> Result<(), Error> {
        while self.inflight[server][worker] >= self.cfg.window_size as u64 {
            match self.reap_pair(server, worker)? {
                Some(reply) => self.ready.push_back(reply),
                None => std::hint::spin_loop(),
            }
        }

        let slot = self.ws[server][worker];
        let mut bytes = [0u8; SLOT_SIZE];
        encode_slot(&mut bytes, key, kind, value)?;
        let offset = self.layout.slot_offset(worker, self.cfg.clt_gid, slot);

        self.seqs[server] += 1;
        let seq = self.seqs[server];
        let signalled = seq & (UNSIG_BATCH - 1) == 0;
        if signalled && seq > UNSIG_BATCH {
            // Keep at most UNSIG_BATCH writes outstanding on this channel.
            while !self.writers[server].poll_completion() {
                std::hint::spin_loop();
            }
        }

        // The receive must be posted before the write that provokes the
        // reply, or the datagram has nothing to land in.
        self.dgrams[server][worker].post_recv();
        self.writers[server].post_write(offset, &bytes, signalled)?;
        self.ws[server][worker] = (slot + 1) % self.cfg.window_size;
        self.inflight[server][worker] += 1;
        Ok(())
    }

    /// Poll one pair's endpoint, retiring a window entry on success.
    fn reap_pair(&mut self, server: usize, worker: usize) -> Result<Option<Reply>, Error> {
        let Some(bytes) = self.dgrams[server][worker].recv() else {
            return Ok(None);
        };
        self.inflight[server][worker] -= 1;
        decode(&bytes).map(Some)
    }

    /// Poll for the next reply: queued ones first, then a fair scan of
    /// every pair's endpoint.
    pub fn try_recv(&mut self) -> Result<Option<Reply>, Error> {
        if let Some(reply) = self.ready.pop_front() {
            return Ok(Some(reply));
        }
        let pairs = self.cfg.placement.num_servers() * self.cfg.num_workers;
        for _ in 0..pairs {
            let (server, worker) = (
                self.next_pair / self.cfg.num_workers,
                self.next_pair % self.cfg.num_workers,
            );
            self.next_pair = (self.next_pair + 1) % pairs;
            if let Some(reply) = self.reap_pair(server, worker)? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    /// Busy-wait for the next reply.
    pub fn recv(&mut self, shutdown: &Shutdown) -> Result<Reply, Error> {
        loop {
            if let Some(reply) = self.try_recv()? {
                return Ok(reply);
            }
            if shutdown.is_raised() {
                return Err(Error::Interrupted);
            }
            std::hint::spin_loop();
        }
    }
}

fn decode(bytes: &[u8]) -> Result<Reply, Error> {
    Ok(match decode_response(bytes)? {
        wire::Response::Value(value) => Reply::Value(value.to_vec()),
        wire::Response::Empty => Reply::Empty,
        wire::Response::Rejected => Reply::Rejected,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub posted: u64,
    pub completed: u64,
    /// Requests posted per server.
    pub per_server: Vec<u64>,
}

/// Drive the request cycle: draw a key, pick the op by the update
/// percentage, post to the key's primary, and drain replies as they
/// arrive. Each (server, worker) pair holds its own `window_size`
/// outstanding requests; the pair itself applies backpressure when full.
/// Runs until `limit` requests completed, or until shutdown when `limit`
/// is `None`.
pub fn run(
    cfg: ClientConfig,
    registry: &Registry,
    shutdown: &Shutdown,
    limit: Option<u64>,
) -> Result<Stats, Error> {
    let num_servers = cfg.placement.num_servers();
    let keys = keyspace(cfg.num_keys);
    let mut rng = SmallRng::seed_from_u64(cfg.seed);
    let mut conn = Conn::connect(cfg, registry)?;

    let mut stats = Stats {
        posted: 0,
        completed: 0,
        per_server: vec![0; num_servers],
    };
    let mut last_report = 0u64;
    let started = Instant::now();

    loop {
        if shutdown.is_raised() || limit.is_some_and(|n| stats.completed >= n) {
            break;
        }

        // Drain whatever replies have arrived, including any reaped while
        // a full pair made room for a post.
        while let Some(_reply) = conn.try_recv()? {
            stats.completed += 1;
            if stats.completed - last_report >= K_512 {
                last_report = stats.completed;
                report(&conn.cfg, &stats, started);
            }
            if limit.is_some_and(|n| stats.completed >= n) {
                break;
            }
        }

        if limit.map_or(true, |n| stats.posted < n) {
            let key = keys[rng.gen_range(0..keys.len())];
            let kind = if rng.gen_range(0..100u32) < conn.cfg.update_percentage as u32 {
                OpKind::Put
            } else {
                OpKind::Get
            };
            let value = match kind {
                OpKind::Put => key.derived_value(conn.cfg.value_len),
                OpKind::Get => Vec::new(),
            };

            let server = conn.post(key, kind, &value)?;
            stats.per_server[server] += 1;
            stats.posted += 1;
        } else {
            std::hint::spin_loop();
        }
    }

    report(&conn.cfg, &stats, started);
    Ok(stats)
}

fn report(cfg: &ClientConfig, stats: &Stats, started: Instant) {
    let elapsed = started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        stats.completed as f64 / elapsed
    } else {
        0.0
    };
    tracing::info!(
        client = cfg.clt_gid,
        completed = stats.completed,
        rate_per_sec = format_args!("{rate:.0}"),
        per_server = ?stats.per_server,
        "client throughput"
    );
}

#[cfg(test)]
mod test {
    use super::*;
    use fabric::{master_endpoint, SendDesc};
    use pretty_assertions::assert_eq;
    use region::RequestRegion;
    use std::sync::Arc;

    fn config(num_servers: usize) -> ClientConfig {
        ClientConfig {
            clt_gid: 0,
            placement: Placement::new(num_servers, num_servers, 1).unwrap(),
            num_workers: 2,
            num_clients: 2,
            window_size: 4,
            update_percentage: 50,
            num_keys: 256,
            value_len: 16,
            port_index: 0,
            lookup_timeout: Duration::from_millis(200),
            seed: 1,
        }
    }

    /// Publish a bare region per server, with no workers behind it.
    fn publish_regions(registry: &Registry, cfg: &ClientConfig) -> Vec<Arc<RequestRegion>> {
        let layout = RegionLayout::new(
            cfg.num_workers,
            cfg.num_clients,
            cfg.window_size,
            CACHE_LINE,
        )
        .unwrap();
        (0..cfg.placement.num_servers())
            .map(|server_id| {
                let region = Arc::new(RequestRegion::anonymous(layout).unwrap());
                for gid in 0..cfg.num_clients {
                    registry
                        .publish(
                            &master_endpoint(server_id, 0, gid),
                            Endpoint::Region(Arc::clone(&region)),
                        )
                        .unwrap();
                }
                region
            })
            .collect()
    }

    /// A key from the shared array whose primary is `server`.
    fn key_routed_to(cfg: &ClientConfig, server: usize) -> Key {
        keyspace(cfg.num_keys)
            .into_iter()
            .find(|k| cfg.placement.route(k.bucket()) == server)
            .unwrap()
    }

    /// Answer one outstanding request of pair (server, worker) with an
    /// empty reply, standing in for that pair's worker.
    fn reply_to_pair(registry: &Registry, replier: &mut Datagram, gid: usize, server: usize, worker: usize) {
        let addr = match registry.lookup(&client_dgram(gid, server, worker)) {
            Some(Endpoint::Dgram(addr)) => addr,
            _ => panic!("pair endpoint is not published"),
        };
        replier.post_send(&SendDesc {
            to: &addr,
            payload: &[0],
            signalled: false,
            inline: true,
        });
    }

    #[test]
    fn validation_refuses_bad_mixes() {
        let registry = Registry::in_process();
        let mut cfg = config(1);
        cfg.update_percentage = 101;
        assert!(matches!(
            Conn::connect(cfg, &registry),
            Err(Error::UpdatePercentage(101))
        ));

        let mut cfg = config(1);
        cfg.value_len = MAX_SLOT_VALUE_LEN + 1;
        assert!(matches!(
            Conn::connect(cfg, &registry),
            Err(Error::ValueLen { .. })
        ));
    }

    #[test]
    fn posts_land_at_the_window_offsets_of_the_routed_server() {
        let registry = Registry::in_process();
        let cfg = config(2);
        let regions = publish_regions(&registry, &cfg);
        let mut conn = Conn::connect(cfg.clone(), &registry).unwrap();

        // A key routed to server 0, posted repeatedly through worker 0.
        let key = key_routed_to(&cfg, 0);
        for expected_slot in [0, 1, 2, 3] {
            conn.post_to(0, 0, key, OpKind::Get, &[]).unwrap();
            assert_eq!(
                regions[0].slot(0, 0, expected_slot).opcode(),
                OpKind::Get.wire_code()
            );
        }

        // The pair's window is full; retiring one reply lets the slot
        // counter wrap back to 0.
        let mut replier = Datagram::bind();
        reply_to_pair(&registry, &mut replier, 0, 0, 0);
        regions[0].slot(0, 0, 0).clear();
        conn.post_to(0, 0, key, OpKind::Get, &[]).unwrap();
        assert_eq!(
            regions[0].slot(0, 0, 0).opcode(),
            OpKind::Get.wire_code()
        );
        assert_eq!(conn.try_recv().unwrap(), Some(Reply::Empty));
    }

    #[test]
    fn windows_gate_each_pair_independently() {
        let registry = Registry::in_process();
        let mut cfg = config(2);
        cfg.window_size = 2;
        let regions = publish_regions(&registry, &cfg);
        let mut conn = Conn::connect(cfg.clone(), &registry).unwrap();

        // Fill three different pairs to their whole window without a
        // single reply outstanding anywhere: only the pair's own count
        // gates, never a global one.
        let to_zero = key_routed_to(&cfg, 0);
        let to_one = key_routed_to(&cfg, 1);
        for slot in 0..2 {
            conn.post_to(0, 0, to_zero, OpKind::Get, &[]).unwrap();
            conn.post_to(0, 1, to_zero, OpKind::Get, &[]).unwrap();
            conn.post_to(1, 0, to_one, OpKind::Get, &[]).unwrap();

            assert_eq!(
                regions[0].slot(0, 0, slot).opcode(),
                OpKind::Get.wire_code()
            );
            assert_eq!(
                regions[0].slot(1, 0, slot).opcode(),
                OpKind::Get.wire_code()
            );
            assert_eq!(
                regions[1].slot(0, 0, slot).opcode(),
                OpKind::Get.wire_code()
            );
        }
    }

    #[test]
    fn replies_are_matched_to_their_pair() {
        let registry = Registry::in_process();
        let cfg = config(2);
        let _regions = publish_regions(&registry, &cfg);
        let mut conn = Conn::connect(cfg.clone(), &registry).unwrap();

        let key = key_routed_to(&cfg, 0);
        conn.post_to(0, 0, key, OpKind::Get, &[]).unwrap();
        conn.post_to(0, 1, key, OpKind::Get, &[]).unwrap();

        // Only pair (0, 1) answers; its window drains while (0, 0) stays
        // outstanding.
        let mut replier = Datagram::bind();
        reply_to_pair(&registry, &mut replier, 0, 0, 1);
        assert_eq!(conn.try_recv().unwrap(), Some(Reply::Empty));
        assert_eq!(conn.try_recv().unwrap(), None);
        assert_eq!(conn.inflight[0][0], 1);
        assert_eq!(conn.inflight[0][1], 0);
    }

    #[test]
    fn round_robin_spreads_posts_across_workers() {
        let registry = Registry::in_process();
        let cfg = config(1);
        let regions = publish_regions(&registry, &cfg);
        let mut conn = Conn::connect(cfg.clone(), &registry).unwrap();

        let key = Key::from_seed(3);
        conn.post(key, OpKind::Get, &[]).unwrap();
        conn.post(key, OpKind::Get, &[]).unwrap();

        assert_eq!(
            regions[0].slot(0, 0, 0).opcode(),
            OpKind::Get.wire_code()
        );
        assert_eq!(
            regions[0].slot(1, 0, 0).opcode(),
            OpKind::Get.wire_code()
        );
    }

    #[test]
    fn routing_follows_the_placement_primary() {
        let registry = Registry::in_process();
        let mut cfg = config(4);
        // A window deep enough that no pair fills during the sweep.
        cfg.window_size = 64;
        let _regions = publish_regions(&registry, &cfg);
        let mut conn = Conn::connect(cfg.clone(), &registry).unwrap();

        for key in keyspace(64) {
            let server = conn.post(key, OpKind::Get, &[]).unwrap();
            assert_eq!(server, cfg.placement.route(key.bucket()));
        }
    }
}
