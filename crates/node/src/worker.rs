use crate::{Error, Shutdown};
use engine::{Engine, EngineConfig, Op, Reply};
use fabric::{client_dgram, Datagram, DgramAddr, Registry, SendDesc, MAX_INLINE, UNSIG_BATCH};
use region::Column;
use std::time::Duration;
use wire::{
    decode_payload, encode_response, keyspace, Key, OpKind, Response, SlotState,
    MAX_RESPONSE_LEN, MAX_SLOT_VALUE_LEN,
};

/// Flush a non-empty pending batch after this many consecutive idle
/// probes, so a trickle of requests is not held hostage to the postlist.
pub const EMPTY_PROBE_FLUSH: usize = 512;
/// Emit a throughput event every so many executed operations.
pub const STATS_EVERY: u64 = 1 << 21;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The server this worker serves on; part of the reply endpoint
    /// names it resolves.
    pub server_id: usize,
    /// This worker's column of the request region.
    pub index: usize,
    /// Batch size for response posting.
    pub postlist: usize,
    pub engine: EngineConfig,
    /// Insert the first `preload_keys` keys of the shared key array at
    /// startup, each with its derived value. Zero starts empty.
    pub preload_keys: usize,
    pub lookup_timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub executed: u64,
    pub batches: u64,
    pub dropped_malformed: u64,
}

// One decoded request waiting in the pending batch. The value is copied
// out of the slot so the slot can be handed back to its client as soon as
// the batch drains.
struct Pending {
    client: usize,
    slot: usize,
    kind: OpKind,
    key: Key,
    value_len: usize,
    value: [u8; MAX_SLOT_VALUE_LEN],
}

/// A worker owns one column of the request region, one engine, and one
/// datagram endpoint for every reply it sends. It never blocks: polling,
/// dispatch, and completion reaping are all busy-wait.
pub struct Worker {
    cfg: WorkerConfig,
    column: Column,
    engine: Engine,
    dgram: Datagram,
    registry: Registry,
    // Lazily resolved address handle per client gid.
    addrs: Vec<Option<DgramAddr>>,
    resp_bufs: Vec<[u8; MAX_RESPONSE_LEN]>,
    send_seq: u64,
    stats: WorkerStats,
    last_report: u64,
}

impl Worker {
    pub fn new(cfg: WorkerConfig, column: Column, registry: Registry) -> Result<Self, Error> {
        assert!(cfg.postlist >= 1);
        let mut engine = Engine::new(cfg.engine)?;

        for key in keyspace(cfg.preload_keys) {
            engine.put(key, &key.derived_value(cfg.engine.max_value_len));
        }

        let num_clients = column.layout().num_clients;
        Ok(Self {
            resp_bufs: vec![[0; MAX_RESPONSE_LEN]; cfg.postlist],
            addrs: vec![None; num_clients],
            cfg,
            column,
            engine,
            dgram: Datagram::bind(),
            registry,
            send_seq: 0,
            stats: WorkerStats::default(),
            last_report: 0,
        })
    }

    /// Poll the column until shutdown. The cursor walks (client, slot) in
    /// row-minor order; occupied slots join the pending batch, and the
    /// batch drains at `postlist` or after a bounded run of idle probes.
    pub fn run(&mut self, shutdown: &Shutdown) -> Result<WorkerStats, Error> {
        let layout = *self.column.layout();
        let (mut clt, mut slot) = (0, 0);
        let mut empty_probes = 0usize;
        let mut batch: Vec<Pending> = Vec::with_capacity(self.cfg.postlist);

        while !shutdown.is_raised() {
            let decoded = self.probe(clt, slot);

            match decoded {
                None => {
                    empty_probes += 1;
                    if !batch.is_empty() && empty_probes >= EMPTY_PROBE_FLUSH {
                        self.flush(&mut batch)?;
                        empty_probes = 0;
                    }
                }
                Some(pending) => {
                    empty_probes = 0;
                    batch.push(pending);
                    if batch.len() == self.cfg.postlist {
                        self.flush(&mut batch)?;
                    }
                }
            }

            slot += 1;
            if slot == layout.window_size {
                slot = 0;
                clt += 1;
                if clt == layout.num_clients {
                    clt = 0;
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch)?;
        }
        tracing::info!(
            worker = self.cfg.index,
            executed = self.stats.executed,
            dropped = self.stats.dropped_malformed,
            "worker stopping"
        );
        Ok(self.stats.clone())
    }

    /// Inspect one slot. Returns the decoded request, or `None` for an
    /// idle slot. A slot that cannot be decoded is cleared and silently
    /// dropped: no reply, and the client's own receive accounting is left
    /// to reclaim the window entry.
    fn probe(&mut self, clt: usize, slot: usize) -> Option<Pending> {
        let view = self.column.slot(clt, slot);

        let kind = match SlotState::decode(view.opcode()) {
            Ok(SlotState::Idle) => return None,
            Ok(SlotState::Pending(kind)) => kind,
            Err(err) => {
                tracing::warn!(client = clt, slot, %err, "dropping malformed request");
                self.stats.dropped_malformed += 1;
                view.clear();
                return None;
            }
        };

        match decode_payload(kind, view.body()) {
            Ok(op) => {
                let mut value = [0; MAX_SLOT_VALUE_LEN];
                value[..op.value.len()].copy_from_slice(op.value);
                Some(Pending {
                    client: clt,
                    slot,
                    kind: op.kind,
                    key: op.key,
                    value_len: op.value.len(),
                    value,
                })
            }
            Err(err) => {
                tracing::warn!(client = clt, slot, %err, "dropping malformed request");
                self.stats.dropped_malformed += 1;
                view.clear();
                None
            }
        }
    }

    /// Drain the pending batch: execute it against the engine, encode the
    /// responses, hand the slots back, and post the replies as one send
    /// list with the signalling discipline applied.
    fn flush(&mut self, batch: &mut Vec<Pending>) -> Result<(), Error> {
        let replies = self.engine.execute_batch(batch.iter().map(|pending| Op {
            kind: pending.kind,
            key: pending.key,
            value: &pending.value[..pending.value_len],
        }));

        let mut lens = Vec::with_capacity(batch.len());
        for (buf, reply) in self.resp_bufs.iter_mut().zip(&replies) {
            let response = match reply {
                Reply::Value(value) => Response::Value(value),
                Reply::Empty => Response::Empty,
                Reply::Rejected => Response::Rejected,
            };
            lens.push(encode_response(buf, &response)?);
        }

        let mut dests = Vec::with_capacity(batch.len());
        for pending in batch.iter() {
            dests.push(self.client_addr(pending.client)?);
        }

        for pending in batch.iter() {
            self.column.slot(pending.client, pending.slot).clear();
        }

        // Mark every UNSIG_BATCH-th send signalled, and reap one prior
        // signalled completion per new signalled send before posting, so
        // at most UNSIG_BATCH sends are ever outstanding.
        let mut descs = Vec::with_capacity(batch.len());
        let mut reap = 0;
        for i in 0..batch.len() {
            self.send_seq += 1;
            let signalled = self.send_seq & (UNSIG_BATCH - 1) == 0;
            if signalled && self.send_seq > UNSIG_BATCH {
                reap += 1;
            }
            descs.push(SendDesc {
                to: &dests[i],
                payload: &self.resp_bufs[i][..lens[i]],
                signalled,
                inline: lens[i] <= MAX_INLINE,
            });
        }
        for _ in 0..reap {
            while !self.dgram.poll_send_completion() {
                std::hint::spin_loop();
            }
        }
        self.dgram.post_send_list(&descs);

        self.stats.executed += batch.len() as u64;
        self.stats.batches += 1;
        batch.clear();

        if self.stats.executed - self.last_report >= STATS_EVERY {
            self.last_report = self.stats.executed;
            tracing::info!(
                worker = self.cfg.index,
                executed = self.stats.executed,
                "worker throughput checkpoint"
            );
        }
        Ok(())
    }

    fn client_addr(&mut self, client: usize) -> Result<DgramAddr, Error> {
        if let Some(addr) = &self.addrs[client] {
            return Ok(addr.clone());
        }
        let addr = self.registry.lookup_dgram(
            &client_dgram(client, self.cfg.server_id, self.cfg.index),
            self.cfg.lookup_timeout,
        )?;
        self.addrs[client] = Some(addr.clone());
        Ok(addr)
    }
}
