//! Shard placement: pure functions mapping a key's bucket field to the
//! shard that holds it and the ring of servers that own that shard.

/// Upper bound on the serving topology size.
pub const MAX_SERVERS: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("num_servers must be in 1..={MAX_SERVERS} (got {0})")]
    InvalidServers(usize),
    #[error("num_shards must be at least 1 (got 0)")]
    InvalidShards,
    #[error("replication_factor {factor} must be in 1..=num_servers ({servers})")]
    InvalidReplication { factor: usize, servers: usize },
}

/// A fixed serving topology. Placement is deterministic: it depends only on
/// these three parameters and the key bucket, so every client and server
/// computes identical routes with no coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    num_servers: usize,
    num_shards: usize,
    replication_factor: usize,
}

impl Placement {
    pub fn new(
        num_servers: usize,
        num_shards: usize,
        replication_factor: usize,
    ) -> Result<Self, Error> {
        if num_servers == 0 || num_servers > MAX_SERVERS {
            return Err(Error::InvalidServers(num_servers));
        }
        if num_shards == 0 {
            return Err(Error::InvalidShards);
        }
        if replication_factor == 0 || replication_factor > num_servers {
            return Err(Error::InvalidReplication {
                factor: replication_factor,
                servers: num_servers,
            });
        }
        Ok(Self {
            num_servers,
            num_shards,
            replication_factor,
        })
    }

    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// The shard holding a key with this bucket field.
    pub fn shard_of(&self, bucket: u32) -> usize {
        bucket as usize % self.num_shards
    }

    /// The first server of the shard's replica ring segment.
    pub fn primary_of(&self, shard: usize) -> usize {
        shard % self.num_servers
    }

    /// The ring segment of servers owning `shard`: `replication_factor`
    /// consecutive servers starting at the shard's primary.
    pub fn replicas_of(&self, shard: usize) -> impl Iterator<Item = usize> + '_ {
        (0..self.replication_factor).map(move |i| (shard + i) % self.num_servers)
    }

    pub fn owns(&self, server: usize, shard: usize) -> bool {
        self.replicas_of(shard).any(|replica| replica == server)
    }

    pub fn key_belongs_to(&self, bucket: u32, server: usize) -> bool {
        self.owns(server, self.shard_of(bucket))
    }

    /// The server a client sends a request for `bucket` to. Requests always
    /// go to the shard's primary; balancing reads across replicas is a
    /// future extension.
    pub fn route(&self, bucket: u32) -> usize {
        self.primary_of(self.shard_of(bucket))
    }
}
