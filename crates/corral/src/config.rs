use cli_common::LogArgs;
use placement::Placement;
use std::time::Duration;

// Deployment geometry. These are fixed per deployment rather than flagged:
// every process must agree on them for the region offset arithmetic and
// the endpoint names to line up.
/// Worker columns per request region.
pub const NUM_WORKERS: usize = 8;
/// Client columns per request region: the largest client gid plus one.
pub const NUM_CLIENTS: usize = 64;
/// Outstanding requests per client per (server, worker) pair.
pub const WINDOW_SIZE: usize = 32;
/// Size of the shared preloaded key array.
pub const NUM_KEYS: usize = 1 << 20;
/// Length of stored values.
pub const VALUE_LEN: usize = 32;
/// Buckets of each worker's index.
pub const NUM_BUCKETS: usize = 1 << 20;
/// Bytes of each worker's circular value log.
pub const LOG_CAPACITY: usize = 1 << 26;
/// Shared-segment key of port index 0; port `i` uses `BASE_SHM_KEY + i`.
pub const BASE_SHM_KEY: i32 = 24;
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, clap::Parser)]
#[command(
    name = "corral",
    version,
    about = "Partitioned in-memory KV store served over a remotely-written request region"
)]
pub struct Flags {
    #[command(flatten)]
    pub log: LogArgs,

    /// Run the master for this server's ports: allocate request regions
    /// and register their endpoints.
    #[arg(long, default_value_t = 0)]
    pub master: u8,

    /// Run client threads instead of a server.
    #[arg(long, default_value_t = 0)]
    pub is_client: u8,

    #[arg(long, default_value_t = 0)]
    pub base_port_index: usize,

    #[arg(long, default_value_t = 1)]
    pub num_server_ports: usize,

    #[arg(long, default_value_t = 1)]
    pub num_client_ports: usize,

    /// Batch size for worker response posting.
    #[arg(long, default_value_t = 16)]
    pub postlist: usize,

    /// Percentage of client operations that are PUTs.
    #[arg(long, default_value_t = 50)]
    pub update_percentage: u8,

    /// This client machine's id; thread `i` gets gid
    /// `machine_id * num_threads + i`.
    #[arg(long, default_value_t = 0)]
    pub machine_id: usize,

    /// Client threads on this machine.
    #[arg(long, default_value_t = 1)]
    pub num_threads: usize,

    #[arg(long, default_value_t = 1)]
    pub num_servers: usize,

    #[arg(long, default_value_t = 1)]
    pub num_shards: usize,

    #[arg(long, default_value_t = 1)]
    pub replication_factor: usize,

    #[arg(long, default_value_t = 0)]
    pub server_id: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--{flag} must be 0 or 1 (got {got})")]
    Binary { flag: &'static str, got: u8 },
    #[error(transparent)]
    Placement(#[from] placement::Error),
    #[error("--server-id {id} is out of range for {servers} servers")]
    ServerId { id: usize, servers: usize },
    #[error("--postlist must be at least 1")]
    Postlist,
    #[error("--update-percentage must be at most 100 (got {0})")]
    UpdatePercentage(u8),
    #[error("--num-threads must be at least 1")]
    NumThreads,
    #[error("client gids {first}..={last} exceed the {max}-client region geometry")]
    ClientGids {
        first: usize,
        last: usize,
        max: usize,
    },
    #[error("--num-server-ports and --num-client-ports must be at least 1")]
    Ports,
    #[error("a combined master+client process serves a single-server topology (got {0} servers)")]
    Combined(usize),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    /// Workers, optionally hosting this server's masters too. Without
    /// them, the process attaches to segments a prior master created.
    Server { host_master: bool },
    Client,
    /// Master, workers, and clients in one process: the single-server
    /// standalone deployment.
    Combined,
}

/// Validated configuration. Everything here is checked before any region,
/// segment, or endpoint exists, so a rejected configuration leaves no
/// state behind.
#[derive(Debug, Clone)]
pub struct Config {
    pub role: Role,
    pub placement: Placement,
    pub server_id: usize,
    pub base_port_index: usize,
    pub num_server_ports: usize,
    pub num_client_ports: usize,
    pub postlist: usize,
    pub update_percentage: u8,
    pub machine_id: usize,
    pub num_threads: usize,
}

impl Config {
    pub fn from_flags(flags: &Flags) -> Result<Self, ConfigError> {
        for (flag, got) in [("master", flags.master), ("is-client", flags.is_client)] {
            if got > 1 {
                return Err(ConfigError::Binary { flag, got });
            }
        }
        let role = match (flags.master == 1, flags.is_client == 1) {
            (true, true) => Role::Combined,
            (false, true) => Role::Client,
            (host_master, false) => Role::Server { host_master },
        };

        let placement = Placement::new(
            flags.num_servers,
            flags.num_shards,
            flags.replication_factor,
        )?;

        if !matches!(role, Role::Client) && flags.server_id >= flags.num_servers {
            return Err(ConfigError::ServerId {
                id: flags.server_id,
                servers: flags.num_servers,
            });
        }
        if flags.postlist == 0 {
            return Err(ConfigError::Postlist);
        }
        if flags.update_percentage > 100 {
            return Err(ConfigError::UpdatePercentage(flags.update_percentage));
        }
        if flags.num_server_ports == 0 || flags.num_client_ports == 0 {
            return Err(ConfigError::Ports);
        }

        if !matches!(role, Role::Server { .. }) {
            if flags.num_threads == 0 {
                return Err(ConfigError::NumThreads);
            }
            let first = flags.machine_id * flags.num_threads;
            let last = first + flags.num_threads - 1;
            if last >= NUM_CLIENTS {
                return Err(ConfigError::ClientGids {
                    first,
                    last,
                    max: NUM_CLIENTS,
                });
            }
        }
        if matches!(role, Role::Combined) && flags.num_servers != 1 {
            return Err(ConfigError::Combined(flags.num_servers));
        }

        Ok(Self {
            role,
            placement,
            server_id: flags.server_id,
            base_port_index: flags.base_port_index,
            num_server_ports: flags.num_server_ports,
            num_client_ports: flags.num_client_ports,
            postlist: flags.postlist,
            update_percentage: flags.update_percentage,
            machine_id: flags.machine_id,
            num_threads: flags.num_threads,
        })
    }

    /// Shared-segment key of this server's `port` (an index into
    /// `0..num_server_ports`).
    pub fn shm_key(&self, port: usize) -> i32 {
        BASE_SHM_KEY + (self.base_port_index + port) as i32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Flags {
        Flags::parse_from(std::iter::once("corral").chain(args.iter().copied()))
    }

    #[test]
    fn default_flags_make_a_worker_only_server() {
        let cfg = Config::from_flags(&parse(&[])).unwrap();
        assert_eq!(cfg.role, Role::Server { host_master: false });
        assert_eq!(cfg.placement, Placement::new(1, 1, 1).unwrap());
        assert_eq!(cfg.postlist, 16);
    }

    #[test]
    fn role_selection() {
        let cfg = Config::from_flags(&parse(&["--master", "1"])).unwrap();
        assert_eq!(cfg.role, Role::Server { host_master: true });

        let cfg = Config::from_flags(&parse(&["--is-client", "1"])).unwrap();
        assert_eq!(cfg.role, Role::Client);

        let cfg = Config::from_flags(&parse(&["--master", "1", "--is-client", "1"])).unwrap();
        assert_eq!(cfg.role, Role::Combined);
    }

    #[test]
    fn rejects_non_binary_role_flags() {
        assert_eq!(
            Config::from_flags(&parse(&["--master", "2"])).unwrap_err(),
            ConfigError::Binary {
                flag: "master",
                got: 2
            }
        );
    }

    #[test]
    fn rejects_out_of_range_server_id() {
        assert_eq!(
            Config::from_flags(&parse(&["--num-servers", "4", "--server-id", "4"])).unwrap_err(),
            ConfigError::ServerId { id: 4, servers: 4 }
        );
    }

    #[test]
    fn rejects_invalid_placement() {
        assert_eq!(
            Config::from_flags(&parse(&["--num-servers", "2", "--replication-factor", "3"]))
                .unwrap_err(),
            ConfigError::Placement(placement::Error::InvalidReplication {
                factor: 3,
                servers: 2
            })
        );
    }

    #[test]
    fn rejects_bad_percentage_and_postlist() {
        assert_eq!(
            Config::from_flags(&parse(&["--update-percentage", "101"])).unwrap_err(),
            ConfigError::UpdatePercentage(101)
        );
        assert_eq!(
            Config::from_flags(&parse(&["--postlist", "0"])).unwrap_err(),
            ConfigError::Postlist
        );
    }

    #[test]
    fn rejects_client_gids_beyond_the_region_geometry() {
        let err = Config::from_flags(&parse(&[
            "--is-client",
            "1",
            "--machine-id",
            "3",
            "--num-threads",
            "32",
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ClientGids {
                first: 96,
                last: 127,
                max: NUM_CLIENTS
            }
        );
    }

    #[test]
    fn combined_role_is_single_server_only() {
        let err = Config::from_flags(&parse(&[
            "--master",
            "1",
            "--is-client",
            "1",
            "--num-servers",
            "2",
            "--num-shards",
            "2",
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Combined(2));
    }

    #[test]
    fn shm_keys_follow_the_port_index() {
        let cfg = Config::from_flags(&parse(&["--base-port-index", "2"])).unwrap();
        assert_eq!(cfg.shm_key(0), BASE_SHM_KEY + 2);
        assert_eq!(cfg.shm_key(1), BASE_SHM_KEY + 3);
    }
}
