use crate::config::{
    Config, Role, LOG_CAPACITY, LOOKUP_TIMEOUT, NUM_BUCKETS, NUM_CLIENTS, NUM_KEYS, NUM_WORKERS,
    VALUE_LEN, WINDOW_SIZE,
};
use anyhow::Context;
use engine::EngineConfig;
use fabric::{Registry, Shutdown};
use node::{Master, MasterConfig, Worker, WorkerConfig, WorkerStats};
use region::{Column, RegionLayout, RequestRegion, CACHE_LINE};
use std::sync::Arc;
use std::thread::JoinHandle;

type WorkerHandle = JoinHandle<Result<WorkerStats, node::Error>>;

pub fn run(cfg: Config, registry: Registry, shutdown: Shutdown) -> anyhow::Result<()> {
    match cfg.role {
        Role::Client => {
            run_clients(&cfg, &registry, &shutdown)?;
        }
        Role::Server { host_master } => {
            let workers = spawn_server(&cfg, host_master, &registry, &shutdown)?;
            join_workers(workers)?;
        }
        Role::Combined => {
            let workers = spawn_server(&cfg, true, &registry, &shutdown)?;
            run_clients(&cfg, &registry, &shutdown)?;
            shutdown.raise();
            join_workers(workers)?;
        }
    }
    Ok(())
}

/// Bring up this server's data plane: one region per port (created and
/// registered here when hosting the master, attached by stable key
/// otherwise) and `NUM_WORKERS` polling threads per region.
fn spawn_server(
    cfg: &Config,
    host_master: bool,
    registry: &Registry,
    shutdown: &Shutdown,
) -> anyhow::Result<Vec<WorkerHandle>> {
    let layout = RegionLayout::new(NUM_WORKERS, NUM_CLIENTS, WINDOW_SIZE, CACHE_LINE)?;
    let mut handles = Vec::new();

    for port in 0..cfg.num_server_ports {
        let port_index = cfg.base_port_index + port;
        let region = if host_master {
            let master = Master::start(
                MasterConfig {
                    server_id: cfg.server_id,
                    port_index,
                    layout,
                    shm_key: Some(cfg.shm_key(port)),
                },
                registry,
            )
            .with_context(|| format!("starting master for port {port_index}"))?;
            Arc::clone(master.region())
        } else {
            Arc::new(
                RequestRegion::attach(cfg.shm_key(port), layout)
                    .with_context(|| format!("attaching request region for port {port_index}"))?,
            )
        };

        for wn in 0..NUM_WORKERS {
            let column = Column::new(Arc::clone(&region), wn)?;
            let mut worker = Worker::new(
                WorkerConfig {
                    server_id: cfg.server_id,
                    index: wn,
                    postlist: cfg.postlist,
                    engine: EngineConfig {
                        num_buckets: NUM_BUCKETS,
                        log_capacity: LOG_CAPACITY,
                        max_value_len: VALUE_LEN,
                    },
                    preload_keys: NUM_KEYS,
                    lookup_timeout: LOOKUP_TIMEOUT,
                },
                column,
                registry.clone(),
            )?;

            let shutdown = shutdown.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("worker-{port_index}-{wn}"))
                    .spawn(move || worker.run(&shutdown))
                    .context("spawning worker thread")?,
            );
        }
    }
    Ok(handles)
}

fn join_workers(handles: Vec<WorkerHandle>) -> anyhow::Result<()> {
    let mut executed = 0;
    for handle in handles {
        let stats = handle
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))?
            .context("worker failed")?;
        executed += stats.executed;
    }
    tracing::info!(executed, "all workers stopped");
    Ok(())
}

/// Run this machine's client threads to completion (shutdown-driven) and
/// log the aggregate distribution.
fn run_clients(cfg: &Config, registry: &Registry, shutdown: &Shutdown) -> anyhow::Result<()> {
    tracing::info!(
        threads = cfg.num_threads,
        machine = cfg.machine_id,
        client_ports = cfg.num_client_ports,
        "starting client threads"
    );
    let mut handles = Vec::new();
    for thread_index in 0..cfg.num_threads {
        let clt_gid = cfg.machine_id * cfg.num_threads + thread_index;
        let client_cfg = client::ClientConfig {
            clt_gid,
            placement: cfg.placement,
            num_workers: NUM_WORKERS,
            num_clients: NUM_CLIENTS,
            window_size: WINDOW_SIZE,
            update_percentage: cfg.update_percentage,
            num_keys: NUM_KEYS,
            value_len: VALUE_LEN,
            port_index: cfg.base_port_index + (clt_gid % cfg.num_server_ports),
            lookup_timeout: LOOKUP_TIMEOUT,
            seed: 0xc0441 ^ clt_gid as u64,
        };

        let registry = registry.clone();
        let shutdown = shutdown.clone();
        handles.push(
            std::thread::Builder::new()
                .name(format!("client-{clt_gid}"))
                .spawn(move || client::run(client_cfg, &registry, &shutdown, None))
                .context("spawning client thread")?,
        );
    }

    let mut completed = 0;
    let mut per_server = vec![0u64; cfg.placement.num_servers()];
    for handle in handles {
        let stats = handle
            .join()
            .map_err(|_| anyhow::anyhow!("client thread panicked"))?
            .context("client failed")?;
        completed += stats.completed;
        for (total, posted) in per_server.iter_mut().zip(&stats.per_server) {
            *total += posted;
        }
    }
    tracing::info!(completed, ?per_server, "all clients stopped");
    Ok(())
}
