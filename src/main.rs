//! Shroud daemon entry point.
//!
//! Builds every component in dependency order (store client, tunnel
//! device, UDP socket, plugin chain, workers, aggregator, stats API) and
//! hands the running set to the supervisor.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use shroud::api::Api;
use shroud::config::{Cli, Config};
use shroud::device::{self, DeviceKind};
use shroud::error::{Error, Result};
use shroud::metric::{Aggregator, TrafficDirection};
use shroud::plugin;
use shroud::router::RouteTable;
use shroud::socket::{self, SocketKind};
use shroud::store::{self, StoreClient};
use shroud::supervisor::Supervisor;
use shroud::worker::{Incoming, Outgoing};
use shroud::VERSION;

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut cfg = Config::load(cli)?;
    info!("Shroud v{} starting", VERSION);
    info!("Machine id {}", &cfg.machine_id[..16]);
    info!("Public key {}", cfg.keypair.public_key_base64());

    // Control plane first: the leased address decides how the tunnel is
    // configured.
    let backend = store::new(&cfg)?;
    let client = Arc::new(StoreClient::new(backend, &cfg));
    let netcfg = client.init(&mut cfg)?;
    let router = Arc::new(RouteTable::new(netcfg.network));

    let plugins = Arc::new(plugin::build(&cfg.plugins)?);
    let dev = device::new(DeviceKind::Tun, &cfg)?;
    let sock = socket::new(SocketKind::Udp, &cfg)?;
    let aggregator = Arc::new(Aggregator::new(cfg.num_workers, cfg.stats_window));

    cfg.write_pid_file()?;
    let private_ip = cfg
        .private_ip
        .ok_or_else(|| Error::Config("no private address after registration".into()))?;
    let cfg = Arc::new(cfg);
    let stop = Arc::new(AtomicBool::new(false));

    let mut supervisor = Supervisor::new(
        cfg.clone(),
        dev.clone(),
        sock.clone(),
        client.clone(),
        plugins.clone(),
        stop.clone(),
    );

    supervisor.register(
        "store-client",
        client.clone().start(router.clone(), stop.clone()),
    );
    supervisor.register("aggregator", aggregator.clone().start(stop.clone()));
    supervisor.register(
        "stats-api",
        Api::new(&cfg, aggregator.stats()).start(stop.clone())?,
    );

    let outgoing = Outgoing::new(
        private_ip,
        router.clone(),
        plugins.clone(),
        dev.clone(),
        sock.clone(),
    );
    let incoming = Incoming::new(router, plugins, dev.clone(), sock);
    for queue in 0..cfg.num_workers {
        supervisor.register(
            &format!("outgoing-{}", queue),
            outgoing.start(
                queue,
                aggregator.recorder(TrafficDirection::Tx, queue),
                stop.clone(),
            ),
        );
        supervisor.register(
            &format!("incoming-{}", queue),
            incoming.start(
                queue,
                aggregator.recorder(TrafficDirection::Rx, queue),
                stop.clone(),
            ),
        );
    }

    info!("Tunnel device:       {}", dev.name());
    info!("Overlay network:     {}", netcfg.network);
    info!("Private address:     {}", private_ip);
    info!(
        "UDP listener:        {}:{} ({} queues)",
        cfg.listen_address, cfg.listen_port, cfg.num_workers
    );
    info!(
        "Stats API:           http://{}:{}/metrics",
        cfg.stats_address, cfg.stats_port
    );

    supervisor.run()
}
