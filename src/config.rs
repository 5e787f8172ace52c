//! Shroud configuration.
//!
//! Option precedence is CLI flag > `SHROUD_*` environment variable > config
//! file > built-in default. The CLI and environment layers are handled by
//! clap; the file layer is TOML with every field optional.
//!
//! Loading also computes the node identity: the machine id and keypair are
//! created on first start and persisted in the data directory, so a restart
//! with the same data directory keeps the same identity.

use std::net::{Ipv4Addr, Ipv6Addr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ipnet::Ipv4Net;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crypto::KeyPair;
use crate::error::{Error, Result};

/// Environment variable naming the tunnel interface across a reload exec.
pub const REAL_INTERFACE_NAME_ENV: &str = "_SHROUD_REAL_INTERFACE_NAME";

/// Shroud — encrypted peer-to-peer overlay networking
#[derive(Parser, Debug, Default)]
#[command(name = "shroud", version, about)]
pub struct Cli {
    /// TOML file to load configuration data from
    #[arg(short = 'c', long, env = "SHROUD_CONF_FILE")]
    pub conf_file: Option<PathBuf>,

    /// Name for the TUN interface, %d lets the OS pick a free index
    #[arg(short = 'i', long, env = "SHROUD_INTERFACE_NAME")]
    pub interface_name: Option<String>,

    /// Request a specific private address inside the overlay subnet
    #[arg(long, env = "SHROUD_PRIVATE_IP")]
    pub private_ip: Option<Ipv4Addr>,

    /// Public IPv4 address other nodes reach this node at
    #[arg(short = 'p', long, env = "SHROUD_PUBLIC_IP")]
    pub public_ip: Option<Ipv4Addr>,

    /// Public IPv6 address other nodes reach this node at
    #[arg(long, env = "SHROUD_PUBLIC_IPV6")]
    pub public_ipv6: Option<Ipv6Addr>,

    /// IP address to listen on for forwarded packets
    #[arg(long, env = "SHROUD_LISTEN_ADDRESS")]
    pub listen_address: Option<Ipv4Addr>,

    /// UDP port to listen on for forwarded packets
    #[arg(short = 'l', long, env = "SHROUD_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// Key prefix shroud state is stored under in the datastore
    #[arg(long, env = "SHROUD_PREFIX")]
    pub prefix: Option<String>,

    /// Data directory for persistent node state
    #[arg(long, env = "SHROUD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// File to write the process id to for supervision
    #[arg(long, env = "SHROUD_PID_FILE")]
    pub pid_file: Option<PathBuf>,

    /// Window to calculate bandwidth statistics over
    #[arg(long, env = "SHROUD_STATS_WINDOW", value_parser = parse_duration)]
    pub stats_window: Option<Duration>,

    /// IP address to serve statistics on
    #[arg(long, env = "SHROUD_STATS_ADDRESS")]
    pub stats_address: Option<Ipv4Addr>,

    /// Port to serve statistics on
    #[arg(long, env = "SHROUD_STATS_PORT")]
    pub stats_port: Option<u16>,

    /// Full datastore reconcile interval
    #[arg(long, env = "SHROUD_SYNC_INTERVAL", value_parser = parse_duration)]
    pub sync_interval: Option<Duration>,

    /// Lease refresh interval
    #[arg(long, env = "SHROUD_REFRESH_INTERVAL", value_parser = parse_duration)]
    pub refresh_interval: Option<Duration>,

    /// Datastore backend: etcd, consul, or memory
    #[arg(long, env = "SHROUD_DATASTORE")]
    pub datastore: Option<String>,

    /// Comma-delimited datastore endpoints
    #[arg(long, env = "SHROUD_ENDPOINTS")]
    pub endpoints: Option<String>,

    /// Comma-delimited plugins to enable
    #[arg(long, env = "SHROUD_PLUGINS")]
    pub plugins: Option<String>,

    /// Forward traffic destined outside the overlay for other nodes
    #[arg(long, env = "SHROUD_GATEWAY")]
    pub gateway: bool,

    /// Number of worker queues, defaults to the CPU count
    #[arg(short = 'w', long, env = "SHROUD_WORKERS")]
    pub workers: Option<usize>,

    /// Enable debug logging
    #[arg(long, env = "SHROUD_DEBUG")]
    pub debug: bool,
}

/// The optional file layer, every field overridable above it
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    interface_name: Option<String>,
    private_ip: Option<Ipv4Addr>,
    public_ip: Option<Ipv4Addr>,
    public_ipv6: Option<Ipv6Addr>,
    listen_address: Option<Ipv4Addr>,
    listen_port: Option<u16>,
    prefix: Option<String>,
    data_dir: Option<PathBuf>,
    pid_file: Option<PathBuf>,
    stats_window: Option<String>,
    stats_address: Option<Ipv4Addr>,
    stats_port: Option<u16>,
    sync_interval: Option<String>,
    refresh_interval: Option<String>,
    datastore: Option<String>,
    endpoints: Option<Vec<String>>,
    plugins: Option<Vec<String>>,
    gateway: Option<bool>,
    workers: Option<usize>,
}

/// Fully resolved configuration, frozen before components start.
#[derive(Debug)]
pub struct Config {
    pub interface_name: String,
    pub real_interface_name: Option<String>,
    pub reuse_fds: bool,
    pub num_workers: usize,

    pub machine_id: String,
    pub keypair: Arc<KeyPair>,

    /// Address requested via flag; acquisition prefers it when free
    pub requested_ip: Option<Ipv4Addr>,
    /// The leased private address, filled in after acquisition
    pub private_ip: Option<Ipv4Addr>,
    /// The overlay subnet, replaced by the stored network config on startup
    pub subnet: Ipv4Net,

    pub public_ipv4: Option<Ipv4Addr>,
    pub public_ipv6: Option<Ipv6Addr>,
    pub listen_address: Ipv4Addr,
    pub listen_port: u16,

    pub prefix: String,
    pub data_dir: PathBuf,
    pub pid_file: PathBuf,

    pub stats_window: Duration,
    pub stats_address: Ipv4Addr,
    pub stats_port: u16,

    pub sync_interval: Duration,
    pub refresh_interval: Duration,

    pub datastore: String,
    pub endpoints: Vec<String>,
    pub plugins: Vec<String>,
    pub gateway: bool,
    pub debug: bool,
}

impl Config {
    /// Resolve the full configuration from the parsed CLI layer.
    pub fn load(cli: Cli) -> Result<Self> {
        let file = match &cli.conf_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<FileConfig>(&content)?
            }
            None => FileConfig::default(),
        };

        let data_dir = cli
            .data_dir
            .or(file.data_dir)
            .unwrap_or_else(|| PathBuf::from("/var/lib/shroud"));
        std::fs::create_dir_all(&data_dir)?;

        let machine_id = load_or_create_machine_id(&data_dir)?;
        let keypair = Arc::new(KeyPair::load_or_generate(&data_dir.join("private.key"))?);

        let real_interface_name = std::env::var(REAL_INTERFACE_NAME_ENV).ok();
        let reuse_fds = real_interface_name.is_some();

        let num_workers = cli
            .workers
            .or(file.workers)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1);

        let public_ipv6 = cli.public_ipv6.or(file.public_ipv6);
        let public_ipv4 = match cli.public_ip.or(file.public_ip) {
            Some(ip) => Some(ip),
            None if public_ipv6.is_some() => None,
            None => Some(detect_public_ipv4()?),
        };

        let endpoints = cli
            .endpoints
            .map(|s| s.split(',').map(|e| e.trim().to_string()).collect())
            .or(file.endpoints)
            .unwrap_or_else(|| vec!["127.0.0.1:2379".to_string()]);

        let plugins = cli
            .plugins
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .or(file.plugins)
            .unwrap_or_default();

        let file_duration = |v: Option<String>| -> Result<Option<Duration>> {
            v.map(|s| parse_duration(&s)).transpose()
        };

        Ok(Self {
            interface_name: cli
                .interface_name
                .or(file.interface_name)
                .unwrap_or_else(|| "shroud%d".into()),
            real_interface_name,
            reuse_fds,
            num_workers,
            machine_id,
            keypair,
            requested_ip: cli.private_ip.or(file.private_ip),
            private_ip: None,
            subnet: NetworkConfig::default().network,
            public_ipv4,
            public_ipv6,
            listen_address: cli
                .listen_address
                .or(file.listen_address)
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            listen_port: cli.listen_port.or(file.listen_port).unwrap_or(1099),
            prefix: cli.prefix.or(file.prefix).unwrap_or_else(|| "shroud".into()),
            data_dir,
            pid_file: cli
                .pid_file
                .or(file.pid_file)
                .unwrap_or_else(|| PathBuf::from("/var/run/shroud.pid")),
            stats_window: cli
                .stats_window
                .or(file_duration(file.stats_window)?)
                .unwrap_or(Duration::from_secs(10)),
            stats_address: cli
                .stats_address
                .or(file.stats_address)
                .unwrap_or(Ipv4Addr::UNSPECIFIED),
            stats_port: cli.stats_port.or(file.stats_port).unwrap_or(1100),
            sync_interval: cli
                .sync_interval
                .or(file_duration(file.sync_interval)?)
                .unwrap_or(Duration::from_secs(60)),
            refresh_interval: cli
                .refresh_interval
                .or(file_duration(file.refresh_interval)?)
                .unwrap_or(Duration::from_secs(120)),
            datastore: cli
                .datastore
                .or(file.datastore)
                .unwrap_or_else(|| "memory".into()),
            endpoints,
            plugins,
            gateway: cli.gateway || file.gateway.unwrap_or(false),
            debug: cli.debug,
        })
    }

    /// Write the pid file for process supervision
    pub fn write_pid_file(&self) -> Result<()> {
        write_pid(&self.pid_file, std::process::id())
    }

    /// Path the leased private address is persisted at, so restarts reuse it
    pub fn private_ip_path(&self) -> PathBuf {
        self.data_dir.join("private-ip")
    }
}

/// Write `pid` to the given pid file
pub fn write_pid(path: &std::path::Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, pid.to_string())?;
    Ok(())
}

fn load_or_create_machine_id(data_dir: &std::path::Path) -> Result<String> {
    let path = data_dir.join("machine-id");
    if path.exists() {
        let id = std::fs::read_to_string(&path)?.trim().to_string();
        if id.len() != 64 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Config(format!(
                "corrupt machine-id at {}",
                path.display()
            )));
        }
        return Ok(id);
    }

    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let id = hex::encode(raw);
    std::fs::write(&path, &id)?;
    info!("Generated machine id {}", &id[..16]);
    Ok(id)
}

/// Find the local address the default route would use, by asking the kernel
/// which source address reaches a well-known public IP. No packet is sent.
fn detect_public_ipv4() -> Result<Ipv4Addr> {
    let probe = UdpSocket::bind("0.0.0.0:0")?;
    probe.connect("8.8.8.8:53")?;
    match probe.local_addr()?.ip() {
        std::net::IpAddr::V4(ip) => Ok(ip),
        std::net::IpAddr::V6(_) => Err(Error::Config(
            "could not detect a public IPv4 address; pass --public-ip".into(),
        )),
    }
}

/// The overlay definition stored under `{prefix}/config/network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    /// The overlay subnet private addresses are drawn from
    pub network: Ipv4Net,
    /// How long a node's lease lives between refreshes
    pub lease_time: Duration,
}

#[derive(Serialize, Deserialize)]
struct NetworkConfigWire {
    network: String,
    #[serde(rename = "leaseTime")]
    lease_time: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: "10.10.0.0/16".parse().expect("static default subnet"),
            lease_time: Duration::from_secs(48 * 3600),
        }
    }
}

impl NetworkConfig {
    /// Serialize to the store's JSON form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&NetworkConfigWire {
            network: self.network.to_string(),
            lease_time: format_duration(self.lease_time),
        })?)
    }

    /// Parse from the store's JSON form
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let wire: NetworkConfigWire = serde_json::from_slice(data)?;
        Ok(Self {
            network: wire
                .network
                .parse()
                .map_err(|e| Error::Config(format!("invalid network CIDR: {}", e)))?,
            lease_time: parse_duration(&wire.lease_time)?,
        })
    }
}

/// Parse a compact duration string: `48h`, `2m30s`, `90s`, `1h15m`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty duration".into()));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut saw_unit = false;
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(Error::Config(format!("invalid duration '{}'", s)));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::Config(format!("invalid duration '{}'", s)))?;
        digits.clear();
        saw_unit = true;
        total += match c {
            'h' => Duration::from_secs(value * 3600),
            'm' => Duration::from_secs(value * 60),
            's' => Duration::from_secs(value),
            _ => return Err(Error::Config(format!("invalid duration unit '{}'", c))),
        };
    }
    if !digits.is_empty() || !saw_unit {
        return Err(Error::Config(format!(
            "duration '{}' is missing a unit (h, m, or s)",
            s
        )));
    }
    Ok(total)
}

/// Format a duration in the same compact grammar `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    let mut out = String::new();
    let hours = secs / 3600;
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
        secs %= 3600;
    }
    let minutes = secs / 60;
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
        secs %= 60;
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{}s", secs));
    }
    out
}
