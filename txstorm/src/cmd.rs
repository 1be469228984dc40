use core::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::{
    cfg::{BroadcastMode, Config, EndpointSelectMethod, DEFAULT_CLIENT_FACTORY},
    error::ConfigError,
};

/// Distributed load generator for transaction broadcast endpoints.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
#[command(flatten_help = true)]
pub struct Cmd {
    #[clap(subcommand)]
    pub mode: ModeCmd,
    /// Be verbose in terms of logging.
    #[clap(short, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Parser)]
pub enum ModeCmd {
    /// Run the load test from this machine only.
    Standalone(StandaloneCmd),
    /// Orchestrate a load test across several workers.
    ///
    /// Waits for the expected number of workers, broadcasts the test
    /// configuration, collects their statistics and writes the aggregate
    /// report.
    Coordinator(CoordinatorCmd),
    /// Generate load on behalf of a coordinator.
    Worker(WorkerCmd),
}

#[derive(Debug, Clone, Parser)]
pub struct StandaloneCmd {
    #[clap(flatten)]
    pub load: LoadCmd,
}

#[derive(Debug, Clone, Parser)]
pub struct CoordinatorCmd {
    #[clap(flatten)]
    pub load: LoadCmd,
    /// Address to accept worker connections on.
    #[clap(long, default_value = "0.0.0.0:26670")]
    pub bind: SocketAddr,
    /// Number of workers to wait for before starting the test.
    #[clap(long, default_value_t = 2)]
    pub expect_workers: usize,
    /// Seconds to wait for all workers to connect.
    #[clap(long, default_value_t = 60)]
    pub connect_timeout: u64,
    /// Seconds to wait for workers to disconnect after completion.
    #[clap(long, default_value_t = 60)]
    pub shutdown_wait: u64,
    /// Address to serve Prometheus metrics on.
    #[clap(long)]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Parser)]
pub struct WorkerCmd {
    /// Coordinator address, "host:port".
    #[clap(long, required = true)]
    pub coordinator: String,
    /// Seconds to keep trying to reach the coordinator.
    #[clap(long, default_value_t = 60)]
    pub connect_timeout: u64,
    /// Milliseconds between stats reports.
    #[clap(long, default_value_t = 1000)]
    pub report_interval: u64,
    /// Seconds to wait for the coordinator's final acknowledgement.
    #[clap(long, default_value_t = 10)]
    pub ack_timeout: u64,
}

/// Workload settings shared by the standalone and coordinator modes.
#[derive(Debug, Clone, Parser)]
pub struct LoadCmd {
    /// Path to a YAML file with the whole test configuration.
    ///
    /// When given, the remaining workload flags are ignored.
    #[clap(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Client factory generating transactions.
    #[clap(long, default_value = DEFAULT_CLIENT_FACTORY)]
    pub client_factory: String,
    /// Number of connections to open to each endpoint, per worker.
    #[clap(short, long, default_value_t = 1)]
    pub connections: usize,
    /// Maximum duration of the test, in seconds.
    #[clap(short = 'T', long, default_value_t = 60)]
    pub time: u64,
    /// Maximum number of transactions to send per connection.
    #[clap(short = 'N', long)]
    pub count: Option<u64>,
    /// Transactions per second, per connection.
    #[clap(short, long, default_value_t = 1000)]
    pub rate: u64,
    /// Size of each transaction, in bytes.
    #[clap(short, long, default_value_t = 250)]
    pub size: usize,
    /// How to wait for transaction acknowledgement.
    #[clap(long, value_enum, default_value_t = BroadcastMode::Async)]
    pub broadcast_mode: BroadcastMode,
    /// Comma-separated list of endpoints.
    #[clap(long, value_delimiter = ',')]
    pub endpoints: Vec<String>,
    /// How to build the endpoint set.
    #[clap(long, value_enum, default_value_t = EndpointSelectMethod::Supplied)]
    pub endpoint_select_method: EndpointSelectMethod,
    /// Number of usable endpoints discovery must find.
    #[clap(long, default_value_t = 0)]
    pub expect_peers: usize,
    /// Maximum number of endpoints to use, zero means unlimited.
    #[clap(long, default_value_t = 0)]
    pub max_endpoints: usize,
    /// Minimum number of peers a discovered endpoint must be connected to.
    #[clap(long, default_value_t = 0)]
    pub min_connectivity: usize,
    /// Seconds to wait for peer discovery.
    #[clap(long, default_value_t = 600)]
    pub peer_connect_timeout: u64,
    /// Seconds to wait for each connect and send.
    #[clap(long, default_value_t = 10)]
    pub send_timeout: u64,
    /// Where to write aggregate statistics.
    #[clap(long, value_name = "PATH")]
    pub stats_output: Option<PathBuf>,
    /// Do not trap interrupt signals.
    #[clap(long)]
    pub no_trap_interrupts: bool,
}

impl TryFrom<LoadCmd> for Config {
    type Error = ConfigError;

    fn try_from(cmd: LoadCmd) -> Result<Self, Self::Error> {
        let LoadCmd {
            config,
            client_factory,
            connections,
            time,
            count,
            rate,
            size,
            broadcast_mode,
            endpoints,
            endpoint_select_method,
            expect_peers,
            max_endpoints,
            min_connectivity,
            peer_connect_timeout,
            send_timeout,
            stats_output,
            no_trap_interrupts,
        } = cmd;

        if let Some(path) = config {
            return Config::load(path);
        }

        let m = Self {
            client_factory,
            connections,
            time,
            count,
            rate,
            size,
            broadcast_mode,
            endpoints,
            endpoint_select_method,
            expect_peers,
            max_endpoints,
            min_connectivity,
            peer_connect_timeout,
            send_timeout,
            stats_output,
            no_trap_interrupts,
        };
        m.validate()?;

        Ok(m)
    }
}
