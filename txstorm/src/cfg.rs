use core::{
    fmt::{self, Display, Formatter},
    net::SocketAddr,
    time::Duration,
};
use std::{fs, path::Path, path::PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{
    cmd::{CoordinatorCmd, ModeCmd, WorkerCmd},
    error::ConfigError,
};

/// Name of the built-in key/value client factory.
pub const DEFAULT_CLIENT_FACTORY: &str = "kvstore";
/// Upper bound for durations and timeouts, in seconds.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// What the engine waits for after submitting a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    /// Fire-and-forget.
    #[default]
    Async,
    /// Wait until the endpoint accepts the transaction.
    Sync,
    /// Wait until the transaction is committed.
    Commit,
}

impl BroadcastMode {
    /// Returns the RPC method name for this mode.
    #[inline]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Async => "broadcast_tx_async",
            Self::Sync => "broadcast_tx_sync",
            Self::Commit => "broadcast_tx_commit",
        }
    }
}

impl Display for BroadcastMode {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        fmt.write_str(self.method())
    }
}

/// How the set of target endpoints is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EndpointSelectMethod {
    /// Exactly the supplied endpoints.
    #[default]
    Supplied,
    /// Only peers discovered through the supplied endpoints.
    Discovered,
    /// Supplied endpoints together with the discovered ones.
    Any,
}

/// Immutable test parameters shared by all workers.
///
/// This is exactly what the coordinator broadcasts to its workers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Name of the client factory generating transactions.
    pub client_factory: String,
    /// Number of connections per worker.
    pub connections: usize,
    /// Maximum duration of the run, in seconds.
    pub time: u64,
    /// Maximum number of transactions sent per connection.
    ///
    /// If none given the run is bounded by time only.
    pub count: Option<u64>,
    /// Transactions per second, per connection.
    pub rate: u64,
    /// Size of each transaction, in bytes.
    pub size: usize,
    /// Acknowledgement mode.
    pub broadcast_mode: BroadcastMode,
    /// Supplied target endpoints.
    pub endpoints: Vec<String>,
    pub endpoint_select_method: EndpointSelectMethod,
    /// Minimum number of usable endpoints that discovery must yield.
    pub expect_peers: usize,
    /// Upper bound for the number of endpoints used, zero means unlimited.
    pub max_endpoints: usize,
    /// Minimum number of peers a discovered endpoint must itself have.
    pub min_connectivity: usize,
    /// Bound on peer discovery, in seconds.
    pub peer_connect_timeout: u64,
    /// Bound on each connect and send, in seconds.
    pub send_timeout: u64,
    /// Where to write aggregate statistics.
    pub stats_output: Option<PathBuf>,
    /// Do not install an interrupt handler.
    pub no_trap_interrupts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_factory: DEFAULT_CLIENT_FACTORY.to_string(),
            connections: 1,
            time: 60,
            count: None,
            rate: 1000,
            size: 250,
            broadcast_mode: BroadcastMode::default(),
            endpoints: Vec::new(),
            endpoint_select_method: EndpointSelectMethod::default(),
            expect_peers: 0,
            max_endpoints: 0,
            min_connectivity: 0,
            peer_connect_timeout: 600,
            send_timeout: 10,
            stats_output: None,
            no_trap_interrupts: false,
        }
    }
}

impl Config {
    /// Loads the config from the given YAML file and validates it.
    pub fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        log::debug!("loading config from '{}' ...", path.as_ref().display());

        let data = fs::read(&path).map_err(|err| ConfigError::Load(format!("{}: {err}", path.as_ref().display())))?;
        let cfg: Config = serde_yaml::from_slice(&data).map_err(|err| ConfigError::Load(err.to_string()))?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Checks generator-independent structural constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if self.time == 0 {
            return Err(ConfigError::ZeroTime);
        }
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        check_secs("time", self.time)?;
        check_secs("send_timeout", self.send_timeout)?;
        check_secs("peer_connect_timeout", self.peer_connect_timeout)?;

        Ok(())
    }

    #[inline]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.time)
    }

    #[inline]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout)
    }

    #[inline]
    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout)
    }

    /// Returns the maximum number of transactions a single connection may
    /// send during the run.
    #[inline]
    pub fn max_txs_per_connection(&self) -> u64 {
        match self.count {
            Some(count) => count,
            None => self.rate.saturating_mul(self.time),
        }
    }
}

/// Coordinator-only settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address to accept worker connections on.
    pub bind_addr: SocketAddr,
    /// Number of workers to wait for before starting.
    pub expect_workers: usize,
    /// Bound on waiting for all workers, in seconds.
    pub worker_connect_timeout: u64,
    /// Grace period for workers to disconnect after completion, in seconds.
    pub shutdown_wait: u64,
    /// Address to serve Prometheus metrics on.
    pub metrics_addr: Option<SocketAddr>,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expect_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        check_secs("worker_connect_timeout", self.worker_connect_timeout)?;
        check_secs("shutdown_wait", self.shutdown_wait)?;

        Ok(())
    }

    #[inline]
    pub fn worker_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_connect_timeout)
    }

    #[inline]
    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait)
    }
}

impl TryFrom<CoordinatorCmd> for CoordinatorConfig {
    type Error = ConfigError;

    fn try_from(cmd: CoordinatorCmd) -> Result<Self, Self::Error> {
        let CoordinatorCmd {
            bind,
            expect_workers,
            connect_timeout,
            shutdown_wait,
            metrics_addr,
            ..
        } = cmd;

        let m = Self {
            bind_addr: bind,
            expect_workers,
            worker_connect_timeout: connect_timeout,
            shutdown_wait,
            metrics_addr,
        };
        m.validate()?;

        Ok(m)
    }
}

/// Worker-only settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator control address, "host:port".
    pub coordinator_addr: String,
    /// Bound on reaching the coordinator.
    pub coordinator_connect_timeout: Duration,
    /// Interval between stats reports.
    pub report_interval: Duration,
    /// Bound on waiting for the coordinator's final acknowledgement.
    pub ack_timeout: Duration,
}

impl WorkerConfig {
    pub fn new(coordinator_addr: impl Into<String>) -> Self {
        Self {
            coordinator_addr: coordinator_addr.into(),
            coordinator_connect_timeout: Duration::from_secs(60),
            report_interval: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

impl TryFrom<WorkerCmd> for WorkerConfig {
    type Error = ConfigError;

    fn try_from(cmd: WorkerCmd) -> Result<Self, Self::Error> {
        let WorkerCmd {
            coordinator,
            connect_timeout,
            report_interval,
            ack_timeout,
        } = cmd;

        check_secs("connect_timeout", connect_timeout)?;
        check_secs("ack_timeout", ack_timeout)?;
        if report_interval == 0 {
            return Err(ConfigError::ZeroReportInterval);
        }
        check_secs("report_interval", report_interval / 1000)?;

        let m = Self {
            coordinator_addr: coordinator,
            coordinator_connect_timeout: Duration::from_secs(connect_timeout),
            report_interval: Duration::from_millis(report_interval),
            ack_timeout: Duration::from_secs(ack_timeout),
        };

        Ok(m)
    }
}

#[inline]
fn check_secs(name: &'static str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_DURATION_SECS {
        return Err(ConfigError::TooLong { name, max: MAX_DURATION_SECS });
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub enum ModeConfig {
    Standalone(Config),
    Coordinator(Config, CoordinatorConfig),
    Worker(WorkerConfig),
}

impl TryFrom<ModeCmd> for ModeConfig {
    type Error = ConfigError;

    fn try_from(v: ModeCmd) -> Result<Self, Self::Error> {
        let m = match v {
            ModeCmd::Standalone(v) => Self::Standalone(v.load.try_into()?),
            ModeCmd::Coordinator(v) => {
                let cfg = v.load.clone().try_into()?;
                Self::Coordinator(cfg, v.try_into()?)
            }
            ModeCmd::Worker(v) => Self::Worker(v.try_into()?),
        };

        Ok(m)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn cfg() -> Config {
        Config {
            endpoints: vec!["127.0.0.1:26657".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_defaults() {
        assert!(cfg().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let cfg = Config { rate: 0, ..cfg() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroRate)));
    }

    #[test]
    fn test_validate_rejects_zero_connections() {
        let cfg = Config { connections: 0, ..cfg() };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroConnections)));
    }

    #[test]
    fn test_validate_rejects_missing_endpoints() {
        let cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn test_validate_rejects_huge_durations() {
        let cfg = Config { time: u64::MAX, ..cfg() };
        assert!(matches!(cfg.validate(), Err(ConfigError::TooLong { name: "time", .. })));

        let cfg = Config {
            send_timeout: MAX_DURATION_SECS + 1,
            ..self::cfg()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::TooLong { name: "send_timeout", .. })));

        let cfg = Config {
            time: MAX_DURATION_SECS,
            send_timeout: MAX_DURATION_SECS,
            ..self::cfg()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_coordinator_validate() {
        let coord = CoordinatorConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            expect_workers: 1,
            worker_connect_timeout: 60,
            shutdown_wait: u64::MAX,
            metrics_addr: None,
        };
        assert!(matches!(coord.validate(), Err(ConfigError::TooLong { name: "shutdown_wait", .. })));

        let coord = CoordinatorConfig {
            shutdown_wait: 60,
            expect_workers: 0,
            ..coord
        };
        assert!(matches!(coord.validate(), Err(ConfigError::ZeroWorkers)));
    }

    #[test]
    fn test_max_txs_per_connection() {
        let cfg = Config { rate: 100, time: 5, ..cfg() };
        assert_eq!(500, cfg.max_txs_per_connection());

        let cfg = Config { count: Some(50), ..cfg };
        assert_eq!(50, cfg.max_txs_per_connection());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connections: 4\nrate: 50\nsize: 128\nbroadcast_mode: commit\nendpoints: [\"http://10.0.0.1:26657\"]\nendpoint_select_method: any"
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(4, cfg.connections);
        assert_eq!(50, cfg.rate);
        assert_eq!(128, cfg.size);
        assert_eq!(BroadcastMode::Commit, cfg.broadcast_mode);
        assert_eq!(EndpointSelectMethod::Any, cfg.endpoint_select_method);
        assert_eq!(DEFAULT_CLIENT_FACTORY, cfg.client_factory);
    }

    #[test]
    fn test_load_yaml_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rate: 0\nendpoints: [\"10.0.0.1\"]").unwrap();

        assert!(matches!(Config::load(file.path()), Err(ConfigError::ZeroRate)));
    }
}
