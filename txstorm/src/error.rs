use core::time::Duration;
use std::io;

use crate::stat::WorkerId;

/// Top-level error returned by the coordinator, worker and standalone
/// executors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("connectivity failure: {0}")]
    Connectivity(#[from] ConnectivityError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors detected before any network activity starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("transaction size {size} is too small for given parameters (should be at least {min} bytes)")]
    TooSmall { size: usize, min: usize },
    #[error("cannot cater for maximum tx count of {0} (too many unique transactions)")]
    TooManyTxs(u64),
    #[error("cannot calculate an appropriate maximum number of transactions per connection (got 0)")]
    ZeroTxs,
    #[error("alphabet of {0} symbols cannot encode unique keys")]
    InvalidAlphabet(u64),
    #[error("rate must be greater than zero")]
    ZeroRate,
    #[error("number of connections must be greater than zero")]
    ZeroConnections,
    #[error("test duration must be greater than zero")]
    ZeroTime,
    #[error("expected number of workers must be greater than zero")]
    ZeroWorkers,
    #[error("report interval must be greater than zero")]
    ZeroReportInterval,
    #[error("{name} must not exceed {max} seconds")]
    TooLong { name: &'static str, max: u64 },
    #[error("no endpoints supplied")]
    NoEndpoints,
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("client factory '{0}' is already registered")]
    DuplicateFactory(String),
    #[error("unknown client factory '{0}'")]
    UnknownFactory(String),
    #[error("worker {worker} rejected the configuration: {reason}")]
    Rejected { worker: WorkerId, reason: String },
    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Errors that make the whole run impossible.
#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("insufficient endpoints: got {got}, expected at least {expected}")]
    InsufficientEndpoints { got: usize, expected: usize },
    #[error("timed out waiting for workers to connect: got {got}, expected {expected}")]
    WorkerConnectTimeout { got: usize, expected: usize },
    #[error("timed out connecting to the coordinator at {0}")]
    CoordinatorConnectTimeout(String),
    #[error("lost control link to the coordinator")]
    ControlLinkLost,
    #[error("all {failed} workers failed before completing the run")]
    AllWorkersFailed { failed: usize },
}

/// Single connection failure.
///
/// Recorded in the connection's stats, never fatal to the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("endpoint responded with HTTP status {0}")]
    Status(u16),
    #[error("endpoint rejected transaction: {0}")]
    Rpc(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Request generation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("unique key space of {capacity} transactions is exhausted")]
    Exhausted { capacity: u64 },
}

/// Coordinator/worker control protocol failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: String },
    #[error("message from unregistered worker {0}")]
    Unregistered(WorkerId),
    #[error(
        "non-monotonic report from worker {worker}: {prev_requests} requests/{prev_bytes} bytes, then \
         {requests} requests/{bytes} bytes"
    )]
    NonMonotonic {
        worker: WorkerId,
        prev_requests: u64,
        prev_bytes: u64,
        requests: u64,
        bytes: u64,
    },
    #[error("worker {0} disconnected without a final report")]
    Disconnected(WorkerId),
    #[error("worker {0} did not acknowledge the configuration in time")]
    AckTimeout(WorkerId),
    #[error("run aborted by the coordinator: {0}")]
    Aborted(String),
}
