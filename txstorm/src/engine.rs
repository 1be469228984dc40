//! Per-connection load engine.

use core::{
    fmt::{self, Display, Formatter},
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::{self, Instant};

pub use self::rpc::{RpcConnector, RpcDiscover, RpcTransport};
use self::{coro::ShapedCoroWorker, runtime::TaskPool};
use crate::{
    cfg::{BroadcastMode, Config},
    client::Client,
    endpoint::{Endpoint, EndpointPool},
    error::ConnectionError,
    shaper::Shaper,
    stat::{ConnectionSnapshot, ConnectionStat, Report},
};

mod coro;
mod io;
mod rpc;
mod runtime;

/// Opens connections to target endpoints.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn connect(&self, endpoint: &Endpoint) -> impl Future<Output = Result<Self::Transport, ConnectionError>> + Send;
}

/// An established connection to a target endpoint.
pub trait Transport: Send + 'static {
    /// Submits a single request, waiting for acknowledgement as required by
    /// the given mode.
    fn send(&mut self, tx: Bytes, mode: BroadcastMode) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Task unit.
trait Task {
    /// Executes this task once.
    fn execute(&mut self) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// Generates a transaction and submits it.
struct SendTask<T> {
    client: Box<dyn Client>,
    transport: T,
    mode: BroadcastMode,
    timeout: time::Duration,
    stat: Arc<ConnectionStat>,
}

impl<T> Task for SendTask<T>
where
    T: Transport,
{
    async fn execute(&mut self) -> Result<(), ConnectionError> {
        let tx = self.client.generate_tx()?;
        let len = tx.len() as u64;

        match time::timeout(self.timeout, self.transport.send(tx, self.mode)).await {
            Ok(Ok(())) => {
                self.stat.on_requests(1);
                self.stat.on_send(len);
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(..) => Err(ConnectionError::Timeout(self.timeout)),
        }
    }
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The run was cancelled.
    Cancelled,
    /// The configured duration elapsed.
    Elapsed,
    /// The per-connection request count was reached.
    CountReached,
    /// The connection failed.
    Failed(ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Sending,
    Draining,
    Stopped,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        let v = match self {
            Self::Connecting => "connecting",
            Self::Sending => "sending",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        fmt.write_str(v)
    }
}

/// Drives a single connection through
/// `Connecting → Sending → Draining → Stopped`.
pub struct Engine<C> {
    idx: usize,
    cfg: Arc<Config>,
    connector: Arc<C>,
    endpoint: Endpoint,
    stat: Arc<ConnectionStat>,
    is_running: Arc<AtomicBool>,
    deadline: Instant,
    state: State,
}

impl<C> Engine<C>
where
    C: Connector,
{
    pub fn new(
        idx: usize,
        cfg: Arc<Config>,
        connector: Arc<C>,
        endpoint: Endpoint,
        stat: Arc<ConnectionStat>,
        is_running: Arc<AtomicBool>,
        deadline: Instant,
    ) -> Self {
        Self {
            idx,
            cfg,
            connector,
            endpoint,
            stat,
            is_running,
            deadline,
            state: State::Connecting,
        }
    }

    /// Runs this engine until it stops, generating requests with the given
    /// client.
    pub async fn run(mut self, client: Box<dyn Client>) -> Exit {
        log::debug!("connection #{} to {}: {}", self.idx, self.endpoint, self.state);

        let timeout = self.cfg.send_timeout();
        let transport = match time::timeout(timeout, self.connector.connect(&self.endpoint)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => return self.stop(Exit::Failed(err)),
            Err(..) => return self.stop(Exit::Failed(ConnectionError::Timeout(timeout))),
        };

        self.transition(State::Sending);
        let now = Instant::now();
        self.stat.on_started(now);

        let task = SendTask {
            client,
            transport,
            mode: self.cfg.broadcast_mode,
            timeout,
            stat: self.stat.clone(),
        };
        let shaper = Shaper::new(self.cfg.rate, now);
        let worker = ShapedCoroWorker::new(task, shaper, self.is_running.clone(), self.deadline, self.cfg.count);
        // Sends are awaited one at a time, so nothing is in flight once the
        // worker returns and drops the transport.
        let exit = worker.run().await;

        self.transition(State::Draining);
        self.stop(exit)
    }

    fn stop(mut self, exit: Exit) -> Exit {
        if let Exit::Failed(err) = &exit {
            self.stat.on_error(err.clone());
            if self.state != State::Draining {
                self.transition(State::Draining);
            }
        }
        self.stat.on_finished(Instant::now());
        self.transition(State::Stopped);

        exit
    }

    #[inline]
    fn transition(&mut self, state: State) {
        log::debug!("connection #{} to {}: {} -> {}", self.idx, self.endpoint, self.state, state);
        self.state = state;
    }
}

/// Set of engines of a single worker, one per connection.
#[derive(Debug)]
pub struct EngineGroup {
    stats: Vec<Arc<ConnectionStat>>,
    is_running: Arc<AtomicBool>,
    tasks: TaskPool<Exit>,
}

impl EngineGroup {
    /// Spawns one engine per client.
    ///
    /// Connection `i` targets `pool.select(i)`.
    pub fn spawn<C>(cfg: Arc<Config>, connector: Arc<C>, pool: &EndpointPool, clients: Vec<Box<dyn Client>>) -> Self
    where
        C: Connector,
    {
        let is_running = Arc::new(AtomicBool::new(true));
        let deadline = Instant::now() + cfg.duration();
        let stats: Vec<_> = (0..clients.len()).map(|_| Arc::new(ConnectionStat::default())).collect();

        log::info!(
            "starting {} connection(s) at {} tx/s each for up to {}s",
            clients.len(),
            cfg.rate,
            cfg.time
        );

        let tasks = clients
            .into_iter()
            .enumerate()
            .map(|(idx, client)| {
                let engine = Engine::new(
                    idx,
                    cfg.clone(),
                    connector.clone(),
                    pool.select(idx).clone(),
                    stats[idx].clone(),
                    is_running.clone(),
                    deadline,
                );

                engine.run(client)
            })
            .collect();

        Self { stats, is_running, tasks }
    }

    /// Asks all engines to stop at their next tick.
    #[inline]
    pub fn cancel(&self) {
        self.is_running.store(false, Ordering::Relaxed);
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.stats.iter().map(|v| v.snapshot()).collect()
    }

    /// Sums current connection stats.
    pub fn report(&self, completed: bool) -> Report {
        Report::from_snapshots(&self.snapshots(), completed)
    }

    /// Waits for the next engine to stop.
    ///
    /// Returns `None` when all engines are stopped.
    #[inline]
    pub async fn join_next(&mut self) -> Option<Exit> {
        self.tasks.join_next().await
    }

    /// Waits for all engines to stop and returns the final snapshots.
    pub async fn join(mut self) -> Vec<ConnectionSnapshot> {
        for exit in self.tasks.join_all().await {
            log::debug!("connection stopped: {exit:?}");
        }

        self.snapshots()
    }

    #[inline]
    pub fn num_running(&self) -> usize {
        self.tasks.len()
    }
}
