//! Coordinator side of the orchestration protocol.

use core::{
    fmt::{self, Display, Formatter},
    future::Future,
    net::SocketAddr,
    pin::pin,
    time::Duration,
};
use std::{collections::BTreeSet, sync::Arc};

use rand::{distr::Alphanumeric, Rng};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc::{self, Receiver, Sender},
    task::{JoinHandle, JoinSet},
    time::{self, Instant},
};

use crate::{
    api::{MetricsState, Server},
    cfg::{Config, CoordinatorConfig, EndpointSelectMethod},
    client::Registry,
    error::{ConfigError, ConnectivityError, Error, ProtocolError},
    proto::{self, Message, Reader, Writer},
    runtime,
    stat::{AggregateStats, Collector, LiveStat, WorkerId, WorkerStatus},
};

/// Length of the generated run identifier.
const RUN_ID_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    WaitingForWorkers,
    Configuring,
    Running,
    ShuttingDown,
    Done,
    Failed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        let v = match self {
            Self::WaitingForWorkers => "waiting for workers",
            Self::Configuring => "configuring",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        fmt.write_str(v)
    }
}

/// Control link to a single worker.
#[derive(Debug)]
struct Link {
    id: WorkerId,
    addr: SocketAddr,
    rd: Reader<OwnedReadHalf>,
    wr: Writer<OwnedWriteHalf>,
}

#[derive(Debug)]
enum Event {
    Message(WorkerId, Message),
    /// The link was closed, possibly with an error.
    Closed(WorkerId, Option<ProtocolError>),
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Orchestrates a distributed run.
#[derive(Debug)]
pub struct Coordinator {
    cfg: Config,
    coord: CoordinatorConfig,
    run_id: String,
    collector: Collector,
    state: State,
}

impl Coordinator {
    /// Constructs a new coordinator.
    ///
    /// The config is validated against the selected client factory, so that
    /// an invalid one is rejected before any worker connects.
    pub fn new(cfg: Config, coord: CoordinatorConfig, registry: &Registry) -> Result<Self, Error> {
        cfg.validate()?;
        coord.validate()?;
        registry.lookup(&cfg.client_factory)?.validate_config(&cfg)?;

        let run_id = rand::rng()
            .sample_iter(Alphanumeric)
            .take(RUN_ID_LEN)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();

        let m = Self {
            cfg,
            coord,
            run_id,
            collector: Collector::new(),
            state: State::WaitingForWorkers,
        };

        Ok(m)
    }

    #[inline]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns live run totals.
    #[inline]
    pub fn stat(&self) -> Arc<LiveStat> {
        self.collector.live()
    }

    /// Binds the configured address and runs the test.
    pub async fn run(self) -> Result<AggregateStats, Error> {
        let listener = TcpListener::bind(self.coord.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Runs the test, accepting workers on the given listener.
    pub async fn run_on(self, listener: TcpListener) -> Result<AggregateStats, Error> {
        let trap = !self.cfg.no_trap_interrupts;
        self.run_until(listener, runtime::interrupt(trap)).await
    }

    /// Runs the test, stopping all workers once `interrupt` completes.
    pub async fn run_until<F>(mut self, listener: TcpListener, interrupt: F) -> Result<AggregateStats, Error>
    where
        F: Future<Output = ()>,
    {
        log::info!(
            "coordinator for run '{}' listening on {}, expecting {} worker(s)",
            self.run_id,
            listener.local_addr()?,
            self.coord.expect_workers
        );

        let _metrics = self.start_metrics().await?;

        match self.execute(listener, interrupt).await {
            Ok(stats) => {
                self.transition(State::Done);
                Ok(stats)
            }
            Err(err) => {
                self.transition(State::Failed);
                Err(err)
            }
        }
    }

    async fn execute<F>(&mut self, listener: TcpListener, interrupt: F) -> Result<AggregateStats, Error>
    where
        F: Future<Output = ()>,
    {
        let mut links = self.accept_workers(&listener).await?;
        drop(listener);

        self.transition(State::Configuring);
        self.configure(&mut links).await?;

        self.transition(State::Running);
        let (mut writers, mut events, mut readers) = self.start(links).await;
        let mut connected: BTreeSet<WorkerId> = (0..writers.len()).collect();
        self.aggregate(&mut writers, &mut events, &mut connected, interrupt).await;

        self.transition(State::ShuttingDown);
        self.shutdown(&mut events, &mut connected).await;
        drop(writers);
        readers.abort_all();

        if self.collector.num_completed() == 0 {
            return Err(ConnectivityError::AllWorkersFailed {
                failed: self.coord.expect_workers,
            }
            .into());
        }

        let stats = self.collector.finalize(Instant::now());
        log::info!("run '{}' finished: {stats}", self.run_id);
        if let Some(path) = &self.cfg.stats_output {
            stats.write_file(path)?;
        }

        Ok(stats)
    }

    async fn start_metrics(&self) -> Result<Option<AbortOnDrop<()>>, Error> {
        let Some(addr) = self.coord.metrics_addr else {
            return Ok(None);
        };

        let state = Arc::new(MetricsState::new(self.run_id.clone(), self.collector.live()));
        let server = Server::bind(addr, state).await?;
        let task = tokio::spawn(async move {
            if let Err(err) = server.run().await {
                log::error!("metrics server failed: {err}");
            }
        });

        Ok(Some(AbortOnDrop(task)))
    }

    /// Accepts workers until the expected number announced themselves.
    ///
    /// Handshakes run concurrently, so a peer that never says hello does not
    /// hold up the others. Ids are assigned in handshake completion order.
    async fn accept_workers(&self, listener: &TcpListener) -> Result<Vec<Link>, Error> {
        let expected = self.coord.expect_workers;
        let deadline = Instant::now() + self.coord.worker_connect_timeout();
        let mut links = Vec::with_capacity(expected);
        let mut handshakes = JoinSet::new();

        while links.len() < expected {
            tokio::select! {
                rc = listener.accept() => match rc {
                    Ok((stream, addr)) => {
                        log::debug!("accepted connection from {addr}");
                        handshakes.spawn(Self::handshake(stream, addr, deadline));
                    }
                    Err(err) => log::warn!("failed to accept worker: {err}"),
                },
                Some(rc) = handshakes.join_next() => {
                    let Ok(Some((addr, rd, mut wr))) = rc else {
                        continue;
                    };

                    let id = links.len();
                    if let Err(err) = wr.send(&Message::Hello { id: Some(id) }).await {
                        log::warn!("dropping connection from {addr}: {err}");
                        continue;
                    }

                    log::info!("worker {id} connected from {addr} ({}/{expected})", id + 1);
                    links.push(Link { id, addr, rd, wr });
                }
                _ = time::sleep_until(deadline) => {
                    Self::abort(&mut links, "timed out waiting for workers").await;
                    return Err(ConnectivityError::WorkerConnectTimeout {
                        got: links.len(),
                        expected,
                    }
                    .into());
                }
            }
        }

        if !handshakes.is_empty() {
            log::debug!("dropping {} pending connection(s)", handshakes.len());
        }

        Ok(links)
    }

    /// Waits for the first message of a fresh connection, which must be a
    /// hello.
    async fn handshake(
        stream: TcpStream,
        addr: SocketAddr,
        deadline: Instant,
    ) -> Option<(SocketAddr, Reader<OwnedReadHalf>, Writer<OwnedWriteHalf>)> {
        let (mut rd, wr) = proto::split(stream);

        match time::timeout_at(deadline, rd.recv()).await {
            Ok(Ok(Some(Message::Hello { .. }))) => return Some((addr, rd, wr)),
            Ok(Ok(Some(msg))) => log::warn!("dropping connection from {addr}: expected hello, got {}", msg.kind()),
            Ok(Ok(None)) => log::warn!("connection from {addr} closed before hello"),
            Ok(Err(err)) => log::warn!("dropping connection from {addr}: {err}"),
            Err(..) => log::warn!("connection from {addr} sent no hello in time"),
        }

        None
    }

    /// Broadcasts the config and waits for every worker to acknowledge it.
    async fn configure(&self, links: &mut [Link]) -> Result<(), Error> {
        let msg = Message::Config { cfg: self.cfg.clone() };
        for link in links.iter_mut() {
            if let Err(err) = link.wr.send(&msg).await {
                Self::abort(links, "failed to distribute configuration").await;
                return Err(err.into());
            }
        }

        let deadline = Instant::now() + self.configure_timeout();
        for idx in 0..links.len() {
            let link = &mut links[idx];
            let (id, addr) = (link.id, link.addr);

            let err: Error = match time::timeout_at(deadline, link.rd.recv()).await {
                Ok(Ok(Some(Message::Ready))) => {
                    log::debug!("worker {id} at {addr} is ready");
                    continue;
                }
                Ok(Ok(Some(Message::Reject { reason }))) => ConfigError::Rejected { worker: id, reason }.into(),
                Ok(Ok(Some(msg))) => ProtocolError::Unexpected {
                    expected: "ready",
                    got: msg.kind().to_string(),
                }
                .into(),
                Ok(Ok(None)) => ProtocolError::Disconnected(id).into(),
                Ok(Err(err)) => err.into(),
                Err(..) => ProtocolError::AckTimeout(id).into(),
            };

            Self::abort(links, &err.to_string()).await;
            return Err(err);
        }

        Ok(())
    }

    /// Returns how long workers may take to acknowledge the config.
    ///
    /// Workers resolve their endpoints before acknowledging, so discovery
    /// extends the bound by the peer connect timeout.
    fn configure_timeout(&self) -> Duration {
        match self.cfg.endpoint_select_method {
            EndpointSelectMethod::Supplied => self.coord.worker_connect_timeout(),
            EndpointSelectMethod::Discovered | EndpointSelectMethod::Any => {
                self.coord.worker_connect_timeout() + self.cfg.peer_connect_timeout()
            }
        }
    }

    /// Releases the start barrier and spawns one reader task per worker.
    async fn start(
        &mut self,
        links: Vec<Link>,
    ) -> (Vec<Option<Writer<OwnedWriteHalf>>>, Receiver<Event>, JoinSet<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let mut writers = Vec::with_capacity(links.len());
        let mut readers = JoinSet::new();

        for link in &links {
            self.collector.register(link.id);
        }

        for Link { id, rd, mut wr, .. } in links {
            match wr.send(&Message::Start).await {
                Ok(()) => writers.push(Some(wr)),
                Err(err) => {
                    log::warn!("failed to start worker {id}: {err}");
                    writers.push(None);
                }
            }
            readers.spawn(Self::read(id, rd, tx.clone()));
        }
        log::info!("started {} worker(s)", writers.iter().flatten().count());

        (writers, rx, readers)
    }

    async fn read(id: WorkerId, mut rd: Reader<OwnedReadHalf>, tx: Sender<Event>) {
        loop {
            let ev = match rd.recv().await {
                Ok(Some(msg)) => Event::Message(id, msg),
                Ok(None) => Event::Closed(id, None),
                Err(err) => Event::Closed(id, Some(err)),
            };
            let closed = matches!(ev, Event::Closed(..));

            if tx.send(ev).await.is_err() || closed {
                break;
            }
        }
    }

    /// Merges reports until no worker is expected to report anymore.
    async fn aggregate<F>(
        &mut self,
        writers: &mut [Option<Writer<OwnedWriteHalf>>],
        events: &mut Receiver<Event>,
        connected: &mut BTreeSet<WorkerId>,
        interrupt: F,
    ) where
        F: Future<Output = ()>,
    {
        let mut interrupt = pin!(interrupt);
        let mut interrupted = false;
        let deadline = Instant::now()
            + self.cfg.duration()
            + self.cfg.send_timeout().saturating_mul(2)
            + self.coord.shutdown_wait();

        while !self.collector.is_settled() {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(ev) => self.on_event(ev, writers, connected).await,
                    None => break,
                },
                _ = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    log::warn!("interrupted, stopping workers ...");
                    for id in self.collector.active() {
                        Self::send(writers, id, &Message::Stop { reason: "interrupted".into() }).await;
                    }
                }
                _ = time::sleep_until(deadline) => {
                    for id in self.collector.active() {
                        log::warn!("worker {id} did not complete in time");
                        self.collector.lose(id);
                    }
                }
            }
        }
    }

    async fn on_event(
        &mut self,
        ev: Event,
        writers: &mut [Option<Writer<OwnedWriteHalf>>],
        connected: &mut BTreeSet<WorkerId>,
    ) {
        match ev {
            Event::Message(id, msg) if !matches!(self.collector.status(id), Some(WorkerStatus::Active)) => {
                log::debug!("ignoring {} from worker {id} in state {:?}", msg.kind(), self.collector.status(id));
            }
            Event::Message(id, Message::StatsReport { report }) => {
                match self.collector.merge(id, report, Instant::now()) {
                    Ok(true) => {
                        log::info!(
                            "worker {id} completed: {} txs, {} bytes, {} error(s)",
                            report.num_requests,
                            report.bytes_tx,
                            report.num_errors
                        );
                        Self::send(writers, id, &Message::Ack).await;
                    }
                    Ok(false) => {
                        log::debug!("worker {id}: {} txs, {} bytes", report.num_requests, report.bytes_tx);
                    }
                    Err(err) => self.on_violation(id, err, writers).await,
                }
            }
            Event::Message(id, msg) => {
                let err = ProtocolError::Unexpected {
                    expected: "stats_report",
                    got: msg.kind().to_string(),
                };
                self.on_violation(id, err, writers).await;
            }
            Event::Closed(id, err) => {
                connected.remove(&id);
                if let Some(err) = err {
                    log::warn!("control link to worker {id} failed: {err}");
                }
                if self.collector.status(id) == Some(WorkerStatus::Active) {
                    log::warn!("worker {id} disconnected before completing");
                    self.collector.lose(id);
                }
            }
        }
    }

    async fn on_violation(&mut self, id: WorkerId, err: ProtocolError, writers: &mut [Option<Writer<OwnedWriteHalf>>]) {
        log::warn!("protocol violation by worker {id}: {err}");
        self.collector.fail(id);
        Self::send(writers, id, &Message::Stop { reason: err.to_string() }).await;
    }

    /// Waits up to the grace period for workers to disconnect.
    async fn shutdown(&mut self, events: &mut Receiver<Event>, connected: &mut BTreeSet<WorkerId>) {
        let mut grace = pin!(time::sleep(self.coord.shutdown_wait()));

        while !connected.is_empty() {
            tokio::select! {
                ev = events.recv() => match ev {
                    Some(Event::Closed(id, ..)) => {
                        connected.remove(&id);
                    }
                    Some(Event::Message(id, msg)) => {
                        log::debug!("ignoring {} from worker {id} during shutdown", msg.kind());
                    }
                    None => break,
                },
                _ = &mut grace => {
                    log::warn!(
                        "{} worker(s) did not disconnect within {:?}: {:?}",
                        connected.len(),
                        self.coord.shutdown_wait(),
                        connected
                    );
                    break;
                }
            }
        }

        for id in 0..self.coord.expect_workers {
            match self.collector.status(id) {
                Some(WorkerStatus::Lost) => log::warn!("{}", ProtocolError::Disconnected(id)),
                Some(WorkerStatus::Failed) => log::warn!("worker {id} failed, its partial counts are included"),
                _ => {}
            }
        }
    }

    async fn send(writers: &mut [Option<Writer<OwnedWriteHalf>>], id: WorkerId, msg: &Message) {
        if let Some(Some(wr)) = writers.get_mut(id) {
            if let Err(err) = wr.send(msg).await {
                log::warn!("failed to send {} to worker {id}: {err}", msg.kind());
            }
        }
    }

    async fn abort(links: &mut [Link], reason: &str) {
        for link in links.iter_mut() {
            let msg = Message::Abort { reason: reason.to_string() };
            if let Err(err) = link.wr.send(&msg).await {
                log::debug!("failed to abort worker {}: {err}", link.id);
            }
        }
    }

    #[inline]
    fn transition(&mut self, state: State) {
        log::info!("coordinator: {} -> {}", self.state, state);
        self.state = state;
    }
}
