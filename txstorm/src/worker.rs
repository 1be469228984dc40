//! Worker side of the orchestration protocol.

use core::{
    fmt::{self, Display, Formatter},
    pin::pin,
    time::Duration,
};
use std::sync::Arc;

use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::{self, Instant, MissedTickBehavior},
};

use crate::{
    cfg::{Config, WorkerConfig},
    client::{Client, Registry},
    endpoint::{Discover, EndpointPool},
    engine::{Connector, EngineGroup, Exit},
    error::{ConnectivityError, Error, ProtocolError},
    proto::{self, Message, Reader, Writer},
    runtime,
    stat::{Report, WorkerId},
};

/// Pause between attempts to reach the coordinator.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Configuring,
    Ready,
    Running,
    Finishing,
    Done,
    Failed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        let v = match self {
            Self::Connecting => "connecting",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Finishing => "finishing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        fmt.write_str(v)
    }
}

/// Generates load on behalf of a coordinator.
#[derive(Debug)]
pub struct Worker<C, D> {
    cfg: WorkerConfig,
    registry: Arc<Registry>,
    connector: Arc<C>,
    discover: D,
    id: Option<WorkerId>,
    state: State,
}

impl<C, D> Worker<C, D>
where
    C: Connector,
    D: Discover,
{
    pub fn new(cfg: WorkerConfig, registry: Arc<Registry>, connector: C, discover: D) -> Self {
        Self {
            cfg,
            registry,
            connector: Arc::new(connector),
            discover,
            id: None,
            state: State::Connecting,
        }
    }

    /// Runs the worker until the coordinator acknowledges its final report.
    ///
    /// Returns the final report.
    pub async fn run(mut self) -> Result<Report, Error> {
        match self.execute().await {
            Ok(report) => {
                self.transition(State::Done);
                Ok(report)
            }
            Err(err) => {
                self.transition(State::Failed);
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> Result<Report, Error> {
        let stream = self.connect().await?;
        let (mut rd, mut wr) = proto::split(stream);

        wr.send(&Message::Hello { id: None }).await?;
        match Self::recv(&mut rd).await? {
            Message::Hello { id: Some(id) } => self.id = Some(id),
            msg => return Err(unexpected("hello", &msg).into()),
        }

        self.transition(State::Configuring);
        let cfg = match Self::recv(&mut rd).await? {
            Message::Config { cfg } => cfg,
            Message::Abort { reason } => return Err(ProtocolError::Aborted(reason).into()),
            msg => return Err(unexpected("config", &msg).into()),
        };

        let (clients, pool) = match self.prepare(&cfg).await {
            Ok(v) => v,
            Err(err) => {
                log::error!("rejecting configuration: {err}");
                wr.send(&Message::Reject { reason: err.to_string() }).await?;
                return Err(err);
            }
        };

        wr.send(&Message::Ready).await?;
        self.transition(State::Ready);
        match Self::recv(&mut rd).await? {
            Message::Start => {}
            Message::Abort { reason } => return Err(ProtocolError::Aborted(reason).into()),
            msg => return Err(unexpected("start", &msg).into()),
        }

        self.transition(State::Running);
        let group = EngineGroup::spawn(Arc::new(cfg.clone()), self.connector.clone(), &pool, clients);
        let report = self.drive(group, &cfg, &mut rd, &mut wr).await?;

        self.transition(State::Finishing);
        self.finish(report, &mut rd, &mut wr).await?;

        Ok(report)
    }

    /// Connects to the coordinator, retrying until the connect timeout.
    async fn connect(&self) -> Result<TcpStream, Error> {
        let addr = &self.cfg.coordinator_addr;
        let deadline = Instant::now() + self.cfg.coordinator_connect_timeout;

        loop {
            match time::timeout_at(deadline, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    log::info!("connected to coordinator at {addr}");
                    return Ok(stream);
                }
                Ok(Err(err)) => log::debug!("failed to connect to coordinator at {addr}: {err}"),
                Err(..) => {}
            }

            if Instant::now() >= deadline {
                return Err(ConnectivityError::CoordinatorConnectTimeout(addr.clone()).into());
            }
            time::sleep_until(deadline.min(Instant::now() + RECONNECT_INTERVAL)).await;
        }
    }

    /// Builds everything the run needs, before acknowledging the config.
    async fn prepare(&self, cfg: &Config) -> Result<(Vec<Box<dyn Client>>, EndpointPool), Error> {
        cfg.validate()?;
        let clients = self.registry.new_clients(cfg)?;
        let pool = EndpointPool::resolve(cfg, &self.discover).await?;

        Ok((clients, pool))
    }

    /// Runs the engines, reporting periodically, until all connections stop.
    async fn drive(
        &self,
        mut group: EngineGroup,
        cfg: &Config,
        rd: &mut Reader<OwnedReadHalf>,
        wr: &mut Writer<OwnedWriteHalf>,
    ) -> Result<Report, Error> {
        let mut ticker = time::interval_at(Instant::now() + self.cfg.report_interval, self.cfg.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut interrupt = pin!(runtime::interrupt(!cfg.no_trap_interrupts));
        let mut interrupted = false;
        let mut num_failed = 0;

        loop {
            tokio::select! {
                exit = group.join_next() => match exit {
                    Some(Exit::Failed(..)) => num_failed += 1,
                    Some(exit) => log::debug!("connection stopped: {exit:?}"),
                    None => break,
                },
                _ = ticker.tick() => {
                    let report = group.report(false);
                    if let Err(err) = wr.send(&Message::StatsReport { report }).await {
                        log::error!("failed to report stats: {err}");
                        return Err(Self::abort(group).await);
                    }
                }
                msg = rd.recv() => match msg {
                    Ok(Some(Message::Stop { reason })) => {
                        log::warn!("stopped by coordinator: {reason}");
                        group.cancel();
                    }
                    Ok(Some(msg)) => log::warn!("ignoring unexpected {} while running", msg.kind()),
                    Ok(None) => return Err(Self::abort(group).await),
                    Err(err) => {
                        log::error!("control link failed: {err}");
                        return Err(Self::abort(group).await);
                    }
                },
                _ = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    log::warn!("interrupted, stopping connections ...");
                    group.cancel();
                }
            }
        }

        if num_failed > 0 {
            log::warn!("{num_failed} connection(s) failed");
        }

        Ok(group.report(true))
    }

    /// Stops all connections after losing the coordinator.
    async fn abort(group: EngineGroup) -> Error {
        group.cancel();
        group.join().await;

        ConnectivityError::ControlLinkLost.into()
    }

    /// Sends the final report and waits for its acknowledgement.
    async fn finish(
        &self,
        report: Report,
        rd: &mut Reader<OwnedReadHalf>,
        wr: &mut Writer<OwnedWriteHalf>,
    ) -> Result<(), Error> {
        log::info!(
            "finished: {} txs, {} bytes, {} error(s)",
            report.num_requests,
            report.bytes_tx,
            report.num_errors
        );
        if wr.send(&Message::StatsReport { report }).await.is_err() {
            return Err(ConnectivityError::ControlLinkLost.into());
        }

        let deadline = Instant::now() + self.cfg.ack_timeout;
        loop {
            match time::timeout_at(deadline, rd.recv()).await {
                Ok(Ok(Some(Message::Ack))) => {
                    log::debug!("final report acknowledged");
                    return Ok(());
                }
                Ok(Ok(Some(msg))) => log::debug!("ignoring {} while waiting for ack", msg.kind()),
                Ok(Ok(None)) | Ok(Err(..)) => {
                    log::warn!("coordinator closed the link before acknowledging");
                    return Ok(());
                }
                Err(..) => {
                    log::warn!("no acknowledgement within {:?}", self.cfg.ack_timeout);
                    return Ok(());
                }
            }
        }
    }

    async fn recv(rd: &mut Reader<OwnedReadHalf>) -> Result<Message, Error> {
        match rd.recv().await? {
            Some(msg) => Ok(msg),
            None => Err(ConnectivityError::ControlLinkLost.into()),
        }
    }

    #[inline]
    fn transition(&mut self, state: State) {
        match self.id {
            Some(id) => log::info!("worker {id}: {} -> {}", self.state, state),
            None => log::info!("worker: {} -> {}", self.state, state),
        }
        self.state = state;
    }
}

#[inline]
fn unexpected(expected: &'static str, msg: &Message) -> ProtocolError {
    ProtocolError::Unexpected {
        expected,
        got: msg.kind().to_string(),
    }
}
