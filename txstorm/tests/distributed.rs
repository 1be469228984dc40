use core::{net::SocketAddr, time::Duration};
use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time,
};
use txstorm::{
    cfg::{BroadcastMode, Config, CoordinatorConfig, EndpointSelectMethod, WorkerConfig},
    client::Registry,
    coordinator::Coordinator,
    endpoint::{Discover, Endpoint, NetInfo},
    engine::{Connector, Transport},
    error::{ConfigError, ConnectionError, ConnectivityError, Error, ProtocolError},
    proto::{self, Message},
    stat::{AggregateStats, Report},
    worker::Worker,
};

const SIZE: usize = 64;

struct Sink;

impl Connector for Sink {
    type Transport = Sink;

    async fn connect(&self, _endpoint: &Endpoint) -> Result<Self::Transport, ConnectionError> {
        Ok(Sink)
    }
}

impl Transport for Sink {
    async fn send(&mut self, _tx: Bytes, _mode: BroadcastMode) -> Result<(), ConnectionError> {
        Ok(())
    }
}

struct NoPeers;

impl Discover for NoPeers {
    async fn net_info(&self, _endpoint: &Endpoint) -> Result<NetInfo, ConnectionError> {
        Ok(NetInfo::default())
    }
}

/// Answers only after a while.
struct SlowPeers(Duration);

impl Discover for SlowPeers {
    async fn net_info(&self, _endpoint: &Endpoint) -> Result<NetInfo, ConnectionError> {
        time::sleep(self.0).await;
        Ok(NetInfo::default())
    }
}

fn cfg() -> Config {
    Config {
        connections: 1,
        rate: 100,
        time: 5,
        count: Some(50),
        size: SIZE,
        send_timeout: 1,
        endpoints: vec!["node0:26657".into()],
        no_trap_interrupts: true,
        ..Default::default()
    }
}

fn coord(expect_workers: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        expect_workers,
        worker_connect_timeout: 5,
        shutdown_wait: 1,
        metrics_addr: None,
    }
}

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn worker(addr: SocketAddr, registry: Registry) -> Worker<Sink, NoPeers> {
    worker_with(addr, registry, NoPeers)
}

fn worker_with<D: Discover>(addr: SocketAddr, registry: Registry, discover: D) -> Worker<Sink, D> {
    let cfg = WorkerConfig {
        coordinator_connect_timeout: Duration::from_secs(5),
        report_interval: Duration::from_millis(100),
        ack_timeout: Duration::from_secs(2),
        ..WorkerConfig::new(addr.to_string())
    };

    Worker::new(cfg, Arc::new(registry), Sink, discover)
}

#[tokio::test]
async fn test_two_workers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.csv");
    let cfg = Config {
        stats_output: Some(path.clone()),
        ..cfg()
    };

    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg, coord(2), &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    let w0 = tokio::spawn(worker(addr, Registry::builtin()).run());
    let w1 = tokio::spawn(worker(addr, Registry::builtin()).run());

    for w in [w0, w1] {
        let report = w.await.unwrap().unwrap();
        assert_eq!(
            Report {
                num_requests: 50,
                bytes_tx: 50 * SIZE as u64,
                num_errors: 0,
                completed: true,
            },
            report
        );
    }

    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(100, stats.total_txs);
    assert_eq!(100 * SIZE as u64, stats.total_bytes);
    assert!(stats.total_time > 0.0);
    assert!((stats.avg_tx_rate * stats.total_time - 100.0).abs() < 1e-6);

    let written = AggregateStats::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(100, written.total_txs);
    assert_eq!(100 * SIZE as u64, written.total_bytes);
}

#[tokio::test]
async fn test_worker_rejects_config() {
    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg(), coord(1), &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    // This worker knows no client factories.
    let err = worker(addr, Registry::new()).run().await.unwrap_err();
    assert!(matches!(err, Error::Config(ConfigError::UnknownFactory(..))), "{err}");

    let err = coordinator.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::Config(ConfigError::Rejected { worker: 0, .. })),
        "{err}"
    );
}

#[tokio::test]
async fn test_worker_connect_timeout() {
    let (listener, addr) = listen().await;
    let coord = CoordinatorConfig {
        worker_connect_timeout: 1,
        ..coord(2)
    };
    let coordinator = Coordinator::new(cfg(), coord, &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    let err = worker(addr, Registry::builtin()).run().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::Aborted(..))), "{err}");

    let err = coordinator.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            Error::Connectivity(ConnectivityError::WorkerConnectTimeout { got: 1, expected: 2 })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn test_non_monotonic_report_fails_worker() {
    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg(), coord(2), &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    // Speaks the protocol by hand, so it connects first and gets id 0.
    let (mut rd, mut wr) = proto::split(TcpStream::connect(addr).await.unwrap());
    wr.send(&Message::Hello { id: None }).await.unwrap();
    assert_eq!(Some(Message::Hello { id: Some(0) }), rd.recv().await.unwrap());

    let honest = tokio::spawn(worker(addr, Registry::builtin()).run());

    assert!(matches!(rd.recv().await.unwrap(), Some(Message::Config { .. })));
    wr.send(&Message::Ready).await.unwrap();
    assert_eq!(Some(Message::Start), rd.recv().await.unwrap());

    for num_requests in [10, 5] {
        let report = Report {
            num_requests,
            bytes_tx: num_requests * SIZE as u64,
            num_errors: 0,
            completed: false,
        };
        wr.send(&Message::StatsReport { report }).await.unwrap();
    }
    assert!(matches!(rd.recv().await.unwrap(), Some(Message::Stop { .. })));
    drop((rd, wr));

    honest.await.unwrap().unwrap();

    // The failed worker keeps its last accepted counts.
    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(60, stats.total_txs);
    assert_eq!(60 * SIZE as u64, stats.total_bytes);
}

/// Fetches the metrics page over plain HTTP/1.1.
async fn scrape(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET /metrics HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_silent_connection_does_not_block_workers() {
    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg(), coord(2), &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    // Connects first and never says hello.
    let silent = TcpStream::connect(addr).await.unwrap();

    let w0 = tokio::spawn(worker(addr, Registry::builtin()).run());
    let w1 = tokio::spawn(worker(addr, Registry::builtin()).run());
    for w in [w0, w1] {
        assert!(w.await.unwrap().unwrap().completed);
    }

    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(100, stats.total_txs);
    drop(silent);
}

#[tokio::test]
async fn test_slow_discovery_within_configure_deadline() {
    let cfg = Config {
        endpoint_select_method: EndpointSelectMethod::Any,
        peer_connect_timeout: 10,
        ..cfg()
    };
    let coord = CoordinatorConfig {
        worker_connect_timeout: 2,
        ..coord(1)
    };

    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg, coord, &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    // Resolving takes longer than the worker connect timeout alone.
    let discover = SlowPeers(Duration::from_secs(3));
    let report = worker_with(addr, Registry::builtin(), discover).run().await.unwrap();
    assert_eq!(50, report.num_requests);

    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(50, stats.total_txs);
}

#[tokio::test]
async fn test_worker_stops_on_control_link_lost() {
    let (listener, addr) = listen().await;
    let w = tokio::spawn(worker(addr, Registry::builtin()).run());

    let (stream, _) = listener.accept().await.unwrap();
    let (mut rd, mut wr) = proto::split(stream);
    assert_eq!(Some(Message::Hello { id: None }), rd.recv().await.unwrap());
    wr.send(&Message::Hello { id: Some(0) }).await.unwrap();

    // Bounded by time only, so the worker keeps running until the link drops.
    let cfg = Config {
        time: 60,
        count: None,
        ..cfg()
    };
    wr.send(&Message::Config { cfg }).await.unwrap();
    assert_eq!(Some(Message::Ready), rd.recv().await.unwrap());
    wr.send(&Message::Start).await.unwrap();

    let msg = rd.recv().await.unwrap();
    assert!(matches!(msg, Some(Message::StatsReport { report }) if !report.completed), "{msg:?}");
    drop((rd, wr));

    let err = time::timeout(Duration::from_secs(5), w).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, Error::Connectivity(ConnectivityError::ControlLinkLost)), "{err}");
}

#[tokio::test]
async fn test_disconnected_worker_keeps_partial_counts() {
    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg(), coord(2), &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    let (mut rd, mut wr) = proto::split(TcpStream::connect(addr).await.unwrap());
    wr.send(&Message::Hello { id: None }).await.unwrap();
    assert_eq!(Some(Message::Hello { id: Some(0) }), rd.recv().await.unwrap());

    let honest = tokio::spawn(worker(addr, Registry::builtin()).run());

    assert!(matches!(rd.recv().await.unwrap(), Some(Message::Config { .. })));
    wr.send(&Message::Ready).await.unwrap();
    assert_eq!(Some(Message::Start), rd.recv().await.unwrap());

    let report = Report {
        num_requests: 10,
        bytes_tx: 10 * SIZE as u64,
        num_errors: 0,
        completed: false,
    };
    wr.send(&Message::StatsReport { report }).await.unwrap();
    // Goes away without a final report.
    drop((rd, wr));

    assert_eq!(50, honest.await.unwrap().unwrap().num_requests);

    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(60, stats.total_txs);
    assert_eq!(60 * SIZE as u64, stats.total_bytes);
}

#[tokio::test]
async fn test_interrupt_stops_workers() {
    let cfg = Config {
        time: 60,
        count: None,
        ..cfg()
    };

    let (listener, addr) = listen().await;
    let (tx, rx) = oneshot::channel::<()>();
    let coordinator = Coordinator::new(cfg, coord(1), &Registry::builtin()).unwrap();
    let coordinator = tokio::spawn(coordinator.run_until(listener, async {
        rx.await.ok();
    }));

    let w = tokio::spawn(worker(addr, Registry::builtin()).run());
    time::sleep(Duration::from_millis(300)).await;
    tx.send(()).unwrap();

    let report = time::timeout(Duration::from_secs(5), w).await.unwrap().unwrap().unwrap();
    assert!(report.completed);
    assert!((1..6000).contains(&report.num_requests), "sent {}", report.num_requests);

    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(report.num_requests, stats.total_txs);
    assert_eq!(report.bytes_tx, stats.total_bytes);
}

#[tokio::test]
async fn test_metrics_served_during_shutdown_wait() {
    let metrics_addr = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let coord = CoordinatorConfig {
        shutdown_wait: 5,
        metrics_addr: Some(metrics_addr),
        ..coord(2)
    };

    let (listener, addr) = listen().await;
    let coordinator = Coordinator::new(cfg(), coord, &Registry::builtin()).unwrap();
    let run_id = coordinator.run_id().to_string();
    let coordinator = tokio::spawn(coordinator.run_on(listener));

    let (mut rd, mut wr) = proto::split(TcpStream::connect(addr).await.unwrap());
    wr.send(&Message::Hello { id: None }).await.unwrap();
    assert_eq!(Some(Message::Hello { id: Some(0) }), rd.recv().await.unwrap());

    let honest = tokio::spawn(worker(addr, Registry::builtin()).run());

    assert!(matches!(rd.recv().await.unwrap(), Some(Message::Config { .. })));
    wr.send(&Message::Ready).await.unwrap();
    assert_eq!(Some(Message::Start), rd.recv().await.unwrap());

    let report = Report {
        num_requests: 50,
        bytes_tx: 50 * SIZE as u64,
        num_errors: 0,
        completed: true,
    };
    wr.send(&Message::StatsReport { report }).await.unwrap();
    assert_eq!(Some(Message::Ack), rd.recv().await.unwrap());

    honest.await.unwrap().unwrap();

    // Still connected, so the coordinator is waiting for us to leave.
    let text = scrape(metrics_addr).await;
    assert!(text.starts_with("HTTP/1.1 200"), "{text}");
    assert!(text.contains(&format!("txstorm_coordinator_txs_total{{run=\"{run_id}\"}} 100")), "{text}");
    assert!(
        text.contains(&format!("txstorm_coordinator_bytes_total{{run=\"{run_id}\"}} {}", 100 * SIZE)),
        "{text}"
    );
    drop((rd, wr));

    let stats = coordinator.await.unwrap().unwrap();
    assert_eq!(100, stats.total_txs);
}
