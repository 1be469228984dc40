use core::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::{
    collections::BTreeMap,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, OnceLock},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{ConnectionError, ProtocolError};

/// Worker identifier, assigned by the coordinator in acceptance order.
pub type WorkerId = usize;

pub trait TxStat {
    fn num_requests(&self) -> u64;
    fn bytes_tx(&self) -> u64;
}

/// Per-connection counters.
///
/// Written by exactly one engine task, read by others via
/// [`ConnectionStat::snapshot`].
#[derive(Debug, Default)]
pub struct ConnectionStat {
    num_requests: AtomicU64,
    bytes_tx: AtomicU64,
    num_errors: AtomicU64,
    started: OnceLock<Instant>,
    finished: OnceLock<Instant>,
    /// The first error that stopped this connection.
    error: OnceLock<ConnectionError>,
}

impl ConnectionStat {
    /// Increases the number of requests made by the given value.
    ///
    /// Should be called after each successful request transmitted.
    #[inline]
    pub fn on_requests(&self, v: u64) {
        self.num_requests.fetch_add(v, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_send(&self, n: u64) {
        self.bytes_tx.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn on_started(&self, now: Instant) {
        let _ = self.started.set(now);
    }

    #[inline]
    pub fn on_finished(&self, now: Instant) {
        let _ = self.finished.set(now);
    }

    pub fn on_error(&self, err: ConnectionError) {
        log::error!("{err}");
        self.num_errors.fetch_add(1, Ordering::Relaxed);
        let _ = self.error.set(err);
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            num_requests: self.num_requests.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            num_errors: self.num_errors.load(Ordering::Relaxed),
            started: self.started.get().copied(),
            finished: self.finished.get().copied(),
            error: self.error.get().cloned(),
        }
    }
}

impl TxStat for ConnectionStat {
    #[inline]
    fn num_requests(&self) -> u64 {
        self.num_requests.load(Ordering::Relaxed)
    }

    #[inline]
    fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of a [`ConnectionStat`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub num_requests: u64,
    pub bytes_tx: u64,
    pub num_errors: u64,
    pub started: Option<Instant>,
    pub finished: Option<Instant>,
    pub error: Option<ConnectionError>,
}

/// Cumulative worker statistics, as sent to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub num_requests: u64,
    pub bytes_tx: u64,
    #[serde(default)]
    pub num_errors: u64,
    /// Whether all connections of the worker are stopped.
    pub completed: bool,
}

impl Report {
    /// Sums the given connection snapshots.
    pub fn from_snapshots<'a, I>(snapshots: I, completed: bool) -> Self
    where
        I: IntoIterator<Item = &'a ConnectionSnapshot>,
    {
        snapshots.into_iter().fold(
            Self {
                completed,
                ..Default::default()
            },
            |mut acc, s| {
                acc.num_requests += s.num_requests;
                acc.bytes_tx += s.bytes_tx;
                acc.num_errors += s.num_errors;
                acc
            },
        )
    }
}

/// Live run totals, written by the aggregation task and read by metrics
/// scrapes.
#[derive(Debug, Default)]
pub struct LiveStat {
    num_requests: AtomicU64,
    bytes_tx: AtomicU64,
}

impl LiveStat {
    #[inline]
    fn store(&self, num_requests: u64, bytes_tx: u64) {
        self.num_requests.store(num_requests, Ordering::Relaxed);
        self.bytes_tx.store(bytes_tx, Ordering::Relaxed);
    }
}

impl TxStat for LiveStat {
    #[inline]
    fn num_requests(&self) -> u64 {
        self.num_requests.load(Ordering::Relaxed)
    }

    #[inline]
    fn bytes_tx(&self) -> u64 {
        self.bytes_tx.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Still expected to report.
    Active,
    /// Sent its final report.
    Completed,
    /// Violated the protocol.
    Failed,
    /// Disconnected without a final report.
    Lost,
}

#[derive(Debug)]
struct WorkerEntry {
    status: WorkerStatus,
    report: Report,
}

/// Coordinator-side merge of worker reports.
///
/// Owned by a single aggregation task; totals are published to the shared
/// [`LiveStat`] after every merge.
#[derive(Debug, Default)]
pub struct Collector {
    workers: BTreeMap<WorkerId, WorkerEntry>,
    /// When the first report of the run arrived.
    started: Option<Instant>,
    /// When the last completion report arrived.
    finished: Option<Instant>,
    live: Arc<LiveStat>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn live(&self) -> Arc<LiveStat> {
        self.live.clone()
    }

    pub fn register(&mut self, id: WorkerId) {
        let entry = WorkerEntry {
            status: WorkerStatus::Active,
            report: Report::default(),
        };
        self.workers.insert(id, entry);
    }

    /// Merges a cumulative report from the given worker.
    ///
    /// Returns `true` if this report completes the worker.
    pub fn merge(&mut self, id: WorkerId, report: Report, now: Instant) -> Result<bool, ProtocolError> {
        let entry = self.workers.get_mut(&id).ok_or(ProtocolError::Unregistered(id))?;

        if entry.status != WorkerStatus::Active {
            return Err(ProtocolError::Unexpected {
                expected: "no reports after completion",
                got: format!("stats_report from worker {id} in state {:?}", entry.status),
            });
        }

        let prev = entry.report;
        if report.num_requests < prev.num_requests || report.bytes_tx < prev.bytes_tx {
            return Err(ProtocolError::NonMonotonic {
                worker: id,
                prev_requests: prev.num_requests,
                prev_bytes: prev.bytes_tx,
                requests: report.num_requests,
                bytes: report.bytes_tx,
            });
        }

        entry.report = report;
        self.started.get_or_insert(now);
        if report.completed {
            entry.status = WorkerStatus::Completed;
            self.finished = Some(self.finished.map_or(now, |v| v.max(now)));
        }

        let (num_requests, bytes_tx) = self.totals();
        self.live.store(num_requests, bytes_tx);

        Ok(report.completed)
    }

    /// Marks the worker as failed.
    ///
    /// Its last accepted counts stay in the totals.
    pub fn fail(&mut self, id: WorkerId) {
        if let Some(entry) = self.workers.get_mut(&id) {
            entry.status = WorkerStatus::Failed;
        }
    }

    /// Marks an active worker as lost.
    pub fn lose(&mut self, id: WorkerId) {
        if let Some(entry) = self.workers.get_mut(&id) {
            if entry.status == WorkerStatus::Active {
                entry.status = WorkerStatus::Lost;
            }
        }
    }

    pub fn status(&self, id: WorkerId) -> Option<WorkerStatus> {
        self.workers.get(&id).map(|v| v.status)
    }

    /// Returns workers still expected to report.
    pub fn active(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, v)| v.status == WorkerStatus::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Returns `true` once no worker is expected to report anymore.
    pub fn is_settled(&self) -> bool {
        self.workers.values().all(|v| v.status != WorkerStatus::Active)
    }

    pub fn num_completed(&self) -> usize {
        self.count(WorkerStatus::Completed)
    }

    pub fn num_active(&self) -> usize {
        self.count(WorkerStatus::Active)
    }

    fn count(&self, status: WorkerStatus) -> usize {
        self.workers.values().filter(|v| v.status == status).count()
    }

    /// Returns summed requests and bytes.
    pub fn totals(&self) -> (u64, u64) {
        self.workers.values().fold((0, 0), |(requests, bytes), v| {
            (requests + v.report.num_requests, bytes + v.report.bytes_tx)
        })
    }

    /// Computes the final aggregate.
    ///
    /// Elapsed time spans from the first accepted report to the last
    /// completion, or to `now` if nothing completed.
    pub fn finalize(&self, now: Instant) -> AggregateStats {
        let (total_txs, total_bytes) = self.totals();
        let elapsed = match self.started {
            Some(started) => self.finished.unwrap_or(now).saturating_duration_since(started),
            None => Duration::ZERO,
        };

        AggregateStats::new(total_txs, total_bytes, elapsed)
    }
}

/// Final merged statistics of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateStats {
    pub total_txs: u64,
    pub total_bytes: u64,
    /// Seconds.
    pub total_time: f64,
    /// Transactions per second.
    pub avg_tx_rate: f64,
    /// Bytes per second.
    pub avg_data_rate: f64,
}

impl AggregateStats {
    const HEADER: &'static str = "Parameter,Value,Units";

    pub fn new(total_txs: u64, total_bytes: u64, elapsed: Duration) -> Self {
        let total_time = elapsed.as_secs_f64();
        let (avg_tx_rate, avg_data_rate) = if total_time > 0.0 {
            (total_txs as f64 / total_time, total_bytes as f64 / total_time)
        } else {
            (0.0, 0.0)
        };

        Self {
            total_txs,
            total_bytes,
            total_time,
            avg_tx_rate,
            avg_data_rate,
        }
    }

    /// Aggregates standalone connection snapshots.
    ///
    /// Elapsed time spans from the earliest connection start to the latest
    /// connection finish.
    pub fn from_snapshots(snapshots: &[ConnectionSnapshot]) -> Self {
        let report = Report::from_snapshots(snapshots, true);
        let started = snapshots.iter().filter_map(|v| v.started).min();
        let finished = snapshots.iter().filter_map(|v| v.finished).max();
        let elapsed = match (started, finished) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            _ => Duration::ZERO,
        };

        Self::new(report.num_requests, report.bytes_tx, elapsed)
    }

    /// Writes the stats as a "Parameter,Value,Units" table.
    pub fn write_to<W>(&self, mut wr: W) -> Result<(), io::Error>
    where
        W: Write,
    {
        writeln!(wr, "{}", Self::HEADER)?;
        writeln!(wr, "total_time,{},seconds", self.total_time)?;
        writeln!(wr, "total_txs,{},count", self.total_txs)?;
        writeln!(wr, "total_bytes,{},bytes", self.total_bytes)?;
        writeln!(wr, "avg_tx_rate,{},transactions per second", self.avg_tx_rate)?;
        writeln!(wr, "avg_data_rate,{},bytes per second", self.avg_data_rate)?;
        wr.flush()
    }

    pub fn write_file<P>(&self, path: P) -> Result<(), io::Error>
    where
        P: AsRef<Path>,
    {
        let file = File::create(&path)?;
        self.write_to(BufWriter::new(file))?;
        log::info!("wrote aggregate stats to '{}'", path.as_ref().display());

        Ok(())
    }

    /// Parses a table produced by [`AggregateStats::write_to`].
    ///
    /// Rows are looked up by label; blank rows and unknown labels are
    /// skipped.
    pub fn parse(data: &str) -> Result<Self, io::Error> {
        let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);

        let mut m = Self::default();
        for line in data.lines().map(str::trim) {
            if line.is_empty() || line == Self::HEADER {
                continue;
            }

            let mut parts = line.splitn(3, ',');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().ok_or_else(|| invalid(format!("missing value in row '{line}'")))?;

            match key {
                "total_time" => m.total_time = parse_value(line, value)?,
                "total_txs" => m.total_txs = parse_value(line, value)?,
                "total_bytes" => m.total_bytes = parse_value(line, value)?,
                "avg_tx_rate" => m.avg_tx_rate = parse_value(line, value)?,
                "avg_data_rate" => m.avg_data_rate = parse_value(line, value)?,
                _ => {}
            }
        }

        Ok(m)
    }
}

#[inline]
fn parse_value<T: FromStr>(line: &str, value: &str) -> Result<T, io::Error> {
    value
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("invalid value in row '{line}'")))
}

impl Display for AggregateStats {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), fmt::Error> {
        write!(
            fmt,
            "{} txs, {} bytes in {:.3}s ({:.2} tx/s, {:.2} B/s)",
            self.total_txs, self.total_bytes, self.total_time, self.avg_tx_rate, self.avg_data_rate
        )
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn report(num_requests: u64, bytes_tx: u64, completed: bool) -> Report {
        Report {
            num_requests,
            bytes_tx,
            num_errors: 0,
            completed,
        }
    }

    #[test]
    fn test_connection_stat_first_error_wins() {
        let stat = ConnectionStat::default();
        stat.on_requests(2);
        stat.on_send(20);
        stat.on_error(ConnectionError::Timeout(Duration::from_secs(1)));
        stat.on_error(ConnectionError::Status(500));

        let snapshot = stat.snapshot();
        assert_eq!(2, snapshot.num_requests);
        assert_eq!(20, snapshot.bytes_tx);
        assert_eq!(2, snapshot.num_errors);
        assert_eq!(Some(ConnectionError::Timeout(Duration::from_secs(1))), snapshot.error);
    }

    #[test]
    fn test_merge_unregistered() {
        let mut collector = Collector::new();
        let rc = collector.merge(7, report(1, 1, false), Instant::now());
        assert!(matches!(rc, Err(ProtocolError::Unregistered(7))));
    }

    #[test]
    fn test_merge_non_monotonic() {
        let now = Instant::now();
        let mut collector = Collector::new();
        collector.register(0);

        assert!(!collector.merge(0, report(10, 100, false), now).unwrap());
        let rc = collector.merge(0, report(9, 100, false), now);
        assert!(matches!(rc, Err(ProtocolError::NonMonotonic { worker: 0, prev_requests: 10, requests: 9, .. })));

        // The rejected report must not leak into the totals.
        assert_eq!((10, 100), collector.totals());
    }

    #[test]
    fn test_merge_after_completion() {
        let now = Instant::now();
        let mut collector = Collector::new();
        collector.register(0);

        assert!(collector.merge(0, report(5, 50, true), now).unwrap());
        assert!(collector.merge(0, report(6, 60, true), now).is_err());
        assert!(collector.is_settled());
    }

    #[test]
    fn test_failed_worker_keeps_counts() {
        let now = Instant::now();
        let mut collector = Collector::new();
        collector.register(0);
        collector.register(1);

        collector.merge(0, report(5, 50, false), now).unwrap();
        collector.fail(0);
        collector.merge(1, report(7, 70, true), now).unwrap();

        assert!(collector.is_settled());
        assert_eq!(1, collector.num_completed());
        assert_eq!((12, 120), collector.totals());
        assert_eq!(12, collector.live().num_requests());
    }

    #[test]
    fn test_lose_only_active() {
        let now = Instant::now();
        let mut collector = Collector::new();
        collector.register(0);
        collector.register(1);

        collector.merge(0, report(1, 1, true), now).unwrap();
        collector.lose(0);
        collector.lose(1);

        assert_eq!(Some(WorkerStatus::Completed), collector.status(0));
        assert_eq!(Some(WorkerStatus::Lost), collector.status(1));
        assert_eq!(0, collector.num_active());
    }

    #[test]
    fn test_finalize_elapsed() {
        let now = Instant::now();
        let mut collector = Collector::new();
        collector.register(0);
        collector.register(1);
        // Rejected reports do not start the clock.
        assert!(collector.merge(2, report(1, 1, false), now).is_err());

        collector.merge(0, report(10, 100, false), now + Duration::from_secs(1)).unwrap();
        collector.merge(0, report(100, 1000, true), now + Duration::from_secs(3)).unwrap();
        collector.merge(1, report(100, 1000, true), now + Duration::from_secs(5)).unwrap();

        let stats = collector.finalize(now + Duration::from_secs(60));
        assert_eq!(200, stats.total_txs);
        assert_eq!(4.0, stats.total_time);
        assert_eq!(50.0, stats.avg_tx_rate);
        assert_eq!(500.0, stats.avg_data_rate);
    }

    #[test]
    fn test_finalize_without_reports() {
        let mut collector = Collector::new();
        collector.register(0);
        collector.lose(0);

        let stats = collector.finalize(Instant::now());
        assert_eq!(0, stats.total_txs);
        assert_eq!(0.0, stats.total_time);
    }

    #[test]
    fn test_zero_elapsed_rates() {
        let stats = AggregateStats::new(10, 100, Duration::ZERO);
        assert_eq!(0.0, stats.avg_tx_rate);
        assert_eq!(0.0, stats.avg_data_rate);
    }

    #[test]
    fn test_table_roundtrip_with_blank_rows() {
        let stats = AggregateStats::new(50, 12_500, Duration::from_millis(490));

        let mut buf = Vec::new();
        stats.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap().replace('\n', "\n\n");

        assert_eq!(stats, AggregateStats::parse(&text).unwrap());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(AggregateStats::parse("total_txs,many,count").is_err());
        assert!(AggregateStats::parse("total_txs").is_err());
    }

    /// Per-worker cumulative report streams, each ending with a completion
    /// report, together with a random arrival order of worker ids.
    fn streams_and_order() -> impl Strategy<Value = (Vec<Vec<Report>>, Vec<WorkerId>)> {
        prop::collection::vec(prop::collection::vec((0u64..1000, 0u64..100_000), 1..8), 1..6).prop_flat_map(
            |deltas| {
                let streams: Vec<Vec<Report>> = deltas
                    .iter()
                    .map(|deltas| {
                        let mut acc = Report::default();
                        let n = deltas.len();
                        deltas
                            .iter()
                            .enumerate()
                            .map(|(idx, (requests, bytes))| {
                                acc.num_requests += requests;
                                acc.bytes_tx += bytes;
                                acc.completed = idx + 1 == n;
                                acc
                            })
                            .collect()
                    })
                    .collect();
                let order: Vec<WorkerId> = streams
                    .iter()
                    .enumerate()
                    .flat_map(|(id, stream)| core::iter::repeat_n(id, stream.len()))
                    .collect();

                (Just(streams), Just(order).prop_shuffle())
            },
        )
    }

    proptest! {
        #[test]
        fn test_merge_order_independent((streams, order) in streams_and_order()) {
            let expected = streams.iter().fold((0, 0), |(r, b), s| {
                let last = s[s.len() - 1];
                (r + last.num_requests, b + last.bytes_tx)
            });

            let now = Instant::now();
            let mut sequential = Collector::new();
            for (id, stream) in streams.iter().enumerate() {
                sequential.register(id);
                for r in stream {
                    sequential.merge(id, *r, now).unwrap();
                }
            }

            // Each worker's reports still arrive in the order sent.
            let mut interleaved = Collector::new();
            let mut cursors = vec![0usize; streams.len()];
            for id in 0..streams.len() {
                interleaved.register(id);
            }
            for id in order {
                interleaved.merge(id, streams[id][cursors[id]], now).unwrap();
                cursors[id] += 1;
            }

            prop_assert_eq!(expected, sequential.totals());
            prop_assert_eq!(expected, interleaved.totals());
            prop_assert!(interleaved.is_settled());
        }
    }
}
