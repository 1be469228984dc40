//! Coordinator/worker control protocol.
//!
//! Every message is a single JSON object terminated by a newline.

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

use crate::{
    cfg::Config,
    error::ProtocolError,
    stat::{Report, WorkerId},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Worker announces itself, coordinator answers with the assigned id.
    Hello { id: Option<WorkerId> },
    /// Test configuration broadcast by the coordinator.
    Config { cfg: Config },
    /// Coordinator gives up before the start barrier.
    Abort { reason: String },
    /// Worker accepted the configuration.
    Ready,
    /// Worker cannot run the configuration.
    Reject { reason: String },
    /// Start barrier released.
    Start,
    StatsReport { report: Report },
    /// Coordinator received the final report.
    Ack,
    /// Coordinator asks the worker to stop sending.
    Stop { reason: String },
}

impl Message {
    /// Returns the wire tag, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Config { .. } => "config",
            Self::Abort { .. } => "abort",
            Self::Ready => "ready",
            Self::Reject { .. } => "reject",
            Self::Start => "start",
            Self::StatsReport { .. } => "stats_report",
            Self::Ack => "ack",
            Self::Stop { .. } => "stop",
        }
    }
}

/// Reading half of a control link.
#[derive(Debug)]
pub struct Reader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(rd: R) -> Self {
        Self {
            lines: BufReader::new(rd).lines(),
        }
    }

    /// Reads the next message.
    ///
    /// Returns `None` on a clean end of stream. Blank lines are skipped.
    /// Cancel safe.
    pub async fn recv(&mut self) -> Result<Option<Message>, ProtocolError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let msg = serde_json::from_str(&line)?;
            log::trace!("recv: {line}");
            return Ok(Some(msg));
        }

        Ok(None)
    }
}

/// Writing half of a control link.
#[derive(Debug)]
pub struct Writer<W> {
    wr: W,
    buf: Vec<u8>,
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(wr: W) -> Self {
        Self { wr, buf: Vec::new() }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, msg)?;
        self.buf.push(b'\n');

        self.wr.write_all(&self.buf).await?;
        self.wr.flush().await?;
        log::trace!("sent: {}", msg.kind());

        Ok(())
    }
}

/// Splits a TCP control link into its halves.
pub fn split(stream: TcpStream) -> (Reader<OwnedReadHalf>, Writer<OwnedWriteHalf>) {
    let (rd, wr) = stream.into_split();
    (Reader::new(rd), Writer::new(wr))
}
