//! Bridge relay: forwards received logs to a data host over a one-way
//! serial line, and collects them on the other side.
//!
//! The radio end plugs a `BridgeSinkFactory` in wherever a sink is wanted.
//! Every accepted transfer becomes `TransferStart`, the log bytes as
//! `LogLine` frames, then `TransferDone` or `TransferError`. A
//! `BridgeForwarder` owns the line and also reports peer connect and
//! disconnect from the event bus. On the data host a `BridgeCollector`
//! buffers the bytes into a sink and keeps them only on `TransferDone`.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use loglink_core::bridge::{
    BridgeMessage, BridgeStatus, CutRecord, BRIDGE_MARKER, BRIDGE_MAX_PAYLOAD,
};
use loglink_core::BridgeError;

use crate::events::{EventBus, LinkEvent};
use crate::serial::SerialError;
use crate::store::{LogSink, SinkFactory};

// ── Relay side ───────────────────────────────────────────────────────────────

/// Sinks that stream into a `BridgeForwarder` instead of storage.
#[derive(Debug, Clone)]
pub struct BridgeSinkFactory {
    tx: mpsc::UnboundedSender<BridgeMessage>,
}

impl SinkFactory for BridgeSinkFactory {
    fn create(&self, name: &str) -> io::Result<Box<dyn LogSink>> {
        let mut sink = BridgeSink {
            tx: self.tx.clone(),
            name: name.to_string(),
            settled: false,
        };
        sink.status(BridgeStatus::TransferStart)?;
        tracing::debug!(name, "relaying log to bridge");
        Ok(Box::new(sink))
    }
}

struct BridgeSink {
    tx: mpsc::UnboundedSender<BridgeMessage>,
    name: String,
    settled: bool,
}

impl BridgeSink {
    fn send(&self, message: BridgeMessage) -> io::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "bridge relay stopped"))
    }

    fn status(&mut self, status: BridgeStatus) -> io::Result<()> {
        self.send(BridgeMessage::Status(status))
    }
}

impl LogSink for BridgeSink {
    fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        for piece in bytes.chunks(BRIDGE_MAX_PAYLOAD) {
            self.send(BridgeMessage::LogLine(Bytes::copy_from_slice(piece)))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.settled = true;
        self.status(BridgeStatus::TransferDone)
    }

    fn discard(&mut self) -> io::Result<()> {
        self.settled = true;
        tracing::debug!(name = self.name, "relayed log withdrawn");
        self.status(BridgeStatus::TransferError)
    }
}

impl Drop for BridgeSink {
    fn drop(&mut self) {
        if !self.settled {
            let _ = self.status(BridgeStatus::TransferError);
        }
    }
}

/// Owns the outgoing bridge line.
pub struct BridgeForwarder<W> {
    writer: W,
    relay: mpsc::UnboundedReceiver<BridgeMessage>,
    events: broadcast::Receiver<LinkEvent>,
    watch_events: bool,
    peer_connected: bool,
    shutdown: broadcast::Receiver<()>,
}

impl<W: AsyncWrite + Unpin> BridgeForwarder<W> {
    pub fn new(
        writer: W,
        events: &EventBus,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, BridgeSinkFactory) {
        let (tx, relay) = mpsc::unbounded_channel();
        let forwarder = Self {
            writer,
            relay,
            events: events.subscribe(),
            watch_events: true,
            peer_connected: false,
            shutdown,
        };
        (forwarder, BridgeSinkFactory { tx })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    // Frames already queued still go out so the host sees how
                    // the last log ended.
                    while let Ok(message) = self.relay.try_recv() {
                        self.write(&message).await?;
                    }
                    tracing::info!("bridge forwarder shutting down");
                    return Ok(());
                }

                message = self.relay.recv() => {
                    let Some(message) = message else {
                        tracing::info!("bridge sinks dropped, exiting");
                        return Ok(());
                    };
                    self.write(&message).await?;
                }

                event = self.events.recv(), if self.watch_events => match event {
                    Ok(LinkEvent::Connected) => self.peer(true).await?,
                    Ok(LinkEvent::Disconnected) => self.peer(false).await?,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "bridge forwarder lagged on events")
                    }
                    Err(broadcast::error::RecvError::Closed) => self.watch_events = false,
                },
            }
        }
    }

    /// Report peer state changes only; both ends of a loopback announce
    /// the same connection.
    async fn peer(&mut self, connected: bool) -> anyhow::Result<()> {
        if self.peer_connected == connected {
            return Ok(());
        }
        self.peer_connected = connected;
        let status = if connected {
            BridgeStatus::PeerConnected
        } else {
            BridgeStatus::PeerDisconnected
        };
        self.write(&BridgeMessage::Status(status)).await
    }

    async fn write(&mut self, message: &BridgeMessage) -> anyhow::Result<()> {
        tracing::trace!(kind = ?message.kind(), "bridge frame out");
        self.writer.write_all(&message.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ── Collector side ───────────────────────────────────────────────────────────

/// Pulls verified bridge frames off a byte stream.
pub struct BridgeReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> BridgeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Next valid message within `timeout`, or `None` on timeout. Corrupt
    /// frames are dropped and scanning resumes at the next marker.
    pub async fn read_message(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<BridgeMessage>, SerialError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.read_raw()).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(SerialError::LinkClosed)
                }
                Ok(Err(e)) => return Err(SerialError::Io(e)),
                Ok(Ok(Ok(message))) => return Ok(Some(message)),
                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "discarding bridge frame"),
            }
        }
    }

    async fn read_raw(&mut self) -> io::Result<Result<BridgeMessage, BridgeError>> {
        while self.inner.read_u8().await? != BRIDGE_MARKER {}
        let kind = self.inner.read_u8().await?;
        let length = self.inner.read_u16_le().await?;
        if usize::from(length) > BRIDGE_MAX_PAYLOAD {
            return Ok(Err(BridgeError::PayloadTooLarge(usize::from(length))));
        }
        let mut body = vec![0u8; usize::from(length) + 1];
        self.inner.read_exact(&mut body).await?;
        Ok(BridgeMessage::from_parts(kind, length, &body))
    }
}

/// How a relayed log ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    Stored,
    /// `TransferDone` with no bytes; nothing is kept.
    Empty,
    /// The relay reported `TransferError`.
    Aborted,
    /// The peer behind the relay disconnected mid-log.
    PeerLost,
    StorageFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedLog {
    pub name: String,
    pub bytes: u32,
    pub end: RelayEnd,
}

impl RelayedLog {
    pub fn is_stored(&self) -> bool {
        self.end == RelayEnd::Stored
    }
}

struct PendingLog {
    name: String,
    bytes: u32,
    sink: Option<Box<dyn LogSink>>,
    storage_failed: bool,
}

impl PendingLog {
    fn write(&mut self, bytes: &[u8]) {
        self.bytes = self.bytes.saturating_add(bytes.len() as u32);
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_chunk(bytes) {
                tracing::warn!(name = self.name, error = %e, "sink write failed");
                self.storage_failed = true;
                self.discard();
            }
        }
    }

    fn finish(&mut self) -> RelayEnd {
        if self.storage_failed {
            self.discard();
            return RelayEnd::StorageFailed;
        }
        if self.bytes == 0 {
            self.discard();
            return RelayEnd::Empty;
        }
        let Some(mut sink) = self.sink.take() else {
            return RelayEnd::StorageFailed;
        };
        match sink.finish() {
            Ok(()) => RelayEnd::Stored,
            Err(e) => {
                tracing::warn!(name = self.name, error = %e, "sink finish failed");
                let _ = sink.discard();
                RelayEnd::StorageFailed
            }
        }
    }

    fn discard(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.discard() {
                tracing::warn!(name = self.name, error = %e, "could not discard partial log");
            }
        }
    }

    fn end(&mut self, end: RelayEnd) -> RelayedLog {
        RelayedLog {
            name: self.name.clone(),
            bytes: self.bytes,
            end,
        }
    }
}

impl Drop for PendingLog {
    fn drop(&mut self) {
        self.discard();
    }
}

pub struct BridgeCollector<R> {
    reader: BridgeReader<R>,
    sinks: Arc<dyn SinkFactory>,
    /// Longest silence tolerated inside a relayed log.
    idle_timeout: Duration,
    peer_connected: bool,
    events: EventBus,
}

impl<R: AsyncRead + Unpin> BridgeCollector<R> {
    pub fn new(
        reader: R,
        sinks: Arc<dyn SinkFactory>,
        idle_timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            reader: BridgeReader::new(reader),
            sinks,
            idle_timeout,
            peer_connected: false,
            events,
        }
    }

    pub fn peer_connected(&self) -> bool {
        self.peer_connected
    }

    /// Collect one relayed log into a sink called `name`.
    ///
    /// Returns `Ok(None)` if no `TransferStart` arrives within `wait`.
    pub async fn next_log(
        &mut self,
        name: &str,
        wait: Duration,
    ) -> Result<Option<RelayedLog>, SerialError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(message) = self.reader.read_message(remaining).await? else {
                return Ok(None);
            };
            match message {
                BridgeMessage::Status(BridgeStatus::TransferStart) => break,
                BridgeMessage::Status(status) => self.on_status(status),
                BridgeMessage::CutRecord(record) => log_cut(&record),
                BridgeMessage::LogLine(bytes) => {
                    tracing::debug!(len = bytes.len(), "log bytes outside a transfer ignored")
                }
            }
        }

        let mut pending = self.open(name);
        loop {
            let Some(message) = self.reader.read_message(self.idle_timeout).await? else {
                tracing::warn!(name, bytes = pending.bytes, "relay went silent");
                self.events.publish(LinkEvent::TransferError);
                return Err(SerialError::Stalled(self.idle_timeout));
            };
            let end = match message {
                BridgeMessage::LogLine(bytes) => {
                    pending.write(&bytes);
                    continue;
                }
                BridgeMessage::CutRecord(record) => {
                    log_cut(&record);
                    continue;
                }
                BridgeMessage::Status(BridgeStatus::TransferStart) => {
                    tracing::warn!(name, dropped = pending.bytes, "relay restarted the log");
                    pending.discard();
                    pending = self.open(name);
                    continue;
                }
                BridgeMessage::Status(BridgeStatus::PeerConnected) => {
                    self.on_status(BridgeStatus::PeerConnected);
                    continue;
                }
                BridgeMessage::Status(BridgeStatus::TransferDone) => pending.finish(),
                BridgeMessage::Status(BridgeStatus::TransferError) => {
                    pending.discard();
                    RelayEnd::Aborted
                }
                BridgeMessage::Status(BridgeStatus::PeerDisconnected) => {
                    self.on_status(BridgeStatus::PeerDisconnected);
                    pending.discard();
                    RelayEnd::PeerLost
                }
            };

            let log = pending.end(end);
            if log.is_stored() {
                tracing::info!(name = log.name, bytes = log.bytes, "relayed log stored");
                self.events.publish(LinkEvent::TransferDone);
            } else {
                tracing::warn!(name = log.name, bytes = log.bytes, end = ?log.end, "relayed log dropped");
                self.events.publish(LinkEvent::TransferError);
            }
            return Ok(Some(log));
        }
    }

    fn open(&self, name: &str) -> PendingLog {
        tracing::info!(name, "collecting relayed log");
        self.events.publish(LinkEvent::TransferStarted);
        let (sink, storage_failed) = match self.sinks.create(name) {
            Ok(sink) => (Some(sink), false),
            Err(e) => {
                tracing::warn!(name, error = %e, "could not create sink");
                (None, true)
            }
        };
        PendingLog {
            name: name.to_string(),
            bytes: 0,
            sink,
            storage_failed,
        }
    }

    fn on_status(&mut self, status: BridgeStatus) {
        match status {
            BridgeStatus::PeerConnected if !self.peer_connected => {
                self.peer_connected = true;
                tracing::info!("peer connected behind relay");
                self.events.publish(LinkEvent::Connected);
            }
            BridgeStatus::PeerDisconnected if self.peer_connected => {
                self.peer_connected = false;
                tracing::info!("peer disconnected behind relay");
                self.events.publish(LinkEvent::Disconnected);
            }
            BridgeStatus::TransferDone | BridgeStatus::TransferError => {
                tracing::debug!(?status, "transfer status with no log open")
            }
            _ => {}
        }
    }
}

fn log_cut(record: &CutRecord) {
    tracing::info!(
        sequence = record.sequence_id.get(),
        timestamp = record.timestamp.get(),
        latitude = record.latitude.get(),
        longitude = record.longitude.get(),
        force = record.force.get(),
        fix = record.fix_type,
        "cut record"
    );
}
