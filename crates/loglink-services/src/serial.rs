//! Acknowledged transfer over a serial byte stream.
//!
//! Every frame from the sender is answered with an ACK. Unanswered frames
//! are retransmitted up to the retry budget, then the transfer fails. After
//! END the receiver reports the outcome with one COMMIT frame, and the
//! sender clears its source only on `COMMIT_OK`. A failed transfer never
//! loses the source.
//!
//! Frames carry no sequence number. A lost ACK makes the sender repeat a
//! frame the receiver already stored, so the receiver compares the byte
//! count against the announced size and refuses the commit on mismatch.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time::Instant;

use loglink_core::config::SerialConfig;
use loglink_core::frame::{COMMIT_OK, COMMIT_SIZE_MISMATCH, COMMIT_STORAGE_ERROR, FRAME_MARKER};
use loglink_core::{Frame, FrameError, FrameType};

use crate::events::{EventBus, LinkEvent};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::store::{LogSink, ResourceStore, SinkFactory, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serial link closed by peer")]
    LinkClosed,

    #[error("no ACK for {frame:?} after {attempts} attempts")]
    NoAck { frame: FrameType, attempts: u32 },

    #[error("no COMMIT within {0:?}")]
    NoCommit(Duration),

    #[error("receiver refused the log, commit status 0x{0:02x}")]
    Rejected(u8),

    #[error("log {0} is empty, nothing to send")]
    EmptySource(String),

    #[error("log ended early: {read} of {size} bytes")]
    SourceShort { read: u32, size: u32 },

    #[error("transfer stalled, no frame within {0:?}")]
    Stalled(Duration),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ── Frame I/O ────────────────────────────────────────────────────────────────

/// Pulls verified frames off a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Next valid frame arriving within `timeout`, or `None` on timeout.
    ///
    /// Bytes before a marker are skipped. Frames failing the checksum or
    /// carrying an unknown type are dropped and scanning continues. A frame
    /// cut short by the timeout is lost.
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, SerialError> {
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
                Ok(Ok(Ok(frame))) => return Ok(Some(frame)),
                Ok(Ok(Err(e))) => tracing::debug!(error = %e, "discarding frame"),
            }
        }
    }

    async fn read_raw(&mut self) -> io::Result<Result<Frame, FrameError>> {
        let mut skipped = 0usize;
        while self.inner.read_u8().await? != FRAME_MARKER {
            skipped += 1;
        }
        if skipped > 0 {
            tracing::trace!(skipped, "skipped bytes before marker");
        }
        let mut header = [0u8; 2];
        self.inner.read_exact(&mut header).await?;
        let mut body = vec![0u8; usize::from(header[1]) + 1];
        self.inner.read_exact(&mut body).await?;
        Ok(Frame::from_parts(header[0], header[1], &body))
    }
}

/// Both directions of a serial line.
pub struct SerialLink<R, W> {
    reader: FrameReader<R>,
    writer: W,
}

impl<T: AsyncRead + AsyncWrite> SerialLink<ReadHalf<T>, WriteHalf<T>> {
    pub fn new(io: T) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self::from_parts(reader, writer)
    }
}

impl<R, W> SerialLink<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), SerialError> {
        tracing::trace!(kind = ?frame.frame_type, len = frame.payload.len(), "frame out");
        self.writer.write_all(&frame.encode()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, SerialError> {
        self.reader.read_frame(timeout).await
    }

    /// Wait for a frame of type `kind`, discarding anything else.
    pub async fn wait_for(
        &mut self,
        kind: FrameType,
        timeout: Duration,
    ) -> Result<Option<Frame>, SerialError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv(remaining).await? {
                None => return Ok(None),
                Some(frame) if frame.frame_type == kind => return Ok(Some(frame)),
                Some(frame) => {
                    tracing::debug!(want = ?kind, got = ?frame.frame_type, "ignoring frame")
                }
            }
        }
    }

    /// Send `frame` until it is acknowledged. Returns the spent budget.
    pub async fn send_with_ack(
        &mut self,
        frame: &Frame,
        policy: &RetryPolicy,
    ) -> Result<RetryBudget, SerialError> {
        let mut budget = policy.budget();
        while budget.try_attempt() {
            self.send(frame).await?;
            if self.wait_for(FrameType::Ack, policy.ack_timeout).await?.is_some() {
                return Ok(budget);
            }
            tracing::warn!(
                kind = ?frame.frame_type,
                attempt = budget.attempts(),
                max = policy.max_attempts,
                "no ACK, retransmitting"
            );
        }
        Err(SerialError::NoAck {
            frame: frame.frame_type,
            attempts: budget.attempts(),
        })
    }
}

// ── Sender ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub name: String,
    pub size: u32,
    /// Distinct frames delivered: START, every DATA, END.
    pub frames: u32,
    pub retransmissions: u32,
}

pub struct SerialSender<R, W> {
    link: SerialLink<R, W>,
    policy: RetryPolicy,
    commit_timeout: Duration,
    chunk_size: usize,
    events: EventBus,
}

impl<R, W> SerialSender<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(link: SerialLink<R, W>, config: &SerialConfig, events: EventBus) -> Self {
        Self {
            link,
            policy: RetryPolicy::from(config),
            commit_timeout: config.commit_timeout(),
            chunk_size: config.chunk_size.clamp(1, loglink_core::frame::MAX_FRAME_PAYLOAD),
            events,
        }
    }

    /// Deliver the log `name` and clear it once the receiver commits.
    pub async fn send_log(
        &mut self,
        store: &dyn ResourceStore,
        name: &str,
    ) -> Result<SendReport, SerialError> {
        let result = self.transfer(store, name).await;
        match &result {
            Ok(report) => {
                tracing::info!(
                    name,
                    size = report.size,
                    retransmissions = report.retransmissions,
                    "log delivered and cleared"
                );
                self.events.publish(LinkEvent::TransferDone);
            }
            Err(SerialError::EmptySource(_)) => {
                tracing::info!(name, "log empty, skipping");
            }
            Err(e) => {
                tracing::warn!(name, error = %e, "log not delivered, source kept");
                self.events.publish(LinkEvent::TransferError);
            }
        }
        result
    }

    async fn transfer(
        &mut self,
        store: &dyn ResourceStore,
        name: &str,
    ) -> Result<SendReport, SerialError> {
        let opened = store.open(name)?;
        let size = opened.size;
        if size == 0 {
            return Err(SerialError::EmptySource(name.to_string()));
        }
        self.events.publish(LinkEvent::TransferStarted);
        tracing::info!(name, size, "sending log");

        let mut report = SendReport {
            name: name.to_string(),
            size,
            frames: 0,
            retransmissions: 0,
        };
        self.deliver(&Frame::start(size), &mut report).await?;

        let mut reader = opened.reader;
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u32;
        while sent < size {
            let want = self.chunk_size.min((size - sent) as usize);
            let n = read_full(&mut reader, &mut buf[..want]).map_err(|source| StoreError::Io {
                name: name.to_string(),
                source,
            })?;
            if n < want {
                return Err(SerialError::SourceShort {
                    read: sent + n as u32,
                    size,
                });
            }
            let frame = Frame::data(Bytes::copy_from_slice(&buf[..n]))?;
            self.deliver(&frame, &mut report).await?;
            sent += n as u32;
        }
        drop(reader);

        self.deliver(&Frame::end(), &mut report).await?;

        let commit = self
            .link
            .wait_for(FrameType::Commit, self.commit_timeout)
            .await?
            .ok_or(SerialError::NoCommit(self.commit_timeout))?;
        // A COMMIT without a status byte is treated as a refusal.
        match commit.commit_status() {
            Some(COMMIT_OK) => {}
            Some(status) => return Err(SerialError::Rejected(status)),
            None => return Err(SerialError::Rejected(u8::MAX)),
        }

        store.clear(name)?;
        Ok(report)
    }

    async fn deliver(&mut self, frame: &Frame, report: &mut SendReport) -> Result<(), SerialError> {
        let budget = self.link.send_with_ack(frame, &self.policy).await?;
        report.frames += 1;
        report.retransmissions += budget.retransmissions();
        Ok(())
    }
}

fn read_full(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

// ── Receiver ─────────────────────────────────────────────────────────────────

/// What one completed receive produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedLog {
    pub name: String,
    pub size: u32,
    /// Payload bytes seen, duplicates included.
    pub bytes: u32,
    pub commit: u8,
}

impl ReceivedLog {
    pub fn is_committed(&self) -> bool {
        self.commit == COMMIT_OK
    }
}

struct Inbound {
    name: String,
    size: u32,
    received: u32,
    sink: Option<Box<dyn LogSink>>,
    storage_failed: bool,
}

impl Inbound {
    fn store(&mut self, payload: &[u8]) {
        let room = self.size.saturating_sub(self.received) as usize;
        if payload.len() > room {
            tracing::warn!(
                name = self.name,
                len = payload.len(),
                room,
                "DATA overruns announced size"
            );
        }
        self.received = self.received.saturating_add(payload.len() as u32);
        if self.storage_failed {
            return;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_chunk(&payload[..payload.len().min(room)]) {
                tracing::warn!(name = self.name, error = %e, "sink write failed");
                self.storage_failed = true;
                self.discard();
            }
        }
    }

    /// Publish the log if it is whole, otherwise drop what was written.
    fn finish(&mut self) -> u8 {
        if self.storage_failed {
            self.discard();
            return COMMIT_STORAGE_ERROR;
        }
        if self.received != self.size {
            self.discard();
            return COMMIT_SIZE_MISMATCH;
        }
        let Some(mut sink) = self.sink.take() else {
            return COMMIT_STORAGE_ERROR;
        };
        match sink.finish() {
            Ok(()) => COMMIT_OK,
            Err(e) => {
                tracing::warn!(name = self.name, error = %e, "sink finish failed");
                if let Err(e) = sink.discard() {
                    tracing::warn!(name = self.name, error = %e, "could not discard partial log");
                }
                COMMIT_STORAGE_ERROR
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
}

/// A transfer abandoned by stall, restart or link error leaves no file.
impl Drop for Inbound {
    fn drop(&mut self) {
        self.discard();
    }
}

pub struct SerialReceiver<R, W> {
    link: SerialLink<R, W>,
    sinks: Arc<dyn SinkFactory>,
    /// Longest silence tolerated once a transfer has started.
    frame_timeout: Duration,
    /// Status of the last COMMIT sent, replayed if END is repeated.
    last_commit: Option<u8>,
    events: EventBus,
}

impl<R, W> SerialReceiver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        link: SerialLink<R, W>,
        sinks: Arc<dyn SinkFactory>,
        config: &SerialConfig,
        events: EventBus,
    ) -> Self {
        Self {
            link,
            sinks,
            frame_timeout: RetryPolicy::from(config).window() + config.commit_timeout(),
            last_commit: None,
            events,
        }
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    /// Receive one log into a sink called `name`.
    ///
    /// Returns `Ok(None)` if no START arrives within `wait`.
    pub async fn next_transfer(
        &mut self,
        name: &str,
        wait: Duration,
    ) -> Result<Option<ReceivedLog>, SerialError> {
        let Some(mut inbound) = self.await_start(name, wait).await? else {
            return Ok(None);
        };

        loop {
            let Some(frame) = self.link.recv(self.frame_timeout).await? else {
                tracing::warn!(
                    name,
                    received = inbound.received,
                    size = inbound.size,
                    "sender went silent"
                );
                self.events.publish(LinkEvent::TransferError);
                return Err(SerialError::Stalled(self.frame_timeout));
            };

            match frame.frame_type {
                FrameType::Start => {
                    let Some(size) = frame.start_size() else {
                        tracing::warn!("malformed START ignored");
                        continue;
                    };
                    if inbound.received == 0 && size == inbound.size {
                        tracing::debug!("repeated START");
                    } else {
                        tracing::warn!(name, size, "sender restarted the transfer");
                        inbound.discard();
                        inbound = self.open_inbound(name, size);
                    }
                    self.link.send(&Frame::ack()).await?;
                }
                FrameType::Data => {
                    inbound.store(&frame.payload);
                    self.link.send(&Frame::ack()).await?;
                }
                FrameType::End => {
                    self.link.send(&Frame::ack()).await?;
                    let status = inbound.finish();
                    self.link.send(&Frame::commit(status)).await?;
                    self.last_commit = Some(status);

                    let log = ReceivedLog {
                        name: inbound.name.clone(),
                        size: inbound.size,
                        bytes: inbound.received,
                        commit: status,
                    };
                    if log.is_committed() {
                        tracing::info!(name = log.name, size = log.size, "log received");
                        self.events.publish(LinkEvent::TransferDone);
                    } else {
                        tracing::warn!(
                            name = log.name,
                            size = log.size,
                            bytes = log.bytes,
                            status = log.commit,
                            "log refused"
                        );
                        self.events.publish(LinkEvent::TransferError);
                    }
                    return Ok(Some(log));
                }
                FrameType::Ack | FrameType::Commit => {
                    tracing::debug!(kind = ?frame.frame_type, "unexpected frame from sender")
                }
            }
        }
    }

    async fn await_start(
        &mut self,
        name: &str,
        wait: Duration,
    ) -> Result<Option<Inbound>, SerialError> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(frame) = self.link.recv(remaining).await? else {
                return Ok(None);
            };
            match frame.frame_type {
                FrameType::Start => match frame.start_size() {
                    Some(size) => {
                        self.link.send(&Frame::ack()).await?;
                        self.last_commit = None;
                        return Ok(Some(self.open_inbound(name, size)));
                    }
                    None => tracing::warn!("malformed START ignored"),
                },
                // The sender missed our ACK or COMMIT for the last transfer.
                FrameType::End => {
                    self.link.send(&Frame::ack()).await?;
                    if let Some(status) = self.last_commit {
                        tracing::debug!(status, "replaying COMMIT");
                        self.link.send(&Frame::commit(status)).await?;
                    }
                }
                FrameType::Data => tracing::warn!("DATA outside a transfer ignored"),
                FrameType::Ack | FrameType::Commit => {}
            }
        }
    }

    fn open_inbound(&self, name: &str, size: u32) -> Inbound {
        tracing::info!(name, size, "receiving log");
        self.events.publish(LinkEvent::TransferStarted);
        let (sink, storage_failed) = match self.sinks.create(name) {
            Ok(sink) => (Some(sink), false),
            Err(e) => {
                tracing::warn!(name, error = %e, "could not create sink");
                (None, true)
            }
        };
        Inbound {
            name: name.to_string(),
            size,
            received: 0,
            sink,
            storage_failed,
        }
    }
}
