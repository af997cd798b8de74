//! Requester: the end of the notify link that pulls logs.
//!
//! Issues start and abort commands, follows the responder's status events,
//! and writes chunk payloads into a sink. Chunks arriving with an index other
//! than the expected one are accepted anyway and the cursor resynchronises to
//! them. The loss is logged and counted, never repaired.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};

use loglink_core::wire::ControlOpcode;
use loglink_core::{ChunkMessage, ControlCommand, ControlEvent, WireError};

use crate::events::{EventBus, LinkEvent};
use crate::session::TransferSession;
use crate::store::{LogSink, SinkFactory};

/// Why a transfer did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferFailure {
    #[error("resource not found on responder")]
    NotFound,
    #[error("responder storage error")]
    Storage,
    #[error("responder busy with another transfer")]
    Busy,
    #[error("transfer aborted")]
    Aborted,
    #[error("link lost during transfer")]
    LinkLost,
    #[error("local sink error: {0}")]
    Sink(String),
}

/// Summary of a transfer that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub name: String,
    pub expected_size: u32,
    pub bytes_received: u32,
    pub chunks: u32,
    /// Times the chunk cursor jumped to an unexpected index.
    pub resyncs: u32,
}

impl TransferReport {
    /// True when every announced byte arrived.
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.expected_size
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(TransferReport),
    Failed {
        name: Option<String>,
        reason: TransferFailure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Invalid(#[from] WireError),
    #[error("a transfer is already in progress")]
    Busy,
    #[error("requester stopped")]
    Stopped,
}

pub struct Requester {
    sinks: Arc<dyn SinkFactory>,
    session: TransferSession,
    sink: Option<Box<dyn LogSink>>,
    link_ready: bool,
    /// Held until the link comes up; a newer request replaces it.
    pending: Option<String>,
    /// Last name sent, used to label the next accepted transfer.
    requested: Option<String>,
    chunks: u32,
    resyncs: u32,
    events: EventBus,
}

impl Requester {
    pub fn new(sinks: Arc<dyn SinkFactory>, events: EventBus) -> Self {
        Self {
            sinks,
            session: TransferSession::new(),
            sink: None,
            link_ready: false,
            pending: None,
            requested: None,
            chunks: 0,
            resyncs: 0,
            events,
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn is_link_ready(&self) -> bool {
        self.link_ready
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Ask for `name`. Returns the encoded command when it can be written now,
    /// or `None` when it is held until the link is ready.
    pub fn request(&mut self, name: &str) -> Result<Option<Bytes>, RequestError> {
        let command = ControlCommand::start(name)?;
        if self.session.is_active() {
            return Err(RequestError::Busy);
        }
        if !self.link_ready {
            if let Some(old) = self.pending.replace(name.to_string()) {
                tracing::debug!(replaced = old, name, "pending request replaced");
            } else {
                tracing::debug!(name, "link not ready, request held");
            }
            return Ok(None);
        }
        self.requested = Some(name.to_string());
        tracing::info!(name, "requesting transfer");
        Ok(Some(command.encode()?))
    }

    pub fn abort(&self) -> Bytes {
        Bytes::from_static(&[ControlOpcode::Abort as u8])
    }

    /// Control channel subscribed. Returns a held request, encoded, if any.
    pub fn on_link_ready(&mut self) -> Option<Bytes> {
        self.link_ready = true;
        self.events.publish(LinkEvent::Connected);
        let name = self.pending.take()?;
        match self.request(&name) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(name, error = %e, "dropping held request");
                None
            }
        }
    }

    pub fn on_link_lost(&mut self) -> Option<TransferOutcome> {
        self.link_ready = false;
        self.events.publish(LinkEvent::Disconnected);
        if !self.session.is_active() {
            return None;
        }
        tracing::warn!(
            name = self.session.resource_name(),
            received = self.session.bytes_transferred(),
            expected = self.session.expected_size(),
            "link lost mid-transfer"
        );
        Some(self.fail(TransferFailure::LinkLost))
    }

    pub fn on_control_message(&mut self, raw: &[u8]) -> Option<TransferOutcome> {
        let event = match ControlEvent::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, bytes = hex::encode(raw), "ignoring status event");
                return None;
            }
        };

        match event {
            ControlEvent::Accepted { size } => self.accept(size),
            ControlEvent::Done => self.complete(),
            ControlEvent::NotFound => Some(self.fail(TransferFailure::NotFound)),
            ControlEvent::Storage => Some(self.fail(TransferFailure::Storage)),
            ControlEvent::Busy => Some(self.fail(TransferFailure::Busy)),
            ControlEvent::Aborted => Some(self.fail(TransferFailure::Aborted)),
        }
    }

    fn accept(&mut self, size: u32) -> Option<TransferOutcome> {
        if self.session.is_active() {
            tracing::warn!(
                name = self.session.resource_name(),
                "accepted while a transfer is active, restarting"
            );
            self.discard_sink();
        }
        let name = self.requested.clone().unwrap_or_else(|| "unnamed".to_string());
        let sink = match self.sinks.create(&name) {
            Ok(sink) => sink,
            Err(e) => {
                tracing::warn!(name, error = %e, "could not create sink");
                self.session.reset();
                self.events.publish(LinkEvent::TransferError);
                return Some(TransferOutcome::Failed {
                    name: Some(name),
                    reason: TransferFailure::Sink(e.to_string()),
                });
            }
        };
        tracing::info!(name, size, "transfer accepted");
        self.session.begin(&name, size, 0);
        self.sink = Some(sink);
        self.chunks = 0;
        self.resyncs = 0;
        self.events.publish(LinkEvent::TransferStarted);
        None
    }

    fn complete(&mut self) -> Option<TransferOutcome> {
        if !self.session.is_active() {
            tracing::warn!("done with no active transfer");
            return None;
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.finish() {
                return Some(self.fail(TransferFailure::Sink(e.to_string())));
            }
        }
        self.sink = None;
        let report = TransferReport {
            name: self.session.resource_name().to_string(),
            expected_size: self.session.expected_size(),
            bytes_received: self.session.bytes_transferred(),
            chunks: self.chunks,
            resyncs: self.resyncs,
        };
        if report.is_complete() {
            tracing::info!(name = report.name, bytes = report.bytes_received, "transfer complete");
        } else {
            tracing::warn!(
                name = report.name,
                received = report.bytes_received,
                expected = report.expected_size,
                resyncs = report.resyncs,
                "transfer done with missing bytes"
            );
        }
        self.session.reset();
        self.events.publish(LinkEvent::TransferDone);
        Some(TransferOutcome::Completed(report))
    }

    fn fail(&mut self, reason: TransferFailure) -> TransferOutcome {
        let name = if self.session.is_active() {
            Some(self.session.resource_name().to_string())
        } else {
            self.requested.clone()
        };
        tracing::info!(?name, %reason, "transfer failed");
        self.discard_sink();
        self.session.reset();
        self.events.publish(LinkEvent::TransferError);
        TransferOutcome::Failed { name, reason }
    }

    fn discard_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.discard() {
                tracing::warn!(error = %e, "could not discard partial log");
            }
        }
    }

    /// Handle one chunk notification. Returns an outcome only if the chunk
    /// could not be stored.
    pub fn on_chunk_message(&mut self, raw: Bytes) -> Option<TransferOutcome> {
        if !self.session.is_active() {
            tracing::trace!(len = raw.len(), "chunk with no active transfer ignored");
            return None;
        }
        let chunk = match ChunkMessage::decode(raw) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed chunk");
                return None;
            }
        };

        let expected = self.session.next_chunk_index();
        if chunk.index != expected {
            tracing::warn!(expected, got = chunk.index, "chunk index gap, resyncing");
            self.resyncs += 1;
        }

        let remaining = self.session.remaining() as usize;
        let mut payload = &chunk.payload[..];
        if payload.len() > remaining {
            tracing::warn!(
                index = chunk.index,
                len = payload.len(),
                remaining,
                "chunk overruns announced size, truncating"
            );
            payload = &payload[..remaining];
        }

        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.write_chunk(payload) {
                return Some(self.fail(TransferFailure::Sink(e.to_string())));
            }
        }
        self.session.record_chunk(chunk.index, payload.len() as u32);
        self.chunks += 1;
        None
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

pub enum RequesterInput {
    LinkReady,
    LinkLost,
    Control(Bytes),
    Chunk(Bytes),
    Request {
        name: String,
        reply: oneshot::Sender<Result<(), RequestError>>,
    },
    Abort,
}

/// Cloneable front door to a running requester.
#[derive(Clone)]
pub struct RequesterHandle {
    tx: mpsc::Sender<RequesterInput>,
}

impl RequesterHandle {
    /// Queue a transfer request. Resolves once the request is written or held.
    pub async fn request(&self, name: &str) -> Result<(), RequestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RequesterInput::Request {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| RequestError::Stopped)?;
        rx.await.map_err(|_| RequestError::Stopped)?
    }

    pub async fn abort(&self) -> Result<(), RequestError> {
        self.send(RequesterInput::Abort).await
    }

    pub async fn link_ready(&self) -> Result<(), RequestError> {
        self.send(RequesterInput::LinkReady).await
    }

    pub async fn link_lost(&self) -> Result<(), RequestError> {
        self.send(RequesterInput::LinkLost).await
    }

    pub async fn control(&self, raw: Bytes) -> Result<(), RequestError> {
        self.send(RequesterInput::Control(raw)).await
    }

    pub async fn chunk(&self, raw: Bytes) -> Result<(), RequestError> {
        self.send(RequesterInput::Chunk(raw)).await
    }

    async fn send(&self, input: RequesterInput) -> Result<(), RequestError> {
        self.tx.send(input).await.map_err(|_| RequestError::Stopped)
    }
}

pub struct RequesterActor {
    requester: Requester,
    inbox: mpsc::Receiver<RequesterInput>,
    /// Writes to the responder's control channel.
    control_tx: mpsc::Sender<Bytes>,
    outcomes: mpsc::Sender<TransferOutcome>,
    shutdown: broadcast::Receiver<()>,
}

impl RequesterActor {
    pub fn new(
        requester: Requester,
        mailbox_depth: usize,
        control_tx: mpsc::Sender<Bytes>,
        outcomes: mpsc::Sender<TransferOutcome>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, RequesterHandle) {
        let (tx, inbox) = mpsc::channel(mailbox_depth);
        let actor = Self {
            requester,
            inbox,
            control_tx,
            outcomes,
            shutdown,
        };
        (actor, RequesterHandle { tx })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("requester shutting down");
                    return Ok(());
                }

                msg = self.inbox.recv() => {
                    let Some(input) = msg else {
                        tracing::info!("requester handles dropped, exiting");
                        return Ok(());
                    };
                    self.handle(input).await?;
                }
            }
        }
    }

    async fn handle(&mut self, input: RequesterInput) -> anyhow::Result<()> {
        match input {
            RequesterInput::LinkReady => {
                if let Some(command) = self.requester.on_link_ready() {
                    self.write_control(command).await?;
                }
            }
            RequesterInput::LinkLost => {
                if let Some(outcome) = self.requester.on_link_lost() {
                    self.report(outcome).await;
                }
            }
            RequesterInput::Control(raw) => {
                if let Some(outcome) = self.requester.on_control_message(&raw) {
                    self.settle(outcome).await?;
                }
            }
            RequesterInput::Chunk(raw) => {
                if let Some(outcome) = self.requester.on_chunk_message(raw) {
                    self.settle(outcome).await?;
                }
            }
            RequesterInput::Request { name, reply } => {
                let result = match self.requester.request(&name) {
                    Ok(Some(command)) => {
                        self.write_control(command).await?;
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            RequesterInput::Abort => {
                if self.requester.is_link_ready() {
                    let command = self.requester.abort();
                    self.write_control(command).await?;
                }
            }
        }
        Ok(())
    }

    /// A local sink failure leaves the responder streaming, so tell it to stop.
    async fn settle(&mut self, outcome: TransferOutcome) -> anyhow::Result<()> {
        if let TransferOutcome::Failed {
            reason: TransferFailure::Sink(_),
            ..
        } = &outcome
        {
            let command = self.requester.abort();
            self.write_control(command).await?;
        }
        self.report(outcome).await;
        Ok(())
    }

    async fn report(&mut self, outcome: TransferOutcome) {
        if self.outcomes.send(outcome).await.is_err() {
            tracing::debug!("no outcome listener");
        }
    }

    async fn write_control(&mut self, command: Bytes) -> anyhow::Result<()> {
        self.control_tx
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("control channel closed"))
    }
}
