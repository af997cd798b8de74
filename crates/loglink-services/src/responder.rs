//! Responder: the end of the notify link that owns the logs.
//!
//! Takes control commands, opens the named resource, and streams it out as
//! indexed chunks followed by a `Done` event. At most one transfer runs at a
//! time; a second request while one is active is answered with `Busy` and
//! leaves the running transfer untouched.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use loglink_core::config::NotifyConfig;
use loglink_core::wire::{chunk_size_for_mtu, ControlOpcode};
use loglink_core::{ChunkMessage, ControlCommand, ControlEvent, WireError};

use crate::events::{EventBus, LinkEvent};
use crate::session::TransferSession;
use crate::store::{ResourceStore, StoreError};

/// Something the responder wants pushed to the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded status event for the control channel.
    Control(Bytes),
    /// Encoded chunk for the data channel.
    Chunk(Bytes),
}

impl Outbound {
    fn event(event: ControlEvent) -> Self {
        Outbound::Control(event.encode())
    }
}

pub struct Responder {
    store: Arc<dyn ResourceStore>,
    settings: NotifyConfig,
    mtu: u16,
    session: TransferSession,
    source: Option<Box<dyn Read + Send>>,
    buf: Vec<u8>,
    events: EventBus,
}

impl Responder {
    pub fn new(store: Arc<dyn ResourceStore>, settings: NotifyConfig, events: EventBus) -> Self {
        Self {
            store,
            mtu: settings.mtu,
            settings,
            session: TransferSession::new(),
            source: None,
            buf: Vec::new(),
            events,
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn is_active(&self) -> bool {
        self.session.is_active()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Record the negotiated MTU. Applies to the next transfer started.
    pub fn set_mtu(&mut self, mtu: u16) {
        tracing::debug!(mtu, "mtu updated");
        self.mtu = mtu;
    }

    pub fn on_connect(&mut self) {
        self.mtu = self.settings.mtu;
        self.events.publish(LinkEvent::Connected);
    }

    /// The peer went away. Any running transfer is dropped without a reply.
    pub fn on_disconnect(&mut self) {
        if self.session.is_active() {
            tracing::warn!(
                resource = self.session.resource_name(),
                sent = self.session.bytes_transferred(),
                expected = self.session.expected_size(),
                "link lost mid-transfer"
            );
            self.close_source();
            self.events.publish(LinkEvent::TransferError);
        }
        self.events.publish(LinkEvent::Disconnected);
    }

    /// Handle one write to the control channel. Returns the status event to
    /// push back, if any.
    pub fn on_control_message(&mut self, raw: &[u8]) -> Option<ControlEvent> {
        match ControlCommand::decode(raw) {
            Ok(ControlCommand::Nop) => None,
            Ok(ControlCommand::StartTransfer { name }) => Some(self.start(&name)),
            Ok(ControlCommand::Abort) => self.abort(),
            Err(e) if raw.first() == Some(&(ControlOpcode::StartTransfer as u8)) => {
                Some(self.reject_start(e))
            }
            Err(e) => {
                tracing::warn!(error = %e, bytes = %hex::encode(raw), "ignoring control message");
                None
            }
        }
    }

    fn reject_start(&mut self, error: WireError) -> ControlEvent {
        if self.session.is_active() {
            return ControlEvent::Busy;
        }
        tracing::warn!(%error, "start request with unusable name");
        ControlEvent::Storage
    }

    fn start(&mut self, name: &str) -> ControlEvent {
        if self.session.is_active() {
            tracing::info!(
                requested = name,
                active = self.session.resource_name(),
                "start rejected, transfer already active"
            );
            return ControlEvent::Busy;
        }

        let Some(chunk_size) = chunk_size_for_mtu(
            self.mtu,
            self.settings.chunk_ceiling,
            self.settings.overhead_bytes,
        ) else {
            tracing::warn!(mtu = self.mtu, "mtu leaves no room for chunk payload");
            return ControlEvent::Storage;
        };

        self.session.set_requested(name);
        let opened = match self.store.open(name) {
            Ok(opened) => opened,
            Err(StoreError::NotFound(_)) => {
                tracing::info!(resource = name, "requested resource not found");
                self.session.reset();
                return ControlEvent::NotFound;
            }
            Err(e) => {
                tracing::warn!(resource = name, error = %e, "could not open resource");
                self.session.reset();
                return ControlEvent::Storage;
            }
        };

        tracing::info!(resource = name, size = opened.size, chunk_size, "transfer started");
        self.session.begin(name, opened.size, chunk_size);
        self.source = Some(opened.reader);
        self.buf.resize(usize::from(chunk_size), 0);
        self.events.publish(LinkEvent::TransferStarted);
        ControlEvent::Accepted { size: opened.size }
    }

    fn abort(&mut self) -> Option<ControlEvent> {
        if !self.session.is_active() {
            tracing::debug!("abort with no active transfer");
            return None;
        }
        tracing::info!(
            resource = self.session.resource_name(),
            sent = self.session.bytes_transferred(),
            "transfer aborted by requester"
        );
        self.close_source();
        self.events.publish(LinkEvent::TransferError);
        Some(ControlEvent::Aborted)
    }

    /// One pump step: the next chunk, the final `Done`, or nothing when idle.
    pub fn tick(&mut self) -> Option<Outbound> {
        if !self.session.is_active() {
            return None;
        }

        let want = usize::from(self.session.chunk_size()).min(self.session.remaining() as usize);
        let read = if want == 0 {
            Ok(0)
        } else {
            self.read_chunk(want)
        };

        match read {
            Ok(0) => Some(self.finish()),
            Ok(n) => {
                let index = self.session.next_chunk_index();
                self.session.record_chunk(index, n as u32);
                let message = ChunkMessage {
                    index,
                    payload: Bytes::copy_from_slice(&self.buf[..n]),
                };
                tracing::trace!(index, len = n, "chunk");
                Some(Outbound::Chunk(message.encode()))
            }
            Err(e) => {
                tracing::warn!(
                    resource = self.session.resource_name(),
                    error = %e,
                    "read failed mid-transfer"
                );
                self.close_source();
                self.events.publish(LinkEvent::TransferError);
                Some(Outbound::event(ControlEvent::Storage))
            }
        }
    }

    fn read_chunk(&mut self, want: usize) -> io::Result<usize> {
        let Some(source) = self.source.as_mut() else {
            return Ok(0);
        };
        loop {
            match source.read(&mut self.buf[..want]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn finish(&mut self) -> Outbound {
        self.session.set_terminating();
        self.source = None;
        let sent = self.session.bytes_transferred();
        let expected = self.session.expected_size();
        if sent == expected {
            tracing::info!(resource = self.session.resource_name(), bytes = sent, "transfer done");
        } else {
            tracing::warn!(
                resource = self.session.resource_name(),
                sent,
                expected,
                "resource shrank during transfer"
            );
        }
        self.session.reset();
        self.events.publish(LinkEvent::TransferDone);
        Outbound::event(ControlEvent::Done)
    }

    fn close_source(&mut self) {
        self.source = None;
        self.session.reset();
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

/// Inputs delivered by the transport to the responder.
#[derive(Debug, Clone)]
pub enum ResponderInput {
    Connected,
    Disconnected,
    MtuChanged(u16),
    Control(Bytes),
}

/// Cloneable sender side of a responder mailbox.
#[derive(Debug, Clone)]
pub struct ResponderHandle {
    tx: mpsc::Sender<ResponderInput>,
}

impl ResponderHandle {
    pub async fn send(&self, input: ResponderInput) -> anyhow::Result<()> {
        self.tx
            .send(input)
            .await
            .map_err(|_| anyhow::anyhow!("responder stopped"))
    }

    pub async fn control(&self, raw: Bytes) -> anyhow::Result<()> {
        self.send(ResponderInput::Control(raw)).await
    }
}

/// Serializes every responder callback through one task, and runs the pump
/// between them.
pub struct ResponderActor {
    responder: Responder,
    inbox: mpsc::Receiver<ResponderInput>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: broadcast::Receiver<()>,
}

impl ResponderActor {
    pub fn new(
        responder: Responder,
        outbound: mpsc::Sender<Outbound>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, ResponderHandle) {
        let (tx, inbox) = mpsc::channel(responder.settings.mailbox_depth);
        let actor = Self {
            responder,
            inbox,
            outbound,
            shutdown,
        };
        (actor, ResponderHandle { tx })
    }

    fn pump_delay(&self) -> Duration {
        if self.responder.is_active() {
            self.responder.settings.active_interval()
        } else {
            self.responder.settings.idle_interval()
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        // The deadline only moves when the pump fires, so a busy mailbox
        // cannot starve the transfer.
        let pump = tokio::time::sleep(self.pump_delay());
        tokio::pin!(pump);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("responder shutting down");
                    return Ok(());
                }

                msg = self.inbox.recv() => {
                    let Some(input) = msg else {
                        tracing::info!("responder handles dropped, exiting");
                        return Ok(());
                    };
                    self.handle(input).await?;
                    // A transfer that just started should not wait out the idle poll.
                    let due = Instant::now() + self.pump_delay();
                    if due < pump.deadline() {
                        pump.as_mut().reset(due);
                    }
                }

                () = &mut pump => {
                    if let Some(out) = self.responder.tick() {
                        self.push(out).await?;
                    }
                    pump.as_mut().reset(Instant::now() + self.pump_delay());
                }
            }
        }
    }

    async fn handle(&mut self, input: ResponderInput) -> anyhow::Result<()> {
        match input {
            ResponderInput::Connected => self.responder.on_connect(),
            ResponderInput::Disconnected => self.responder.on_disconnect(),
            ResponderInput::MtuChanged(mtu) => self.responder.set_mtu(mtu),
            ResponderInput::Control(raw) => {
                if let Some(event) = self.responder.on_control_message(&raw) {
                    self.push(Outbound::event(event)).await?;
                }
            }
        }
        Ok(())
    }

    async fn push(&mut self, out: Outbound) -> anyhow::Result<()> {
        self.outbound
            .send(out)
            .await
            .map_err(|_| anyhow::anyhow!("responder outbound channel closed"))
    }
}
