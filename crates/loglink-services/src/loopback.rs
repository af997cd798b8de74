//! In-process transport joining a requester to a responder.
//!
//! Stands in for the radio link: control writes go one way, status events
//! and chunks come back. An optional filter drops chunks to model loss.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use loglink_core::config::NotifyConfig;
use loglink_core::ChunkMessage;

use crate::events::EventBus;
use crate::requester::{Requester, RequesterActor, RequesterHandle, TransferOutcome};
use crate::responder::{Outbound, Responder, ResponderActor, ResponderHandle, ResponderInput};
use crate::store::{ResourceStore, SinkFactory};

/// Returns true for chunk indices that should be lost in transit.
pub type ChunkFilter = Box<dyn FnMut(u16) -> bool + Send>;

struct LoopbackLink {
    responder: ResponderHandle,
    requester: RequesterHandle,
    outbound: mpsc::Receiver<Outbound>,
    control: mpsc::Receiver<Bytes>,
    mtu: u16,
    lose_chunk: Option<ChunkFilter>,
    shutdown: broadcast::Receiver<()>,
}

impl LoopbackLink {
    async fn run(mut self) -> anyhow::Result<()> {
        self.responder.send(ResponderInput::Connected).await?;
        self.responder.send(ResponderInput::MtuChanged(self.mtu)).await?;
        self.requester.link_ready().await?;
        tracing::debug!(mtu = self.mtu, "loopback link up");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!("loopback link shutting down");
                    return Ok(());
                }

                out = self.outbound.recv() => {
                    let Some(out) = out else { return Ok(()) };
                    self.deliver(out).await?;
                }

                command = self.control.recv() => {
                    let Some(command) = command else { return Ok(()) };
                    self.responder.control(command).await?;
                }
            }
        }
    }

    async fn deliver(&mut self, out: Outbound) -> anyhow::Result<()> {
        match out {
            Outbound::Control(raw) => self.requester.control(raw).await?,
            Outbound::Chunk(raw) => {
                if let Some(lose) = self.lose_chunk.as_mut() {
                    if let Ok(chunk) = ChunkMessage::decode(raw.clone()) {
                        if lose(chunk.index) {
                            tracing::debug!(index = chunk.index, "chunk lost in transit");
                            return Ok(());
                        }
                    }
                }
                self.requester.chunk(raw).await?
            }
        }
        Ok(())
    }
}

/// A running responder, requester and the link between them.
pub struct Loopback {
    pub requester: RequesterHandle,
    pub responder: ResponderHandle,
    pub outcomes: mpsc::Receiver<TransferOutcome>,
}

pub struct LoopbackBuilder {
    store: Arc<dyn ResourceStore>,
    sinks: Arc<dyn SinkFactory>,
    settings: NotifyConfig,
    events: EventBus,
    lose_chunk: Option<ChunkFilter>,
}

impl LoopbackBuilder {
    pub fn new(store: Arc<dyn ResourceStore>, sinks: Arc<dyn SinkFactory>) -> Self {
        Self {
            store,
            sinks,
            settings: NotifyConfig::default(),
            events: EventBus::new(),
            lose_chunk: None,
        }
    }

    pub fn settings(mut self, settings: NotifyConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn lose_chunks(mut self, filter: impl FnMut(u16) -> bool + Send + 'static) -> Self {
        self.lose_chunk = Some(Box::new(filter));
        self
    }

    /// Spawn all three tasks. They stop when `shutdown` fires.
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Loopback {
        let depth = self.settings.mailbox_depth;
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);
        let (control_tx, control_rx) = mpsc::channel(depth);
        let (outcome_tx, outcome_rx) = mpsc::channel(depth);
        let mtu = self.settings.mtu;

        let responder = Responder::new(self.store, self.settings, self.events.clone());
        let (responder_actor, responder_handle) =
            ResponderActor::new(responder, outbound_tx, shutdown.subscribe());

        let requester = Requester::new(self.sinks, self.events);
        let (requester_actor, requester_handle) = RequesterActor::new(
            requester,
            depth,
            control_tx,
            outcome_tx,
            shutdown.subscribe(),
        );

        let link = LoopbackLink {
            responder: responder_handle.clone(),
            requester: requester_handle.clone(),
            outbound: outbound_rx,
            control: control_rx,
            mtu,
            lose_chunk: self.lose_chunk,
            shutdown: shutdown.subscribe(),
        };

        tokio::spawn(async move {
            if let Err(e) = responder_actor.run().await {
                tracing::error!(error = %e, "responder failed");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = requester_actor.run().await {
                tracing::error!(error = %e, "requester failed");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = link.run().await {
                tracing::error!(error = %e, "loopback link failed");
            }
        });

        Loopback {
            requester: requester_handle,
            responder: responder_handle,
            outcomes: outcome_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySinkFactory, MemoryStore};

    #[tokio::test]
    async fn loopback_moves_a_log() {
        let store = MemoryStore::new();
        store.insert("log.csv", vec![3u8; 400]);
        let sinks = MemorySinkFactory::new();
        let (shutdown_tx, _) = broadcast::channel(1);

        let settings = NotifyConfig {
            mtu: 185,
            active_interval_ms: 0,
            ..NotifyConfig::default()
        };
        let mut lb = LoopbackBuilder::new(Arc::new(store.clone()), Arc::new(sinks.clone()))
            .settings(settings)
            .spawn(&shutdown_tx);

        lb.requester.request("log.csv").await.unwrap();
        let TransferOutcome::Completed(report) = lb.outcomes.recv().await.unwrap() else {
            panic!("expected completion")
        };
        assert!(report.is_complete());
        assert_eq!(report.chunks, 3);
        assert_eq!(sinks.file("log.csv").unwrap().data, vec![3u8; 400]);
        let _ = shutdown_tx.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn actors_run_on_a_work_stealing_runtime() {
        let store = MemoryStore::new();
        store.insert("log.csv", vec![5u8; 300]);
        let sinks = MemorySinkFactory::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let settings = NotifyConfig {
            mtu: 185,
            active_interval_ms: 0,
            ..NotifyConfig::default()
        };
        let depth = settings.mailbox_depth;
        let events = EventBus::new();

        let (outbound_tx, mut outbound_rx) = mpsc::channel(depth);
        let (control_tx, mut control_rx) = mpsc::channel(depth);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(depth);

        let responder = Responder::new(Arc::new(store.clone()), settings, events.clone());
        let (responder_actor, responder) =
            ResponderActor::new(responder, outbound_tx, shutdown_tx.subscribe());
        let requester = Requester::new(Arc::new(sinks.clone()), events);
        let (requester_actor, requester) = RequesterActor::new(
            requester,
            depth,
            control_tx,
            outcome_tx,
            shutdown_tx.subscribe(),
        );

        let responder_task = tokio::spawn(responder_actor.run());
        let requester_task = tokio::spawn(requester_actor.run());

        responder.send(ResponderInput::Connected).await.unwrap();
        responder.send(ResponderInput::MtuChanged(185)).await.unwrap();
        requester.link_ready().await.unwrap();
        requester.request("log.csv").await.unwrap();

        let outcome = loop {
            tokio::select! {
                Some(command) = control_rx.recv() => responder.control(command).await.unwrap(),
                Some(out) = outbound_rx.recv() => match out {
                    Outbound::Control(raw) => requester.control(raw).await.unwrap(),
                    Outbound::Chunk(raw) => requester.chunk(raw).await.unwrap(),
                },
                Some(outcome) = outcome_rx.recv() => break outcome,
            }
        };
        let TransferOutcome::Completed(report) = outcome else {
            panic!("expected completion")
        };
        assert!(report.is_complete());
        assert_eq!(sinks.file("log.csv").unwrap().data, vec![5u8; 300]);

        shutdown_tx.send(()).unwrap();
        responder_task.await.unwrap().unwrap();
        requester_task.await.unwrap().unwrap();
    }
}
