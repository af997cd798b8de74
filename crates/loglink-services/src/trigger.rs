//! Admission control for send jobs.
//!
//! Requests come from a physical button (via an interrupt or signal) and from
//! an API call. Button presses are debounced. Every request is dropped while
//! a job runs, and requests that piled up before the worker woke are
//! collapsed into one job.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use loglink_core::config::TriggerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Button,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerRequest {
    pub source: TriggerSource,
}

/// Ignores events closer together than `window`.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// True if an event at `now` is a real press.
    pub fn accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

/// Cloneable entry point for trigger sources. Never blocks.
#[derive(Clone)]
pub struct TriggerGate {
    tx: mpsc::Sender<TriggerRequest>,
    busy: Arc<AtomicBool>,
    debouncer: Arc<Mutex<Debouncer>>,
}

impl TriggerGate {
    /// A button press. Returns true if a job was queued.
    pub fn press(&self) -> bool {
        let real = self
            .debouncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accept(Instant::now());
        if !real {
            tracing::trace!("press debounced");
            return false;
        }
        self.offer(TriggerSource::Button)
    }

    /// An API request. Returns true if a job was queued.
    pub fn request(&self) -> bool {
        self.offer(TriggerSource::Api)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn offer(&self, source: TriggerSource) -> bool {
        if self.is_busy() {
            tracing::debug!(?source, "job running, trigger dropped");
            return false;
        }
        match self.tx.try_send(TriggerRequest { source }) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(?source, error = %e, "trigger queue full, dropped");
                false
            }
        }
    }
}

/// Clears the busy flag however the job ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The single consumer of trigger requests.
pub struct TriggerWorker {
    rx: mpsc::Receiver<TriggerRequest>,
    busy: Arc<AtomicBool>,
    shutdown: broadcast::Receiver<()>,
}

pub fn trigger_channel(
    config: &TriggerConfig,
    shutdown: broadcast::Receiver<()>,
) -> (TriggerGate, TriggerWorker) {
    let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
    let busy = Arc::new(AtomicBool::new(false));
    let gate = TriggerGate {
        tx,
        busy: busy.clone(),
        debouncer: Arc::new(Mutex::new(Debouncer::new(config.debounce()))),
    };
    let worker = TriggerWorker { rx, busy, shutdown };
    (gate, worker)
}

impl TriggerWorker {
    /// Run `job` once per admitted request until shutdown or until every
    /// gate is dropped. Jobs never overlap.
    pub async fn run<F, Fut>(mut self, mut job: F) -> anyhow::Result<()>
    where
        F: FnMut(TriggerRequest) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let request = tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("trigger worker shutting down");
                    return Ok(());
                }

                msg = self.rx.recv() => match msg {
                    Some(request) => request,
                    None => {
                        tracing::info!("trigger gates dropped, worker exiting");
                        return Ok(());
                    }
                },
            };

            if self.busy.swap(true, Ordering::SeqCst) {
                tracing::debug!("worker already busy, request dropped");
                continue;
            }
            let _guard = BusyGuard(self.busy.clone());

            let mut collapsed = 0;
            while self.rx.try_recv().is_ok() {
                collapsed += 1;
            }
            tracing::info!(source = ?request.source, collapsed, "send job starting");
            job(request).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(queue_depth: usize, debounce_ms: u64) -> TriggerConfig {
        TriggerConfig {
            queue_depth,
            debounce_ms,
        }
    }

    #[test]
    fn debouncer_suppresses_bounce() {
        let start = Instant::now();
        let mut d = Debouncer::new(Duration::from_millis(200));
        assert!(d.accept(start));
        assert!(!d.accept(start + Duration::from_millis(50)));
        assert!(!d.accept(start + Duration::from_millis(199)));
        assert!(d.accept(start + Duration::from_millis(200)));
    }

    #[test]
    fn gate_press_is_debounced() {
        let (_tx, rx) = broadcast::channel(1);
        let (gate, _worker) = trigger_channel(&config(4, 10_000), rx);
        assert!(gate.press());
        assert!(!gate.press());
        assert!(gate.request());
    }

    #[test]
    fn queue_full_drops_requests() {
        let (_tx, rx) = broadcast::channel(1);
        let (gate, _worker) = trigger_channel(&config(2, 0), rx);
        assert!(gate.request());
        assert!(gate.request());
        assert!(!gate.request());
    }

    #[tokio::test]
    async fn queued_duplicates_collapse_into_one_job() {
        let (shutdown_tx, rx) = broadcast::channel(1);
        let (gate, worker) = trigger_channel(&config(4, 0), rx);
        assert!(gate.request());
        assert!(gate.request());
        assert!(gate.request());

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = tokio::spawn(worker.run(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn triggers_during_a_job_are_dropped() {
        let (shutdown_tx, rx) = broadcast::channel(1);
        let (gate, worker) = trigger_channel(&config(4, 0), rx);
        let (started_tx, mut started_rx) = mpsc::channel(4);
        let (release_tx, release_rx) = mpsc::channel::<()>(1);
        let release_rx = Arc::new(tokio::sync::Mutex::new(release_rx));

        let task = tokio::spawn(worker.run(move |request| {
            let started_tx = started_tx.clone();
            let release_rx = release_rx.clone();
            async move {
                started_tx.send(request.source).await.unwrap();
                release_rx.lock().await.recv().await;
            }
        }));

        assert!(gate.press());
        assert_eq!(started_rx.recv().await.unwrap(), TriggerSource::Button);
        assert!(gate.is_busy());
        assert!(!gate.request());
        assert!(!gate.press());

        release_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gate.is_busy());
        assert!(gate.request());
        assert_eq!(started_rx.recv().await.unwrap(), TriggerSource::Api);

        release_tx.send(()).await.unwrap();
        shutdown_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
