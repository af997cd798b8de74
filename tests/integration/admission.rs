use crate::*;

use tokio::sync::{broadcast, mpsc, Mutex};

use loglink_core::config::TriggerConfig;
use loglink_services::{
    trigger_channel, MemorySinkFactory, MemoryStore, SendReport, SerialSender, TriggerSource,
};

/// Wire a trigger worker to a serial sender; each finished job reports on
/// the returned channel.
fn spawn_send_worker(
    store: MemoryStore,
    link: Link,
    trigger: TriggerConfig,
    shutdown: &broadcast::Sender<()>,
) -> (
    loglink_services::TriggerGate,
    mpsc::Receiver<(TriggerSource, Result<SendReport, SerialError>)>,
) {
    let (gate, worker) = trigger_channel(&trigger, shutdown.subscribe());
    let sender = Arc::new(Mutex::new(SerialSender::new(
        link,
        &fast_serial(),
        EventBus::new(),
    )));
    let (done_tx, done_rx) = mpsc::channel(8);

    tokio::spawn(worker.run(move |request| {
        let sender = sender.clone();
        let store = store.clone();
        let done_tx = done_tx.clone();
        async move {
            let result = sender.lock().await.send_log(&store, "log").await;
            let _ = done_tx.send((request.source, result)).await;
        }
    }));
    (gate, done_rx)
}

#[tokio::test]
async fn burst_of_presses_sends_once() {
    let (a, b) = relayed_pair(keep_all(), keep_all());
    let sinks = MemorySinkFactory::new();
    spawn_receiver(b, Arc::new(sinks.clone()), "in");

    let store = MemoryStore::new();
    store.insert("log", sample_log(800));
    let (shutdown_tx, _) = broadcast::channel(1);
    let trigger = TriggerConfig {
        queue_depth: 4,
        debounce_ms: 200,
    };
    let (gate, mut done) = spawn_send_worker(store.clone(), a, trigger, &shutdown_tx);

    // Contact bounce: only the first edge counts.
    assert!(gate.press());
    for _ in 0..5 {
        assert!(!gate.press());
    }

    let (source, result) = done.recv().await.unwrap();
    assert_eq!(source, TriggerSource::Button);
    assert_eq!(result.unwrap().size, 800);
    assert_eq!(store.contents("log").unwrap().len(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(done.try_recv().is_err());
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn requests_during_a_send_are_dropped() {
    // The receiver never answers, so the job runs for the whole retry budget.
    let (a, _b) = relayed_pair(Box::new(|_| true), keep_all());
    let store = MemoryStore::new();
    store.insert("log", sample_log(100));
    let (shutdown_tx, _) = broadcast::channel(1);
    let trigger = TriggerConfig {
        queue_depth: 4,
        debounce_ms: 0,
    };
    let (gate, mut done) = spawn_send_worker(store.clone(), a, trigger, &shutdown_tx);

    assert!(gate.request());
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(gate.is_busy());
    assert!(!gate.request());
    assert!(!gate.press());

    let (source, result) = done.recv().await.unwrap();
    assert_eq!(source, TriggerSource::Api);
    assert!(matches!(result, Err(SerialError::NoAck { .. })));
    assert_eq!(store.contents("log").unwrap().len(), 100);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!gate.is_busy());
    assert!(done.try_recv().is_err());
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn empty_log_is_skipped_without_traffic() {
    let (a, b) = relayed_pair(keep_all(), keep_all());
    let sinks = MemorySinkFactory::new();
    spawn_receiver(b, Arc::new(sinks.clone()), "in");

    let store = MemoryStore::new();
    store.insert("log", Vec::new());
    let (shutdown_tx, _) = broadcast::channel(1);
    let (gate, mut done) =
        spawn_send_worker(store, a, TriggerConfig::default(), &shutdown_tx);

    assert!(gate.request());
    let (_, result) = done.recv().await.unwrap();
    assert!(matches!(result, Err(SerialError::EmptySource(_))));
    assert!(sinks.names().is_empty());
    let _ = shutdown_tx.send(());
}
