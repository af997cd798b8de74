use crate::*;

use tokio::sync::broadcast;

use loglink_services::{
    BridgeCollector, BridgeForwarder, BridgeSinkFactory, FileSinkFactory, LinkEvent,
    LoopbackBuilder, MemoryStore, RelayEnd, RelayedLog, TransferFailure, TransferOutcome,
};

type HostResult = (Result<Option<RelayedLog>, SerialError>, bool);

/// Relay into a collector writing `name` under `inbox`. Returns the sink
/// factory for the radio end and the collector's task.
fn relay_to_host(
    events: &EventBus,
    shutdown_tx: &broadcast::Sender<()>,
    inbox: &Path,
    name: &'static str,
) -> (BridgeSinkFactory, tokio::task::JoinHandle<HostResult>) {
    let (line_out, line_in) = duplex(1 << 16);
    let (forwarder, relay) = BridgeForwarder::new(line_out, events, shutdown_tx.subscribe());
    tokio::spawn(forwarder.run());

    let mut collector = BridgeCollector::new(
        line_in,
        Arc::new(FileSinkFactory::new(inbox)),
        Duration::from_secs(1),
        EventBus::new(),
    );
    let host = tokio::spawn(async move {
        let log = collector.next_log(name, Duration::from_secs(3)).await;
        (log, collector.peer_connected())
    });
    (relay, host)
}

#[tokio::test]
async fn loopback_log_is_relayed_into_the_host_inbox() {
    let dir = TempDir::new("bridge-relay");
    let inbox = dir.path().join("inbox");
    let store = MemoryStore::new();
    let data = sample_log(1000);
    store.insert("gps_points.csv", data.clone());
    let events = EventBus::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    let (relay, host) = relay_to_host(&events, &shutdown_tx, &inbox, "relayed.csv");
    let mut lb = LoopbackBuilder::new(Arc::new(store), Arc::new(relay))
        .settings(fast_notify(247))
        .events(events)
        .spawn(&shutdown_tx);

    lb.requester.request("gps_points.csv").await.unwrap();
    let TransferOutcome::Completed(report) = lb.outcomes.recv().await.unwrap() else {
        panic!("expected completion")
    };
    assert!(report.is_complete());

    let (log, peer_connected) = host.await.unwrap();
    let log = log.unwrap().unwrap();
    assert!(log.is_stored());
    assert_eq!(log.bytes, 1000);
    assert!(peer_connected);
    assert_eq!(std::fs::read(inbox.join("relayed.csv")).unwrap(), data);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn aborted_relay_leaves_the_host_inbox_empty() {
    let dir = TempDir::new("bridge-abort");
    let inbox = dir.path().join("inbox");
    let store = MemoryStore::new();
    store.insert("log", sample_log(50_000));
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let (shutdown_tx, _) = broadcast::channel(1);

    let (relay, host) = relay_to_host(&events, &shutdown_tx, &inbox, "relayed.csv");
    let settings = NotifyConfig {
        active_interval_ms: 2,
        ..fast_notify(247)
    };
    let mut lb = LoopbackBuilder::new(Arc::new(store), Arc::new(relay))
        .settings(settings)
        .events(events)
        .spawn(&shutdown_tx);

    lb.requester.request("log").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while rx.recv().await.ok() != Some(LinkEvent::TransferStarted) {}
    })
    .await
    .expect("transfer did not start");
    lb.requester.abort().await.unwrap();

    assert!(matches!(
        lb.outcomes.recv().await.unwrap(),
        TransferOutcome::Failed {
            reason: TransferFailure::Aborted,
            ..
        }
    ));
    let (log, _) = host.await.unwrap();
    assert_eq!(log.unwrap().unwrap().end, RelayEnd::Aborted);
    assert_eq!(std::fs::read_dir(&inbox).unwrap().count(), 0);
    let _ = shutdown_tx.send(());
}
