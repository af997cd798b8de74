use crate::*;

use tokio::sync::broadcast;

use loglink_services::{
    DirStore, FileSinkFactory, LinkEvent, LoopbackBuilder, MemorySinkFactory, MemoryStore,
    TransferFailure, TransferOutcome,
};

async fn wait_for_event(rx: &mut broadcast::Receiver<LinkEvent>, want: LinkEvent) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while rx.recv().await.ok() != Some(want) {}
    })
    .await
    .expect("event did not arrive");
}

#[tokio::test]
async fn pulls_a_log_from_disk_into_the_inbox() {
    let dir = TempDir::new("notify-disk");
    let logs = dir.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    let data = sample_log(1000);
    std::fs::write(logs.join("gps_points.csv"), &data).unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut lb = LoopbackBuilder::new(
        Arc::new(DirStore::new(&logs)),
        Arc::new(FileSinkFactory::new(dir.path().join("inbox"))),
    )
    .settings(fast_notify(247))
    .spawn(&shutdown_tx);

    lb.requester.request("gps_points.csv").await.unwrap();
    let TransferOutcome::Completed(report) = lb.outcomes.recv().await.unwrap() else {
        panic!("expected completion")
    };
    assert_eq!(report.expected_size, 1000);
    assert_eq!(report.bytes_received, 1000);
    // 6 x 160 + 40
    assert_eq!(report.chunks, 7);
    assert_eq!(
        std::fs::read(dir.path().join("inbox").join("gps_points.csv")).unwrap(),
        data
    );
    // The notify profile never clears the source.
    assert_eq!(std::fs::read(logs.join("gps_points.csv")).unwrap(), data);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn lost_chunk_resyncs_and_reports_short() {
    let store = MemoryStore::new();
    store.insert("log", sample_log(1000));
    let sinks = MemorySinkFactory::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut lb = LoopbackBuilder::new(Arc::new(store.clone()), Arc::new(sinks.clone()))
        .settings(fast_notify(247))
        .lose_chunks(|index| index == 4)
        .spawn(&shutdown_tx);

    lb.requester.request("log").await.unwrap();
    let TransferOutcome::Completed(report) = lb.outcomes.recv().await.unwrap() else {
        panic!("expected completion")
    };
    assert_eq!(report.resyncs, 1);
    assert_eq!(report.chunks, 6);
    assert_eq!(report.bytes_received, 840);
    assert!(!report.is_complete());

    let mut expected = sample_log(1000);
    expected.drain(640..800);
    assert_eq!(sinks.file("log").unwrap().data, expected);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn small_mtu_uses_small_chunks() {
    let store = MemoryStore::new();
    store.insert("log", sample_log(100));
    let sinks = MemorySinkFactory::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    let mut lb = LoopbackBuilder::new(Arc::new(store), Arc::new(sinks.clone()))
        .settings(fast_notify(23))
        .spawn(&shutdown_tx);

    lb.requester.request("log").await.unwrap();
    let TransferOutcome::Completed(report) = lb.outcomes.recv().await.unwrap() else {
        panic!("expected completion")
    };
    // 18-byte chunks: 5 x 18 + 10
    assert_eq!(report.chunks, 6);
    assert!(report.is_complete());
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn missing_log_fails_with_not_found() {
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut lb = LoopbackBuilder::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemorySinkFactory::new()),
    )
    .settings(fast_notify(247))
    .spawn(&shutdown_tx);

    lb.requester.request("nope.csv").await.unwrap();
    assert_eq!(
        lb.outcomes.recv().await.unwrap(),
        TransferOutcome::Failed {
            name: Some("nope.csv".into()),
            reason: TransferFailure::NotFound
        }
    );
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn abort_mid_transfer_closes_the_source() {
    let store = MemoryStore::new();
    store.insert("log", sample_log(50_000));
    let sinks = MemorySinkFactory::new();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let (shutdown_tx, _) = broadcast::channel(1);

    let settings = NotifyConfig {
        active_interval_ms: 2,
        ..fast_notify(247)
    };
    let mut lb = LoopbackBuilder::new(Arc::new(store.clone()), Arc::new(sinks.clone()))
        .settings(settings)
        .events(events)
        .spawn(&shutdown_tx);

    lb.requester.request("log").await.unwrap();
    wait_for_event(&mut rx, LinkEvent::TransferStarted).await;
    lb.requester.abort().await.unwrap();

    assert!(matches!(
        lb.outcomes.recv().await.unwrap(),
        TransferOutcome::Failed {
            reason: TransferFailure::Aborted,
            ..
        }
    ));
    assert_eq!(store.open_readers(), 0);
    assert!(sinks.file("log").is_none());
    assert_eq!(store.closed_readers(), 1);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn link_loss_fails_the_requester_side() {
    let store = MemoryStore::new();
    store.insert("log", sample_log(50_000));
    let sinks = MemorySinkFactory::new();
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let (shutdown_tx, _) = broadcast::channel(1);

    let settings = NotifyConfig {
        active_interval_ms: 2,
        ..fast_notify(247)
    };
    let mut lb = LoopbackBuilder::new(Arc::new(store.clone()), Arc::new(sinks.clone()))
        .settings(settings)
        .events(events)
        .spawn(&shutdown_tx);

    lb.requester.request("log").await.unwrap();
    // Once from the responder, once from the requester.
    wait_for_event(&mut rx, LinkEvent::TransferStarted).await;
    wait_for_event(&mut rx, LinkEvent::TransferStarted).await;
    lb.requester.link_lost().await.unwrap();
    lb.responder
        .send(loglink_services::ResponderInput::Disconnected)
        .await
        .unwrap();

    assert!(matches!(
        lb.outcomes.recv().await.unwrap(),
        TransferOutcome::Failed {
            reason: TransferFailure::LinkLost,
            ..
        }
    ));
    wait_for_event(&mut rx, LinkEvent::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.open_readers(), 0);
    assert!(sinks.file("log").is_none());
    let _ = shutdown_tx.send(());
}
