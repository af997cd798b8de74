use crate::*;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use loglink_core::frame::COMMIT_SIZE_MISMATCH;
use loglink_core::FrameType;
use loglink_services::{
    DirStore, FileSinkFactory, MemorySinkFactory, MemoryStore, SerialSender,
};

fn sender(link: Link) -> SerialSender<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>> {
    SerialSender::new(link, &fast_serial(), EventBus::new())
}

/// Lose the first ACK sent after `trigger` has been observed going the
/// other way.
fn ack_after(trigger: FrameType) -> (DropRule, DropRule) {
    let seen = Arc::new(AtomicBool::new(false));
    let dropped = Arc::new(AtomicBool::new(false));
    let seen_fwd = seen.clone();
    let to_receiver: DropRule = Box::new(move |frame| {
        if frame.frame_type == trigger {
            seen_fwd.store(true, Ordering::SeqCst);
        }
        false
    });
    let to_sender: DropRule = Box::new(move |frame| {
        frame.frame_type == FrameType::Ack
            && seen.load(Ordering::SeqCst)
            && !dropped.swap(true, Ordering::SeqCst)
    });
    (to_receiver, to_sender)
}

#[tokio::test]
async fn clean_line_delivers_and_clears() {
    let dir = TempDir::new("serial-clean");
    let logs = dir.path().join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    let data = sample_log(1500);
    std::fs::write(logs.join("gps_points.csv"), &data).unwrap();

    let (a, b) = relayed_pair(keep_all(), keep_all());
    spawn_receiver(b, Arc::new(FileSinkFactory::new(dir.path().join("inbox"))), "in.csv");

    let store = DirStore::new(&logs);
    let report = sender(a).send_log(&store, "gps_points.csv").await.unwrap();
    assert_eq!(report.size, 1500);
    assert_eq!(report.retransmissions, 0);

    assert_eq!(std::fs::read(dir.path().join("inbox").join("in.csv")).unwrap(), data);
    assert_eq!(std::fs::metadata(logs.join("gps_points.csv")).unwrap().len(), 0);
}

#[tokio::test]
async fn lost_data_frames_are_retransmitted() {
    let count = Arc::new(AtomicU32::new(0));
    let lost = Arc::new(AtomicU32::new(0));
    let (c, l) = (count.clone(), lost.clone());
    let every_third_data: DropRule = Box::new(move |frame| {
        if frame.frame_type != FrameType::Data {
            return false;
        }
        let n = c.fetch_add(1, Ordering::SeqCst) + 1;
        let drop = n % 3 == 0;
        if drop {
            l.fetch_add(1, Ordering::SeqCst);
        }
        drop
    });

    let (a, b) = relayed_pair(every_third_data, keep_all());
    let sinks = MemorySinkFactory::new();
    spawn_receiver(b, Arc::new(sinks.clone()), "in");

    let store = MemoryStore::new();
    let data = sample_log(2000);
    store.insert("log", data.clone());

    let report = sender(a).send_log(&store, "log").await.unwrap();
    assert!(lost.load(Ordering::SeqCst) > 0);
    assert_eq!(report.retransmissions, lost.load(Ordering::SeqCst));
    assert_eq!(sinks.file("in").unwrap().data, data);
    assert_eq!(store.contents("log").unwrap().len(), 0);
}

#[tokio::test]
async fn lost_start_acks_do_not_restart_the_log() {
    let mut remaining = 2;
    let first_two_acks: DropRule = Box::new(move |frame| {
        if frame.frame_type == FrameType::Ack && remaining > 0 {
            remaining -= 1;
            return true;
        }
        false
    });

    let (a, b) = relayed_pair(keep_all(), first_two_acks);
    let sinks = MemorySinkFactory::new();
    spawn_receiver(b, Arc::new(sinks.clone()), "in");

    let store = MemoryStore::new();
    store.insert("log", sample_log(300));

    let report = sender(a).send_log(&store, "log").await.unwrap();
    assert_eq!(report.retransmissions, 2);
    assert_eq!(sinks.file("in").unwrap().data, sample_log(300));
}

#[tokio::test]
async fn lost_end_ack_is_recovered_by_commit_replay() {
    let (to_receiver, to_sender) = ack_after(FrameType::End);
    let (a, b) = relayed_pair(to_receiver, to_sender);
    let sinks = MemorySinkFactory::new();
    spawn_receiver(b, Arc::new(sinks.clone()), "in");

    let store = MemoryStore::new();
    store.insert("log", sample_log(100));

    let report = sender(a).send_log(&store, "log").await.unwrap();
    assert_eq!(report.retransmissions, 1);
    assert_eq!(store.contents("log").unwrap().len(), 0);
}

#[tokio::test]
async fn lost_data_ack_duplicates_data_and_keeps_source() {
    let dir = TempDir::new("serial-dup");
    let inbox = dir.path().join("inbox");
    let (to_receiver, to_sender) = ack_after(FrameType::Data);
    let (a, b) = relayed_pair(to_receiver, to_sender);
    spawn_receiver(b, Arc::new(FileSinkFactory::new(&inbox)), "in.csv");

    let store = MemoryStore::new();
    store.insert("log", sample_log(600));

    let err = sender(a).send_log(&store, "log").await.unwrap_err();
    assert!(matches!(err, SerialError::Rejected(COMMIT_SIZE_MISMATCH)));
    assert_eq!(store.contents("log").unwrap().len(), 600);
    // The refused copy is gone, partial file included.
    assert_eq!(std::fs::read_dir(&inbox).unwrap().count(), 0);
}

#[tokio::test]
async fn dead_line_gives_up_and_keeps_source() {
    let (a, b) = relayed_pair(Box::new(|_| true), keep_all());
    spawn_receiver(b, Arc::new(MemorySinkFactory::new()), "in");

    let store = MemoryStore::new();
    store.insert("log", sample_log(50));

    let started = tokio::time::Instant::now();
    let err = sender(a).send_log(&store, "log").await.unwrap_err();
    assert!(matches!(
        err,
        SerialError::NoAck {
            frame: FrameType::Start,
            attempts: 5
        }
    ));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(store.contents("log").unwrap().len(), 50);
    assert_eq!(store.open_readers(), 0);
}
