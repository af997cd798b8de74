//! loglink integration test harness.
//!
//! Runs both ends of each profile in one process. The serial profile goes
//! through an in-memory relay that can drop frames in either direction;
//! the notify profile goes through the loopback link, and the bridge relay
//! runs over an in-memory line.
//!
//!   cargo test --test integration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use loglink_core::config::{NotifyConfig, SerialConfig};
use loglink_core::Frame;
use loglink_services::serial::FrameReader;
use loglink_services::{EventBus, SerialError, SerialLink, SerialReceiver, SinkFactory};

mod admission;
mod bridge;
mod notify;
mod serial;

pub type Link = SerialLink<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A scratch directory removed on drop, even when the test panics.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "loglink-it-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Serial settings scaled down so retry paths finish in milliseconds.
pub fn fast_serial() -> SerialConfig {
    SerialConfig {
        ack_timeout_ms: 40,
        max_attempts: 5,
        commit_timeout_ms: 400,
        ..SerialConfig::default()
    }
}

/// Notify settings with no pump delay.
pub fn fast_notify(mtu: u16) -> NotifyConfig {
    NotifyConfig {
        mtu,
        active_interval_ms: 0,
        idle_interval_ms: 5,
        ..NotifyConfig::default()
    }
}

pub fn sample_log(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i = 0u32;
    while out.len() < len {
        out.extend_from_slice(format!("{i},47.{i:04},-122.{i:04}\n").as_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

/// Decides whether a frame crossing the relay is lost.
pub type DropRule = Box<dyn FnMut(&Frame) -> bool + Send>;

pub fn keep_all() -> DropRule {
    Box::new(|_| false)
}

/// Two serial endpoints joined through a relay that applies `to_receiver`
/// and `to_sender` to each frame before forwarding it.
pub fn relayed_pair(to_receiver: DropRule, to_sender: DropRule) -> (Link, Link) {
    let (sender_io, relay_a) = duplex(8192);
    let (relay_b, receiver_io) = duplex(8192);
    let (a_read, a_write) = tokio::io::split(relay_a);
    let (b_read, b_write) = tokio::io::split(relay_b);

    tokio::spawn(forward(a_read, b_write, to_receiver));
    tokio::spawn(forward(b_read, a_write, to_sender));

    (SerialLink::new(sender_io), SerialLink::new(receiver_io))
}

async fn forward(
    from: ReadHalf<DuplexStream>,
    mut to: WriteHalf<DuplexStream>,
    mut lose: DropRule,
) {
    let mut reader = FrameReader::new(from);
    loop {
        match reader.read_frame(Duration::from_secs(5)).await {
            Ok(Some(frame)) => {
                if lose(&frame) {
                    continue;
                }
                if to.write_all(&frame.encode()).await.is_err() {
                    return;
                }
            }
            Ok(None) => continue,
            Err(_) => return,
        }
    }
}

/// Keep a receiver answering until the test ends.
pub fn spawn_receiver(link: Link, sinks: Arc<dyn SinkFactory>, name: &'static str) {
    let mut receiver = SerialReceiver::new(link, sinks, &fast_serial(), EventBus::new());
    tokio::spawn(async move {
        loop {
            match receiver.next_transfer(name, Duration::from_secs(5)).await {
                Err(SerialError::LinkClosed) => return,
                _ => continue,
            }
        }
    });
}
