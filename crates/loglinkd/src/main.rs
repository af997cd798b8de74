//! loglinkd: moves GPS logs from a field unit to a collector.
//!
//! Runs one end of a link per invocation:
//!
//!   serial-send     wait for button presses (SIGUSR1) and push the log
//!   serial-receive  accept logs from a sender into the inbox
//!   loopback        fetch a log over the in-process notify link
//!   bridge-receive  collect logs relayed over the bridge line into the inbox

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, Mutex};

use loglink_core::config::LoglinkConfig;
use loglink_services::{
    trigger_channel, BridgeCollector, BridgeForwarder, DirStore, EventBus, FileSinkFactory,
    LoopbackBuilder, SerialReceiver, SerialSender, SinkFactory, TransferOutcome, TriggerRequest,
};

mod device;

/// How long one receive call waits for a START before looping.
const RECEIVE_WAIT: Duration = Duration::from_secs(60);

fn print_usage() {
    println!("Usage: loglinkd [--device <path>] <command>");
    println!();
    println!("Commands:");
    println!("  serial-send [--now] [name]   Send the log on each SIGUSR1 (or at once with --now)");
    println!("  serial-receive               Receive logs into the inbox directory");
    println!("  loopback [--bridge] [name]   Fetch a log over the in-process notify link");
    println!("  bridge-receive               Collect relayed logs into the inbox directory");
    println!();
    println!("Options:");
    println!("  --device <path>   Serial device (default from config)");
    println!("  --bridge          Relay received logs to the bridge device instead of the inbox");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = LoglinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = LoglinkConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        LoglinkConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut now = false;
    let mut bridge = false;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--device" => {
                i += 1;
                config.serial.device =
                    PathBuf::from(args.get(i).context("--device requires a value")?);
            }
            "--now" => now = true,
            "--bridge" => bridge = true,
            other => remaining.push(other),
        }
        i += 1;
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let events = EventBus::new();
    spawn_indicator(&events, shutdown_tx.subscribe());

    let default_name = config.storage.default_log_name.clone();
    match remaining.as_slice() {
        ["serial-send"] => cmd_serial_send(&config, &default_name, now, events, &shutdown_tx).await,
        ["serial-send", name] => cmd_serial_send(&config, name, now, events, &shutdown_tx).await,
        ["serial-receive"] => cmd_serial_receive(&config, events, &shutdown_tx).await,
        ["loopback"] => cmd_loopback(&config, &default_name, bridge, events, &shutdown_tx).await,
        ["loopback", name] => cmd_loopback(&config, name, bridge, events, &shutdown_tx).await,
        ["bridge-receive"] => cmd_bridge_receive(&config, events, &shutdown_tx).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

/// Mirrors link events into the log, standing in for status LEDs.
fn spawn_indicator(events: &EventBus, mut shutdown: broadcast::Receiver<()>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = rx.recv() => match event {
                    Ok(event) => tracing::info!(?event, "indicator"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "indicator lagged")
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    });
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_serial_send(
    config: &LoglinkConfig,
    name: &str,
    now: bool,
    events: EventBus,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let link = device::open_link(&config.serial.device)?;
    let sender = Arc::new(Mutex::new(SerialSender::new(link, &config.serial, events)));
    let store = Arc::new(DirStore::new(&config.storage.log_root));
    tracing::info!(
        root = %config.storage.log_root.display(),
        name,
        "serial sender ready"
    );

    let (gate, worker) = trigger_channel(&config.trigger, shutdown_tx.subscribe());

    let mut presses = signal(SignalKind::user_defined1()).context("failed to watch SIGUSR1")?;
    let button_gate = gate.clone();
    let mut shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                got = presses.recv() => {
                    if got.is_none() {
                        return;
                    }
                    if button_gate.press() {
                        tracing::info!("button press accepted");
                    }
                }
            }
        }
    });

    if now && !gate.request() {
        tracing::warn!("immediate send not queued");
    }

    let name = name.to_string();
    worker
        .run(move |request: TriggerRequest| {
            let sender = sender.clone();
            let store = store.clone();
            let name = name.clone();
            async move {
                tracing::debug!(source = ?request.source, "send job");
                let mut sender = sender.lock().await;
                // Outcome is logged by the sender; the source survives any failure.
                let _ = sender.send_log(store.as_ref(), &name).await;
            }
        })
        .await
}

async fn cmd_serial_receive(
    config: &LoglinkConfig,
    events: EventBus,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let link = device::open_link(&config.serial.device)?;
    let sinks = Arc::new(FileSinkFactory::new(&config.storage.inbox_path));
    let mut receiver = SerialReceiver::new(link, sinks, &config.serial, events);
    tracing::info!(inbox = %config.storage.inbox_path.display(), "serial receiver ready");

    let mut shutdown = shutdown_tx.subscribe();
    loop {
        let name = inbox_name(&config.storage.default_log_name);
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("receiver shutting down");
                return Ok(());
            }
            result = receiver.next_transfer(&name, RECEIVE_WAIT) => match result {
                Ok(Some(log)) if log.is_committed() => {
                    tracing::info!(name = log.name, size = log.size, "stored")
                }
                Ok(Some(_)) | Ok(None) => {}
                Err(loglink_services::SerialError::LinkClosed) => {
                    anyhow::bail!("serial device closed");
                }
                Err(e) => tracing::warn!(error = %e, "receive failed"),
            },
        }
    }
}

async fn cmd_loopback(
    config: &LoglinkConfig,
    name: &str,
    bridge: bool,
    events: EventBus,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let store = Arc::new(DirStore::new(&config.storage.log_root));
    let mut forwarder_task = None;
    let sinks: Arc<dyn SinkFactory> = if bridge {
        let line = device::open_bridge(&config.bridge.device, true)?;
        let (forwarder, relay) = BridgeForwarder::new(line, &events, shutdown_tx.subscribe());
        forwarder_task = Some(tokio::spawn(async move {
            if let Err(e) = forwarder.run().await {
                tracing::error!(error = %e, "bridge forwarder failed");
            }
        }));
        Arc::new(relay)
    } else {
        Arc::new(FileSinkFactory::new(&config.storage.inbox_path))
    };
    let mut loopback = LoopbackBuilder::new(store, sinks)
        .settings(config.notify.clone())
        .events(events)
        .spawn(shutdown_tx);

    loopback
        .requester
        .request(name)
        .await
        .with_context(|| format!("request for {name} refused"))?;

    let mut shutdown = shutdown_tx.subscribe();
    let outcome = tokio::select! {
        _ = shutdown.recv() => return Ok(()),
        outcome = loopback.outcomes.recv() => outcome.context("requester stopped")?,
    };
    let _ = shutdown_tx.send(());
    // The forwarder drains queued frames on shutdown; let it finish.
    if let Some(task) = forwarder_task {
        let _ = task.await;
    }

    match outcome {
        TransferOutcome::Completed(report) => {
            println!(
                "{}: {} of {} bytes in {} chunks ({} gaps)",
                report.name,
                report.bytes_received,
                report.expected_size,
                report.chunks,
                report.resyncs
            );
            Ok(())
        }
        TransferOutcome::Failed { name, reason } => {
            anyhow::bail!("{}: {}", name.as_deref().unwrap_or("transfer"), reason)
        }
    }
}

async fn cmd_bridge_receive(
    config: &LoglinkConfig,
    events: EventBus,
    shutdown_tx: &broadcast::Sender<()>,
) -> Result<()> {
    let line = device::open_bridge(&config.bridge.device, false)?;
    let sinks = Arc::new(FileSinkFactory::new(&config.storage.inbox_path));
    let mut collector = BridgeCollector::new(line, sinks, config.bridge.idle_timeout(), events);
    tracing::info!(inbox = %config.storage.inbox_path.display(), "bridge collector ready");

    let mut shutdown = shutdown_tx.subscribe();
    loop {
        let name = inbox_name(&config.storage.default_log_name);
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("collector shutting down");
                return Ok(());
            }
            result = collector.next_log(&name, RECEIVE_WAIT) => match result {
                Ok(Some(log)) if log.is_stored() => {
                    tracing::info!(name = log.name, bytes = log.bytes, "stored")
                }
                Ok(Some(_)) | Ok(None) => {}
                Err(loglink_services::SerialError::LinkClosed) => {
                    anyhow::bail!("bridge device closed");
                }
                Err(e) => tracing::warn!(error = %e, "relay failed"),
            },
        }
    }
}

/// Timestamped file name for a received log.
fn inbox_name(base: &str) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{secs}-{base}")
}
