//! Serial device access.
//!
//! Line settings (baud, parity, raw mode) are expected to be configured
//! before loglinkd starts, e.g. with `stty`.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::File;

use loglink_services::SerialLink;

/// Open one direction of the bridge line. The bridge carries no replies, so
/// each end only ever reads or only ever writes.
pub fn open_bridge(path: &Path, write: bool) -> Result<File> {
    let file = std::fs::OpenOptions::new()
        .read(!write)
        .write(write)
        .open(path)
        .with_context(|| format!("failed to open bridge device {}", path.display()))?;
    tracing::info!(device = %path.display(), write, "bridge device open");
    Ok(File::from_std(file))
}

/// Open `path` as a serial link.
///
/// Reads and writes use separate handles: a read left pending by a timeout
/// must not hold up the next retransmission.
pub fn open_link(path: &Path) -> Result<SerialLink<File, File>> {
    let reader = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open serial device {}", path.display()))?;
    let writer = reader
        .try_clone()
        .with_context(|| format!("failed to clone handle for {}", path.display()))?;
    tracing::info!(device = %path.display(), "serial device open");
    Ok(SerialLink::from_parts(
        File::from_std(reader),
        File::from_std(writer),
    ))
}
