//! JSON-lines event output.

use std::io::Write;

use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use bleherd_core::{DeviceEvent, EventReceiver};

/// Render one event as a single JSON line, without the trailing newline.
pub fn event_line(event: &DeviceEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

/// Write every received event to `out` until the channel closes.
///
/// Returns the number of lines written.
pub async fn write_events<W: Write>(mut events: EventReceiver, mut out: W) -> std::io::Result<u64> {
    let mut written = 0;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Output fell behind, {} events skipped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event_line(&event) {
            Ok(line) => {
                writeln!(out, "{}", line)?;
                out.flush()?;
                written += 1;
            }
            Err(e) => warn!("Could not serialize event for {}: {}", event.device().address, e),
        }
    }
    Ok(written)
}
