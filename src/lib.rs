//! flowstat library crate: capture reading, header decoding, the flow
//! engine and report writing. The binary in `main.rs` wires them together;
//! benchmarks and integration tests use them directly.

pub mod capture;
pub mod config;
pub mod display;
pub mod flow;
pub mod protocol;
pub mod report;

use capture::engine::{CaptureError, OfflineCapture};
use flow::FlowEngine;

/// Feed every frame of `capture` through the decoder into `engine`, in file
/// order. Frames that fail to decode are logged and skipped.
///
/// Returns the number of frames that could not be decoded.
pub fn process_capture(
    capture: &mut OfflineCapture,
    engine: &mut FlowEngine,
    mut progress: Option<&mut display::Progress>,
) -> Result<u64, CaptureError> {
    let link = capture.link_type();
    let mut decode_errors: u64 = 0;

    while let Some(frame) = capture.next_frame()? {
        match protocol::parse_frame(link, frame.data) {
            Ok(parsed) => engine.observe(frame.ts, &parsed),
            Err(e) => {
                decode_errors += 1;
                tracing::debug!(
                    error = %e,
                    ts = frame.ts,
                    captured = frame.data.len(),
                    wire_len = frame.wire_len,
                    "frame decode failed"
                );
            }
        }
        if let Some(progress) = progress.as_deref_mut() {
            progress.tick();
        }
    }

    Ok(decode_errors)
}
