//! Mapping between aggregator outcomes and the line-oriented transport.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use metric_window_core::{WindowError, WindowOutcome};
use serde::Serialize;

/// What the transport does with one processed message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Envelope {
    /// Serialized `OutputRecord`, without trailing newline.
    Forward(Vec<u8>),
    Drop,
}

impl Envelope {
    /// # Errors
    /// Returns an error when the output record cannot be serialized.
    pub fn from_outcome(outcome: &WindowOutcome) -> Result<Self> {
        match outcome {
            WindowOutcome::Emit(record) => Ok(Self::Forward(
                serde_json::to_vec(record).context("failed to serialize output record")?,
            )),
            WindowOutcome::Drop(_) => Ok(Self::Drop),
        }
    }
}

/// Wraps a message handler so its outcome is turned into an [`Envelope`].
pub fn msg_forward<F>(handler: F) -> impl Fn(&[u8]) -> Result<Envelope>
where
    F: Fn(&[u8]) -> Result<WindowOutcome, WindowError>,
{
    move |payload| {
        let outcome = handler(payload)?;
        Envelope::from_outcome(&outcome)
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct StreamSummary {
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Feeds every non-blank input line through `forward`, writing forwarded
/// envelopes as NDJSON. Lines are handed over as raw bytes; a failing line,
/// including one that is not UTF-8, is logged and counted and the stream
/// keeps going.
///
/// # Errors
/// Returns an error only when reading input or writing output fails.
pub fn pump<R, W, F>(mut input: R, mut output: W, forward: F) -> Result<StreamSummary>
where
    R: BufRead,
    W: Write,
    F: Fn(&[u8]) -> Result<Envelope>,
{
    let mut summary = StreamSummary::default();
    let mut line = Vec::new();
    let mut line_number = 0_u64;

    loop {
        line.clear();
        let read = input
            .read_until(b'\n', &mut line)
            .context("failed to read input line")?;
        if read == 0 {
            break;
        }
        line_number += 1;

        let record = strip_line_ending(&line);
        if record.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        summary.received += 1;

        match forward(record) {
            Ok(Envelope::Forward(body)) => {
                output
                    .write_all(&body)
                    .and_then(|()| output.write_all(b"\n"))
                    .context("failed to write output record")?;
                summary.emitted += 1;
            }
            Ok(Envelope::Drop) => summary.dropped += 1,
            Err(err) => {
                tracing::error!(line = line_number, error = %format!("{err:#}"), "record failed");
                summary.failed += 1;
            }
        }
    }

    output.flush().context("failed to flush output")?;
    Ok(summary)
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
