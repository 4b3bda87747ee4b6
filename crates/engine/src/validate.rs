//! Post-encode acceptance checks.
//!
//! The encoder's exit code is not authoritative; an output is accepted only
//! when every applicable check passes.

use crate::budget::{bytes_to_mb, rate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest tolerated difference between input and output duration.
pub const MAX_LENGTH_DELTA_SECS: f64 = 8.0;

/// Size and duration of one media file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub size_bytes: u64,
    pub duration_secs: f64,
}

impl Measurement {
    pub fn size_mb(&self) -> f64 {
        bytes_to_mb(self.size_bytes)
    }

    /// MB per minute of this file.
    pub fn rate(&self) -> f64 {
        rate(self.size_mb(), self.duration_secs)
    }
}

/// One acceptance criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Check {
    /// Output duration within [`MAX_LENGTH_DELTA_SECS`] of the input.
    Length,
    /// Output strictly smaller than the input.
    Size,
    /// Output rate below target plus threshold.
    Rate,
}

impl Check {
    pub fn label(&self) -> &'static str {
        match self {
            Check::Length => "length mismatch",
            Check::Size => "size mismatch",
            Check::Rate => "MB/min threshold mismatch",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which checks apply to an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Length, size and rate.
    Full,
    /// Audio-only passes keep the video stream, so only length is checked.
    LengthOnly,
}

/// Result of validating one encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub output: Measurement,
    /// Checks that failed, in check order.
    pub failed: Vec<Check>,
}

impl JobResult {
    pub fn accepted(&self) -> bool {
        self.failed.is_empty()
    }

    /// Composite reason naming every failed check, `None` when accepted.
    pub fn rejection_reason(&self) -> Option<String> {
        if self.accepted() {
            return None;
        }
        Some(
            self.failed
                .iter()
                .map(Check::label)
                .collect::<Vec<_>>()
                .join(", "),
        )
    }
}

/// Validate an encoded output against its input and the budget.
///
/// # Arguments
/// * `input` - The original file
/// * `output` - The encoded file, duration taken from a fresh probe
/// * `rate_limit` - Target rate plus threshold
/// * `mode` - Which checks apply
pub fn evaluate(
    input: &Measurement,
    output: &Measurement,
    rate_limit: f64,
    mode: ValidationMode,
) -> JobResult {
    let mut failed = Vec::new();

    if (output.duration_secs - input.duration_secs).abs() > MAX_LENGTH_DELTA_SECS {
        failed.push(Check::Length);
    }

    if mode == ValidationMode::Full {
        if output.size_bytes >= input.size_bytes {
            failed.push(Check::Size);
        }
        if output.rate() >= rate_limit {
            failed.push(Check::Rate);
        }
    }

    JobResult {
        output: *output,
        failed,
    }
}
