//! Size-per-minute budget calculations.
//!
//! Pure functions shared by the encode pipeline and the estimate pass, so the
//! preview numbers and the real skip decision always agree.

/// Bytes in one megabyte as used by every MB figure in the pipeline.
pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fixed audio bitrate reserved out of the budget (192 kbps).
pub const AUDIO_BITRATE_BPS: f64 = 192.0 * 1024.0;

/// Headroom factor applied to the budget; the encoder only approximately
/// honors a bitrate target.
pub const SAFETY_FACTOR: f64 = 0.9;

/// Lowest video bitrate handed to the encoder.
pub const MIN_VIDEO_BITRATE_BPS: f64 = 300_000.0;

/// Convert a byte count to megabytes.
pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// Megabytes per minute of media.
///
/// A zero, negative or non-finite duration divides by one minute instead, so
/// the result is always finite for finite sizes.
pub fn rate(size_mb: f64, duration_secs: f64) -> f64 {
    let minutes = duration_secs / 60.0;
    if minutes.is_finite() && minutes > 0.0 {
        size_mb / minutes
    } else {
        size_mb
    }
}

/// Whether a file with the given rate is already within budget.
///
/// `limit` is the target rate plus the threshold.
pub fn within_budget(rate_mb_per_min: f64, limit: f64) -> bool {
    rate_mb_per_min < limit
}

/// Video bitrate in bits per second for a target rate in MB/min.
///
/// # Arguments
/// * `target_rate` - Budget in MB per minute
///
/// # Returns
/// The budget converted to bits per second, scaled by [`SAFETY_FACTOR`], minus
/// the audio reservation, never lower than [`MIN_VIDEO_BITRATE_BPS`].
pub fn target_video_bitrate(target_rate: u32) -> f64 {
    let budget_bps = target_rate as f64 * 8.0 * BYTES_PER_MB / 60.0;
    (budget_bps * SAFETY_FACTOR - AUDIO_BITRATE_BPS).max(MIN_VIDEO_BITRATE_BPS)
}
