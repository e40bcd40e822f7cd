//! Progress bands for batch jobs.
//!
//! A job's progress is split into a staging band, covering input uploads
//! reported by the ingress side while the job is still `pending`, and an
//! inference band covering sub-units finished by the engine. Only the
//! completion edge ever writes [`COMPLETE`].

/// Progress of a completed job.
pub const COMPLETE: u8 = 100;

/// Highest progress a job can report before it completes.
pub const MAX_IN_FLIGHT: u8 = 99;

/// End of the staging band and start of the inference band.
pub const STAGING_END: u8 = 50;

/// Progress after `done` of `total` inputs have been staged, in `0..=STAGING_END`.
#[must_use]
pub fn staging(done: usize, total: usize) -> u8 {
    interpolate(0, STAGING_END, done, total)
}

/// Progress after `done` of `total` inference units, in `STAGING_END..=MAX_IN_FLIGHT`.
#[must_use]
pub fn inference(done: usize, total: usize) -> u8 {
    interpolate(STAGING_END, MAX_IN_FLIGHT, done, total)
}

fn interpolate(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return start;
    }
    let done = done.min(total) as u64;
    let span = u64::from(end - start);
    // Bounded by `end`, which fits in u8.
    start + (span * done / total as u64) as u8
}

// =============================================================================
// Unit Tests
// =============================================================================
