//! ID and timestamp utilities
//!
//! Job, analysis, worker and role ids are integers allocated by the store.
//! Meadows name their own processes; the helpers here generate those names.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a process id for a worker launched by a meadow
///
/// Format: `{meadow}-{timestamp_ms}-{random_hex}`
/// Example: `local-1738300800123-a1b2`
pub fn generate_process_id(meadow: &str) -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{}-{:04x}", meadow, now_ms(), random)
}

/// Generate the submission name for a batch of cluster workers
///
/// Format: `{pipeline}-{analysis}-{random_hex}`
pub fn generate_submission_name(pipeline: &str, analysis: &str) -> String {
    let random: u16 = rand::rng().random();
    format!("{}-{}-{:04x}", pipeline, analysis, random)
}
