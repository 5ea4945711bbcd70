//! Runtime-state key namespacing.
//!
//! | Key | Value |
//! |-----|-------|
//! | `worker.<name>.disabled` | `"true"` / `"false"` |
//! | `<domain>.<job>.next_run_at` | RFC 3339 timestamp |
//! | `<prefix>.<job_id>` | JSON tracking record |

/// Key of the kill switch for a recurring job.
pub fn worker_disabled(name: &str) -> String {
    format!("worker.{name}.disabled")
}

/// Key holding the next eligible run of a job with its own cadence.
pub fn next_run_at(domain: &str, job: &str) -> String {
    format!("{domain}.{job}.next_run_at")
}

/// Key of one tracked external sub-job.
pub fn tracked(prefix: &str, job_id: &str) -> String {
    format!("{prefix}.{job_id}")
}

/// Prefix under which all records of a tracker live (including the separator).
pub fn tracked_prefix(prefix: &str) -> String {
    format!("{prefix}.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(worker_disabled("youtube"), "worker.youtube.disabled");
        assert_eq!(next_run_at("sync", "github"), "sync.github.next_run_at");
        assert_eq!(tracked("ai.batch", "b-17"), "ai.batch.b-17");
        assert!(tracked("ai.batch", "b-17").starts_with(&tracked_prefix("ai.batch")));
    }
}
