pub mod control;
pub mod link;
pub mod logger;
pub mod pipeline;
pub mod proto;
pub mod task;
pub mod watcher;
pub mod worker;
pub mod zfs;

pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"), "+", env!("GIT_SHA"));

// Migration snapshot conventions:
// short name: vm-migration-<N>, N starting at 1
// fully qualified: zones/<uuid>@vm-migration-<N>
// Ordering between snapshots is numeric on N, never lexicographic.
pub const SNAPSHOT_PREFIX: &str = "vm-migration-";

pub const SNAPSHOT_SEPARATOR: &str = "@";

/// Parse the numeric suffix of a migration snapshot short name.
/// Returns None for names outside the migration naming scheme.
pub fn snapshot_sequence(short_name: &str) -> Option<u64> {
    let suffix = short_name.strip_prefix(SNAPSHOT_PREFIX)?;
    let n: u64 = suffix.parse().ok()?;
    if n == 0 { None } else { Some(n) }
}

/// Format a migration snapshot short name for sequence number `n`.
pub fn snapshot_short_name(n: u64) -> String {
    format!("{SNAPSHOT_PREFIX}{n}")
}

#[cfg(test)]
mod test_naming {
    use super::*;

    #[test]
    fn sequence_roundtrip() {
        assert_eq!(snapshot_sequence("vm-migration-1"), Some(1));
        assert_eq!(snapshot_sequence("vm-migration-10"), Some(10));
        assert_eq!(snapshot_short_name(3), "vm-migration-3");
    }

    #[test]
    fn sequence_rejects_foreign_names() {
        assert_eq!(snapshot_sequence("daily-2024-01-01"), None);
        assert_eq!(snapshot_sequence("vm-migration-"), None);
        assert_eq!(snapshot_sequence("vm-migration-0"), None);
        assert_eq!(snapshot_sequence("vm-migration-x"), None);
    }
}
