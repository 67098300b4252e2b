//! Local filesystem helpers shared by the processor, scanner, and workers
//!
//! All functions operate on the real tree under the sync root. Temp files
//! for in-flight downloads are named `.<name>.<itemId>.partial` and live in
//! the destination directory so the final rename is atomic.

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};

use onesync_core::domain::item::ContentHashes;
use onesync_core::domain::newtypes::ItemId;
use onesync_core::hash::HashStream;

/// Timestamps closer than this (with matching hashes) are considered equal
pub const MTIME_TOLERANCE_SECS: i64 = 2;

/// Hash a file's content in one pass, returning hashes and byte count
pub fn hash_file(path: &Path) -> std::io::Result<(ContentHashes, u64)> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut stream = HashStream::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        stream.update(&buf[..n]);
    }
    let size = stream.bytes_seen();
    Ok((stream.finalize(), size))
}

/// The temp-file path for a download of `final_path`
///
/// `/sync/A/b.txt` for item `X1` becomes `/sync/A/.b.txt.X1.partial`.
pub fn partial_path(final_path: &Path, item_id: &ItemId) -> PathBuf {
    let name = final_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let parent = final_path.parent().unwrap_or_else(|| Path::new("/"));
    parent.join(format!(".{}.{}.partial", name, item_id.as_str()))
}

/// Returns true for our own temp-file names
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".partial")
}

/// Set a file's modification time
pub fn set_mtime(path: &Path, when: DateTime<Utc>) -> std::io::Result<()> {
    let secs = when.timestamp().max(0) as u64;
    let system_time = UNIX_EPOCH + StdDuration::from_secs(secs);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_modified(system_time))
}

/// Read a file's modification time in UTC at 1 s granularity
pub fn mtime_of(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let modified = std::fs::symlink_metadata(path)?.modified()?;
    Ok(truncate_to_seconds(system_to_utc(modified)))
}

/// Convert a SystemTime to UTC
fn system_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Drop sub-second precision; comparisons run at 1 s granularity
pub fn truncate_to_seconds(when: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(when.timestamp(), 0).unwrap_or(when)
}

/// Compare two timestamps at 1 s granularity with the 2 s tolerance
///
/// Differences below the tolerance are treated as equal; the caller then
/// silently corrects the local mtime to the remote value.
pub fn timestamps_close(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (truncate_to_seconds(a).timestamp() - truncate_to_seconds(b).timestamp()).abs()
        < MTIME_TOLERANCE_SECS
}

/// Ordering of two timestamps after granularity truncation
pub fn compare_seconds(a: DateTime<Utc>, b: DateTime<Utc>) -> std::cmp::Ordering {
    truncate_to_seconds(a)
        .timestamp()
        .cmp(&truncate_to_seconds(b).timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use onesync_core::hash::hash_all;

    #[test]
    fn test_hash_file_matches_in_memory_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.bin");
        let content = b"some file content for hashing";
        std::fs::write(&path, content).unwrap();

        let (hashes, size) = hash_file(&path).unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(hashes.matches(&hash_all(content)), Some(true));
    }

    #[test]
    fn test_partial_path_shape() {
        let item = ItemId::new("X1".to_string()).unwrap();
        let p = partial_path(Path::new("/sync/A/b.txt"), &item);
        assert_eq!(p, PathBuf::from("/sync/A/.b.txt.X1.partial"));
        assert!(is_partial_name(p.file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_is_partial_name() {
        assert!(is_partial_name(".b.txt.X1.partial"));
        assert!(!is_partial_name("b.txt"));
        assert!(!is_partial_name(".hidden"));
        assert!(!is_partial_name("x.partial"));
    }

    #[test]
    fn test_set_and_read_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("f.txt");
        std::fs::write(&path, b"x").unwrap();

        let when: DateTime<Utc> = "2026-01-15T10:30:00Z".parse().unwrap();
        set_mtime(&path, when).unwrap();
        assert_eq!(mtime_of(&path).unwrap(), when);
    }

    #[test]
    fn test_timestamps_close() {
        let a: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let b: DateTime<Utc> = "2026-01-01T00:00:01Z".parse().unwrap();
        let c: DateTime<Utc> = "2026-01-01T00:00:02Z".parse().unwrap();
        let d: DateTime<Utc> = "2026-01-01T00:00:05Z".parse().unwrap();

        assert!(timestamps_close(a, a));
        assert!(timestamps_close(a, b));
        assert!(timestamps_close(b, a));
        // Exactly 2 s apart is no longer "close"
        assert!(!timestamps_close(a, c));
        assert!(!timestamps_close(a, d));
    }

    #[test]
    fn test_subsecond_differences_ignored() {
        let a: DateTime<Utc> = "2026-01-01T00:00:00.900Z".parse().unwrap();
        let b: DateTime<Utc> = "2026-01-01T00:00:00.100Z".parse().unwrap();
        assert_eq!(compare_seconds(a, b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_compare_seconds_ordering() {
        let older: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let newer: DateTime<Utc> = "2026-01-01T00:01:00Z".parse().unwrap();
        assert_eq!(compare_seconds(older, newer), std::cmp::Ordering::Less);
        assert_eq!(compare_seconds(newer, older), std::cmp::Ordering::Greater);
    }
}
