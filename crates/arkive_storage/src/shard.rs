//! Sharded path derivation.
//!
//! A payload for resource `N` lives at
//!
//! ```text
//! <root>/<N % 100>/<(N / 100) % 100>/.../<N>
//! ```
//!
//! with exactly `depth` two-digit directory levels, so no directory ever has
//! more than 100 subdirectories regardless of corpus size.

use std::path::{Path, PathBuf};

/// Fan-out of every shard level.
pub const SHARD_FANOUT: u64 = 100;

/// Returns the directory segments for `id` at the given depth.
#[must_use]
pub fn shard_segments(id: u64, depth: u32) -> Vec<String> {
    let mut rest = id;
    (0..depth)
        .map(|_| {
            let segment = format!("{:02}", rest % SHARD_FANOUT);
            rest /= SHARD_FANOUT;
            segment
        })
        .collect()
}

/// Returns the directory holding the payload of `id`.
#[must_use]
pub fn shard_dir(root: &Path, id: u64, depth: u32) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(shard_segments(id, depth));
    path
}

/// Returns the full live payload path of `id`.
///
/// This is a pure function; it never touches the filesystem.
#[must_use]
pub fn shard_path(root: &Path, id: u64, depth: u32) -> PathBuf {
    shard_dir(root, id, depth).join(id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn peels_two_digits_per_level() {
        let path = shard_path(Path::new("/data"), 123_456, 2);
        assert_eq!(path, PathBuf::from("/data/56/34/123456"));
    }

    #[test]
    fn pads_small_ids() {
        let path = shard_path(Path::new("/data"), 7, 3);
        assert_eq!(path, PathBuf::from("/data/07/00/00/7"));
    }

    #[test]
    fn zero_depth_is_flat() {
        assert_eq!(shard_path(Path::new("/r"), 42, 0), PathBuf::from("/r/42"));
    }

    proptest! {
        #[test]
        fn derivation_is_deterministic(id in any::<u64>(), depth in 0u32..6) {
            let root = Path::new("/root");
            let a = shard_path(root, id, depth);
            let b = shard_path(root, id, depth);
            prop_assert_eq!(&a, &b);

            let rel = a.strip_prefix(root).unwrap();
            let parts: Vec<_> = rel.iter().map(|p| p.to_string_lossy().into_owned()).collect();
            prop_assert_eq!(parts.len(), depth as usize + 1);
            for part in &parts[..depth as usize] {
                prop_assert_eq!(part.len(), 2);
                prop_assert!(part.chars().all(|c| c.is_ascii_digit()));
            }
            prop_assert_eq!(parts.last().unwrap(), &id.to_string());
        }

        #[test]
        fn first_level_is_low_digits(id in any::<u64>()) {
            let segments = shard_segments(id, 1);
            prop_assert_eq!(segments[0].parse::<u64>().unwrap(), id % 100);
        }
    }
}
