//! Multi-level prefix fingerprints over a growing request payload.
//!
//! A single SHA-256 accumulator walks the payload once. At each size threshold
//! the digest of everything fed so far is snapshotted (the accumulator is cloned,
//! never reset), so level `i` is the hash of `payload[..min(LEVEL_THRESHOLDS[i], len)]`.
//! Two payloads where one is a prefix of the other therefore agree on every level
//! the shorter one fully covers.

use sha2::{Digest, Sha256};

/// Byte-length thresholds at which a prefix hash is captured.
pub(crate) const LEVEL_THRESHOLDS: [usize; LEVEL_COUNT] = [8, 64, 512, 4096, 32768, 131072];

pub(crate) const LEVEL_COUNT: usize = 6;

/// Bytes kept from each level's SHA-256 digest.
pub(crate) const LEVEL_HASH_LEN: usize = 16;

pub(crate) type LevelHash = [u8; LEVEL_HASH_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Fingerprint {
    pub(crate) levels: [LevelHash; LEVEL_COUNT],
    /// Highest level whose threshold the payload length reached; 0 when shorter than the first.
    pub(crate) max_level: usize,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self {
            levels: [[0u8; LEVEL_HASH_LEN]; LEVEL_COUNT],
            max_level: 0,
        }
    }
}

impl Fingerprint {
    /// Fingerprint `data` in a single pass. Total work is O(len), independent of level count.
    pub(crate) fn compute(data: &[u8]) -> Self {
        let mut levels = [[0u8; LEVEL_HASH_LEN]; LEVEL_COUNT];
        let mut max_level = 0;
        let mut fed = 0usize;
        let mut hasher = Sha256::new();

        for (idx, &threshold) in LEVEL_THRESHOLDS.iter().enumerate() {
            let end = threshold.min(data.len());
            if end > fed {
                hasher.update(&data[fed..end]);
                fed = end;
            }

            let digest = hasher.clone().finalize();
            levels[idx].copy_from_slice(&digest[..LEVEL_HASH_LEN]);

            if data.len() >= threshold {
                max_level = idx;
            }
        }

        Self { levels, max_level }
    }

    pub(crate) fn level_hex(&self, idx: usize) -> Option<String> {
        self.levels.get(idx).map(hex::encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_deterministic() {
        let data = patterned(70_000, 3);
        assert_eq!(Fingerprint::compute(&data), Fingerprint::compute(&data));
    }

    #[test]
    fn test_empty_payload() {
        let fp = Fingerprint::compute(b"");
        assert_eq!(fp.max_level, 0);
        let empty: [u8; 32] = Sha256::digest(b"").into();
        for level in fp.levels {
            assert_eq!(level, empty[..LEVEL_HASH_LEN]);
        }
    }

    #[test]
    fn test_uniform_bytes() {
        let data = vec![0xAAu8; 200_000];
        let fp = Fingerprint::compute(&data);
        assert_eq!(fp.max_level, 5);
        assert_ne!(fp.levels[0], fp.levels[1]);
    }

    #[test]
    fn test_max_level_boundaries() {
        assert_eq!(Fingerprint::compute(&[1u8; 7]).max_level, 0);
        assert_eq!(Fingerprint::compute(&[1u8; 8]).max_level, 0);
        assert_eq!(Fingerprint::compute(&[1u8; 63]).max_level, 0);
        assert_eq!(Fingerprint::compute(&[1u8; 64]).max_level, 1);
        assert_eq!(Fingerprint::compute(&[1u8; 4096]).max_level, 3);
        assert_eq!(Fingerprint::compute(&[1u8; 40_000]).max_level, 4);
        assert_eq!(Fingerprint::compute(&[1u8; 131_072]).max_level, 5);
    }

    #[test]
    fn test_levels_match_direct_prefix_hash() {
        let data = patterned(5_000, 9);
        let fp = Fingerprint::compute(&data);
        for (idx, &threshold) in LEVEL_THRESHOLDS.iter().enumerate() {
            let end = threshold.min(data.len());
            let direct = Sha256::digest(&data[..end]);
            assert_eq!(fp.levels[idx], direct[..LEVEL_HASH_LEN], "level {idx}");
        }
    }

    #[test]
    fn test_prefix_stability() {
        let base = patterned(10_000, 1);
        let mut grown = base.clone();
        grown.extend(patterned(50_000, 77));

        let short = Fingerprint::compute(&base);
        let long = Fingerprint::compute(&grown);
        for (idx, &threshold) in LEVEL_THRESHOLDS.iter().enumerate() {
            if base.len() >= threshold {
                assert_eq!(short.levels[idx], long.levels[idx], "level {idx}");
            } else {
                assert_ne!(short.levels[idx], long.levels[idx], "level {idx}");
            }
        }
    }

    #[test]
    fn test_level_hex() {
        let fp = Fingerprint::compute(b"hello world");
        assert_eq!(fp.level_hex(0).map(|s| s.len()), Some(32));
        assert!(fp.level_hex(LEVEL_COUNT).is_none());
    }
}
