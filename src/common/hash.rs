//! Key routing for shardkv
//!
//! Every key maps to a shard by hashing, and to a node through the
//! shard→master table in ClusterInfo. The hash is pinned to CRC-32
//! (IEEE) so that routing stays stable across versions and languages.

/// Compute the shard id for a key.
pub fn shard_for_key(key: &[u8], num_shards: u32) -> u32 {
    crc32fast::hash(key) % num_shards
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(shard_for_key(b"test-key", 256), shard_for_key(b"test-key", 256));
    }

    #[test]
    fn pinned_to_crc32_ieee() {
        // Standard CRC-32 check value. If this fails, on-disk clusters
        // would route keys to the wrong shard after an upgrade.
        assert_eq!(crc32fast::hash(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn in_range() {
        for i in 0..1000u32 {
            let key = format!("key_{}", i);
            assert!(shard_for_key(key.as_bytes(), 10) < 10);
        }
    }

    #[test]
    fn spreads_across_shards() {
        let mut counts = [0u32; 10];
        for i in 0..1000u32 {
            let key = format!("key_{}", i);
            counts[shard_for_key(key.as_bytes(), 10) as usize] += 1;
        }
        // Uniform would be 100 per shard; allow generous slack.
        assert!(counts.iter().all(|&c| c > 50));
    }
}
