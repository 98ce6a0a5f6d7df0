//! Deterministic sharding of documents onto Active Transaction Records.

use std::sync::OnceLock;

/// Number of ATRs per bucket, one per vBucket.
pub const NUM_ATRS: u16 = 1024;

const SUFFIX_SEARCH_LIMIT: u32 = 1 << 20;

static ATR_IDS: OnceLock<Vec<String>> = OnceLock::new();

/// The vBucket a key hashes to.
pub fn vbucket_for_key(key: &str) -> u16 {
    let crc = crc32fast::hash(key.as_bytes());
    (((crc >> 16) & 0x7fff) % u32::from(NUM_ATRS)) as u16
}

/// The ATR key responsible for documents in vBucket `vbucket`.
pub fn atr_id_for_vbucket(vbucket: u16) -> &'static str {
    &all_atr_ids()[usize::from(vbucket % NUM_ATRS)]
}

/// Every ATR key of a bucket, indexed by vBucket.
pub fn all_atr_ids() -> &'static [String] {
    ATR_IDS.get_or_init(|| (0..NUM_ATRS).map(generate).collect())
}

// Each ATR key is chosen to live in the vBucket it serves.
fn generate(vbucket: u16) -> String {
    let mut suffix = 0u32;
    loop {
        let candidate = format!("_txn:atr-{vbucket}-#{suffix:x}");
        if vbucket_for_key(&candidate) == vbucket || suffix >= SUFFIX_SEARCH_LIMIT {
            return candidate;
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_same_atr() {
        let vbucket = vbucket_for_key("airline_10");
        assert_eq!(vbucket, vbucket_for_key("airline_10"));
        assert_eq!(atr_id_for_vbucket(vbucket), atr_id_for_vbucket(vbucket + NUM_ATRS));
    }

    #[test]
    fn test_atr_is_colocated_with_its_vbucket() {
        let ids = all_atr_ids();
        assert_eq!(ids.len(), usize::from(NUM_ATRS));
        for (vb, id) in ids.iter().enumerate().take(32) {
            assert_eq!(usize::from(vbucket_for_key(id)), vb);
            assert!(id.starts_with(&format!("_txn:atr-{vb}-#")));
        }
    }

    #[test]
    fn test_vbucket_in_range() {
        for key in ["a", "b", "customer::42", ""] {
            assert!(vbucket_for_key(key) < NUM_ATRS);
        }
    }
}
