//! Hashing utilities for pgmon
//!
//! - BLAKE3 fingerprints of node reports (duplicate detection)
//! - HRW (Highest Random Weight) for picking the node responsible for a PG

use serde::Serialize;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Fingerprint a value by hashing its canonical bincode encoding.
///
/// Maps inside the value must be ordered (`BTreeMap`) for the encoding to be
/// canonical.
pub fn fingerprint<T: Serialize>(value: &T) -> crate::Result<String> {
    let bytes = bincode::serialize(value)?;
    Ok(blake3_hash(&bytes))
}

fn hrw_weight(key: &str, node: &str) -> u64 {
    let combined = format!("{}{}", key, node);
    let hash = blake3::hash(combined.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

/// HRW (Highest Random Weight) hashing
///
/// Given a key and a set of nodes, returns nodes sorted by their weight
/// (deterministic based on key).
pub fn hrw_hash(key: &str, nodes: &[String]) -> Vec<String> {
    let mut weights: Vec<(String, u64)> = nodes
        .iter()
        .map(|node| (node.clone(), hrw_weight(key, node)))
        .collect();

    // Sort by weight (descending), ties by name so the order is total
    weights.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    weights.into_iter().map(|(node, _)| node).collect()
}

/// Pick the single highest-weight node for a key
pub fn select_primary(key: &str, nodes: &[String]) -> Option<String> {
    nodes
        .iter()
        .max_by(|a, b| {
            hrw_weight(key, a)
                .cmp(&hrw_weight(key, b))
                .then_with(|| b.cmp(a))
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_blake3_hash() {
        let hash = blake3_hash(b"hello world");
        assert_eq!(hash.len(), 64); // BLAKE3 produces 32 bytes = 64 hex chars
    }

    #[test]
    fn test_fingerprint_is_stable_for_ordered_maps() {
        let mut a = BTreeMap::new();
        a.insert("x", 1u64);
        a.insert("y", 2u64);
        let mut b = BTreeMap::new();
        b.insert("y", 2u64);
        b.insert("x", 1u64);

        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());

        b.insert("y", 3u64);
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_hrw_hash_consistent() {
        let nodes = vec![
            "node1".to_string(),
            "node2".to_string(),
            "node3".to_string(),
        ];

        let sorted1 = hrw_hash("1.0", &nodes);
        let sorted2 = hrw_hash("1.0", &nodes);

        assert_eq!(sorted1, sorted2);
        assert_eq!(sorted1.len(), 3);
    }

    #[test]
    fn test_select_primary_matches_hrw_order() {
        let nodes = vec![
            "osd.0".to_string(),
            "osd.1".to_string(),
            "osd.2".to_string(),
            "osd.3".to_string(),
        ];

        for seed in 0..16 {
            let key = format!("1.{:x}", seed);
            assert_eq!(
                select_primary(&key, &nodes),
                hrw_hash(&key, &nodes).into_iter().next()
            );
        }
        assert_eq!(select_primary("1.0", &[]), None);
    }
}
