//! MinHash LSH banding for near-duplicate candidate discovery.

use std::collections::HashMap;

use famos_hippocampus::SparseCode;

/// Rows per LSH band; 64 MinHash slots give 16 bands of 4.
const BAND_ROWS: usize = 4;

/// Group indices of codes that share at least one LSH band bucket.
///
/// Output groups are disjoint (union-find over bucket collisions) and only
/// groups with two or more members are returned.
pub fn candidate_groups(codes: &[SparseCode]) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..codes.len()).collect();

    fn find(parent: &mut Vec<usize>, x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = x;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }

    let mut buckets: HashMap<(usize, u64), usize> = HashMap::new();
    for (idx, code) in codes.iter().enumerate() {
        for (band, rows) in code.minhash.chunks(BAND_ROWS).enumerate() {
            let mut hasher = blake3::Hasher::new();
            for row in rows {
                hasher.update(&row.to_le_bytes());
            }
            let digest = hasher.finalize();
            let bucket = u64::from_le_bytes(
                digest.as_bytes()[..8].try_into().expect("8 bytes"),
            );
            match buckets.get(&(band, bucket)) {
                Some(&other) => {
                    let a = find(&mut parent, idx);
                    let b = find(&mut parent, other);
                    if a != b {
                        parent[a] = b;
                    }
                }
                None => {
                    buckets.insert((band, bucket), idx);
                }
            }
        }
    }

    let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
    for idx in 0..codes.len() {
        let root = find(&mut parent, idx);
        groups.entry(root).or_default().push(idx);
    }
    let mut out: Vec<Vec<usize>> = groups.into_values().filter(|g| g.len() > 1).collect();
    for group in &mut out {
        group.sort_unstable();
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use famos_hippocampus::DgEncoder;

    #[test]
    fn near_duplicates_share_a_bucket() {
        let enc = DgEncoder::new(64);
        let base = "Grocery run after work, remember milk eggs and the bread Sofia likes. \
                    Pharmacy closes at seven so go there first.";
        let codes = vec![
            enc.encode(base),
            enc.encode(&format!("{base} Also pick up the dry cleaning.")),
            enc.encode("Quarterly tax filing deadline is approaching fast"),
        ];
        let groups = candidate_groups(&codes);
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn unrelated_codes_form_no_groups() {
        let enc = DgEncoder::new(64);
        let codes = vec![
            enc.encode("school pickup at three"),
            enc.encode("the boiler needs servicing in november"),
            enc.encode("birthday cake order for saturday"),
        ];
        assert!(candidate_groups(&codes).is_empty());
    }
}
