//! Shared primitives (spec.md §2 component F, glossary): flow hashing,
//! TTL-to-hop derivation, IP-ID set overlap, and timing helpers.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

/// Which side of a canonicalized 5-tuple the caller's `(src, sport)` ended
/// up on. Two calls with swapped src/dst always produce the same hash and
/// opposite sides (glossary "Flow hash").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSide {
    /// The caller's (src, sport) sorted first.
    Forward,
    /// The caller's (src, sport) sorted second.
    Reverse,
}

/// Direction-independent 64-bit hash of a 5-tuple. Endpoints are ordered
/// lexicographically by `(ip, port)` before hashing, so `(a, b)` and
/// `(b, a)` always hash equal.
pub fn flow_hash(
    src_ip: IpAddr,
    src_port: u16,
    dst_ip: IpAddr,
    dst_port: u16,
) -> (u64, FlowSide) {
    let src = (src_ip, src_port);
    let dst = (dst_ip, dst_port);
    let (lo, hi, side) = if src <= dst {
        (src, dst, FlowSide::Forward)
    } else {
        (dst, src, FlowSide::Reverse)
    };
    let mut hasher = DefaultHasher::new();
    lo.hash(&mut hasher);
    hi.hash(&mut hasher);
    (hasher.finish(), side)
}

/// Standard initial TTL values used by the overwhelming majority of IP
/// stacks (glossary "Hop / hops").
const STANDARD_INITIAL_TTLS: [u8; 3] = [64, 128, 255];

/// Hop count for a single observed TTL: the standard initial TTL closest to
/// but not below the observation, minus the observation.
fn hops_for_ttl(ttl: u8) -> Option<u8> {
    STANDARD_INITIAL_TTLS
        .iter()
        .filter(|&&initial| initial >= ttl)
        .min()
        .map(|&initial| initial - ttl)
}

/// The most frequently occurring hop count across a TTL sequence, used as
/// the connection's hop estimate. Ties broken by the smaller hop count for
/// determinism. `None` if the sequence is empty or no TTL parses.
pub fn most_likely_hops(ttls: &[u8]) -> Option<u8> {
    let mut counts: std::collections::BTreeMap<u8, u32> = std::collections::BTreeMap::new();
    for &ttl in ttls {
        if let Some(hops) = hops_for_ttl(ttl) {
            *counts.entry(hops).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|&(hops, count)| (count, std::cmp::Reverse(hops)))
        .map(|(hops, _)| hops)
}

/// Default minimum number of IP-IDs that must overlap for the pre-filter in
/// spec.md §4.D.3 to pass (non-microflow case).
pub const MIN_IPID_OVERLAP: usize = 2;
/// Default minimum overlap ratio for the same pre-filter.
pub const MIN_IPID_RATIO: f64 = 0.5;
/// Relaxed minimum overlap for microflow connections (spec.md §4.D.4).
pub const MICROFLOW_MIN_IPID_OVERLAP: usize = 1;

/// Threshold above which the strong-IP-ID override in spec.md §4.D.4 fires.
pub const STRONG_OVERLAP_COUNT: usize = 10;
pub const STRONG_OVERLAP_RATIO: f64 = 0.80;

/// Counts the intersection of two IP-ID sets, stopping early once `cap` is
/// reached. For the small sets (`<10` elements) spec.md §4.D.3 calls out,
/// this is already linear and cheap; the early exit keeps larger sets from
/// doing more work than necessary once the answer is already decided.
pub fn ipid_overlap_count(a: &HashSet<u16>, b: &HashSet<u16>, cap: usize) -> usize {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut count = 0;
    for id in small {
        if large.contains(id) {
            count += 1;
            if count >= cap {
                break;
            }
        }
    }
    count
}

/// Full (uncapped) intersection count, used once a candidate has already
/// passed the capped pre-filter and needs an exact overlap count/ratio for
/// scoring or the strong-override check.
pub fn ipid_overlap_exact(a: &HashSet<u16>, b: &HashSet<u16>) -> usize {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().filter(|id| large.contains(id)).count()
}

/// Overlap ratio = |intersection| / min(|a|, |b|), `0.0` if either is empty.
pub fn overlap_ratio(overlap: usize, a_len: usize, b_len: usize) -> f64 {
    let denom = a_len.min(b_len);
    if denom == 0 {
        0.0
    } else {
        overlap as f64 / denom as f64
    }
}

/// Jaccard similarity between two token multisets rendered as string slices
/// (used for the length-signature feature, spec.md §4.D.4). Tokens are
/// compared as a set, not a multiset: repeated tokens count once.
pub fn jaccard<'a, I, J>(a: I, b: J) -> f64
where
    I: IntoIterator<Item = &'a str>,
    J: IntoIterator<Item = &'a str>,
{
    let a: HashSet<&str> = a.into_iter().collect();
    let b: HashSet<&str> = b.into_iter().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_hash_symmetric() {
        let a = "10.0.0.1".parse().unwrap();
        let b = "10.0.0.2".parse().unwrap();
        let (h1, s1) = flow_hash(a, 1234, b, 443);
        let (h2, s2) = flow_hash(b, 443, a, 1234);
        assert_eq!(h1, h2);
        assert_ne!(s1, s2);
    }

    #[test]
    fn hops_picks_closest_not_below() {
        assert_eq!(hops_for_ttl(60), Some(4));
        assert_eq!(hops_for_ttl(64), Some(0));
        assert_eq!(hops_for_ttl(65), Some(63));
        assert_eq!(hops_for_ttl(250), Some(5));
    }

    #[test]
    fn most_likely_hops_picks_mode() {
        assert_eq!(most_likely_hops(&[60, 60, 59, 120]), Some(4));
        assert_eq!(most_likely_hops(&[]), None);
    }

    #[test]
    fn ipid_overlap_and_ratio() {
        let a: HashSet<u16> = [1, 2, 3, 4].into_iter().collect();
        let b: HashSet<u16> = [3, 4, 5].into_iter().collect();
        let overlap = ipid_overlap_exact(&a, &b);
        assert_eq!(overlap, 2);
        assert!((overlap_ratio(overlap, a.len(), b.len()) - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn jaccard_identical_sets() {
        let a = vec!["C:40", "S:1400", "C:0"];
        let b = vec!["C:40", "S:1400", "C:0"];
        assert_eq!(jaccard(a, b), 1.0);
    }
}
