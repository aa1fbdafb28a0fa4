//! Weighted feature scoring for the generic path (spec.md §4.D.3, §4.D.4).

use crate::config::ScoringWeights;
use crate::model::score::Score;
use crate::model::Connection;
use crate::primitives::{
    self, MICROFLOW_MIN_IPID_OVERLAP, MIN_IPID_OVERLAP, MIN_IPID_RATIO, STRONG_OVERLAP_COUNT,
    STRONG_OVERLAP_RATIO,
};

/// Port sets overlap iff client or server ports coincide either way
/// (spec.md §4.D.3 rule 1: "share at least one port").
fn ports_compatible(a: &Connection, b: &Connection) -> bool {
    let a_ports = [a.five_tuple.client_port, a.five_tuple.server_port];
    let b_ports = [b.five_tuple.client_port, b.five_tuple.server_port];
    a_ports.iter().any(|p| b_ports.contains(p))
}

fn time_overlap(a: &Connection, b: &Connection) -> bool {
    a.first_packet_ts <= b.last_packet_ts && b.first_packet_ts <= a.last_packet_ts
}

/// Jaccard over length-signature tokens, used by the length-signature
/// feature (threshold 0.6, spec.md §4.D.4 table).
const LENGTH_SIGNATURE_JACCARD_THRESHOLD: f64 = 0.6;

/// Runs the pre-filters and, if they pass, the weighted scorer (spec.md
/// §4.D.3-4). Returns [`Score::zero`] immediately on any pre-filter
/// rejection, per spec.md's "returns score 0 without further work".
pub fn score_pair(a: &Connection, b: &Connection, weights: &ScoringWeights) -> Score {
    if !ports_compatible(a, b) {
        return Score::zero();
    }
    if !time_overlap(a, b) {
        return Score::zero();
    }

    let min_overlap = if a.is_microflow() || b.is_microflow() {
        MICROFLOW_MIN_IPID_OVERLAP
    } else {
        MIN_IPID_OVERLAP
    };
    let capped_overlap = primitives::ipid_overlap_count(&a.ipid_set, &b.ipid_set, min_overlap.max(1));
    if capped_overlap < min_overlap {
        return Score::zero();
    }
    let overlap = primitives::ipid_overlap_exact(&a.ipid_set, &b.ipid_set);
    let ratio = primitives::overlap_ratio(overlap, a.ipid_set.len(), b.ipid_set.len());
    if (overlap as usize) < min_overlap || ratio < MIN_IPID_RATIO {
        return Score::zero();
    }

    let mut raw = 0.0;
    let mut available = 0.0;
    let mut evidence = Vec::new();

    // IP-ID: always contributes once the pre-filter has passed.
    raw += weights.ipid;
    available += weights.ipid;
    evidence.push("ipid");

    if !a.syn_options.is_empty() && !b.syn_options.is_empty() {
        available += weights.syn_options;
        if a.syn_options == b.syn_options {
            raw += weights.syn_options;
            evidence.push("syn_options");
        }
    }

    if let (Some(a_isn), Some(b_isn)) = (a.client_isn, b.client_isn) {
        available += weights.client_isn;
        if a_isn == b_isn {
            raw += weights.client_isn;
            evidence.push("client_isn");
        }
    }

    if let (Some(a_isn), Some(b_isn)) = (a.server_isn, b.server_isn) {
        available += weights.server_isn;
        if a_isn == b_isn {
            raw += weights.server_isn;
            evidence.push("server_isn");
        }
    }

    if timestamp_available(a) && timestamp_available(b) {
        available += weights.tcp_timestamp;
        if timestamp_matches(a, b) {
            raw += weights.tcp_timestamp;
            evidence.push("tcp_timestamp");
        }
    }

    if !a.client_payload_md5.is_empty() && !b.client_payload_md5.is_empty() {
        available += weights.client_payload_md5;
        if a.client_payload_md5 == b.client_payload_md5 {
            raw += weights.client_payload_md5;
            evidence.push("client_payload_md5");
        }
    }

    if !a.server_payload_md5.is_empty() && !b.server_payload_md5.is_empty() {
        available += weights.server_payload_md5;
        if a.server_payload_md5 == b.server_payload_md5 {
            raw += weights.server_payload_md5;
            evidence.push("server_payload_md5");
        }
    }

    if !a.length_signature.is_empty() && !b.length_signature.is_empty() {
        available += weights.length_signature;
        let j = primitives::jaccard(
            a.length_signature.iter().map(String::as_str),
            b.length_signature.iter().map(String::as_str),
        );
        if j >= LENGTH_SIGNATURE_JACCARD_THRESHOLD {
            raw += weights.length_signature;
            evidence.push("length_signature");
        }
    }

    let normalized = if available > 0.0 { raw / available } else { 0.0 };
    // Strong-IP-ID override (spec.md §4.D.4): either the usual count+ratio
    // bar, or an exact match of the two IP-ID sets regardless of their
    // size -- the self-match law (spec.md §8) must hold even for
    // connections with under `STRONG_OVERLAP_COUNT` IP-IDs.
    let force_accept = (overlap >= STRONG_OVERLAP_COUNT && ratio >= STRONG_OVERLAP_RATIO)
        || ratio >= 1.0;

    Score {
        normalized,
        available_weight: available,
        ipid_match: true,
        force_accept,
        evidence: evidence.join(","),
    }
}

fn timestamp_available(conn: &Connection) -> bool {
    conn.tsval.is_some() || conn.tsecr.is_some()
}

fn timestamp_matches(a: &Connection, b: &Connection) -> bool {
    (a.tsval.is_some() && a.tsval == b.tsval) || (a.tsecr.is_some() && a.tsecr == b.tsecr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::connection::{ConnectionBuilder, ConnectionId, FiveTuple};

    fn base(id: u32, ipids: &[u16]) -> Connection {
        let five_tuple = FiveTuple {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_port: 40000,
            server_ip: "10.0.0.2".parse().unwrap(),
            server_port: 443,
        };
        let mut b = ConnectionBuilder::new(
            ConnectionId {
                file_id: 0,
                stream_id: id,
            },
            five_tuple,
            0,
        );
        for &id in ipids {
            b.add_client_ipid(id);
        }
        b.observe_packet_ts(1_000_000_000);
        b.build()
    }

    #[test]
    fn identical_syn_options_and_isn_score_high() {
        let mut a = base(1, &[10, 11, 12]);
        let mut b = base(2, &[10, 11, 13]);
        a.syn_options = "MSS=1460,WS=7".to_string();
        b.syn_options = a.syn_options.clone();
        a.client_isn = Some(555);
        b.client_isn = Some(555);
        let weights = ScoringWeights::default();
        let score = score_pair(&a, &b, &weights);
        assert!(score.ipid_match);
        assert!(score.normalized > 0.5);
        assert!(score.evidence.contains("syn_options"));
    }

    #[test]
    fn insufficient_ipid_overlap_rejects() {
        let a = base(1, &[10]);
        let b = base(2, &[99]);
        let score = score_pair(&a, &b, &ScoringWeights::default());
        assert!(!score.ipid_match);
        assert_eq!(score.normalized, 0.0);
    }

    #[test]
    fn strong_overlap_sets_force_accept() {
        let ids_a: Vec<u16> = (0..20).collect();
        let ids_b: Vec<u16> = (0..20).collect();
        let a = base(1, &ids_a);
        let b = base(2, &ids_b);
        let score = score_pair(&a, &b, &ScoringWeights::default());
        assert!(score.force_accept);
    }
}
