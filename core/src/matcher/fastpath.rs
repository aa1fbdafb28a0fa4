//! Opportunistic fast paths (spec.md §4.D.1), tried before the generic
//! scorer. Each returns the set of matches it's confident about and the set
//! of connection ids it consumed, so the generic path only considers what's
//! left over.

use std::collections::{HashMap, HashSet};

use crate::config::BehaviouralWeights;
use crate::model::connection::ConnectionId;
use crate::model::score::{Match, Score};
use crate::model::Connection;

const EVIDENCE_F5: &str = "F5_TRAILER";
const EVIDENCE_TLS: &str = "TLS_CLIENT_HELLO";
const EVIDENCE_BEHAVIOURAL: &str = "BEHAVIOURAL";

/// Fraction of connections that must carry F5 trailer / TLS ClientHello
/// data for a set to be considered eligible for that fast path (spec.md
/// §4.D.1: "every (or nearly every)").
const FASTPATH_ELIGIBILITY_RATIO: f64 = 0.9;

fn eligible<F: Fn(&Connection) -> bool>(conns: &[Connection], has: F) -> bool {
    if conns.is_empty() {
        return false;
    }
    let present = conns.iter().filter(|c| has(c)).count();
    present as f64 / conns.len() as f64 >= FASTPATH_ELIGIBILITY_RATIO
}

fn force_accept_match(conn_a: ConnectionId, conn_b: ConnectionId, evidence: &str) -> Match {
    Match::new(
        conn_a,
        conn_b,
        Score {
            normalized: 1.0,
            available_weight: 1.0,
            ipid_match: true,
            force_accept: true,
            evidence: evidence.to_string(),
        },
    )
}

/// F5 BIG-IP trailer path: side-A's reported peer (ip, port) is looked up
/// directly against side-B's 5-tuples.
pub fn f5_trailer(side_a: &[Connection], side_b: &[Connection]) -> (Vec<Match>, HashSet<ConnectionId>) {
    let mut matches = Vec::new();
    let mut consumed = HashSet::new();

    if !eligible(side_a, |c| c.f5_peer.is_some()) || !eligible(side_b, |c| c.f5_peer.is_some()) {
        return (matches, consumed);
    }

    let mut by_five_tuple: HashMap<(std::net::IpAddr, u16), ConnectionId> = HashMap::new();
    for conn in side_b {
        by_five_tuple.insert(
            (conn.five_tuple.client_ip, conn.five_tuple.client_port),
            conn.id,
        );
    }

    for conn in side_a {
        let Some(peer) = conn.f5_peer else { continue };
        if let Some(&peer_id) = by_five_tuple.get(&(peer.peer_addr, peer.peer_port)) {
            matches.push(force_accept_match(conn.id, peer_id, EVIDENCE_F5));
            consumed.insert(conn.id);
            consumed.insert(peer_id);
        }
    }
    (matches, consumed)
}

/// TLS ClientHello path: indexes by `(random, session_id)`, which is unique
/// per handshake attempt.
pub fn tls_client_hello(
    side_a: &[Connection],
    side_b: &[Connection],
) -> (Vec<Match>, HashSet<ConnectionId>) {
    let mut matches = Vec::new();
    let mut consumed = HashSet::new();

    if !eligible(side_a, |c| c.tls_client_hello.is_some())
        || !eligible(side_b, |c| c.tls_client_hello.is_some())
    {
        return (matches, consumed);
    }

    let mut by_hello: HashMap<(Vec<u8>, Vec<u8>), ConnectionId> = HashMap::new();
    for conn in side_b {
        if let Some(hello) = &conn.tls_client_hello {
            by_hello.insert((hello.random.to_vec(), hello.session_id.clone()), conn.id);
        }
    }

    for conn in side_a {
        let Some(hello) = &conn.tls_client_hello else {
            continue;
        };
        let key = (hello.random.to_vec(), hello.session_id.clone());
        if let Some(&peer_id) = by_hello.get(&key) {
            matches.push(force_accept_match(conn.id, peer_id, EVIDENCE_TLS));
            consumed.insert(conn.id);
            consumed.insert(peer_id);
        }
    }
    (matches, consumed)
}

/// Per-connection behavioural summary used by the IAT/duration/byte-totals
/// fast path (spec.md §4.D.1). Computed from fields already on `Connection`;
/// full packet-level IAT series are not retained post-extraction, so this
/// approximates inter-arrival time with the mean over the observed span.
#[derive(Debug, Clone, Copy)]
struct BehaviouralProfile {
    mean_iat_ns: f64,
    duration_ns: f64,
    byte_total: f64,
}

fn profile(conn: &Connection) -> BehaviouralProfile {
    let duration_ns = (conn.last_packet_ts - conn.first_packet_ts).max(0) as f64;
    let mean_iat_ns = if conn.packet_count > 1 {
        duration_ns / (conn.packet_count - 1) as f64
    } else {
        0.0
    };
    let byte_total: f64 = conn
        .length_signature
        .iter()
        .filter_map(|tok| tok.split(':').nth(1))
        .filter_map(|n| n.parse::<f64>().ok())
        .sum();
    BehaviouralProfile {
        mean_iat_ns,
        duration_ns,
        byte_total,
    }
}

fn closeness(a: f64, b: f64) -> f64 {
    let denom = a.abs().max(b.abs()).max(1.0);
    1.0 - ((a - b).abs() / denom).min(1.0)
}

/// Explicit, caller-triggered fast path for two-hop scenarios where
/// per-packet features are destroyed by an intermediate device (spec.md
/// §4.D.1). Greedy one-to-one: each side-A connection takes the best-scoring
/// unconsumed side-B connection above `threshold`.
pub fn behavioural(
    side_a: &[Connection],
    side_b: &[Connection],
    weights: &BehaviouralWeights,
    threshold: f64,
) -> (Vec<Match>, HashSet<ConnectionId>) {
    let mut matches = Vec::new();
    let mut consumed = HashSet::new();
    let mut used_b: HashSet<ConnectionId> = HashSet::new();

    for conn_a in side_a {
        let profile_a = profile(conn_a);
        let mut best: Option<(ConnectionId, f64)> = None;
        for conn_b in side_b {
            if used_b.contains(&conn_b.id) {
                continue;
            }
            let profile_b = profile(conn_b);
            let score = weights.iat * closeness(profile_a.mean_iat_ns, profile_b.mean_iat_ns)
                + weights.duration * closeness(profile_a.duration_ns, profile_b.duration_ns)
                + weights.byte_totals * closeness(profile_a.byte_total, profile_b.byte_total);
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((conn_b.id, score));
            }
        }
        if let Some((best_id, score)) = best {
            if score >= threshold {
                matches.push(Match::new(
                    conn_a.id,
                    best_id,
                    Score {
                        normalized: score,
                        available_weight: weights.iat + weights.duration + weights.byte_totals,
                        ipid_match: true,
                        force_accept: false,
                        evidence: EVIDENCE_BEHAVIOURAL.to_string(),
                    },
                ));
                used_b.insert(best_id);
                consumed.insert(conn_a.id);
                consumed.insert(best_id);
            }
        }
    }
    (matches, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::connection::{ConnectionBuilder, ConnectionId, FiveTuple};
    use crate::model::packet::{ClientHelloInfo, F5PeerInfo};

    fn base_conn(file: u32, id: u32) -> ConnectionBuilder {
        let five_tuple = FiveTuple {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_port: 40000 + id as u16,
            server_ip: "10.0.0.2".parse().unwrap(),
            server_port: 443,
        };
        ConnectionBuilder::new(
            ConnectionId {
                file_id: file,
                stream_id: id,
            },
            five_tuple,
            0,
        )
    }

    #[test]
    fn f5_trailer_matches_by_reported_peer() {
        let mut a = base_conn(0, 1);
        a.add_client_ipid(1);
        a.set_f5_peer(F5PeerInfo {
            peer_addr: "192.0.2.1".parse().unwrap(),
            peer_port: 5555,
        });
        let side_a = vec![a.build()];

        let mut b = base_conn(1, 1);
        b.add_client_ipid(1);
        b.set_f5_peer(F5PeerInfo {
            peer_addr: "198.51.100.1".parse().unwrap(),
            peer_port: 7777,
        });
        // b's own reported five-tuple must equal a's reported peer info.
        let mut b = b.build();
        b.five_tuple.client_ip = "192.0.2.1".parse().unwrap();
        b.five_tuple.client_port = 5555;
        let side_b = vec![b];

        let (matches, consumed) = f5_trailer(&side_a, &side_b);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].score.evidence, EVIDENCE_F5);
        assert!(matches[0].score.force_accept);
        assert_eq!(consumed.len(), 2);
    }

    #[test]
    fn f5_trailer_is_not_attempted_when_only_a_minority_carry_peer_info() {
        let mut with_peer = base_conn(0, 1);
        with_peer.add_client_ipid(1);
        with_peer.set_f5_peer(F5PeerInfo {
            peer_addr: "192.0.2.1".parse().unwrap(),
            peer_port: 5555,
        });
        let without_peer = base_conn(0, 2).build();
        let side_a = vec![with_peer.build(), without_peer.clone(), without_peer.clone(), without_peer];

        let (matches, consumed) = f5_trailer(&side_a, &[]);
        assert!(matches.is_empty());
        assert!(consumed.is_empty());
    }

    #[test]
    fn tls_client_hello_matches_by_random_and_session_id() {
        let mut a = base_conn(0, 1);
        a.add_client_ipid(1);
        let hello = ClientHelloInfo {
            random: [7u8; 32],
            session_id: vec![1, 2, 3],
        };
        a.set_tls_client_hello(hello.clone());
        let side_a = vec![a.build()];

        let mut b = base_conn(1, 1);
        b.add_client_ipid(1);
        b.set_tls_client_hello(hello);
        let side_b = vec![b.build()];

        let (matches, consumed) = tls_client_hello(&side_a, &side_b);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].score.evidence, EVIDENCE_TLS);
        assert_eq!(consumed.len(), 2);
    }

    #[test]
    fn tls_client_hello_skipped_when_either_side_lacks_material() {
        // spec.md §9 Open Question: if either side lacks TLS material for a
        // connection, the fast path is not attempted (falls through to the
        // generic scorer) -- verified here at the set-eligibility level.
        let mut a = base_conn(0, 1);
        a.add_client_ipid(1);
        a.set_tls_client_hello(ClientHelloInfo {
            random: [1u8; 32],
            session_id: vec![],
        });
        let side_a = vec![a.build()];
        let side_b = vec![base_conn(1, 1).build()];

        let (matches, consumed) = tls_client_hello(&side_a, &side_b);
        assert!(matches.is_empty());
        assert!(consumed.is_empty());
    }

    #[test]
    fn behavioural_matches_closest_profile_above_threshold() {
        let mut a = base_conn(0, 1);
        a.add_client_ipid(1);
        a.observe_packet_ts(0);
        a.observe_packet_ts(1_000_000_000);
        a.push_length_token("C:100".to_string());
        let side_a = vec![a.build()];

        let mut b_close = base_conn(1, 1);
        b_close.add_client_ipid(1);
        b_close.observe_packet_ts(0);
        b_close.observe_packet_ts(1_000_000_000);
        b_close.push_length_token("C:100".to_string());

        let mut b_far = base_conn(1, 2);
        b_far.add_client_ipid(1);
        b_far.observe_packet_ts(0);
        b_far.observe_packet_ts(60_000_000_000);
        b_far.push_length_token("C:9000".to_string());

        let side_b = vec![b_close.build(), b_far.build()];

        let weights = BehaviouralWeights::default();
        let (matches, consumed) = behavioural(&side_a, &side_b, &weights, 0.6);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].conn_b.stream_id, 1, "must pick the closer profile");
        assert_eq!(consumed.len(), 2);
    }
}
