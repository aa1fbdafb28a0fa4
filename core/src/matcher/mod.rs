//! Matcher (spec.md §2 component D, §4.D): produces cross-file matches from
//! two Connection sets.
//!
//! Generalizes `thegwan-retina::subscription::connection_features`'s
//! notion of a scored candidate pool, but here the pool is cross-capture
//! connections rather than ML feature windows, and selection is a strict
//! deterministic sort rather than a classifier.

mod bucket;
mod fastpath;
mod scoring;

use std::collections::HashSet;

use crate::config::{BucketStrategy, Config, MatchMode};
use crate::model::connection::ConnectionId;
use crate::model::score::Match;
use crate::model::Connection;

use bucket::Buckets;

/// Runs the full matching pipeline: fast paths, then the generic
/// bucketed-and-scored path over whatever's left, for one matching mode.
pub struct Matcher<'a> {
    config: &'a Config,
}

impl<'a> Matcher<'a> {
    pub fn new(config: &'a Config) -> Self {
        Matcher { config }
    }

    /// Produces matches between `side_a` and `side_b`. `behavioural` enables
    /// the explicitly-triggered behavioural fast path (spec.md §4.D.1);
    /// callers pass `true` only for two-hop runs where per-packet features
    /// are known to be destroyed by an intermediate device.
    pub fn run(&self, side_a: &[Connection], side_b: &[Connection], behavioural: bool) -> Vec<Match> {
        let mut matches = Vec::new();
        let mut consumed_a: HashSet<ConnectionId> = HashSet::new();
        let mut consumed_b: HashSet<ConnectionId> = HashSet::new();

        let (f5_matches, f5_consumed) = fastpath::f5_trailer(side_a, side_b);
        matches.extend(f5_matches);
        absorb(&f5_consumed, side_a, side_b, &mut consumed_a, &mut consumed_b);

        let (tls_matches, tls_consumed) = fastpath::tls_client_hello(side_a, side_b);
        matches.extend(tls_matches);
        absorb(&tls_consumed, side_a, side_b, &mut consumed_a, &mut consumed_b);

        if behavioural {
            let remaining_a = remaining(side_a, &consumed_a);
            let remaining_b = remaining(side_b, &consumed_b);
            let (bh_matches, bh_consumed) = fastpath::behavioural(
                &remaining_a,
                &remaining_b,
                &self.config.behavioural_weights,
                self.config.thresholds.default_threshold,
            );
            matches.extend(bh_matches);
            absorb(&bh_consumed, side_a, side_b, &mut consumed_a, &mut consumed_b);
        }

        let remaining_a = remaining(side_a, &consumed_a);
        let remaining_b = remaining(side_b, &consumed_b);
        let generic = self.generic_path(&remaining_a, &remaining_b);
        matches.extend(generic);

        matches.sort_by_key(Match::sort_key);
        matches
    }

    fn generic_path(&self, side_a: &[&Connection], side_b: &[&Connection]) -> Vec<Match> {
        let owned_a: Vec<Connection> = side_a.iter().map(|&c| c.clone()).collect();
        let owned_b: Vec<Connection> = side_b.iter().map(|&c| c.clone()).collect();

        let server_ips_a = Buckets::server_ips(&owned_a);
        let buckets_b = Buckets::build(&owned_b, self.config.bucket_strategy, &server_ips_a);

        let mut candidates = Vec::new();
        for conn_a in &owned_a {
            for conn_b in buckets_b.candidates_for(conn_a) {
                let score = scoring::score_pair(conn_a, conn_b, &self.config.weights);
                let threshold = if conn_a.is_microflow() || conn_b.is_microflow() {
                    self.config.thresholds.microflow_threshold
                } else {
                    self.config.thresholds.default_threshold
                };
                if score.is_valid(threshold) {
                    candidates.push(Match::new(conn_a.id, conn_b.id, score));
                }
            }
        }
        candidates.sort_by_key(Match::sort_key);

        match self.config.match_mode {
            MatchMode::OneToMany => candidates,
            MatchMode::OneToOne => greedy_select(candidates),
        }
    }
}

fn absorb(
    newly_consumed: &HashSet<ConnectionId>,
    side_a: &[Connection],
    side_b: &[Connection],
    consumed_a: &mut HashSet<ConnectionId>,
    consumed_b: &mut HashSet<ConnectionId>,
) {
    let a_ids: HashSet<ConnectionId> = side_a.iter().map(|c| c.id).collect();
    let b_ids: HashSet<ConnectionId> = side_b.iter().map(|c| c.id).collect();
    for id in newly_consumed {
        if a_ids.contains(id) {
            consumed_a.insert(*id);
        }
        if b_ids.contains(id) {
            consumed_b.insert(*id);
        }
    }
}

fn remaining<'a>(conns: &'a [Connection], consumed: &HashSet<ConnectionId>) -> Vec<&'a Connection> {
    conns.iter().filter(|c| !consumed.contains(&c.id)).collect()
}

/// Greedy one-to-one selection over an already-sorted candidate list:
/// iterate in sort order, accept a pair iff neither side has been consumed
/// yet (spec.md §4.D.5).
fn greedy_select(sorted_candidates: Vec<Match>) -> Vec<Match> {
    let mut used_a = HashSet::new();
    let mut used_b = HashSet::new();
    let mut out = Vec::new();
    for m in sorted_candidates {
        if used_a.contains(&m.conn_a) || used_b.contains(&m.conn_b) {
            continue;
        }
        used_a.insert(m.conn_a);
        used_b.insert(m.conn_b);
        out.push(m);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::connection::{ConnectionBuilder, ConnectionId, FiveTuple};

    fn conn(file: u32, id: u32, ipids: &[u16], isn: u32) -> Connection {
        let five_tuple = FiveTuple {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_port: 40000 + id as u16,
            server_ip: "10.0.0.2".parse().unwrap(),
            server_port: 443,
        };
        let mut b = ConnectionBuilder::new(
            ConnectionId {
                file_id: file,
                stream_id: id,
            },
            five_tuple,
            0,
        );
        for &ipid in ipids {
            b.add_client_ipid(ipid);
        }
        b.set_client_isn(isn);
        b.mark_has_syn();
        b.observe_packet_ts(3_000_000_000);
        b.observe_packet_ts(0);
        for _ in 0..10 {
            b.observe_packet_ts(1_000_000_000);
        }
        b.build()
    }

    #[test]
    fn one_to_one_matches_best_candidate_and_consumes_both_sides() {
        let config = Config::default();
        let side_a = vec![conn(0, 1, &(0..15).collect::<Vec<_>>(), 100)];
        let side_b = vec![
            conn(1, 1, &(0..15).collect::<Vec<_>>(), 100),
            conn(1, 2, &(0..15).collect::<Vec<_>>(), 999),
        ];
        let matcher = Matcher::new(&config);
        let matches = matcher.run(&side_a, &side_b, false);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].conn_a.stream_id, 1);
        assert_eq!(matches[0].conn_b.stream_id, 1);
    }

    #[test]
    fn no_overlap_yields_no_matches() {
        let config = Config::default();
        let side_a = vec![conn(0, 1, &[1, 2, 3], 100)];
        let side_b = vec![conn(1, 1, &[90, 91, 92], 100)];
        let matcher = Matcher::new(&config);
        let matches = matcher.run(&side_a, &side_b, false);
        assert!(matches.is_empty());
    }
}
