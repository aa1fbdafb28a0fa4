//! `Match` and `Score` records (spec.md §3).

use serde::Serialize;

use super::connection::ConnectionId;

/// The weighted-feature result for a candidate pair (spec.md §3, §4.D.4).
#[derive(Debug, Clone, Serialize)]
pub struct Score {
    /// `raw / available_weight`, in `[0, 1]`.
    pub normalized: f64,
    /// Sum of weights for features that were available on both sides.
    pub available_weight: f64,
    /// The necessary condition: IP-ID pre-filter passed.
    pub ipid_match: bool,
    /// Strong-IP-ID override (spec.md §4.D.4): accept regardless of
    /// `normalized` vs. threshold.
    pub force_accept: bool,
    /// Human-readable enumeration of which features contributed, e.g.
    /// `"syn_options,client_isn,ipid"`.
    pub evidence: String,
}

impl Score {
    pub fn zero() -> Self {
        Score {
            normalized: 0.0,
            available_weight: 0.0,
            ipid_match: false,
            force_accept: false,
            evidence: String::new(),
        }
    }

    /// Acceptance rule from spec.md §4.D.4: valid iff `ipid_match` and
    /// (`normalized >= threshold` or `force_accept`).
    pub fn is_valid(&self, threshold: f64) -> bool {
        self.ipid_match && (self.normalized >= threshold || self.force_accept)
    }
}

/// A cross-file match between two connections (spec.md §3 "Match").
///
/// Produced only by `Matcher`; immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub conn_a: ConnectionId,
    pub conn_b: ConnectionId,
    pub score: Score,
}

impl Match {
    pub fn new(conn_a: ConnectionId, conn_b: ConnectionId, score: Score) -> Self {
        Match {
            conn_a,
            conn_b,
            score,
        }
    }

    /// The strict total order spec.md §4.D.5 / §5 requires for
    /// deterministic output: force_accept desc, score desc, then stream ids
    /// ascending as terminal tie-breakers.
    pub fn sort_key(&self) -> (std::cmp::Reverse<bool>, std::cmp::Reverse<OrderedF64>, u32, u32) {
        (
            std::cmp::Reverse(self.score.force_accept),
            std::cmp::Reverse(OrderedF64(self.score.normalized)),
            self.conn_a.stream_id,
            self.conn_b.stream_id,
        )
    }
}

/// Minimal total-order wrapper over `f64` for sort keys. Scores here are
/// always finite (normalized values in `[0, 1]`), so `NaN` never occurs in
/// practice; this only needs to implement `Ord` for the sort, not provide
/// IEEE-754 semantics elsewhere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedF64(pub f64);

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}
