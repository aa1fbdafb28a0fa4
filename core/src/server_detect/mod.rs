//! ServerDetector (spec.md §2 component C, §4.C): decides which endpoint
//! of each `Connection` is the server and assigns a confidence grade.
//!
//! Two-phase, like `thegwan-retina::subscription::connection_features`'s
//! `pre_match`/`post_match` split: phase one scans every connection once to
//! build cross-connection statistics, phase two classifies each connection
//! using those statistics. No other component re-derives server role
//! (spec.md §4.C: "This is the single source of truth").

pub mod service_list;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::model::connection::Confidence;
use crate::model::Connection;
use service_list::ServiceList;

/// One endpoint: an (ip, port) pair as observed in a connection's 5-tuple.
type Endpoint = (IpAddr, u16);

/// Cross-connection statistics accumulated in phase one, keyed by endpoint
/// (spec.md §4.C).
#[derive(Default)]
struct Stats {
    /// How many distinct peer IPs have talked to this endpoint.
    endpoint_clients: HashMap<Endpoint, HashSet<IpAddr>>,
    /// How many distinct peer ports this endpoint has observed.
    endpoint_peer_ports: HashMap<Endpoint, HashSet<u16>>,
    /// How many distinct IPs have been observed behind a given port number,
    /// used for the port-reuse rule.
    port_server_ips: HashMap<u16, HashSet<IpAddr>>,
}

impl Stats {
    fn observe(&mut self, side_a: Endpoint, side_b: Endpoint) {
        self.endpoint_clients
            .entry(side_a)
            .or_default()
            .insert(side_b.0);
        self.endpoint_clients
            .entry(side_b)
            .or_default()
            .insert(side_a.0);
        self.endpoint_peer_ports
            .entry(side_a)
            .or_default()
            .insert(side_b.1);
        self.endpoint_peer_ports
            .entry(side_b)
            .or_default()
            .insert(side_a.1);
        // Tentative assignment treats side_a (the five_tuple's "client") as
        // a candidate server for port-reuse purposes too: the role isn't
        // known yet, so both sides' ports feed the table.
        self.port_server_ips
            .entry(side_a.1)
            .or_default()
            .insert(side_a.0);
        self.port_server_ips
            .entry(side_b.1)
            .or_default()
            .insert(side_b.0);
    }

    fn cardinality(&self, endpoint: Endpoint) -> usize {
        self.endpoint_clients.get(&endpoint).map_or(0, |s| s.len())
    }

    fn distinct_peer_ports(&self, endpoint: Endpoint) -> usize {
        self.endpoint_peer_ports
            .get(&endpoint)
            .map_or(0, |s| s.len())
    }

    fn port_reuse(&self, port: u16) -> usize {
        self.port_server_ips.get(&port).map_or(0, |s| s.len())
    }
}

/// The decided role plus confidence for one connection, before it is
/// applied (spec.md §4.C rule table, evaluated in priority order).
struct Verdict {
    /// `true` if the connection's current five_tuple.client is in fact the
    /// server and the roles must be swapped.
    swap: bool,
    confidence: Confidence,
}

/// Decides server role for a batch of connections, using a curated service
/// list for the well-known-port rule.
pub struct ServerDetector {
    services: ServiceList,
}

impl ServerDetector {
    pub fn new(services: ServiceList) -> Self {
        ServerDetector { services }
    }

    /// Runs both phases over `connections` in place. Idempotent: calling
    /// `detect` again on already-finalized connections is a no-op per
    /// connection (spec.md §8 testable property 5), checked via
    /// `is_finalized`.
    pub fn detect(&self, connections: &mut [Connection]) {
        let mut stats = Stats::default();
        for conn in connections.iter() {
            if conn.is_finalized() {
                continue;
            }
            let side_a = (conn.five_tuple.client_ip, conn.five_tuple.client_port);
            let side_b = (conn.five_tuple.server_ip, conn.five_tuple.server_port);
            stats.observe(side_a, side_b);
        }

        for conn in connections.iter_mut() {
            if conn.is_finalized() {
                continue;
            }
            let verdict = self.classify(conn, &stats);
            if verdict.swap {
                conn.swap_roles();
            }
            conn.set_confidence(verdict.confidence);
            conn.finalize();
        }
    }

    /// Applies the rule table in priority order (spec.md §4.C): SYN
    /// direction, well-known port, endpoint cardinality, port reuse, port
    /// stability, then the port-number fallback.
    fn classify(&self, conn: &Connection, stats: &Stats) -> Verdict {
        let side_a = (conn.five_tuple.client_ip, conn.five_tuple.client_port);
        let side_b = (conn.five_tuple.server_ip, conn.five_tuple.server_port);

        // Rule 1: SYN direction. `five_tuple.client` is the packet source
        // that first sent a non-ACK SYN (ConnectionExtractor's convention);
        // the recipient of that SYN -- side_b -- is the server already.
        if conn.has_syn {
            return Verdict {
                swap: false,
                confidence: Confidence::High,
            };
        }

        // Rule 2: well-known port.
        let a_known = self.services.is_well_known(side_a.1);
        let b_known = self.services.is_well_known(side_b.1);
        if b_known && !a_known {
            return Verdict {
                swap: false,
                confidence: Confidence::High,
            };
        }
        if a_known && !b_known {
            return Verdict {
                swap: true,
                confidence: Confidence::High,
            };
        }

        // Rule 3: endpoint cardinality.
        let card_a = stats.cardinality(side_a);
        let card_b = stats.cardinality(side_b);
        // side_a being the high-cardinality side means side_a is the server,
        // which requires a swap away from ConnectionExtractor's tentative
        // assignment (side_a started out as "client").
        if let Some(verdict) = cardinality_verdict(card_a, card_b, true) {
            return verdict;
        }
        if let Some(verdict) = cardinality_verdict(card_b, card_a, false) {
            return verdict;
        }

        // Rule 4: port reuse.
        let reuse_a = stats.port_reuse(side_a.1);
        let reuse_b = stats.port_reuse(side_b.1);
        if reuse_a >= 2 && reuse_b < 2 {
            return Verdict {
                swap: true,
                confidence: Confidence::Medium,
            };
        }
        if reuse_b >= 2 && reuse_a < 2 {
            return Verdict {
                swap: false,
                confidence: Confidence::Medium,
            };
        }

        // Rule 5: port stability.
        let ports_a = stats.distinct_peer_ports(side_a);
        let ports_b = stats.distinct_peer_ports(side_b);
        if ports_a >= 2 && ports_b <= 1 {
            return Verdict {
                swap: true,
                confidence: Confidence::Medium,
            };
        }
        if ports_b >= 2 && ports_a <= 1 {
            return Verdict {
                swap: false,
                confidence: Confidence::Medium,
            };
        }

        // Rule 6: fallback -- lower port number is server.
        if side_a.1 < side_b.1 {
            Verdict {
                swap: true,
                confidence: Confidence::VeryLow,
            }
        } else {
            Verdict {
                swap: false,
                confidence: Confidence::VeryLow,
            }
        }
    }
}

/// Shared logic for rule 3, evaluated once with `(card_a, card_b)` and once
/// with the arguments flipped. `swap_if_matched` is the `swap` value to
/// return when the high-cardinality side turns out to be the server.
fn cardinality_verdict(
    high_card_side: usize,
    low_card_side: usize,
    swap_if_matched: bool,
) -> Option<Verdict> {
    if high_card_side >= 5 && low_card_side <= 1 {
        Some(Verdict {
            swap: swap_if_matched,
            confidence: Confidence::High,
        })
    } else if (2..=4).contains(&high_card_side) && low_card_side <= 1 {
        Some(Verdict {
            swap: swap_if_matched,
            confidence: Confidence::Medium,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::connection::{ConnectionBuilder, ConnectionId, FiveTuple};

    fn base_connection(id: u32, client: (&str, u16), server: (&str, u16), has_syn: bool) -> Connection {
        let five_tuple = FiveTuple {
            client_ip: client.0.parse().unwrap(),
            client_port: client.1,
            server_ip: server.0.parse().unwrap(),
            server_port: server.1,
        };
        let mut builder = ConnectionBuilder::new(
            ConnectionId {
                file_id: 0,
                stream_id: id,
            },
            five_tuple,
            0,
        );
        builder.add_client_ipid(1);
        builder.add_server_ipid(2);
        if has_syn {
            builder.mark_has_syn();
        }
        builder.build()
    }

    #[test]
    fn syn_direction_wins_with_high_confidence() {
        let detector = ServerDetector::new(ServiceList::default_table());
        let mut conns = vec![base_connection(1, ("10.0.0.1", 50000), ("10.0.0.2", 9999), true)];
        detector.detect(&mut conns);
        assert_eq!(conns[0].five_tuple.server_port, 9999);
        assert_eq!(conns[0].confidence, Confidence::High);
        assert!(conns[0].is_finalized());
    }

    #[test]
    fn well_known_port_overrides_fallback_ordering() {
        let detector = ServerDetector::new(ServiceList::default_table());
        // Five-tuple has client port 443 (well-known) as the "client" side
        // by ConnectionExtractor's tentative assignment; detector must swap.
        let mut conns = vec![base_connection(1, ("10.0.0.1", 443), ("10.0.0.2", 51000), false)];
        detector.detect(&mut conns);
        assert_eq!(conns[0].five_tuple.server_port, 443);
        assert_eq!(conns[0].confidence, Confidence::High);
    }

    #[test]
    fn fallback_picks_lower_port_with_very_low_confidence() {
        let detector = ServerDetector::new(ServiceList::default_table());
        let mut conns = vec![base_connection(1, ("10.0.0.1", 50000), ("10.0.0.2", 60000), false)];
        detector.detect(&mut conns);
        assert_eq!(conns[0].five_tuple.server_port, 50000);
        assert_eq!(conns[0].confidence, Confidence::VeryLow);
    }

    #[test]
    fn detect_is_idempotent_on_finalized_connections() {
        let detector = ServerDetector::new(ServiceList::default_table());
        let mut conns = vec![base_connection(1, ("10.0.0.1", 50000), ("10.0.0.2", 9999), true)];
        detector.detect(&mut conns);
        let first_pass = conns[0].five_tuple;
        detector.detect(&mut conns);
        assert_eq!(conns[0].five_tuple, first_pass);
    }
}
