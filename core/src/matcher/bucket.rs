//! Bucketing strategies (spec.md §4.D.2): group connections so the generic
//! scorer only ever compares within a bucket, avoiding O(n·m).

use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::BucketStrategy;
use crate::model::Connection;

/// A bucket key. `Server` normalizes the pair of server IPs across both
/// sides being compared so the same physical server sorts into one bucket
/// regardless of which file it came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Server(IpAddr),
    Port(u16),
    None,
}

/// Indexes one Connection set's positions by bucket key.
pub struct Buckets<'a> {
    strategy: BucketStrategy,
    by_key: HashMap<Key, Vec<&'a Connection>>,
}

impl<'a> Buckets<'a> {
    /// Builds buckets for `conns` using `strategy`. `Auto` resolves to
    /// `Server` when `other_server_ips` overlaps substantially with this
    /// set's server IPs (spec.md §4.D.2: "pick SERVER if server IP sets
    /// overlap substantially, else PORT"), else `Port`.
    pub fn build(conns: &'a [Connection], strategy: BucketStrategy, other_server_ips: &[IpAddr]) -> Self {
        let resolved = match strategy {
            BucketStrategy::Auto => resolve_auto(conns, other_server_ips),
            other => other,
        };
        let mut by_key: HashMap<Key, Vec<&Connection>> = HashMap::new();
        for conn in conns {
            for key in keys_for(conn, resolved) {
                by_key.entry(key).or_default().push(conn);
            }
        }
        Buckets {
            strategy: resolved,
            by_key,
        }
    }

    pub fn strategy(&self) -> BucketStrategy {
        self.strategy
    }

    /// Candidates in `self` that share at least one bucket with `conn`,
    /// deduplicated by connection id.
    pub fn candidates_for(&self, conn: &Connection) -> Vec<&'a Connection> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for key in keys_for(conn, self.strategy) {
            if let Some(bucket) = self.by_key.get(&key) {
                for &candidate in bucket {
                    if seen.insert(candidate.id) {
                        out.push(candidate);
                    }
                }
            }
        }
        out
    }

    pub fn server_ips(conns: &[Connection]) -> Vec<IpAddr> {
        conns.iter().map(|c| c.five_tuple.server_ip).collect()
    }
}

fn keys_for(conn: &Connection, strategy: BucketStrategy) -> Vec<Key> {
    match strategy {
        BucketStrategy::Server => vec![Key::Server(conn.five_tuple.server_ip)],
        BucketStrategy::Port => vec![Key::Port(conn.five_tuple.server_port)],
        BucketStrategy::None => vec![Key::None],
        BucketStrategy::Auto => unreachable!("Auto is resolved before bucketing"),
    }
}

fn resolve_auto(conns: &[Connection], other_server_ips: &[IpAddr]) -> BucketStrategy {
    if conns.is_empty() || other_server_ips.is_empty() {
        return BucketStrategy::Port;
    }
    let mine: std::collections::HashSet<IpAddr> =
        conns.iter().map(|c| c.five_tuple.server_ip).collect();
    let theirs: std::collections::HashSet<IpAddr> = other_server_ips.iter().copied().collect();
    let overlap = mine.intersection(&theirs).count();
    let smaller = mine.len().min(theirs.len()).max(1);
    if overlap as f64 / smaller as f64 >= 0.5 {
        BucketStrategy::Server
    } else {
        BucketStrategy::Port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::connection::{ConnectionBuilder, ConnectionId, FiveTuple};

    fn conn(id: u32, server_ip: &str, server_port: u16) -> Connection {
        let five_tuple = FiveTuple {
            client_ip: "10.0.0.1".parse().unwrap(),
            client_port: 40000,
            server_ip: server_ip.parse().unwrap(),
            server_port,
        };
        let mut b = ConnectionBuilder::new(
            ConnectionId {
                file_id: 0,
                stream_id: id,
            },
            five_tuple,
            0,
        );
        b.add_client_ipid(1);
        b.build()
    }

    #[test]
    fn port_bucket_groups_by_server_port() {
        let conns = vec![conn(1, "10.0.0.2", 443), conn(2, "10.0.0.3", 443)];
        let buckets = Buckets::build(&conns, BucketStrategy::Port, &[]);
        let probe = conn(3, "10.0.0.9", 443);
        assert_eq!(buckets.candidates_for(&probe).len(), 2);
    }

    #[test]
    fn auto_picks_server_when_ip_sets_overlap() {
        let conns = vec![conn(1, "10.0.0.2", 443)];
        let resolved = resolve_auto(&conns, &["10.0.0.2".parse().unwrap()]);
        assert_eq!(resolved, BucketStrategy::Server);
    }

    #[test]
    fn auto_picks_port_when_ip_sets_disjoint() {
        let conns = vec![conn(1, "10.0.0.2", 443)];
        let resolved = resolve_auto(&conns, &["192.168.1.1".parse().unwrap()]);
        assert_eq!(resolved, BucketStrategy::Port);
    }
}
