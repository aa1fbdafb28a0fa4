//! The per-(direction, IP-ID) `Diff` record (spec.md §3, §4.E).

use serde::Serialize;
use strum_macros::Display;

/// Direction of a packet relative to the matched pair's client/server roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum Direction {
    #[strum(serialize = "C->S")]
    ClientToServer,
    #[strum(serialize = "S->C")]
    ServerToClient,
}

/// The kinds of disagreement a `Diff` can report (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum DiffKind {
    Flags,
    Seq,
    Ack,
    MissingSideA,
    MissingSideB,
}

/// The subset of packet attributes a `Diff` compares (spec.md §4.E step 2).
#[derive(Debug, Clone, Serialize)]
pub struct DiffPacketAttrs {
    pub frame_number: u64,
    pub timestamp_ns: i64,
    pub tcp_flags: u8,
    pub tcp_seq: u32,
    pub tcp_ack: u32,
}

/// A single difference record for one (direction, IP-ID) key.
#[derive(Debug, Clone, Serialize)]
pub struct Diff {
    pub direction: Direction,
    pub ip_id: u16,
    pub side_a: Option<DiffPacketAttrs>,
    pub side_b: Option<DiffPacketAttrs>,
    pub kinds: Vec<DiffKind>,
}

/// Per-direction aggregate counters over a set of `Diff`s (spec.md §4.E
/// step 6).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DirectionCounters {
    pub total: u64,
    pub flags_only: u64,
    pub seq_only: u64,
    pub ack_only: u64,
    pub missing_side_a: u64,
    pub missing_side_b: u64,
}

/// The complete result of comparing a matched pair (spec.md §4.E).
#[derive(Debug, Clone, Serialize, Default)]
pub struct StreamDiffReport {
    pub diffs: Vec<Diff>,
    pub client_to_server: DirectionCounters,
    pub server_to_client: DirectionCounters,
}

impl StreamDiffReport {
    pub fn push(&mut self, diff: Diff) {
        let counters = match diff.direction {
            Direction::ClientToServer => &mut self.client_to_server,
            Direction::ServerToClient => &mut self.server_to_client,
        };
        counters.total += 1;
        let mut flags = false;
        let mut seq = false;
        let mut ack = false;
        for kind in &diff.kinds {
            match kind {
                DiffKind::Flags => flags = true,
                DiffKind::Seq => seq = true,
                DiffKind::Ack => ack = true,
                DiffKind::MissingSideA => counters.missing_side_a += 1,
                DiffKind::MissingSideB => counters.missing_side_b += 1,
            }
        }
        if flags && !seq && !ack {
            counters.flags_only += 1;
        }
        if seq && !flags && !ack {
            counters.seq_only += 1;
        }
        if ack && !flags && !seq {
            counters.ack_only += 1;
        }
        self.diffs.push(diff);
    }
}
