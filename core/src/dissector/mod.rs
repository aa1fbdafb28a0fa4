//! Everything to do with invoking the external packet dissector
//! (spec.md §2 component A: DissectorRunner).

mod runner;
mod version;

pub use runner::{Dissector, RowStream};
pub use version::{resolve_path, TSHARK_PATH_ENV};

/// Field list passed to `tshark -T fields -e ...` to produce the rows
/// [`crate::extractor`] parses (spec.md §4.A/§4.B field set).
pub const FIELDS: &[&str] = &[
    "frame.number",
    "frame.time_epoch",
    "ip.src",
    "ip.dst",
    "ip.id",
    "ip.ttl",
    "tcp.stream",
    "tcp.srcport",
    "tcp.dstport",
    "tcp.seq_raw",
    "tcp.ack_raw",
    "tcp.flags",
    "tcp.options",
    "tcp.options.timestamp.tsval",
    "tcp.options.timestamp.tsecr",
    "tcp.len",
    "tcp.payload",
    "tls.handshake.random",
    "tls.handshake.session_id",
    "f5ethtrailer.peeraddr",
    "f5ethtrailer.peerport",
];

/// Column index of each field within a parsed row, matching [`FIELDS`]'s
/// order. Kept as named constants so [`crate::extractor`] never hardcodes
/// positions.
pub mod column {
    pub const FRAME_NUMBER: usize = 0;
    pub const TIME_EPOCH: usize = 1;
    pub const IP_SRC: usize = 2;
    pub const IP_DST: usize = 3;
    pub const IP_ID: usize = 4;
    pub const IP_TTL: usize = 5;
    pub const TCP_STREAM: usize = 6;
    pub const TCP_SRCPORT: usize = 7;
    pub const TCP_DSTPORT: usize = 8;
    pub const TCP_SEQ_RAW: usize = 9;
    pub const TCP_ACK_RAW: usize = 10;
    pub const TCP_FLAGS: usize = 11;
    pub const TCP_OPTIONS: usize = 12;
    pub const TCP_TSVAL: usize = 13;
    pub const TCP_TSECR: usize = 14;
    pub const TCP_LEN: usize = 15;
    pub const TCP_PAYLOAD: usize = 16;
    pub const TLS_RANDOM: usize = 17;
    pub const TLS_SESSION_ID: usize = 18;
    pub const F5_PEER_ADDR: usize = 19;
    pub const F5_PEER_PORT: usize = 20;
    pub const COUNT: usize = 21;
}

/// Builds the standard field-extraction argument vector for
/// [`Dissector::run_fields`], including the dissector options spec.md §6
/// requires on every invocation: absolute sequence numbers, no TCP segment
/// reassembly, and the "last occurrence" convention for repeated fields.
pub fn field_args() -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "tcp.relative_sequence_numbers:false".to_string(),
        "-o".to_string(),
        "tcp.desegment_tcp_streams:false".to_string(),
        "-T".to_string(),
        "fields".to_string(),
        "-E".to_string(),
        "separator=,".to_string(),
        "-E".to_string(),
        "occurrence=l".to_string(),
    ];
    for field in FIELDS {
        args.push("-e".to_string());
        args.push((*field).to_string());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    /// spec.md §9: the dissector's default emits relative ISNs, which makes
    /// ISN useless for matching; every invocation must override this. A
    /// regression here would silently make `client_isn`/`server_isn`
    /// meaningless across every Connection the extractor builds.
    #[test]
    fn field_args_always_disables_relative_sequence_numbers() {
        let args = field_args();
        let pos = args
            .iter()
            .position(|a| a == "tcp.relative_sequence_numbers:false")
            .expect("absolute sequence numbers must always be requested");
        assert_eq!(args[pos - 1], "-o");
    }

    #[test]
    fn field_args_disables_tcp_segment_reassembly() {
        let args = field_args();
        assert!(args
            .iter()
            .any(|a| a == "tcp.desegment_tcp_streams:false"));
    }

    #[test]
    fn field_args_uses_last_occurrence_and_comma_separator() {
        let args = field_args();
        assert!(args.iter().any(|a| a == "occurrence=l"));
        assert!(args.iter().any(|a| a == "separator=,"));
    }
}
