//! Data model (spec.md §3): `Packet`, `Connection`, `Match`/`Score`, `Diff`.

pub mod connection;
pub mod diff;
pub mod packet;
pub mod score;

pub use connection::{Confidence, Connection, ConnectionBuilder, ConnectionId, FileId, FiveTuple};
pub use diff::{Diff, DiffKind, Direction, DirectionCounters, StreamDiffReport};
pub use packet::{ClientHelloInfo, F5PeerInfo, Packet};
pub use score::{Match, Score};
