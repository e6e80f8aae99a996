pub mod packet;
pub mod parser;

pub use packet::{encode, Packet, PacketKind};
pub use parser::{feed, PacketBuffer, ParseOutcome};
