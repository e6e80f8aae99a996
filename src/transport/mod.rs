pub mod link;

pub use link::{ConnectionState, LinkReader, LinkWriter, SharedConnectionState, TcpLink, TransportLink};
