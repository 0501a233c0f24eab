//! UDP networking for octstream: the datagram transport, the inbound client
//! protocol, and the server that runs one stream worker per client.

pub mod protocol;
pub mod server;
pub mod transport;

pub use protocol::{ClientMessage, PROTOCOL_VERSION, ProtocolError, decode_message, encode_message};
pub use server::{ServerConfig, ServerError, StreamServer};
pub use transport::UdpTransport;
