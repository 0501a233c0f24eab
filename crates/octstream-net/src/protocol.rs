//! Client-to-server datagrams.
//!
//! Every datagram is `[version: u8] [postcard-encoded ClientMessage]`.

use octstream_core::ClientQuery;
use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every client datagram.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    /// The client's current view. The first one opens a stream.
    Query(ClientQuery),
    /// The client is leaving.
    Disconnect,
}

/// Errors that can occur while decoding a client datagram.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty datagram")]
    EmptyPayload,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("malformed message: {0}")]
    Postcard(#[from] postcard::Error),
}

pub fn encode_message(msg: &ClientMessage) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let Some((&version, body)) = data.split_first() else {
        return Err(ProtocolError::EmptyPayload);
    };
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
