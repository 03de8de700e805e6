//! Control plane: literal tokens exchanged over the discovery channel before the data plane exists.

use serde::{Deserialize, Serialize};

/// Subscriber → Publisher: ask the publisher to bring up a data network.
pub const REQUEST_DATA_CONNECTION: &str = "REQUEST_DATA_CONNECTION";
/// Publisher → Subscriber: network requested and listening port fixed; subscriber may bring up.
pub const DATA_CONNECTION_READY: &str = "DATA_CONNECTION_READY";

/// Discovery role of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Publisher,
    Subscriber,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Publisher => "publisher",
            Role::Subscriber => "subscriber",
        }
    }

    /// Transport side this role takes once the network is up.
    pub fn transport_side(self) -> &'static str {
        match self {
            Role::Publisher => "server",
            Role::Subscriber => "client",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake tokens. Anything else on the discovery channel is application text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    RequestDataConnection,
    DataConnectionReady,
}

impl ControlMessage {
    pub fn token(self) -> &'static str {
        match self {
            ControlMessage::RequestDataConnection => REQUEST_DATA_CONNECTION,
            ControlMessage::DataConnectionReady => DATA_CONNECTION_READY,
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        self.token().as_bytes().to_vec()
    }

    /// Exact match only; a token with trailing bytes is plain text.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes == REQUEST_DATA_CONNECTION.as_bytes() {
            Some(ControlMessage::RequestDataConnection)
        } else if bytes == DATA_CONNECTION_READY.as_bytes() {
            Some(ControlMessage::DataConnectionReady)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_parse_exactly() {
        assert_eq!(
            ControlMessage::parse(b"REQUEST_DATA_CONNECTION"),
            Some(ControlMessage::RequestDataConnection)
        );
        assert_eq!(
            ControlMessage::parse(&ControlMessage::DataConnectionReady.to_bytes()),
            Some(ControlMessage::DataConnectionReady)
        );
        assert_eq!(ControlMessage::parse(b"REQUEST_DATA_CONNECTION "), None);
        assert_eq!(ControlMessage::parse(b"hello"), None);
        assert_eq!(ControlMessage::parse(b""), None);
    }
}
