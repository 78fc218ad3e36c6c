use crate::consts;
use failure::Fail;
use std::io;

/// Everything that can go wrong inside the broker.
///
/// Connection-level variants are always recovered at the connection
/// boundary; only configuration, bind, and TLS-material problems abort
/// the process.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid handshake from {}: {}", peer, prefix)]
    HandshakeInvalid { peer: String, prefix: String },

    #[fail(display = "invalid command {:?}", tag)]
    CommandInvalid { tag: String },

    #[fail(display = "timed out waiting for a command")]
    CommandTimeout,

    #[fail(display = "stats access denied for {}", peer)]
    Forbidden { peer: String },

    #[fail(display = "invalid ticket {}…", prefix)]
    TicketInvalid { prefix: String },

    #[fail(display = "authorization refused ({}): {}", status, body)]
    UdsRefused { status: u16, body: String },

    #[fail(display = "backend {} unreachable: {}", destination, cause)]
    BackendUnreachable {
        destination: String,
        #[cause]
        cause: io::Error,
    },

    #[fail(display = "peer disconnected")]
    PeerDisconnect,

    #[fail(display = "termination notify failed: {}", _0)]
    NotifyFailure(String),

    #[fail(display = "configuration error: {}", _0)]
    Config(String),

    #[fail(display = "cannot parse configuration: {}", _0)]
    ConfigParse(#[cause] toml::de::Error),

    #[fail(display = "io error: {}", _0)]
    Io(#[cause] io::Error),

    #[fail(display = "TLS error: {}", _0)]
    Tls(#[cause] openssl::error::ErrorStack),

    #[fail(display = "TLS handshake failed: {}", _0)]
    TlsHandshake(#[cause] openssl::ssl::Error),

    #[fail(display = "authorization request failed: {}", _0)]
    Http(#[cause] reqwest::Error),

    #[fail(display = "cannot parse authorization response: {}", _0)]
    UdsResponse(#[cause] serde_json::Error),
}

impl Error {
    /// Ticket error carrying only a loggable prefix, never the full ticket.
    pub fn ticket_invalid(ticket: &[u8]) -> Self {
        let prefix = ticket
            .iter()
            .take(8)
            .map(|&b| {
                if b.is_ascii_graphic() {
                    (b as char).to_string()
                } else {
                    format!("\\x{:02x}", b)
                }
            })
            .collect();
        Error::TicketInvalid { prefix }
    }

    /// Hex prefix of unexpected wire bytes, bounded for log output.
    pub fn handshake_invalid(peer: &std::net::SocketAddr, data: &[u8]) -> Self {
        let prefix = data
            .iter()
            .take(consts::HANDSHAKE_V1.len())
            .map(|b| format!("{:02x}", b))
            .collect();
        Error::HandshakeInvalid {
            peer: peer.to_string(),
            prefix,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(error: openssl::error::ErrorStack) -> Self {
        Error::Tls(error)
    }
}

impl From<openssl::ssl::Error> for Error {
    fn from(error: openssl::ssl::Error) -> Self {
        Error::TlsHandshake(error)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Http(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::UdsResponse(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::ConfigParse(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_errors_truncate_the_ticket() {
        let err = Error::ticket_invalid(&[b'A'; 64]);
        match err {
            Error::TicketInvalid { prefix } => assert_eq!(prefix, "AAAAAAAA"),
            other => panic!("unexpected variant: {}", other),
        }
    }

    #[test]
    fn ticket_errors_escape_binary_bytes() {
        let err = Error::ticket_invalid(b"\x00\xffAB");
        match err {
            Error::TicketInvalid { prefix } => assert_eq!(prefix, "\\x00\\xffAB"),
            other => panic!("unexpected variant: {}", other),
        }
    }
}
