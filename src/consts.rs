//! Wire-protocol constants shared by the broker and the stats client.

use std::time::Duration;

/// Cleartext preamble every client must send before the TLS handshake.
pub const HANDSHAKE_V1: &[u8] = b"\x5AMGB\xA5\x01\x00";

/// All command tags are exactly this many ASCII bytes.
pub const COMMAND_LENGTH: usize = 4;
/// Tickets are exactly this many ASCII alphanumeric bytes.
pub const TICKET_LENGTH: usize = 64;
/// Stats passwords are exactly this many bytes.
pub const PASSWORD_LENGTH: usize = 32;

/// Chunk size used while relaying payload bytes.
pub const BUFFER_SIZE: usize = 16 * 1024;

pub const COMMAND_OPEN: &[u8] = b"OPEN";
pub const COMMAND_TEST: &[u8] = b"TEST";
pub const COMMAND_STAT: &[u8] = b"STAT";
pub const COMMAND_INFO: &[u8] = b"INFO";

pub const RESPONSE_OK: &[u8] = b"OK";
pub const RESPONSE_ERROR_TICKET: &[u8] = b"ERROR_TICKET";
pub const RESPONSE_ERROR_TIMEOUT: &[u8] = b"ERROR_TIMEOUT";
pub const RESPONSE_ERROR_COMMAND: &[u8] = b"ERROR_COMMAND";
pub const RESPONSE_ERROR_CONNECT: &[u8] = b"ERROR_CONNECT";
pub const RESPONSE_FORBIDDEN: &[u8] = b"FORBIDDEN";

/// How long a freshly accepted socket may take to present the preamble.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on concurrently running preamble reads.
pub const MAX_PREAMBLE_TASKS: usize = 16;

/// Capacity of the per-worker socket handoff channel.
pub const HANDOFF_QUEUE: usize = 64;

/// Capacity of the per-worker termination notify queue.
pub const NOTIFY_QUEUE: usize = 64;

/// User agent presented to the authorization service.
pub const USER_AGENT: &str = concat!("TLSTunnel/", env!("CARGO_PKG_VERSION"));

/// A ticket is valid iff it is exactly [`TICKET_LENGTH`] ASCII alphanumeric bytes.
pub fn ticket_is_valid(ticket: &[u8]) -> bool {
    ticket.len() == TICKET_LENGTH && ticket.iter().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_validation() {
        assert!(ticket_is_valid(&[b'a'; TICKET_LENGTH]));
        assert!(ticket_is_valid(b"0123456789012345678901234567890123456789012345678901234567890123"));

        // wrong length
        assert!(!ticket_is_valid(&[b'a'; TICKET_LENGTH - 1]));
        assert!(!ticket_is_valid(&[b'a'; TICKET_LENGTH + 1]));
        assert!(!ticket_is_valid(b""));

        // non-alphanumeric bytes
        let mut ticket = [b'a'; TICKET_LENGTH];
        ticket[17] = b'!';
        assert!(!ticket_is_valid(&ticket));
        ticket[17] = b' ';
        assert!(!ticket_is_valid(&ticket));
        ticket[17] = 0xff;
        assert!(!ticket_is_valid(&ticket));
    }

    #[test]
    fn command_tags_are_four_bytes() {
        for tag in &[COMMAND_OPEN, COMMAND_TEST, COMMAND_STAT, COMMAND_INFO] {
            assert_eq!(tag.len(), COMMAND_LENGTH);
        }
    }
}
