#![deny(rust_2018_compatibility)]
#![warn(rust_2018_idioms)]

//! Key derivation for encrypted tunnel tickets.
//!
//! A KEM exchange leaves client and broker with the same shared secret.
//! From that secret and the 48-byte ticket id this crate derives the full
//! set of keying material for one tunnel session: a payload key, one key
//! and one nonce per direction.

use failure::Fail;
use hkdf::Hkdf;
use sha2::Sha256;

/// Required length of a ticket id in bytes.
pub const TICKET_ID_LENGTH: usize = 48;

/// Total output keying material produced by one derivation.
const OKM_LENGTH: usize = 120;

/// HKDF domain separation string.
const HKDF_INFO: &[u8] = b"openuds-ticket-crypt";

#[derive(Debug, Fail, Eq, PartialEq)]
pub enum DeriveError {
    #[fail(display = "ticket_id must be {} bytes, got {}", _0, _1)]
    TicketIdLength(usize, usize),
    #[fail(display = "requested output length is not expandable")]
    OkmLength,
}

/// Keys and nonces for one tunnel session.
///
/// All five values come from a single HKDF expansion and are only valid
/// together; there is no way to derive a subset.
#[derive(Clone, Eq, PartialEq)]
pub struct TunnelMaterial {
    pub key_payload: [u8; 32],
    pub key_send: [u8; 32],
    pub key_receive: [u8; 32],
    pub nonce_send: [u8; 12],
    pub nonce_receive: [u8; 12],
}

// Manual impl so key bytes never end up in log output.
impl std::fmt::Debug for TunnelMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelMaterial").finish()
    }
}

/// Derive the keys and nonces for one tunnel session.
///
/// `shared_secret` is the KEM output (opaque bytes, typically 32) and
/// `ticket_id` the unique 48-byte session id, used as the HKDF salt.
/// The derivation is pure: equal inputs always yield equal material.
pub fn derive_tunnel_material(
    shared_secret: &[u8],
    ticket_id: &[u8],
) -> Result<TunnelMaterial, DeriveError> {
    if ticket_id.len() != TICKET_ID_LENGTH {
        return Err(DeriveError::TicketIdLength(TICKET_ID_LENGTH, ticket_id.len()));
    }

    let hk = Hkdf::<Sha256>::new(Some(ticket_id), shared_secret);
    let mut okm = [0u8; OKM_LENGTH];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| DeriveError::OkmLength)?;

    let mut material = TunnelMaterial {
        key_payload: [0; 32],
        key_send: [0; 32],
        key_receive: [0; 32],
        nonce_send: [0; 12],
        nonce_receive: [0; 12],
    };
    material.key_payload.copy_from_slice(&okm[0..32]);
    material.key_send.copy_from_slice(&okm[32..64]);
    material.key_receive.copy_from_slice(&okm[64..96]);
    material.nonce_send.copy_from_slice(&okm[96..108]);
    material.nonce_receive.copy_from_slice(&okm[108..120]);
    Ok(material)
}
