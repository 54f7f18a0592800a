//! Deterministic name shortening.
//!
//! Auxiliary objects (backup claims, sync jobs, RBAC objects) are re-located
//! on every reconcile purely by name, so shortening must be a pure function
//! of the input. Truncation keeps a readable prefix and appends the CRC of
//! the full string in hex.

use crc::{Crc, CRC_32_ISO_HDLC, CRC_64_GO_ISO};
use thiserror::Error;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum NamingError {
    #[error("cannot shorten below {0} characters")]
    BoundTooSmall(usize),
}

/// Shortens `s` to at most `l` characters.
///
/// Picks the CRC-64 form for bounds above 32 characters and the CRC-32 form
/// below, trading hash width for prefix readability on short bounds.
pub fn shorten_name(s: &str, l: usize) -> Result<String, NamingError> {
    if s.len() <= l {
        return Ok(s.to_string());
    }
    if l > 32 {
        shorten_name64(s, l)
    } else {
        shorten_name32(s, l)
    }
}

/// Shortens `s` to at most `l` characters using a 16-hex-digit CRC-64 (ISO
/// polynomial) suffix. Fails for bounds below 16.
pub fn shorten_name64(s: &str, l: usize) -> Result<String, NamingError> {
    if s.len() <= l {
        return Ok(s.to_string());
    }
    if l < 16 {
        return Err(NamingError::BoundTooSmall(16));
    }
    let sum = CRC64.checksum(s.as_bytes());
    Ok(format!("{}{:016x}", prefix(s, l - 16), sum))
}

/// Shortens `s` to at most `l` characters using an 8-hex-digit CRC-32 (IEEE
/// polynomial) suffix. Fails for bounds below 8.
pub fn shorten_name32(s: &str, l: usize) -> Result<String, NamingError> {
    if s.len() <= l {
        return Ok(s.to_string());
    }
    if l < 8 {
        return Err(NamingError::BoundTooSmall(8));
    }
    let sum = CRC32.checksum(s.as_bytes());
    Ok(format!("{}{:08x}", prefix(s, l - 8), sum))
}

// Object names are DNS-1123 and therefore ASCII; fall back to the nearest
// char boundary rather than panic if something else slips through.
fn prefix(s: &str, mut n: usize) -> &str {
    while n > 0 && !s.is_char_boundary(n) {
        n -= 1;
    }
    &s[..n]
}
