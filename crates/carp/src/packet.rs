//! CARP advertisement format and parsing.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version| Type  |     VHID      |    AdvSkew    |    Auth Len   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Reserved   |    AdvBase    |          Checksum             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (1)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Counter (2)                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SHA-1 HMAC (20 bytes)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::types::{CARP_ADVERTISEMENT, CARP_AUTHLEN, CARP_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed CARP header
pub const CARP_HEADER_LEN: usize = 36;

/// Size of the HMAC digest
pub const DIGEST_LEN: usize = 20;

const CHECKSUM_OFFSET: usize = 6;

/// Advertisement decode failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("advertisement too short: {len} bytes, need 36")]
    TooShort { len: usize },
}

/// A decoded CARP advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertisement {
    /// Protocol version (upper nibble of byte 0)
    pub version: u8,

    /// Message type (lower nibble of byte 0)
    pub kind: u8,

    /// Virtual Host ID
    pub vhid: u8,

    /// Advertisement skew, demotion already applied by the sender
    pub advskew: u8,

    /// Authentication length (32-bit words)
    pub authlen: u8,

    /// Advertisement base interval in seconds
    pub advbase: u8,

    /// Counter, carried on the wire as two big-endian 32-bit halves
    pub counter: u64,

    /// SHA-1 HMAC digest
    pub digest: [u8; DIGEST_LEN],
}

impl Advertisement {
    /// Create a new advertisement with the fixed version/type/authlen fields.
    pub fn new(vhid: u8, advbase: u8, advskew: u8, counter: u64, digest: [u8; DIGEST_LEN]) -> Self {
        Self {
            version: CARP_VERSION,
            kind: CARP_ADVERTISEMENT,
            vhid,
            advskew,
            authlen: CARP_AUTHLEN,
            advbase,
            counter,
            digest,
        }
    }

    /// Upper and lower halves of the counter as they appear on the wire.
    pub fn counter_halves(&self) -> [u32; 2] {
        [(self.counter >> 32) as u32, self.counter as u32]
    }

    /// Parse an advertisement from raw bytes.
    ///
    /// Only the length is checked here; version, checksum and authentication
    /// are judged by the receiver so that each failure is counted separately.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < CARP_HEADER_LEN {
            return Err(DecodeError::TooShort { len: data.len() });
        }

        let mut counter = [0u8; 8];
        counter.copy_from_slice(&data[8..16]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&data[16..CARP_HEADER_LEN]);

        Ok(Self {
            version: data[0] >> 4,
            kind: data[0] & 0x0F,
            vhid: data[1],
            advskew: data[2],
            authlen: data[3],
            advbase: data[5],
            counter: u64::from_be_bytes(counter),
            digest,
        })
    }

    /// Serialize to the 36-byte wire header with the checksum filled in.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CARP_HEADER_LEN);

        buf.put_u8((self.version << 4) | (self.kind & 0x0F));
        buf.put_u8(self.vhid);
        buf.put_u8(self.advskew);
        buf.put_u8(self.authlen);
        buf.put_u8(0);
        buf.put_u8(self.advbase);
        buf.put_u16(0);
        buf.put_u64(self.counter);
        buf.put_slice(&self.digest);

        let sum = checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_be_bytes());

        buf.freeze()
    }
}

/// RFC 1071 ones-complement checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Verify the checksum of a received header (the sum over it, checksum
/// included, must fold to zero).
pub fn verify_checksum(header: &[u8]) -> bool {
    header.len() >= CARP_HEADER_LEN && checksum(&header[..CARP_HEADER_LEN]) == 0
}
