//! HMAC-SHA1 authentication of CARP advertisements.
//!
//! The inner hash covers the padded key, the fixed header fields and every
//! virtual address of the router. The address list is never transmitted, so
//! all members of a redundancy group must feed it in the same canonical order:
//! IPv4 addresses ascending by numeric value, then IPv6 addresses ascending by
//! byte value, with the embedded scope of link/interface-local IPv6 addresses
//! cleared. The all-zeros and all-ones addresses are never hashed.

use crate::packet::DIGEST_LEN;
use crate::types::{CARP_ADVERTISEMENT, CARP_VERSION};
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const PAD_LEN: usize = 64;
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5c;

/// Precomputed HMAC state for one virtual router.
///
/// Must be rebuilt with [`AuthEngine::prepare`] whenever the key, the VHID or
/// the address set changes.
#[derive(Clone)]
pub struct AuthEngine {
    inner: Sha1,
    opad: [u8; PAD_LEN],
}

impl fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEngine").finish_non_exhaustive()
    }
}

impl AuthEngine {
    /// Hash the key, the fixed fields and the addresses into a cached prefix.
    pub fn prepare<'a, I>(key: &[u8], vhid: u8, addresses: I) -> Self
    where
        I: IntoIterator<Item = &'a IpAddr>,
    {
        let mut pad = [0u8; PAD_LEN];
        let len = key.len().min(PAD_LEN);
        pad[..len].copy_from_slice(&key[..len]);

        let ipad = pad.map(|b| b ^ IPAD);
        let opad = pad.map(|b| b ^ OPAD);

        let mut inner = Sha1::new();
        inner.update(ipad);
        inner.update([CARP_VERSION, CARP_ADVERTISEMENT, vhid]);

        let (v4, v6) = canonical_order(addresses);
        for addr in &v4 {
            inner.update(addr.octets());
        }
        for addr in &v6 {
            inner.update(addr.octets());
        }

        Self { inner, opad }
    }

    /// Finish the HMAC for `counter`.
    pub fn generate(&self, counter: u64) -> [u8; DIGEST_LEN] {
        let mut inner = self.inner.clone();
        inner.update(counter.to_be_bytes());
        let inner_digest = inner.finalize();

        let mut outer = Sha1::new();
        outer.update(self.opad);
        outer.update(inner_digest);
        outer.finalize().into()
    }

    /// Check a received digest. The comparison does not short-circuit.
    pub fn verify(&self, counter: u64, digest: &[u8; DIGEST_LEN]) -> bool {
        let expected = self.generate(counter);
        expected
            .iter()
            .zip(digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Sort and filter addresses the way every CARP peer hashes them.
pub fn canonical_order<'a, I>(addresses: I) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>)
where
    I: IntoIterator<Item = &'a IpAddr>,
{
    let mut v4 = BTreeSet::new();
    let mut v6 = BTreeSet::new();

    for addr in addresses {
        match addr {
            IpAddr::V4(a) => {
                let value = u32::from(*a);
                if value != 0 && value != u32::MAX {
                    v4.insert(value);
                }
            }
            IpAddr::V6(a) => {
                let octets = clear_embedded_scope(a.octets());
                if octets != [0u8; 16] && octets != [0xffu8; 16] {
                    v6.insert(octets);
                }
            }
        }
    }

    (
        v4.into_iter().map(Ipv4Addr::from).collect(),
        v6.into_iter().map(Ipv6Addr::from).collect(),
    )
}

/// Zero bytes 2..4 of scoped addresses (link-local unicast, interface- and
/// link-local multicast), where stacks embed the zone index.
fn clear_embedded_scope(mut octets: [u8; 16]) -> [u8; 16] {
    let link_local = octets[0] == 0xfe && (octets[1] & 0xc0) == 0x80;
    let scoped_multicast = octets[0] == 0xff && matches!(octets[1] & 0x0f, 0x01 | 0x02);
    if link_local || scoped_multicast {
        octets[2] = 0;
        octets[3] = 0;
    }
    octets
}
