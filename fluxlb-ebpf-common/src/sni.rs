//! SNI routing map: TLS ClientHello server name to a target group.
//!
//! The kernel program never stores the hostname itself — only its hash — so
//! the map stays fixed-size regardless of hostname length. Collisions are
//! accepted as a known limitation (see design notes); `fluxlb-control`
//! rejects a configuration that would register two SNI routes whose
//! hostnames hash to the same key.

use crate::fnv::fnv1a64;
use crate::lpm::TargetGroup;

/// FNV-1a 64-bit hash of the lowercased hostname, stored big-endian so the
/// map's byte representation is architecture-independent.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SniKey(pub [u8; 8]);

const _: () = assert!(core::mem::size_of::<SniKey>() == 8);

impl SniKey {
    /// Builds a key from an already-lowercased ASCII hostname. Callers
    /// (config loading, the kernel program's ClientHello parser) are
    /// responsible for lowercasing first.
    #[inline]
    pub fn from_lowercased_hostname(hostname: &[u8]) -> Self {
        SniKey(fnv1a64(hostname).to_be_bytes())
    }
}

pub type SniValue = TargetGroup;

#[cfg(feature = "aya")]
#[allow(unsafe_code)]
/// SAFETY: `SniKey` is `#[repr(C)]`, `Copy`, all bit patterns valid.
unsafe impl aya::Pod for SniKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_hostname_same_key() {
        let a = SniKey::from_lowercased_hostname(b"example.com");
        let b = SniKey::from_lowercased_hostname(b"example.com");
        assert_eq!(a, b);
    }

    #[test]
    fn different_hostname_different_key() {
        let a = SniKey::from_lowercased_hostname(b"example.com");
        let b = SniKey::from_lowercased_hostname(b"example.org");
        assert_ne!(a, b);
    }
}
