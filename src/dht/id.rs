use std::fmt;

use primitive_types::U256;
use rand::Rng as _;
use sha1::{Digest, Sha1};

use super::error::DhtError;

/// Length of a node id or info-hash in bytes.
pub const ID_LEN: usize = 20;

/// A 160-bit DHT identifier.
///
/// Node ids and info-hashes live in the same space. Closeness between two
/// identifiers is their XOR, compared as an unsigned integer (the Kademlia
/// metric).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    /// Generates a fresh id: 20 random bytes run through SHA-1.
    pub fn generate() -> Self {
        let mut seed = [0u8; ID_LEN];
        rand::rng().fill(&mut seed);
        let digest = Sha1::digest(seed);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Draws a uniform id from `[min, max)`.
    pub fn random_in(min: U256, max: U256) -> Self {
        debug_assert!(min < max);
        let mut raw = [0u8; 32];
        rand::rng().fill(&mut raw);
        let value = min + U256::from_big_endian(&raw) % (max - min);
        Self::from_u256(value)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidEnvelope("id is not 20 bytes".into()));
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The id as an unsigned integer in `[0, 2^160)`.
    pub fn to_u256(&self) -> U256 {
        U256::from_big_endian(&self.0)
    }

    /// Truncates `value` to the low 160 bits.
    pub fn from_u256(value: U256) -> Self {
        let mut wide = [0u8; 32];
        value.to_big_endian(&mut wide);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&wide[12..]);
        Self(id)
    }

    /// XOR distance to `other`.
    pub fn distance(&self, other: &Id) -> U256 {
        self.to_u256() ^ other.to_u256()
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}
