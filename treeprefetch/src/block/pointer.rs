//! Block identity types.
//!
//! Blocks are content-addressed: a [`BlockId`] is derived from the block's
//! encrypted bytes, so identical content always has the same identifier. A
//! [`RefNonce`] distinguishes separate logical references to identical
//! content, and a [`BlockPointer`] pairs the two.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a block identifier in bytes.
pub const BLOCK_ID_LEN: usize = 32;

/// Content identifier of a block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId([u8; BLOCK_ID_LEN]);

impl BlockId {
    /// The all-zero identifier, used when no block is known.
    pub const ZERO: BlockId = BlockId([0; BLOCK_ID_LEN]);

    /// Wraps raw identifier bytes.
    pub fn from_bytes(bytes: [u8; BLOCK_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derives the identifier for the given encoded block content.
    pub fn for_content(content: &[u8]) -> Self {
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; BLOCK_ID_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Returns the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; BLOCK_ID_LEN] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.short())
    }
}

/// Discriminates logical references to bit-identical content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RefNonce(pub u64);

impl RefNonce {
    /// The nonce of the first reference to a block.
    pub const ZERO: RefNonce = RefNonce(0);
}

impl fmt::Display for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A reference to one block instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: BlockId,
    pub ref_nonce: RefNonce,
}

impl BlockPointer {
    /// Creates a pointer with the zero reference nonce.
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            ref_nonce: RefNonce::ZERO,
        }
    }

    /// Returns a pointer to the same content with a different nonce.
    pub fn with_ref_nonce(self, ref_nonce: RefNonce) -> Self {
        Self { ref_nonce, ..self }
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ref_nonce == RefNonce::ZERO {
            write!(f, "{}", self.id.short())
        } else {
            write!(f, "{}#{}", self.id.short(), self.ref_nonce)
        }
    }
}

/// A pointer together with the size of the encoded block it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    pub pointer: BlockPointer,
    pub encoded_size: u32,
}

impl BlockInfo {
    pub fn new(pointer: BlockPointer, encoded_size: u32) -> Self {
        Self {
            pointer,
            encoded_size,
        }
    }
}

/// Identifier of an independently keyed filesystem namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u64);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vol-{:08x}", self.0)
    }
}

/// Key context needed to decrypt blocks of one volume.
///
/// The engine never inspects keys; it only needs to know which volume a
/// request belongs to and to hand the metadata back to the retriever.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyMetadata {
    volume_id: VolumeId,
    key_generation: u32,
}

impl KeyMetadata {
    pub fn new(volume_id: VolumeId, key_generation: u32) -> Self {
        Self {
            volume_id,
            key_generation,
        }
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn key_generation(&self) -> u32 {
        self.key_generation
    }
}

/// How long a fetched block should stay in the in-memory cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLifetime {
    /// Evictable at any time.
    #[default]
    Transient,
    /// Kept until explicitly removed.
    Permanent,
}
