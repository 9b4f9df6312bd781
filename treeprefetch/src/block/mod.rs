//! Decoded block model.
//!
//! A filesystem is a tree of immutable blocks. File blocks hold data or
//! (when indirect) pointers to further file blocks; directory blocks hold
//! named entries or (when indirect) pointers to further directory blocks.
//! The prefetch engine only looks at the shape of a block: whether it is
//! indirect, which children it points at and how large each child is.

mod pointer;

use std::collections::BTreeMap;

use bytes::Bytes;

pub use pointer::{
    BlockId, BlockInfo, BlockPointer, CacheLifetime, KeyMetadata, RefNonce, VolumeId, BLOCK_ID_LEN,
};

/// Type of a directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Symlink,
    /// An entry type this engine does not understand.
    Unknown(u8),
}

/// One named entry of a direct directory block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry_type: EntryType,
    /// Logical size of the entry's content in bytes.
    pub size: u64,
}

impl DirEntry {
    pub fn new(info: BlockInfo, entry_type: EntryType, size: u64) -> Self {
        Self {
            info,
            entry_type,
            size,
        }
    }

    /// Symlinks carry their target inline and have no child block.
    pub fn has_block(&self) -> bool {
        self.entry_type != EntryType::Symlink
    }
}

/// A file block: data, or pointers to further file blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileBlock {
    pub is_indirect: bool,
    pub indirect_ptrs: Vec<BlockInfo>,
    pub contents: Bytes,
    pub encoded_size: u32,
}

impl FileBlock {
    pub fn direct(contents: Bytes, encoded_size: u32) -> Self {
        Self {
            is_indirect: false,
            indirect_ptrs: Vec::new(),
            contents,
            encoded_size,
        }
    }

    pub fn indirect(indirect_ptrs: Vec<BlockInfo>, encoded_size: u32) -> Self {
        Self {
            is_indirect: true,
            indirect_ptrs,
            contents: Bytes::new(),
            encoded_size,
        }
    }
}

/// A directory block: named entries, or pointers to further directory blocks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirBlock {
    pub is_indirect: bool,
    pub indirect_ptrs: Vec<BlockInfo>,
    pub children: BTreeMap<String, DirEntry>,
    pub encoded_size: u32,
}

impl DirBlock {
    pub fn direct(children: BTreeMap<String, DirEntry>, encoded_size: u32) -> Self {
        Self {
            is_indirect: false,
            indirect_ptrs: Vec::new(),
            children,
            encoded_size,
        }
    }

    pub fn indirect(indirect_ptrs: Vec<BlockInfo>, encoded_size: u32) -> Self {
        Self {
            is_indirect: true,
            indirect_ptrs,
            children: BTreeMap::new(),
            encoded_size,
        }
    }
}

/// Template describing what kind of block a retrieval should decode into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockKind {
    File,
    Dir,
    Unknown,
}

/// A decoded block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
    /// A block whose layout this engine cannot walk.
    Unknown { encoded_size: u32 },
}

impl Block {
    pub fn kind(&self) -> BlockKind {
        match self {
            Block::File(_) => BlockKind::File,
            Block::Dir(_) => BlockKind::Dir,
            Block::Unknown { .. } => BlockKind::Unknown,
        }
    }

    pub fn encoded_size(&self) -> u32 {
        match self {
            Block::File(b) => b.encoded_size,
            Block::Dir(b) => b.encoded_size,
            Block::Unknown { encoded_size } => *encoded_size,
        }
    }

    pub fn is_indirect(&self) -> bool {
        match self {
            Block::File(b) => b.is_indirect,
            Block::Dir(b) => b.is_indirect,
            Block::Unknown { .. } => false,
        }
    }

    /// Whether prefetching below this block could never find anything.
    ///
    /// Direct file blocks are always tails. Indirect blocks are tails when
    /// they point nowhere. A direct directory is a tail only when every
    /// entry is a symlink. Unknown blocks are never tails; the trigger walk
    /// rejects them instead.
    pub fn is_tail(&self) -> bool {
        match self {
            Block::File(b) => !b.is_indirect || b.indirect_ptrs.is_empty(),
            Block::Dir(b) if b.is_indirect => b.indirect_ptrs.is_empty(),
            Block::Dir(b) => b.children.values().all(|e| !e.has_block()),
            Block::Unknown { .. } => false,
        }
    }

    /// Returns an empty block of the given kind.
    pub fn empty(kind: BlockKind) -> Self {
        match kind {
            BlockKind::File => Block::File(FileBlock::default()),
            BlockKind::Dir => Block::Dir(DirBlock::default()),
            BlockKind::Unknown => Block::Unknown { encoded_size: 0 },
        }
    }
}
