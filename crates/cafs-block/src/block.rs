//! Decoded block model.
//!
//! A block is either a file block (bytes, or a list of byte-offset
//! pointers) or a directory block (name → entry map, or a list of
//! name-offset pointers). [`TreeBlock`] is the capability set the tree
//! engine needs; it is implemented for both kinds and nothing else.

use cafs_error::{CafsError, Result};
use cafs_types::{
    BlockInfo, BlockPointer, DataVer, DirectType, Int64Offset, Offset, ParseError, StringOffset,
    ensure_slice, read_le_i64, read_le_u16, read_u8,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Capability trait ────────────────────────────────────────────────────────

/// Operations the block tree performs on a block, independent of whether it
/// holds file bytes or directory entries.
///
/// Indices passed to the pointer accessors are positions in the block's
/// indirect pointer list; out-of-range indices are reported by `None` or a
/// `false` return and never panic.
pub trait TreeBlock: Clone + fmt::Debug + Send + Sync + 'static {
    type Offset: Offset;
    /// One `(info, offset, ...)` record of the indirect pointer list.
    type Entry: Clone + fmt::Debug;

    /// Fresh, empty block. `is_ind` selects an indirect block.
    fn new_empty(is_ind: bool) -> Self;

    fn is_indirect(&self) -> bool;

    fn num_indirect_ptrs(&self) -> usize;

    fn indirect_ptr(&self, i: usize) -> Option<(BlockInfo, Self::Offset)>;

    fn set_indirect_ptr_info(&mut self, i: usize, info: BlockInfo) -> bool;

    fn set_indirect_ptr_off(&mut self, i: usize, off: Self::Offset) -> bool;

    fn set_indirect_ptr_type(&mut self, i: usize, direct_type: DirectType) -> bool;

    /// Zero the encoded size of child `i`, marking it as needing a re-ready.
    fn clear_indirect_ptr_size(&mut self, i: usize) -> bool;

    fn append_new_indirect_ptr(&mut self, ptr: BlockPointer, off: Self::Offset);

    fn entry(&self, i: usize) -> Option<Self::Entry>;

    fn set_entry(&mut self, i: usize, entry: Self::Entry) -> bool;

    /// True if `off` lies beyond the data held by this direct block, which
    /// itself starts at `start`.
    fn offset_exceeds_data(&self, start: &Self::Offset, off: &Self::Offset) -> bool;

    /// Bytes that become dirty when this block is dirtied.
    fn bytes_can_be_dirtied(&self) -> i64;

    fn encoded_size(&self) -> u32;

    fn set_encoded_size(&mut self, size: u32);

    fn data_version(&self) -> DataVer;

    fn to_block(&self) -> Block;

    fn from_block(block: Block) -> Result<Self>;
}

// ── Indirect pointers ───────────────────────────────────────────────────────

/// Child reference inside an indirect file block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectFilePtr {
    pub info: BlockInfo,
    pub off: Int64Offset,
    /// Set when the child's range contains a hole (bytes never written).
    pub holes: bool,
}

impl IndirectFilePtr {
    pub const ENCODED_LEN: usize = BlockInfo::ENCODED_LEN + 8 + 1;

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.info.encode_into(out);
        out.extend_from_slice(&self.off.0.to_le_bytes());
        out.push(u8::from(self.holes));
    }

    pub fn decode(data: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        let info = BlockInfo::decode(data, offset)?;
        let off = read_le_i64(data, offset + BlockInfo::ENCODED_LEN)?;
        let holes = match read_u8(data, offset + BlockInfo::ENCODED_LEN + 8)? {
            0 => false,
            1 => true,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "holes",
                    reason: "not a boolean",
                });
            }
        };
        Ok(Self {
            info,
            off: Int64Offset(off),
            holes,
        })
    }
}

/// Child reference inside an indirect directory block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectDirPtr {
    pub info: BlockInfo,
    pub off: StringOffset,
}

impl IndirectDirPtr {
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        BlockInfo::ENCODED_LEN + 2 + self.off.0.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        self.info.encode_into(out);
        let len = u16::try_from(self.off.0.len())
            .map_err(|_| CafsError::BadData(format!("name too long: {}", self.off.0.len())))?;
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(self.off.0.as_bytes());
        Ok(())
    }

    pub fn decode(data: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        let info = BlockInfo::decode(data, offset)?;
        let name_off = offset + BlockInfo::ENCODED_LEN;
        let len = usize::from(read_le_u16(data, name_off)?);
        let raw = ensure_slice(data, name_off + 2, len)?;
        let name = std::str::from_utf8(raw).map_err(|_| ParseError::InvalidField {
            field: "name",
            reason: "not utf-8",
        })?;
        Ok(Self {
            info,
            off: StringOffset(name.to_owned()),
        })
    }
}

// ── Directory entries ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    #[default]
    File,
    Exec,
    Dir,
    Sym,
}

/// Metadata describing a directory entry, independent of where its data
/// lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub entry_type: EntryType,
    pub size: u64,
    pub sym_path: String,
    pub mtime: i64,
    pub ctime: i64,
}

/// A directory entry: the child's top block plus its metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub info: BlockInfo,
    pub entry_info: EntryInfo,
}

impl DirEntry {
    #[must_use]
    pub fn new(ptr: BlockPointer, entry_type: EntryType, size: u64) -> Self {
        Self {
            info: BlockInfo::new(ptr, 0),
            entry_info: EntryInfo {
                entry_type,
                size,
                ..EntryInfo::default()
            },
        }
    }

    fn estimated_len(&self) -> usize {
        BlockInfo::ENCODED_LEN + 1 + 8 + 8 + 8 + self.entry_info.sym_path.len()
    }
}

// ── File blocks ─────────────────────────────────────────────────────────────

/// File block: raw bytes when direct, offset-keyed child pointers when
/// indirect.
///
/// Equality ignores the cached content hash.
#[derive(Debug, Clone, Default)]
pub struct FileBlock {
    pub is_ind: bool,
    contents: Vec<u8>,
    pub iptrs: Vec<IndirectFilePtr>,
    encoded_size: u32,
    hash: Option<[u8; 32]>,
}

impl PartialEq for FileBlock {
    fn eq(&self, other: &Self) -> bool {
        self.is_ind == other.is_ind
            && self.contents == other.contents
            && self.iptrs == other.iptrs
            && self.encoded_size == other.encoded_size
    }
}

impl Eq for FileBlock {}

impl FileBlock {
    #[must_use]
    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self {
            contents,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Mutable access to the bytes; drops any cached content hash.
    pub fn contents_mut(&mut self) -> &mut Vec<u8> {
        self.hash = None;
        &mut self.contents
    }

    pub fn set_contents(&mut self, contents: Vec<u8>) {
        self.hash = None;
        self.contents = contents;
    }

    /// Plaintext hash of the contents, computing and caching it if needed.
    pub fn content_hash(&mut self) -> [u8; 32] {
        if let Some(hash) = self.hash {
            return hash;
        }
        let hash = *blake3::hash(&self.contents).as_bytes();
        self.hash = Some(hash);
        hash
    }

    /// Previously computed hash, if any.
    #[must_use]
    pub fn cached_hash(&self) -> Option<[u8; 32]> {
        self.hash
    }

    #[must_use]
    pub fn has_holes(&self) -> bool {
        self.iptrs.iter().any(|p| p.holes)
    }

    /// Size used for cache accounting when the block has never been
    /// readied.
    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let ptr_bytes = self.iptrs.len() * IndirectFilePtr::ENCODED_LEN;
        (self.contents.len() + ptr_bytes) as u64
    }
}

impl TreeBlock for FileBlock {
    type Offset = Int64Offset;
    type Entry = IndirectFilePtr;

    fn new_empty(is_ind: bool) -> Self {
        Self {
            is_ind,
            ..Self::default()
        }
    }

    fn is_indirect(&self) -> bool {
        self.is_ind
    }

    fn num_indirect_ptrs(&self) -> usize {
        self.iptrs.len()
    }

    fn indirect_ptr(&self, i: usize) -> Option<(BlockInfo, Int64Offset)> {
        self.iptrs.get(i).map(|p| (p.info, p.off))
    }

    fn set_indirect_ptr_info(&mut self, i: usize, info: BlockInfo) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.info = info;
            true
        })
    }

    fn set_indirect_ptr_off(&mut self, i: usize, off: Int64Offset) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.off = off;
            true
        })
    }

    fn set_indirect_ptr_type(&mut self, i: usize, direct_type: DirectType) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.info.ptr.direct_type = direct_type;
            true
        })
    }

    fn clear_indirect_ptr_size(&mut self, i: usize) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.info.encoded_size = 0;
            true
        })
    }

    fn append_new_indirect_ptr(&mut self, ptr: BlockPointer, off: Int64Offset) {
        self.iptrs.push(IndirectFilePtr {
            info: BlockInfo::new(ptr, 0),
            off,
            holes: false,
        });
    }

    fn entry(&self, i: usize) -> Option<IndirectFilePtr> {
        self.iptrs.get(i).copied()
    }

    fn set_entry(&mut self, i: usize, entry: IndirectFilePtr) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            *p = entry;
            true
        })
    }

    fn offset_exceeds_data(&self, start: &Int64Offset, off: &Int64Offset) -> bool {
        if self.is_ind {
            return false;
        }
        let len = i64::try_from(self.contents.len()).unwrap_or(i64::MAX);
        start.0.saturating_add(len) <= off.0
    }

    fn bytes_can_be_dirtied(&self) -> i64 {
        if self.is_ind {
            i64::try_from(self.iptrs.len() * IndirectFilePtr::ENCODED_LEN).unwrap_or(i64::MAX)
        } else {
            i64::try_from(self.contents.len()).unwrap_or(i64::MAX)
        }
    }

    fn encoded_size(&self) -> u32 {
        self.encoded_size
    }

    fn set_encoded_size(&mut self, size: u32) {
        self.encoded_size = size;
    }

    fn data_version(&self) -> DataVer {
        if !self.is_ind {
            return DataVer::FIRST_VALID;
        }
        if self
            .iptrs
            .iter()
            .any(|p| p.info.ptr.direct_type == DirectType::Indirect)
        {
            DataVer::AT_LEAST_TWO_LEVELS
        } else if self.has_holes() {
            DataVer::CHILD_HOLES
        } else {
            DataVer::FIRST_VALID
        }
    }

    fn to_block(&self) -> Block {
        Block::File(self.clone())
    }

    fn from_block(block: Block) -> Result<Self> {
        match block {
            Block::File(fblock) => Ok(fblock),
            Block::Dir(_) => Err(CafsError::BadData(
                "expected a file block, found a directory block".to_owned(),
            )),
        }
    }
}

// ── Directory blocks ────────────────────────────────────────────────────────

/// Directory block: sorted entries when direct, name-keyed child pointers
/// when indirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirBlock {
    pub is_ind: bool,
    pub children: BTreeMap<String, DirEntry>,
    pub iptrs: Vec<IndirectDirPtr>,
    encoded_size: u32,
}

impl DirBlock {
    #[must_use]
    pub fn with_children(children: BTreeMap<String, DirEntry>) -> Self {
        Self {
            children,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn estimated_size(&self) -> u64 {
        let entries: usize = self
            .children
            .iter()
            .map(|(name, de)| name.len() + de.estimated_len())
            .sum();
        let ptrs: usize = self.iptrs.iter().map(IndirectDirPtr::encoded_len).sum();
        (entries + ptrs) as u64
    }
}

impl TreeBlock for DirBlock {
    type Offset = StringOffset;
    type Entry = IndirectDirPtr;

    fn new_empty(is_ind: bool) -> Self {
        Self {
            is_ind,
            ..Self::default()
        }
    }

    fn is_indirect(&self) -> bool {
        self.is_ind
    }

    fn num_indirect_ptrs(&self) -> usize {
        self.iptrs.len()
    }

    fn indirect_ptr(&self, i: usize) -> Option<(BlockInfo, StringOffset)> {
        self.iptrs.get(i).map(|p| (p.info, p.off.clone()))
    }

    fn set_indirect_ptr_info(&mut self, i: usize, info: BlockInfo) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.info = info;
            true
        })
    }

    fn set_indirect_ptr_off(&mut self, i: usize, off: StringOffset) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.off = off;
            true
        })
    }

    fn set_indirect_ptr_type(&mut self, i: usize, direct_type: DirectType) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.info.ptr.direct_type = direct_type;
            true
        })
    }

    fn clear_indirect_ptr_size(&mut self, i: usize) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            p.info.encoded_size = 0;
            true
        })
    }

    fn append_new_indirect_ptr(&mut self, ptr: BlockPointer, off: StringOffset) {
        self.iptrs.push(IndirectDirPtr {
            info: BlockInfo::new(ptr, 0),
            off,
        });
    }

    fn entry(&self, i: usize) -> Option<IndirectDirPtr> {
        self.iptrs.get(i).cloned()
    }

    fn set_entry(&mut self, i: usize, entry: IndirectDirPtr) -> bool {
        self.iptrs.get_mut(i).is_some_and(|p| {
            *p = entry;
            true
        })
    }

    fn offset_exceeds_data(&self, _start: &StringOffset, _off: &StringOffset) -> bool {
        false
    }

    fn bytes_can_be_dirtied(&self) -> i64 {
        i64::try_from(self.estimated_size()).unwrap_or(i64::MAX)
    }

    fn encoded_size(&self) -> u32 {
        self.encoded_size
    }

    fn set_encoded_size(&mut self, size: u32) {
        self.encoded_size = size;
    }

    fn data_version(&self) -> DataVer {
        if self.is_ind {
            DataVer::INDIRECT_DIRS
        } else {
            DataVer::FIRST_VALID
        }
    }

    fn to_block(&self) -> Block {
        Block::Dir(self.clone())
    }

    fn from_block(block: Block) -> Result<Self> {
        match block {
            Block::Dir(dblock) => Ok(dblock),
            Block::File(_) => Err(CafsError::BadData(
                "expected a directory block, found a file block".to_owned(),
            )),
        }
    }
}

// ── Closed block variant ────────────────────────────────────────────────────

/// Any decoded block held by the caches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
}

impl Block {
    #[must_use]
    pub fn is_indirect(&self) -> bool {
        match self {
            Self::File(b) => b.is_ind,
            Self::Dir(b) => b.is_ind,
        }
    }

    #[must_use]
    pub fn encoded_size(&self) -> u32 {
        match self {
            Self::File(b) => b.encoded_size,
            Self::Dir(b) => b.encoded_size,
        }
    }

    /// Bytes charged against a cache budget: the encoded size once known,
    /// otherwise an estimate of the plaintext size.
    #[must_use]
    pub fn cached_size(&self) -> u64 {
        match self.encoded_size() {
            0 => match self {
                Self::File(b) => b.estimated_size(),
                Self::Dir(b) => b.estimated_size(),
            },
            size => u64::from(size),
        }
    }

    #[must_use]
    pub fn data_version(&self) -> DataVer {
        match self {
            Self::File(b) => b.data_version(),
            Self::Dir(b) => b.data_version(),
        }
    }

    #[must_use]
    pub fn bytes_can_be_dirtied(&self) -> i64 {
        match self {
            Self::File(b) => b.bytes_can_be_dirtied(),
            Self::Dir(b) => b.bytes_can_be_dirtied(),
        }
    }

    /// The direct file block inside, if this is one.
    #[must_use]
    pub fn as_direct_file(&self) -> Option<&FileBlock> {
        match self {
            Self::File(b) if !b.is_ind => Some(b),
            _ => None,
        }
    }
}

impl From<FileBlock> for Block {
    fn from(block: FileBlock) -> Self {
        Self::File(block)
    }
}

impl From<DirBlock> for Block {
    fn from(block: DirBlock) -> Self {
        Self::Dir(block)
    }
}
