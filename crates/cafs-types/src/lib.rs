#![forbid(unsafe_code)]
//! Identifiers, pointers and offsets shared by every cafs crate.
//!
//! `BlockPointer` and `BlockInfo` are the only structures from the block
//! core that cross the storage boundary, embedded in indirect-pointer and
//! directory-entry records. Their binary layout is fixed little-endian and
//! round-trips byte-for-byte, including the all-zero "uninitialized" value.

use cafs_error::CafsError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── Parsing helpers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

impl From<ParseError> for CafsError {
    fn from(err: ParseError) -> Self {
        Self::Parse(err.to_string())
    }
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    Ok(i32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    Ok(i64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// ── Identity newtypes ───────────────────────────────────────────────────────

/// Top-level folder identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TlfId(pub [u8; 16]);

impl TlfId {
    pub const NULL: Self = Self([0; 16]);
}

/// User (or team) identifier recorded in block contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub [u8; 16]);

impl UserId {
    pub const NULL: Self = Self([0; 16]);
}

/// Distinguishes multiple references to the same block ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefNonce(pub [u8; 8]);

impl RefNonce {
    pub const ZERO: Self = Self([0; 8]);
}

/// Branch a dirty block belongs to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchName(pub String);

impl BranchName {
    #[must_use]
    pub fn master() -> Self {
        Self("master".to_owned())
    }
}

impl Default for BranchName {
    fn default() -> Self {
        Self::master()
    }
}

/// Key generation used to encrypt a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyGen(pub i32);

impl KeyGen {
    pub const UNSET: Self = Self(0);
    pub const FIRST_VALID: Self = Self(1);
}

/// Data-format version of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataVer(pub i32);

impl DataVer {
    pub const UNSET: Self = Self(0);
    pub const FIRST_VALID: Self = Self(1);
    /// Indirect file pointers may describe holes.
    pub const CHILD_HOLES: Self = Self(2);
    /// A file tree has at least two levels of indirection.
    pub const AT_LEAST_TWO_LEVELS: Self = Self(3);
    /// Directory blocks may be indirect.
    pub const INDIRECT_DIRS: Self = Self(4);
}

/// Whether a pointer references a leaf or an interior block.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum DirectType {
    #[default]
    Unknown = 0,
    Direct = 1,
    Indirect = 2,
}

impl DirectType {
    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Direct),
            2 => Ok(Self::Indirect),
            _ => Err(ParseError::InvalidField {
                field: "direct_type",
                reason: "unknown value",
            }),
        }
    }
}

/// Kind of payload a block reference carries.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum BlockType {
    #[default]
    Data = 0,
    Md = 1,
}

impl BlockType {
    fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0 => Ok(Self::Data),
            1 => Ok(Self::Md),
            _ => Err(ParseError::InvalidField {
                field: "block_type",
                reason: "unknown value",
            }),
        }
    }
}

// ── Block IDs ───────────────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum IdKind {
    #[default]
    Invalid = 0,
    /// Content address: blake3 of the encoded payload.
    Blake3 = 1,
    /// Locally minted ID for a block that has never been readied.
    Temporary = 2,
}

/// Content ID of a block.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub kind: IdKind,
    pub digest: [u8; 32],
}

static TEMP_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

impl BlockId {
    pub const ZERO: Self = Self {
        kind: IdKind::Invalid,
        digest: [0; 32],
    };

    /// Content-addressed ID for an encoded payload.
    #[must_use]
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            kind: IdKind::Blake3,
            digest: *blake3::hash(payload).as_bytes(),
        }
    }

    /// Fresh temporary ID, unique within this process.
    #[must_use]
    pub fn temporary() -> Self {
        let seq = TEMP_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"cafs-temporary-block-id");
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&nanos.to_le_bytes());
        hasher.update(&seq.to_le_bytes());
        Self {
            kind: IdKind::Temporary,
            digest: *hasher.finalize().as_bytes(),
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.kind != IdKind::Invalid
    }

    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.kind == IdKind::Temporary
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            IdKind::Invalid => "nil",
            IdKind::Blake3 => "b3",
            IdKind::Temporary => "tmp",
        };
        write!(f, "{tag}:")?;
        for byte in &self.digest[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({self})")
    }
}

// ── Pointers ────────────────────────────────────────────────────────────────

/// Who created and who last wrote a block reference.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockContext {
    pub creator: UserId,
    pub writer: UserId,
    pub ref_nonce: RefNonce,
    pub block_type: BlockType,
}

impl Default for UserId {
    fn default() -> Self {
        Self::NULL
    }
}

impl Default for RefNonce {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Default for KeyGen {
    fn default() -> Self {
        Self::UNSET
    }
}

impl Default for DataVer {
    fn default() -> Self {
        Self::UNSET
    }
}

impl BlockContext {
    /// Context for a block first created by `creator`.
    #[must_use]
    pub fn first(creator: UserId, block_type: BlockType) -> Self {
        Self {
            creator,
            writer: UserId::NULL,
            ref_nonce: RefNonce::ZERO,
            block_type,
        }
    }
}

/// Identity of one reference to a block: `(id, ref_nonce)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub id: BlockId,
    pub ref_nonce: RefNonce,
}

/// Identifies a block without containing its bytes.
///
/// The all-zero value is the "uninitialized" sentinel.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub direct_type: DirectType,
    pub context: BlockContext,
}

impl BlockPointer {
    /// Encoded length in bytes.
    pub const ENCODED_LEN: usize = 83;

    pub const ZERO: Self = Self {
        id: BlockId::ZERO,
        key_gen: KeyGen::UNSET,
        data_ver: DataVer::UNSET,
        direct_type: DirectType::Unknown,
        context: BlockContext {
            creator: UserId::NULL,
            writer: UserId::NULL,
            ref_nonce: RefNonce::ZERO,
            block_type: BlockType::Data,
        },
    };

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.id.is_valid()
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.direct_type == DirectType::Direct
    }

    #[must_use]
    pub fn ref_ptr(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            ref_nonce: self.context.ref_nonce,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.id.kind as u8);
        out.extend_from_slice(&self.id.digest);
        out.extend_from_slice(&self.key_gen.0.to_le_bytes());
        out.extend_from_slice(&self.data_ver.0.to_le_bytes());
        out.push(self.direct_type as u8);
        out.extend_from_slice(&self.context.creator.0);
        out.extend_from_slice(&self.context.writer.0);
        out.extend_from_slice(&self.context.ref_nonce.0);
        out.push(self.context.block_type as u8);
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        self.encode_into(&mut out);
        out
    }

    /// Decode a pointer starting at `offset`.
    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        ensure_slice(data, offset, Self::ENCODED_LEN)?;
        let kind = match read_u8(data, offset)? {
            0 => IdKind::Invalid,
            1 => IdKind::Blake3,
            2 => IdKind::Temporary,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "id_kind",
                    reason: "unknown value",
                });
            }
        };
        Ok(Self {
            id: BlockId {
                kind,
                digest: read_fixed::<32>(data, offset + 1)?,
            },
            key_gen: KeyGen(read_le_i32(data, offset + 33)?),
            data_ver: DataVer(read_le_i32(data, offset + 37)?),
            direct_type: DirectType::from_raw(read_u8(data, offset + 41)?)?,
            context: BlockContext {
                creator: UserId(read_fixed::<16>(data, offset + 42)?),
                writer: UserId(read_fixed::<16>(data, offset + 58)?),
                ref_nonce: RefNonce(read_fixed::<8>(data, offset + 74)?),
                block_type: BlockType::from_raw(read_u8(data, offset + 82)?)?,
            },
        })
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.direct_type {
            DirectType::Unknown => "?",
            DirectType::Direct => "d",
            DirectType::Indirect => "i",
        };
        write!(f, "{}[{kind} v{}]", self.id, self.data_ver.0)
    }
}

/// A pointer plus the encoded size of the block it references.
///
/// `encoded_size` is zero until the block has been readied.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockInfo {
    pub ptr: BlockPointer,
    pub encoded_size: u32,
}

impl BlockInfo {
    pub const ENCODED_LEN: usize = BlockPointer::ENCODED_LEN + 4;

    #[must_use]
    pub fn new(ptr: BlockPointer, encoded_size: u32) -> Self {
        Self { ptr, encoded_size }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.ptr.encode_into(out);
        out.extend_from_slice(&self.encoded_size.to_le_bytes());
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ptr: BlockPointer::decode(data, offset)?,
            encoded_size: read_le_u32(data, offset + BlockPointer::ENCODED_LEN)?,
        })
    }
}

// ── Offsets ─────────────────────────────────────────────────────────────────

/// Key type that orders the children of an indirect block.
pub trait Offset: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    /// The smallest offset; the first child of every indirect block
    /// starts here.
    fn first() -> Self;
}

/// Byte offset into a file.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Int64Offset(pub i64);

impl Offset for Int64Offset {
    fn first() -> Self {
        Self(0)
    }
}

impl fmt::Display for Int64Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry name within a directory.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StringOffset(pub String);

impl Offset for StringOffset {
    fn first() -> Self {
        Self(String::new())
    }
}

impl From<&str> for StringOffset {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for StringOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

// ── Request and cache policy enums ──────────────────────────────────────────

/// How a block is being fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReqType {
    Read,
    /// The caller will mutate the block and needs a private copy.
    Write,
    /// Read that must not take any lock the caller already holds.
    ReadParallel,
    Lookup,
}

impl BlockReqType {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

/// Cache tier of a clean block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLifetime {
    /// Durable elsewhere; may be evicted.
    Transient,
    /// Not yet durable; kept until explicitly removed.
    Permanent,
}

/// Whether a put should index the block's content hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashBehavior {
    SkipCacheHash,
    DoCacheHash,
}
