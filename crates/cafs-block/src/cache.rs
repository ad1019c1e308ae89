//! Clean block cache with two lifetimes and a content-hash index.
//!
//! Transient entries are durable elsewhere and are evicted oldest-first
//! when either the entry-count or the byte budget would be exceeded.
//! Permanent entries are mid-upload and are only removed explicitly; they
//! bypass the capacity checks but their bytes count against the budget
//! seen by later transient puts.

use crate::block::{Block, FileBlock};
use cafs_error::{CafsError, Result};
use cafs_types::{BlockId, BlockPointer, CacheLifetime, HashBehavior, TlfId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// Clean cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    /// Maximum number of transient entries. Default: 5000.
    pub transient_capacity: usize,
    /// Byte budget shared by transient and permanent entries.
    /// Default: 1 GiB.
    pub clean_bytes_capacity: u64,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            transient_capacity: 5000,
            clean_bytes_capacity: 1 << 30,
        }
    }
}

/// Store of decoded, clean blocks shared by every tree in a process.
pub trait BlockCache: Send + Sync {
    /// Fetch a block from either tier.
    fn get(&self, ptr: &BlockPointer) -> Result<Block>;

    /// Fetch a block and report which tier it came from. Transient wins
    /// when a block is in both.
    fn get_with_lifetime(&self, ptr: &BlockPointer) -> Result<(Block, CacheLifetime)>;

    fn put(
        &self,
        ptr: BlockPointer,
        tlf: TlfId,
        block: Block,
        lifetime: CacheLifetime,
        hash_behavior: HashBehavior,
    ) -> Result<()>;

    /// Pointer of a transient block with byte-identical contents, or
    /// [`BlockPointer::ZERO`] if none is known.
    fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Result<BlockPointer>;

    fn delete_transient(&self, id: &BlockId, tlf: TlfId) -> Result<()>;

    fn delete_permanent(&self, id: &BlockId) -> Result<()>;

    /// Forget the hash index entry for `block`'s contents.
    fn delete_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Result<()>;

    fn clean_bytes_capacity(&self) -> u64;

    fn set_clean_bytes_capacity(&self, capacity: u64);
}

#[derive(Debug)]
struct TransientEntry {
    tlf: TlfId,
    block: Block,
    bytes: u64,
    hash: Option<[u8; 32]>,
}

#[derive(Debug)]
struct PermanentEntry {
    block: Block,
    bytes: u64,
}

#[derive(Debug)]
struct CacheState {
    transient: HashMap<BlockId, TransientEntry>,
    /// Transient IDs, least recently used first.
    lru: VecDeque<BlockId>,
    permanent: HashMap<BlockId, PermanentEntry>,
    hashes: HashMap<(TlfId, [u8; 32]), BlockPointer>,
    total_bytes: u64,
    entry_capacity: usize,
    bytes_capacity: u64,
}

impl CacheState {
    fn remove_from_lru(lru: &mut VecDeque<BlockId>, id: &BlockId) -> bool {
        if let Some(pos) = lru.iter().position(|k| k == id) {
            let _ = lru.remove(pos);
            return true;
        }
        false
    }

    fn touch(&mut self, id: &BlockId) {
        if Self::remove_from_lru(&mut self.lru, id) {
            self.lru.push_back(*id);
        }
    }

    fn remove_transient(&mut self, id: &BlockId) -> Option<TransientEntry> {
        let entry = self.transient.remove(id)?;
        let _ = Self::remove_from_lru(&mut self.lru, id);
        self.total_bytes = self.total_bytes.saturating_sub(entry.bytes);
        if let Some(hash) = entry.hash {
            let key = (entry.tlf, hash);
            if self.hashes.get(&key).is_some_and(|p| p.id == *id) {
                let _ = self.hashes.remove(&key);
            }
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(victim) = self.lru.front().copied() else {
            return false;
        };
        if let Some(entry) = self.remove_transient(&victim) {
            trace!(target: "cafs::cache", id = %victim, bytes = entry.bytes, "cache_evict");
        }
        true
    }

    fn needs_eviction(&self, incoming_bytes: u64) -> bool {
        self.transient.len() >= self.entry_capacity
            || self.total_bytes.saturating_add(incoming_bytes) > self.bytes_capacity
    }

    fn evict_to_budget(&mut self) {
        while self.total_bytes > self.bytes_capacity && self.evict_oldest() {}
    }
}

/// Standard in-memory [`BlockCache`].
#[derive(Debug)]
pub struct BlockCacheStandard {
    state: Mutex<CacheState>,
}

impl BlockCacheStandard {
    #[must_use]
    pub fn new(config: BlockCacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState {
                transient: HashMap::new(),
                lru: VecDeque::new(),
                permanent: HashMap::new(),
                hashes: HashMap::new(),
                total_bytes: 0,
                entry_capacity: config.transient_capacity,
                bytes_capacity: config.clean_bytes_capacity,
            }),
        }
    }

    /// Summed bytes of all transient and permanent entries.
    #[must_use]
    pub fn clean_total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    #[must_use]
    pub fn num_transient(&self) -> usize {
        self.state.lock().transient.len()
    }

    #[must_use]
    pub fn num_permanent(&self) -> usize {
        self.state.lock().permanent.len()
    }

    fn not_found(ptr: &BlockPointer) -> CafsError {
        CafsError::NoSuchBlock {
            id: ptr.id.to_string(),
        }
    }

    fn put_permanent(state: &mut CacheState, id: BlockId, block: Block) {
        let bytes = block.cached_size();
        if let Some(old) = state.permanent.insert(id, PermanentEntry { block, bytes }) {
            state.total_bytes = state.total_bytes.saturating_sub(old.bytes);
        }
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        trace!(target: "cafs::cache", id = %id, bytes, "cache_put_permanent");
    }

    fn put_transient(
        state: &mut CacheState,
        ptr: BlockPointer,
        tlf: TlfId,
        mut block: Block,
        hash_behavior: HashBehavior,
    ) -> Result<()> {
        let id = ptr.id;
        let bytes = block.cached_size();
        let hash = match (&mut block, hash_behavior) {
            (Block::File(fblock), HashBehavior::DoCacheHash) if !fblock.is_ind => {
                Some(fblock.content_hash())
            }
            _ => None,
        };

        // A re-put replaces the old entry so its bytes are not counted
        // twice.
        let _ = state.remove_transient(&id);

        while state.needs_eviction(bytes) {
            if !state.evict_oldest() {
                break;
            }
        }
        if state.total_bytes.saturating_add(bytes) > state.bytes_capacity {
            debug!(
                target: "cafs::cache",
                id = %id,
                bytes,
                total = state.total_bytes,
                capacity = state.bytes_capacity,
                "cache_put_full"
            );
            return Err(CafsError::CachePutCacheFull {
                id: id.to_string(),
                bytes,
                capacity: state.bytes_capacity,
            });
        }

        if let Some(hash) = hash {
            state.hashes.insert((tlf, hash), ptr);
        }
        state.transient.insert(
            id,
            TransientEntry {
                tlf,
                block,
                bytes,
                hash,
            },
        );
        state.lru.push_back(id);
        state.total_bytes = state.total_bytes.saturating_add(bytes);
        trace!(target: "cafs::cache", id = %id, bytes, total = state.total_bytes, "cache_put_transient");
        Ok(())
    }
}

impl Default for BlockCacheStandard {
    fn default() -> Self {
        Self::new(BlockCacheConfig::default())
    }
}

impl BlockCache for BlockCacheStandard {
    fn get(&self, ptr: &BlockPointer) -> Result<Block> {
        self.get_with_lifetime(ptr).map(|(block, _)| block)
    }

    fn get_with_lifetime(&self, ptr: &BlockPointer) -> Result<(Block, CacheLifetime)> {
        let mut guard = self.state.lock();
        if let Some(entry) = guard.transient.get(&ptr.id) {
            let block = entry.block.clone();
            guard.touch(&ptr.id);
            drop(guard);
            return Ok((block, CacheLifetime::Transient));
        }
        let found = guard
            .permanent
            .get(&ptr.id)
            .map(|entry| (entry.block.clone(), CacheLifetime::Permanent));
        drop(guard);
        found.ok_or_else(|| Self::not_found(ptr))
    }

    fn put(
        &self,
        ptr: BlockPointer,
        tlf: TlfId,
        block: Block,
        lifetime: CacheLifetime,
        hash_behavior: HashBehavior,
    ) -> Result<()> {
        let mut guard = self.state.lock();
        match lifetime {
            CacheLifetime::Permanent => {
                Self::put_permanent(&mut guard, ptr.id, block);
                Ok(())
            }
            CacheLifetime::Transient => {
                Self::put_transient(&mut guard, ptr, tlf, block, hash_behavior)
            }
        }
    }

    fn check_for_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Result<BlockPointer> {
        if block.is_ind {
            return Err(CafsError::NotDirectFileBlock);
        }
        let hash = block
            .cached_hash()
            .unwrap_or_else(|| *blake3::hash(block.contents()).as_bytes());
        let mut guard = self.state.lock();
        let Some(ptr) = guard.hashes.get(&(tlf, hash)).copied() else {
            return Ok(BlockPointer::ZERO);
        };
        guard.touch(&ptr.id);
        drop(guard);
        Ok(ptr)
    }

    fn delete_transient(&self, id: &BlockId, _tlf: TlfId) -> Result<()> {
        let _ = self.state.lock().remove_transient(id);
        Ok(())
    }

    fn delete_permanent(&self, id: &BlockId) -> Result<()> {
        let mut guard = self.state.lock();
        if let Some(entry) = guard.permanent.remove(id) {
            guard.total_bytes = guard.total_bytes.saturating_sub(entry.bytes);
        }
        Ok(())
    }

    fn delete_known_ptr(&self, tlf: TlfId, block: &FileBlock) -> Result<()> {
        if block.is_ind {
            return Err(CafsError::NotDirectFileBlock);
        }
        let hash = block
            .cached_hash()
            .unwrap_or_else(|| *blake3::hash(block.contents()).as_bytes());
        let _ = self.state.lock().hashes.remove(&(tlf, hash));
        Ok(())
    }

    fn clean_bytes_capacity(&self) -> u64 {
        self.state.lock().bytes_capacity
    }

    fn set_clean_bytes_capacity(&self, capacity: u64) {
        let mut guard = self.state.lock();
        guard.bytes_capacity = capacity;
        guard.evict_to_budget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::TreeBlock;
    use cafs_types::BlockId;
    use proptest::prelude::*;

    fn ptr(n: u8) -> BlockPointer {
        BlockPointer {
            id: BlockId::from_payload(&[n]),
            ..BlockPointer::default()
        }
    }

    fn sized_block(size: u32, fill: u8) -> Block {
        let mut block = FileBlock::with_contents(vec![fill; size as usize]);
        block.set_encoded_size(size);
        Block::File(block)
    }

    fn cache(entries: usize, bytes: u64) -> BlockCacheStandard {
        BlockCacheStandard::new(BlockCacheConfig {
            transient_capacity: entries,
            clean_bytes_capacity: bytes,
        })
    }

    const TLF: TlfId = TlfId([1; 16]);

    #[test]
    fn get_missing_is_not_found() {
        let cache = cache(10, 100);
        let err = cache.get(&ptr(1)).expect_err("missing");
        assert!(matches!(err, CafsError::NoSuchBlock { .. }));
    }

    #[test]
    fn entry_capacity_evicts_oldest() {
        let cache = cache(2, 1 << 20);
        for n in 1..=3 {
            cache
                .put(
                    ptr(n),
                    TLF,
                    sized_block(1, n),
                    CacheLifetime::Transient,
                    HashBehavior::SkipCacheHash,
                )
                .expect("put");
        }
        assert!(cache.get(&ptr(1)).is_err());
        assert!(cache.get(&ptr(2)).is_ok());
        assert!(cache.get(&ptr(3)).is_ok());

        cache
            .put(
                ptr(4),
                TLF,
                sized_block(1, 4),
                CacheLifetime::Permanent,
                HashBehavior::SkipCacheHash,
            )
            .expect("permanent");
        assert!(cache.get(&ptr(2)).is_ok());
        assert!(cache.get(&ptr(3)).is_ok());
        assert_eq!(
            cache.get_with_lifetime(&ptr(4)).expect("perm").1,
            CacheLifetime::Permanent
        );
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = cache(2, 1 << 20);
        for n in 1..=2 {
            cache
                .put(ptr(n), TLF, sized_block(1, n), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
                .expect("put");
        }
        let _ = cache.get(&ptr(1)).expect("hit");
        cache
            .put(ptr(3), TLF, sized_block(1, 3), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
            .expect("put");
        assert!(cache.get(&ptr(1)).is_ok());
        assert!(cache.get(&ptr(2)).is_err());
    }

    #[test]
    fn byte_capacity_exhaustion() {
        let cache = cache(100, 5);
        for n in 1..=7 {
            cache
                .put(ptr(n), TLF, sized_block(1, n), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
                .expect("put");
            assert!(cache.clean_total_bytes() <= 5);
        }
        assert_eq!(cache.num_transient(), 5);
        assert!(cache.get(&ptr(2)).is_err());
        assert!(cache.get(&ptr(3)).is_ok());

        let err = cache
            .put(ptr(8), TLF, sized_block(7, 8), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
            .expect_err("too big");
        assert!(matches!(err, CafsError::CachePutCacheFull { .. }));
        assert_eq!(cache.num_transient(), 0);
        assert_eq!(cache.clean_total_bytes(), 0);

        cache
            .put(ptr(9), TLF, sized_block(10, 9), CacheLifetime::Permanent, HashBehavior::SkipCacheHash)
            .expect("permanent bypasses the size check");
        assert_eq!(cache.clean_total_bytes(), 10);
    }

    #[test]
    fn same_block_in_both_tiers_deletes_independently() {
        let cache = cache(10, 100);
        let p = ptr(1);
        cache
            .put(p, TLF, sized_block(2, 1), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
            .expect("transient");
        cache
            .put(p, TLF, sized_block(2, 1), CacheLifetime::Permanent, HashBehavior::SkipCacheHash)
            .expect("permanent");
        assert_eq!(cache.clean_total_bytes(), 4);

        cache.delete_transient(&p.id, TLF).expect("delete transient");
        assert_eq!(
            cache.get_with_lifetime(&p).expect("still permanent").1,
            CacheLifetime::Permanent
        );
        cache.delete_permanent(&p.id).expect("delete permanent");
        assert!(cache.get(&p).is_err());
        assert_eq!(cache.clean_total_bytes(), 0);
    }

    #[test]
    fn hash_dedup_is_idempotent() {
        let cache = cache(10, 1000);
        let p = ptr(1);
        let contents = FileBlock::with_contents(vec![4, 5, 6]);
        cache
            .put(p, TLF, Block::File(contents.clone()), CacheLifetime::Transient, HashBehavior::DoCacheHash)
            .expect("put");
        let before = cache.clean_total_bytes();
        assert_eq!(cache.check_for_known_ptr(TLF, &contents).expect("known"), p);

        cache
            .put(p, TLF, Block::File(contents.clone()), CacheLifetime::Transient, HashBehavior::DoCacheHash)
            .expect("re-put");
        assert_eq!(cache.clean_total_bytes(), before);
        assert_eq!(cache.num_transient(), 1);

        assert_eq!(
            cache
                .check_for_known_ptr(TlfId([2; 16]), &contents)
                .expect("other tlf"),
            BlockPointer::ZERO
        );
        cache.delete_known_ptr(TLF, &contents).expect("forget");
        assert_eq!(
            cache.check_for_known_ptr(TLF, &contents).expect("forgotten"),
            BlockPointer::ZERO
        );
    }

    #[test]
    fn eviction_drops_hash_index() {
        let cache = cache(1, 1000);
        let first = FileBlock::with_contents(vec![1]);
        cache
            .put(ptr(1), TLF, Block::File(first.clone()), CacheLifetime::Transient, HashBehavior::DoCacheHash)
            .expect("put");
        cache
            .put(ptr(2), TLF, sized_block(1, 2), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
            .expect("put");
        assert_eq!(
            cache.check_for_known_ptr(TLF, &first).expect("check"),
            BlockPointer::ZERO
        );
    }

    #[test]
    fn indirect_blocks_are_not_hashed() {
        let cache = cache(10, 1000);
        let ind = FileBlock::new_empty(true);
        assert!(matches!(
            cache.check_for_known_ptr(TLF, &ind),
            Err(CafsError::NotDirectFileBlock)
        ));
    }

    #[test]
    fn shrinking_capacity_evicts() {
        let cache = cache(10, 100);
        for n in 1..=4 {
            cache
                .put(ptr(n), TLF, sized_block(10, n), CacheLifetime::Transient, HashBehavior::SkipCacheHash)
                .expect("put");
        }
        cache.set_clean_bytes_capacity(25);
        assert_eq!(cache.clean_bytes_capacity(), 25);
        assert_eq!(cache.num_transient(), 2);
        assert!(cache.get(&ptr(4)).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn transient_puts_never_exceed_budget(
            sizes in proptest::collection::vec(1_u32..40, 1..60),
            capacity in 10_u64..100,
        ) {
            let cache = cache(8, capacity);
            for (n, size) in sizes.iter().enumerate() {
                let id = u8::try_from(n).expect("fits");
                let res = cache.put(
                    ptr(id),
                    TLF,
                    sized_block(*size, id),
                    CacheLifetime::Transient,
                    HashBehavior::SkipCacheHash,
                );
                if u64::from(*size) > capacity {
                    prop_assert!(res.is_err());
                } else {
                    prop_assert!(res.is_ok());
                    prop_assert!(cache.get(&ptr(id)).is_ok());
                }
                prop_assert!(cache.clean_total_bytes() <= capacity);
                prop_assert!(cache.num_transient() <= 8);
            }
        }
    }
}
