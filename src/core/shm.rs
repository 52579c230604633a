//! Shared memory arena backing objects and vectors for one session.
//!
//! An arena is a named, growable chain of memory segments attachable by
//! cooperating processes on one host. Allocation metadata lives inside each
//! segment behind a process-shared lock, so any attached process can
//! allocate and release blocks; per-block reference counts are atomics
//! placed inside the segment so the hot increment/decrement path takes no
//! lock at all.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::util::{self, BackoffPolicy};
use crate::{Error, Result};

/// Size of the per-block header preceding every allocation's payload.
const BLOCK_HEADER_SIZE: usize = 24;
/// Allocation granularity; keeps payloads 8-byte aligned.
const ALIGN: usize = 8;
/// Size of the allocation ledger at the front of every segment.
const SEGMENT_HEADER_SIZE: usize = 32;
/// Free-list terminator.
const NIL: u64 = u64::MAX;
/// Remainders smaller than this are granted with the block instead of
/// becoming a free span; a span must at least hold a [`FreeSpan`] node.
const MIN_SPAN: usize = 32;

/// Header stored in shared memory in front of every block payload.
#[repr(C)]
pub struct BlockHeader {
    refcount: AtomicU32,
    /// Full block size including header and alignment padding.
    total: u32,
    size: AtomicU64,
    capacity: u64,
}

/// Allocation ledger at the front of every segment, shared by all attached
/// processes. The free list and the counters are guarded by `lock`; block
/// refcounts are not, they are atomics of their own.
#[repr(C)]
struct SegmentHeader {
    lock: AtomicU32,
    _reserved: u32,
    /// Offset of the first free span, or [`NIL`].
    free_head: AtomicU64,
    /// Bytes currently allocated out of this segment.
    used: AtomicU64,
    /// Blocks currently allocated out of this segment.
    live: AtomicU64,
}

/// Intrusive free-list node living in the free storage it describes.
#[repr(C)]
struct FreeSpan {
    size: AtomicU64,
    next: AtomicU64,
}

/// Location of a block inside an arena. Stable across processes attached to
/// the same arena, which is what makes zero-copy handle transfer possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub segment: u32,
    pub offset: u64,
}

/// How an arena's segments are backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackingKind {
    /// OS shared memory, attachable by other processes of the session.
    Shared,
    /// Process-private heap; used for rank-isolated arenas and tests.
    Private,
}

/// Arena identity and sizing.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub session: String,
    pub module_id: i32,
    pub rank: i32,
    pub per_rank: bool,
    pub segment_size: usize,
    pub persistent: bool,
    pub backing: BackingKind,
}

impl ArenaConfig {
    pub fn new(session: &str, module_id: i32, rank: i32, per_rank: bool) -> Self {
        Self {
            session: session.to_string(),
            module_id,
            rank,
            per_rank,
            segment_size: util::SystemConfig::default().arena_segment_size,
            persistent: false,
            backing: BackingKind::Shared,
        }
    }

    /// A private arena for unit tests and single-process runs.
    pub fn private(session: &str, segment_size: usize) -> Self {
        Self {
            session: session.to_string(),
            module_id: 0,
            rank: 0,
            per_rank: false,
            segment_size,
            persistent: false,
            backing: BackingKind::Private,
        }
    }

    pub fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    fn arena_name(&self) -> String {
        if self.per_rank {
            format!("{}_{}_r{}", self.session, self.module_id, self.rank)
        } else {
            self.session.clone()
        }
    }
}

enum SegmentBacking {
    Shared(Shmem),
    Private(#[allow(dead_code)] Box<[u8]>),
}

struct Segment {
    ptr: *mut u8,
    len: usize,
    _backing: SegmentBacking,
}

// Segment pointers are only dereferenced through the allocator lock or
// through atomic block headers; the mapping itself is immutable once built.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn from_shmem(shmem: Shmem) -> Self {
        let ptr = shmem.as_ptr();
        let len = shmem.len();
        Self {
            ptr,
            len,
            _backing: SegmentBacking::Shared(shmem),
        }
    }

    fn shared_create(path: &PathBuf, len: usize, keep_on_drop: bool) -> Result<Self> {
        let conf = ShmemConf::new().size(len).flink(path);
        let mut shmem = conf.create().map_err(|e| match e {
            ShmemError::LinkExists => {
                Error::Allocation(format!("arena segment {} already exists", path.display()))
            }
            other => Error::Allocation(format!(
                "failed to create segment {}: {}",
                path.display(),
                other
            )),
        })?;
        if keep_on_drop {
            shmem.set_owner(false);
        }
        Ok(Self::from_shmem(shmem))
    }

    fn shared_open(path: &PathBuf) -> Result<Self> {
        let shmem = ShmemConf::new().flink(path).open().map_err(|e| {
            Error::Allocation(format!("failed to attach segment {}: {}", path.display(), e))
        })?;
        Ok(Self::from_shmem(shmem))
    }

    /// Create a segment, or map it when another process of the session
    /// created it first. Returns whether this call did the creating.
    fn shared_or_open(path: &PathBuf, len: usize, keep_on_drop: bool) -> Result<(Self, bool)> {
        let conf = ShmemConf::new().size(len).flink(path);
        match conf.create() {
            Ok(mut shmem) => {
                if keep_on_drop {
                    shmem.set_owner(false);
                }
                Ok((Self::from_shmem(shmem), true))
            }
            Err(ShmemError::LinkExists) => Ok((Self::shared_open(path)?, false)),
            Err(e) => Err(Error::Allocation(format!(
                "failed to create segment {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn private(len: usize) -> Self {
        let mut buf = vec![0u8; len].into_boxed_slice();
        let ptr = buf.as_mut_ptr();
        Self {
            ptr,
            len,
            _backing: SegmentBacking::Private(buf),
        }
    }

    fn header(&self) -> &SegmentHeader {
        debug_assert!(self.len >= SEGMENT_HEADER_SIZE);
        unsafe { &*(self.ptr as *const SegmentHeader) }
    }

    fn span(&self, offset: u64) -> &FreeSpan {
        debug_assert!((offset as usize) + std::mem::size_of::<FreeSpan>() <= self.len);
        unsafe { &*(self.ptr.add(offset as usize) as *const FreeSpan) }
    }

    /// Write a fresh ledger: one free span covering the whole usable area.
    /// Only the creating process may call this.
    fn init_ledger(&self) {
        let header = self.header();
        header.lock.store(0, Ordering::Relaxed);
        header.used.store(0, Ordering::Relaxed);
        header.live.store(0, Ordering::Relaxed);
        if self.len >= SEGMENT_HEADER_SIZE + MIN_SPAN {
            let span = self.span(SEGMENT_HEADER_SIZE as u64);
            span.size
                .store((self.len - SEGMENT_HEADER_SIZE) as u64, Ordering::Relaxed);
            span.next.store(NIL, Ordering::Relaxed);
            header
                .free_head
                .store(SEGMENT_HEADER_SIZE as u64, Ordering::Release);
        } else {
            header.free_head.store(NIL, Ordering::Release);
        }
    }

    fn lock_ledger(&self) {
        let lock = &self.header().lock;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn unlock_ledger(&self) {
        self.header().lock.store(0, Ordering::Release);
    }

    /// First-fit over the in-segment free list. Returns (offset, granted);
    /// `granted >= size` when taking a whole span avoids an unusable stub.
    fn allocate(&self, size: usize) -> Option<(usize, usize)> {
        self.lock_ledger();
        let header = self.header();
        let mut prev: Option<u64> = None;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        let mut found = None;
        while cur != NIL {
            let span = self.span(cur);
            let span_size = span.size.load(Ordering::Relaxed) as usize;
            let next = span.next.load(Ordering::Relaxed);
            if span_size >= size {
                let (granted, replacement) = if span_size - size >= MIN_SPAN {
                    let rem_off = cur + size as u64;
                    let rem = self.span(rem_off);
                    rem.size.store((span_size - size) as u64, Ordering::Relaxed);
                    rem.next.store(next, Ordering::Relaxed);
                    (size, rem_off)
                } else {
                    (span_size, next)
                };
                match prev {
                    Some(p) => self.span(p).next.store(replacement, Ordering::Relaxed),
                    None => header.free_head.store(replacement, Ordering::Relaxed),
                }
                header.used.fetch_add(granted as u64, Ordering::Relaxed);
                header.live.fetch_add(1, Ordering::Relaxed);
                found = Some((cur as usize, granted));
                break;
            }
            prev = Some(cur);
            cur = next;
        }
        self.unlock_ledger();
        found
    }

    /// Return a block to the free list, merging with adjacent spans. Any
    /// attached process may free; the ledger lives in the segment itself.
    fn free(&self, offset: usize, size: usize) {
        self.lock_ledger();
        let header = self.header();
        let mut prev: Option<u64> = None;
        let mut cur = header.free_head.load(Ordering::Relaxed);
        while cur != NIL && cur < offset as u64 {
            prev = Some(cur);
            cur = self.span(cur).next.load(Ordering::Relaxed);
        }

        let new_off = offset as u64;
        let mut new_size = size as u64;
        if cur != NIL && new_off + new_size == cur {
            let following = self.span(cur);
            new_size += following.size.load(Ordering::Relaxed);
            cur = following.next.load(Ordering::Relaxed);
        }
        match prev {
            Some(p) if p + self.span(p).size.load(Ordering::Relaxed) == new_off => {
                let preceding = self.span(p);
                preceding
                    .size
                    .store(preceding.size.load(Ordering::Relaxed) + new_size, Ordering::Relaxed);
                preceding.next.store(cur, Ordering::Relaxed);
            }
            Some(p) => {
                let span = self.span(new_off);
                span.size.store(new_size, Ordering::Relaxed);
                span.next.store(cur, Ordering::Relaxed);
                self.span(p).next.store(new_off, Ordering::Relaxed);
            }
            None => {
                let span = self.span(new_off);
                span.size.store(new_size, Ordering::Relaxed);
                span.next.store(cur, Ordering::Relaxed);
                header.free_head.store(new_off, Ordering::Relaxed);
            }
        }

        let prev_used = header.used.fetch_sub(size as u64, Ordering::Relaxed);
        debug_assert!(prev_used >= size as u64, "free of unallocated span");
        header.live.fetch_sub(1, Ordering::Relaxed);
        self.unlock_ledger();
    }
}

/// Arena usage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaStats {
    pub total_size: usize,
    pub used_size: usize,
    pub free_size: usize,
    pub live_blocks: usize,
}

struct ArenaInner {
    name: String,
    config: ArenaConfig,
    owner: bool,
    segments: RwLock<Vec<Segment>>,
}

/// Handle to a session arena. Cloning is cheap; the arena detaches when the
/// last in-process handle drops.
#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

impl Arena {
    /// Map a fresh arena. Fails if a segment of the same name already exists.
    pub fn create(config: ArenaConfig) -> Result<Self> {
        let name = config.arena_name();
        let segment = match config.backing {
            BackingKind::Shared => Segment::shared_create(
                &Self::segment_path(&name, 0),
                config.segment_size,
                config.persistent,
            )?,
            BackingKind::Private => Segment::private(config.segment_size),
        };
        segment.init_ledger();
        if config.backing == BackingKind::Shared {
            util::register_session(&config.session)?;
        }

        tracing::debug!("created arena {} ({} bytes)", name, segment.len);
        Ok(Self {
            inner: Arc::new(ArenaInner {
                name,
                config,
                owner: true,
                segments: RwLock::new(vec![segment]),
            }),
        })
    }

    /// Attach to an arena created by another process of the session.
    ///
    /// The creator may still be initializing, so a missing segment is retried
    /// with bounded backoff before giving up.
    pub fn attach(config: ArenaConfig, policy: &BackoffPolicy) -> Result<Self> {
        let name = config.arena_name();
        let path = Self::segment_path(&name, 0);

        let mut last_err = None;
        let attempt = || Segment::shared_open(&path);
        let mut segment = None;
        match attempt() {
            Ok(s) => segment = Some(s),
            Err(e) => last_err = Some(e),
        }
        if segment.is_none() {
            for delay in policy.delays() {
                std::thread::sleep(delay);
                match attempt() {
                    Ok(s) => {
                        segment = Some(s);
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
        }
        let segment = segment.ok_or_else(|| {
            last_err.unwrap_or_else(|| Error::Allocation(format!("arena {} not found", name)))
        })?;

        // The ledger in the segment is already live; allocation and release
        // from this process go through it like from the creator.
        tracing::debug!("attached arena {}", name);
        Ok(Self {
            inner: Arc::new(ArenaInner {
                name,
                config,
                owner: false,
                segments: RwLock::new(vec![segment]),
            }),
        })
    }

    fn segment_path(name: &str, index: u32) -> PathBuf {
        if index == 0 {
            std::env::temp_dir().join(format!("parvis_{}", name))
        } else {
            std::env::temp_dir().join(format!("parvis_{}.{}", name, index))
        }
    }

    /// Carve a block with room for `payload_bytes`, growing the segment chain
    /// if the current segments are exhausted.
    pub fn allocate(&self, payload_bytes: usize) -> Result<BlockRef> {
        let total = BLOCK_HEADER_SIZE + payload_bytes;
        let total = (total + ALIGN - 1) & !(ALIGN - 1);

        let (seg, offset, granted) = match self.try_allocate(total) {
            Some(found) => found,
            None => {
                self.grow(total)?;
                self.try_allocate(total).ok_or_else(|| {
                    Error::Allocation(format!(
                        "arena {}: out of memory for {} bytes",
                        self.inner.name, total
                    ))
                })?
            }
        };

        let block = BlockRef {
            segment: seg as u32,
            offset: offset as u64,
        };
        unsafe {
            let header = self.header_ptr(block);
            (*header).refcount = AtomicU32::new(1);
            (*header).total = granted as u32;
            (*header).size = AtomicU64::new(0);
            (*header).capacity = payload_bytes as u64;
        }
        Ok(block)
    }

    fn try_allocate(&self, total: usize) -> Option<(usize, usize, usize)> {
        let segments = self.inner.segments.read();
        for (seg, segment) in segments.iter().enumerate() {
            if let Some((offset, granted)) = segment.allocate(total) {
                return Some((seg, offset, granted));
            }
        }
        None
    }

    /// Append a segment at least `need` bytes large, doubling the chain's
    /// last segment size. Concurrent growth by another attached process is
    /// resolved by mapping the segment it created instead.
    fn grow(&self, need: usize) -> Result<()> {
        let mut segments = self.inner.segments.write();
        let last_len = segments.last().map(|s| s.len).unwrap_or(0);
        let new_len = (last_len * 2)
            .max(need + SEGMENT_HEADER_SIZE)
            .max(self.inner.config.segment_size);
        let index = segments.len() as u32;

        let segment = match self.inner.config.backing {
            BackingKind::Shared => {
                let (segment, created) = Segment::shared_or_open(
                    &Self::segment_path(&self.inner.name, index),
                    new_len,
                    self.inner.config.persistent,
                )?;
                if created {
                    segment.init_ledger();
                }
                segment
            }
            BackingKind::Private => {
                let segment = Segment::private(new_len);
                segment.init_ledger();
                segment
            }
        };
        tracing::debug!(
            "arena {}: grew by segment {} ({} bytes)",
            self.inner.name,
            index,
            segment.len
        );
        segments.push(segment);
        Ok(())
    }

    /// Map a segment created by another process after this one attached.
    /// Required before resolving a handle that points into it.
    pub fn ensure_segment(&self, index: u32) -> Result<()> {
        {
            let segments = self.inner.segments.read();
            if (index as usize) < segments.len() {
                return Ok(());
            }
        }
        if self.inner.config.backing == BackingKind::Private {
            return Err(Error::Allocation(format!(
                "arena {}: segment {} does not exist",
                self.inner.name, index
            )));
        }
        let mut segments = self.inner.segments.write();
        while (segments.len() as u32) <= index {
            let next = segments.len() as u32;
            let segment = Segment::shared_open(&Self::segment_path(&self.inner.name, next))?;
            segments.push(segment);
        }
        Ok(())
    }

    fn header_ptr(&self, block: BlockRef) -> *mut BlockHeader {
        let segments = self.inner.segments.read();
        let segment = &segments[block.segment as usize];
        debug_assert!((block.offset as usize) + BLOCK_HEADER_SIZE <= segment.len);
        unsafe { segment.ptr.add(block.offset as usize) as *mut BlockHeader }
    }

    /// Base pointer of a block's payload.
    pub(crate) fn payload_ptr(&self, block: BlockRef) -> *mut u8 {
        let segments = self.inner.segments.read();
        let segment = &segments[block.segment as usize];
        unsafe { segment.ptr.add(block.offset as usize + BLOCK_HEADER_SIZE) }
    }

    pub(crate) fn block_capacity(&self, block: BlockRef) -> usize {
        unsafe { (*self.header_ptr(block)).capacity as usize }
    }

    pub(crate) fn block_size(&self, block: BlockRef) -> usize {
        unsafe { (*self.header_ptr(block)).size.load(Ordering::Acquire) as usize }
    }

    pub(crate) fn set_block_size(&self, block: BlockRef, size: usize) {
        unsafe { (*self.header_ptr(block)).size.store(size as u64, Ordering::Release) }
    }

    /// Increment a block's shared reference count.
    pub(crate) fn ref_inc(&self, block: BlockRef) {
        unsafe {
            (*self.header_ptr(block)).refcount.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn refcount(&self, block: BlockRef) -> u32 {
        unsafe { (*self.header_ptr(block)).refcount.load(Ordering::Acquire) }
    }

    /// Decrement a block's reference count, reclaiming storage at zero.
    pub(crate) fn ref_dec(&self, block: BlockRef) {
        let prev = unsafe {
            (*self.header_ptr(block)).refcount.fetch_sub(1, Ordering::AcqRel)
        };
        debug_assert!(prev > 0, "refcount underflow");
        if prev == 1 {
            self.free_block(block);
        }
    }

    fn free_block(&self, block: BlockRef) {
        let total = unsafe { (*self.header_ptr(block)).total as usize };
        let segments = self.inner.segments.read();
        segments[block.segment as usize].free(block.offset as usize, total);
    }

    pub fn stats(&self) -> ArenaStats {
        let segments = self.inner.segments.read();
        let total: usize = segments.iter().map(|s| s.len).sum();
        let used: usize = segments
            .iter()
            .map(|s| s.header().used.load(Ordering::Relaxed) as usize)
            .sum();
        let live: usize = segments
            .iter()
            .map(|s| s.header().live.load(Ordering::Relaxed) as usize)
            .sum();
        ArenaStats {
            total_size: total,
            used_size: used,
            free_size: total.saturating_sub(used),
            live_blocks: live,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn session(&self) -> &str {
        &self.inner.config.session
    }

    /// Live allocated blocks across all attached processes; instrumentation
    /// for leak tests.
    pub fn live_blocks(&self) -> usize {
        self.inner
            .segments
            .read()
            .iter()
            .map(|s| s.header().live.load(Ordering::Relaxed) as usize)
            .sum()
    }

    /// Administrative recovery: delete the OS objects of one named arena.
    pub fn remove(session: &str) -> Result<()> {
        let mut removed = 0usize;
        let prefix = format!("parvis_{}", session);
        for entry in std::fs::read_dir(std::env::temp_dir())? {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&prefix) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        util::unregister_session(session)?;
        tracing::info!("removed {} segments of session {}", removed, session);
        Ok(())
    }

    /// Administrative recovery: delete every stale arena recorded in the
    /// session registry.
    pub fn clean_all() -> Result<()> {
        for session in util::list_sessions()? {
            Self::remove(&session)?;
        }
        Ok(())
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        if self.owner && !self.config.persistent && self.config.backing == BackingKind::Shared {
            // Shmem unlinks owned mappings on drop; forget nothing here, just
            // clear the session registry entry.
            let _ = util::unregister_session(&self.config.session);
            tracing::debug!("detached and removed arena {}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arena(size: usize) -> Arena {
        Arena::create(ArenaConfig::private("shm_test", size)).unwrap()
    }

    #[test]
    fn allocate_and_free_reclaims_storage() {
        let arena = test_arena(4096);
        let baseline = arena.stats().used_size;

        let block = arena.allocate(100).unwrap();
        assert_eq!(arena.live_blocks(), 1);
        assert_eq!(arena.refcount(block), 1);
        assert!(arena.stats().used_size > baseline);

        arena.ref_dec(block);
        assert_eq!(arena.live_blocks(), 0);
        assert_eq!(arena.stats().used_size, baseline);
    }

    #[test]
    fn refcount_tracks_handles() {
        let arena = test_arena(4096);
        let block = arena.allocate(64).unwrap();
        arena.ref_inc(block);
        arena.ref_inc(block);
        assert_eq!(arena.refcount(block), 3);
        arena.ref_dec(block);
        arena.ref_dec(block);
        assert_eq!(arena.live_blocks(), 1);
        arena.ref_dec(block);
        assert_eq!(arena.live_blocks(), 0);
    }

    #[test]
    fn exhaustion_grows_segment_chain() {
        let arena = test_arena(256);
        // Larger than the first segment; forces a doubled second segment.
        let big = arena.allocate(1024).unwrap();
        assert_eq!(big.segment, 1);
        assert!(arena.stats().total_size >= 256 + 1024);
        arena.ref_dec(big);
    }

    #[test]
    fn freed_blocks_coalesce() {
        let arena = test_arena(4096);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        arena.ref_dec(a);
        arena.ref_dec(b);
        // After coalescing, a block spanning both freed regions must fit.
        let c = arena.allocate(220).unwrap();
        assert_eq!(c.segment, 0);
        arena.ref_dec(c);
    }

    // OS-backed tests share the session registry file; serialize them.
    static OS_ARENA_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    #[test]
    fn attached_process_can_release_the_last_reference() {
        let _guard = OS_ARENA_LOCK.lock();
        let name = format!("xrelease_{}", std::process::id());
        let config = ArenaConfig::new(&name, 0, 0, false).with_segment_size(1 << 16);
        let owner = Arena::create(config.clone()).unwrap();
        let attached = Arena::attach(config, &BackoffPolicy::default()).unwrap();

        let block = owner.allocate(256).unwrap();
        assert_eq!(attached.refcount(block), 1);
        assert_eq!(attached.live_blocks(), 1);

        // The attached side drops the last reference; the storage returns
        // to the ledger both mappings share.
        attached.ref_dec(block);
        assert_eq!(owner.live_blocks(), 0);
        assert_eq!(owner.stats().used_size, 0);

        let again = owner.allocate(256).unwrap();
        assert_eq!(again.segment, 0);
        owner.ref_dec(again);

        drop(attached);
        drop(owner);
        let _ = Arena::remove(&name);
    }

    #[test]
    fn persistent_arena_survives_its_creator() {
        let _guard = OS_ARENA_LOCK.lock();
        let name = format!("persist_{}", std::process::id());
        let config = ArenaConfig::new(&name, 0, 0, false)
            .with_segment_size(1 << 16)
            .with_persistent(true);

        let block = {
            let owner = Arena::create(config.clone()).unwrap();
            owner.allocate(64).unwrap()
        };

        // The mapping outlives the creating handle.
        let attached = Arena::attach(config, &BackoffPolicy::default()).unwrap();
        assert_eq!(attached.refcount(block), 1);
        assert_eq!(attached.live_blocks(), 1);
        attached.ref_dec(block);

        drop(attached);
        Arena::remove(&name).unwrap();
    }
}
