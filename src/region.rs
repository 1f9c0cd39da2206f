use crate::addr::{self, Addr};
use crate::errors::{AllocError, StmError};
use crate::transaction::Transaction;
use crate::vlock::VersionedLock;
use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Capacity of the segment directory. Segment ids are handed out once and
/// never reused, so this also caps the number of allocations over the
/// region's lifetime.
const MAX_SEGMENTS: usize = 512;

/// A shared word: payload plus its versioned lock.
///
/// Only the low `align` bytes of the payload are meaningful. The payload
/// is authoritative only while the lock is unlocked; commit rewrites it
/// with the lock held.
pub(crate) struct Word {
    pub(crate) lock: VersionedLock,
    payload: AtomicU64,
}

impl Word {
    fn new() -> Self {
        Self {
            lock: VersionedLock::new(),
            payload: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn payload(&self) -> u64 {
        self.payload.load(Ordering::Acquire)
    }

    /// Callers hold the word's lock; the `unlock_with` that follows is a
    /// release store, which publishes this payload to the next sampler.
    #[inline]
    fn set_payload(&self, value: u64) {
        self.payload.store(value, Ordering::Relaxed);
    }
}

/// A contiguous run of words sharing one segment id.
struct Segment {
    size: usize,
    words: Box<[Word]>,
}

impl Segment {
    fn new(size: usize, align: usize) -> Self {
        let words = (0..size / align).map(|_| Word::new()).collect();
        Self { size, words }
    }
}

/// A shared memory region: the segment directory, the global version
/// clock, and the commit machinery that operates on them.
///
/// Dropping the region releases every segment. Live transactions borrow
/// the region, so the borrow checker enforces the "no running transaction
/// at destroy" precondition.
pub struct Region {
    align: usize,
    segments: Box<[OnceCell<Segment>]>,
    /// Global version clock. Every commit bumps it; padded so it does not
    /// share a cache line with the directory.
    gvc: CachePadded<AtomicU64>,
    /// Next segment id. Starts at 2; id 1 is the initial segment.
    next_segment: AtomicU32,
}

impl Region {
    /// Create a region with one initial segment of `size` bytes.
    ///
    /// `align` must be a power of two in `1..=8` and divide `size`; `size`
    /// must be nonzero and fit the 32-bit offset field of an address.
    pub fn new(size: usize, align: usize) -> Result<Self, StmError> {
        if !align.is_power_of_two()
            || align > 8
            || size == 0
            || size % align != 0
            || size > u32::MAX as usize
        {
            return Err(StmError::CreateFailed);
        }

        let segments: Box<[OnceCell<Segment>]> =
            (0..MAX_SEGMENTS).map(|_| OnceCell::new()).collect();
        let _ = segments[1].set(Segment::new(size, align));

        debug!(size, align, "region created");
        Ok(Self {
            align,
            segments,
            gvc: CachePadded::new(AtomicU64::new(0)),
            next_segment: AtomicU32::new(2),
        })
    }

    /// Address of the first word of the initial segment.
    pub fn start(&self) -> Addr {
        addr::START
    }

    /// Byte size of the initial segment.
    pub fn size(&self) -> usize {
        // Segment 1 is published in `new` and never removed.
        self.segments[1].get().expect("initial segment").size
    }

    /// Word size in bytes. Access sizes and addresses must be multiples
    /// of this.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Start a transaction. Never fails; conflicts surface at
    /// [`Transaction::read`] and [`Transaction::commit`].
    pub fn begin(&self, ro: bool) -> Transaction<'_> {
        Transaction::new(self, ro, self.gvc.load(Ordering::Acquire))
    }

    /// Run `f` inside read-write transactions until one commits, yielding
    /// between attempts.
    ///
    /// Aborts raised by `f` or by the commit are retried with a fresh
    /// transaction. Keep I/O out of `f`: attempts can run many times.
    ///
    /// # Example
    ///
    /// ```
    /// use petek::Region;
    ///
    /// let region = Region::new(64, 8).unwrap();
    /// let slot = region.start();
    ///
    /// region.atomically(|tx| {
    ///     let v = tx.read_word(slot)?;
    ///     tx.write_word(v + 1, slot)
    /// });
    /// ```
    pub fn atomically<F, T>(&self, mut f: F) -> T
    where
        F: FnMut(&mut Transaction<'_>) -> Result<T, StmError>,
    {
        loop {
            let mut tx = self.begin(false);
            match f(&mut tx) {
                Ok(value) => {
                    if tx.commit().is_ok() {
                        return value;
                    }
                }
                Err(err) => {
                    debug_assert!(err.is_transient());
                    trace!(%err, "transaction aborted, retrying");
                }
            }
            std::thread::yield_now();
        }
    }

    /// Constant-time word lookup.
    ///
    /// Panics when `addr` does not refer to a live segment; callers only
    /// pass addresses derived from [`Region::start`] or
    /// [`Transaction::alloc`].
    #[inline]
    pub(crate) fn word(&self, addr: Addr) -> &Word {
        let segment = self.segments[addr::segment_id(addr)]
            .get()
            .expect("address outside any live segment");
        &segment.words[addr::byte_offset(addr) / self.align]
    }

    /// Reserve a fresh segment id and publish a zeroed segment under it.
    pub(crate) fn alloc(&self, size: usize) -> Result<Addr, AllocError> {
        let id = self.next_segment.fetch_add(1, Ordering::Relaxed);
        if id as usize >= MAX_SEGMENTS {
            return Err(AllocError::NoMemory);
        }
        // The id is unique, so the slot is necessarily empty.
        let _ = self.segments[id as usize].set(Segment::new(size, self.align));
        trace!(id, size, "segment allocated");
        Ok(addr::segment_base(id))
    }

    /// Draw a fresh, unique write-version from the clock.
    #[inline]
    pub(crate) fn next_write_version(&self) -> u64 {
        self.gvc.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Lock every write-set word in ascending address order.
    ///
    /// On the first failure the acquired prefix is released in reverse
    /// order, versions unchanged, and the conflicting address is returned.
    pub(crate) fn lock_write_set(
        &self,
        write_set: &BTreeMap<Addr, u64>,
        rv: u64,
    ) -> Result<(), Addr> {
        let mut acquired = 0;
        for (&addr, _) in write_set {
            if !self.word(addr).lock.try_lock(rv) {
                for (&locked, _) in write_set.iter().take(acquired).rev() {
                    self.word(locked).lock.unlock();
                }
                return Err(addr);
            }
            acquired += 1;
        }
        Ok(())
    }

    /// Release every write-set lock, versions unchanged.
    pub(crate) fn unlock_write_set(&self, write_set: &BTreeMap<Addr, u64>) {
        for (&addr, _) in write_set {
            self.word(addr).lock.unlock();
        }
    }

    /// Check that no read-set word is locked or newer than `rv`. Returns
    /// the first offending address.
    pub(crate) fn validate_read_set(
        &self,
        read_set: impl Iterator<Item = Addr>,
        rv: u64,
    ) -> Result<(), Addr> {
        for addr in read_set {
            let sample = self.word(addr).lock.sample();
            if sample.locked || sample.version > rv {
                return Err(addr);
            }
        }
        Ok(())
    }

    /// Publish every staged payload and release its lock at version `wv`.
    pub(crate) fn commit_write_set(&self, write_set: &BTreeMap<Addr, u64>, wv: u64) {
        for (&addr, &staged) in write_set {
            let word = self.word(addr);
            word.set_payload(staged);
            word.lock.unlock_with(wv);
        }
    }
}
