use crate::addr::Addr;
use crate::errors::{AllocError, StmError};
use crate::region::Region;
use foldhash::fast::FixedState;
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

/// A transaction over one region.
///
/// Returned by [`Region::begin`] and threaded through every operation.
/// [`Transaction::commit`] consumes it whatever the outcome; after a
/// failed [`Transaction::read`] the value is dead and must be dropped.
/// Dropping discards the staged writes.
pub struct Transaction<'r> {
    region: &'r Region,
    /// Read-only transactions skip read-set bookkeeping and commit
    /// without locking or validation.
    ro: bool,
    /// Global clock value sampled at begin.
    rv: u64,
    /// Addresses whose committed value this transaction consumed.
    read_set: HashSet<Addr, FixedState>,
    /// Address -> staged payload. Sorted, which fixes the lock order.
    write_set: BTreeMap<Addr, u64>,
}

impl<'r> Transaction<'r> {
    pub(crate) fn new(region: &'r Region, ro: bool, rv: u64) -> Self {
        Self {
            region,
            ro,
            rv,
            read_set: HashSet::default(),
            write_set: BTreeMap::new(),
        }
    }

    /// Transactional read of `dst.len()` bytes starting at `src`.
    ///
    /// `dst.len()` must be a positive multiple of the region's alignment
    /// and `src` aligned to it. On `Err` the transaction is dead and must
    /// be dropped.
    pub fn read(&mut self, src: Addr, dst: &mut [u8]) -> Result<(), StmError> {
        let align = self.region.align();
        debug_assert!(!dst.is_empty() && dst.len() % align == 0);
        debug_assert!(src % align as u64 == 0);

        for (i, chunk) in dst.chunks_exact_mut(align).enumerate() {
            let addr = src + (i * align) as Addr;

            if !self.ro {
                // Read-your-writes: staged payloads win over shared state.
                if let Some(&staged) = self.write_set.get(&addr) {
                    chunk.copy_from_slice(&staged.to_ne_bytes()[..align]);
                    continue;
                }
                self.read_set.insert(addr);
            }

            let value = self.read_shared(addr)?;
            chunk.copy_from_slice(&value.to_ne_bytes()[..align]);
        }

        Ok(())
    }

    /// Guarded copy of one shared word.
    ///
    /// Sample, copy, re-sample: the copy counts only if the lock was free
    /// and the version stable around it, so even a read-only transaction
    /// never observes a half-published commit.
    fn read_shared(&self, addr: Addr) -> Result<u64, StmError> {
        let word = self.region.word(addr);

        let before = word.lock.sample();
        if before.locked || before.version > self.rv {
            trace!(addr, rv = self.rv, "read observed an in-flight or newer word");
            return Err(StmError::ReadConflict { addr });
        }

        let value = word.payload();

        let after = word.lock.sample();
        if after.locked || after.version != before.version {
            trace!(addr, rv = self.rv, "word moved under the read");
            return Err(StmError::ReadConflict { addr });
        }

        Ok(value)
    }

    /// Stage a write of `src` into shared memory starting at `dst`.
    ///
    /// Touches no shared state and never aborts; conflicts surface at
    /// commit. `src.len()` must be a positive multiple of the region's
    /// alignment and `dst` aligned to it.
    pub fn write(&mut self, src: &[u8], dst: Addr) -> Result<(), StmError> {
        let align = self.region.align();
        debug_assert!(!self.ro, "write inside a read-only transaction");
        debug_assert!(!src.is_empty() && src.len() % align == 0);
        debug_assert!(dst % align as u64 == 0);

        for (i, chunk) in src.chunks_exact(align).enumerate() {
            let mut staged = [0u8; 8];
            staged[..align].copy_from_slice(chunk);
            self.write_set
                .insert(dst + (i * align) as Addr, u64::from_ne_bytes(staged));
        }

        Ok(())
    }

    /// Read a single word as an integer.
    pub fn read_word(&mut self, addr: Addr) -> Result<u64, StmError> {
        let align = self.region.align();
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf[..align])?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Stage a single-word write of `value` to `addr`.
    pub fn write_word(&mut self, value: u64, addr: Addr) -> Result<(), StmError> {
        let align = self.region.align();
        let bytes = value.to_ne_bytes();
        self.write(&bytes[..align], addr)
    }

    /// Allocate a fresh zeroed segment of `size` bytes, visible to every
    /// transaction immediately.
    ///
    /// `size` must be a positive multiple of the region's alignment.
    pub fn alloc(&mut self, size: usize) -> Result<Addr, AllocError> {
        debug_assert!(size > 0 && size % self.region.align() == 0);
        debug_assert!(size <= u32::MAX as usize);
        self.region.alloc(size)
    }

    /// Mark a segment free.
    ///
    /// Segments are never reclaimed mid-process and ids are never reused,
    /// so a freed address can never alias a later allocation. No-op.
    pub fn free(&mut self, _addr: Addr) {}

    /// Attempt to commit, consuming the transaction either way.
    ///
    /// 1. Read-only transactions commit immediately.
    /// 2. Lock the write set in address order; contention aborts.
    /// 3. Draw the write-version from the global clock.
    /// 4. `wv == rv + 1` means no committer ran since begin: skip
    ///    validation.
    /// 5. Otherwise validate the read set; on failure release the locks
    ///    with versions unchanged and abort.
    /// 6. Publish the staged payloads, releasing each lock at `wv`.
    pub fn commit(self) -> Result<(), StmError> {
        if self.ro {
            return Ok(());
        }

        let region = self.region;

        if let Err(addr) = region.lock_write_set(&self.write_set, self.rv) {
            trace!(addr, rv = self.rv, "write-set lock conflict");
            return Err(StmError::LockConflict { addr });
        }

        let wv = region.next_write_version();

        if wv != self.rv + 1 {
            if let Err(addr) =
                region.validate_read_set(self.read_set.iter().copied(), self.rv)
            {
                region.unlock_write_set(&self.write_set);
                trace!(addr, rv = self.rv, wv, "read set went stale");
                return Err(StmError::StaleRead { addr });
            }
        }

        region.commit_write_set(&self.write_set, wv);
        Ok(())
    }
}
