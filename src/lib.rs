//! Word-granular software transactional memory.
//!
//! # Architecture
//!
//! petek implements a TL2-style (Transactional Locking II) protocol with a
//! global version clock over a region of fixed-width words grouped into
//! segments.
//!
//! - **Reads**: Optimistic. No locks are taken; the word's versioned lock is
//!   sampled around the copy to decide whether the word was stable.
//! - **Writes**: Buffered privately. Locks are acquired only during the
//!   commit phase, in address order, and held only long enough to publish.
//! - **Addresses**: Opaque 64-bit handles with the segment id in the high
//!   bits and the byte offset in the low bits, never native pointers.
//!
//! # Example
//!
//! ```
//! use petek::Region;
//!
//! let region = Region::new(64, 8).unwrap();
//! let counter = region.start();
//!
//! region.atomically(|tx| {
//!     let v = tx.read_word(counter)?;
//!     tx.write_word(v + 1, counter)
//! });
//! ```

mod addr;
mod errors;
mod region;
mod transaction;
mod vlock;

pub use addr::{Addr, START};
pub use errors::{AllocError, StmError};
pub use region::Region;
pub use transaction::Transaction;
