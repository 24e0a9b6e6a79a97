//! Internal collection primitives.
//!
//! The linked list backs the response cache's LRU ordering; the ring queue
//! stages coalesced filesystem-watcher batches. Both own their storage and
//! hand out only opaque handles, never raw links.

mod list;
mod queue;

pub use list::{LinkedList, NodeId};
pub use queue::RingQueue;
