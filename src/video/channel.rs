//! Hardware encode channel allocator
//!
//! A small fixed pool of channel ids shared by every direct encoder in the
//! process. Exhaustion is reported immediately, never waited out.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Channels available on the encode hardware
pub const DEFAULT_CHANNEL_COUNT: usize = 6;

/// Identifier of one hardware encode channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chn{}", self.0)
    }
}

/// Fixed-size pool of encode channel ids
pub struct ChannelAllocator {
    in_use: Mutex<Vec<bool>>,
}

impl ChannelAllocator {
    pub fn new(size: usize) -> Self {
        Self {
            in_use: Mutex::new(vec![false; size]),
        }
    }

    /// Process-wide allocator sized for the encode hardware
    pub fn global() -> Arc<ChannelAllocator> {
        static GLOBAL: OnceLock<Arc<ChannelAllocator>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(ChannelAllocator::new(DEFAULT_CHANNEL_COUNT)))
            .clone()
    }

    pub fn capacity(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn available(&self) -> usize {
        self.in_use.lock().iter().filter(|used| !**used).count()
    }

    /// Take the lowest free channel id
    pub fn acquire(&self) -> Option<ChannelId> {
        let mut in_use = self.in_use.lock();
        match in_use.iter().position(|used| !used) {
            Some(index) => {
                in_use[index] = true;
                debug!("Acquired encode channel {}", index);
                Some(ChannelId(index as u32))
            }
            None => {
                warn!("No encode channel available ({} in use)", in_use.len());
                None
            }
        }
    }

    /// Mark a channel free. Unknown or already free ids are logged and ignored.
    pub fn release(&self, id: ChannelId) {
        let mut in_use = self.in_use.lock();
        match in_use.get_mut(id.0 as usize) {
            Some(used) if *used => {
                *used = false;
                debug!("Released encode channel {}", id.0);
            }
            Some(_) => warn!("Encode channel {} released while not in use", id.0),
            None => warn!("Release of unknown encode channel {}", id.0),
        }
    }

    /// Acquire a channel that is released when the lease drops
    pub fn lease(self: &Arc<Self>) -> Option<ChannelLease> {
        self.acquire().map(|id| ChannelLease {
            id,
            allocator: self.clone(),
        })
    }
}

/// A held channel; returned to its allocator on drop
pub struct ChannelLease {
    id: ChannelId,
    allocator: Arc<ChannelAllocator>,
}

impl ChannelLease {
    pub fn id(&self) -> ChannelId {
        self.id
    }
}

impl fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease").field("id", &self.id).finish()
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        self.allocator.release(self.id);
    }
}
