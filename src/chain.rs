// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Process chains: a buffer set handed from one device queue to the next
//! without the client in between.
//!
//! Chains live in a [`ChainAllocator`] arena shared by every queue that can
//! take part in a chain. The arena storage is created when the first queue
//! attaches and dropped when the last queue detaches.

use crate::{
    buffer::BufferSet,
    error::{FastpathError, Result},
    queue::BufferSetQueue,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};
use tracing::{debug, error};

/// Maximum number of links in one chain.
pub const MAX_CHAIN_LINKS: usize = 8;

/// Default number of chains in flight per allocator.
pub const DEFAULT_CHAIN_CAPACITY: usize = 64;

/// One link: the buffer set to submit and the queue that receives it.
#[derive(Clone)]
pub struct ChainLink {
    pub target: Weak<BufferSetQueue>,
    pub set: BufferSet,
}

impl ChainLink {
    pub fn new(target: &Arc<BufferSetQueue>, set: BufferSet) -> Self {
        ChainLink {
            target: Arc::downgrade(target),
            set,
        }
    }
}

pub struct ProcessChain {
    links: Vec<ChainLink>,
    cursor: AtomicUsize,
    origin_timestamp: u64,
}

impl ProcessChain {
    pub fn new(links: Vec<ChainLink>) -> Result<Self> {
        if links.is_empty() || links.len() > MAX_CHAIN_LINKS {
            return Err(FastpathError::invalid(format!(
                "chain length {} outside 1..={}",
                links.len(),
                MAX_CHAIN_LINKS
            )));
        }
        Ok(ProcessChain {
            links,
            cursor: AtomicUsize::new(0),
            origin_timestamp: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Index of the link currently in flight.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn first(&self) -> &ChainLink {
        &self.links[0]
    }

    /// Claims the link after the current one. Only one caller can claim a
    /// given link.
    fn claim_next(&self) -> Option<usize> {
        let current = self.cursor.load(Ordering::Acquire);
        let next = current + 1;
        if next >= self.links.len() {
            return None;
        }
        self.cursor
            .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| next)
    }
}

/// Handle to a chain stored in a [`ChainAllocator`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainId(usize);

/// Next hop of a chain after a successful completion.
pub(crate) struct Handoff {
    pub queue: Arc<BufferSetQueue>,
    pub set: BufferSet,
    /// Chain to attach to the next slot, `None` once the last link has been
    /// dispatched.
    pub chain: Option<ChainId>,
}

#[derive(Default)]
struct Arena {
    users: usize,
    slots: Vec<Option<ProcessChain>>,
}

/// Reference-counted arena for process chains.
pub struct ChainAllocator {
    capacity: usize,
    arena: Mutex<Arena>,
}

impl Default for ChainAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_CHAIN_CAPACITY)
    }
}

impl ChainAllocator {
    pub fn new(capacity: usize) -> Self {
        ChainAllocator {
            capacity: capacity.max(1),
            arena: Mutex::new(Arena::default()),
        }
    }

    fn arena(&self) -> std::sync::MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Registers one more user, creating the arena storage on first use.
    pub fn attach(&self) {
        let mut arena = self.arena();
        if arena.users == 0 {
            arena.slots = (0..self.capacity).map(|_| None).collect();
            debug!("chain arena created with {} slots", self.capacity);
        }
        arena.users += 1;
    }

    /// Drops one user, destroying the arena storage with the last one.
    pub fn detach(&self) {
        let mut arena = self.arena();
        match arena.users {
            0 => error!("chain arena detached more often than attached"),
            1 => {
                arena.users = 0;
                let live = arena.slots.iter().filter(|s| s.is_some()).count();
                if live > 0 {
                    debug!("chain arena destroyed with {live} live chains");
                }
                arena.slots = Vec::new();
            }
            _ => arena.users -= 1,
        }
    }

    pub fn users(&self) -> usize {
        self.arena().users
    }

    /// True while at least one queue keeps the arena alive.
    pub fn is_allocated(&self) -> bool {
        !self.arena().slots.is_empty()
    }

    /// Number of chains currently stored.
    pub fn live(&self) -> usize {
        self.arena().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn alloc(&self, chain: ProcessChain) -> Result<ChainId> {
        let mut arena = self.arena();
        if arena.users == 0 {
            return Err(FastpathError::invalid("chain arena has no users"));
        }
        let index = arena
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FastpathError::Busy)?;
        arena.slots[index] = Some(chain);
        Ok(ChainId(index))
    }

    pub fn release(&self, id: ChainId) {
        let mut arena = self.arena();
        match arena.slots.get_mut(id.0) {
            Some(slot @ Some(_)) => *slot = None,
            _ => debug!("chain {:?} already released", id),
        }
    }

    /// Advances the chain past a successfully completed link.
    ///
    /// Returns `None` when the completed link was the last one. The chain is
    /// freed as soon as its last link is dispatched.
    pub(crate) fn advance(&self, id: ChainId, completed: &BufferSet) -> Result<Option<Handoff>> {
        let mut arena = self.arena();
        let Some(Some(chain)) = arena.slots.get_mut(id.0) else {
            return Err(FastpathError::NotFound(completed.request_id));
        };

        if chain.origin_timestamp == 0 {
            chain.origin_timestamp = completed.timestamp;
        }

        let Some(next) = chain.claim_next() else {
            arena.slots[id.0] = None;
            return Ok(None);
        };

        let link = &chain.links[next];
        let mut set = link.set;
        set.request_id = completed.request_id;
        if set.timestamp == 0 {
            set.timestamp = chain.origin_timestamp;
        }
        let target = link.target.upgrade();
        let last = next + 1 == chain.links.len();

        let Some(queue) = target else {
            arena.slots[id.0] = None;
            return Err(FastpathError::NotFound(completed.request_id));
        };

        let chain = if last {
            arena.slots[id.0] = None;
            None
        } else {
            Some(id)
        };

        debug!(
            "chain {:?} link {} -> {} req {}",
            id,
            next,
            queue.name(),
            set.request_id
        );
        Ok(Some(Handoff { queue, set, chain }))
    }
}
