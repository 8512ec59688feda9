// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer-set queue.
//!
//! Every slot of a [`BufferSetQueue`] lives in exactly one of four lists:
//!
//! ```text
//! free -> pending -> processing -> done -> free
//!                          \------(chain hand-off)----> free
//! ```
//!
//! Clients enqueue into pending and dequeue from done, the owning device
//! context pulls from pending with [`BufferSetQueue::get_next`] and retires
//! entries with [`BufferSetQueue::complete`]. One lock guards all four lists.

use crate::{
    buffer::{BufferSet, BufferStatus},
    chain::{ChainAllocator, ChainId},
    config::QueueConfig,
    error::{FastpathError, Result},
    memory::MemoryManager,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, Weak},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Device context side of a queue.
pub trait QueueConsumer: Send + Sync {
    /// A set moved to pending. `Again` means the consumer could not make
    /// progress yet and is not reported to the client.
    fn buffer_queued(&self) -> Result<()>;

    /// The queue was flushed.
    fn flush(&self) -> Result<()>;
}

/// Lengths of the four lists.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub free: usize,
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.free + self.pending + self.processing + self.done
    }
}

#[derive(Copy, Clone, Default)]
struct Slot {
    set: BufferSet,
    chain: Option<ChainId>,
}

struct Lists {
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    pending: VecDeque<usize>,
    processing: VecDeque<usize>,
    done: VecDeque<usize>,
    closed: bool,
}

impl Lists {
    fn new(depth: usize) -> Self {
        Lists {
            slots: vec![Slot::default(); depth],
            free: (0..depth).collect(),
            pending: VecDeque::with_capacity(depth),
            processing: VecDeque::with_capacity(depth),
            done: VecDeque::with_capacity(depth),
            closed: false,
        }
    }
}

pub struct BufferSetQueue {
    name: String,
    depth: usize,
    memory: Arc<dyn MemoryManager>,
    chains: Arc<ChainAllocator>,
    consumer: Option<Weak<dyn QueueConsumer>>,
    lists: Mutex<Lists>,
    done_cond: Condvar,
}

impl BufferSetQueue {
    /// Creates a queue of `config.depth` slots and attaches it to the chain
    /// arena.
    pub fn new(
        name: impl Into<String>,
        config: &QueueConfig,
        memory: Arc<dyn MemoryManager>,
        chains: Arc<ChainAllocator>,
        consumer: Option<Weak<dyn QueueConsumer>>,
    ) -> Arc<Self> {
        let depth = config.depth.max(1);
        chains.attach();
        Arc::new(BufferSetQueue {
            name: name.into(),
            depth,
            memory,
            chains,
            consumer,
            lists: Mutex::new(Lists::new(depth)),
            done_cond: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn chains(&self) -> &Arc<ChainAllocator> {
        &self.chains
    }

    fn lists(&self) -> MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Copies `set` into a free slot and hands it to the consumer.
    ///
    /// # Errors
    ///
    /// `Busy` when no slot is free, `PermissionDenied` after
    /// [`shutdown`](Self::shutdown), the memory manager's error when cache
    /// maintenance fails, or the consumer's error when its immediate
    /// processing attempt fails.
    pub fn enqueue(&self, set: &BufferSet) -> Result<()> {
        self.enqueue_with_chain(set, None)
    }

    /// Like [`enqueue`](Self::enqueue) with a chain stored alongside the set.
    /// The queue owns the chain from here on and releases it when the set
    /// cannot be stored.
    pub fn enqueue_with_chain(&self, set: &BufferSet, chain: Option<ChainId>) -> Result<()> {
        if let Err(err) = self.store(set, chain) {
            if let Some(chain) = chain {
                self.chains.release(chain);
            }
            return Err(err);
        }
        self.notify()
    }

    fn store(&self, set: &BufferSet, chain: Option<ChainId>) -> Result<()> {
        let mut lists = self.lists();
        if lists.closed {
            return Err(FastpathError::PermissionDenied);
        }
        let Some(idx) = lists.free.pop_front() else {
            debug!("{}: no free slot for req {}", self.name, set.request_id);
            return Err(FastpathError::Busy);
        };

        let mut copy = *set;
        copy.status = BufferStatus::Success;
        copy.sequence = 0;

        if let Err(err) = self.cache_maintenance(&copy) {
            lists.free.push_front(idx);
            warn!(
                "{}: cache maintenance failed for req {}: {err}",
                self.name, copy.request_id
            );
            return Err(err);
        }

        lists.slots[idx] = Slot { set: copy, chain };
        lists.pending.push_back(idx);
        debug!("{}: req {} free -> pending", self.name, copy.request_id);
        Ok(())
    }

    fn cache_maintenance(&self, set: &BufferSet) -> Result<()> {
        for (_, desc) in set
            .input_slots()
            .filter(|(_, d)| d.needs_cache_maintenance())
        {
            for plane in desc.planes() {
                self.memory.cache_clean(plane.handle, plane.offset)?;
            }
        }
        for (_, desc) in set
            .output_slots()
            .filter(|(_, d)| d.needs_cache_maintenance())
        {
            for plane in desc.planes() {
                self.memory.cache_invalidate(plane.handle, plane.offset)?;
            }
        }
        Ok(())
    }

    fn consumer(&self) -> Option<Arc<dyn QueueConsumer>> {
        self.consumer.as_ref().and_then(Weak::upgrade)
    }

    fn notify(&self) -> Result<()> {
        match self.consumer().map(|c| c.buffer_queued()) {
            None | Some(Ok(())) | Some(Err(FastpathError::Again)) => Ok(()),
            Some(Err(err)) => Err(err),
        }
    }

    /// Moves the oldest pending set to processing and returns a copy of it.
    pub fn get_next(&self) -> Option<BufferSet> {
        let mut lists = self.lists();
        let idx = lists.pending.pop_front()?;
        lists.processing.push_back(idx);
        let set = lists.slots[idx].set;
        debug!("{}: req {} pending -> processing", self.name, set.request_id);
        Some(set)
    }

    /// Retires the processing entry for `request_id`.
    ///
    /// A zero `timestamp` keeps the timestamp the set already carries. A
    /// successful completion that carries a chain dispatches the next link
    /// once the lock is released.
    ///
    /// # Errors
    ///
    /// `NotFound` when no processing entry has `request_id`.
    pub fn complete(
        &self,
        request_id: u64,
        status: BufferStatus,
        timestamp: u64,
        sequence: u32,
    ) -> Result<()> {
        let handoff = {
            let mut lists = self.lists();
            let Some(pos) = lists
                .processing
                .iter()
                .position(|&idx| lists.slots[idx].set.request_id == request_id)
            else {
                warn!("{}: complete for unknown req {request_id}", self.name);
                return Err(FastpathError::NotFound(request_id));
            };
            let Some(idx) = lists.processing.remove(pos) else {
                return Err(FastpathError::NotFound(request_id));
            };

            let slot = &mut lists.slots[idx];
            slot.set.status = status;
            if timestamp != 0 {
                slot.set.timestamp = timestamp;
            }
            slot.set.sequence = sequence;
            let set = slot.set;

            match slot.chain.take() {
                Some(chain) if status == BufferStatus::Success => {
                    lists.free.push_back(idx);
                    Some((chain, set))
                }
                Some(chain) => {
                    self.chains.release(chain);
                    error!("{}: req {request_id} failed, chain terminated", self.name);
                    lists.done.push_back(idx);
                    self.done_cond.notify_all();
                    None
                }
                None => {
                    lists.done.push_back(idx);
                    self.done_cond.notify_all();
                    None
                }
            }
        };

        debug!("{}: req {request_id} processing -> done", self.name);
        if let Some((chain, set)) = handoff {
            self.dispatch(chain, &set);
        }
        Ok(())
    }

    fn dispatch(&self, chain: ChainId, completed: &BufferSet) {
        let next = match self.chains.advance(chain, completed) {
            Ok(Some(next)) => next,
            Ok(None) => {
                self.deliver(completed);
                return;
            }
            Err(err) => {
                error!(
                    "{}: chain hand-off for req {} failed: {err}",
                    self.name, completed.request_id
                );
                self.deliver_error(completed);
                return;
            }
        };

        if let Err(err) = next.queue.store(&next.set, next.chain) {
            error!(
                "{}: chain hand-off of req {} to {} failed: {err}",
                self.name,
                completed.request_id,
                next.queue.name()
            );
            if let Some(chain) = next.chain {
                self.chains.release(chain);
            }
            self.deliver_error(completed);
            return;
        }

        if let Err(err) = next.queue.notify() {
            warn!(
                "{}: req {} failed on {}: {err}",
                self.name,
                next.set.request_id,
                next.queue.name()
            );
        }
    }

    fn deliver(&self, set: &BufferSet) {
        let mut lists = self.lists();
        let Some(idx) = lists.free.pop_front() else {
            error!("{}: req {} dropped, no free slot", self.name, set.request_id);
            return;
        };
        lists.slots[idx] = Slot {
            set: *set,
            chain: None,
        };
        lists.done.push_back(idx);
        self.done_cond.notify_all();
    }

    fn deliver_error(&self, set: &BufferSet) {
        let mut failed = *set;
        failed.status = BufferStatus::Error;
        self.deliver(&failed);
    }

    /// Takes the oldest completed set.
    ///
    /// # Errors
    ///
    /// `Again` when the done list is empty.
    pub fn dequeue_done(&self) -> Result<BufferSet> {
        let mut lists = self.lists();
        let idx = lists.done.pop_front().ok_or(FastpathError::Again)?;
        lists.free.push_back(idx);
        let set = lists.slots[idx].set;
        debug!("{}: req {} done -> free", self.name, set.request_id);
        Ok(set)
    }

    /// Waits up to `timeout` for the done list to become non-empty.
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let lists = self.lists();
        let (lists, _) = self
            .done_cond
            .wait_timeout_while(lists, timeout, |l| l.done.is_empty() && !l.closed)
            .unwrap_or_else(|p| p.into_inner());
        !lists.done.is_empty()
    }

    /// Discards every pending, processing and done set and releases their
    /// chains, then notifies the consumer.
    pub fn flush(&self) -> Result<()> {
        {
            let mut lists = self.lists();
            self.reset(&mut lists);
        }
        self.done_cond.notify_all();
        match self.consumer() {
            Some(consumer) => consumer.flush(),
            None => Ok(()),
        }
    }

    fn reset(&self, lists: &mut Lists) {
        let in_flight: Vec<usize> = lists
            .pending
            .iter()
            .chain(lists.processing.iter())
            .copied()
            .collect();
        for idx in in_flight {
            if let Some(chain) = lists.slots[idx].chain.take() {
                self.chains.release(chain);
            }
        }
        let dropped = lists.pending.len() + lists.processing.len() + lists.done.len();
        if dropped > 0 {
            debug!("{}: flush dropped {dropped} sets", self.name);
        }
        lists.pending.clear();
        lists.processing.clear();
        lists.done.clear();
        lists.free = (0..self.depth).collect();
    }

    /// Flushes and closes the queue. Later enqueues fail with
    /// `PermissionDenied`.
    pub fn shutdown(&self) -> Result<()> {
        let result = self.flush();
        self.lists().closed = true;
        self.done_cond.notify_all();
        result
    }

    /// Re-opens a queue closed by [`shutdown`](Self::shutdown).
    pub fn reopen(&self) {
        self.lists().closed = false;
    }

    pub fn is_closed(&self) -> bool {
        self.lists().closed
    }

    pub fn counts(&self) -> QueueCounts {
        let lists = self.lists();
        QueueCounts {
            free: lists.free.len(),
            pending: lists.pending.len(),
            processing: lists.processing.len(),
            done: lists.done.len(),
        }
    }
}

impl Drop for BufferSetQueue {
    fn drop(&mut self) {
        let lists = self.lists.get_mut().unwrap_or_else(|p| p.into_inner());
        for slot in lists.slots.iter_mut() {
            if let Some(chain) = slot.chain.take() {
                self.chains.release(chain);
            }
        }
        self.chains.detach();
    }
}
