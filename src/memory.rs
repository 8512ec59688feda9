// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer-handle resolution and cache maintenance.
//!
//! The scheduler never touches buffer contents. It only needs to know that a
//! handle is valid, to keep CPU caches coherent around hardware access, and
//! to look up configuration packets the client placed in shared memory.
//! [`MemoryRegistry`] implements this for host memory and for DMA-heap
//! buffers, where cache maintenance is a `DMA_BUF_IOCTL_SYNC` pair.

use crate::{
    error::{FastpathError, Result},
    packet::{ConfigPacket, SharedPacket, PACKET_HEADER_SIZE},
};
use dma_heap::{Heap, HeapKind};
use std::{
    collections::HashMap,
    os::fd::{AsRawFd, OwnedFd},
    sync::Mutex,
};
use tracing::{debug, warn};

/// Memory-manager interface consumed by the queue and the contexts.
pub trait MemoryManager: Send + Sync {
    /// Returns the length of the buffer behind `handle`.
    fn resolve(&self, handle: i32) -> Result<usize>;

    /// Writes back CPU caches for a buffer the hardware is about to read.
    fn cache_clean(&self, handle: i32, offset: u32) -> Result<()>;

    /// Discards CPU cache lines for a buffer the hardware is about to write.
    fn cache_invalidate(&self, handle: i32, offset: u32) -> Result<()>;

    /// Resolves the packet stored at `offset` in the buffer behind `handle`.
    fn packet(&self, handle: i32, offset: usize) -> Result<SharedPacket>;
}

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
const DMA_BUF_SYNC_START: u64 = 0 << 2;
const DMA_BUF_SYNC_END: u64 = 1 << 2;
// _IOW('b', 0, struct dma_buf_sync)
const DMA_BUF_IOCTL_SYNC: u64 = 0x4008_6200;

#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

enum Backing {
    Host,
    Dma(OwnedFd),
}

struct Region {
    len: usize,
    backing: Backing,
    cleans: u64,
    invalidates: u64,
}

/// Cache maintenance counters of one buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cleans: u64,
    pub invalidates: u64,
}

#[derive(Default)]
struct RegistryState {
    next_handle: i32,
    regions: HashMap<i32, Region>,
    packets: HashMap<(i32, usize), SharedPacket>,
}

/// Handle table for host and DMA-heap buffers.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<RegistryState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, len: usize, backing: Backing) -> i32 {
        let mut state = self.state();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.regions.insert(
            handle,
            Region {
                len,
                backing,
                cleans: 0,
                invalidates: 0,
            },
        );
        handle
    }

    /// Registers a CPU-only buffer of `len` bytes.
    pub fn register_host(&self, len: usize) -> i32 {
        self.insert(len, Backing::Host)
    }

    /// Allocates a buffer from the CMA DMA heap.
    pub fn allocate_dma(&self, len: usize) -> Result<i32> {
        let heap = Heap::new(HeapKind::Cma)
            .map_err(|e| FastpathError::hardware(format!("dma heap: {e}")))?;
        let fd = heap
            .allocate(len)
            .map_err(|e| FastpathError::hardware(format!("dma heap allocate: {e}")))?;
        let handle = self.insert(len, Backing::Dma(fd));
        debug!("dma buffer {handle} allocated ({len} bytes)");
        Ok(handle)
    }

    /// Stores `packet` in a fresh packet buffer and returns its handle. The
    /// packet lives at offset zero.
    pub fn register_packet(&self, packet: ConfigPacket) -> (i32, usize) {
        let len = (packet.header.size as usize).max(PACKET_HEADER_SIZE) * 2;
        let handle = self.register_host(len);
        self.place_packet(handle, 0, packet);
        (handle, 0)
    }

    /// Places `packet` at `offset` inside an existing buffer, replacing any
    /// packet already there.
    pub fn place_packet(&self, handle: i32, offset: usize, packet: ConfigPacket) -> SharedPacket {
        let shared = packet.into_shared();
        self.state()
            .packets
            .insert((handle, offset), shared.clone());
        shared
    }

    pub fn release(&self, handle: i32) {
        let mut state = self.state();
        state.regions.remove(&handle);
        state.packets.retain(|(h, _), _| *h != handle);
    }

    pub fn cache_stats(&self, handle: i32) -> CacheStats {
        self.state()
            .regions
            .get(&handle)
            .map(|r| CacheStats {
                cleans: r.cleans,
                invalidates: r.invalidates,
            })
            .unwrap_or_default()
    }

    fn sync(&self, handle: i32, offset: u32, dir: u64) -> Result<()> {
        let mut state = self.state();
        let region = state
            .regions
            .get_mut(&handle)
            .ok_or_else(|| FastpathError::invalid(format!("unknown memory handle {handle}")))?;
        if offset as usize >= region.len.max(1) {
            return Err(FastpathError::invalid(format!(
                "offset {offset} outside buffer {handle} of {} bytes",
                region.len
            )));
        }

        if let Backing::Dma(fd) = &region.backing {
            for flags in [DMA_BUF_SYNC_START | dir, DMA_BUF_SYNC_END | dir] {
                let sync = DmaBufSync { flags };
                let ret = unsafe {
                    libc::ioctl(
                        fd.as_raw_fd(),
                        DMA_BUF_IOCTL_SYNC as _,
                        &sync as *const DmaBufSync,
                    )
                };
                if ret < 0 {
                    let err = std::io::Error::last_os_error();
                    warn!("dma buf sync on handle {handle} failed: {err}");
                    return Err(err.into());
                }
            }
        }

        if dir == DMA_BUF_SYNC_WRITE {
            region.cleans += 1;
        } else {
            region.invalidates += 1;
        }
        Ok(())
    }
}

impl MemoryManager for MemoryRegistry {
    fn resolve(&self, handle: i32) -> Result<usize> {
        self.state()
            .regions
            .get(&handle)
            .map(|r| r.len)
            .ok_or_else(|| FastpathError::invalid(format!("unknown memory handle {handle}")))
    }

    fn cache_clean(&self, handle: i32, offset: u32) -> Result<()> {
        self.sync(handle, offset, DMA_BUF_SYNC_WRITE)
    }

    fn cache_invalidate(&self, handle: i32, offset: u32) -> Result<()> {
        self.sync(handle, offset, DMA_BUF_SYNC_READ)
    }

    fn packet(&self, handle: i32, offset: usize) -> Result<SharedPacket> {
        let len = self.resolve(handle)?;
        if len < PACKET_HEADER_SIZE || offset >= len - PACKET_HEADER_SIZE {
            return Err(FastpathError::invalid(format!(
                "invalid packet buffer length {len} or offset {offset}"
            )));
        }
        let packet = self
            .state()
            .packets
            .get(&(handle, offset))
            .cloned()
            .ok_or_else(|| {
                FastpathError::invalid(format!("no packet at handle {handle} offset {offset}"))
            })?;
        let remain_len = len - offset;
        crate::packet::lock(&packet).validate(remain_len)?;
        debug!("packet handle {handle:#x} offset {offset:#x} length {len}");
        Ok(packet)
    }
}
