// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-frame buffer sets exchanged between clients and device contexts.

use std::fmt;

/// Maximum number of input or output slots in a buffer set.
pub const MAX_BUFFERS: usize = 16;

/// Maximum number of planes per buffer.
pub const MAX_PLANES: usize = 3;

/// Buffer requires cache maintenance: clean for inputs, invalidate for
/// outputs.
pub const BUFFER_FLAG_CACHE: u32 = 1 << 0;

/// One plane of a buffer: a memory handle and the byte offset of the plane
/// inside it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    pub handle: i32,
    pub offset: u32,
}

/// Buffer descriptor for one input or output slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub num_planes: u32,
    pub planes: [Plane; MAX_PLANES],
    pub flags: u32,
}

impl BufferDescriptor {
    /// Single plane buffer at offset zero.
    pub fn single(handle: i32) -> Self {
        Self::with_planes(&[Plane { handle, offset: 0 }])
    }

    /// Buffer made of the given planes. Planes beyond [`MAX_PLANES`] are
    /// ignored.
    pub fn with_planes(planes: &[Plane]) -> Self {
        let mut desc = BufferDescriptor::default();
        for (dst, src) in desc.planes.iter_mut().zip(planes) {
            *dst = *src;
            desc.num_planes += 1;
        }
        desc
    }

    pub fn cached(mut self) -> Self {
        self.flags |= BUFFER_FLAG_CACHE;
        self
    }

    pub fn needs_cache_maintenance(&self) -> bool {
        self.flags & BUFFER_FLAG_CACHE != 0
    }

    pub fn planes(&self) -> &[Plane] {
        let count = (self.num_planes as usize).min(MAX_PLANES);
        &self.planes[..count]
    }
}

/// Completion status of a buffer set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferStatus {
    #[default]
    Success,
    Error,
}

/// One frame's bundle of input and output buffers.
///
/// Bit `n` of `in_mask`/`out_mask` marks slot `n` of `inputs`/`outputs` as
/// populated. `timestamp` and `sequence` are filled in when the set
/// completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferSet {
    pub request_id: u64,
    pub in_mask: u32,
    pub out_mask: u32,
    pub inputs: [BufferDescriptor; MAX_BUFFERS],
    pub outputs: [BufferDescriptor; MAX_BUFFERS],
    pub status: BufferStatus,
    pub timestamp: u64,
    pub sequence: u32,
}

impl BufferSet {
    pub fn new(request_id: u64) -> Self {
        BufferSet {
            request_id,
            ..Default::default()
        }
    }

    /// Populates input slot `slot`.
    ///
    /// Slots outside `0..MAX_BUFFERS` are ignored with the set unchanged.
    pub fn with_input(mut self, slot: usize, desc: BufferDescriptor) -> Self {
        if slot < MAX_BUFFERS {
            self.inputs[slot] = desc;
            self.in_mask |= 1 << slot;
        }
        self
    }

    /// Populates output slot `slot`.
    pub fn with_output(mut self, slot: usize, desc: BufferDescriptor) -> Self {
        if slot < MAX_BUFFERS {
            self.outputs[slot] = desc;
            self.out_mask |= 1 << slot;
        }
        self
    }

    pub fn input_slots(&self) -> impl Iterator<Item = (usize, &BufferDescriptor)> {
        slots(self.in_mask, &self.inputs)
    }

    pub fn output_slots(&self) -> impl Iterator<Item = (usize, &BufferDescriptor)> {
        slots(self.out_mask, &self.outputs)
    }
}

fn slots(
    mask: u32,
    descs: &[BufferDescriptor; MAX_BUFFERS],
) -> impl Iterator<Item = (usize, &BufferDescriptor)> {
    descs
        .iter()
        .enumerate()
        .filter(move |(bit, _)| mask & (1 << bit) != 0)
}

impl fmt::Display for BufferSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "req:{} in:{:#06x} out:{:#06x} {:?} ts:{} seq:{}",
            self.request_id,
            self.in_mask,
            self.out_mask,
            self.status,
            self.timestamp,
            self.sequence
        )
    }
}
