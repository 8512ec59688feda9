// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hardware configuration packets.
//!
//! A packet is opaque to the scheduler except for the pieces it has to
//! rewrite when a packet is matched against a buffer set: the request id in
//! the header, the memory handles of the io configs and the source handles
//! of the patch descriptors.

use crate::{
    buffer::MAX_PLANES,
    error::{FastpathError, Result},
};
use std::sync::{Arc, Mutex};

/// ISP opcodes (low byte of `op_code`).
pub const ISP_PACKET_INIT_DEV: u32 = 1;
pub const ISP_PACKET_UPDATE_DEV: u32 = 2;

/// ICP opcodes (low byte of `op_code`).
pub const ICP_OPCODE_IPE_UPDATE: u32 = 0;
pub const ICP_OPCODE_BPS_UPDATE: u32 = 1;
pub const ICP_OPCODE_IPE_SETTINGS: u32 = 2;
pub const ICP_OPCODE_BPS_SETTINGS: u32 = 3;

/// Minimum number of bytes a packet occupies in client memory.
pub const PACKET_HEADER_SIZE: usize = 64;

/// Data direction of an io config.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub request_id: u64,
    pub op_code: u32,
    pub size: u32,
}

/// Buffer reference of one hardware port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IoConfig {
    pub resource_type: u32,
    pub direction: Direction,
    pub mem_handle: [i32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    pub format: u32,
}

impl IoConfig {
    pub fn new(resource_type: u32, direction: Direction, handle: i32) -> Self {
        IoConfig {
            resource_type,
            direction,
            mem_handle: [handle, 0, 0],
            offsets: [0; MAX_PLANES],
            format: 0,
        }
    }
}

/// Patch descriptor: the firmware command stream at `dst` carries the
/// address of `src`, so the source handle must follow the io config it was
/// built from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PatchDesc {
    pub dst_buf_hdl: i32,
    pub dst_offset: u32,
    pub src_buf_hdl: i32,
    pub src_offset: u32,
}

/// Command buffer referenced by a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CmdBuffer {
    pub mem_handle: i32,
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigPacket {
    pub header: PacketHeader,
    pub cmd_buffers: Vec<CmdBuffer>,
    pub io_configs: Vec<IoConfig>,
    pub patches: Vec<PatchDesc>,
}

/// Packet shared between the memory manager and the context that stores it.
pub type SharedPacket = Arc<Mutex<ConfigPacket>>;

impl ConfigPacket {
    pub fn new(request_id: u64, op_code: u32) -> Self {
        ConfigPacket {
            header: PacketHeader {
                request_id,
                op_code,
                size: PACKET_HEADER_SIZE as u32,
            },
            ..Default::default()
        }
    }

    pub fn with_cmd_buffer(mut self, mem_handle: i32, length: u32) -> Self {
        self.cmd_buffers.push(CmdBuffer {
            mem_handle,
            offset: 0,
            length,
        });
        self
    }

    pub fn with_io(mut self, io: IoConfig) -> Self {
        self.io_configs.push(io);
        self
    }

    pub fn with_patch(mut self, dst_buf_hdl: i32, src_buf_hdl: i32) -> Self {
        self.patches.push(PatchDesc {
            dst_buf_hdl,
            dst_offset: 0,
            src_buf_hdl,
            src_offset: 0,
        });
        self
    }

    pub fn opcode(&self) -> u32 {
        self.header.op_code & 0xff
    }

    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    pub fn into_shared(self) -> SharedPacket {
        Arc::new(Mutex::new(self))
    }

    /// Structural checks applied before a packet is handed to a context.
    pub fn validate(&self, remain_len: usize) -> Result<()> {
        if (self.header.size as usize) < PACKET_HEADER_SIZE {
            return Err(FastpathError::invalid(format!(
                "packet size {} below header size",
                self.header.size
            )));
        }
        if self.header.size as usize > remain_len {
            return Err(FastpathError::invalid(format!(
                "packet size {} exceeds remaining length {}",
                self.header.size, remain_len
            )));
        }
        if self.cmd_buffers.iter().any(|cmd| cmd.length == 0) {
            return Err(FastpathError::invalid("zero length command buffer"));
        }
        Ok(())
    }
}

/// Locks a shared packet, recovering the data if a previous holder
/// panicked.
pub fn lock(packet: &SharedPacket) -> std::sync::MutexGuard<'_, ConfigPacket> {
    packet
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
