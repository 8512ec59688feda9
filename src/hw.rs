// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Hardware back-end interface.
//!
//! Device contexts drive the accelerator only through [`HardwareBackend`].
//! Calls are synchronous from the context's point of view. Events flow back
//! through the [`HwEventSink`] registered at acquire time and may be raised
//! from any thread.

use crate::{error::Result, packet::ConfigPacket};
use std::sync::Arc;

/// Back-end context identifier returned by [`HardwareBackend::acquire`].
pub type HwContextId = u64;

/// Hardware resource requested at acquire time.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwResource {
    pub resource_id: u32,
    pub length: u32,
    pub handle: u64,
}

/// One register-update block produced by [`HardwareBackend::prepare_update`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwUpdateEntry {
    pub handle: i32,
    pub offset: u32,
    pub len: u32,
}

/// Maps a hardware resource to the fence signalled when it completes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FenceMapEntry {
    pub resource_handle: u32,
    pub sync_id: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketOpcode {
    Init,
    Update,
}

/// Result of preparing a packet for the hardware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedUpdate {
    pub opcode: PacketOpcode,
    pub entries: Vec<HwUpdateEntry>,
    pub fence_out: Vec<FenceMapEntry>,
    pub fence_in: Vec<FenceMapEntry>,
}

pub struct AcquireArgs {
    pub session_handle: i32,
    pub resources: Vec<HwResource>,
    pub sink: Arc<dyn HwEventSink>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AcquiredHw {
    pub ctx: HwContextId,
    /// Bit per hardware block bound to the context.
    pub hw_mask: u64,
}

/// Configuration handed to the hardware for one request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigArgs {
    pub request_id: u64,
    pub entries: Vec<HwUpdateEntry>,
    pub out_map: Vec<FenceMapEntry>,
    pub init_packet: bool,
    /// The same packet was applied before.
    pub reapply: bool,
    /// Patched packet for accelerators that consume it directly.
    pub packet: Option<ConfigPacket>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopMode {
    AtFrameBoundary,
    Immediately,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwCommand {
    /// Query the context type the back end assigned.
    ContextType,
    /// Packet with stream-wide settings and no per-frame buffers.
    StreamSettings(ConfigPacket),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HwCommandReply {
    ContextType(u32),
    Ack,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HwCapability {
    pub version: u32,
    pub num_devices: u32,
    pub max_resources: u32,
}

/// Hardware-raised events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwEvent {
    /// Start of frame with the boot-time timestamp of the frame.
    Sof { boot_time: u64 },
    /// Mid-frame point where the next configuration can be programmed.
    Epoch,
    RegUpdate,
    Eof,
    /// Buffers done. `handles` are the resource handles that completed.
    Done { request_id: u64, handles: Vec<u32> },
    Error { code: u32 },
}

impl HwEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HwEvent::Sof { .. } => "SOF",
            HwEvent::Epoch => "EPOCH",
            HwEvent::RegUpdate => "REG_UPDATE",
            HwEvent::Eof => "EOF",
            HwEvent::Done { .. } => "DONE",
            HwEvent::Error { .. } => "ERROR",
        }
    }
}

/// Receives hardware events. Implementations must not block.
pub trait HwEventSink: Send + Sync {
    fn on_event(&self, event: HwEvent) -> Result<()>;
}

pub trait HardwareBackend: Send + Sync {
    fn acquire(&self, args: &AcquireArgs) -> Result<AcquiredHw>;

    fn release(&self, ctx: HwContextId) -> Result<()>;

    /// Starts streaming, programming `init` first when given.
    fn start(&self, ctx: HwContextId, init: Option<&ConfigArgs>) -> Result<()>;

    fn stop(&self, ctx: HwContextId, mode: StopMode) -> Result<()>;

    fn prepare_update(&self, ctx: HwContextId, packet: &ConfigPacket) -> Result<PreparedUpdate>;

    fn apply_config(&self, ctx: HwContextId, args: &ConfigArgs) -> Result<()>;

    fn query_capability(&self) -> Result<HwCapability>;

    fn generic_command(&self, ctx: HwContextId, cmd: &HwCommand) -> Result<HwCommandReply>;
}
