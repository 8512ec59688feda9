// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

#![allow(dead_code)]

use edgefirst_fastpath::{
    buffer::{BufferDescriptor, BufferSet},
    chain::ChainAllocator,
    config::{IcpConfig, IspConfig, QueueConfig},
    context::{AcquireDeviceCmd, AcquireHardwareCmd, DeviceContext, DeviceKind},
    handle::DeviceHandle,
    hw::HwResource,
    icp::IcpContext,
    isp::IspContext,
    memory::{MemoryManager, MemoryRegistry},
    node::DispatchNode,
    packet::{
        ConfigPacket, Direction, IoConfig, SharedPacket, ICP_OPCODE_IPE_UPDATE,
        ISP_PACKET_INIT_DEV, ISP_PACKET_UPDATE_DEV,
    },
    queue::BufferSetQueue,
    sim::SimBackend,
    FastpathError,
};
use std::sync::Arc;

pub const ISP_FULL_PORT: u32 = 0x3000;
pub const ICP_IN_SLOT: usize = 0;
pub const ICP_OUT_SLOT: usize = 8;

pub fn queue(
    memory: &Arc<MemoryRegistry>,
    chains: &Arc<ChainAllocator>,
    depth: usize,
) -> Arc<BufferSetQueue> {
    BufferSetQueue::new(
        format!("test{depth}"),
        &QueueConfig { depth },
        memory.clone(),
        chains.clone(),
        None,
    )
}

pub fn isp_init(request_id: u64, cmd_buf: i32) -> ConfigPacket {
    ConfigPacket::new(request_id, ISP_PACKET_INIT_DEV).with_cmd_buffer(cmd_buf, 256)
}

pub fn isp_update(request_id: u64, cmd_buf: i32, out: i32) -> ConfigPacket {
    ConfigPacket::new(request_id, ISP_PACKET_UPDATE_DEV)
        .with_cmd_buffer(cmd_buf, 128)
        .with_io(IoConfig::new(ISP_FULL_PORT, Direction::Output, out))
}

pub fn icp_update(request_id: u64, cmd_buf: i32, input: i32, output: i32) -> ConfigPacket {
    ConfigPacket::new(request_id, ICP_OPCODE_IPE_UPDATE)
        .with_cmd_buffer(cmd_buf, 512)
        .with_io(IoConfig::new(ICP_IN_SLOT as u32, Direction::Input, input))
        .with_io(IoConfig::new(ICP_OUT_SLOT as u32, Direction::Output, output))
        .with_patch(cmd_buf, input)
        .with_patch(cmd_buf, output)
}

pub fn isp_set(request_id: u64, out: i32) -> BufferSet {
    BufferSet::new(request_id).with_output(0, BufferDescriptor::single(out))
}

pub fn icp_set(request_id: u64, input: i32, output: i32) -> BufferSet {
    BufferSet::new(request_id)
        .with_input(ICP_IN_SLOT, BufferDescriptor::single(input))
        .with_output(ICP_OUT_SLOT, BufferDescriptor::single(output))
}

/// One ISP (index 0) and one ICP (index 1) context on simulated hardware
/// behind a dispatch node.
pub struct Rig {
    pub memory: Arc<MemoryRegistry>,
    pub chains: Arc<ChainAllocator>,
    pub isp_hw: Arc<SimBackend>,
    pub icp_hw: Arc<SimBackend>,
    pub isp: Arc<IspContext>,
    pub icp: Arc<IcpContext>,
    pub node: DispatchNode,
    pub cmd_buf: i32,
}

impl Rig {
    pub fn new(isp: IspConfig, icp: IcpConfig, icp_auto_complete: bool) -> Self {
        let memory = Arc::new(MemoryRegistry::new());
        let chains = Arc::new(ChainAllocator::default());
        let isp_hw = Arc::new(SimBackend::isp());
        let icp_hw = Arc::new(SimBackend::icp(icp_auto_complete));
        let isp_ctx =
            IspContext::new(0, isp, isp_hw.clone(), memory.clone(), chains.clone()).unwrap();
        let icp_ctx =
            IcpContext::new(1, icp, icp_hw.clone(), memory.clone(), chains.clone()).unwrap();
        let contexts: Vec<Arc<dyn DeviceContext>> = vec![isp_ctx.clone(), icp_ctx.clone()];
        let node = DispatchNode::new(memory.clone(), contexts).unwrap();
        let cmd_buf = memory.register_host(4096);
        Rig {
            memory,
            chains,
            isp_hw,
            icp_hw,
            isp: isp_ctx,
            icp: icp_ctx,
            node,
            cmd_buf,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(IspConfig::default(), IcpConfig::default(), true)
    }

    pub fn buffer(&self) -> i32 {
        self.memory.register_host(1 << 20)
    }

    /// Places `packet` in client memory and configures `handle` with it.
    /// Returns the packet as the context sees it.
    pub fn configure(
        &self,
        handle: DeviceHandle,
        packet: ConfigPacket,
    ) -> Result<SharedPacket, FastpathError> {
        let (buf, offset) = self.memory.register_packet(packet);
        self.node.configure(handle, buf, offset)?;
        self.memory.packet(buf, offset)
    }

    /// Acquires the ISP with deferred hardware and then acquires hardware.
    pub fn acquire_isp(&self) -> Result<DeviceHandle, FastpathError> {
        let handle = self
            .node
            .acquire_device(DeviceKind::Isp, &AcquireDeviceCmd::deferred(7))?;
        self.node
            .acquire_hardware(handle, &AcquireHardwareCmd::v2(vec![HwResource::default()]))?;
        Ok(handle)
    }

    /// Streaming ISP with an init packet and an update packet for request 1
    /// writing `out`.
    pub fn start_isp(&self, out: i32) -> Result<DeviceHandle, FastpathError> {
        let handle = self.acquire_isp()?;
        self.configure(handle, isp_init(0, self.cmd_buf))?;
        self.configure(handle, isp_update(1, self.cmd_buf, out))?;
        self.node.start(handle)?;
        Ok(handle)
    }

    pub fn acquire_icp(&self) -> Result<DeviceHandle, FastpathError> {
        self.node.acquire_device(
            DeviceKind::Icp,
            &AcquireDeviceCmd::with_resources(8, Vec::new()),
        )
    }

    /// Streaming ICP with one update packet for `request_id`.
    pub fn start_icp(
        &self,
        request_id: u64,
        input: i32,
        output: i32,
    ) -> Result<(DeviceHandle, SharedPacket), FastpathError> {
        let handle = self.acquire_icp()?;
        let packet = self.configure(handle, icp_update(request_id, self.cmd_buf, input, output))?;
        self.node.start(handle)?;
        Ok((handle, packet))
    }
}
