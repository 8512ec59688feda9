// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! ISP-style device context.
//!
//! Request descriptors move through three lists:
//!
//! ```text
//! configure/EPOCH -> pending -apply-> active -SOF-> processing -DONE-> retired
//! ```
//!
//! Init packets are merged into a single pending init descriptor that
//! [`start`](DeviceContext::start) programs. Update packets are stored and
//! bound to a buffer set on every EPOCH, so one packet can be reused for many
//! frames. Hardware events run on the context's [`EventWorker`]. When the
//! back end stalls, the oldest descriptors beyond the [`RecyclePolicy`]
//! depth are discarded and their buffer sets completed with error status.

use crate::{
    buffer::{BufferSet, BufferStatus},
    chain::ChainAllocator,
    config::{IspConfig, RecyclePolicy},
    context::{
        validate_handle_type, AcquireDeviceCmd, AcquireHardwareCmd, AcquiredHwInfo,
        DeviceContext, DeviceKind, ACQUIRE_HW_VERSION_2, MAX_ACQUIRE_RESOURCES,
    },
    error::{FastpathError, Result},
    hw::{
        AcquireArgs, AcquiredHw, ConfigArgs, FenceMapEntry, HardwareBackend, HwCapability,
        HwCommand, HwCommandReply, HwEvent, HwResource, HwUpdateEntry, PacketOpcode, StopMode,
    },
    memory::MemoryManager,
    packet::{self, Direction, SharedPacket, ISP_PACKET_INIT_DEV, ISP_PACKET_UPDATE_DEV},
    patch::{bind_buffers, DirectionRule},
    queue::BufferSetQueue,
    worker::EventWorker,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, OnceLock, Weak},
};
use tracing::{debug, error, warn};

/// Output resource type bound by each buffer-set output slot. Zero marks an
/// unused slot.
const ISP_OUTPUT_PORTS: [u32; 16] = [
    0x3000, // full
    0x3001, // ds4
    0x3002, // ds16
    0x3003, // camif raw
    0x3003, // lsc raw
    0x3003, // gtm raw
    0x3004, // fd
    0x3005, // pdaf
    0x3006, // rdi0
    0x3007, // rdi1
    0x3008, // rdi2
    0x3009, // rdi3
    0x3010, // stats rs
    0x3011, // stats cs
    0x0000,
    0x3012, // stats ihist
];

pub fn output_port(slot: usize) -> Option<u32> {
    ISP_OUTPUT_PORTS.get(slot).copied().filter(|&port| port != 0)
}

/// Ordering tag of a request descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestTag {
    SofExpected,
    DoneExpected,
    Retired,
}

#[derive(Clone, Debug)]
struct RequestDescriptor {
    request_id: u64,
    opcode: PacketOpcode,
    entries: Vec<HwUpdateEntry>,
    fence_out: Vec<FenceMapEntry>,
    fence_in: Vec<FenceMapEntry>,
    acked: Vec<u32>,
    tag: RequestTag,
    /// A buffer set in the queue's processing list belongs to this request.
    bound: bool,
    reapply: bool,
    timestamp: u64,
    sequence: u32,
}

impl RequestDescriptor {
    fn config_args(&self) -> ConfigArgs {
        ConfigArgs {
            request_id: self.request_id,
            entries: self.entries.clone(),
            out_map: self.fence_out.clone(),
            init_packet: self.opcode == PacketOpcode::Init,
            reapply: self.reapply,
            packet: None,
        }
    }

    fn summary(&self) -> RequestSummary {
        RequestSummary {
            request_id: self.request_id,
            init: self.opcode == PacketOpcode::Init,
            num_entries: self.entries.len(),
            num_fence_out: self.fence_out.len(),
            num_fence_in: self.fence_in.len(),
            num_acked: self.acked.len(),
            tag: self.tag,
            reapply: self.reapply,
        }
    }
}

/// Descriptor as reported by [`IspContext::snapshot`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RequestSummary {
    pub request_id: u64,
    pub init: bool,
    pub num_entries: usize,
    pub num_fence_out: usize,
    pub num_fence_in: usize,
    pub num_acked: usize,
    pub tag: RequestTag,
    pub reapply: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IspSnapshot {
    pub pending: Vec<RequestSummary>,
    pub active: Vec<RequestSummary>,
    pub processing: Vec<RequestSummary>,
    /// `(request_id, use_count)` of the stored update packets.
    pub packets: Vec<(u64, u32)>,
    pub sof_count: u32,
    pub streaming: bool,
}

struct StoredPacket {
    request_id: u64,
    packet: SharedPacket,
    use_count: u32,
}

/// Buffer-set completion deferred until the context lock is released.
struct Retire {
    request_id: u64,
    status: BufferStatus,
    timestamp: u64,
    sequence: u32,
}

#[derive(Default)]
struct IspInner {
    session: Option<i32>,
    hw: Option<AcquiredHw>,
    context_type: u32,
    pending: VecDeque<RequestDescriptor>,
    active: VecDeque<RequestDescriptor>,
    processing: VecDeque<RequestDescriptor>,
    packets: VecDeque<StoredPacket>,
    sof_count: u32,
    streaming: bool,
}

impl IspInner {
    fn in_flight(&self) -> usize {
        self.pending.len() + self.active.len() + self.processing.len()
    }

    fn hw_ctx(&self) -> Result<u64> {
        self.hw
            .map(|hw| hw.ctx)
            .ok_or(FastpathError::PermissionDenied)
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.active.clear();
        self.processing.clear();
        self.packets.clear();
        self.sof_count = 0;
        self.streaming = false;
    }
}

pub struct IspContext {
    index: u8,
    config: IspConfig,
    backend: Arc<dyn HardwareBackend>,
    queue: Arc<BufferSetQueue>,
    inner: Mutex<IspInner>,
    worker: EventWorker<HwEvent>,
}

impl IspContext {
    /// Creates the context, its queue and its event worker.
    ///
    /// # Errors
    ///
    /// Fails when the event worker thread cannot be spawned.
    pub fn new(
        index: u8,
        config: IspConfig,
        backend: Arc<dyn HardwareBackend>,
        memory: Arc<dyn MemoryManager>,
        chains: Arc<ChainAllocator>,
    ) -> Result<Arc<Self>> {
        let target: Arc<OnceLock<Weak<IspContext>>> = Arc::default();
        let events = target.clone();
        let worker = EventWorker::spawn(format!("isp{index}-events"), move |event: HwEvent| {
            if let Some(ctx) = events.get().and_then(Weak::upgrade) {
                ctx.handle_event(event);
            }
        })?;

        let queue =
            BufferSetQueue::new(format!("isp{index}"), &config.queue, memory, chains, None);
        let ctx = Arc::new_cyclic(|weak| {
            let _ = target.set(weak.clone());
            IspContext {
                index,
                config,
                backend,
                queue,
                inner: Mutex::new(IspInner::default()),
                worker,
            }
        });
        Ok(ctx)
    }

    fn inner(&self) -> MutexGuard<'_, IspInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &IspConfig {
        &self.config
    }

    fn recycle(&self) -> &RecyclePolicy {
        &self.config.recycle
    }

    /// Blocks until every hardware event raised so far has been handled.
    pub fn drain_events(&self) -> Result<()> {
        self.worker.drain()
    }

    pub fn snapshot(&self) -> IspSnapshot {
        let inner = self.inner();
        let list = |l: &VecDeque<RequestDescriptor>| -> Vec<RequestSummary> {
            l.iter().map(RequestDescriptor::summary).collect()
        };
        IspSnapshot {
            pending: list(&inner.pending),
            active: list(&inner.active),
            processing: list(&inner.processing),
            packets: inner
                .packets
                .iter()
                .map(|p| (p.request_id, p.use_count))
                .collect(),
            sof_count: inner.sof_count,
            streaming: inner.streaming,
        }
    }

    fn acquire_hw(
        &self,
        inner: &mut IspInner,
        session: i32,
        resources: &[HwResource],
    ) -> Result<AcquiredHw> {
        let args = AcquireArgs {
            session_handle: session,
            resources: resources.to_vec(),
            sink: Arc::new(self.worker.sender()),
        };
        let hw = self.backend.acquire(&args)?;

        match self.backend.generic_command(hw.ctx, &HwCommand::ContextType) {
            Ok(HwCommandReply::ContextType(ty)) => inner.context_type = ty,
            Ok(reply) => debug!("isp{}: context type reply {:?}", self.index, reply),
            Err(err) => {
                error!("isp{}: context type query failed: {err}", self.index);
                if let Err(err) = self.backend.release(hw.ctx) {
                    warn!("isp{}: release after failed acquire: {err}", self.index);
                }
                return Err(err);
            }
        }

        inner.hw = Some(hw);
        debug!("isp{}: acquired hw ctx {} mask {:#x}", self.index, hw.ctx, hw.hw_mask);
        Ok(hw)
    }

    /// Programs the earliest pending descriptor.
    ///
    /// # Errors
    ///
    /// `Again` with nothing pending. A back-end failure leaves the
    /// descriptor at the front of pending and is returned to the caller.
    pub fn apply(&self) -> Result<()> {
        let mut inner = self.inner();
        self.apply_locked(&mut inner)
    }

    fn apply_locked(&self, inner: &mut IspInner) -> Result<()> {
        let ctx = inner.hw_ctx()?;
        let Some(mut desc) = inner.pending.pop_front() else {
            return Err(FastpathError::Again);
        };

        if let Err(err) = self.backend.apply_config(ctx, &desc.config_args()) {
            warn!("isp{}: apply req {} failed: {err}", self.index, desc.request_id);
            inner.pending.push_front(desc);
            return Err(err);
        }

        desc.tag = RequestTag::SofExpected;
        debug!("isp{}: req {} pending -> active", self.index, desc.request_id);
        inner.active.push_back(desc);
        Ok(())
    }

    /// Binds the next queued buffer set to the stored packet that covers it.
    fn bind_next(&self, inner: &mut IspInner, retire: &mut Vec<Retire>) {
        let Ok(ctx) = inner.hw_ctx() else {
            return;
        };
        if !inner.streaming || inner.packets.is_empty() {
            return;
        }
        if inner.in_flight() >= self.config.max_requests {
            debug!("isp{}: no free request descriptor", self.index);
            return;
        }
        let Some(set) = self.queue.get_next() else {
            return;
        };

        while inner.packets.len() > 1 && inner.packets[1].request_id <= set.request_id {
            if let Some(old) = inner.packets.pop_front() {
                debug!(
                    "isp{}: packet {} superseded after {} uses",
                    self.index, old.request_id, old.use_count
                );
            }
        }

        match self.prepare_for(ctx, inner, &set) {
            Ok(desc) => {
                debug!("isp{}: req {} bound, pending", self.index, desc.request_id);
                inner.pending.push_back(desc);
            }
            Err(err) => {
                warn!("isp{}: req {} not bound: {err}", self.index, set.request_id);
                retire.push(Retire {
                    request_id: set.request_id,
                    status: BufferStatus::Error,
                    timestamp: 0,
                    sequence: 0,
                });
            }
        }
    }

    fn prepare_for(
        &self,
        ctx: u64,
        inner: &mut IspInner,
        set: &BufferSet,
    ) -> Result<RequestDescriptor> {
        let stored = inner
            .packets
            .front_mut()
            .ok_or_else(|| FastpathError::invalid("no stored packet"))?;
        stored.use_count += 1;
        let reapply = stored.use_count > 1;

        let mut pkt = packet::lock(&stored.packet);
        pkt.header.request_id = set.request_id;
        bind_buffers(
            &mut pkt.io_configs,
            &set.outputs,
            set.out_mask,
            DirectionRule::Assign(Direction::Output),
            output_port,
        )?;
        let prepared = self.backend.prepare_update(ctx, &pkt)?;

        Ok(RequestDescriptor {
            request_id: set.request_id,
            opcode: PacketOpcode::Update,
            entries: prepared.entries,
            fence_out: prepared.fence_out,
            fence_in: prepared.fence_in,
            acked: Vec::new(),
            tag: RequestTag::SofExpected,
            bound: true,
            reapply,
            timestamp: 0,
            sequence: 0,
        })
    }

    fn discard(&self, desc: RequestDescriptor, list: &str, retire: &mut Vec<Retire>) {
        error!(
            "isp{}: req {} recycled from {list} with error",
            self.index, desc.request_id
        );
        if desc.bound {
            retire.push(Retire {
                request_id: desc.request_id,
                status: BufferStatus::Error,
                timestamp: desc.timestamp,
                sequence: desc.sequence,
            });
        }
    }

    fn retire(&self, mut desc: RequestDescriptor, retire: &mut Vec<Retire>) {
        desc.tag = RequestTag::Retired;
        debug!("isp{}: req {} retired", self.index, desc.request_id);
        if desc.bound {
            retire.push(Retire {
                request_id: desc.request_id,
                status: BufferStatus::Success,
                timestamp: desc.timestamp,
                sequence: desc.sequence,
            });
        }
    }

    fn on_sof(&self, inner: &mut IspInner, boot_time: u64, retire: &mut Vec<Retire>) {
        inner.sof_count = inner.sof_count.wrapping_add(1);

        let keep = self.recycle().keep();
        let mut discards = 0;
        while inner.active.len() > keep && discards < self.recycle().max_discards {
            if let Some(old) = inner.active.pop_front() {
                self.discard(old, "active", retire);
            }
            discards += 1;
        }

        let Some(mut desc) = inner.active.pop_front() else {
            warn!("isp{}: SOF {} with no active request", self.index, inner.sof_count);
            return;
        };
        if desc.tag != RequestTag::SofExpected {
            warn!(
                "isp{}: req {} got SOF in state {:?}",
                self.index, desc.request_id, desc.tag
            );
        }
        desc.timestamp = boot_time;
        desc.sequence = inner.sof_count;

        if desc.fence_out.is_empty() {
            self.retire(desc, retire);
            return;
        }
        desc.tag = RequestTag::DoneExpected;
        debug!("isp{}: req {} active -> processing", self.index, desc.request_id);
        inner.processing.push_back(desc);
    }

    fn on_done(&self, inner: &mut IspInner, handles: &[u32], retire: &mut Vec<Retire>) {
        let keep = self.recycle().keep();
        let mut discards = 0;
        while inner.processing.len() > keep && discards < self.recycle().max_discards {
            if let Some(old) = inner.processing.pop_front() {
                self.discard(old, "processing", retire);
            }
            discards += 1;
        }

        let Some(desc) = inner.processing.front_mut() else {
            if inner.active.is_empty() {
                warn!("isp{}: DONE with no request in flight", self.index);
            } else {
                warn!("isp{}: DONE before SOF", self.index);
            }
            return;
        };
        if desc.tag != RequestTag::DoneExpected {
            warn!(
                "isp{}: req {} got DONE in state {:?}",
                self.index, desc.request_id, desc.tag
            );
            return;
        }

        for &handle in handles {
            let known = desc.fence_out.iter().any(|f| f.resource_handle == handle);
            if !known {
                debug!("isp{}: handle {handle:#x} not in fence map", self.index);
            } else if desc.acked.contains(&handle) {
                warn!("isp{}: handle {handle:#x} acked twice", self.index);
            } else {
                desc.acked.push(handle);
            }
        }

        if desc.acked.len() >= desc.fence_out.len() {
            if let Some(desc) = inner.processing.pop_front() {
                self.retire(desc, retire);
            }
        }
    }

    fn handle_event(&self, event: HwEvent) {
        let mut retire = Vec::new();
        {
            let mut inner = self.inner();
            match &event {
                HwEvent::Sof { boot_time } => self.on_sof(&mut inner, *boot_time, &mut retire),
                HwEvent::Epoch => {
                    self.bind_next(&mut inner, &mut retire);
                    match self.apply_locked(&mut inner) {
                        Ok(()) | Err(FastpathError::Again) => {}
                        Err(err) => warn!("isp{}: apply at EPOCH failed: {err}", self.index),
                    }
                }
                HwEvent::Done { handles, .. } => self.on_done(&mut inner, handles, &mut retire),
                HwEvent::Error { code } => {
                    error!("isp{}: hardware error {code:#x}", self.index)
                }
                HwEvent::RegUpdate | HwEvent::Eof => debug!("isp{}: {}", self.index, event.name()),
            }
        }
        self.complete(retire);
    }

    fn complete(&self, retire: Vec<Retire>) {
        for r in retire {
            if let Err(err) = self
                .queue
                .complete(r.request_id, r.status, r.timestamp, r.sequence)
            {
                warn!("isp{}: complete req {} failed: {err}", self.index, r.request_id);
            }
        }
    }

    fn configure_init(
        &self,
        inner: &mut IspInner,
        ctx: u64,
        packet: &SharedPacket,
    ) -> Result<()> {
        let prepared = {
            let pkt = packet::lock(packet);
            self.backend.prepare_update(ctx, &pkt)?
        };
        let request_id = packet::lock(packet).request_id();

        if let Some(back) = inner.pending.back_mut() {
            if back.opcode != PacketOpcode::Init {
                warn!("isp{}: init packet {request_id} behind update", self.index);
                return Err(FastpathError::invalid("init packet after update packet"));
            }
            if back.entries.len() + prepared.entries.len() >= self.config.max_update_entries {
                return Err(FastpathError::invalid(format!(
                    "merged init needs {} update entries, limit {}",
                    back.entries.len() + prepared.entries.len(),
                    self.config.max_update_entries
                )));
            }
            back.entries.extend(prepared.entries);
            back.fence_out.extend(prepared.fence_out);
            back.fence_in.extend(prepared.fence_in);
            back.request_id = request_id;
            debug!(
                "isp{}: init packet {request_id} merged, {} entries",
                self.index,
                back.entries.len()
            );
            return Ok(());
        }

        if inner.in_flight() >= self.config.max_requests {
            return Err(FastpathError::Busy);
        }
        inner.pending.push_back(RequestDescriptor {
            request_id,
            opcode: PacketOpcode::Init,
            entries: prepared.entries,
            fence_out: prepared.fence_out,
            fence_in: prepared.fence_in,
            acked: Vec::new(),
            tag: RequestTag::SofExpected,
            bound: false,
            reapply: false,
            timestamp: 0,
            sequence: 0,
        });
        debug!("isp{}: init packet {request_id} pending", self.index);
        Ok(())
    }

    fn configure_update(&self, inner: &mut IspInner, packet: SharedPacket) -> Result<()> {
        let request_id = packet::lock(&packet).request_id();
        let have_init = inner.streaming
            || inner
                .pending
                .iter()
                .any(|d| d.opcode == PacketOpcode::Init);
        if !have_init {
            warn!("isp{}: update packet {request_id} before init", self.index);
            return Err(FastpathError::invalid("update packet before init packet"));
        }

        if inner.packets.len() >= self.config.max_packets.max(1) {
            if let Some(old) = inner.packets.pop_front() {
                warn!(
                    "isp{}: packet pool full, dropping packet {}",
                    self.index, old.request_id
                );
            }
        }
        inner.packets.push_back(StoredPacket {
            request_id,
            packet,
            use_count: 0,
        });
        debug!("isp{}: update packet {request_id} stored", self.index);
        Ok(())
    }
}

impl DeviceContext for IspContext {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Isp
    }

    fn index(&self) -> u8 {
        self.index
    }

    fn queue(&self) -> &Arc<BufferSetQueue> {
        &self.queue
    }

    fn query_capability(&self) -> Result<HwCapability> {
        self.backend.query_capability()
    }

    fn acquire_device(&self, cmd: &AcquireDeviceCmd) -> Result<()> {
        cmd.validate(MAX_ACQUIRE_RESOURCES)?;
        let mut inner = self.inner();
        if !cmd.is_deferred() {
            self.acquire_hw(&mut inner, cmd.session_handle, &cmd.resources)?;
        }
        inner.session = Some(cmd.session_handle);
        self.queue.reopen();
        debug!("isp{}: device acquired, session {}", self.index, cmd.session_handle);
        Ok(())
    }

    fn acquire_hardware(&self, cmd: &AcquireHardwareCmd) -> Result<AcquiredHwInfo> {
        if cmd.version != ACQUIRE_HW_VERSION_2 {
            return Err(FastpathError::invalid(format!(
                "acquire hardware version {} not supported",
                cmd.version
            )));
        }
        validate_handle_type(cmd.handle_type)?;
        if cmd.resources.len() > MAX_ACQUIRE_RESOURCES {
            return Err(FastpathError::invalid("too many resources"));
        }

        let mut inner = self.inner();
        if inner.hw.is_some() {
            return Err(FastpathError::invalid("hardware already acquired"));
        }
        let session = inner
            .session
            .ok_or_else(|| FastpathError::invalid("device not acquired"))?;
        let hw = self.acquire_hw(&mut inner, session, &cmd.resources)?;
        Ok(AcquiredHwInfo {
            hw_mask: hw.hw_mask,
            context_type: inner.context_type,
        })
    }

    fn release_hardware(&self) -> Result<()> {
        let mut inner = self.inner();
        let Some(hw) = inner.hw else {
            debug!("isp{}: release hardware without hardware", self.index);
            return Ok(());
        };
        // the binding stays until the back end lets go of it
        self.backend.release(hw.ctx)?;
        inner.hw = None;
        inner.clear();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut inner = self.inner();
        let ctx = inner.hw_ctx()?;
        match inner.pending.front() {
            Some(desc) if desc.opcode == PacketOpcode::Init => {}
            _ => return Err(FastpathError::invalid("start without init packet")),
        }
        let Some(mut init) = inner.pending.pop_front() else {
            return Err(FastpathError::invalid("start without init packet"));
        };

        inner.sof_count = 0;
        init.tag = RequestTag::SofExpected;
        let args = init.config_args();
        inner.active.push_back(init);

        if let Err(err) = self.backend.start(ctx, Some(&args)) {
            error!("isp{}: start failed: {err}", self.index);
            if let Some(init) = inner.active.pop_back() {
                inner.pending.push_front(init);
            }
            return Err(err);
        }
        inner.streaming = true;
        debug!("isp{}: started", self.index);
        Ok(())
    }

    fn stop(&self, mode: StopMode) -> Result<()> {
        let result = {
            let inner = self.inner();
            match inner.hw {
                Some(hw) => self.backend.stop(hw.ctx, mode),
                None => Ok(()),
            }
        };
        if let Err(err) = &result {
            error!("isp{}: stop failed: {err}", self.index);
        }

        if let Err(err) = self.worker.drain() {
            warn!("isp{}: event drain: {err}", self.index);
        }
        {
            let mut inner = self.inner();
            let dropped = inner.in_flight();
            if dropped > 0 {
                debug!("isp{}: stop dropped {dropped} requests", self.index);
            }
            inner.clear();
        }
        self.queue.flush()?;
        result
    }

    fn configure(&self, packet: SharedPacket) -> Result<()> {
        let mut inner = self.inner();
        let ctx = inner.hw_ctx()?;
        let opcode = packet::lock(&packet).opcode();
        match opcode {
            ISP_PACKET_INIT_DEV => self.configure_init(&mut inner, ctx, &packet),
            ISP_PACKET_UPDATE_DEV => self.configure_update(&mut inner, packet),
            op => Err(FastpathError::invalid(format!("unsupported isp opcode {op}"))),
        }
    }

    fn flush(&self) -> Result<()> {
        {
            let mut guard = self.inner();
            let inner = &mut *guard;
            for list in [&mut inner.pending, &mut inner.active, &mut inner.processing] {
                list.retain(|d| !d.bound);
            }
        }
        self.queue.flush()
    }

    fn release_device(&self) -> Result<()> {
        {
            let mut inner = self.inner();
            if let Some(hw) = inner.hw {
                self.backend.release(hw.ctx)?;
                inner.hw = None;
            }
            inner.clear();
            inner.session = None;
        }
        self.queue.flush()
    }
}
