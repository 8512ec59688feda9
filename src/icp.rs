// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! ICP-style device context.
//!
//! Configured packets wait in a small ring keyed by the request id they were
//! submitted with. Each buffer set is matched to the newest packet whose
//! request id is not above its own; that packet's io configs and patch
//! descriptors are rewritten with the set's buffers before submission. A
//! packet reused while the hardware may still read it is only rewritten
//! after its previous submission completed, or the wait times out.
//!
//! Locks are always taken in the order context state, packet ring, packet.
//! The DONE handler only takes the packet ring.

use crate::{
    buffer::{BufferSet, BufferStatus},
    chain::ChainAllocator,
    config::IcpConfig,
    context::{AcquireDeviceCmd, AcquireHardwareCmd, AcquiredHwInfo, DeviceContext, DeviceKind},
    error::{FastpathError, Result},
    hw::{
        AcquireArgs, AcquiredHw, ConfigArgs, HardwareBackend, HwCapability, HwCommand, HwEvent,
        StopMode,
    },
    memory::MemoryManager,
    packet::{
        self, ConfigPacket, Direction, SharedPacket, ICP_OPCODE_BPS_SETTINGS,
        ICP_OPCODE_BPS_UPDATE, ICP_OPCODE_IPE_SETTINGS, ICP_OPCODE_IPE_UPDATE,
    },
    patch::{bind_buffers, DirectionRule, PatchMap},
    queue::{BufferSetQueue, QueueConsumer},
    worker::EventWorker,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak},
    time::Duration,
};
use tracing::{debug, error, warn};

/// One-shot completion that can be re-armed.
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn completed() -> Arc<Self> {
        Arc::new(Completion {
            done: Mutex::new(true),
            cond: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.done.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn reinit(&self) {
        *self.state() = false;
    }

    fn complete_all(&self) {
        *self.state() = true;
        self.cond.notify_all();
    }

    /// Returns false when `timeout` expired first.
    fn wait(&self, timeout: Duration) -> bool {
        let done = self.state();
        let (done, _) = self
            .cond
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|p| p.into_inner());
        *done
    }
}

struct IcpPacket {
    /// Request id the packet was configured with.
    request_id: u64,
    packet: SharedPacket,
    patch_map: Option<PatchMap>,
    done: Arc<Completion>,
}

#[derive(Default)]
struct PacketRing {
    capacity: usize,
    pending: VecDeque<IcpPacket>,
}

impl PacketRing {
    fn complete_all(&mut self) {
        for entry in self.pending.drain(..) {
            entry.done.complete_all();
        }
    }

    /// Newest cached patch map of any stored packet.
    fn any_patch_map(&self) -> Option<PatchMap> {
        self.pending
            .iter()
            .rev()
            .find_map(|entry| entry.patch_map.clone())
    }
}

#[derive(Default)]
struct IcpState {
    session: Option<i32>,
    hw: Option<AcquiredHw>,
    streaming: bool,
}

pub struct IcpContext {
    index: u8,
    config: IcpConfig,
    backend: Arc<dyn HardwareBackend>,
    queue: Arc<BufferSetQueue>,
    state: Mutex<IcpState>,
    ring: Mutex<PacketRing>,
    worker: EventWorker<HwEvent>,
}

impl IcpContext {
    /// Creates the context, its queue and its event worker. The context is
    /// registered as the queue's consumer.
    pub fn new(
        index: u8,
        config: IcpConfig,
        backend: Arc<dyn HardwareBackend>,
        memory: Arc<dyn MemoryManager>,
        chains: Arc<ChainAllocator>,
    ) -> Result<Arc<Self>> {
        let target: Arc<OnceLock<Weak<IcpContext>>> = Arc::default();
        let events = target.clone();
        let worker = EventWorker::spawn(format!("icp{index}-events"), move |event: HwEvent| {
            if let Some(ctx) = events.get().and_then(Weak::upgrade) {
                ctx.handle_event(event);
            }
        })?;

        let ctx = Arc::new_cyclic(|weak: &Weak<IcpContext>| {
            let _ = target.set(weak.clone());
            let consumer: Weak<dyn QueueConsumer> = weak.clone();
            IcpContext {
                index,
                config,
                backend,
                queue: BufferSetQueue::new(
                    format!("icp{index}"),
                    &config.queue,
                    memory,
                    chains,
                    Some(consumer),
                ),
                state: Mutex::new(IcpState::default()),
                ring: Mutex::new(PacketRing::default()),
                worker,
            }
        });
        Ok(ctx)
    }

    fn state(&self) -> MutexGuard<'_, IcpState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn ring(&self) -> MutexGuard<'_, PacketRing> {
        self.ring.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    /// Blocks until every hardware event raised so far has been handled.
    pub fn drain_events(&self) -> Result<()> {
        self.worker.drain()
    }

    /// Request ids of the stored packets, oldest first.
    pub fn ring_request_ids(&self) -> Vec<u64> {
        self.ring().pending.iter().map(|e| e.request_id).collect()
    }

    /// Cached patch map of the stored packet configured as `request_id`.
    pub fn patch_map(&self, request_id: u64) -> Option<PatchMap> {
        self.ring()
            .pending
            .iter()
            .rev()
            .find(|e| e.request_id == request_id)
            .and_then(|e| e.patch_map.clone())
    }

    fn enqueue_packet(&self, packet: SharedPacket) {
        let request_id = packet::lock(&packet).request_id();
        let mut ring = self.ring();
        if ring.pending.len() >= ring.capacity.max(1) {
            if let Some(old) = ring.pending.pop_front() {
                warn!(
                    "icp{}: packet ring full, evicting packet {}",
                    self.index, old.request_id
                );
                old.done.complete_all();
            }
        }
        ring.pending.push_back(IcpPacket {
            request_id,
            packet,
            patch_map: None,
            done: Completion::completed(),
        });
        debug!("icp{}: packet {request_id} stored", self.index);
    }

    fn config_stream(&self, ctx: u64, packet: &SharedPacket) -> Result<()> {
        let settings: ConfigPacket = packet::lock(packet).clone();
        debug!(
            "icp{}: stream settings packet {}",
            self.index,
            settings.request_id()
        );
        self.backend
            .generic_command(ctx, &HwCommand::StreamSettings(settings))
            .map(|_| ())
    }

    /// Processes queued buffer sets until one side runs out.
    pub fn process_pending(&self) -> Result<()> {
        loop {
            match self.try_process() {
                Ok(()) => continue,
                Err(FastpathError::Again) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Matches the next queued buffer set with a stored packet and submits
    /// it.
    ///
    /// # Errors
    ///
    /// `Again` when no packet or no buffer set is available or the context
    /// is not streaming. Any other error has already completed the set with
    /// error status.
    pub fn try_process(&self) -> Result<()> {
        let state = self.state();
        let Some(hw) = state.hw else {
            return Err(FastpathError::Again);
        };
        if !state.streaming || self.ring().pending.is_empty() {
            return Err(FastpathError::Again);
        }
        let Some(set) = self.queue.get_next() else {
            return Err(FastpathError::Again);
        };

        match self.submit(hw.ctx, &set) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("icp{}: req {} failed: {err}", self.index, set.request_id);
                self.fail(&set);
                Err(err)
            }
        }
    }

    fn fail(&self, set: &BufferSet) {
        if let Err(err) = self
            .queue
            .complete(set.request_id, BufferStatus::Error, 0, 0)
        {
            warn!("icp{}: complete req {}: {err}", self.index, set.request_id);
        }
    }

    fn submit(&self, ctx: u64, set: &BufferSet) -> Result<()> {
        if set.status == BufferStatus::Error {
            return Err(FastpathError::invalid("buffer set carries error status"));
        }

        let (packet, done, reused) = {
            let mut ring = self.ring();
            while ring.pending.len() > 1 && ring.pending[1].request_id <= set.request_id {
                if let Some(old) = ring.pending.pop_front() {
                    debug!("icp{}: packet {} superseded", self.index, old.request_id);
                    old.done.complete_all();
                }
            }
            let entry = ring.pending.front().ok_or(FastpathError::Again)?;
            (
                entry.packet.clone(),
                entry.done.clone(),
                entry.request_id != set.request_id,
            )
        };

        if reused && !done.wait(self.config.process_timeout) {
            error!(
                "icp{}: packet for req {} still busy after {:?}",
                self.index, set.request_id, self.config.process_timeout
            );
            return Err(FastpathError::Timeout(self.config.process_timeout));
        }
        if reused && !self.ring().pending.iter().any(|e| Arc::ptr_eq(&e.done, &done)) {
            return Err(FastpathError::hardware("packet flushed while waiting"));
        }

        done.reinit();
        let args = match self.patch_packet(&packet, set, reused) {
            Ok(args) => args,
            Err(err) => {
                done.complete_all();
                return Err(err);
            }
        };
        if let Err(err) = self.backend.apply_config(ctx, &args) {
            done.complete_all();
            return Err(err);
        }
        debug!(
            "icp{}: req {} submitted{}",
            self.index,
            set.request_id,
            if reused { " (reused packet)" } else { "" }
        );
        Ok(())
    }

    /// Rewrites the packet for `set` and returns the hardware arguments.
    fn patch_packet(
        &self,
        packet: &SharedPacket,
        set: &BufferSet,
        reused: bool,
    ) -> Result<ConfigArgs> {
        let mut ring = self.ring();
        let fallback = ring.any_patch_map();
        let entry = ring
            .pending
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.packet, packet));

        let mut pkt = packet::lock(packet);
        pkt.header.request_id = set.request_id;
        let port = |slot: usize| Some(slot as u32);
        bind_buffers(
            &mut pkt.io_configs,
            &set.inputs,
            set.in_mask,
            DirectionRule::Require(Direction::Input),
            port,
        )?;
        bind_buffers(
            &mut pkt.io_configs,
            &set.outputs,
            set.out_mask,
            DirectionRule::Require(Direction::Output),
            port,
        )?;

        let cfg = &mut *pkt;
        if !reused {
            match entry {
                Some(entry) if entry.patch_map.is_none() => {
                    entry.patch_map = Some(PatchMap::build(&cfg.io_configs, &cfg.patches)?);
                }
                Some(_) => {}
                None => {
                    PatchMap::build(&cfg.io_configs, &cfg.patches)?;
                }
            }
        } else {
            let map = match entry.and_then(|e| e.patch_map.clone()) {
                Some(map) => map,
                None => {
                    warn!("icp{}: no patch map for packet, using newest", self.index);
                    fallback.ok_or_else(|| FastpathError::invalid("no valid patch map"))?
                }
            };
            map.apply(&cfg.io_configs, &mut cfg.patches)?;
        }

        Ok(ConfigArgs {
            request_id: set.request_id,
            entries: Vec::new(),
            out_map: Vec::new(),
            init_packet: false,
            reapply: reused,
            packet: Some(cfg.clone()),
        })
    }

    fn on_done(&self, request_id: u64) {
        {
            let ring = self.ring();
            let entry = ring
                .pending
                .iter()
                .rev()
                .find(|e| packet::lock(&e.packet).request_id() == request_id);
            match entry {
                Some(entry) => entry.done.complete_all(),
                None => debug!("icp{}: no stored packet for req {request_id}", self.index),
            }
        }

        match self
            .queue
            .complete(request_id, BufferStatus::Success, 0, 0)
        {
            Ok(()) => debug!("icp{}: req {request_id} done", self.index),
            Err(err) => warn!("icp{}: buffer done req {request_id}: {err}", self.index),
        }
    }

    fn handle_event(&self, event: HwEvent) {
        match event {
            HwEvent::Done { request_id, .. } => self.on_done(request_id),
            HwEvent::Error { code } => error!("icp{}: hardware error {code:#x}", self.index),
            other => debug!("icp{}: {} ignored", self.index, other.name()),
        }
    }

    /// Drops every stored packet and wakes any submission waiting on one.
    /// Takes only the ring lock, which a waiter in `try_process` does not hold.
    fn flush_packets(&self) {
        let mut ring = self.ring();
        let dropped = ring.pending.len();
        ring.complete_all();
        if dropped > 0 {
            debug!("icp{}: flushed {dropped} packets", self.index);
        }
    }
}

impl QueueConsumer for IcpContext {
    fn buffer_queued(&self) -> Result<()> {
        self.process_pending()
    }

    fn flush(&self) -> Result<()> {
        self.flush_packets();
        Ok(())
    }
}

impl DeviceContext for IcpContext {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Icp
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
        cmd.validate(self.config.max_resources)?;
        let mut state = self.state();
        if state.hw.is_some() {
            return Err(FastpathError::invalid("device already acquired"));
        }

        let args = AcquireArgs {
            session_handle: cmd.session_handle,
            resources: cmd.resources.clone(),
            sink: Arc::new(self.worker.sender()),
        };
        let hw = self.backend.acquire(&args)?;
        state.hw = Some(hw);
        state.session = Some(cmd.session_handle);

        let mut ring = self.ring();
        ring.pending.clear();
        ring.capacity = self.config.packet_ring;
        self.queue.reopen();
        debug!(
            "icp{}: acquired hw ctx {}, ring of {}",
            self.index, hw.ctx, ring.capacity
        );
        Ok(())
    }

    fn acquire_hardware(&self, _cmd: &AcquireHardwareCmd) -> Result<AcquiredHwInfo> {
        let state = self.state();
        Ok(AcquiredHwInfo {
            hw_mask: state.hw.map(|hw| hw.hw_mask).unwrap_or_default(),
            context_type: 0,
        })
    }

    fn release_hardware(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        {
            let mut state = self.state();
            let hw = state.hw.ok_or(FastpathError::PermissionDenied)?;
            self.backend.start(hw.ctx, None)?;
            state.streaming = true;
            debug!("icp{}: started", self.index);
        }
        if let Err(err) = self.process_pending() {
            warn!("icp{}: queued sets after start: {err}", self.index);
        }
        Ok(())
    }

    fn stop(&self, mode: StopMode) -> Result<()> {
        let result = {
            let mut state = self.state();
            state.streaming = false;
            match state.hw {
                Some(hw) => self.backend.stop(hw.ctx, mode),
                None => Ok(()),
            }
        };
        if let Err(err) = &result {
            error!("icp{}: stop failed: {err}", self.index);
        }
        if let Err(err) = self.worker.drain() {
            warn!("icp{}: event drain: {err}", self.index);
        }
        self.queue.flush()?;
        result
    }

    fn configure(&self, packet: SharedPacket) -> Result<()> {
        let ctx = {
            let state = self.state();
            state.hw.map(|hw| hw.ctx).ok_or(FastpathError::PermissionDenied)?
        };

        let opcode = packet::lock(&packet).opcode();
        match opcode {
            ICP_OPCODE_IPE_SETTINGS | ICP_OPCODE_BPS_SETTINGS => self.config_stream(ctx, &packet),
            ICP_OPCODE_IPE_UPDATE | ICP_OPCODE_BPS_UPDATE => {
                self.enqueue_packet(packet);
                self.process_pending()
            }
            op => Err(FastpathError::invalid(format!("unsupported icp opcode {op}"))),
        }
    }

    fn flush(&self) -> Result<()> {
        self.queue.flush()
    }

    fn release_device(&self) -> Result<()> {
        {
            let mut state = self.state();
            if let Some(hw) = state.hw {
                self.backend.release(hw.ctx)?;
                state.hw = None;
            }
            state.streaming = false;
            state.session = None;
            self.ring().complete_all();
        }
        self.queue.flush()
    }
}
