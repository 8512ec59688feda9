// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Dispatch node: routes client commands to device contexts by handle and
//! gates them with each context's state machine.

use crate::{
    buffer::BufferSet,
    chain::{ChainLink, ProcessChain},
    context::{AcquireDeviceCmd, AcquireHardwareCmd, AcquiredHwInfo, DeviceContext, DeviceKind},
    error::{FastpathError, Result},
    handle::{DeviceHandle, HandleAllocator},
    hw::{HwCapability, StopMode},
    memory::MemoryManager,
    queue::BufferSetQueue,
    state::{Command, DeviceState, DeviceStateMachine},
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Control {
    dcsm: DeviceStateMachine,
    handle: Option<DeviceHandle>,
}

struct Slot {
    context: Arc<dyn DeviceContext>,
    control: Mutex<Control>,
}

impl Slot {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct DispatchNode {
    memory: Arc<dyn MemoryManager>,
    slots: Vec<Slot>,
    tokens: HandleAllocator,
}

impl DispatchNode {
    /// Builds a node over `contexts`. Each context's index must equal its
    /// position in the list.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a misplaced context or more than 256 contexts.
    pub fn new(
        memory: Arc<dyn MemoryManager>,
        contexts: Vec<Arc<dyn DeviceContext>>,
    ) -> Result<Self> {
        if contexts.len() > u8::MAX as usize + 1 {
            return Err(FastpathError::invalid("too many device contexts"));
        }
        let mut slots = Vec::with_capacity(contexts.len());
        for (position, context) in contexts.into_iter().enumerate() {
            if context.index() as usize != position {
                return Err(FastpathError::invalid(format!(
                    "{} context {} at position {position}",
                    context.kind(),
                    context.index()
                )));
            }
            slots.push(Slot {
                context,
                control: Mutex::new(Control::default()),
            });
        }
        Ok(DispatchNode {
            memory,
            slots,
            tokens: HandleAllocator::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// State of the context at `index`.
    pub fn state_of(&self, index: u8) -> Option<DeviceState> {
        self.slots
            .get(index as usize)
            .map(|slot| slot.control().dcsm.state())
    }

    pub fn state(&self, handle: DeviceHandle) -> Result<DeviceState> {
        let slot = self.slot(handle)?;
        let control = slot.control();
        Self::check_handle(&control, handle)?;
        Ok(control.dcsm.state())
    }

    pub fn context(&self, handle: DeviceHandle) -> Result<Arc<dyn DeviceContext>> {
        let slot = self.slot(handle)?;
        Self::check_handle(&slot.control(), handle)?;
        Ok(slot.context.clone())
    }

    fn slot(&self, handle: DeviceHandle) -> Result<&Slot> {
        self.slots
            .get(handle.context_id as usize)
            .ok_or_else(|| FastpathError::invalid(format!("handle {handle} out of range")))
    }

    fn check_handle(control: &Control, handle: DeviceHandle) -> Result<()> {
        if control.handle != Some(handle) {
            return Err(FastpathError::invalid(format!("stale device handle {handle}")));
        }
        Ok(())
    }

    /// Validates `handle`, checks `cmd` against the state machine, runs `f`
    /// and records the new state only if `f` succeeded.
    fn dispatch<R>(
        &self,
        handle: DeviceHandle,
        cmd: Command,
        f: impl FnOnce(&dyn DeviceContext) -> Result<R>,
    ) -> Result<R> {
        let slot = self.slot(handle)?;
        let mut control = slot.control();
        Self::check_handle(&control, handle)?;
        let target = control.dcsm.check(cmd)?;
        let reply = f(slot.context.as_ref())?;
        if let Some(target) = target {
            control.dcsm.commit(target);
        }
        Ok(reply)
    }

    pub fn query_capability(&self, kind: DeviceKind) -> Result<HwCapability> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.context.kind() == kind)
            .ok_or_else(|| FastpathError::invalid(format!("no {kind} context")))?;
        slot.context.query_capability()
    }

    /// Acquires the first idle context of `kind` and returns its handle.
    ///
    /// # Errors
    ///
    /// `Busy` when every context of `kind` is in use, or the context's
    /// acquire error.
    pub fn acquire_device(
        &self,
        kind: DeviceKind,
        cmd: &AcquireDeviceCmd,
    ) -> Result<DeviceHandle> {
        for slot in self.slots.iter().filter(|s| s.context.kind() == kind) {
            let mut control = slot.control();
            if control.dcsm.state() != DeviceState::Init {
                continue;
            }
            let Some(target) = control.dcsm.check(Command::AcquireDevice)? else {
                continue;
            };
            let handle = DeviceHandle::stamp(slot.context.index(), self.tokens.next_token())?;
            slot.context.acquire_device(cmd)?;
            control.handle = Some(handle);
            control.dcsm.commit(target);
            info!("{kind} context {} acquired as {handle}", slot.context.index());
            return Ok(handle);
        }
        debug!("no idle {kind} context");
        Err(FastpathError::Busy)
    }

    pub fn acquire_hardware(
        &self,
        handle: DeviceHandle,
        cmd: &AcquireHardwareCmd,
    ) -> Result<AcquiredHwInfo> {
        self.dispatch(handle, Command::AcquireHardware, |ctx| {
            ctx.acquire_hardware(cmd)
        })
    }

    pub fn release_hardware(&self, handle: DeviceHandle) -> Result<()> {
        self.dispatch(handle, Command::ReleaseHardware, |ctx| ctx.release_hardware())
    }

    pub fn start(&self, handle: DeviceHandle) -> Result<()> {
        self.dispatch(handle, Command::Start, |ctx| ctx.start())
    }

    pub fn stop(&self, handle: DeviceHandle) -> Result<()> {
        self.dispatch(handle, Command::Stop, |ctx| {
            ctx.stop(StopMode::AtFrameBoundary)
        })
    }

    /// Configures the device with the packet at `offset` in the buffer
    /// behind `packet_handle`.
    pub fn configure(&self, handle: DeviceHandle, packet_handle: i32, offset: usize) -> Result<()> {
        self.dispatch(handle, Command::Configure, |ctx| {
            let packet = self.memory.packet(packet_handle, offset)?;
            ctx.configure(packet)
        })
    }

    pub fn flush(&self, handle: DeviceHandle) -> Result<()> {
        self.dispatch(handle, Command::Flush, |ctx| ctx.flush())
    }

    pub fn release_device(&self, handle: DeviceHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        let mut control = slot.control();
        Self::check_handle(&control, handle)?;
        let target = control
            .dcsm
            .check(Command::ReleaseDevice)?
            .unwrap_or(DeviceState::Init);
        slot.context.release_device()?;
        control.dcsm.commit(target);
        control.handle = None;
        info!("{} context {} released", slot.context.kind(), handle.context_id);
        Ok(())
    }

    pub fn enqueue_buffer_set(&self, handle: DeviceHandle, set: &BufferSet) -> Result<()> {
        self.dispatch(handle, Command::Enqueue, |ctx| ctx.queue().enqueue(set))
    }

    /// Takes the oldest completed set of the device.
    ///
    /// # Errors
    ///
    /// `Again` when nothing has completed yet.
    pub fn dequeue_buffer_set(&self, handle: DeviceHandle) -> Result<BufferSet> {
        self.dispatch(handle, Command::Dequeue, |ctx| ctx.queue().dequeue_done())
    }

    /// Waits up to `timeout` for a completed set.
    pub fn wait_buffer_set(&self, handle: DeviceHandle, timeout: Duration) -> Result<BufferSet> {
        let queue = self.dispatch(handle, Command::Dequeue, |ctx| Ok(ctx.queue().clone()))?;
        if !queue.wait_done(timeout) {
            return Err(FastpathError::Again);
        }
        queue.dequeue_done()
    }

    /// Submits `links` as one chain. Link 0 is enqueued now; each later link
    /// is enqueued on its device when the previous one completes.
    pub fn enqueue_chain(&self, links: &[(DeviceHandle, BufferSet)]) -> Result<()> {
        let mut queues: Vec<Arc<BufferSetQueue>> = Vec::with_capacity(links.len());
        for (handle, _) in links {
            let queue = self.dispatch(*handle, Command::Enqueue, |ctx| Ok(ctx.queue().clone()))?;
            queues.push(queue);
        }
        let Some(first) = queues.first().cloned() else {
            return Err(FastpathError::invalid("empty chain"));
        };
        if queues
            .iter()
            .any(|q| !Arc::ptr_eq(q.chains(), first.chains()))
        {
            return Err(FastpathError::invalid("chain spans chain allocators"));
        }

        let first_set = links[0].1;
        if links.len() == 1 {
            return first.enqueue(&first_set);
        }
        let chain = ProcessChain::new(
            queues
                .iter()
                .zip(links)
                .map(|(queue, (_, set))| ChainLink::new(queue, *set))
                .collect(),
        )?;
        let id = first.chains().alloc(chain)?;
        debug!("chain {:?} of {} links submitted", id, links.len());
        first.enqueue_with_chain(&first_set, Some(id))
    }

    /// Walks every acquired context back to `INIT` along legal transitions
    /// and closes its queue. Errors are logged and do not stop the walk.
    pub fn shutdown(&self) -> Result<()> {
        let mut failures = 0;
        for slot in &self.slots {
            let mut control = slot.control();
            let ctx = slot.context.as_ref();
            let index = ctx.index();

            loop {
                let state = control.dcsm.state();
                let step = |state| match state {
                    DeviceState::Init => None,
                    DeviceState::Started => Some((Command::Stop, ctx.stop(StopMode::Immediately))),
                    DeviceState::Stopped | DeviceState::AcquiredHardware => {
                        Some((Command::ReleaseHardware, ctx.release_hardware()))
                    }
                    DeviceState::AcquiredDevice => {
                        Some((Command::ReleaseDevice, ctx.release_device()))
                    }
                };
                let Some((cmd, mut result)) = step(state) else {
                    break;
                };
                // a failed release keeps the binding, give it one more try
                if result.is_err() && cmd != Command::Stop {
                    if let Some((_, retry)) = step(state) {
                        result = retry;
                    }
                }
                if let Err(err) = result {
                    failures += 1;
                    warn!("{} context {index}: {:?} during shutdown: {err}", ctx.kind(), cmd);
                }
                match control.dcsm.check(cmd) {
                    Ok(Some(target)) => control.dcsm.commit(target),
                    _ => {
                        error!("{} context {index}: stuck in {state}", ctx.kind());
                        control.dcsm.reset();
                    }
                }
            }
            control.handle = None;

            if let Err(err) = ctx.queue().shutdown() {
                failures += 1;
                warn!("{} context {index}: queue shutdown: {err}", ctx.kind());
            }
        }
        if failures > 0 {
            warn!("shutdown finished with {failures} errors");
        } else {
            info!("shutdown finished");
        }
        Ok(())
    }
}
