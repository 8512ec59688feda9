// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Software accelerator implementing [`HardwareBackend`].
//!
//! `SimBackend` records every call, can fail any operation once on request,
//! and models the frame timeline of the accelerator: a configuration applied
//! during one frame is the one the hardware runs for the next frame.
//!
//! ```text
//! start(init) ... frame_start: SOF + EPOCH ... frame_end: DONE ...
//! ```

use crate::{
    error::{FastpathError, Result},
    hw::{
        AcquireArgs, AcquiredHw, ConfigArgs, FenceMapEntry, HardwareBackend, HwCapability,
        HwCommand, HwCommandReply, HwContextId, HwEvent, HwEventSink, HwUpdateEntry,
        PacketOpcode, PreparedUpdate, StopMode,
    },
    packet::{ConfigPacket, Direction, ISP_PACKET_INIT_DEV},
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, trace};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimFlavor {
    Isp,
    Icp,
}

/// Operations that can be made to fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HwOp {
    Acquire,
    Release,
    Start,
    Stop,
    Prepare,
    Apply,
    Generic,
}

/// One recorded back-end call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwCall {
    Acquire { session: i32, resources: usize },
    Release { ctx: HwContextId },
    Start { ctx: HwContextId, init: Option<u64> },
    Stop { ctx: HwContextId, mode: StopMode },
    Prepare { ctx: HwContextId, request_id: u64 },
    Apply { ctx: HwContextId, request_id: u64, reapply: bool },
    QueryCapability,
    Generic { ctx: HwContextId, cmd: HwCommand },
}

#[derive(Default)]
struct SimState {
    next_ctx: HwContextId,
    sinks: HashMap<HwContextId, Arc<dyn HwEventSink>>,
    calls: Vec<HwCall>,
    failures: HashSet<HwOp>,
    /// Configurations waiting for their frame.
    applied: VecDeque<ConfigArgs>,
    /// Configuration of the frame in progress.
    current: Option<ConfigArgs>,
    auto_complete: bool,
}

impl SimState {
    fn check(&mut self, op: HwOp) -> Result<()> {
        if self.failures.remove(&op) {
            debug!("sim: injected {:?} failure", op);
            return Err(FastpathError::hardware(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

pub struct SimBackend {
    flavor: SimFlavor,
    state: Mutex<SimState>,
}

impl SimBackend {
    pub fn new(flavor: SimFlavor) -> Self {
        SimBackend {
            flavor,
            state: Mutex::new(SimState {
                next_ctx: 1,
                ..Default::default()
            }),
        }
    }

    pub fn isp() -> Self {
        Self::new(SimFlavor::Isp)
    }

    /// ICP flavour. With `auto_complete` every submission raises its DONE
    /// right away.
    pub fn icp(auto_complete: bool) -> Self {
        let sim = Self::new(SimFlavor::Icp);
        sim.state().auto_complete = auto_complete;
        sim
    }

    pub fn flavor(&self) -> SimFlavor {
        self.flavor
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Makes the next call of `op` fail with a hardware error.
    pub fn fail_next(&self, op: HwOp) {
        self.state().failures.insert(op);
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.state().auto_complete = on;
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.state().calls.clone()
    }

    /// Request ids passed to `apply_config`, in call order.
    pub fn applied_requests(&self) -> Vec<u64> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                HwCall::Apply { request_id, .. } => Some(*request_id),
                _ => None,
            })
            .collect()
    }

    /// Configurations applied but not yet run.
    pub fn queued_configs(&self) -> usize {
        self.state().applied.len()
    }

    /// Delivers `event` to every registered sink.
    pub fn raise(&self, event: HwEvent) -> Result<()> {
        let sinks: Vec<Arc<dyn HwEventSink>> = self.state().sinks.values().cloned().collect();
        trace!("sim: {} to {} sinks", event.name(), sinks.len());
        for sink in sinks {
            sink.on_event(event.clone())?;
        }
        Ok(())
    }

    /// Starts a frame: the oldest applied configuration becomes current, then
    /// SOF and EPOCH are raised.
    pub fn frame_start(&self, boot_time: u64) -> Result<()> {
        {
            let mut state = self.state();
            state.current = state.applied.pop_front();
        }
        self.raise(HwEvent::Sof { boot_time })?;
        self.raise(HwEvent::Epoch)
    }

    /// Ends the current frame with a DONE for its outputs. Frames without
    /// output fences raise nothing.
    pub fn frame_end(&self) -> Result<()> {
        let current = match self.flavor {
            SimFlavor::Isp => self.state().current.take(),
            SimFlavor::Icp => self.state().applied.pop_front(),
        };
        let Some(config) = current else {
            return Ok(());
        };
        if self.flavor == SimFlavor::Isp && config.out_map.is_empty() {
            return Ok(());
        }
        self.raise(HwEvent::Done {
            request_id: config.request_id,
            handles: config.out_map.iter().map(|f| f.resource_handle).collect(),
        })
    }

    fn fences(packet: &ConfigPacket, direction: Direction) -> Vec<FenceMapEntry> {
        packet
            .io_configs
            .iter()
            .filter(|io| io.direction == direction)
            .map(|io| FenceMapEntry {
                resource_handle: io.resource_type,
                sync_id: io.mem_handle[0],
            })
            .collect()
    }
}

impl HardwareBackend for SimBackend {
    fn acquire(&self, args: &AcquireArgs) -> Result<AcquiredHw> {
        let mut state = self.state();
        state.calls.push(HwCall::Acquire {
            session: args.session_handle,
            resources: args.resources.len(),
        });
        state.check(HwOp::Acquire)?;
        let ctx = state.next_ctx;
        state.next_ctx += 1;
        state.sinks.insert(ctx, args.sink.clone());
        Ok(AcquiredHw {
            ctx,
            hw_mask: match self.flavor {
                SimFlavor::Isp => 0x1,
                SimFlavor::Icp => 0x6,
            },
        })
    }

    fn release(&self, ctx: HwContextId) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HwCall::Release { ctx });
        state.check(HwOp::Release)?;
        state.sinks.remove(&ctx);
        state.applied.clear();
        state.current = None;
        Ok(())
    }

    fn start(&self, ctx: HwContextId, init: Option<&ConfigArgs>) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HwCall::Start {
            ctx,
            init: init.map(|args| args.request_id),
        });
        state.check(HwOp::Start)?;
        if let Some(init) = init {
            state.applied.push_back(init.clone());
        }
        Ok(())
    }

    fn stop(&self, ctx: HwContextId, mode: StopMode) -> Result<()> {
        let mut state = self.state();
        state.calls.push(HwCall::Stop { ctx, mode });
        state.check(HwOp::Stop)?;
        state.applied.clear();
        state.current = None;
        Ok(())
    }

    fn prepare_update(&self, ctx: HwContextId, packet: &ConfigPacket) -> Result<PreparedUpdate> {
        let mut state = self.state();
        state.calls.push(HwCall::Prepare {
            ctx,
            request_id: packet.request_id(),
        });
        state.check(HwOp::Prepare)?;
        let opcode = match (self.flavor, packet.opcode()) {
            (SimFlavor::Isp, ISP_PACKET_INIT_DEV) => PacketOpcode::Init,
            _ => PacketOpcode::Update,
        };
        Ok(PreparedUpdate {
            opcode,
            entries: packet
                .cmd_buffers
                .iter()
                .map(|cmd| HwUpdateEntry {
                    handle: cmd.mem_handle,
                    offset: cmd.offset,
                    len: cmd.length,
                })
                .collect(),
            fence_out: Self::fences(packet, Direction::Output),
            fence_in: Self::fences(packet, Direction::Input),
        })
    }

    fn apply_config(&self, ctx: HwContextId, args: &ConfigArgs) -> Result<()> {
        let done = {
            let mut state = self.state();
            state.calls.push(HwCall::Apply {
                ctx,
                request_id: args.request_id,
                reapply: args.reapply,
            });
            state.check(HwOp::Apply)?;
            if state.auto_complete {
                Some(args.request_id)
            } else {
                state.applied.push_back(args.clone());
                None
            }
        };
        match done {
            Some(request_id) => self.raise(HwEvent::Done {
                request_id,
                handles: Vec::new(),
            }),
            None => Ok(()),
        }
    }

    fn query_capability(&self) -> Result<HwCapability> {
        self.state().calls.push(HwCall::QueryCapability);
        Ok(HwCapability {
            version: 1,
            num_devices: 1,
            max_resources: 16,
        })
    }

    fn generic_command(&self, ctx: HwContextId, cmd: &HwCommand) -> Result<HwCommandReply> {
        let mut state = self.state();
        state.calls.push(HwCall::Generic {
            ctx,
            cmd: cmd.clone(),
        });
        state.check(HwOp::Generic)?;
        Ok(match cmd {
            HwCommand::ContextType => HwCommandReply::ContextType(match self.flavor {
                SimFlavor::Isp => 1,
                SimFlavor::Icp => 2,
            }),
            HwCommand::StreamSettings(_) => HwCommandReply::Ack,
        })
    }
}
