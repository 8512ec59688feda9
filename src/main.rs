// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::{Args, PipelineConfig};
use clap::Parser;
use edgefirst_fastpath::{
    buffer::{BufferDescriptor, BufferSet, BufferStatus},
    chain::ChainAllocator,
    context::{AcquireDeviceCmd, AcquireHardwareCmd, DeviceContext, DeviceKind},
    error::FastpathError,
    handle::DeviceHandle,
    hw::HwResource,
    icp::IcpContext,
    isp::IspContext,
    memory::MemoryRegistry,
    node::DispatchNode,
    packet::{
        ConfigPacket, Direction, IoConfig, ICP_OPCODE_IPE_UPDATE, ISP_PACKET_INIT_DEV,
        ISP_PACKET_UPDATE_DEV,
    },
    sim::SimBackend,
};
use std::{
    error::Error,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer};

/// Buffers cycled through the pipeline. Request 1 uses the buffers the
/// packets were built with.
const FRAME_BUFFERS: usize = 4;
const FRAME_BYTES: usize = 1920 * 1080 * 3 / 2;

/// ISP full-resolution output port, bound by output slot 0.
const ISP_FULL_PORT: u32 = 0x3000;
const ICP_INPUT_SLOT: usize = 0;
const ICP_OUTPUT_SLOT: usize = 8;

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = args.rust_log;
    let stdout_log = tracing_subscriber::fmt::layer().with_filter(level);

    let journald = if args.journald {
        match tracing_journald::layer() {
            Ok(layer) => Some(layer.with_filter(level)),
            Err(err) => {
                eprintln!("journald unavailable: {err}");
                None
            }
        }
    } else {
        None
    };

    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default().with_filter(level))
    } else {
        None
    };

    let console = args
        .tokio_console
        .then(|| console_subscriber::ConsoleLayer::builder().spawn());

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn update_fps(prev: &mut Instant, history: &mut [i64], index: &mut usize) -> i64 {
    let now = Instant::now();

    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1e9 as i64 / (elapsed.as_nanos() as i64).max(1);
    *index = (*index + 1) % history.len();

    (history.iter().sum::<i64>() as f64 / history.len() as f64).round() as i64
}

struct Pipeline {
    node: DispatchNode,
    isp_hw: Arc<SimBackend>,
    isp: DeviceHandle,
    icp: DeviceHandle,
    isp_out: Vec<i32>,
    icp_out: Vec<i32>,
    chain: bool,
}

impl Pipeline {
    fn new(args: &Args, config: PipelineConfig) -> Result<Self, Box<dyn Error>> {
        let memory = Arc::new(MemoryRegistry::new());
        let chains = Arc::new(ChainAllocator::default());
        let isp_hw = Arc::new(SimBackend::isp());
        let icp_hw = Arc::new(SimBackend::icp(true));

        let isp_ctx = IspContext::new(
            0,
            config.isp,
            isp_hw.clone(),
            memory.clone(),
            chains.clone(),
        )?;
        let icp_ctx = IcpContext::new(1, config.icp, icp_hw, memory.clone(), chains)?;
        let contexts: Vec<Arc<dyn DeviceContext>> = vec![isp_ctx, icp_ctx];
        let node = DispatchNode::new(memory.clone(), contexts)?;

        let isp_out: Vec<i32> = (0..FRAME_BUFFERS)
            .map(|_| memory.register_host(FRAME_BYTES))
            .collect();
        let icp_out: Vec<i32> = (0..FRAME_BUFFERS)
            .map(|_| memory.register_host(FRAME_BYTES))
            .collect();
        let cmd_buf = memory.register_host(4096);

        let isp = node.acquire_device(DeviceKind::Isp, &AcquireDeviceCmd::deferred(1))?;
        let resources = vec![HwResource::default()];
        let hw = node.acquire_hardware(isp, &AcquireHardwareCmd::v2(resources))?;
        info!("isp hardware mask {:#x} type {}", hw.hw_mask, hw.context_type);

        let (init, offset) = memory.register_packet(
            ConfigPacket::new(0, ISP_PACKET_INIT_DEV).with_cmd_buffer(cmd_buf, 256),
        );
        node.configure(isp, init, offset)?;
        let (update, offset) = memory.register_packet(
            ConfigPacket::new(1, ISP_PACKET_UPDATE_DEV)
                .with_cmd_buffer(cmd_buf, 128)
                .with_io(IoConfig::new(ISP_FULL_PORT, Direction::Output, isp_out[0])),
        );
        node.configure(isp, update, offset)?;

        let icp = node.acquire_device(
            DeviceKind::Icp,
            &AcquireDeviceCmd::with_resources(2, Vec::new()),
        )?;
        node.acquire_hardware(icp, &AcquireHardwareCmd::v2(Vec::new()))?;
        let (update, offset) = memory.register_packet(
            ConfigPacket::new(1, ICP_OPCODE_IPE_UPDATE)
                .with_cmd_buffer(cmd_buf, 512)
                .with_io(IoConfig::new(ICP_INPUT_SLOT as u32, Direction::Input, isp_out[0]))
                .with_io(IoConfig::new(ICP_OUTPUT_SLOT as u32, Direction::Output, icp_out[0]))
                .with_patch(cmd_buf, isp_out[0])
                .with_patch(cmd_buf, icp_out[0]),
        );
        node.configure(icp, update, offset)?;

        node.start(isp)?;
        node.start(icp)?;

        Ok(Pipeline {
            node,
            isp_hw,
            isp,
            icp,
            isp_out,
            icp_out,
            chain: args.chain,
        })
    }

    /// Handle whose done queue receives finished frames.
    fn sink(&self) -> DeviceHandle {
        if self.chain {
            self.icp
        } else {
            self.isp
        }
    }

    fn submit(&self, request_id: u64) -> Result<(), FastpathError> {
        let k = (request_id as usize - 1) % FRAME_BUFFERS;
        let isp_set = BufferSet::new(request_id)
            .with_output(0, BufferDescriptor::single(self.isp_out[k]).cached());
        if !self.chain {
            return self.node.enqueue_buffer_set(self.isp, &isp_set);
        }
        let icp_set = BufferSet::new(request_id)
            .with_input(ICP_INPUT_SLOT, BufferDescriptor::single(self.isp_out[k]).cached())
            .with_output(ICP_OUTPUT_SLOT, BufferDescriptor::single(self.icp_out[k]).cached());
        self.node
            .enqueue_chain(&[(self.isp, isp_set), (self.icp, icp_set)])
    }

    /// Dequeues every finished frame. Returns (completed, failed).
    fn collect(&self, verbose: bool) -> (u64, u64) {
        let (mut ok, mut failed) = (0, 0);
        loop {
            match self.node.dequeue_buffer_set(self.sink()) {
                Ok(set) => {
                    if set.status == BufferStatus::Success {
                        ok += 1;
                    } else {
                        failed += 1;
                    }
                    if verbose {
                        info!("{set}");
                    }
                }
                Err(FastpathError::Again) => break,
                Err(err) => {
                    warn!("dequeue failed: {err}");
                    break;
                }
            }
        }
        (ok, failed)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;
    let config = PipelineConfig::try_from(&args)?;
    info!(
        "EdgeFirst Fastpath: {} fps, queue depth {}, chain {}",
        args.fps, config.isp.queue.depth, args.chain
    );

    let pipeline = Pipeline::new(&args, config)?;
    let epoch = Instant::now();
    let fps = args.fps.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / fps as f64));

    let mut prev = Instant::now();
    let mut history = vec![0; fps as usize];
    let mut index = 0;
    let (mut completed, mut failed, mut dropped) = (0u64, 0u64, 0u64);

    // Two extra frames let the last submissions drain through the hardware.
    let total = if args.frames == 0 { u64::MAX } else { args.frames + 2 };
    for frame in 0..total {
        interval.tick().await;
        let _span = info_span!("frame", frame).entered();

        if args.frames == 0 || frame < args.frames {
            match pipeline.submit(frame + 1) {
                Ok(()) => {}
                Err(FastpathError::Busy) => {
                    dropped += 1;
                    debug!("frame {frame} dropped, queue full");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let boot_time = epoch.elapsed().as_nanos() as u64;
        pipeline.isp_hw.frame_start(boot_time)?;
        pipeline.isp_hw.frame_end()?;

        let (ok, err) = pipeline.collect(args.verbose);
        completed += ok;
        failed += err;

        let fps = update_fps(&mut prev, &mut history, &mut index);
        if index == 0 {
            info!("fps {fps} completed {completed} failed {failed} dropped {dropped}");
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let (ok, err) = pipeline.collect(args.verbose);
    completed += ok;
    failed += err;

    pipeline.node.shutdown()?;
    info!("done: completed {completed} failed {failed} dropped {dropped}");
    Ok(())
}
