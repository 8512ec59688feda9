// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_fastpath::{
    config::{IcpConfig, IspConfig, Tuning},
    FastpathError,
};
use std::{path::PathBuf, time::Duration};
use tracing_subscriber::filter::LevelFilter;

/// Command-line arguments for the EdgeFirst Fastpath daemon.
///
/// The daemon drives an ISP and an ICP context on the simulated accelerator
/// at sensor frame rate. Arguments can be specified via command line or
/// environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-fastpath --fps 60 --frames 600 --chain
///
/// # Via environment variables
/// export FPS=60
/// export QUEUE_DEPTH=8
/// edgefirst-fastpath
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Simulated sensor frame rate
    #[arg(long, env = "FPS", default_value = "30")]
    pub fps: u32,

    /// Frames to stream before tearing down (0 streams forever)
    #[arg(long, env = "FRAMES", default_value = "300")]
    pub frames: u64,

    /// Buffer-set slots per device queue
    #[arg(long, env = "QUEUE_DEPTH", default_value = "16")]
    pub queue_depth: usize,

    /// Bound on the ICP wait for a reused packet, in milliseconds
    #[arg(long, env = "PROCESS_TIMEOUT_MS", default_value = "30")]
    pub process_timeout_ms: u64,

    /// Route every ISP output through the ICP as a process chain
    #[arg(long, env = "CHAIN")]
    pub chain: bool,

    /// JSON tuning file overriding queue and recycle parameters
    #[arg(long, env = "TUNING")]
    pub tuning: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub rust_log: LevelFilter,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tokio async runtime console for debugging
    #[arg(long, env = "TOKIO_CONSOLE")]
    pub tokio_console: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,

    /// Log every completed buffer set
    #[arg(short, long)]
    pub verbose: bool,
}

/// Context configuration derived from [`Args`] and the tuning file.
#[derive(Copy, Clone, Debug)]
pub struct PipelineConfig {
    pub isp: IspConfig,
    pub icp: IcpConfig,
}

impl TryFrom<&Args> for PipelineConfig {
    type Error = FastpathError;

    fn try_from(args: &Args) -> Result<Self, Self::Error> {
        let mut isp = IspConfig::default();
        let mut icp = IcpConfig::default();
        isp.queue.depth = args.queue_depth;
        icp.queue.depth = args.queue_depth;
        icp.process_timeout = Duration::from_millis(args.process_timeout_ms);

        if let Some(path) = &args.tuning {
            let tuning = Tuning::from_path(path)?;
            tuning.apply_isp(&mut isp);
            tuning.apply_icp(&mut icp);
        }
        Ok(PipelineConfig { isp, icp })
    }
}
