// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Camera Fastpath Library
//!
//! This library schedules per-frame buffer sets through camera accelerators.
//! Clients submit buffer sets and configuration packets; device contexts
//! match them, program the hardware through a [`hw::HardwareBackend`] and
//! return completed sets in order.
//!
//! ## Features
//!
//! - **Buffer-Set Queue**: bounded free/pending/processing/done queue with
//!   cache maintenance and chain hand-off ([`queue`], [`chain`]).
//! - **Lifecycle Gate**: per-handle state machine checked before every
//!   client command ([`state`], [`node`]).
//! - **ISP Context**: init-packet merging, packet reuse across frames and
//!   discard-oldest overrun recovery driven by SOF/EPOCH/DONE ([`isp`]).
//! - **ICP Context**: packet ring with patch-map replay and a bounded wait
//!   before a reused packet is rewritten ([`icp`]).
//! - **Simulated Accelerator**: [`sim::SimBackend`] models the frame
//!   timeline for the daemon, tests and benchmarks.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_fastpath::{
//!     buffer::{BufferDescriptor, BufferSet},
//!     chain::ChainAllocator,
//!     config::QueueConfig,
//!     memory::MemoryRegistry,
//!     queue::BufferSetQueue,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let memory = Arc::new(MemoryRegistry::new());
//! let chains = Arc::new(ChainAllocator::default());
//! let queue = BufferSetQueue::new("demo", &QueueConfig::default(), memory.clone(), chains, None);
//!
//! let buf = memory.register_host(4096);
//! queue.enqueue(&BufferSet::new(1).with_output(0, BufferDescriptor::single(buf)))?;
//! let set = queue.get_next().expect("pending set");
//! queue.complete(set.request_id, set.status, 1_000, 1)?;
//! assert_eq!(queue.dequeue_done()?.request_id, 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! Every device context owns one event worker thread. Hardware events are
//! handled there in the order they were raised; client commands run on the
//! caller's thread under the context lock.

pub mod buffer;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod hw;
pub mod icp;
pub mod isp;
pub mod memory;
pub mod node;
pub mod packet;
pub mod patch;
pub mod queue;
pub mod sim;
pub mod state;
pub mod worker;

pub use error::{FastpathError, Result};
