// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use common::{icp_set, icp_update, Rig};
use edgefirst_fastpath::{
    buffer::BufferStatus,
    config::{IcpConfig, IspConfig},
    context::DeviceContext,
    packet::{self, ConfigPacket, ICP_OPCODE_IPE_SETTINGS},
    sim::HwCall,
    FastpathError,
};
use serial_test::serial;
use std::{
    error::Error,
    time::{Duration, Instant},
};

#[test]
fn test_patch_map_built_on_first_match() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let (input, output) = (rig.buffer(), rig.buffer());
    let (icp, _packet) = rig.start_icp(7, input, output)?;

    rig.node.enqueue_buffer_set(icp, &icp_set(7, input, output))?;
    rig.icp.drain_events()?;

    let map = rig.icp.patch_map(7).ok_or("no patch map for request 7")?;
    println!("{map:?}");
    assert!(map.covers(2));
    assert_eq!(map.entries().len(), 2);

    let done = rig.node.dequeue_buffer_set(icp)?;
    assert_eq!((done.request_id, done.status), (7, BufferStatus::Success));
    Ok(())
}

#[test]
fn test_reused_packet_follows_new_buffers() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let (input, output) = (rig.buffer(), rig.buffer());
    let (icp, packet) = rig.start_icp(7, input, output)?;

    rig.node.enqueue_buffer_set(icp, &icp_set(7, input, output))?;
    rig.icp.drain_events()?;
    let map = rig.icp.patch_map(7).ok_or("no patch map for request 7")?;

    let (next_in, next_out) = (rig.buffer(), rig.buffer());
    rig.node
        .enqueue_buffer_set(icp, &icp_set(8, next_in, next_out))?;
    rig.icp.drain_events()?;

    assert_eq!(rig.icp.patch_map(7), Some(map));
    {
        let pkt = packet::lock(&packet);
        assert_eq!(pkt.request_id(), 8);
        let sources: Vec<i32> = pkt.patches.iter().map(|p| p.src_buf_hdl).collect();
        assert_eq!(sources, vec![next_in, next_out]);
        assert_eq!(pkt.io_configs[0].mem_handle[0], next_in);
        assert_eq!(pkt.io_configs[1].mem_handle[0], next_out);
    }

    let applies: Vec<(u64, bool)> = rig
        .icp_hw
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            HwCall::Apply {
                request_id,
                reapply,
                ..
            } => Some((request_id, reapply)),
            _ => None,
        })
        .collect();
    assert_eq!(applies, vec![(7, false), (8, true)]);

    assert_eq!(rig.node.dequeue_buffer_set(icp)?.request_id, 7);
    assert_eq!(rig.node.dequeue_buffer_set(icp)?.request_id, 8);
    Ok(())
}

#[test]
fn test_newer_packet_supersedes() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let (input, output) = (rig.buffer(), rig.buffer());
    let (icp, _) = rig.start_icp(1, input, output)?;
    rig.configure(icp, icp_update(5, rig.cmd_buf, input, output))?;
    assert_eq!(rig.icp.ring_request_ids(), vec![1, 5]);

    rig.node.enqueue_buffer_set(icp, &icp_set(5, input, output))?;
    rig.icp.drain_events()?;
    assert_eq!(rig.icp.ring_request_ids(), vec![5]);
    assert!(rig.icp.patch_map(5).is_some());
    Ok(())
}

#[test]
fn test_ring_evicts_oldest() -> Result<(), Box<dyn Error>> {
    let rig = Rig::new(
        IspConfig::default(),
        IcpConfig {
            packet_ring: 2,
            ..Default::default()
        },
        true,
    );
    let (input, output) = (rig.buffer(), rig.buffer());
    let icp = rig.acquire_icp()?;
    for rid in 1..=3 {
        rig.configure(icp, icp_update(rid, rig.cmd_buf, input, output))?;
    }
    assert_eq!(rig.icp.ring_request_ids(), vec![2, 3]);
    Ok(())
}

#[test]
fn test_stream_settings_bypass_ring() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let icp = rig.acquire_icp()?;
    rig.configure(icp, ConfigPacket::new(3, ICP_OPCODE_IPE_SETTINGS))?;

    assert!(rig.icp.ring_request_ids().is_empty());
    assert!(rig
        .icp_hw
        .calls()
        .iter()
        .any(|call| matches!(call, HwCall::Generic { .. })));

    assert!(matches!(
        rig.configure(icp, ConfigPacket::new(3, 0x7f)),
        Err(FastpathError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn test_sets_wait_for_streaming() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let (input, output) = (rig.buffer(), rig.buffer());
    let icp = rig.acquire_icp()?;
    rig.configure(icp, icp_update(1, rig.cmd_buf, input, output))?;

    rig.node.enqueue_buffer_set(icp, &icp_set(1, input, output))?;
    assert_eq!(rig.icp.queue().counts().pending, 1);
    assert!(rig.icp_hw.applied_requests().is_empty());

    rig.node.start(icp)?;
    rig.icp.drain_events()?;
    assert_eq!(rig.icp_hw.applied_requests(), vec![1]);
    assert_eq!(rig.node.dequeue_buffer_set(icp)?.request_id, 1);
    Ok(())
}

#[test]
fn test_unmatched_patch_fails_set() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let (input, output, stray) = (rig.buffer(), rig.buffer(), rig.buffer());
    let icp = rig.acquire_icp()?;
    rig.configure(
        icp,
        icp_update(1, rig.cmd_buf, input, output).with_patch(rig.cmd_buf, stray),
    )?;
    rig.node.start(icp)?;

    assert!(matches!(
        rig.node.enqueue_buffer_set(icp, &icp_set(1, input, output)),
        Err(FastpathError::InvalidArgument(_))
    ));
    let failed = rig.node.dequeue_buffer_set(icp)?;
    assert_eq!((failed.request_id, failed.status), (1, BufferStatus::Error));
    assert!(rig.icp_hw.applied_requests().is_empty());
    Ok(())
}

#[test]
#[serial]
fn test_reuse_wait_is_bounded() -> Result<(), Box<dyn Error>> {
    let timeout = Duration::from_millis(100);
    let rig = Rig::new(
        IspConfig::default(),
        IcpConfig {
            process_timeout: timeout,
            ..Default::default()
        },
        false,
    );
    let (input, output) = (rig.buffer(), rig.buffer());
    let (icp, _) = rig.start_icp(7, input, output)?;

    rig.node.enqueue_buffer_set(icp, &icp_set(7, input, output))?;
    assert_eq!(rig.icp_hw.queued_configs(), 1);

    let start = Instant::now();
    let result = rig
        .node
        .enqueue_buffer_set(icp, &icp_set(8, rig.buffer(), rig.buffer()));
    let waited = start.elapsed();
    println!("reuse wait {waited:?}");

    assert_eq!(result, Err(FastpathError::Timeout(timeout)));
    assert!(waited >= timeout, "returned after {waited:?}");
    // within 10% of the bound, plus scheduling slack
    let limit = timeout * 11 / 10 + Duration::from_millis(20);
    assert!(waited < limit, "returned after {waited:?}");

    let failed = rig.node.dequeue_buffer_set(icp)?;
    assert_eq!((failed.request_id, failed.status), (8, BufferStatus::Error));

    // the hardware finishes request 7 late
    rig.icp_hw.frame_end()?;
    rig.icp.drain_events()?;
    let done = rig.node.dequeue_buffer_set(icp)?;
    assert_eq!((done.request_id, done.status), (7, BufferStatus::Success));
    Ok(())
}

#[test]
#[serial]
fn test_reuse_waits_for_completion() -> Result<(), Box<dyn Error>> {
    let rig = Rig::new(
        IspConfig::default(),
        IcpConfig {
            process_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        false,
    );
    let (input, output) = (rig.buffer(), rig.buffer());
    let (icp, _) = rig.start_icp(7, input, output)?;
    rig.node.enqueue_buffer_set(icp, &icp_set(7, input, output))?;

    let hw = rig.icp_hw.clone();
    let finisher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        hw.frame_end()
    });
    rig.node
        .enqueue_buffer_set(icp, &icp_set(8, rig.buffer(), rig.buffer()))?;
    finisher.join().map_err(|_| "finisher panicked")??;

    assert_eq!(rig.icp_hw.applied_requests(), vec![7, 8]);
    Ok(())
}

#[test]
#[serial]
fn test_flush_wakes_reuse_wait() -> Result<(), Box<dyn Error>> {
    let rig = Rig::new(
        IspConfig::default(),
        IcpConfig {
            process_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        false,
    );
    let (input, output) = (rig.buffer(), rig.buffer());
    let (icp, _) = rig.start_icp(7, input, output)?;
    rig.node.enqueue_buffer_set(icp, &icp_set(7, input, output))?;

    let ctx = rig.icp.clone();
    let next = icp_set(8, rig.buffer(), rig.buffer());
    let waiter = std::thread::spawn(move || {
        let start = Instant::now();
        let result = ctx.queue().enqueue(&next);
        (result, start.elapsed())
    });
    std::thread::sleep(Duration::from_millis(30));
    DeviceContext::flush(rig.icp.as_ref())?;

    let (result, waited) = waiter.join().map_err(|_| "waiter panicked")?;
    println!("flushed wait {waited:?}");
    assert!(matches!(result, Err(FastpathError::HardwareFailure(_))));
    assert!(waited < Duration::from_secs(1), "returned after {waited:?}");
    assert!(rig.icp.ring_request_ids().is_empty());
    assert_eq!(rig.icp_hw.applied_requests(), vec![7]);
    Ok(())
}
