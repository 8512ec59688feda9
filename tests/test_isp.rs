// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod common;

use common::{isp_init, isp_set, isp_update, Rig, ISP_FULL_PORT};
use edgefirst_fastpath::{
    buffer::BufferStatus,
    config::{IcpConfig, IspConfig},
    context::DeviceContext,
    hw::HwEvent,
    packet::{Direction, IoConfig},
    sim::{HwCall, HwOp},
    FastpathError,
};
use std::error::Error;

/// One simulated frame with every event handled before returning.
fn frame(rig: &Rig, boot_time: u64) -> Result<(), FastpathError> {
    rig.isp_hw.frame_start(boot_time)?;
    rig.isp.drain_events()?;
    rig.isp_hw.frame_end()?;
    rig.isp.drain_events()
}

fn raise(rig: &Rig, event: HwEvent, times: usize) -> Result<(), FastpathError> {
    for _ in 0..times {
        rig.isp_hw.raise(event.clone())?;
    }
    rig.isp.drain_events()
}

#[test]
fn test_init_packets_merge() -> Result<(), Box<dyn Error>> {
    let rig = Rig::new(
        IspConfig {
            max_update_entries: 3,
            ..Default::default()
        },
        IcpConfig::default(),
        true,
    );
    let isp = rig.acquire_isp()?;
    let (a, b) = (rig.buffer(), rig.buffer());

    rig.configure(
        isp,
        isp_init(10, rig.cmd_buf).with_io(IoConfig::new(0x3000, Direction::Output, a)),
    )?;
    rig.configure(
        isp,
        isp_init(11, rig.cmd_buf).with_io(IoConfig::new(0x3001, Direction::Output, b)),
    )?;

    let snapshot = rig.isp.snapshot();
    assert_eq!(snapshot.pending.len(), 1);
    let init = snapshot.pending[0];
    assert!(init.init);
    assert_eq!(init.request_id, 11);
    assert_eq!(init.num_entries, 2);
    assert_eq!(init.num_fence_out, 2);

    // a third entry would reach the update-entry limit
    assert!(matches!(
        rig.configure(isp, isp_init(12, rig.cmd_buf)),
        Err(FastpathError::InvalidArgument(_))
    ));
    assert_eq!(rig.isp.snapshot().pending[0].num_entries, 2);
    Ok(())
}

#[test]
fn test_update_needs_init() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let isp = rig.acquire_isp()?;
    let out = rig.buffer();

    assert!(matches!(
        rig.configure(isp, isp_update(1, rig.cmd_buf, out)),
        Err(FastpathError::InvalidArgument(_))
    ));
    rig.configure(isp, isp_init(0, rig.cmd_buf))?;
    rig.configure(isp, isp_update(1, rig.cmd_buf, out))?;
    assert_eq!(rig.isp.snapshot().packets, vec![(1, 0)]);
    Ok(())
}

#[test]
fn test_frame_timeline() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let out = rig.buffer();
    let isp = rig.start_isp(out)?;

    rig.node.enqueue_buffer_set(isp, &isp_set(1, out))?;
    frame(&rig, 1_000)?;
    assert_eq!(rig.node.dequeue_buffer_set(isp), Err(FastpathError::Again));
    assert_eq!(rig.isp.snapshot().active.len(), 1);

    frame(&rig, 2_000)?;
    let done = rig.node.dequeue_buffer_set(isp)?;
    println!("{done}");
    assert_eq!(done.request_id, 1);
    assert_eq!(done.status, BufferStatus::Success);
    assert_eq!(done.timestamp, 2_000);
    assert_eq!(done.sequence, 2);

    let snapshot = rig.isp.snapshot();
    assert!(snapshot.active.is_empty());
    assert!(snapshot.processing.is_empty());
    assert_eq!(snapshot.sof_count, 2);
    Ok(())
}

#[test]
fn test_overrun_discards_oldest() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let out = rig.buffer();
    let isp = rig.start_isp(out)?;

    for rid in 1..=3 {
        rig.node.enqueue_buffer_set(isp, &isp_set(rid, out))?;
    }
    raise(&rig, HwEvent::Epoch, 3)?;
    assert_eq!(rig.isp.snapshot().active.len(), 4);

    raise(&rig, HwEvent::Sof { boot_time: 5_000 }, 3)?;
    let first = rig.node.dequeue_buffer_set(isp)?;
    let second = rig.node.dequeue_buffer_set(isp)?;
    assert_eq!((first.request_id, first.status), (1, BufferStatus::Error));
    assert_eq!((second.request_id, second.status), (2, BufferStatus::Error));
    assert_eq!(rig.node.dequeue_buffer_set(isp), Err(FastpathError::Again));

    let snapshot = rig.isp.snapshot();
    assert!(snapshot.active.is_empty());
    assert_eq!(snapshot.processing.len(), 1);
    assert_eq!(snapshot.processing[0].request_id, 3);

    raise(
        &rig,
        HwEvent::Done {
            request_id: 3,
            handles: vec![ISP_FULL_PORT],
        },
        1,
    )?;
    let third = rig.node.dequeue_buffer_set(isp)?;
    assert_eq!((third.request_id, third.status), (3, BufferStatus::Success));
    assert_eq!(third.timestamp, 5_000);
    Ok(())
}

#[test]
fn test_apply_failure_requeues() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let out = rig.buffer();
    let isp = rig.start_isp(out)?;

    rig.node.enqueue_buffer_set(isp, &isp_set(1, out))?;
    rig.isp_hw.fail_next(HwOp::Apply);
    raise(&rig, HwEvent::Epoch, 1)?;

    let snapshot = rig.isp.snapshot();
    assert_eq!(snapshot.pending.len(), 1);
    assert_eq!(snapshot.pending[0].request_id, 1);
    assert_eq!(rig.isp.queue().counts().processing, 1);

    rig.isp.apply()?;
    let snapshot = rig.isp.snapshot();
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.active.last().map(|d| d.request_id), Some(1));
    assert_eq!(rig.isp.apply(), Err(FastpathError::Again));
    Ok(())
}

#[test]
fn test_packet_reuse_and_supersede() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let out = rig.buffer();
    let isp = rig.start_isp(out)?;

    rig.node.enqueue_buffer_set(isp, &isp_set(1, out))?;
    rig.node.enqueue_buffer_set(isp, &isp_set(2, out))?;
    raise(&rig, HwEvent::Epoch, 2)?;
    assert_eq!(rig.isp.snapshot().packets, vec![(1, 2)]);

    let reapplied: Vec<(u64, bool)> = rig
        .isp_hw
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
    assert_eq!(reapplied, vec![(1, false), (2, true)]);

    rig.configure(isp, isp_update(3, rig.cmd_buf, out))?;
    rig.node.enqueue_buffer_set(isp, &isp_set(3, out))?;
    raise(&rig, HwEvent::Epoch, 1)?;
    assert_eq!(rig.isp.snapshot().packets, vec![(3, 1)]);
    Ok(())
}

#[test]
fn test_stop_flushes() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    let out = rig.buffer();
    let isp = rig.start_isp(out)?;

    for rid in 1..=2 {
        rig.node.enqueue_buffer_set(isp, &isp_set(rid, out))?;
    }
    raise(&rig, HwEvent::Epoch, 1)?;
    rig.node.stop(isp)?;

    let counts = rig.isp.queue().counts();
    assert_eq!(counts.free, counts.total());
    let snapshot = rig.isp.snapshot();
    assert!(!snapshot.streaming);
    assert!(snapshot.pending.is_empty() && snapshot.active.is_empty());
    assert!(rig
        .isp_hw
        .calls()
        .iter()
        .any(|call| matches!(call, HwCall::Stop { .. })));
    Ok(())
}

#[test]
fn test_hardware_acquire_failure() -> Result<(), Box<dyn Error>> {
    let rig = Rig::with_defaults();
    rig.isp_hw.fail_next(HwOp::Generic);
    assert!(matches!(
        rig.acquire_isp(),
        Err(FastpathError::HardwareFailure(_))
    ));
    // the back-end context was handed back after the failed query
    assert!(rig
        .isp_hw
        .calls()
        .iter()
        .any(|call| matches!(call, HwCall::Release { .. })));
    Ok(())
}
