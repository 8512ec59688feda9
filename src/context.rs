// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Device-context interface shared by the ISP and ICP implementations.

use crate::{
    error::{FastpathError, Result},
    hw::{HwCapability, HwResource, StopMode},
    packet::SharedPacket,
    queue::BufferSetQueue,
};
use std::{fmt, sync::Arc};

/// Only user-pointer buffer handles are supported.
pub const HANDLE_TYPE_USER_PTR: u32 = 1;

/// `num_resources` value asking acquire-device to only reserve the context.
/// Hardware is then acquired with a version-2 acquire-hardware payload.
pub const API_COMPAT_CONSTANT: u32 = 0xFEFE_FEFE;

pub const ACQUIRE_HW_VERSION_2: u32 = 2;

/// Resources accepted in one acquire call.
pub const MAX_ACQUIRE_RESOURCES: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Isp,
    Icp,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeviceKind::Isp => f.write_str("isp"),
            DeviceKind::Icp => f.write_str("icp"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireDeviceCmd {
    pub session_handle: i32,
    pub num_resources: u32,
    pub handle_type: u32,
    pub resources: Vec<HwResource>,
}

impl AcquireDeviceCmd {
    /// Reserves the context without acquiring hardware.
    pub fn deferred(session_handle: i32) -> Self {
        AcquireDeviceCmd {
            session_handle,
            num_resources: API_COMPAT_CONSTANT,
            handle_type: HANDLE_TYPE_USER_PTR,
            resources: Vec::new(),
        }
    }

    /// Acquires `resources` together with the context.
    pub fn with_resources(session_handle: i32, resources: Vec<HwResource>) -> Self {
        AcquireDeviceCmd {
            session_handle,
            num_resources: resources.len() as u32,
            handle_type: HANDLE_TYPE_USER_PTR,
            resources,
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.num_resources == API_COMPAT_CONSTANT
    }

    /// Checks handle type and resource count.
    pub fn validate(&self, max_resources: usize) -> Result<()> {
        validate_handle_type(self.handle_type)?;
        if self.is_deferred() {
            return Ok(());
        }
        if self.num_resources as usize > max_resources {
            return Err(FastpathError::invalid(format!(
                "{} resources requested, at most {max_resources}",
                self.num_resources
            )));
        }
        if self.num_resources as usize != self.resources.len() {
            return Err(FastpathError::invalid(format!(
                "num_resources {} but {} resources given",
                self.num_resources,
                self.resources.len()
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquireHardwareCmd {
    pub version: u32,
    pub handle_type: u32,
    pub resources: Vec<HwResource>,
}

impl AcquireHardwareCmd {
    pub fn v2(resources: Vec<HwResource>) -> Self {
        AcquireHardwareCmd {
            version: ACQUIRE_HW_VERSION_2,
            handle_type: HANDLE_TYPE_USER_PTR,
            resources,
        }
    }
}

/// Reply to acquire-hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AcquiredHwInfo {
    pub hw_mask: u64,
    pub context_type: u32,
}

pub(crate) fn validate_handle_type(handle_type: u32) -> Result<()> {
    if handle_type != HANDLE_TYPE_USER_PTR {
        return Err(FastpathError::invalid(format!(
            "handle type {handle_type} not supported"
        )));
    }
    Ok(())
}

/// Client commands a device context implements. The dispatch node checks
/// the state machine before each call; implementations enforce their own
/// finer preconditions.
pub trait DeviceContext: Send + Sync {
    fn kind(&self) -> DeviceKind;

    /// Position of the context in its node's table.
    fn index(&self) -> u8;

    fn queue(&self) -> &Arc<BufferSetQueue>;

    fn query_capability(&self) -> Result<HwCapability>;

    fn acquire_device(&self, cmd: &AcquireDeviceCmd) -> Result<()>;

    fn acquire_hardware(&self, cmd: &AcquireHardwareCmd) -> Result<AcquiredHwInfo>;

    fn release_hardware(&self) -> Result<()>;

    fn start(&self) -> Result<()>;

    fn stop(&self, mode: StopMode) -> Result<()>;

    fn configure(&self, packet: SharedPacket) -> Result<()>;

    fn flush(&self) -> Result<()>;

    fn release_device(&self) -> Result<()>;
}
