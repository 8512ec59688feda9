// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Device handles.
//!
//! Internally a handle is a `{context_id, token}` pair. The client boundary
//! carries it as one `i32` with the context index in bits 31..24 and the
//! token in bits 23..0; [`DeviceHandle::to_wire`] and
//! [`DeviceHandle::from_wire`] are the only places that know this layout.

use crate::error::{FastpathError, Result};
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

const CONTEXT_SHIFT: u32 = 24;
const TOKEN_MASK: u32 = (1 << CONTEXT_SHIFT) - 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub context_id: u8,
    pub token: u32,
}

impl DeviceHandle {
    /// Stamps `context_id` onto `token`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the token already uses the context field.
    pub fn stamp(context_id: u8, token: u32) -> Result<Self> {
        if token & !TOKEN_MASK != 0 {
            return Err(FastpathError::invalid(format!(
                "token {token:#x} overlaps the context field"
            )));
        }
        Ok(DeviceHandle { context_id, token })
    }

    pub fn to_wire(self) -> i32 {
        (((self.context_id as u32) << CONTEXT_SHIFT) | self.token) as i32
    }

    pub fn from_wire(raw: i32) -> Self {
        let raw = raw as u32;
        DeviceHandle {
            context_id: (raw >> CONTEXT_SHIFT) as u8,
            token: raw & TOKEN_MASK,
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.to_wire() as u32)
    }
}

/// Source of non-zero 24-bit tokens.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU32,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        HandleAllocator {
            next: AtomicU32::new(1),
        }
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&self) -> u32 {
        loop {
            let token = self.next.fetch_add(1, Ordering::Relaxed) & TOKEN_MASK;
            if token != 0 {
                return token;
            }
        }
    }
}
