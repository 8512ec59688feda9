// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Queue and context configuration.

use crate::error::{FastpathError, Result};
use serde_json::Value;
use std::{path::Path, time::Duration};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Number of buffer-set slots.
    pub depth: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig { depth: 16 }
    }
}

/// Overrun recovery for ISP request descriptors.
///
/// Active and processing may each hold `depth - 1` descriptors. Older
/// entries are discarded with error status, at most `max_discards` per event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecyclePolicy {
    pub depth: usize,
    pub max_discards: usize,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        RecyclePolicy {
            depth: 2,
            max_discards: 8,
        }
    }
}

impl RecyclePolicy {
    /// Entries a single list may keep before its oldest is discarded.
    pub fn keep(&self) -> usize {
        self.depth.saturating_sub(1).max(1)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IspConfig {
    pub queue: QueueConfig,
    pub recycle: RecyclePolicy,
    /// Request descriptors per context.
    pub max_requests: usize,
    /// Stored update packets per context.
    pub max_packets: usize,
    /// Hardware update entries a merged init descriptor may hold.
    pub max_update_entries: usize,
}

impl Default for IspConfig {
    fn default() -> Self {
        IspConfig {
            queue: QueueConfig::default(),
            recycle: RecyclePolicy::default(),
            max_requests: 8,
            max_packets: 8,
            max_update_entries: 32,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IcpConfig {
    pub queue: QueueConfig,
    /// Packets kept in the ring.
    pub packet_ring: usize,
    /// Bound on the wait for a reused packet's previous submission.
    pub process_timeout: Duration,
    pub max_resources: usize,
}

impl Default for IcpConfig {
    fn default() -> Self {
        IcpConfig {
            queue: QueueConfig::default(),
            packet_ring: 4,
            process_timeout: Duration::from_millis(30),
            max_resources: 8,
        }
    }
}

/// Overrides read from a JSON tuning document.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tuning {
    pub queue_depth: Option<usize>,
    pub recycle_depth: Option<usize>,
    pub max_discards: Option<usize>,
    pub packet_ring: Option<usize>,
    pub process_timeout_ms: Option<u64>,
}

fn read_usize(doc: &Value, key: &str) -> Result<Option<usize>> {
    read_u64(doc, key).map(|v| v.map(|v| v as usize))
}

fn read_u64(doc: &Value, key: &str) -> Result<Option<u64>> {
    match doc.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| FastpathError::invalid(format!("{key} must be an unsigned integer"))),
    }
}

impl Tuning {
    /// Reads the known keys from `doc`. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `doc` is not an object or a known key is not an
    /// unsigned integer.
    pub fn from_json(doc: &Value) -> Result<Self> {
        if !doc.is_object() {
            return Err(FastpathError::invalid("tuning must be a JSON object"));
        }
        Ok(Tuning {
            queue_depth: read_usize(doc, "queue_depth")?,
            recycle_depth: read_usize(doc, "recycle_depth")?,
            max_discards: read_usize(doc, "max_discards")?,
            packet_ring: read_usize(doc, "packet_ring")?,
            process_timeout_ms: read_u64(doc, "process_timeout_ms")?,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let doc: Value = serde_json::from_str(&text)
            .map_err(|e| FastpathError::invalid(format!("tuning: {e}")))?;
        Self::from_json(&doc)
    }

    pub fn apply_isp(&self, config: &mut IspConfig) {
        if let Some(depth) = self.queue_depth {
            config.queue.depth = depth;
        }
        if let Some(depth) = self.recycle_depth {
            config.recycle.depth = depth;
        }
        if let Some(max) = self.max_discards {
            config.recycle.max_discards = max;
        }
    }

    pub fn apply_icp(&self, config: &mut IcpConfig) {
        if let Some(depth) = self.queue_depth {
            config.queue.depth = depth;
        }
        if let Some(ring) = self.packet_ring {
            config.packet_ring = ring;
        }
        if let Some(ms) = self.process_timeout_ms {
            config.process_timeout = Duration::from_millis(ms);
        }
    }
}
