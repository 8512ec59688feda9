// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer binding and patch-map resolution.
//!
//! A packet references each buffer twice: once in its io configs and once
//! as the source handle of a patch descriptor. When a packet is matched to a
//! new buffer set, the io configs are rewritten from the set and the patch
//! descriptors must follow. [`PatchMap::build`] records which io config
//! each patch descriptor mirrors, by handle equality, and
//! [`PatchMap::apply`] replays that correspondence positionally.

use crate::{
    buffer::{BufferDescriptor, MAX_BUFFERS, MAX_PLANES},
    error::{FastpathError, Result},
    packet::{Direction, IoConfig, PatchDesc},
};
use tracing::{debug, error};

/// Maximum number of patch-to-io correspondences in one map.
pub const MAX_PATCH_MAPS: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PatchMapEntry {
    pub patch_idx: usize,
    pub io_idx: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchMap {
    entries: Vec<PatchMapEntry>,
}

impl PatchMap {
    /// Matches every patch descriptor against the io configs.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when a patch descriptor matches no io config, or
    /// when the map would exceed [`MAX_PATCH_MAPS`] entries.
    pub fn build(io_configs: &[IoConfig], patches: &[PatchDesc]) -> Result<Self> {
        let mut entries = Vec::new();
        for (patch_idx, patch) in patches.iter().enumerate() {
            let before = entries.len();
            for (io_idx, io) in io_configs.iter().enumerate() {
                if patch.src_buf_hdl != io.mem_handle[0] {
                    continue;
                }
                if entries.len() == MAX_PATCH_MAPS {
                    error!("patch map exceeds {MAX_PATCH_MAPS} entries");
                    return Err(FastpathError::invalid("patch map out of space"));
                }
                debug!(
                    "patch {patch_idx} -> io {io_idx} handle {:#x}",
                    io.mem_handle[0]
                );
                entries.push(PatchMapEntry { patch_idx, io_idx });
            }
            if entries.len() == before {
                error!(
                    "patch {patch_idx} handle {:#x} matches no io config",
                    patch.src_buf_hdl
                );
                return Err(FastpathError::invalid(format!(
                    "patch {patch_idx} has no matching io config"
                )));
            }
        }
        if entries.is_empty() {
            return Err(FastpathError::invalid("packet has no patch descriptors"));
        }
        Ok(PatchMap { entries })
    }

    /// Copies the io config handles into the mapped patch descriptors.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty map or an index outside either table.
    pub fn apply(&self, io_configs: &[IoConfig], patches: &mut [PatchDesc]) -> Result<()> {
        if self.entries.is_empty() {
            return Err(FastpathError::invalid("empty patch map"));
        }
        for entry in &self.entries {
            let io = io_configs.get(entry.io_idx).ok_or_else(|| {
                FastpathError::invalid(format!("io index {} out of range", entry.io_idx))
            })?;
            let patch = patches.get_mut(entry.patch_idx).ok_or_else(|| {
                FastpathError::invalid(format!("patch index {} out of range", entry.patch_idx))
            })?;
            patch.src_buf_hdl = io.mem_handle[0];
        }
        Ok(())
    }

    pub fn entries(&self) -> &[PatchMapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when every patch index below `num_patches` appears in the map.
    pub fn covers(&self, num_patches: usize) -> bool {
        (0..num_patches).all(|p| self.entries.iter().any(|e| e.patch_idx == p))
    }
}

/// How [`bind_buffers`] treats the direction of a matched io config.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirectionRule {
    /// The io config must already have this direction.
    Require(Direction),
    /// The io config is switched to this direction.
    Assign(Direction),
}

/// Writes the buffers selected by `mask` into the io configs.
///
/// `port` maps a slot number to the io config resource type it binds to.
///
/// # Errors
///
/// `InvalidArgument` when a slot has no io config or the direction differs.
pub fn bind_buffers(
    io_configs: &mut [IoConfig],
    bufs: &[BufferDescriptor; MAX_BUFFERS],
    mask: u32,
    rule: DirectionRule,
    port: impl Fn(usize) -> Option<u32>,
) -> Result<()> {
    for slot in (0..MAX_BUFFERS).filter(|bit| mask & (1 << bit) != 0) {
        let resource = port(slot)
            .ok_or_else(|| FastpathError::invalid(format!("slot {slot} has no port")))?;
        let io = io_configs
            .iter_mut()
            .find(|io| io.resource_type == resource)
            .ok_or_else(|| {
                FastpathError::invalid(format!("no io config for resource {resource:#x}"))
            })?;
        match rule {
            DirectionRule::Require(direction) if io.direction != direction => {
                return Err(FastpathError::invalid(format!(
                    "resource {resource:#x} direction {:?}, expected {:?}",
                    io.direction, direction
                )));
            }
            DirectionRule::Require(_) => {}
            DirectionRule::Assign(direction) => io.direction = direction,
        }

        let planes = bufs[slot].planes();
        for (i, plane) in planes.iter().enumerate() {
            io.mem_handle[i] = plane.handle;
            io.offsets[i] = plane.offset;
        }
        if planes.len() < MAX_PLANES {
            io.mem_handle[planes.len()] = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(src: i32) -> PatchDesc {
        PatchDesc {
            dst_buf_hdl: 100,
            dst_offset: 0,
            src_buf_hdl: src,
            src_offset: 0,
        }
    }

    #[test]
    fn build_matches_by_handle_not_index() {
        let io = [
            IoConfig::new(0, Direction::Input, 11),
            IoConfig::new(8, Direction::Output, 22),
        ];
        let patches = [patch(22), patch(11), patch(22)];
        let map = PatchMap::build(&io, &patches).unwrap();
        assert_eq!(
            map.entries(),
            &[
                PatchMapEntry {
                    patch_idx: 0,
                    io_idx: 1
                },
                PatchMapEntry {
                    patch_idx: 1,
                    io_idx: 0
                },
                PatchMapEntry {
                    patch_idx: 2,
                    io_idx: 1
                },
            ]
        );
        assert!(map.covers(patches.len()));
    }

    #[test]
    fn unmatched_patch_is_rejected() {
        let io = [IoConfig::new(0, Direction::Input, 11)];
        assert!(matches!(
            PatchMap::build(&io, &[patch(11), patch(99)]),
            Err(FastpathError::InvalidArgument(_))
        ));
    }

    #[test]
    fn apply_replays_positions() {
        let mut io = [
            IoConfig::new(0, Direction::Input, 11),
            IoConfig::new(8, Direction::Output, 22),
        ];
        let mut patches = [patch(22), patch(11)];
        let map = PatchMap::build(&io, &patches).unwrap();
        io[0].mem_handle[0] = 33;
        io[1].mem_handle[0] = 44;
        map.apply(&io, &mut patches).unwrap();
        assert_eq!(patches[0].src_buf_hdl, 44);
        assert_eq!(patches[1].src_buf_hdl, 33);
    }

    #[test]
    fn bind_checks_direction() {
        let mut io = [IoConfig::new(8, Direction::Output, 0)];
        let mut bufs = [BufferDescriptor::default(); MAX_BUFFERS];
        bufs[8] = BufferDescriptor::single(7);
        let port = |slot: usize| Some(slot as u32);
        let input = DirectionRule::Require(Direction::Input);
        assert!(bind_buffers(&mut io, &bufs, 1 << 8, input, port).is_err());
        bind_buffers(&mut io, &bufs, 1 << 8, DirectionRule::Require(Direction::Output), port)
            .unwrap();
        assert_eq!(io[0].mem_handle, [7, 0, 0]);

        bind_buffers(&mut io, &bufs, 1 << 8, DirectionRule::Assign(Direction::Input), port)
            .unwrap();
        assert_eq!(io[0].direction, Direction::Input);
    }
}
