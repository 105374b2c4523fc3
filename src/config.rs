// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Start-of-day configuration and the geometry derived from it.

use crate::device::{overlaps, BlockDevice, BootBlockAccess, BootSwap};
use crate::layout::{CallerId, WorkSpaceHeader, WriteHeader, WriteRecord};

/// A physical address range handed to us by the platform.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RegionConfig {
    pub base: u64,
    pub length: usize,
}

/// Static configuration, fixed at boot.
///
/// A region left as `None` (or given a zero length) means the platform didn't
/// provide it; the engine refuses to start rather than finding out on first
/// use.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FtwConfig {
    /// Where the work space lives, inside the work device.
    pub work_space: Option<RegionConfig>,
    /// Where the spare block lives, inside the spare device.
    pub spare: Option<RegionConfig>,
    /// Caller id used when `write` allocates a single-record header on the
    /// caller's behalf.
    pub caller_id: CallerId,
}

/// Reasons a configuration is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    /// The work-space or spare region was not configured.
    MissingRegion,
    /// A region was configured with zero length, or a device has no blocks.
    ZeroLength,
    /// A region doesn't lie within the device that's supposed to hold it.
    OutOfDevice,
    /// The spare region doesn't start and end on block boundaries.
    Misaligned,
    /// The work and spare devices have different block sizes.
    BlockSizeMismatch,
    /// The work space can't hold its header plus one header and one record.
    WorkSpaceTooSmall,
    /// The work space doesn't fit in the spare-sized window starting at the
    /// block that contains it, or that window overlaps the spare region.
    WorkSpaceOutsideWindow,
    /// The boot block and alternate range don't match the spare size, or the
    /// alternate range overlaps the spare, or the devices don't sit where
    /// the swap capability says they do.
    BootGeometry,
}

/// Fully validated geometry. Everything the engine needs to address the work
/// space, its spare mirror and the working block is computed once, here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    /// Block size shared by the work and spare devices.
    pub block_size: usize,
    /// First block of the spare region in the spare device.
    pub spare_lba: u64,
    /// Number of blocks in the spare region.
    pub spare_blocks: u64,
    /// Length of the spare region in bytes; also the size of every update
    /// window.
    pub spare_length: usize,
    /// First block of the working block in the work device.
    pub work_block_lba: u64,
    /// Offset of the work space from the start of the working block. The
    /// spare mirror sits at the same offset from the start of the spare.
    pub work_space_offset: usize,
    /// Size of the work space in bytes.
    pub work_space_size: usize,
}

impl Layout {
    /// Smallest work space that can hold anything.
    pub const MIN_WORK_SPACE: usize =
        WorkSpaceHeader::SIZE + WriteHeader::SIZE + WriteRecord::SIZE;

    /// Checks `config` against the devices it is meant to describe.
    pub fn new<D, S>(
        config: &FtwConfig,
        work: &D,
        spare: &D,
        boot: Option<&BootBlockAccess<D, S>>,
    ) -> Result<Self, ConfigError>
        where D: BlockDevice,
              S: BootSwap<D::Error>,
    {
        let ws = config.work_space.ok_or(ConfigError::MissingRegion)?;
        let sp = config.spare.ok_or(ConfigError::MissingRegion)?;
        if ws.length == 0 || sp.length == 0 {
            return Err(ConfigError::ZeroLength);
        }

        let wg = work.geometry();
        let sg = spare.geometry();
        if wg.is_empty() || sg.is_empty() {
            return Err(ConfigError::ZeroLength);
        }
        if wg.block_size != sg.block_size {
            return Err(ConfigError::BlockSizeMismatch);
        }
        let block_size = sg.block_size;
        let bs = block_size as u64;

        // Spare region.
        let spare_span = spare.span(0, sg.block_count);
        let sp_end = sp.base.checked_add(sp.length as u64)
            .ok_or(ConfigError::OutOfDevice)?;
        if sp.base < spare_span.start || sp_end > spare_span.end {
            return Err(ConfigError::OutOfDevice);
        }
        let sp_rel = sp.base - spare_span.start;
        if sp_rel % bs != 0 || sp.length % block_size != 0 {
            return Err(ConfigError::Misaligned);
        }
        let spare_lba = sp_rel / bs;
        let spare_blocks = (sp.length / block_size) as u64;

        // Work space and the working block around it.
        if ws.length < Self::MIN_WORK_SPACE {
            return Err(ConfigError::WorkSpaceTooSmall);
        }
        let work_span = work.span(0, wg.block_count);
        let ws_end = ws.base.checked_add(ws.length as u64)
            .ok_or(ConfigError::OutOfDevice)?;
        if ws.base < work_span.start || ws_end > work_span.end {
            return Err(ConfigError::OutOfDevice);
        }
        let ws_rel = ws.base - work_span.start;
        let work_block_lba = ws_rel / bs;
        let work_space_offset = (ws_rel % bs) as usize;
        if work_space_offset + ws.length > sp.length
            || work_block_lba + spare_blocks > wg.block_count
        {
            return Err(ConfigError::WorkSpaceOutsideWindow);
        }
        let working = work.span(work_block_lba, spare_blocks);
        if overlaps(&working, &(sp.base..sp_end)) {
            return Err(ConfigError::WorkSpaceOutsideWindow);
        }

        if let Some(b) = boot {
            let r = b.swap.range_location();
            if r.boot_size != sp.length as u64
                || r.alt_size != sp.length as u64
                || overlaps(&r.alt(), &(sp.base..sp_end))
                || b.boot.physical_address() != r.boot_base
                || b.alt.physical_address() != r.alt_base
                || b.boot.geometry().block_size != block_size
                || b.alt.geometry().block_size != block_size
            {
                return Err(ConfigError::BootGeometry);
            }
        }

        Ok(Self {
            block_size,
            spare_lba,
            spare_blocks,
            spare_length: sp.length,
            work_block_lba,
            work_space_offset,
            work_space_size: ws.length,
        })
    }

    /// Offset of the work-space state byte from the start of the working
    /// block (or of the spare).
    pub fn header_state_offset(&self) -> usize {
        self.work_space_offset + WorkSpaceHeader::STATE_OFFSET
    }
}
