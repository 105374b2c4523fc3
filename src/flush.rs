// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moving a staged window out of the spare block and onto its destination.
//!
//! There are three kinds of destination, and each needs its own procedure to
//! stay recoverable if power goes away partway through:
//!
//! - The working block, which holds the log itself. Its replacement has to
//!   be marked valid in the spare before the working copy is invalidated.
//! - The boot block, which can only be erased while the CPU is fetching from
//!   the alternate range.
//! - Anything else, which can simply be erased and reprogrammed.

use alloc::vec;
use core::ops::Range;
use zerocopy::AsBytes;

use crate::device::{overlaps, BlockDevice, BootSwap};
use crate::layout::WorkSpaceHeader;
use crate::state::StateBit;
use crate::{FaultTolerantWrite, FtwError};

/// Where a window of `spare_length` bytes ends up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Destination {
    /// The window is exactly the working block.
    WorkingBlock,
    /// The window is exactly the boot block.
    BootBlock,
    /// Some other region, unrelated to the engine's own storage.
    Target,
}

impl<D, S> FaultTolerantWrite<D, S>
    where D: BlockDevice,
          S: BootSwap<D::Error>,
{
    /// Works out what a window starting at block `lba` of `target` covers,
    /// and how many of `target`'s blocks that is.
    ///
    /// Windows that partly overlap the engine's own storage, or touch the
    /// spare at all, are rejected.
    pub(crate) fn classify(
        &self,
        target: &D,
        lba: u64,
    ) -> Result<(Destination, u64), FtwError<D::Error>> {
        let l = self.layout;
        let g = target.geometry();
        if g.block_size == 0 || l.spare_length % g.block_size != 0 {
            log::warn!("ftw: target block size {:#x} doesn't divide spare length {:#x}",
                g.block_size, l.spare_length);
            return Err(FtwError::Unsupported);
        }
        let blocks = (l.spare_length / g.block_size) as u64;
        match lba.checked_add(blocks) {
            Some(end) if end <= g.block_count => (),
            _ => return Err(FtwError::Overrun),
        }

        let window = target.span(lba, blocks);
        if overlaps(&window, &self.spare.span(l.spare_lba, l.spare_blocks)) {
            return Err(FtwError::InvalidParameter);
        }
        if let Some(d) = classify_range(&window, &self.working_span(), Destination::WorkingBlock)? {
            return Ok((d, blocks));
        }
        if let Some(b) = &self.boot {
            let r = b.swap.range_location();
            if let Some(d) = classify_range(&window, &r.boot(), Destination::BootBlock)? {
                return Ok((d, blocks));
            }
            if overlaps(&window, &r.alt()) {
                return Err(FtwError::InvalidParameter);
            }
        }
        Ok((Destination::Target, blocks))
    }

    /// Physical range of the working block.
    pub(crate) fn working_span(&self) -> Range<u64> {
        self.work.span(self.layout.work_block_lba, self.layout.spare_blocks)
    }

    /// Copies the whole spare into the backup buffer.
    pub(crate) fn save_spare(&mut self) -> Result<(), D::Error> {
        self.spare.read(self.layout.spare_lba, 0, &mut self.backup)
    }

    /// Puts back what `save_spare` copied out.
    pub(crate) fn restore_spare(&mut self) -> Result<(), D::Error> {
        let l = self.layout;
        self.spare.erase_blocks(l.spare_lba, l.spare_blocks)?;
        self.spare.write(l.spare_lba, 0, &self.backup)
    }

    /// Erases the spare and programs the scratch window into it.
    pub(crate) fn program_spare(&mut self) -> Result<(), D::Error> {
        let l = self.layout;
        self.spare.erase_blocks(l.spare_lba, l.spare_blocks)?;
        self.spare.write(l.spare_lba, 0, &self.scratch)
    }

    /// Replaces the working block with the spare's contents.
    ///
    /// The spare is marked valid first and the working copy invalid before
    /// it is erased, so that at every point one of the two has a valid
    /// work-space header. The new working copy is programmed with its header
    /// state erased and only marked valid once everything else is in place.
    /// On success the mirror has been reloaded from the new working block.
    pub(crate) fn flush_spare_to_working(&mut self) -> Result<(), FtwError<D::Error>> {
        let l = self.layout;
        log::debug!("ftw: flushing spare into working block");

        self.spare.set_state_bit(l.spare_lba, l.header_state_offset(), StateBit::WorkingBlockValid)?;
        self.spare.read(l.spare_lba, 0, &mut self.scratch)?;

        let header = WorkSpaceHeader::fresh(l.work_space_size);
        self.scratch[l.work_space_offset..][..WorkSpaceHeader::SIZE]
            .copy_from_slice(header.as_bytes());

        self.work.set_state_bit(l.work_block_lba, l.header_state_offset(), StateBit::WorkingBlockInvalid)?;
        self.work.erase_blocks(l.work_block_lba, l.spare_blocks)?;
        self.work.write(l.work_block_lba, 0, &self.scratch)?;
        self.work.set_state_bit(l.work_block_lba, l.header_state_offset(), StateBit::WorkingBlockValid)?;

        self.read_work_space()?;
        self.settle();
        Ok(())
    }

    /// Replaces the boot block with the spare's contents.
    ///
    /// Unless the swap is already engaged (meaning an earlier attempt got
    /// that far and the alternate range holds a good copy), the current boot
    /// block is first copied to the alternate range and the swap engaged.
    pub(crate) fn flush_spare_to_boot(&mut self) -> Result<(), FtwError<D::Error>> {
        let l = self.layout;
        self.spare.read(l.spare_lba, 0, &mut self.scratch)?;

        let boot = self.boot.as_mut().ok_or(FtwError::Unsupported)?;
        if !boot.swap.swap_state()? {
            log::debug!("ftw: copying boot block to alternate range");
            let mut old = vec![0; l.spare_length];
            boot.boot.read(0, 0, &mut old)?;
            boot.alt.erase_blocks(0, l.spare_blocks)?;
            boot.alt.write(0, 0, &old)?;
            boot.swap.set_swap_state(true)?;
        }

        log::debug!("ftw: flushing spare into boot block");
        boot.boot.erase_blocks(0, l.spare_blocks)?;
        boot.boot.write(0, 0, &self.scratch)?;
        boot.swap.set_swap_state(false)?;
        Ok(())
    }

    /// Replaces `block_count` blocks of `target`, starting at `lba`, with the
    /// spare's contents.
    pub(crate) fn flush_spare_to_target(
        &mut self,
        target: &mut D,
        lba: u64,
        block_count: u64,
    ) -> Result<(), FtwError<D::Error>> {
        let l = self.layout;
        log::debug!("ftw: flushing spare into {:#x} lba {:#x}",
            target.physical_address(), lba);
        self.spare.read(l.spare_lba, 0, &mut self.scratch)?;
        target.erase_blocks(lba, block_count)?;
        target.write(lba, 0, &self.scratch)?;
        Ok(())
    }

    /// Finishes the last record, whose window is already in the spare with
    /// SpareComplete set: copies the window to its destination, sets
    /// DestinationComplete, and closes the header if this was its final
    /// record.
    ///
    /// `target` is only needed for `Destination::Target`.
    pub(crate) fn write_record_destination(
        &mut self,
        target: Option<&mut D>,
        dest: Destination,
        lba: u64,
        block_count: u64,
    ) -> Result<(), FtwError<D::Error>> {
        let l = self.layout;
        let tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;

        match dest {
            Destination::WorkingBlock => {
                // The copy of the log in the spare predates SpareComplete;
                // bring it up to date so the flush doesn't lose it.
                self.spare.set_state_bit(
                    l.spare_lba,
                    l.work_space_offset + tail.record,
                    StateBit::SpareComplete,
                )?;
                self.flush_spare_to_working()?;
            }
            Destination::BootBlock => self.flush_spare_to_boot()?,
            Destination::Target => {
                let target = target.ok_or(FtwError::InvalidParameter)?;
                self.flush_spare_to_target(target, lba, block_count)?;
            }
        }

        self.mark_destination_complete()
    }

    /// Sets DestinationComplete on the last record, and Complete on its
    /// header if it is the final record of the group.
    pub(crate) fn mark_destination_complete(&mut self) -> Result<(), FtwError<D::Error>> {
        let tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;
        let last = self.mirror.is_last_record();
        self.set_work_bit(tail.record, StateBit::DestinationComplete)?;
        if last {
            self.set_work_bit(tail.header, StateBit::Complete)?;
        }
        self.settle();
        Ok(())
    }
}

/// Sorts `window` against one of the engine's own regions: exactly the same
/// range is `dest`, a partial overlap is an error, and disjoint is `None`.
fn classify_range<E>(
    window: &Range<u64>,
    region: &Range<u64>,
    dest: Destination,
) -> Result<Option<Destination>, FtwError<E>> {
    if window == region {
        Ok(Some(dest))
    } else if overlaps(window, region) {
        Err(FtwError::InvalidParameter)
    } else {
        Ok(None)
    }
}
