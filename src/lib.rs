// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fault-tolerant writes to block-erasable flash.
//!
//! Updating a few bytes of flash means erasing and reprogramming at least a
//! whole block, and losing power partway through leaves that block half
//! erased. This crate gives updates all-or-nothing behavior by way of two
//! reserved regions:
//!
//! - The _work space_, a small write-ahead log living in the _working block_.
//!   Every update is recorded there before it starts, and every step of its
//!   progress is recorded by programming one more state bit.
//! - The _spare block_, where the complete new contents of the window being
//!   updated are staged before the window itself is erased.
//!
//! Whatever point power fails at, the log says how far the update got, and
//! the staged copy holds what's needed to finish it. `FaultTolerantWrite::new`
//! performs start-of-day recovery; anything it can't settle on its own (an
//! update to some other device it doesn't have a handle on) is left for the
//! caller to `restart` or `abort`.
//!
//! The engine is single-threaded and synchronous. It owns its devices and
//! buffers, and every operation reloads the log from flash before acting on
//! it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod device;
mod flush;
pub mod layout;
mod reclaim;
pub mod state;
pub mod workspace;

#[cfg(test)]
mod testutil;

use alloc::vec;
use alloc::vec::Vec;
use zerocopy::AsBytes;

pub use crate::config::{ConfigError, FtwConfig, Layout, RegionConfig};
pub use crate::device::{
    BlockDevice, BootBlockAccess, BootSwap, Geometry, NoSwap, SwapRanges,
};
pub use crate::layout::CallerId;

use crate::device::overlaps;
use crate::flush::Destination;
use crate::layout::{WorkSpaceHeader, WriteHeader, WriteRecord};
use crate::state::{RecordProgress, StateBit, StateError, ERASED_BYTE};
use crate::workspace::WorkSpace;

/// Errors from engine operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FtwError<E> {
    /// A write sequence is already allocated and not yet Complete.
    ResourceBusy,
    /// The requested group can't fit in the work space even when it is
    /// empty.
    CapacityExceeded,
    /// No write sequence has been allocated, or the last write still has to
    /// be restarted.
    NotReady,
    /// The operation isn't valid in the current state of the log, or would
    /// touch the work space itself.
    AccessDenied,
    /// The update doesn't fit in the spare block, or the window runs off the
    /// end of the target.
    Overrun,
    /// There is no write to report or abort.
    NotFound,
    /// An argument doesn't match the log or the engine's configuration.
    InvalidParameter,
    /// The target's block size doesn't divide the spare length, so its
    /// windows can't be staged in the spare block.
    Unsupported,
    /// The work space can't be made usable.
    Corrupt,
    /// The underlying device reported an error. Nothing is retried.
    Device(E),
}

impl<E> From<E> for FtwError<E> {
    fn from(e: E) -> Self {
        Self::Device(e)
    }
}

impl<E> From<StateError<E>> for FtwError<E> {
    fn from(e: StateError<E>) -> Self {
        match e {
            StateError::Device(e) => Self::Device(e),
            StateError::Unprogram(found) => {
                log::error!("ftw: state byte {:#04x} can't take requested bits", found.0);
                Self::Corrupt
            }
        }
    }
}

/// Errors from bringing the engine up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InitError<E> {
    Config(ConfigError),
    /// Neither the working block nor the spare could be turned into a valid
    /// work space.
    Corrupt,
    Device(E),
}

impl<E> From<ConfigError> for InitError<E> {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl<E> From<FtwError<E>> for InitError<E> {
    fn from(e: FtwError<E>) -> Self {
        match e {
            FtwError::Device(e) => Self::Device(e),
            _ => Self::Corrupt,
        }
    }
}

/// Where the most recent write sequence stands.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriteState {
    /// Nothing has been written since the log was last emptied.
    Unallocated,
    /// A header is being allocated.
    HeaderAllocated,
    /// A header is allocated and its next record hasn't been written.
    WritesAllocated,
    /// A record is logged but its window isn't fully staged in the spare.
    RecordAllocated,
    /// The window is staged; the destination may be partly written.
    SpareComplete,
    /// The record is done but its header isn't closed.
    DestinationComplete,
    /// The last sequence finished or was aborted.
    Complete,
}

/// The most recent write, as reported by `FaultTolerantWrite::get_last_write`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LastWrite<'a> {
    pub caller_id: CallerId,
    pub lba: u64,
    pub offset: u64,
    pub length: u64,
    pub private_data: &'a [u8],
    /// Whether the write reached its destination. False means the sequence
    /// is still in flight and needs a `restart` or an `abort`.
    pub complete: bool,
}

/// The fault-tolerant write engine.
///
/// `D` is the block-device handle type. The engine owns one handle on the
/// work device and one on the spare device; targets are passed in per call.
/// `S` is the boot-block swap capability, if the platform has one.
pub struct FaultTolerantWrite<D, S = NoSwap> {
    work: D,
    spare: D,
    boot: Option<BootBlockAccess<D, S>>,
    layout: Layout,
    caller_id: CallerId,
    mirror: WorkSpace,
    /// Spare-sized buffer for building windows.
    scratch: Vec<u8>,
    /// Spare-sized buffer holding what the spare contained before we used it.
    backup: Vec<u8>,
}

impl<D: BlockDevice> FaultTolerantWrite<D, NoSwap> {
    /// Starts an engine on a platform that can't update its boot block.
    pub fn without_boot_block(
        config: &FtwConfig,
        work: D,
        spare: D,
    ) -> Result<Self, InitError<D::Error>> {
        Self::new(config, work, spare, None)
    }
}

impl<D, S> FaultTolerantWrite<D, S>
    where D: BlockDevice,
          S: BootSwap<D::Error>,
{
    /// Validates `config` against the devices, then brings the log into a
    /// consistent state: rebuilding the working block from the spare if an
    /// update to it was interrupted, creating an empty log if there is none,
    /// and settling whatever write sequence was in flight as far as it can
    /// without the caller's help.
    pub fn new(
        config: &FtwConfig,
        work: D,
        spare: D,
        boot: Option<BootBlockAccess<D, S>>,
    ) -> Result<Self, InitError<D::Error>> {
        let layout = Layout::new(config, &work, &spare, boot.as_ref())?;
        let mut ftw = Self {
            work,
            spare,
            boot,
            layout,
            caller_id: config.caller_id,
            mirror: WorkSpace::new(layout.work_space_size),
            scratch: vec![ERASED_BYTE; layout.spare_length],
            backup: vec![ERASED_BYTE; layout.spare_length],
        };
        ftw.recover()?;
        log::info!("ftw: ready, state {:?}", ftw.state());
        Ok(ftw)
    }

    fn recover(&mut self) -> Result<(), FtwError<D::Error>> {
        self.refresh()?;

        // The sequence's first write never reached the spare, so nothing
        // outside the log has changed yet.
        if let Some((_, record)) = self.pending() {
            if !record.is_spare_complete() && self.mirror.is_first_record() {
                log::info!("ftw: abandoning write sequence that never started");
                self.close_header()?;
            }
        }

        if let Some((_, record)) = self.pending() {
            if record.is_destination_complete() && self.mirror.is_last_record() {
                log::info!("ftw: closing finished write sequence");
                self.close_header()?;
            }
        }

        if !self.mirror.is_tail_erased() {
            log::warn!("ftw: found torn data after end of log, reclaiming");
            self.reclaim(true)?;
            self.refresh()?;
        }

        if let Some((_, record)) = self.pending() {
            if record.is_boot_block_update()
                && !record.is_destination_complete()
                && self.boot.is_some()
            {
                if record.is_spare_complete() {
                    log::info!("ftw: finishing interrupted boot block update");
                    self.write_record_destination(
                        None,
                        Destination::BootBlock,
                        record.lba.get(),
                        self.layout.spare_blocks,
                    )?;
                } else {
                    log::info!("ftw: abandoning boot block update");
                    self.close_header()?;
                }
            }
        }
        Ok(())
    }

    /// Having just rebuilt the working block from the spare: if the pending
    /// record was an update of the working block itself, that rebuild was
    /// its destination write.
    pub(crate) fn finish_working_block_update(&mut self) -> Result<(), FtwError<D::Error>> {
        let Some((_, record)) = self.pending() else {
            return Ok(());
        };
        let start = record.lba.get()
            .checked_mul(self.layout.block_size as u64)
            .and_then(|o| record.fv_base_address.get().checked_add(o));
        if record.is_spare_complete()
            && !record.is_destination_complete()
            && start == Some(self.working_span().start)
        {
            log::info!("ftw: working block update finished by recovery");
            self.mark_destination_complete()?;
        }
        Ok(())
    }

    /// Whether the log's last header is allocated. A log with no room left
    /// for another header has none.
    fn header_allocated(&self) -> bool {
        self.mirror.last().map_or(false, |(h, _)| h.is_allocated())
    }

    /// Header and last record of the sequence in flight, if any.
    fn pending(&self) -> Option<(WriteHeader, WriteRecord)> {
        self.mirror.last().filter(|(h, _)| h.is_allocated() && !h.is_complete())
    }

    /// Sets Complete on the last header.
    fn close_header(&mut self) -> Result<(), FtwError<D::Error>> {
        let tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;
        self.set_work_bit(tail.header, StateBit::Complete)?;
        self.settle();
        Ok(())
    }

    /// Reserves room in the log for a sequence of `number_of_writes` writes,
    /// each carrying `private_data_size` bytes of caller data.
    pub fn allocate(
        &mut self,
        caller_id: CallerId,
        private_data_size: usize,
        number_of_writes: usize,
    ) -> Result<(), FtwError<D::Error>> {
        self.refresh()?;
        if number_of_writes == 0 {
            return Err(FtwError::InvalidParameter);
        }
        if self.header_allocated() {
            return Err(FtwError::ResourceBusy);
        }

        let queue = (self.layout.work_space_size - WorkSpaceHeader::SIZE) as u64;
        let size = layout::group_size(number_of_writes as u64, private_data_size as u64)
            .filter(|&s| s as u64 <= queue)
            .ok_or(FtwError::CapacityExceeded)?;

        let mut tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;
        let fits = self.mirror.bytes()
            .get(tail.header..tail.header + size)
            .map_or(false, layout::is_erased);
        if !fits {
            // Nothing is in flight, so nothing needs keeping.
            self.reclaim(false)?;
            self.refresh()?;
            tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;
        }

        let l = self.layout;
        let h = WriteHeader::new(caller_id, number_of_writes as u64, private_data_size as u64);
        self.work.write(l.work_block_lba, l.work_space_offset + tail.header, h.as_bytes())?;
        self.mirror.bytes_mut()[tail.header..][..WriteHeader::SIZE]
            .copy_from_slice(h.as_bytes());
        self.set_work_bit(tail.header, StateBit::HeaderAllocated)?;
        self.set_work_bit(tail.header, StateBit::WritesAllocated)?;
        self.settle();

        log::info!("ftw: allocated {} write(s) for {:?}", number_of_writes, caller_id);
        Ok(())
    }

    /// Writes `buffer` at `offset` into the spare-sized window starting at
    /// block `lba` of `target`, as the next write of the allocated sequence.
    ///
    /// If no sequence is allocated and `private_data` is `None`, a sequence
    /// of one write is allocated under the configured caller id.
    pub fn write(
        &mut self,
        lba: u64,
        offset: usize,
        private_data: Option<&[u8]>,
        target: &mut D,
        buffer: &[u8],
    ) -> Result<(), FtwError<D::Error>> {
        self.refresh()?;
        let l = self.layout;

        let end = offset.checked_add(buffer.len()).ok_or(FtwError::Overrun)?;
        if end > l.spare_length {
            return Err(FtwError::Overrun);
        }
        let (dest, blocks) = self.classify(target, lba)?;
        if dest == Destination::WorkingBlock && !buffer.is_empty() {
            let ws = l.work_space_offset as u64..(l.work_space_offset + l.work_space_size) as u64;
            if overlaps(&(offset as u64..end as u64), &ws) {
                return Err(FtwError::AccessDenied);
            }
        }

        if !self.header_allocated() {
            if private_data.is_some() {
                return Err(FtwError::NotReady);
            }
            self.allocate(self.caller_id, 0, 1)?;
        }

        let tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;
        let (header, record) = self.mirror.last().ok_or(FtwError::Corrupt)?;
        if header.is_complete() || record.is_destination_complete() {
            return Err(FtwError::AccessDenied);
        }
        if record.is_spare_complete() {
            return Err(FtwError::NotReady);
        }
        let private_size = header.private_data_size.get();
        if private_data.map_or(false, |p| p.len() as u64 != private_size) {
            return Err(FtwError::InvalidParameter);
        }
        if !self.mirror.is_record_slot_erased() {
            return Err(FtwError::AccessDenied);
        }
        let stride = header.record_stride().ok_or(FtwError::Corrupt)?;

        // Record what's about to happen.
        let mut record = WriteRecord::new(
            lba,
            offset as u64,
            buffer.len() as u64,
            target.physical_address(),
        );
        if dest == Destination::BootBlock {
            record.state = record.state().with(StateBit::BootBlockUpdate).0;
        }
        let slot = &mut self.scratch[..stride];
        slot.fill(ERASED_BYTE);
        slot[..WriteRecord::SIZE].copy_from_slice(record.as_bytes());
        if let Some(p) = private_data {
            slot[WriteRecord::SIZE..].copy_from_slice(p);
        }
        self.work.write(l.work_block_lba, l.work_space_offset + tail.record, &self.scratch[..stride])?;
        self.mirror.bytes_mut()[tail.record..][..stride]
            .copy_from_slice(&self.scratch[..stride]);

        // Stage the new window in the spare.
        target.read(lba, 0, &mut self.scratch)?;
        self.scratch[offset..end].copy_from_slice(buffer);
        self.save_spare()?;
        self.program_spare()?;
        self.set_work_bit(tail.record, StateBit::SpareComplete)?;

        self.write_record_destination(Some(target), dest, lba, blocks)?;

        if self.restore_spare().is_err() {
            log::warn!("ftw: couldn't restore spare block contents");
        }
        log::info!("ftw: wrote {:#x} bytes at lba {:#x} offset {:#x} ({:?})",
            buffer.len(), lba, offset, dest);
        Ok(())
    }

    /// Finishes a write that was staged in the spare but didn't reach its
    /// destination. `target` must be a handle on the same device the write
    /// was issued against.
    pub fn restart(&mut self, target: &mut D) -> Result<(), FtwError<D::Error>> {
        self.refresh()?;
        let (header, record) = self.mirror.last().ok_or(FtwError::AccessDenied)?;
        if !header.is_allocated()
            || header.is_complete()
            || record.is_destination_complete()
            || !record.is_spare_complete()
        {
            return Err(FtwError::AccessDenied);
        }
        if target.physical_address() != record.fv_base_address.get() {
            return Err(FtwError::InvalidParameter);
        }

        let lba = record.lba.get();
        let (dest, blocks) = self.classify(target, lba)?;
        self.write_record_destination(Some(target), dest, lba, blocks)?;

        let l = self.layout;
        self.spare.erase_blocks(l.spare_lba, l.spare_blocks)?;
        log::info!("ftw: restarted write at lba {:#x}", lba);
        Ok(())
    }

    /// Gives up on the sequence in flight. Writes that already reached their
    /// destination stay written; the rest never happen.
    pub fn abort(&mut self) -> Result<(), FtwError<D::Error>> {
        self.refresh()?;
        if self.pending().is_none() {
            return Err(FtwError::NotFound);
        }
        self.close_header()?;
        log::info!("ftw: write sequence aborted");
        Ok(())
    }

    /// Reports the most recent write in the log.
    ///
    /// If the last sequence has finished its final write but was never
    /// closed, this closes it, exactly as `abort` would.
    pub fn get_last_write(&mut self) -> Result<LastWrite<'_>, FtwError<D::Error>> {
        self.refresh()?;
        let tail = self.mirror.tail().ok_or(FtwError::Corrupt)?;
        let open = self.mirror.last().filter(|(h, _)| h.is_allocated());

        let (at_header, at_record, complete) = if let Some((header, record)) = open {
            self.last_in_group(tail, header, record)?
        } else {
            let previous = tail.previous.ok_or(FtwError::NotFound)?;
            let r = layout::records(self.mirror.bytes(), previous)
                .filter(|r| !layout::is_erased(r.record.as_bytes()))
                .last()
                .ok_or(FtwError::NotFound)?;
            (previous, r.offset, r.record.is_destination_complete())
        };

        let buf = self.mirror.bytes();
        let h = layout::header_at(buf, at_header).ok_or(FtwError::Corrupt)?;
        let r = layout::record_at(buf, at_record).ok_or(FtwError::Corrupt)?;
        let data = at_record + WriteRecord::SIZE;
        let len = usize::try_from(h.private_data_size.get()).map_err(|_| FtwError::Corrupt)?;
        let private_data = buf.get(data..data + len).ok_or(FtwError::Corrupt)?;
        Ok(LastWrite {
            caller_id: CallerId(h.caller_id),
            lba: r.lba.get(),
            offset: r.offset.get(),
            length: r.length.get(),
            private_data,
            complete,
        })
    }

    /// Picks the record `get_last_write` reports out of the group in flight,
    /// closing the group if its final write is done. Returns the header and
    /// record offsets and whether that write reached its destination.
    fn last_in_group(
        &mut self,
        tail: layout::Tail,
        header: WriteHeader,
        record: WriteRecord,
    ) -> Result<(usize, usize, bool), FtwError<D::Error>> {
        Ok(if record.is_destination_complete() && self.mirror.is_last_record() {
            log::info!("ftw: closing finished write sequence");
            self.close_header()?;
            (tail.header, tail.record, true)
        } else if record.is_spare_complete() {
            (tail.header, tail.record, false)
        } else if !self.mirror.is_first_record() {
            let stride = header.record_stride().ok_or(FtwError::Corrupt)?;
            (tail.header, tail.record - stride, true)
        } else if self.mirror.is_record_slot_erased() {
            return Err(FtwError::NotFound);
        } else {
            (tail.header, tail.record, false)
        })
    }

    /// Where the most recent sequence stands, as of the last operation.
    pub fn state(&self) -> WriteState {
        let Some(tail) = self.mirror.tail() else {
            return WriteState::Unallocated;
        };
        let Some((header, record)) = self.mirror.last().filter(|(h, _)| h.is_allocated()) else {
            return if tail.previous.is_some() {
                WriteState::Complete
            } else {
                WriteState::Unallocated
            };
        };
        if header.is_complete() {
            WriteState::Complete
        } else if !header.state().is_set(StateBit::WritesAllocated) {
            WriteState::HeaderAllocated
        } else if self.mirror.is_record_slot_erased() {
            WriteState::WritesAllocated
        } else {
            match RecordProgress::decode(record.state()) {
                Some(RecordProgress::SpareComplete) => WriteState::SpareComplete,
                Some(RecordProgress::DestinationComplete) => WriteState::DestinationComplete,
                Some(RecordProgress::Pending) | None => WriteState::RecordAllocated,
            }
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The in-memory copy of the work space.
    pub fn work_space(&self) -> &WorkSpace {
        &self.mirror
    }

    /// Shuts the engine down and hands back its devices.
    pub fn into_inner(self) -> (D, D, Option<BootBlockAccess<D, S>>) {
        (self.work, self.spare, self.boot)
    }
}
