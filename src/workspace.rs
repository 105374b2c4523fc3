// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory mirror of the work space, and keeping it in step with flash.

use alloc::vec;
use alloc::vec::Vec;
use zerocopy::AsBytes;

use crate::device::{BlockDevice, BootSwap};
use crate::layout::{
    self, LayoutError, Tail, WorkSpaceHeader, WriteHeader, WriteRecord,
};
use crate::state::{StateBit, StateByte, ERASED_BYTE};
use crate::{FaultTolerantWrite, FtwError};

/// Copy of the work space, plus where its log ends.
pub struct WorkSpace {
    buf: Vec<u8>,
    tail: Option<Tail>,
}

impl WorkSpace {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![ERASED_BYTE; size],
            tail: None,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Checks the work-space header, byte for byte, against the only
    /// contents a usable working copy can have.
    pub fn is_valid(&self) -> bool {
        let expected = WorkSpaceHeader::template(self.buf.len());
        self.buf.get(..WorkSpaceHeader::SIZE) == Some(expected.as_bytes())
    }

    /// Re-walks the log. On failure the tail is forgotten, so nothing in the
    /// log will be treated as in flight until it has been rebuilt.
    pub(crate) fn relocate(&mut self) -> Result<Tail, LayoutError> {
        let r = layout::find_tail(&self.buf);
        self.tail = r.ok();
        r
    }

    pub fn tail(&self) -> Option<Tail> {
        self.tail
    }

    /// Copies of the last write header and last write record.
    pub fn last(&self) -> Option<(WriteHeader, WriteRecord)> {
        let tail = self.tail?;
        let h = layout::header_at(&self.buf, tail.header)?;
        let r = layout::record_at(&self.buf, tail.record)?;
        Some((*h, *r))
    }

    /// Whether the last record is the first slot of its group.
    pub fn is_first_record(&self) -> bool {
        matches!(self.tail, Some(t) if t.record == t.header + WriteHeader::SIZE)
    }

    /// Whether the last record is the final slot of its group.
    pub fn is_last_record(&self) -> bool {
        let Some(t) = self.tail else { return false };
        let Some(h) = layout::header_at(&self.buf, t.header) else { return false };
        let (Some(stride), n) = (h.record_stride(), h.number_of_writes.get()) else {
            return false;
        };
        n > 0 && t.record == t.header + WriteHeader::SIZE + (n as usize - 1) * stride
    }

    /// Whether the last record's slot, including its private data, has never
    /// been programmed.
    pub fn is_record_slot_erased(&self) -> bool {
        let Some(t) = self.tail else { return false };
        let Some(stride) = layout::header_at(&self.buf, t.header)
            .and_then(|h| h.record_stride()) else { return false };
        self.buf.get(t.record..t.record + stride).map_or(false, layout::is_erased)
    }

    /// Whether everything past the end of the log is erased. Anything else
    /// there is left over from an interrupted write.
    pub fn is_tail_erased(&self) -> bool {
        match self.tail {
            Some(t) => layout::is_erased(&self.buf[t.end..]),
            None => false,
        }
    }

    /// The group that is still in flight, as raw bytes, if there is one.
    pub fn open_group(&self) -> Option<&[u8]> {
        let t = self.tail?;
        let h = layout::header_at(&self.buf, t.header)?;
        if !h.is_allocated() || h.is_complete() {
            return None;
        }
        self.buf.get(t.header..t.header + h.group_size()?)
    }

    pub(crate) fn set_bit(&mut self, offset: usize, bit: StateBit) {
        if let Some(b) = self.buf.get_mut(offset) {
            *b = StateByte(*b).with(bit).0;
        }
    }
}

impl<D, S> FaultTolerantWrite<D, S>
    where D: BlockDevice,
          S: BootSwap<D::Error>,
{
    /// Loads the mirror from the working block, without interpreting it.
    pub(crate) fn read_work_space(&mut self) -> Result<(), D::Error> {
        let l = self.layout;
        self.work.read(l.work_block_lba, l.work_space_offset, self.mirror.bytes_mut())
    }

    /// Loads the mirror from the copy of the work space in the spare block.
    pub(crate) fn read_spare_work_space(&mut self) -> Result<(), D::Error> {
        let l = self.layout;
        self.spare.read(l.spare_lba, l.work_space_offset, self.mirror.bytes_mut())
    }

    /// Re-walks the mirror after changing it, logging rather than failing if
    /// the log can't be read; the next refresh will rebuild it.
    pub(crate) fn settle(&mut self) {
        if let Err(e) = self.mirror.relocate() {
            log::warn!("ftw: log unreadable after update: {:?}", e);
        }
    }

    /// Rebuilds an unusable working block: from the copy of the work space in
    /// the spare if that one is valid, otherwise as an empty log.
    pub(crate) fn restore_work_space(&mut self) -> Result<(), FtwError<D::Error>> {
        self.read_spare_work_space()?;
        if self.mirror.is_valid() {
            log::warn!("ftw: working block invalid, restoring it from spare");
            self.flush_spare_to_working()?;
            self.finish_working_block_update()
        } else {
            log::warn!("ftw: no valid work space found, starting an empty log");
            self.reclaim(false)
        }
    }

    /// Reloads the mirror from flash and finds the last header and record.
    ///
    /// A working block with a bad work-space header is rebuilt first. If the
    /// log can't be walked the work space is reclaimed and reloaded once. A
    /// log that still can't be used after that is corrupt.
    ///
    /// Running out of room is left to `allocate`, the only operation that
    /// needs any: until then the newest finished group stays in the log.
    pub fn refresh(&mut self) -> Result<(), FtwError<D::Error>> {
        self.read_work_space()?;
        if !self.mirror.is_valid() {
            self.restore_work_space()?;
            self.read_work_space()?;
            if !self.mirror.is_valid() {
                log::error!("ftw: work space unusable after rebuilding it");
                return Err(FtwError::Corrupt);
            }
        }
        match self.mirror.relocate() {
            Ok(_) => return Ok(()),
            Err(e) => log::warn!("ftw: work space log is torn ({:?}), reclaiming", e),
        }

        self.reclaim(true)?;

        self.read_work_space()?;
        match self.mirror.relocate() {
            Ok(_) if self.mirror.is_valid() => Ok(()),
            _ => {
                log::error!("ftw: work space unusable after reclaim");
                Err(FtwError::Corrupt)
            }
        }
    }

    /// Durably programs one state bit of the work space, at `offset` from
    /// its start, and mirrors the change.
    pub(crate) fn set_work_bit(
        &mut self,
        offset: usize,
        bit: StateBit,
    ) -> Result<(), FtwError<D::Error>> {
        let l = self.layout;
        self.work.set_state_bit(l.work_block_lba, l.work_space_offset + offset, bit)?;
        self.mirror.set_bit(offset, bit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CallerId;
    use crate::testutil::{Rig, SimError};

    #[test]
    fn mirror_validity_is_exact() {
        let mut ws = WorkSpace::new(0x100);
        assert!(!ws.is_valid());

        ws.bytes_mut()[..WorkSpaceHeader::SIZE]
            .copy_from_slice(WorkSpaceHeader::template(0x100).as_bytes());
        assert!(ws.is_valid());

        // Invalid bit set.
        ws.set_bit(WorkSpaceHeader::STATE_OFFSET, StateBit::WorkingBlockInvalid);
        assert!(!ws.is_valid());

        // Template for a different size has a different queue size and CRC.
        let mut ws = WorkSpace::new(0x100);
        ws.bytes_mut()[..WorkSpaceHeader::SIZE]
            .copy_from_slice(WorkSpaceHeader::template(0x200).as_bytes());
        assert!(!ws.is_valid());
    }

    #[test]
    fn allocate_reclaims_full_log() {
        let rig = Rig::new();
        let mut ftw = rig.start().unwrap();

        // Fill the log with finished writes until Allocate had to reclaim.
        let mut reclaimed = false;
        let mut last_header = 0;
        for i in 0..32u8 {
            ftw.allocate(CallerId([i; 16]), 0, 1).unwrap();
            let h = ftw.work_space().tail().unwrap().header;
            if h < last_header {
                reclaimed = true;
            }
            last_header = h;
            ftw.write(0, 0, None, &mut rig.target.clone(), &[i; 8]).unwrap();
        }
        assert!(reclaimed);
        assert_eq!(rig.chip.unprogram_attempts(), 0);
        assert_eq!(rig.target.peek(0, 0, 8), vec![31; 8]);
    }

    #[test]
    fn refresh_keeps_full_log_until_allocate() {
        let rig = Rig::new();
        let mut ftw = rig.start().unwrap();
        let group = WriteHeader::SIZE + WriteRecord::SIZE;
        let fit = (Rig::WS_SIZE - WorkSpaceHeader::SIZE) / group;
        for i in 0..fit as u8 {
            ftw.write(0, 0, None, &mut rig.target.clone(), &[i; 8]).unwrap();
        }

        // Not even a header fits now, but the finished groups stay put.
        ftw.refresh().unwrap();
        let tail = ftw.work_space().tail().unwrap();
        assert_eq!(tail.header, WorkSpaceHeader::SIZE + fit * group);
        assert_eq!(tail.previous, Some(tail.header - group));
    }

    #[test]
    fn refresh_rebuilds_damaged_working_block_as_empty_log() {
        let rig = Rig::new();
        let mut ftw = rig.start().unwrap();
        ftw.write(0, 0, None, &mut rig.target.clone(), &[3; 8]).unwrap();
        // Scribble on the signature.
        rig.work.poke(0, Rig::WS_OFFSET, &[0]);

        ftw.refresh().unwrap();
        assert!(ftw.work_space().is_valid());
        assert_eq!(ftw.state(), crate::WriteState::Unallocated);
        assert!(layout::is_erased(&rig.work_space()[WorkSpaceHeader::SIZE..]));
    }

    #[test]
    fn refresh_restores_damaged_working_block_from_spare() {
        let rig = Rig::new();
        let mut ftw = rig.start().unwrap();
        ftw.allocate(CallerId([9; 16]), 0, 2).unwrap();
        ftw.write(1, 0, None, &mut rig.target.clone(), &[4; 8]).unwrap();
        let log = rig.work_space();

        // A good copy sits in the spare, and the working one is damaged.
        rig.spare.poke(0, 0, &rig.work.peek(0, 0, Rig::SPARE));
        rig.work.poke(0, Rig::WS_OFFSET, &[0]);

        ftw.refresh().unwrap();
        assert_eq!(rig.work_space(), log);
        assert_eq!(ftw.state(), crate::WriteState::WritesAllocated);
        assert_eq!(rig.chip.unprogram_attempts(), 0);
    }

    #[test]
    fn refresh_surfaces_device_errors() {
        let rig = Rig::new();
        let mut ftw = rig.start().unwrap();
        rig.chip.cut_after(0, crate::testutil::Tear::None);
        // Trip the power with a durable op, then try to refresh.
        let _ = ftw.abort();
        let _ = ftw.allocate(CallerId::default(), 0, 1);
        assert!(rig.chip.is_dead());
        assert_eq!(ftw.refresh(), Err(FtwError::Device(SimError::PowerLoss)));
    }
}
