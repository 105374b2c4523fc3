// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compacting the log.
//!
//! Finished header groups are dead weight. Reclaim rebuilds the working block
//! with a fresh work space holding, at most, the one group still in flight,
//! and swaps it in through the spare like any other working-block update.

use zerocopy::AsBytes;

use crate::device::{BlockDevice, BootSwap};
use crate::layout::WorkSpaceHeader;
use crate::state::{StateBit, ERASED_BYTE};
use crate::{FaultTolerantWrite, FtwError};

impl<D, S> FaultTolerantWrite<D, S>
    where D: BlockDevice,
          S: BootSwap<D::Error>,
{
    /// Rebuilds the working block with an empty log.
    ///
    /// With `preserve` set, the group that is still in flight according to
    /// the mirror (if any) is copied, byte for byte, to just after the new
    /// work-space header. The rest of the working block, outside the work
    /// space, is carried over unchanged. Whatever the spare held beforehand
    /// is put back afterwards.
    pub(crate) fn reclaim(&mut self, preserve: bool) -> Result<(), FtwError<D::Error>> {
        let l = self.layout;
        log::info!("ftw: reclaiming work space");

        self.work.read(l.work_block_lba, 0, &mut self.scratch)?;
        let ws = &mut self.scratch[l.work_space_offset..][..l.work_space_size];
        ws.fill(ERASED_BYTE);
        ws[..WorkSpaceHeader::SIZE]
            .copy_from_slice(WorkSpaceHeader::fresh(l.work_space_size).as_bytes());
        if preserve {
            if let Some(group) = self.mirror.open_group() {
                log::debug!("ftw: keeping {} bytes of pending writes", group.len());
                ws[WorkSpaceHeader::SIZE..][..group.len()].copy_from_slice(group);
            }
        }

        self.save_spare()?;
        self.program_spare()?;
        self.spare.set_state_bit(l.spare_lba, l.header_state_offset(), StateBit::WorkingBlockValid)?;
        self.flush_spare_to_working()?;
        self.restore_spare()?;

        log::info!("ftw: work space reclaimed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::AsBytes;

    use crate::layout::{self, CallerId, WorkSpaceHeader, WriteHeader, WriteRecord};
    use crate::state::StateBit;
    use crate::testutil::{Rig, Tear};
    use crate::WriteState;

    /// Log with a couple of finished groups and one in flight: three writes
    /// allocated, the first of them done.
    fn busy_log(rig: &Rig) -> crate::testutil::SimFtw {
        let mut ftw = rig.start().unwrap();
        let mut target = rig.target.clone();
        for i in 0..2u8 {
            ftw.write(0, 0, None, &mut target, &[i; 4]).unwrap();
        }
        ftw.allocate(CallerId([0x33; 16]), 8, 3).unwrap();
        ftw.write(2, 0x10, Some(&[0xA5; 8]), &mut target, &[0x77; 4]).unwrap();
        ftw
    }

    #[test]
    fn reclaim_keeps_pending_group_bit_for_bit() {
        let rig = Rig::new();
        let mut ftw = busy_log(&rig);
        let tail = ftw.work_space().tail().unwrap();
        let size = layout::group_size(3, 8).unwrap();
        let group = ftw.work_space().bytes()[tail.header..][..size].to_vec();

        ftw.reclaim(true).unwrap();

        let ws = rig.work_space();
        assert_eq!(&ws[WorkSpaceHeader::SIZE..][..size], &group[..]);
        assert!(layout::is_erased(&ws[WorkSpaceHeader::SIZE + size..]));
        assert_eq!(&ws[..WorkSpaceHeader::SIZE], WorkSpaceHeader::template(Rig::WS_SIZE).as_bytes());

        let tail = ftw.work_space().tail().unwrap();
        assert_eq!(tail.header, WorkSpaceHeader::SIZE);
        assert_eq!(tail.record, WorkSpaceHeader::SIZE + WriteHeader::SIZE + WriteRecord::SIZE + 8);
        assert_eq!(tail.previous, None);
        assert_eq!(ftw.state(), WriteState::WritesAllocated);
    }

    #[test]
    fn reclaim_without_preserve_empties_log() {
        let rig = Rig::new();
        let mut ftw = busy_log(&rig);
        ftw.reclaim(false).unwrap();
        let ws = rig.work_space();
        assert!(layout::is_erased(&ws[WorkSpaceHeader::SIZE..]));
        assert_eq!(ftw.state(), WriteState::Unallocated);
    }

    #[test]
    fn reclaim_preserves_spare_and_rest_of_working_block() {
        let rig = Rig::new();
        let mut ftw = rig.start().unwrap();
        rig.spare.poke(0, 0, &[0x42; Rig::SPARE]);
        rig.work.poke(0, 0, &[0x24; Rig::WS_OFFSET]);

        ftw.reclaim(true).unwrap();
        assert_eq!(rig.spare.peek(0, 0, Rig::SPARE), vec![0x42; Rig::SPARE]);
        assert_eq!(rig.work.peek(0, 0, Rig::WS_OFFSET), vec![0x24; Rig::WS_OFFSET]);
    }

    #[test]
    fn reclaim_survives_power_loss_anywhere() {
        for tear in [Tear::None, Tear::Half] {
            for cut in 0.. {
                let rig = Rig::new();
                let mut ftw = busy_log(&rig);
                let tail = ftw.work_space().tail().unwrap();
                let size = layout::group_size(3, 8).unwrap();
                let group = ftw.work_space().bytes()[tail.header..][..size].to_vec();

                rig.chip.cut_after(cut, tear);
                let r = ftw.reclaim(true);
                rig.chip.reboot();

                let mut ftw = rig.start().unwrap();
                ftw.refresh().unwrap();
                let ws = ftw.work_space().bytes().to_vec();
                let tail = ftw.work_space().tail().unwrap();
                // Either the old log or the compacted one, and the pending
                // group survives intact in both.
                assert_eq!(&ws[tail.header..][..size], &group[..], "{:?} cut {}", tear, cut);
                let h = layout::header_at(&ws, tail.header).unwrap();
                assert!(h.state().is_set(StateBit::WritesAllocated));
                assert!(!h.is_complete());
                assert_eq!(rig.chip.unprogram_attempts(), 0);
                if r.is_ok() {
                    break;
                }
            }
        }
    }
}
