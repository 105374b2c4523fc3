// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capabilities the engine borrows from the platform: block devices and the
//! boot-block address-range swap.

use core::ops::Range;
use crate::state::{StateBit, StateByte, StateError};

/// Shape of a block device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Size of one erase block in bytes.
    pub block_size: usize,
    /// Number of blocks in the device.
    pub block_count: u64,
}

impl Geometry {
    /// Total size of the device in bytes.
    pub fn len(&self) -> u64 {
        self.block_size as u64 * self.block_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Trait describing one region of block-erasable flash, as seen through some
/// handle the platform gives us.
///
/// Several handles may refer to overlapping physical flash; the engine tells
/// them apart by `physical_address`.
pub trait BlockDevice {
    /// Error type that can be produced during flash accesses.
    type Error;

    /// Returns the block size and block count. Like the physical address this
    /// can't fail, and is expected to return the same result every time.
    fn geometry(&self) -> Geometry;

    /// Physical address of block 0.
    fn physical_address(&self) -> u64;

    /// Reads `dest.len()` bytes starting `offset` bytes into block `lba`.
    /// `offset` may be larger than a block, and the read may span blocks.
    fn read(
        &self,
        lba: u64,
        offset: usize,
        dest: &mut [u8],
    ) -> Result<(), Self::Error>;

    /// Programs `data` starting `offset` bytes into block `lba`. Programming
    /// can only move bits from 1 to 0; the result in flash is the bitwise AND
    /// of the old contents and `data`.
    ///
    /// On error the range _may or may not_ contain the data, or some prefix
    /// of it.
    fn write(
        &mut self,
        lba: u64,
        offset: usize,
        data: &[u8],
    ) -> Result<(), Self::Error>;

    /// Erases `count` blocks starting at `lba`, resetting every bit to 1.
    fn erase_blocks(&mut self, lba: u64, count: u64) -> Result<(), Self::Error>;

    /// Programs the state byte at `offset` from the start of block `lba` to
    /// `next`, returning it.
    ///
    /// Nothing is written if flash already holds `next`, and the write is
    /// refused with `StateError::Unprogram` if getting there would take any
    /// bit from programmed back to erased.
    fn program_state(
        &mut self,
        lba: u64,
        offset: usize,
        next: StateByte,
    ) -> Result<StateByte, StateError<Self::Error>> {
        let mut byte = [0];
        self.read(lba, offset, &mut byte)?;
        let old = StateByte(byte[0]);
        if !old.can_become(next) {
            return Err(StateError::Unprogram(old));
        }
        if next != old {
            self.write(lba, offset, &[next.0])?;
        }
        Ok(next)
    }

    /// Programs a single one-way state bit in the byte at `offset` from the
    /// start of block `lba`, leaving the rest of the byte untouched. Returns
    /// the resulting byte.
    ///
    /// This is the only way the engine records progress, so every update is a
    /// single byte-sized write that clears exactly one more bit.
    fn set_state_bit(
        &mut self,
        lba: u64,
        offset: usize,
        bit: StateBit,
    ) -> Result<StateByte, StateError<Self::Error>> {
        let mut byte = [0];
        self.read(lba, offset, &mut byte)?;
        self.program_state(lba, offset, StateByte(byte[0]).with(bit))
    }

    /// Range of physical addresses covered by `count` blocks starting at
    /// `lba`.
    fn span(&self, lba: u64, count: u64) -> Range<u64> {
        let bs = self.geometry().block_size as u64;
        let start = self.physical_address() + lba * bs;
        start..start + count * bs
    }
}

/// Location of the boot block and of its alternate alias.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SwapRanges {
    pub boot_base: u64,
    pub boot_size: u64,
    pub alt_base: u64,
    pub alt_size: u64,
}

impl SwapRanges {
    pub fn boot(&self) -> Range<u64> {
        self.boot_base..self.boot_base + self.boot_size
    }

    pub fn alt(&self) -> Range<u64> {
        self.alt_base..self.alt_base + self.alt_size
    }
}

/// Boot-block address-range swap. While the swap is engaged the CPU fetches
/// its reset vector from the alternate range, which leaves the real boot
/// block free to be erased.
pub trait BootSwap<E> {
    fn range_location(&self) -> SwapRanges;

    fn swap_state(&self) -> Result<bool, E>;

    fn set_swap_state(&mut self, engaged: bool) -> Result<(), E>;
}

/// Stand-in for platforms without a boot-block swap. Can't be constructed.
#[derive(Debug)]
pub enum NoSwap {}

impl<E> BootSwap<E> for NoSwap {
    fn range_location(&self) -> SwapRanges {
        match *self {}
    }

    fn swap_state(&self) -> Result<bool, E> {
        match *self {}
    }

    fn set_swap_state(&mut self, _engaged: bool) -> Result<(), E> {
        match *self {}
    }
}

/// Everything needed to update the boot block: the swap capability, a handle
/// on the boot block itself and a handle on the alternate range.
pub struct BootBlockAccess<D, S> {
    pub swap: S,
    pub boot: D,
    pub alt: D,
}

/// Returns true if the two ranges share at least one address.
pub(crate) fn overlaps(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::SimFlash;

    #[test]
    fn set_state_bit_programs_one_bit() {
        let chip = SimFlash::new(256, 2);
        let mut dev = chip.region(0, 2);

        let b = dev.set_state_bit(1, 3, StateBit::WritesAllocated).unwrap();
        assert_eq!(b, StateByte(0xFD));
        let b = dev.set_state_bit(1, 3, StateBit::Complete).unwrap();
        assert_eq!(b, StateByte(0xF9));

        let mut out = [0; 1];
        dev.read(1, 3, &mut out).unwrap();
        assert_eq!(out, [0xF9]);
        assert_eq!(chip.unprogram_attempts(), 0);
    }

    #[test]
    fn set_state_bit_skips_write_when_already_set() {
        let chip = SimFlash::new(256, 1);
        let mut dev = chip.region(0, 1);

        dev.set_state_bit(0, 0, StateBit::HeaderAllocated).unwrap();
        let ops = chip.durable_ops();
        dev.set_state_bit(0, 0, StateBit::HeaderAllocated).unwrap();
        assert_eq!(chip.durable_ops(), ops);
    }

    #[test]
    fn program_state_refuses_unprogramming() {
        let chip = SimFlash::new(256, 1);
        let mut dev = chip.region(0, 1);

        dev.program_state(0, 5, StateByte(0xF0)).unwrap();
        let ops = chip.durable_ops();
        assert_eq!(
            dev.program_state(0, 5, StateByte(0xF8)),
            Err(StateError::Unprogram(StateByte(0xF0))),
        );
        // Refused before anything reached the device.
        assert_eq!(chip.durable_ops(), ops);
        assert_eq!(chip.unprogram_attempts(), 0);

        assert_eq!(dev.program_state(0, 5, StateByte(0x70)), Ok(StateByte(0x70)));
        let mut out = [0; 1];
        dev.read(0, 5, &mut out).unwrap();
        assert_eq!(out, [0x70]);
    }

    #[test]
    fn span_and_overlap() {
        let chip = SimFlash::new(512, 8);
        let dev = chip.region(2, 4);
        let s = dev.span(1, 2);
        assert_eq!(s.end - s.start, 1024);
        assert_eq!(s.start, dev.physical_address() + 512);

        assert!(overlaps(&(0..10), &(9..20)));
        assert!(!overlaps(&(0..10), &(10..20)));
    }
}
