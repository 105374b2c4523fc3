// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated NOR flash for tests, with power-cut injection.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use crate::config::{FtwConfig, RegionConfig};
use crate::device::{BlockDevice, BootBlockAccess, BootSwap, Geometry, SwapRanges};
use crate::layout::CallerId;
use crate::FaultTolerantWrite;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimError {
    /// Power went away during or before this operation.
    PowerLoss,
    /// Access outside the region.
    OutOfRange,
}

/// What happens to the operation that gets interrupted by a power cut.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tear {
    /// Nothing reaches flash.
    None,
    /// The first half of the bytes are programmed (or erased).
    Half,
}

struct Chip {
    bytes: Vec<u8>,
    block_size: usize,
    /// Durable operations left before the power goes, and how it goes.
    cut: Option<(usize, Tear)>,
    dead: bool,
    ops: usize,
    unprogram: usize,
    swapped: bool,
}

impl Chip {
    /// Accounts for one program/erase/swap. Returns `Some(tear)` if power
    /// fails during it.
    fn durable(&mut self) -> Result<Option<Tear>, SimError> {
        if self.dead {
            return Err(SimError::PowerLoss);
        }
        match &mut self.cut {
            Some((0, tear)) => {
                self.dead = true;
                Ok(Some(*tear))
            }
            Some((n, _)) => {
                *n -= 1;
                self.ops += 1;
                Ok(None)
            }
            None => {
                self.ops += 1;
                Ok(None)
            }
        }
    }

    fn program(&mut self, at: usize, data: &[u8]) {
        for (b, &d) in self.bytes[at..at + data.len()].iter_mut().zip(data) {
            if d & !*b != 0 {
                self.unprogram += 1;
            }
            *b &= d;
        }
    }
}

/// A whole flash chip. Cheap to clone; clones share the same contents.
#[derive(Clone)]
pub struct SimFlash(Rc<RefCell<Chip>>);

impl SimFlash {
    /// Physical address the chip is mapped at.
    pub const BASE: u64 = 0xFF80_0000;

    pub fn new(block_size: usize, blocks: usize) -> Self {
        Self(Rc::new(RefCell::new(Chip {
            bytes: vec![0xFF; block_size * blocks],
            block_size,
            cut: None,
            dead: false,
            ops: 0,
            unprogram: 0,
            swapped: false,
        })))
    }

    pub fn block_size(&self) -> usize {
        self.0.borrow().block_size
    }

    /// Handle on `blocks` blocks starting at chip block `first`.
    pub fn region(&self, first: usize, blocks: usize) -> SimRegion {
        SimRegion {
            chip: self.clone(),
            first,
            blocks,
        }
    }

    /// Lets `ops` more durable operations succeed, then cuts the power during
    /// the next one.
    pub fn cut_after(&self, ops: usize, tear: Tear) {
        let mut c = self.0.borrow_mut();
        c.cut = Some((ops, tear));
    }

    /// Restores power. Flash contents are kept as they are.
    pub fn reboot(&self) {
        let mut c = self.0.borrow_mut();
        c.cut = None;
        c.dead = false;
    }

    pub fn is_dead(&self) -> bool {
        self.0.borrow().dead
    }

    /// Number of program/erase/swap operations that have reached flash.
    pub fn durable_ops(&self) -> usize {
        self.0.borrow().ops
    }

    /// Number of bytes a write tried to move from 0 back to 1.
    pub fn unprogram_attempts(&self) -> usize {
        self.0.borrow().unprogram
    }

    pub fn swapped(&self) -> bool {
        self.0.borrow().swapped
    }

    /// Raw bytes at chip-relative `range`.
    pub fn bytes(&self, range: Range<usize>) -> Vec<u8> {
        self.0.borrow().bytes[range].to_vec()
    }

    /// Overwrites chip-relative bytes without going through flash rules.
    pub fn poke(&self, at: usize, data: &[u8]) {
        self.0.borrow_mut().bytes[at..at + data.len()].copy_from_slice(data);
    }
}

/// A block device view onto part of a `SimFlash`.
#[derive(Clone)]
pub struct SimRegion {
    chip: SimFlash,
    first: usize,
    blocks: usize,
}

impl SimRegion {
    fn locate(&self, lba: u64, offset: usize, len: usize) -> Result<usize, SimError> {
        let bs = self.chip.block_size();
        let start = usize::try_from(lba).map_err(|_| SimError::OutOfRange)?
            .checked_mul(bs)
            .and_then(|s| s.checked_add(offset))
            .ok_or(SimError::OutOfRange)?;
        let end = start.checked_add(len).ok_or(SimError::OutOfRange)?;
        if end > self.blocks * bs {
            return Err(SimError::OutOfRange);
        }
        Ok(self.first * bs + start)
    }

    /// Chip-relative byte range of `len` bytes at `offset` into block `lba`.
    pub fn chip_range(&self, lba: u64, offset: usize, len: usize) -> Range<usize> {
        let at = self.locate(lba, offset, len).expect("range outside region");
        at..at + len
    }

    /// Reads without regard to power state; for checking results.
    pub fn peek(&self, lba: u64, offset: usize, len: usize) -> Vec<u8> {
        self.chip.bytes(self.chip_range(lba, offset, len))
    }

    /// Writes without regard to flash rules; for setting up scenarios.
    pub fn poke(&self, lba: u64, offset: usize, data: &[u8]) {
        let r = self.chip_range(lba, offset, data.len());
        self.chip.poke(r.start, data);
    }
}

impl BlockDevice for SimRegion {
    type Error = SimError;

    fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.chip.block_size(),
            block_count: self.blocks as u64,
        }
    }

    fn physical_address(&self) -> u64 {
        SimFlash::BASE + (self.first * self.chip.block_size()) as u64
    }

    fn read(&self, lba: u64, offset: usize, dest: &mut [u8]) -> Result<(), SimError> {
        let at = self.locate(lba, offset, dest.len())?;
        let c = self.chip.0.borrow();
        if c.dead {
            return Err(SimError::PowerLoss);
        }
        dest.copy_from_slice(&c.bytes[at..at + dest.len()]);
        Ok(())
    }

    fn write(&mut self, lba: u64, offset: usize, data: &[u8]) -> Result<(), SimError> {
        let at = self.locate(lba, offset, data.len())?;
        let mut c = self.chip.0.borrow_mut();
        match c.durable()? {
            None => {
                c.program(at, data);
                Ok(())
            }
            Some(Tear::Half) => {
                c.program(at, &data[..data.len() / 2]);
                Err(SimError::PowerLoss)
            }
            Some(Tear::None) => Err(SimError::PowerLoss),
        }
    }

    fn erase_blocks(&mut self, lba: u64, count: u64) -> Result<(), SimError> {
        let bs = self.chip.block_size();
        let len = usize::try_from(count).map_err(|_| SimError::OutOfRange)? * bs;
        let at = self.locate(lba, 0, len)?;
        let mut c = self.chip.0.borrow_mut();
        match c.durable()? {
            None => {
                c.bytes[at..at + len].fill(0xFF);
                Ok(())
            }
            Some(Tear::Half) => {
                c.bytes[at..at + len / 2].fill(0xFF);
                Err(SimError::PowerLoss)
            }
            Some(Tear::None) => Err(SimError::PowerLoss),
        }
    }
}

/// Swap capability whose state lives in the chip, so it survives reboots.
pub struct SimSwap {
    chip: SimFlash,
    ranges: SwapRanges,
}

impl SimSwap {
    pub fn new(chip: &SimFlash, boot: &SimRegion, alt: &SimRegion) -> Self {
        let bg = boot.geometry();
        let ag = alt.geometry();
        Self {
            chip: chip.clone(),
            ranges: SwapRanges {
                boot_base: boot.physical_address(),
                boot_size: bg.len(),
                alt_base: alt.physical_address(),
                alt_size: ag.len(),
            },
        }
    }
}

impl BootSwap<SimError> for SimSwap {
    fn range_location(&self) -> SwapRanges {
        self.ranges
    }

    fn swap_state(&self) -> Result<bool, SimError> {
        let c = self.chip.0.borrow();
        if c.dead {
            return Err(SimError::PowerLoss);
        }
        Ok(c.swapped)
    }

    fn set_swap_state(&mut self, engaged: bool) -> Result<(), SimError> {
        let mut c = self.chip.0.borrow_mut();
        match c.durable()? {
            None => {
                c.swapped = engaged;
                Ok(())
            }
            Some(_) => Err(SimError::PowerLoss),
        }
    }
}

pub type SimFtw = FaultTolerantWrite<SimRegion, SimSwap>;

/// A chip carved up the way a small firmware image might be:
///
/// ```text
/// blocks  0..6   target (e.g. a variable store)
/// blocks  6..8   working block, work space at +0x100, 0x300 bytes
/// blocks  8..10  spare
/// blocks 10..12  alternate boot range
/// blocks 12..14  boot block
/// ```
pub struct Rig {
    pub chip: SimFlash,
    pub target: SimRegion,
    pub work: SimRegion,
    pub spare: SimRegion,
    pub alt: SimRegion,
    pub boot: SimRegion,
    pub config: FtwConfig,
}

impl Rig {
    pub const BLOCK: usize = 512;
    pub const SPARE: usize = 2 * Self::BLOCK;
    pub const WS_OFFSET: usize = 0x100;
    pub const WS_SIZE: usize = 0x300;

    pub fn new() -> Self {
        let chip = SimFlash::new(Self::BLOCK, 14);
        let target = chip.region(0, 6);
        let work = chip.region(6, 2);
        let spare = chip.region(8, 2);
        let alt = chip.region(10, 2);
        let boot = chip.region(12, 2);
        let config = FtwConfig {
            work_space: Some(RegionConfig {
                base: work.physical_address() + Self::WS_OFFSET as u64,
                length: Self::WS_SIZE,
            }),
            spare: Some(RegionConfig {
                base: spare.physical_address(),
                length: Self::SPARE,
            }),
            caller_id: CallerId([0xC0; 16]),
        };
        Self { chip, target, work, spare, alt, boot, config }
    }

    pub fn boot_access(&self) -> BootBlockAccess<SimRegion, SimSwap> {
        BootBlockAccess {
            swap: SimSwap::new(&self.chip, &self.boot, &self.alt),
            boot: self.boot.clone(),
            alt: self.alt.clone(),
        }
    }

    /// Brings up an engine the way firmware would at start of day.
    pub fn start(&self) -> Result<SimFtw, crate::InitError<SimError>> {
        FaultTolerantWrite::new(
            &self.config,
            self.work.clone(),
            self.spare.clone(),
            Some(self.boot_access()),
        )
    }

    /// Reads the raw work space off the working block.
    pub fn work_space(&self) -> Vec<u8> {
        self.work.peek(0, Self::WS_OFFSET, Self::WS_SIZE)
    }

    /// Fills the whole target device with a recognizable pattern.
    pub fn fill_target(&self, byte: u8) {
        let g = self.target.geometry();
        self.target.poke(0, 0, &vec![byte; g.len() as usize]);
    }
}
