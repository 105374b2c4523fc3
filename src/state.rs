// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-way state bits.
//!
//! Flash bits can be moved from the erased state (1) to the programmed state
//! (0) one at a time, but moving them back requires erasing the whole block.
//! Every piece of progress the engine records is encoded as one such bit, and
//! a bit is considered "Set" once it has been programmed.

/// Value of a byte in freshly erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Logical state of a single one-way bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BitState {
    /// The bit still holds its erased value.
    Erased,
    /// The bit has been programmed. Only an erase can undo this.
    Set,
}

/// Attempt to move a bit from `Set` back to `Erased` without an erase.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Unprogram;

impl BitState {
    /// State of the bit selected by masking a raw byte: zero means
    /// programmed.
    fn from_masked(v: u8) -> Self {
        if v == 0 {
            BitState::Set
        } else {
            BitState::Erased
        }
    }

    /// Moves the bit to `to`, refusing the one transition flash can't do.
    pub fn transition(self, to: BitState) -> Result<BitState, Unprogram> {
        match (self, to) {
            (BitState::Set, BitState::Erased) => Err(Unprogram),
            (_, to) => Ok(to),
        }
    }

    pub fn is_set(self) -> bool {
        self == BitState::Set
    }
}

/// Names of every state bit stored in the log, and where in its state byte
/// each one lives.
///
/// The three record kinds each have their own state byte, so masks repeat
/// between kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateBit {
    // Work-space header.
    WorkingBlockValid,
    WorkingBlockInvalid,

    // Write header.
    HeaderAllocated,
    WritesAllocated,
    Complete,

    // Write record.
    BootBlockUpdate,
    SpareComplete,
    DestinationComplete,
}

impl StateBit {
    pub const fn mask(self) -> u8 {
        match self {
            Self::WorkingBlockValid => 0x01,
            Self::WorkingBlockInvalid => 0x02,
            Self::HeaderAllocated => 0x01,
            Self::WritesAllocated => 0x02,
            Self::Complete => 0x04,
            Self::BootBlockUpdate => 0x01,
            Self::SpareComplete => 0x02,
            Self::DestinationComplete => 0x04,
        }
    }
}

/// Raw contents of a state byte as it appears on flash.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StateByte(pub u8);

impl StateByte {
    pub const ERASED: Self = Self(ERASED_BYTE);

    pub fn get(self, bit: StateBit) -> BitState {
        BitState::from_masked(self.0 & bit.mask())
    }

    pub fn is_set(self, bit: StateBit) -> bool {
        self.get(bit).is_set()
    }

    /// Returns this byte with `bit` programmed. Every other bit is left as it
    /// was, so the result can always be written over `self`.
    #[must_use]
    pub fn with(self, bit: StateBit) -> Self {
        Self(self.0 & !bit.mask())
    }

    /// Checks whether programming `next` over `self` would produce `next`,
    /// i.e. no bit has to go from programmed back to erased.
    pub fn can_become(self, next: StateByte) -> bool {
        (0..8).all(|i| {
            let m = 1u8 << i;
            BitState::from_masked(self.0 & m)
                .transition(BitState::from_masked(next.0 & m))
                .is_ok()
        })
    }
}

/// Errors from programming a state byte on a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StateError<E> {
    /// The requested byte would need a bit unprogrammed. Holds what flash
    /// actually contains; nothing was written.
    Unprogram(StateByte),
    Device(E),
}

impl<E> From<E> for StateError<E> {
    fn from(e: E) -> Self {
        Self::Device(e)
    }
}

/// Progress of a single write record through the spare/destination copy.
///
/// Decoded from the SpareComplete and DestinationComplete bits; any other
/// combination means the record was never written in order and can't be
/// trusted.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum RecordProgress {
    Pending = 0b000,
    SpareComplete = 0b010,
    DestinationComplete = 0b110,
}

impl RecordProgress {
    pub fn decode(state: StateByte) -> Option<Self> {
        use num_traits::FromPrimitive;

        let mask = StateBit::SpareComplete.mask()
            | StateBit::DestinationComplete.mask();
        Self::from_u8(!state.0 & mask)
    }
}
