// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! At-rest layout of the work space and traversal of the log it contains.
//!
//! The work space is a flat byte region:
//!
//! ```text
//! [WorkSpaceHeader][WriteHeader_0][WriteRecord_0 .. N0)[WriteHeader_1]...
//! ```
//!
//! Each write record is followed by `private_data_size` bytes of opaque client
//! payload. Everything after the last header group is erased.

use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes, Unaligned};
use crate::state::{StateBit, StateByte, ERASED_BYTE};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> Option<(&T, &[u8])>
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)?;
    Some((lv.into_ref(), rest))
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;
/// Shorthand for a `u64` in little-endian representation.
type U64LE = zerocopy::U64<byteorder::LittleEndian>;

/// 128-bit identifier of the component that allocated a write.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CallerId(pub [u8; 16]);

/// Header at the very start of the work space.
///
/// Only the state byte is ever modified once the header is on flash; the rest
/// must match `WorkSpaceHeader::template` exactly for the work space to be
/// accepted.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct WorkSpaceHeader {
    /// `WorkSpaceHeader::SIGNATURE`, distinguishing a work space from
    /// arbitrary data.
    pub signature: [u8; 16],
    /// CRC32 of the other fields, computed with the state byte erased.
    pub crc: U32LE,
    /// WorkingBlockValid / WorkingBlockInvalid.
    pub state: u8,
    /// Reserved, left erased.
    pub reserved: [u8; 3],
    /// Bytes available to write headers and records after this header.
    pub write_queue_size: U64LE,
}

impl WorkSpaceHeader {
    pub const SIZE: usize = size_of::<Self>();
    /// Offset of the state byte from the start of the header.
    pub const STATE_OFFSET: usize = 20;

    /// Random identifier marking a formatted work space.
    pub const SIGNATURE: [u8; 16] = [
        0x3e, 0x7c, 0x0b, 0x9a, 0x51, 0xd4, 0x4f, 0x26,
        0x8a, 0x3d, 0xe1, 0x5c, 0x92, 0x07, 0xb8, 0x6f,
    ];

    /// Header with fixed fields and CRC filled in and both state bits erased.
    /// This is what gets programmed when the work space is (re)built.
    pub fn fresh(work_space_size: usize) -> Self {
        let mut h = Self {
            signature: Self::SIGNATURE,
            crc: 0.into(),
            state: ERASED_BYTE,
            reserved: [ERASED_BYTE; 3],
            write_queue_size: ((work_space_size - Self::SIZE) as u64).into(),
        };
        h.crc = h.expected_crc().into();
        h
    }

    /// The only header contents we accept as a valid working copy: the fresh
    /// header with WorkingBlockValid set and WorkingBlockInvalid erased.
    pub fn template(work_space_size: usize) -> Self {
        let mut h = Self::fresh(work_space_size);
        h.state = StateByte(h.state).with(StateBit::WorkingBlockValid).0;
        h
    }

    /// Compute the _expected_ CRC given all the other contents of `self`. The
    /// state byte is fed in as erased since it changes after the CRC is
    /// written.
    pub fn expected_crc(&self) -> u32 {
        let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = algo.digest();
        digest.update(&self.signature);
        digest.update(&[ERASED_BYTE]);
        digest.update(&self.reserved);
        digest.update(self.write_queue_size.as_bytes());

        digest.finalize()
    }

    pub fn state(&self) -> StateByte {
        StateByte(self.state)
    }
}

/// Header of one group of writes reserved by `Allocate`.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct WriteHeader {
    /// HeaderAllocated / WritesAllocated / Complete.
    pub state: u8,
    pub reserved0: [u8; 3],
    pub caller_id: [u8; 16],
    pub reserved1: [u8; 4],
    /// Number of record slots following this header.
    pub number_of_writes: U64LE,
    /// Bytes of client payload trailing each record.
    pub private_data_size: U64LE,
}

impl WriteHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(caller_id: CallerId, number_of_writes: u64, private_data_size: u64) -> Self {
        Self {
            state: ERASED_BYTE,
            reserved0: [ERASED_BYTE; 3],
            caller_id: caller_id.0,
            reserved1: [ERASED_BYTE; 4],
            number_of_writes: number_of_writes.into(),
            private_data_size: private_data_size.into(),
        }
    }

    pub fn state(&self) -> StateByte {
        StateByte(self.state)
    }

    pub fn is_allocated(&self) -> bool {
        self.state().is_set(StateBit::HeaderAllocated)
    }

    pub fn is_complete(&self) -> bool {
        self.state().is_set(StateBit::Complete)
    }

    /// Size of one record slot including its private data, if representable.
    pub fn record_stride(&self) -> Option<usize> {
        record_stride(self.private_data_size.get())
    }

    /// Size of the whole group: this header plus every record slot.
    pub fn group_size(&self) -> Option<usize> {
        group_size(self.number_of_writes.get(), self.private_data_size.get())
    }
}

/// One write within a group.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct WriteRecord {
    /// BootBlockUpdate / SpareComplete / DestinationComplete.
    pub state: u8,
    pub reserved: [u8; 7],
    /// First block of the target window.
    pub lba: U64LE,
    /// Offset of the update within the target window.
    pub offset: U64LE,
    /// Length of the update in bytes.
    pub length: U64LE,
    /// Physical address of the target device, identifying it on restart.
    pub fv_base_address: U64LE,
}

impl WriteRecord {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(lba: u64, offset: u64, length: u64, fv_base_address: u64) -> Self {
        Self {
            state: ERASED_BYTE,
            reserved: [ERASED_BYTE; 7],
            lba: lba.into(),
            offset: offset.into(),
            length: length.into(),
            fv_base_address: fv_base_address.into(),
        }
    }

    pub fn state(&self) -> StateByte {
        StateByte(self.state)
    }

    pub fn is_spare_complete(&self) -> bool {
        self.state().is_set(StateBit::SpareComplete)
    }

    pub fn is_destination_complete(&self) -> bool {
        self.state().is_set(StateBit::DestinationComplete)
    }

    pub fn is_boot_block_update(&self) -> bool {
        self.state().is_set(StateBit::BootBlockUpdate)
    }
}

/// Size of a record slot carrying `private_data_size` bytes of payload.
pub fn record_stride(private_data_size: u64) -> Option<usize> {
    usize::try_from(private_data_size).ok()?.checked_add(WriteRecord::SIZE)
}

/// Size of a header group with `n` records of `private_data_size` payload.
pub fn group_size(n: u64, private_data_size: u64) -> Option<usize> {
    let n = usize::try_from(n).ok()?;
    record_stride(private_data_size)?
        .checked_mul(n)?
        .checked_add(WriteHeader::SIZE)
}

/// Checks that every byte in `bytes` is erased.
pub fn is_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == ERASED_BYTE)
}

//////////////////////////////////////////////////////////////////////////////
// Log traversal.

/// Things that can go wrong walking the log.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LayoutError {
    /// The group whose header is at the given offset would run off the end of
    /// the work space.
    Overrun(usize),
    /// The header at the given offset is allocated but declares a group shape
    /// that can't exist (zero writes, or sizes that don't fit in memory).
    BadGroup(usize),
}

/// A write header found in the log, with its byte offset in the work space.
#[derive(Copy, Clone, Debug)]
pub struct WriteHeaderView<'a> {
    pub offset: usize,
    pub header: &'a WriteHeader,
}

/// A write record found in the log, with its byte offset in the work space,
/// its index within its group, and its trailing private data.
#[derive(Copy, Clone, Debug)]
pub struct WriteRecordView<'a> {
    pub offset: usize,
    pub index: u64,
    /// Whether this is the final slot of its group.
    pub is_last: bool,
    pub record: &'a WriteRecord,
    pub private_data: &'a [u8],
}

/// Entries produced by `LogCursor`.
#[derive(Copy, Clone, Debug)]
pub enum LogEntry<'a> {
    Header(WriteHeaderView<'a>),
    Record(WriteRecordView<'a>),
}

/// Bounds-checked forward walk over the log in a work-space buffer.
///
/// The cursor produces each allocated header followed by all of its record
/// slots. It stops after the group of the first header that is not Complete,
/// since nothing can follow it, or at the first slot that doesn't hold an
/// allocated header. A group that would run past the end of the buffer is
/// reported once as an error, after which the cursor produces nothing more.
pub struct LogCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    group: Option<Group>,
    done: bool,
}

#[derive(Copy, Clone, Debug)]
struct Group {
    next_index: u64,
    count: u64,
    stride: usize,
    complete: bool,
}

impl<'a> LogCursor<'a> {
    /// Starts a walk over `buf`, which holds the entire work space including
    /// its header.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: WorkSpaceHeader::SIZE,
            group: None,
            done: buf.len() < WorkSpaceHeader::SIZE,
        }
    }

    /// Offset of the next slot the cursor would read. After the cursor is
    /// exhausted this is the end of the log: either the unallocated slot
    /// where the next header would go, or the end of the last group.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn next_header(&mut self) -> Option<Result<LogEntry<'a>, LayoutError>> {
        let offset = self.pos;
        let (header, _) = cast_prefix::<WriteHeader>(self.buf.get(offset..)?)?;
        if !header.is_allocated() {
            return None;
        }

        let (count, stride) = match (header.number_of_writes.get(), header.record_stride()) {
            (n, Some(stride)) if n > 0 => (n, stride),
            _ => return Some(Err(LayoutError::BadGroup(offset))),
        };
        let end = match header.group_size().and_then(|s| offset.checked_add(s)) {
            Some(end) => end,
            None => return Some(Err(LayoutError::BadGroup(offset))),
        };
        if end > self.buf.len() {
            return Some(Err(LayoutError::Overrun(offset)));
        }

        self.pos = offset + WriteHeader::SIZE;
        self.group = Some(Group {
            next_index: 0,
            count,
            stride,
            complete: header.is_complete(),
        });
        Some(Ok(LogEntry::Header(WriteHeaderView { offset, header })))
    }
}

impl<'a> Iterator for LogCursor<'a> {
    type Item = Result<LogEntry<'a>, LayoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.group {
            Some(mut g) if g.next_index < g.count => {
                // Bounds were checked against the whole group when the header
                // was read.
                let offset = self.pos;
                let slot = &self.buf[offset..offset + g.stride];
                let (record, private_data) = cast_prefix::<WriteRecord>(slot)?;
                let view = WriteRecordView {
                    offset,
                    index: g.next_index,
                    is_last: g.next_index + 1 == g.count,
                    record,
                    private_data,
                };
                g.next_index += 1;
                self.group = Some(g);
                self.pos += g.stride;
                Some(Ok(LogEntry::Record(view)))
            }
            Some(g) if !g.complete => {
                // An incomplete group is always the last one in the log.
                self.done = true;
                None
            }
            _ => {
                self.group = None;
                let r = self.next_header();
                if !matches!(r, Some(Ok(_))) {
                    self.done = true;
                }
                r
            }
        }
    }
}

/// Where the log currently ends, as found by `find_tail`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tail {
    /// Offset of the last write header: the first one that is not Complete,
    /// or the unallocated slot after the final Complete group.
    pub header: usize,
    /// Offset of the last write record of that header: its first record
    /// without DestinationComplete, or its final record if they're all done.
    /// For an unallocated slot, where its first record would go.
    pub record: usize,
    /// Offset of the last Complete group, if any, preceding `header`.
    pub previous: Option<usize>,
    /// Offset just past the log's contents. Everything from here on should be
    /// erased.
    pub end: usize,
}

impl Tail {
    /// Bytes between the last header and the end of the work space.
    pub fn remaining(&self, work_space_size: usize) -> usize {
        work_space_size.saturating_sub(self.header)
    }
}

/// Walks the log in `buf` and finds its tail.
pub fn find_tail(buf: &[u8]) -> Result<Tail, LayoutError> {
    let mut cursor = LogCursor::new(buf);
    let mut open: Option<(usize, Option<usize>)> = None;
    let mut previous = None;

    while let Some(entry) = cursor.next() {
        match entry? {
            LogEntry::Header(h) => {
                if h.header.is_complete() {
                    previous = Some(h.offset);
                } else {
                    open = Some((h.offset, None));
                }
            }
            LogEntry::Record(r) => {
                if let Some((_, found)) = &mut open {
                    if found.is_none()
                        && (!r.record.is_destination_complete() || r.is_last)
                    {
                        *found = Some(r.offset);
                    }
                }
            }
        }
    }

    let end = cursor.position();
    Ok(match open {
        Some((header, Some(record))) => Tail { header, record, previous, end },
        _ => Tail {
            header: end,
            record: end + WriteHeader::SIZE,
            previous,
            end,
        },
    })
}

/// Reads the write header at `offset` in a work-space buffer.
pub fn header_at(buf: &[u8], offset: usize) -> Option<&WriteHeader> {
    Some(cast_prefix::<WriteHeader>(buf.get(offset..)?)?.0)
}

/// Reads the write record at `offset` in a work-space buffer.
pub fn record_at(buf: &[u8], offset: usize) -> Option<&WriteRecord> {
    Some(cast_prefix::<WriteRecord>(buf.get(offset..)?)?.0)
}

/// Iterates the records of the group whose header is at `header`. The group
/// must already have been bounds checked, e.g. by being found by `find_tail`.
pub fn records(buf: &[u8], header: usize) -> impl Iterator<Item = WriteRecordView<'_>> {
    let h = header_at(buf, header);
    let count = h.map(|h| h.number_of_writes.get()).unwrap_or(0);
    let stride = h.and_then(|h| h.record_stride()).unwrap_or(WriteRecord::SIZE);
    (0..count).map_while(move |index| {
        let offset = header + WriteHeader::SIZE + index as usize * stride;
        let slot = buf.get(offset..offset + stride)?;
        let (record, private_data) = cast_prefix::<WriteRecord>(slot)?;
        Some(WriteRecordView {
            offset,
            index,
            is_last: index + 1 == count,
            record,
            private_data,
        })
    })
}
