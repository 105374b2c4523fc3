// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the engine against a flash image file.
//!
//! The image is carved up as `[target][working block][spare]`, where the
//! working block and spare are each `spare_blocks` long and the work space
//! sits at the start of the working block. Every command brings the engine
//! up first, so opening an image performs start-of-day recovery on it.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;

use ftw::layout::{LogCursor, LogEntry, WorkSpaceHeader};
use ftw::{
    BlockDevice, CallerId, FaultTolerantWrite, FtwConfig, FtwError, Geometry,
    RegionConfig,
};

/// Caller id the tool allocates writes under.
const TOOL_CALLER: CallerId = CallerId(*b"ftwtool\0\0\0\0\0\0\0\0\0");

#[derive(Parser)]
struct Ftwtool {
    /// Erase block size in bytes.
    #[clap(short, long, default_value_t = 4096)]
    block_size: usize,

    /// Length of the spare, and of every update window, in blocks.
    #[clap(short, long, default_value_t = 1)]
    spare_blocks: u64,

    /// Size of the work space in bytes.
    #[clap(short, long, default_value_t = 0x800)]
    work_space_size: usize,

    #[clap(subcommand)]
    cmd: Cmd,

    image_file: std::path::PathBuf,
}

#[derive(Parser)]
enum Cmd {
    /// Creates a fully erased image.
    Create {
        blocks: u64,
    },
    /// Shows where the last write sequence stands.
    Status,
    /// Walks the log and prints every header and record.
    Dump,
    /// Writes VALUE at OFFSET into the window starting at target block LBA.
    Write {
        lba: u64,
        offset: usize,
        value: String,
        /// Private data to log alongside the write.
        #[clap(short, long)]
        private: Option<String>,
    },
    /// Reads bytes from the target.
    Read {
        lba: u64,
        offset: usize,
        length: usize,
    },
    /// Finishes a write that was interrupted after staging.
    Restart,
    /// Abandons the write sequence in flight.
    Abort,
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Ftwtool::parse();

    if let Cmd::Create { blocks } = args.cmd {
        let len = usize::try_from(blocks)?
            .checked_mul(args.block_size)
            .context("image too large")?;
        std::fs::write(&args.image_file, vec![0xFF; len])
            .with_context(|| {
                format!("creating image file {}", args.image_file.display())
            })?;
        println!("created {} blocks of {:#x} bytes", blocks, args.block_size);
        return Ok(());
    }

    let img = FlashImage::open(&args.image_file, args.block_size)
        .with_context(|| {
            format!("opening image file {}", args.image_file.display())
        })?;
    let target_blocks = img.blocks.checked_sub(2 * args.spare_blocks)
        .filter(|&n| n > 0)
        .ok_or_else(|| anyhow!("image too small for a {} block spare", args.spare_blocks))?;

    let bs = args.block_size as u64;
    let config = FtwConfig {
        work_space: Some(RegionConfig {
            base: target_blocks * bs,
            length: args.work_space_size,
        }),
        spare: Some(RegionConfig {
            base: (target_blocks + args.spare_blocks) * bs,
            length: (args.spare_blocks * bs) as usize,
        }),
        caller_id: TOOL_CALLER,
    };
    let mut target = img.region(0, target_blocks);
    let mut ftw = FaultTolerantWrite::without_boot_block(
        &config,
        img.region(target_blocks, args.spare_blocks),
        img.region(target_blocks + args.spare_blocks, args.spare_blocks),
    ).map_err(|e| anyhow!("could not start engine: {e:?}"))?;

    match args.cmd {
        Cmd::Create { .. } => unreachable!(),
        Cmd::Status => {
            println!("state: {:?}", ftw.state());
            match ftw.get_last_write() {
                Ok(w) => {
                    println!("last write, from caller {:02x?}", w.caller_id.0);
                    println!("- lba {:#x} offset {:#x} length {:#x}", w.lba, w.offset, w.length);
                    println!("- {}", if w.complete { "complete" } else { "INCOMPLETE" });
                    if !w.private_data.is_empty() {
                        println!("{}", pretty_hex::pretty_hex(&w.private_data));
                    }
                }
                Err(FtwError::NotFound) => println!("no writes in log"),
                Err(e) => return Err(ftw_err(e)),
            }
        }
        Cmd::Dump => {
            let ws = ftw.work_space().bytes();
            println!("work space header");
            println!("{}", pretty_hex::pretty_hex(&&ws[..WorkSpaceHeader::SIZE]));
            for entry in LogCursor::new(ws) {
                match entry {
                    Ok(LogEntry::Header(h)) => {
                        println!();
                        println!("header at {:#x}, state {:#04x}", h.offset, h.header.state);
                        println!("- caller {:02x?}", h.header.caller_id);
                        println!("- {} write(s), {} bytes private data each",
                            h.header.number_of_writes.get(),
                            h.header.private_data_size.get());
                    }
                    Ok(LogEntry::Record(r)) => {
                        println!("record {} at {:#x}, state {:#04x}", r.index, r.offset, r.record.state);
                        println!("- device {:#x} lba {:#x} offset {:#x} length {:#x}",
                            r.record.fv_base_address.get(),
                            r.record.lba.get(),
                            r.record.offset.get(),
                            r.record.length.get());
                        if !r.private_data.is_empty() {
                            println!("{}", pretty_hex::pretty_hex(&r.private_data));
                        }
                    }
                    Err(e) => {
                        println!("log damaged: {e:?}");
                        break;
                    }
                }
            }
        }
        Cmd::Write { lba, offset, value, private } => {
            if let Some(p) = &private {
                ftw.allocate(TOOL_CALLER, p.len(), 1).map_err(ftw_err)?;
            }
            ftw.write(
                lba,
                offset,
                private.as_deref().map(str::as_bytes),
                &mut target,
                value.as_bytes(),
            ).map_err(ftw_err)?;
            println!("ok");
        }
        Cmd::Read { lba, offset, length } => {
            let mut out = vec![0; length];
            target.read(lba, offset, &mut out)?;
            println!("{}", pretty_hex::pretty_hex(&out));
        }
        Cmd::Restart => {
            ftw.restart(&mut target).map_err(ftw_err)?;
            println!("ok");
        }
        Cmd::Abort => {
            ftw.abort().map_err(ftw_err)?;
            println!("ok");
        }
    }

    Ok(())
}

fn ftw_err(e: FtwError<std::io::Error>) -> anyhow::Error {
    anyhow!("write engine: {e:?}")
}

struct FlashImage {
    file: Rc<RefCell<std::fs::File>>,
    block_size: usize,
    blocks: u64,
}

impl FlashImage {
    fn open(path: impl AsRef<std::path::Path>, block_size: usize) -> Result<Self, anyhow::Error> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(path)?;
        let file_len = file.metadata()?.len();

        if block_size == 0 || file_len % block_size as u64 != 0 {
            bail!("file is not a whole number of blocks in length");
        }

        Ok(Self {
            file: Rc::new(RefCell::new(file)),
            block_size,
            blocks: file_len / block_size as u64,
        })
    }

    fn region(&self, first: u64, blocks: u64) -> Region {
        Region {
            file: self.file.clone(),
            block_size: self.block_size,
            first,
            blocks,
        }
    }
}

/// Handle on a run of blocks in the image. Handles on the same image share
/// the file, so they see each other's changes.
struct Region {
    file: Rc<RefCell<std::fs::File>>,
    block_size: usize,
    first: u64,
    blocks: u64,
}

impl Region {
    fn locate(&self, lba: u64, offset: usize, len: usize) -> Result<u64, std::io::Error> {
        let bs = self.block_size as u64;
        let start = lba.checked_mul(bs)
            .and_then(|s| s.checked_add(offset as u64));
        match start {
            Some(s) if s.checked_add(len as u64).map_or(false, |e| e <= self.blocks * bs) => {
                Ok(self.first * bs + s)
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "access outside region",
            )),
        }
    }
}

impl BlockDevice for Region {
    type Error = std::io::Error;

    fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            block_count: self.blocks,
        }
    }

    fn physical_address(&self) -> u64 {
        self.first * self.block_size as u64
    }

    fn read(&self, lba: u64, offset: usize, dest: &mut [u8]) -> Result<(), Self::Error> {
        let at = self.locate(lba, offset, dest.len())?;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(at))?;
        file.read_exact(dest)
    }

    fn write(&mut self, lba: u64, offset: usize, data: &[u8]) -> Result<(), Self::Error> {
        let at = self.locate(lba, offset, data.len())?;
        let mut file = self.file.borrow_mut();

        // Programming can only clear bits.
        let mut bytes = vec![0; data.len()];
        file.seek(SeekFrom::Start(at))?;
        file.read_exact(&mut bytes)?;
        for (b, &d) in bytes.iter_mut().zip(data) {
            *b &= d;
        }

        file.seek(SeekFrom::Start(at))?;
        file.write_all(&bytes)
    }

    fn erase_blocks(&mut self, lba: u64, count: u64) -> Result<(), Self::Error> {
        let len = usize::try_from(count * self.block_size as u64)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "erase too large"))?;
        let at = self.locate(lba, 0, len)?;
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(at))?;
        file.write_all(&vec![0xFF; len])
    }
}
