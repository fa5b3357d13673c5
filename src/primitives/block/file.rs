use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;

use super::{verify_checksum, BlockAddr, BlockManager};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{block_crc32, Result, SombraError};

struct Extents {
    end: u64,
    /// Free extents keyed by padded length.
    free: BTreeMap<u64, Vec<u64>>,
    live: usize,
}

/// Block manager over a single file.
///
/// Blocks are padded to the allocation size. Freed extents are reused by
/// later writes of the same padded length; everything else is appended.
/// Free-space state lives in memory only, so a reopened file grows from its
/// current end.
pub struct FileBlockManager {
    io: Box<dyn FileIo>,
    extents: Mutex<Extents>,
    allocation_size: usize,
    checksum_verify: bool,
}

impl FileBlockManager {
    /// Opens or creates the block file at `path`.
    pub fn open(path: impl AsRef<Path>, allocation_size: usize) -> Result<Self> {
        Self::with_io(Box::new(StdFileIo::open(path)?), allocation_size)
    }

    /// Builds a manager over an arbitrary positional I/O handle.
    pub fn with_io(io: Box<dyn FileIo>, allocation_size: usize) -> Result<Self> {
        if allocation_size == 0 {
            return Err(SombraError::Invalid("allocation size must be non-zero"));
        }
        let len = io.len()?;
        let unit = allocation_size as u64;
        // Offset zero is never handed out so a zeroed cookie can't alias a block.
        let end = len.div_ceil(unit).max(1) * unit;
        Ok(Self {
            io,
            extents: Mutex::new(Extents {
                end,
                free: BTreeMap::new(),
                live: 0,
            }),
            allocation_size,
            checksum_verify: true,
        })
    }

    /// Enables or disables checksum verification on read.
    pub fn with_checksum_verify(mut self, verify: bool) -> Self {
        self.checksum_verify = verify;
        self
    }

    /// Flushes written blocks to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    fn padded(&self, len: usize) -> u64 {
        (len.div_ceil(self.allocation_size).max(1) * self.allocation_size) as u64
    }
}

impl BlockManager for FileBlockManager {
    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let mut image = vec![0u8; addr.size as usize];
        self.io.read_at(addr.offset, &mut image)?;
        verify_checksum(addr, &image, self.checksum_verify)?;
        Ok(image)
    }

    fn write(&self, image: &[u8]) -> Result<BlockAddr> {
        let size =
            u32::try_from(image.len()).map_err(|_| SombraError::Invalid("block too large"))?;
        let padded = self.padded(image.len());
        let offset = {
            let mut extents = self.extents.lock();
            let reused = extents.free.get_mut(&padded).and_then(|offsets| offsets.pop());
            let offset = match reused {
                Some(offset) => offset,
                None => {
                    let offset = extents.end;
                    extents.end += padded;
                    offset
                }
            };
            extents.live += 1;
            offset
        };
        self.io.write_at(offset, image)?;
        Ok(BlockAddr {
            offset,
            size,
            checksum: block_crc32(image),
        })
    }

    fn free(&self, addr: &BlockAddr) -> Result<()> {
        let padded = self.padded(addr.size as usize);
        let mut extents = self.extents.lock();
        if addr.offset + padded > extents.end {
            return Err(SombraError::Corruption("free beyond end of block file"));
        }
        extents.free.entry(padded).or_default().push(addr.offset);
        extents.live = extents.live.saturating_sub(1);
        Ok(())
    }

    fn allocation_size(&self) -> usize {
        self.allocation_size
    }

    fn live_blocks(&self) -> usize {
        self.extents.lock().live
    }
}
