#![forbid(unsafe_code)]
//! Block manager interface: opaque page images in, address cookies out.
//!
//! The page engine never interprets block offsets. It writes an image,
//! keeps the returned [`BlockAddr`] in the parent's reference, and hands the
//! cookie back to read or free the block.

mod file;

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::primitives::bytes::var;
use crate::types::{block_crc32, Result, SombraError};

pub use file::FileBlockManager;

/// Address cookie of a written block.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlockAddr {
    /// Offset of the block inside the backing store.
    pub offset: u64,
    /// Length of the image in bytes.
    pub size: u32,
    /// Checksum of the image, verified on read.
    pub checksum: u32,
}

impl BlockAddr {
    /// Appends the varint encoding of the cookie.
    pub fn encode(&self, out: &mut Vec<u8>) {
        var::encode_u64(self.offset, out);
        var::encode_u64(self.size as u64, out);
        var::encode_u64(self.checksum as u64, out);
    }

    /// Decodes a cookie written by [`BlockAddr::encode`].
    pub fn decode(src: &[u8], off: &mut usize) -> Result<Self> {
        let offset = var::decode_u64(src, off)?;
        let size = u32::try_from(var::decode_u64(src, off)?)
            .map_err(|_| SombraError::Corruption("block size out of range"))?;
        let checksum = u32::try_from(var::decode_u64(src, off)?)
            .map_err(|_| SombraError::Corruption("block checksum out of range"))?;
        Ok(Self {
            offset,
            size,
            checksum,
        })
    }
}

/// Storage for page images.
pub trait BlockManager: Send + Sync {
    /// Reads the image stored at `addr`, verifying its checksum when enabled.
    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>>;
    /// Stores `image` and returns its address cookie.
    fn write(&self, image: &[u8]) -> Result<BlockAddr>;
    /// Releases the block at `addr` for reuse.
    fn free(&self, addr: &BlockAddr) -> Result<()>;
    /// Allocation granularity in bytes; images are padded to a multiple of it.
    fn allocation_size(&self) -> usize;
    /// Number of blocks currently allocated.
    fn live_blocks(&self) -> usize;
}

pub(crate) fn verify_checksum(addr: &BlockAddr, image: &[u8], verify: bool) -> Result<()> {
    if image.len() != addr.size as usize {
        return Err(SombraError::Corruption("block length mismatch"));
    }
    if verify && block_crc32(image) != addr.checksum {
        return Err(SombraError::Corruption("block checksum mismatch"));
    }
    Ok(())
}

/// In-memory block manager used by tests and ephemeral trees.
pub struct MemBlockManager {
    blocks: Mutex<FxHashMap<u64, Vec<u8>>>,
    next_offset: AtomicU64,
    allocation_size: usize,
    checksum_verify: bool,
}

impl Default for MemBlockManager {
    fn default() -> Self {
        Self::new(512)
    }
}

impl MemBlockManager {
    /// Creates an empty manager with the given allocation granularity.
    pub fn new(allocation_size: usize) -> Self {
        Self {
            blocks: Mutex::new(FxHashMap::default()),
            next_offset: AtomicU64::new(allocation_size.max(1) as u64),
            allocation_size: allocation_size.max(1),
            checksum_verify: true,
        }
    }

    /// Enables or disables checksum verification on read.
    pub fn with_checksum_verify(mut self, verify: bool) -> Self {
        self.checksum_verify = verify;
        self
    }

    /// Flips one byte of a stored block; used to exercise corruption paths.
    pub fn corrupt(&self, addr: &BlockAddr, at: usize) -> bool {
        let mut blocks = self.blocks.lock();
        match blocks.get_mut(&addr.offset).and_then(|b| b.get_mut(at)) {
            Some(byte) => {
                *byte ^= 0xFF;
                true
            }
            None => false,
        }
    }
}

impl BlockManager for MemBlockManager {
    fn read(&self, addr: &BlockAddr) -> Result<Vec<u8>> {
        let image = self
            .blocks
            .lock()
            .get(&addr.offset)
            .cloned()
            .ok_or(SombraError::Corruption("read of unallocated block"))?;
        verify_checksum(addr, &image, self.checksum_verify)?;
        Ok(image)
    }

    fn write(&self, image: &[u8]) -> Result<BlockAddr> {
        let size =
            u32::try_from(image.len()).map_err(|_| SombraError::Invalid("block too large"))?;
        let padded = image.len().div_ceil(self.allocation_size).max(1) * self.allocation_size;
        let offset = self.next_offset.fetch_add(padded as u64, Ordering::Relaxed);
        self.blocks.lock().insert(offset, image.to_vec());
        Ok(BlockAddr {
            offset,
            size,
            checksum: block_crc32(image),
        })
    }

    fn free(&self, addr: &BlockAddr) -> Result<()> {
        match self.blocks.lock().remove(&addr.offset) {
            Some(_) => Ok(()),
            None => Err(SombraError::Corruption("free of unallocated block")),
        }
    }

    fn allocation_size(&self) -> usize {
        self.allocation_size
    }

    fn live_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}
