//! Fixed header at the start of every page image written through the block manager.

use core::convert::{TryFrom, TryInto};

use super::{Recno, Result, SombraError};

/// Magic bytes identifying an engine page image.
pub const PAGE_MAGIC: [u8; 4] = *b"SBPE";
/// Image format version understood by this build.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Length of the encoded [`PageHeader`].
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Magic bytes.
    pub const MAGIC: Range<usize> = 0..4;
    /// Format version.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// Page kind byte.
    pub const PAGE_KIND: usize = 6;
    /// Page flags byte.
    pub const FLAGS: usize = 7;
    /// Number of cells.
    pub const ENTRIES: Range<usize> = 8..12;
    /// Length of the cell area.
    pub const DATA_LEN: Range<usize> = 12..16;
    /// Starting record number (column pages) or zero.
    pub const RECNO: Range<usize> = 16..24;
    /// Reserved, must be zero.
    pub const RESERVED: Range<usize> = 24..28;
    /// CRC32 of the image with this field zeroed.
    pub const CRC32: Range<usize> = 28..32;
}

/// Kind of page stored in an image.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageKind {
    /// Row-store leaf: key/value cells.
    RowLeaf = 1,
    /// Row-store internal page: key/address cells.
    RowInternal = 2,
    /// Variable-length column-store leaf: RLE value cells.
    ColLeaf = 3,
    /// Column-store internal page: recno/address cells.
    ColInternal = 4,
    /// Overflow value block.
    Overflow = 5,
}

impl PageKind {
    /// Returns the on-disk byte for this kind.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns true for leaf page kinds.
    pub const fn is_leaf(self) -> bool {
        matches!(self, PageKind::RowLeaf | PageKind::ColLeaf)
    }
}

impl TryFrom<u8> for PageKind {
    type Error = SombraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::RowLeaf),
            2 => Ok(PageKind::RowInternal),
            3 => Ok(PageKind::ColLeaf),
            4 => Ok(PageKind::ColInternal),
            5 => Ok(PageKind::Overflow),
            _ => Err(SombraError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page image header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Image format version.
    pub format_version: u16,
    /// Page kind.
    pub kind: PageKind,
    /// Page flags (see [`flags`]).
    pub flags: u8,
    /// Number of cells following the header.
    pub entries: u32,
    /// Length in bytes of the cell area.
    pub data_len: u32,
    /// Starting record number for column pages.
    pub recno: Recno,
    /// CRC32 of the image.
    pub crc32: u32,
}

pub mod flags {
    //! Page flag bits.

    /// Keys on the page are prefix compressed.
    pub const PREFIX_COMPRESSED: u8 = 0x01;
    /// The page contains overflow value cells.
    pub const HAS_OVERFLOW: u8 = 0x02;
    /// Every value on the page carries a stop point.
    pub const ALL_STOPPED: u8 = 0x04;
}

impl PageHeader {
    /// Builds a header for a page with no cells yet.
    pub fn new(kind: PageKind, recno: Recno) -> Self {
        Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            flags: 0,
            entries: 0,
            data_len: 0,
            recno,
            crc32: 0,
        }
    }

    /// Sets the checksum field.
    pub fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = crc32;
        self
    }

    /// Encodes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(SombraError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::FLAGS] = self.flags;
        hdr[header::ENTRIES].copy_from_slice(&self.entries.to_be_bytes());
        hdr[header::DATA_LEN].copy_from_slice(&self.data_len.to_be_bytes());
        hdr[header::RECNO].copy_from_slice(&self.recno.to_be_bytes());
        hdr[header::RESERVED].fill(0);
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Decodes and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(SombraError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(SombraError::Corruption("invalid page magic"));
        }
        let format_version = u16::from_be_bytes(read_array(&hdr[header::FORMAT_VERSION])?);
        if format_version != PAGE_FORMAT_VERSION {
            return Err(SombraError::Corruption("unsupported page format version"));
        }
        if hdr[header::RESERVED].iter().any(|b| *b != 0) {
            return Err(SombraError::Corruption("page header reserved bytes not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let entries = u32::from_be_bytes(read_array(&hdr[header::ENTRIES])?);
        let data_len = u32::from_be_bytes(read_array(&hdr[header::DATA_LEN])?);
        if PAGE_HDR_LEN + data_len as usize > src.len() {
            return Err(SombraError::Corruption("page data length exceeds image"));
        }
        Ok(Self {
            format_version,
            kind,
            flags: hdr[header::FLAGS],
            entries,
            data_len,
            recno: u64::from_be_bytes(read_array(&hdr[header::RECNO])?),
            crc32: u32::from_be_bytes(read_array(&hdr[header::CRC32])?),
        })
    }
}

/// Zeroes the checksum field so the image can be hashed.
pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < header::CRC32.end {
        return Err(SombraError::Invalid("page header buffer too small"));
    }
    buf[header::CRC32].fill(0);
    Ok(())
}

fn read_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| SombraError::Corruption("page header field truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_roundtrip() {
        let mut buf = [0u8; PAGE_HDR_LEN];
        let mut header = PageHeader::new(PageKind::ColLeaf, 4_001).with_crc32(0xDEAD_BEEF);
        header.entries = 12;
        header.flags = flags::HAS_OVERFLOW;
        header.encode(&mut buf).unwrap();
        let decoded = PageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn clear_crc32_zeroes_field() {
        let mut buf = [0xFFu8; PAGE_HDR_LEN];
        clear_crc32(&mut buf).unwrap();
        assert!(buf[header::CRC32].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_rejects_bad_magic_and_kind() {
        let mut buf = [0u8; PAGE_HDR_LEN];
        assert!(PageHeader::decode(&buf).is_err());
        PageHeader::new(PageKind::RowLeaf, 0).encode(&mut buf).unwrap();
        buf[header::PAGE_KIND] = 99;
        assert!(matches!(
            PageHeader::decode(&buf),
            Err(SombraError::Corruption(_))
        ));
    }
}
