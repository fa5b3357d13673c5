//! Page image codec.
//!
//! An image is a [`PageHeader`] followed by a sequence of cells. Nothing
//! outside this module looks at cell bytes; reconciliation builds images
//! with [`ImageWriter`] and page-in turns them back into
//! [`DecodedImage`]s.
//!
//! Row leaves store a key cell followed by a value cell per row. Column
//! leaves store a run length followed by a value or deleted cell. Internal
//! pages store one address cell per child.

mod reader;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh64::xxh64;

use super::reference::{AddrKind, ChildAddr, PageDelInfo};
use crate::primitives::block::BlockAddr;
use crate::primitives::bytes::var;
use crate::types::checksum::{Checksum, Crc32Fast};
use crate::types::page::{flags, header, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{
    Recno, Result, SombraError, TimeAggregate, TimePoint, TimeWindow, Timestamp, TxnId,
};

pub use reader::CellReader;

mod tag {
    pub const KEY: u8 = 0x01;
    pub const VALUE: u8 = 0x02;
    pub const VALUE_OVFL: u8 = 0x03;
    pub const VALUE_COPY: u8 = 0x04;
    pub const DELETED: u8 = 0x05;
    pub const ADDR: u8 = 0x06;
    pub const ADDR_DEL: u8 = 0x07;
    pub const VALUE_DICT: u8 = 0x08;
}

mod tw_flag {
    pub const START: u8 = 0x01;
    pub const STOP: u8 = 0x02;
    pub const PREPARE: u8 = 0x04;
    pub const START_DURABLE: u8 = 0x08;
    pub const STOP_DURABLE: u8 = 0x10;
}

const DICT_MIN_VALUE: usize = 4;

/// Value stored in a leaf cell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageValue {
    /// Value bytes stored in the image.
    Inline(Bytes),
    /// Value stored in its own overflow block.
    Overflow(BlockAddr),
}

/// Row leaf entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RowCell {
    /// Full (decompressed) key.
    pub key: Bytes,
    /// Value.
    pub value: ImageValue,
    /// Validity window.
    pub tw: TimeWindow,
}

/// Column leaf run of `rle` consecutive records sharing one value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColCell {
    /// Number of records in the run.
    pub rle: u64,
    /// Value, `None` for a deleted run.
    pub value: Option<ImageValue>,
    /// Validity window (default for deleted runs).
    pub tw: TimeWindow,
}

/// Key of a child address cell.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AddrKey {
    /// Row separator key.
    Row(Bytes),
    /// First record number.
    Recno(Recno),
}

/// Child address entry of an internal image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddrCell {
    /// Key the child is filed under.
    pub key: AddrKey,
    /// Child location.
    pub addr: ChildAddr,
    /// Committed page-level delete of the child, if any.
    pub page_del: Option<PageDelInfo>,
}

/// Cells of a decoded image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImageBody {
    /// Row leaf entries in key order.
    RowLeaf(Vec<RowCell>),
    /// Column leaf runs in record order.
    ColLeaf(Vec<ColCell>),
    /// Child addresses in key order.
    Internal(Vec<AddrCell>),
}

/// A page image turned back into cells.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    /// Image header.
    pub header: PageHeader,
    /// Cells.
    pub body: ImageBody,
}

/// Knobs that shape image encoding.
#[derive(Copy, Clone, Debug)]
pub struct CellOptions {
    /// Store key suffixes relative to the previous key.
    pub prefix_compression: bool,
    /// Distinct values remembered for copy cells (0 disables).
    pub dictionary_entries: usize,
}

fn encode_point(pt: &TimePoint, durable_differs: bool, out: &mut Vec<u8>) {
    var::encode_u64(pt.txn.0, out);
    var::encode_u64(pt.ts.0, out);
    if durable_differs {
        var::encode_u64(pt.durable_ts.0, out);
    }
}

/// Appends the encoding of a time window.
pub fn encode_tw(tw: &TimeWindow, out: &mut Vec<u8>) {
    let mut bits = 0u8;
    let has_start = tw.start != TimePoint::ORIGIN;
    let has_stop = tw.has_stop();
    if has_start {
        bits |= tw_flag::START;
        if tw.start.durable_ts != tw.start.ts {
            bits |= tw_flag::START_DURABLE;
        }
    }
    if has_stop {
        bits |= tw_flag::STOP;
        if tw.stop.durable_ts != tw.stop.ts {
            bits |= tw_flag::STOP_DURABLE;
        }
    }
    if tw.prepare {
        bits |= tw_flag::PREPARE;
    }
    out.push(bits);
    if has_start {
        encode_point(&tw.start, bits & tw_flag::START_DURABLE != 0, out);
    }
    if has_stop {
        encode_point(&tw.stop, bits & tw_flag::STOP_DURABLE != 0, out);
    }
}

fn decode_point(reader: &mut CellReader<'_>, durable_differs: bool) -> Result<TimePoint> {
    let txn = TxnId(reader.read_var()?);
    let ts = Timestamp(reader.read_var()?);
    let durable_ts = if durable_differs {
        Timestamp(reader.read_var()?)
    } else {
        ts
    };
    Ok(TimePoint { txn, ts, durable_ts })
}

/// Decodes a time window written by [`encode_tw`].
pub fn decode_tw(reader: &mut CellReader<'_>) -> Result<TimeWindow> {
    let bits = reader.read_u8()?;
    if bits & !0x1f != 0 {
        return Err(SombraError::Corruption("unknown time window flags"));
    }
    let mut tw = TimeWindow::default();
    if bits & tw_flag::START != 0 {
        tw.start = decode_point(reader, bits & tw_flag::START_DURABLE != 0)?;
    }
    if bits & tw_flag::STOP != 0 {
        tw.stop = decode_point(reader, bits & tw_flag::STOP_DURABLE != 0)?;
    }
    tw.prepare = bits & tw_flag::PREPARE != 0;
    Ok(tw)
}

/// Encoded size of a time window.
pub fn tw_size(tw: &TimeWindow) -> usize {
    let point = |pt: &TimePoint| {
        var::encoded_len(pt.txn.0)
            + var::encoded_len(pt.ts.0)
            + if pt.durable_ts != pt.ts {
                var::encoded_len(pt.durable_ts.0)
            } else {
                0
            }
    };
    let mut size = 1;
    if tw.start != TimePoint::ORIGIN {
        size += point(&tw.start);
    }
    if tw.has_stop() {
        size += point(&tw.stop);
    }
    size
}

fn encode_agg(agg: &TimeAggregate, out: &mut Vec<u8>) {
    var::encode_u64(agg.newest_start_durable_ts.0, out);
    var::encode_u64(agg.newest_stop_durable_ts.0, out);
    var::encode_u64(agg.oldest_start_ts.0, out);
    var::encode_u64(agg.newest_txn.0, out);
    var::encode_u64(agg.newest_stop_ts.0, out);
    var::encode_u64(agg.newest_stop_txn.0, out);
    out.push(agg.prepare as u8);
}

fn decode_agg(reader: &mut CellReader<'_>) -> Result<TimeAggregate> {
    Ok(TimeAggregate {
        newest_start_durable_ts: Timestamp(reader.read_var()?),
        newest_stop_durable_ts: Timestamp(reader.read_var()?),
        oldest_start_ts: Timestamp(reader.read_var()?),
        newest_txn: TxnId(reader.read_var()?),
        newest_stop_ts: Timestamp(reader.read_var()?),
        newest_stop_txn: TxnId(reader.read_var()?),
        prepare: reader.read_u8()? != 0,
    })
}

fn addr_size(addr: &BlockAddr) -> usize {
    var::encoded_len(addr.offset) + var::encoded_len(addr.size as u64) + var::encoded_len(addr.checksum as u64)
}

/// Uncompressed encoded size of a leaf value cell.
pub fn value_size(value: Option<&ImageValue>, tw: &TimeWindow) -> usize {
    match value {
        None => 1,
        Some(ImageValue::Inline(bytes)) => 1 + tw_size(tw) + var::encoded_len(bytes.len() as u64) + bytes.len(),
        Some(ImageValue::Overflow(addr)) => 1 + tw_size(tw) + addr_size(addr),
    }
}

/// Uncompressed encoded size of a row leaf entry.
pub fn row_size(key: &[u8], value: &ImageValue, tw: &TimeWindow) -> usize {
    1 + 1 + var::encoded_len(key.len() as u64) + key.len() + value_size(Some(value), tw)
}

/// Encoded size of a column leaf run.
pub fn col_size(rle: u64, value: Option<&ImageValue>, tw: &TimeWindow) -> usize {
    var::encoded_len(rle) + value_size(value, tw)
}

/// Encoded size of a child address cell.
pub fn addr_cell_size(cell: &AddrCell) -> usize {
    let key = match &cell.key {
        AddrKey::Row(key) => var::encoded_len(key.len() as u64) + key.len(),
        AddrKey::Recno(recno) => var::encoded_len(*recno),
    };
    // Aggregates are at most 7 varints of 10 bytes.
    let del = if cell.page_del.is_some() { 31 } else { 0 };
    1 + key + 1 + addr_size(&cell.addr.block) + 61 + del
}

/// Builds one page image.
pub struct ImageWriter {
    header: PageHeader,
    opts: CellOptions,
    data: Vec<u8>,
    entries: u32,
    prev_key: Vec<u8>,
    dict: Vec<Bytes>,
    dict_index: FxHashMap<u64, SmallVec<[u32; 2]>>,
    all_stopped: bool,
    agg: TimeAggregate,
}

impl ImageWriter {
    /// Starts an image of `kind`; `recno` is the first record of column pages.
    pub fn new(kind: PageKind, recno: Recno, opts: CellOptions) -> Self {
        let mut header = PageHeader::new(kind, recno);
        if opts.prefix_compression && kind == PageKind::RowLeaf {
            header.flags |= flags::PREFIX_COMPRESSED;
        }
        Self {
            header,
            opts,
            data: Vec::new(),
            entries: 0,
            prev_key: Vec::new(),
            dict: Vec::new(),
            dict_index: FxHashMap::default(),
            all_stopped: true,
            agg: TimeAggregate::default(),
        }
    }

    /// Number of entries written.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    /// Bytes written so far, header included.
    pub fn len(&self) -> usize {
        PAGE_HDR_LEN + self.data.len()
    }

    /// Returns true when no entry was written.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Aggregate of every time window written so far.
    pub fn aggregate(&self) -> TimeAggregate {
        self.agg
    }

    fn push_value(&mut self, value: Option<&ImageValue>, tw: &TimeWindow) {
        let Some(value) = value else {
            self.data.push(tag::DELETED);
            return;
        };
        self.agg.update(tw);
        if !tw.has_stop() {
            self.all_stopped = false;
        }
        match value {
            ImageValue::Overflow(addr) => {
                self.header.flags |= flags::HAS_OVERFLOW;
                self.data.push(tag::VALUE_OVFL);
                encode_tw(tw, &mut self.data);
                addr.encode(&mut self.data);
            }
            ImageValue::Inline(bytes) => {
                if self.opts.dictionary_entries > 0 && bytes.len() >= DICT_MIN_VALUE {
                    let hash = xxh64(bytes, 0);
                    let hit = self.dict_index.get(&hash).and_then(|candidates| {
                        candidates
                            .iter()
                            .copied()
                            .find(|idx| self.dict.get(*idx as usize).is_some_and(|v| v == bytes))
                    });
                    if let Some(idx) = hit {
                        self.data.push(tag::VALUE_COPY);
                        encode_tw(tw, &mut self.data);
                        var::encode_u64(idx as u64, &mut self.data);
                        return;
                    }
                    if self.dict.len() < self.opts.dictionary_entries {
                        let idx = self.dict.len() as u32;
                        self.dict.push(bytes.clone());
                        self.dict_index.entry(hash).or_default().push(idx);
                        self.data.push(tag::VALUE_DICT);
                        encode_tw(tw, &mut self.data);
                        var::encode_u64(bytes.len() as u64, &mut self.data);
                        self.data.extend_from_slice(bytes);
                        return;
                    }
                }
                self.data.push(tag::VALUE);
                encode_tw(tw, &mut self.data);
                var::encode_u64(bytes.len() as u64, &mut self.data);
                self.data.extend_from_slice(bytes);
            }
        }
    }

    /// Appends a row entry; keys must arrive in increasing order.
    pub fn push_row(&mut self, key: &[u8], value: &ImageValue, tw: &TimeWindow) {
        let prefix = if self.header.flags & flags::PREFIX_COMPRESSED != 0 {
            crate::primitives::bytes::prefix::common_prefix_len(&self.prev_key, key)
        } else {
            0
        };
        self.data.push(tag::KEY);
        var::encode_u64(prefix as u64, &mut self.data);
        var::encode_u64((key.len() - prefix) as u64, &mut self.data);
        self.data.extend_from_slice(&key[prefix..]);
        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.push_value(Some(value), tw);
        self.entries += 1;
    }

    /// Appends a column run.
    pub fn push_col(&mut self, rle: u64, value: Option<&ImageValue>, tw: &TimeWindow) {
        var::encode_u64(rle, &mut self.data);
        self.push_value(value, tw);
        self.entries += 1;
    }

    /// Appends a child address.
    pub fn push_addr(&mut self, cell: &AddrCell) {
        self.data.push(if cell.page_del.is_some() {
            tag::ADDR_DEL
        } else {
            tag::ADDR
        });
        match &cell.key {
            AddrKey::Row(key) => {
                var::encode_u64(key.len() as u64, &mut self.data);
                self.data.extend_from_slice(key);
            }
            AddrKey::Recno(recno) => var::encode_u64(*recno, &mut self.data),
        }
        self.data.push(cell.addr.kind as u8);
        cell.addr.block.encode(&mut self.data);
        encode_agg(&cell.addr.agg, &mut self.data);
        if let Some(del) = &cell.page_del {
            var::encode_u64(del.txn.0, &mut self.data);
            var::encode_u64(del.ts.0, &mut self.data);
            var::encode_u64(del.durable_ts.0, &mut self.data);
            self.data.push(del.prepare as u8);
        }
        self.agg.merge(&cell.addr.agg);
        self.all_stopped = false;
        self.entries += 1;
    }

    /// Finishes the image: fills in the header and checksum.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        let data_len = u32::try_from(self.data.len())
            .map_err(|_| SombraError::Invalid("page image too large"))?;
        if self.all_stopped && self.header.kind.is_leaf() {
            self.header.flags |= flags::ALL_STOPPED;
        }
        self.header.entries = self.entries;
        self.header.data_len = data_len;
        self.header.crc32 = 0;
        let mut image = vec![0u8; PAGE_HDR_LEN];
        self.header.encode(&mut image)?;
        image.extend_from_slice(&self.data);
        let crc = image_crc(&image);
        image[header::CRC32].copy_from_slice(&crc.to_be_bytes());
        Ok(image)
    }
}

fn image_crc(image: &[u8]) -> u32 {
    let mut hdr = [0u8; PAGE_HDR_LEN];
    hdr.copy_from_slice(&image[..PAGE_HDR_LEN]);
    hdr[header::CRC32].fill(0);
    let mut hasher = Crc32Fast::default();
    hasher.update(&hdr);
    hasher.update(&image[PAGE_HDR_LEN..]);
    hasher.finalize()
}

/// Encodes an overflow value image.
pub fn encode_overflow(value: &[u8]) -> Result<Vec<u8>> {
    let mut header = PageHeader::new(PageKind::Overflow, 0);
    header.entries = 1;
    header.data_len =
        u32::try_from(value.len()).map_err(|_| SombraError::Invalid("overflow value too large"))?;
    let mut image = vec![0u8; PAGE_HDR_LEN];
    header.encode(&mut image)?;
    image.extend_from_slice(value);
    let crc = image_crc(&image);
    image[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(image)
}

fn check_image(image: &[u8]) -> Result<PageHeader> {
    let header = PageHeader::decode(image)?;
    if image_crc(image) != header.crc32 {
        return Err(SombraError::Corruption("page image checksum mismatch"));
    }
    Ok(header)
}

/// Decodes an overflow image back into the value bytes.
pub fn decode_overflow(image: &[u8]) -> Result<Bytes> {
    let header = check_image(image)?;
    if header.kind != PageKind::Overflow {
        return Err(SombraError::Corruption("expected overflow image"));
    }
    let end = PAGE_HDR_LEN + header.data_len as usize;
    Ok(Bytes::copy_from_slice(&image[PAGE_HDR_LEN..end]))
}

fn read_value(
    reader: &mut CellReader<'_>,
    dict: &mut Vec<Bytes>,
) -> Result<Option<(ImageValue, TimeWindow)>> {
    let cell = reader.read_u8()?;
    if cell == tag::DELETED {
        return Ok(None);
    }
    let tw = decode_tw(reader)?;
    let value = match cell {
        tag::VALUE | tag::VALUE_DICT => {
            let len = reader.read_len()?;
            let bytes = Bytes::copy_from_slice(reader.take(len)?);
            if cell == tag::VALUE_DICT {
                dict.push(bytes.clone());
            }
            ImageValue::Inline(bytes)
        }
        tag::VALUE_COPY => {
            let idx = reader.read_len()?;
            let bytes = dict
                .get(idx)
                .cloned()
                .ok_or(SombraError::Corruption("copy cell references unknown value"))?;
            ImageValue::Inline(bytes)
        }
        tag::VALUE_OVFL => ImageValue::Overflow(reader.read_addr()?),
        _ => return Err(SombraError::Corruption("illegal value cell")),
    };
    Ok(Some((value, tw)))
}

/// Decodes a leaf or internal page image.
pub fn decode_image(image: &[u8]) -> Result<DecodedImage> {
    let header = check_image(image)?;
    let data = &image[PAGE_HDR_LEN..PAGE_HDR_LEN + header.data_len as usize];
    let mut reader = CellReader::new(data);
    let mut dict = Vec::new();
    let entries = header.entries as usize;
    let body = match header.kind {
        PageKind::RowLeaf => {
            let mut rows = Vec::with_capacity(entries);
            let mut prev: Bytes = Bytes::new();
            for _ in 0..entries {
                if reader.read_u8()? != tag::KEY {
                    return Err(SombraError::Corruption("expected key cell"));
                }
                let prefix = reader.read_len()?;
                let suffix_len = reader.read_len()?;
                let suffix = reader.take(suffix_len)?;
                if prefix > prev.len() {
                    return Err(SombraError::Corruption("key prefix exceeds previous key"));
                }
                let key = if prefix == 0 {
                    Bytes::copy_from_slice(suffix)
                } else {
                    let mut full = Vec::with_capacity(prefix + suffix_len);
                    full.extend_from_slice(&prev[..prefix]);
                    full.extend_from_slice(suffix);
                    Bytes::from(full)
                };
                let (value, tw) = read_value(&mut reader, &mut dict)?
                    .ok_or(SombraError::Corruption("deleted cell in row leaf"))?;
                prev = key.clone();
                rows.push(RowCell { key, value, tw });
            }
            ImageBody::RowLeaf(rows)
        }
        PageKind::ColLeaf => {
            let mut runs = Vec::with_capacity(entries);
            for _ in 0..entries {
                let rle = reader.read_var()?;
                if rle == 0 {
                    return Err(SombraError::Corruption("zero-length column run"));
                }
                let run = match read_value(&mut reader, &mut dict)? {
                    Some((value, tw)) => ColCell {
                        rle,
                        value: Some(value),
                        tw,
                    },
                    None => ColCell {
                        rle,
                        value: None,
                        tw: TimeWindow::default(),
                    },
                };
                runs.push(run);
            }
            ImageBody::ColLeaf(runs)
        }
        PageKind::RowInternal | PageKind::ColInternal => {
            let mut cells = Vec::with_capacity(entries);
            for _ in 0..entries {
                let cell = reader.read_u8()?;
                if cell != tag::ADDR && cell != tag::ADDR_DEL {
                    return Err(SombraError::Corruption("expected address cell"));
                }
                let key = if header.kind == PageKind::RowInternal {
                    let len = reader.read_len()?;
                    AddrKey::Row(Bytes::copy_from_slice(reader.take(len)?))
                } else {
                    AddrKey::Recno(reader.read_var()?)
                };
                let kind = AddrKind::try_from(reader.read_u8()?)?;
                let block = reader.read_addr()?;
                let agg = decode_agg(&mut reader)?;
                let page_del = if cell == tag::ADDR_DEL {
                    Some(PageDelInfo {
                        txn: TxnId(reader.read_var()?),
                        ts: Timestamp(reader.read_var()?),
                        durable_ts: Timestamp(reader.read_var()?),
                        prepare: reader.read_u8()? != 0,
                        committed: true,
                    })
                } else {
                    None
                };
                cells.push(AddrCell {
                    key,
                    addr: ChildAddr { block, kind, agg },
                    page_del,
                });
            }
            ImageBody::Internal(cells)
        }
        PageKind::Overflow => return Err(SombraError::Corruption("unexpected overflow image")),
    };
    if !reader.is_done() {
        return Err(SombraError::Corruption("trailing bytes after cells"));
    }
    Ok(DecodedImage { header, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(prefix: bool, dict: usize) -> CellOptions {
        CellOptions {
            prefix_compression: prefix,
            dictionary_entries: dict,
        }
    }

    fn tw(start: u64, stop: Option<u64>) -> TimeWindow {
        let mut tw = TimeWindow::starting_at(TimePoint::new(TxnId(start), Timestamp(start * 10)));
        if let Some(stop) = stop {
            tw.stop = TimePoint {
                txn: TxnId(stop),
                ts: Timestamp(stop * 10),
                durable_ts: Timestamp(stop * 10 + 1),
            };
        }
        tw
    }

    #[test]
    fn row_leaf_roundtrip_with_prefix_and_dictionary() -> Result<()> {
        let shared = ImageValue::Inline(Bytes::from_static(b"repeated-value"));
        let rows = vec![
            RowCell {
                key: Bytes::from_static(b"user:0001"),
                value: shared.clone(),
                tw: tw(1, None),
            },
            RowCell {
                key: Bytes::from_static(b"user:0002"),
                value: shared.clone(),
                tw: tw(2, Some(3)),
            },
            RowCell {
                key: Bytes::from_static(b"zeta"),
                value: ImageValue::Overflow(BlockAddr {
                    offset: 4096,
                    size: 700,
                    checksum: 99,
                }),
                tw: TimeWindow::default(),
            },
        ];
        let mut plain = ImageWriter::new(PageKind::RowLeaf, 0, opts(false, 0));
        let mut packed = ImageWriter::new(PageKind::RowLeaf, 0, opts(true, 8));
        for row in &rows {
            plain.push_row(&row.key, &row.value, &row.tw);
            packed.push_row(&row.key, &row.value, &row.tw);
        }
        let plain = plain.finish()?;
        let packed = packed.finish()?;
        assert!(packed.len() < plain.len());
        for image in [&plain, &packed] {
            let decoded = decode_image(image)?;
            assert_eq!(decoded.body, ImageBody::RowLeaf(rows.clone()));
            assert_ne!(decoded.header.flags & flags::HAS_OVERFLOW, 0);
            assert_eq!(decoded.header.flags & flags::ALL_STOPPED, 0);
        }
        Ok(())
    }

    #[test]
    fn column_runs_keep_deleted_gaps() -> Result<()> {
        let mut writer = ImageWriter::new(PageKind::ColLeaf, 11, opts(false, 4));
        let value = ImageValue::Inline(Bytes::from_static(b"v"));
        writer.push_col(3, Some(&value), &tw(4, None));
        writer.push_col(2, None, &TimeWindow::default());
        writer.push_col(1, Some(&value), &tw(5, None));
        let decoded = decode_image(&writer.finish()?)?;
        assert_eq!(decoded.header.recno, 11);
        let ImageBody::ColLeaf(runs) = decoded.body else {
            panic!("expected column leaf");
        };
        assert_eq!(runs.iter().map(|r| r.rle).sum::<u64>(), 6);
        assert!(runs[1].value.is_none());
        Ok(())
    }

    #[test]
    fn internal_cells_carry_page_deletes() -> Result<()> {
        let mut agg = TimeAggregate::default();
        agg.update(&tw(7, Some(9)));
        let cells = vec![
            AddrCell {
                key: AddrKey::Row(Bytes::new()),
                addr: ChildAddr {
                    block: BlockAddr {
                        offset: 512,
                        size: 100,
                        checksum: 1,
                    },
                    kind: AddrKind::LeafNoOverflow,
                    agg,
                },
                page_del: None,
            },
            AddrCell {
                key: AddrKey::Row(Bytes::from_static(b"m")),
                addr: ChildAddr {
                    block: BlockAddr {
                        offset: 1024,
                        size: 100,
                        checksum: 2,
                    },
                    kind: AddrKind::Leaf,
                    agg: TimeAggregate::default(),
                },
                page_del: Some(PageDelInfo {
                    txn: TxnId(12),
                    ts: Timestamp(120),
                    durable_ts: Timestamp(121),
                    prepare: false,
                    committed: true,
                }),
            },
        ];
        let mut writer = ImageWriter::new(PageKind::RowInternal, 0, opts(true, 0));
        for cell in &cells {
            writer.push_addr(cell);
        }
        let decoded = decode_image(&writer.finish()?)?;
        assert_eq!(decoded.body, ImageBody::Internal(cells));
        Ok(())
    }

    #[test]
    fn checksum_detects_flipped_bit() -> Result<()> {
        let mut writer = ImageWriter::new(PageKind::RowLeaf, 0, opts(true, 0));
        writer.push_row(b"k", &ImageValue::Inline(Bytes::from_static(b"v")), &TimeWindow::default());
        let mut image = writer.finish()?;
        let last = image.len() - 1;
        image[last] ^= 0x40;
        assert!(matches!(decode_image(&image), Err(SombraError::Corruption(_))));
        Ok(())
    }

    #[test]
    fn overflow_roundtrip_and_size_estimates() -> Result<()> {
        let value = vec![0xabu8; 3000];
        let image = encode_overflow(&value)?;
        assert_eq!(&decode_overflow(&image)?[..], &value[..]);

        let window = tw(3, Some(4));
        let inline = ImageValue::Inline(Bytes::from_static(b"hello"));
        let mut writer = ImageWriter::new(PageKind::RowLeaf, 0, opts(false, 0));
        writer.push_row(b"key", &inline, &window);
        assert_eq!(writer.len(), PAGE_HDR_LEN + row_size(b"key", &inline, &window));
        Ok(())
    }
}
