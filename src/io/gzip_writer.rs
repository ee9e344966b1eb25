// BGZF-style gzip output filter. Each logical batch is compressed into a
// run of independent gzip members of at most 64 KiB of raw data, each
// carrying the BC extra subfield with its own compressed size, so the
// output supports virtual-offset random access. The filter records a
// (logical -> physical) anchor per member; the supplier's translation
// table turns logical offsets into virtual offsets for index sidecars.

use crate::io::data_writer::{FilterContext, FilterKind, FilterSupplier, WriteFilter};
use flate2::{Compress, Compression, FlushCompress, Status};
use std::io;
use std::sync::{Arc, Mutex};

/// Raw bytes per BGZF member; chosen so that even incompressible data
/// plus framing stays under the 65535-byte BSIZE limit.
pub const BGZF_CHUNK: usize = 0xff00;

/// The canonical 28-byte BGZF end-of-file marker.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const MEMBER_HEADER_LEN: usize = 18;
const MEMBER_TRAILER_LEN: usize = 8;

#[derive(Default)]
struct TranslationTable {
    // (logical, physical), sorted lazily on lookup.
    anchors: Vec<(u64, u64)>,
    sorted: bool,
}

pub struct GzipWriterFilterSupplier {
    translation: Arc<Mutex<TranslationTable>>,
    level: Compression,
}

impl GzipWriterFilterSupplier {
    pub fn new() -> Arc<Self> {
        Arc::new(GzipWriterFilterSupplier {
            translation: Arc::new(Mutex::new(TranslationTable::default())),
            level: Compression::default(),
        })
    }

    /// Physical member start and in-member delta for a logical offset.
    pub fn translate(&self, logical: u64) -> Option<(u64, u64)> {
        let mut table = self.translation.lock().unwrap();
        if !table.sorted {
            table.anchors.sort_unstable();
            table.sorted = true;
        }
        let idx = table.anchors.partition_point(|&(l, _)| l <= logical);
        if idx == 0 {
            return None;
        }
        let (anchor_logical, physical) = table.anchors[idx - 1];
        Some((physical, logical - anchor_logical))
    }

    /// BGZF virtual offset for a logical offset, 0 when untranslatable.
    pub fn to_virtual_offset(&self, logical: u64) -> u64 {
        if let Some((physical, delta)) = self.translate(logical) {
            if delta < (1 << 16) && physical < (1u64 << 48) {
                return (physical << 16) | delta;
            }
            log::error!(
                "invalid virtual offset: logical={}, physical={}, delta={}",
                logical,
                physical,
                delta
            );
        }
        0
    }
}

impl FilterSupplier for GzipWriterFilterSupplier {
    fn kind(&self) -> FilterKind {
        FilterKind::Transform
    }

    fn get_filter(&self) -> Box<dyn WriteFilter> {
        Box::new(GzipWriterFilter {
            translation: Arc::clone(&self.translation),
            z: Compress::new(self.level, false),
            pending: Vec::new(),
            out: Vec::new(),
        })
    }

    fn closing_bytes(&self) -> Vec<u8> {
        BGZF_EOF.to_vec()
    }
}

struct GzipWriterFilter {
    translation: Arc<Mutex<TranslationTable>>,
    z: Compress,
    // Per-batch member anchors, relative to the batch, resolved to
    // absolute offsets once the batch's file space is reserved.
    pending: Vec<(u64, u64)>,
    out: Vec<u8>,
}

impl GzipWriterFilter {
    /// Append one complete gzip member holding `chunk`.
    fn write_member(&mut self, chunk: &[u8]) -> io::Result<()> {
        let header_start = self.out.len();
        self.out.extend_from_slice(&[
            0x1f, 0x8b, 0x08, 0x04, // magic, deflate, FEXTRA
            0x00, 0x00, 0x00, 0x00, // mtime
            0x00, 0xff, // xfl, unknown OS
            0x06, 0x00, // xlen = 6
            0x42, 0x43, 0x02, 0x00, // 'B' 'C', subfield length 2
            0x00, 0x00, // BSIZE placeholder
        ]);

        self.z.reset();
        let data_start = self.out.len();
        // Worst-case deflate expansion for the bounded chunk size.
        self.out.resize(data_start + chunk.len() + chunk.len() / 1000 + 64, 0);
        let mut in_pos = 0usize;
        let mut out_pos = data_start;
        loop {
            let before_in = self.z.total_in();
            let before_out = self.z.total_out();
            let status = self
                .z
                .compress(&chunk[in_pos..], &mut self.out[out_pos..], FlushCompress::Finish)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("deflate: {}", e)))?;
            in_pos += (self.z.total_in() - before_in) as usize;
            out_pos += (self.z.total_out() - before_out) as usize;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if out_pos >= self.out.len() {
                        // Shouldn't happen with the sizing above.
                        let grow = self.out.len();
                        self.out.resize(grow + 4096, 0);
                    }
                }
            }
        }
        self.out.truncate(out_pos);

        let mut crc = flate2::Crc::new();
        crc.update(chunk);
        self.out.extend_from_slice(&crc.sum().to_le_bytes());
        self.out.extend_from_slice(&(chunk.len() as u32).to_le_bytes());

        let block_size = self.out.len() - header_start;
        if block_size > u16::MAX as usize + 1 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("BGZF block overflow: {} bytes", block_size),
            ));
        }
        let bsize = (block_size - 1) as u16;
        self.out[header_start + 16..header_start + 18].copy_from_slice(&bsize.to_le_bytes());
        Ok(())
    }
}

impl WriteFilter for GzipWriterFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Transform
    }

    fn on_next_batch(&mut self, ctx: &mut FilterContext<'_>) -> io::Result<()> {
        let input = std::mem::take(ctx.current);
        self.out.clear();
        self.pending.clear();
        for (i, chunk) in input.chunks(BGZF_CHUNK).enumerate() {
            self.pending
                .push(((i * BGZF_CHUNK) as u64, self.out.len() as u64));
            self.write_member(chunk)?;
        }
        *ctx.current = std::mem::take(&mut self.out);
        ctx.logical_snapshot = Some(input);
        Ok(())
    }

    fn on_batch_written(&mut self, physical_offset: u64, logical_offset: u64) {
        if self.pending.is_empty() {
            return;
        }
        let mut table = self.translation.lock().unwrap();
        for &(logical_rel, physical_rel) in &self.pending {
            table
                .anchors
                .push((logical_offset + logical_rel, physical_offset + physical_rel));
        }
        table.sorted = false;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::data_writer::DataWriterSupplier;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn decompress_all(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        MultiGzDecoder::new(bytes)
            .read_to_end(&mut out)
            .expect("output must be valid multi-member gzip");
        out
    }

    #[test]
    fn output_is_valid_bgzf_with_eof_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gz");
        let gzip = GzipWriterFilterSupplier::new();
        let supplier =
            DataWriterSupplier::create(&path, Some(gzip.clone()), 2, 1 << 20).unwrap();
        let mut writer = supplier.get_writer().unwrap();
        let payload: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(10_000) {
            writer.append(chunk, 0).unwrap();
        }
        writer.close().unwrap();
        supplier.close().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert!(written.ends_with(&BGZF_EOF));
        assert_eq!(decompress_all(&written), payload);
    }

    #[test]
    fn members_carry_the_bc_subfield() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gz");
        let gzip = GzipWriterFilterSupplier::new();
        let supplier =
            DataWriterSupplier::create(&path, Some(gzip.clone()), 2, 1 << 20).unwrap();
        let mut writer = supplier.get_writer().unwrap();
        writer.append(b"some bytes worth framing", 0).unwrap();
        writer.close().unwrap();
        supplier.close().unwrap();

        let written = std::fs::read(&path).unwrap();
        assert_eq!(&written[..4], &[0x1f, 0x8b, 0x08, 0x04]);
        assert_eq!(&written[12..14], b"BC");
        let bsize = u16::from_le_bytes([written[16], written[17]]) as usize + 1;
        // The first member ends where BSIZE says it does.
        assert!(bsize < written.len());
        assert_eq!(written[bsize], 0x1f);
    }

    #[test]
    fn virtual_offsets_translate_logical_positions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gz");
        let gzip = GzipWriterFilterSupplier::new();
        let supplier =
            DataWriterSupplier::create(&path, Some(gzip.clone()), 2, 1 << 20).unwrap();
        let mut writer = supplier.get_writer().unwrap();
        // Two batches, each several members long.
        let batch: Vec<u8> = (0..200_000u32).map(|i| (i % 7) as u8 + b'a').collect();
        writer.append(&batch, 0).unwrap();
        writer.next_batch().unwrap();
        writer.append(&batch, 0).unwrap();
        writer.close().unwrap();
        supplier.close().unwrap();

        // Logical 0 must map to physical 0.
        assert_eq!(gzip.translate(0), Some((0, 0)));
        // A position inside the second member of the first batch.
        let logical = BGZF_CHUNK as u64 + 17;
        let (physical, delta) = gzip.translate(logical).unwrap();
        assert_eq!(delta, 17);
        let voff = gzip.to_virtual_offset(logical);
        assert_eq!(voff >> 16, physical);
        assert_eq!(voff & 0xffff, 17);
        // The physical anchor really is a gzip member boundary.
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written[physical as usize], 0x1f);
        assert_eq!(written[physical as usize + 1], 0x8b);
    }
}
