// Gzip layer over an inner batch reader. Each inner batch's compressed
// bytes are inflated into a per-batch decode buffer; trailing decoded
// bytes (up to `overflow`) carry into the next batch so record parsers
// see continuous data across both gzip-member and batch boundaries.
// BGZF files are plain concatenated gzip members, so the same loop serves
// .gz FASTQ and BAM alike.

use crate::io::data_reader::{DataReader, DataSlice, ReleaseHandle};
use crate::read::DataBatch;
use flate2::{Decompress, FlushDecompress, Status};
use std::io;

pub const MIN_FACTOR: f64 = 1.2;
/// Upper bound on the decompression ratio we size buffers for. Inputs
/// that expand further are rejected.
pub const MAX_FACTOR: f64 = 4.0;

const GZIP_TRAILER_LEN: usize = 8;

pub struct GzipDataReader {
    inner: Box<dyn DataReader>,
    overflow: usize,

    decoded: Vec<u8>,
    valid: usize,
    start_bytes: usize,
    offset: usize,

    // Decoded tail of the previous batch, prepended before the next
    // decompression.
    prior: Vec<u8>,
    got_batch: bool,
    // Inflater state that spans inner batches.
    mid_member: bool,
    pending_trailer: usize,
    z: Decompress,

    // (decoded_offset, physical_file_offset) at each gzip member start in
    // the current batch; the source of BGZF virtual offsets.
    anchors: Vec<(usize, u64)>,
    extra_down: Vec<u8>,
}

impl GzipDataReader {
    /// Wrap `inner`, which must deliver whole compressed batches (no
    /// overflow of its own; compressed bytes can't straddle usefully).
    pub fn wrap(
        inner: Box<dyn DataReader>,
        overflow: usize,
        inner_batch_size: usize,
        extra_factor: f64,
    ) -> Self {
        let decode_cap = (inner_batch_size as f64 * MAX_FACTOR) as usize + overflow;
        let extra_cap = (decode_cap as f64 * extra_factor) as usize;
        GzipDataReader {
            inner,
            overflow,
            decoded: vec![0; decode_cap],
            valid: 0,
            start_bytes: 0,
            offset: 0,
            prior: Vec::with_capacity(overflow),
            got_batch: false,
            mid_member: false,
            pending_trailer: 0,
            z: Decompress::new(false),
            anchors: Vec::with_capacity(1024),
            extra_down: vec![0; extra_cap],
        }
    }

    /// BGZF virtual offset of the consumer's current position:
    /// `(physical_member_start << 16) | delta_within_member`. None when
    /// the position decodes from a member that started in an earlier
    /// batch.
    pub fn virtual_offset(&self) -> Option<u64> {
        let anchor = self
            .anchors
            .iter()
            .rev()
            .find(|&&(decoded_offset, _)| decoded_offset <= self.offset)?;
        let (decoded_offset, physical) = *anchor;
        let delta = (self.offset - decoded_offset) as u64;
        if delta < (1 << 16) && physical < (1u64 << 48) {
            Some((physical << 16) | delta)
        } else {
            log::error!(
                "virtual offset out of range: physical={}, delta={}",
                physical,
                delta
            );
            None
        }
    }

    fn decompress_batch(&mut self) -> io::Result<()> {
        let prior_len = self.prior.len();
        self.decoded[..prior_len].copy_from_slice(&self.prior);
        self.prior.clear();
        self.anchors.clear();
        self.offset = 0;

        let physical_base = self.inner.file_offset();
        let (consumed, written) = {
            let input = match self.inner.get_data()? {
                Some(slice) => slice.bytes,
                None => {
                    // Nothing compressed left; whatever carried over is
                    // the final decoded data.
                    self.valid = prior_len;
                    self.start_bytes = prior_len;
                    return Ok(());
                }
            };

            let mut in_pos = 0usize;
            let mut out_pos = prior_len;

            // Finish a trailer that split across the batch boundary.
            if self.pending_trailer > 0 {
                let skip = self.pending_trailer.min(input.len());
                in_pos += skip;
                self.pending_trailer -= skip;
            }

            // Continue a member that split across the batch boundary.
            if self.mid_member {
                let (done, ratio_full) =
                    inflate_some(&mut self.z, input, &mut in_pos, &mut self.decoded, &mut out_pos)?;
                if ratio_full {
                    return Err(ratio_error(physical_base));
                }
                if done {
                    self.mid_member = false;
                    let skip = GZIP_TRAILER_LEN.min(input.len() - in_pos);
                    in_pos += skip;
                    self.pending_trailer = GZIP_TRAILER_LEN - skip;
                }
            }

            while !self.mid_member && self.pending_trailer == 0 && in_pos < input.len() {
                let header_len = parse_gzip_header(&input[in_pos..]).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "bad gzip member at file offset {}: {}",
                            physical_base + in_pos as u64,
                            e
                        ),
                    )
                })?;
                self.anchors.push((out_pos, physical_base + in_pos as u64));
                in_pos += header_len;
                self.z.reset(false);
                let (done, ratio_full) =
                    inflate_some(&mut self.z, input, &mut in_pos, &mut self.decoded, &mut out_pos)?;
                if ratio_full {
                    return Err(ratio_error(physical_base));
                }
                if done {
                    let skip = GZIP_TRAILER_LEN.min(input.len() - in_pos);
                    in_pos += skip;
                    self.pending_trailer = GZIP_TRAILER_LEN - skip;
                    if self.pending_trailer > 0 {
                        break;
                    }
                } else {
                    self.mid_member = true;
                }
            }

            (in_pos, out_pos - prior_len)
        };

        self.inner.advance(consumed);
        self.valid = prior_len + written;
        self.start_bytes = if self.inner.is_eof() {
            self.valid
        } else {
            self.valid.saturating_sub(self.overflow)
        };
        Ok(())
    }
}

fn ratio_error(physical_base: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!(
            "compressed data near file offset {} expands beyond the supported {}x ratio",
            physical_base, MAX_FACTOR
        ),
    )
}

/// Inflate from `input[*in_pos..]` into `out[*out_pos..]` until the member
/// ends, the input runs dry, or the output fills. Returns
/// (member_finished, output_full_with_input_left).
fn inflate_some(
    z: &mut Decompress,
    input: &[u8],
    in_pos: &mut usize,
    out: &mut [u8],
    out_pos: &mut usize,
) -> io::Result<(bool, bool)> {
    loop {
        let before_in = z.total_in();
        let before_out = z.total_out();
        let status = z
            .decompress(&input[*in_pos..], &mut out[*out_pos..], FlushDecompress::None)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("inflate: {}", e)))?;
        *in_pos += (z.total_in() - before_in) as usize;
        *out_pos += (z.total_out() - before_out) as usize;
        match status {
            Status::StreamEnd => return Ok((true, false)),
            Status::Ok | Status::BufError => {
                if *in_pos >= input.len() {
                    return Ok((false, false));
                }
                if *out_pos >= out.len() {
                    return Ok((false, true));
                }
                if status == Status::BufError {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "inflate stalled on corrupt gzip data",
                    ));
                }
            }
        }
    }
}

/// Length of the gzip member header at the front of `input`.
fn parse_gzip_header(input: &[u8]) -> Result<usize, String> {
    if input.len() < 10 {
        return Err("member header split across batches".to_string());
    }
    if input[0] != 0x1f || input[1] != 0x8b {
        return Err(format!("bad magic {:02x}{:02x}", input[0], input[1]));
    }
    if input[2] != 8 {
        return Err(format!("unsupported compression method {}", input[2]));
    }
    let flags = input[3];
    let mut pos = 10usize;
    if flags & 0x04 != 0 {
        // FEXTRA
        if pos + 2 > input.len() {
            return Err("member header split across batches".to_string());
        }
        let xlen = u16::from_le_bytes([input[pos], input[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    for flag in [0x08u8, 0x10] {
        // FNAME, FCOMMENT: nul-terminated
        if flags & flag != 0 {
            match input[pos.min(input.len())..].iter().position(|&b| b == 0) {
                Some(nul) => pos += nul + 1,
                None => return Err("member header split across batches".to_string()),
            }
        }
    }
    if flags & 0x02 != 0 {
        // FHCRC
        pos += 2;
    }
    if pos > input.len() {
        return Err("member header split across batches".to_string());
    }
    Ok(pos)
}

impl DataReader for GzipDataReader {
    fn reinit(&mut self, start: u64, amount: u64) -> io::Result<()> {
        self.inner.reinit(start, amount)?;
        self.got_batch = false;
        self.mid_member = false;
        self.pending_trailer = 0;
        self.offset = 0;
        self.valid = 0;
        self.start_bytes = 0;
        self.prior.clear();
        self.anchors.clear();
        Ok(())
    }

    fn read_header(&mut self, wanted: usize) -> io::Result<Vec<u8>> {
        // Best-effort peek: inflate from the compressed head until we
        // have `wanted` decoded bytes or the peeked input runs out.
        let compressed = self
            .inner
            .read_header(((wanted as f64) / MIN_FACTOR) as usize + 1024)?;
        let mut out = vec![0u8; wanted];
        let mut z = Decompress::new(false);
        let mut in_pos = 0usize;
        let mut out_pos = 0usize;
        while in_pos < compressed.len() && out_pos < wanted {
            let header_len = match parse_gzip_header(&compressed[in_pos..]) {
                Ok(n) => n,
                Err(_) => break,
            };
            in_pos += header_len;
            z.reset(false);
            if inflate_some(&mut z, &compressed, &mut in_pos, &mut out, &mut out_pos)?.0 {
                in_pos += GZIP_TRAILER_LEN.min(compressed.len() - in_pos);
            } else {
                break;
            }
        }
        out.truncate(out_pos);
        Ok(out)
    }

    fn get_data(&mut self) -> io::Result<Option<DataSlice<'_>>> {
        if !self.got_batch {
            self.decompress_batch()?;
            self.got_batch = true;
        }
        if self.offset >= self.start_bytes {
            return Ok(None);
        }
        Ok(Some(DataSlice {
            bytes: &self.decoded[self.offset..self.valid],
            start_bytes: self.start_bytes - self.offset,
        }))
    }

    fn advance(&mut self, bytes: usize) {
        self.offset = (self.offset + bytes).min(self.valid);
    }

    fn next_batch(&mut self, keep_open: bool) -> io::Result<()> {
        if self.got_batch {
            // Carry decoded bytes nobody consumed as record starts yet.
            let consumed_past = self.offset.max(self.start_bytes);
            self.prior.clear();
            self.prior.extend_from_slice(&self.decoded[consumed_past..self.valid]);
        }
        self.inner.next_batch(true)?;
        if !keep_open {
            let batch = self.inner.batch();
            self.inner.release_before(batch);
        }
        self.got_batch = false;
        self.offset = 0;
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.inner.is_eof()
    }

    fn batch(&self) -> DataBatch {
        self.inner.batch()
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.inner.release_handle()
    }

    fn extra(&mut self) -> &mut [u8] {
        &mut self.extra_down
    }

    fn file_offset(&self) -> u64 {
        self.inner.file_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::data_reader::OverlappedDataReader;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use std::io::Write;

    fn gzip_members(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(chunk).unwrap();
            out.extend_from_slice(&enc.finish().unwrap());
        }
        out
    }

    fn write_gz(path: &std::path::Path, bytes: &[u8]) {
        File::create(path).unwrap().write_all(bytes).unwrap();
    }

    fn open_gzip_reader(path: &std::path::Path, overflow: usize, batch: usize) -> GzipDataReader {
        let inner = OverlappedDataReader::with_buffer_size(path, 0, 0.0, batch).unwrap();
        let mut reader = GzipDataReader::wrap(Box::new(inner), overflow, batch, 0.0);
        reader.reinit(0, 0).unwrap();
        reader
    }

    fn drain(reader: &mut GzipDataReader) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            while let Some(slice) = reader.get_data().unwrap() {
                let take = slice.start_bytes.min(slice.bytes.len());
                out.extend_from_slice(&slice.bytes[..take]);
                reader.advance(take);
            }
            if reader.is_eof() {
                break;
            }
            reader.next_batch(false).unwrap();
        }
        out
    }

    #[test]
    fn single_member_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.gz");
        let payload: Vec<u8> = (0..50_000).map(|i| (i % 7) as u8 + b'a').collect();
        write_gz(&path, &gzip_members(&[&payload]));
        let mut reader = open_gzip_reader(&path, 128, 1 << 20);
        assert_eq!(drain(&mut reader), payload);
    }

    #[test]
    fn many_members_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.gz");
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 13) as u8 + b'A').collect();
        let chunks: Vec<&[u8]> = payload.chunks(777).collect();
        write_gz(&path, &gzip_members(&chunks));
        let mut reader = open_gzip_reader(&path, 128, 1 << 20);
        assert_eq!(drain(&mut reader), payload);
    }

    #[test]
    fn member_split_across_inner_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.gz");
        // High-entropy payload so each inner batch inflates within the
        // supported ratio.
        let payload: Vec<u8> = (0..300_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let chunks: Vec<&[u8]> = payload.chunks(60_000).collect();
        write_gz(&path, &gzip_members(&chunks));
        // Small inner batches force members to straddle boundaries.
        let mut reader = open_gzip_reader(&path, 256, 4096);
        assert_eq!(drain(&mut reader), payload);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.gz");
        write_gz(&path, b"this is not gzip data at all, not even close");
        let mut reader = open_gzip_reader(&path, 64, 4096);
        assert!(reader.get_data().is_err());
    }

    #[test]
    fn virtual_offsets_point_at_member_starts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("e.gz");
        let a = vec![b'x'; 1000];
        let b = vec![b'y'; 1000];
        let raw = gzip_members(&[&a, &b]);
        let second_member_physical = {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&a).unwrap();
            enc.finish().unwrap().len() as u64
        };
        write_gz(&path, &raw);
        let mut reader = open_gzip_reader(&path, 0, 1 << 20);
        let _ = reader.get_data().unwrap().unwrap();
        // Position the consumer 10 bytes into the second member's data.
        reader.advance(1010);
        let voff = reader.virtual_offset().unwrap();
        assert_eq!(voff >> 16, second_member_physical);
        assert_eq!(voff & 0xffff, 10);
    }
}
