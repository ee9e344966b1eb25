// BAM binary format: header and alignment-record codec, plus a raw view
// over encoded records for filters that rewrite flags in place.

use crate::align::cigar::bam_op_char;
use crate::defaults::{IO_BUFFER_SIZE, MAX_READ_SIZE};
use crate::genome::Genome;
use crate::io::data_reader::{DataReader, ReleaseHandle};
use crate::io::gzip_reader::GzipDataReader;
use crate::io::sam::{sam_flags, sam_header, PairEmit, PreparedRecord};
use crate::io::ReadReader;
use crate::read::Read;
use std::io;
use std::path::Path;
use std::sync::Arc;

pub const BAM_MAGIC: &[u8; 4] = b"BAM\x01";

/// 4-bit encoding of bases, per the BAM packed-sequence alphabet.
const SEQ_NIBBLE_CHARS: &[u8; 16] = b"=ACMGRSVTWYHKDBN";

fn base_to_nibble(b: u8) -> u8 {
    match b.to_ascii_uppercase() {
        b'=' => 0,
        b'A' => 1,
        b'C' => 2,
        b'M' => 3,
        b'G' => 4,
        b'R' => 5,
        b'S' => 6,
        b'V' => 7,
        b'T' => 8,
        b'W' => 9,
        b'Y' => 10,
        b'H' => 11,
        b'K' => 12,
        b'D' => 13,
        b'B' => 14,
        _ => 15, // N and anything unrecognized
    }
}

/// SAM-spec region-to-bin mapping (bin index for [beg, end), 0-based).
pub fn reg2bin(beg: i32, end: i32) -> u16 {
    let end = end - 1;
    if beg >> 14 == end >> 14 {
        return (((1 << 15) - 1) / 7 + (beg >> 14)) as u16;
    }
    if beg >> 17 == end >> 17 {
        return (((1 << 12) - 1) / 7 + (beg >> 17)) as u16;
    }
    if beg >> 20 == end >> 20 {
        return (((1 << 9) - 1) / 7 + (beg >> 20)) as u16;
    }
    if beg >> 23 == end >> 23 {
        return (((1 << 6) - 1) / 7 + (beg >> 23)) as u16;
    }
    if beg >> 26 == end >> 26 {
        return (((1 << 3) - 1) / 7 + (beg >> 26)) as u16;
    }
    0
}

/// The full BAM header for a run against `genome`: magic, SAM text, and
/// the reference table.
pub fn bam_header_bytes(genome: &Genome) -> Vec<u8> {
    let text = sam_header(genome);
    let mut out = Vec::with_capacity(text.len() + 64);
    out.extend_from_slice(BAM_MAGIC);
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out.extend_from_slice(&(genome.num_pieces() as u32).to_le_bytes());
    for (idx, piece) in genome.pieces().iter().enumerate() {
        out.extend_from_slice(&(piece.name.len() as u32 + 1).to_le_bytes());
        out.extend_from_slice(piece.name.as_bytes());
        out.push(0);
        out.extend_from_slice(&genome.piece_length(idx).to_le_bytes());
    }
    out
}

/// Append one encoded alignment record.
pub fn emit_bam(out: &mut Vec<u8>, rec: &PreparedRecord, pair: Option<&PairEmit>) {
    let unmapped = rec.flag & sam_flags::UNMAPPED != 0;
    let ref_id: i32 = rec.rname.map(|r| r as i32).unwrap_or(-1);
    let pos: i32 = if unmapped { -1 } else { rec.pos as i32 - 1 };
    let (next_ref_id, next_pos, tlen): (i32, i32, i64) = match pair {
        Some(p) => (
            p.mate.rname.map(|r| r as i32).unwrap_or(-1),
            if p.mate.flag & sam_flags::UNMAPPED != 0 {
                -1
            } else {
                p.mate.pos as i32 - 1
            },
            crate::io::sam::template_length(rec, p.mate),
        ),
        None => (-1, -1, 0),
    };

    let l_read_name = rec.qname.len() + 1;
    let n_cigar = if unmapped { 0 } else { rec.cigar_bam.len() };
    let l_seq = rec.seq.len();
    let block_size = 32 + l_read_name + 4 * n_cigar + (l_seq + 1) / 2 + l_seq;

    out.extend_from_slice(&(block_size as u32).to_le_bytes());
    out.extend_from_slice(&ref_id.to_le_bytes());
    out.extend_from_slice(&pos.to_le_bytes());
    out.push(l_read_name as u8);
    out.push(if unmapped { 0 } else { rec.mapq.clamp(0, 254) as u8 });
    let bin = if unmapped {
        0
    } else {
        reg2bin(pos, pos + rec.ref_span.max(1) as i32)
    };
    out.extend_from_slice(&bin.to_le_bytes());
    out.extend_from_slice(&(n_cigar as u16).to_le_bytes());
    out.extend_from_slice(&rec.flag.to_le_bytes());
    out.extend_from_slice(&(l_seq as u32).to_le_bytes());
    out.extend_from_slice(&next_ref_id.to_le_bytes());
    out.extend_from_slice(&next_pos.to_le_bytes());
    out.extend_from_slice(&(tlen as i32).to_le_bytes());
    out.extend_from_slice(&rec.qname);
    out.push(0);
    if !unmapped {
        for &op in &rec.cigar_bam {
            out.extend_from_slice(&op.to_le_bytes());
        }
    }
    let mut i = 0;
    while i + 1 < rec.seq.len() {
        out.push((base_to_nibble(rec.seq[i]) << 4) | base_to_nibble(rec.seq[i + 1]));
        i += 2;
    }
    if i < rec.seq.len() {
        out.push(base_to_nibble(rec.seq[i]) << 4);
    }
    for &q in &rec.qual {
        out.push(q.saturating_sub(33));
    }
}

// ---------------------------------------------------------------------------
// Raw record view (shared with the duplicate-marking filter)
// ---------------------------------------------------------------------------

/// Field offsets within an encoded record, counted from the start of its
/// `block_size` field.
pub mod layout {
    pub const REF_ID: usize = 4;
    pub const POS: usize = 8;
    pub const L_READ_NAME: usize = 12;
    pub const MAPQ: usize = 13;
    pub const N_CIGAR_OP: usize = 16;
    pub const FLAG: usize = 18;
    pub const L_SEQ: usize = 20;
    pub const NEXT_REF_ID: usize = 24;
    pub const NEXT_POS: usize = 28;
    pub const READ_NAME: usize = 36;
}

/// A borrowed view of one encoded record (starting at its block_size
/// field).
#[derive(Clone, Copy)]
pub struct BamRecordView<'a> {
    bytes: &'a [u8],
}

impl<'a> BamRecordView<'a> {
    /// None if the buffer does not hold a complete record.
    pub fn at(buffer: &'a [u8]) -> Option<Self> {
        if buffer.len() < 4 {
            return None;
        }
        let block_size =
            u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
        if buffer.len() < block_size + 4 || block_size < layout::READ_NAME - 4 {
            return None;
        }
        Some(BamRecordView {
            bytes: &buffer[..block_size + 4],
        })
    }

    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    fn i32_at(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.bytes[offset..offset + 4].try_into().unwrap())
    }

    pub fn ref_id(&self) -> i32 {
        self.i32_at(layout::REF_ID)
    }

    pub fn pos(&self) -> i32 {
        self.i32_at(layout::POS)
    }

    pub fn flag(&self) -> u16 {
        u16::from_le_bytes(self.bytes[layout::FLAG..layout::FLAG + 2].try_into().unwrap())
    }

    pub fn next_ref_id(&self) -> i32 {
        self.i32_at(layout::NEXT_REF_ID)
    }

    pub fn next_pos(&self) -> i32 {
        self.i32_at(layout::NEXT_POS)
    }

    pub fn l_seq(&self) -> usize {
        self.i32_at(layout::L_SEQ) as usize
    }

    pub fn n_cigar_op(&self) -> usize {
        u16::from_le_bytes(
            self.bytes[layout::N_CIGAR_OP..layout::N_CIGAR_OP + 2]
                .try_into()
                .unwrap(),
        ) as usize
    }

    pub fn read_name(&self) -> &'a [u8] {
        let l_read_name = self.bytes[layout::L_READ_NAME] as usize;
        // Trailing nul excluded.
        &self.bytes[layout::READ_NAME..layout::READ_NAME + l_read_name - 1]
    }

    pub fn qual(&self) -> &'a [u8] {
        let l_read_name = self.bytes[layout::L_READ_NAME] as usize;
        let l_seq = self.l_seq();
        let qual_start =
            layout::READ_NAME + l_read_name + 4 * self.n_cigar_op() + (l_seq + 1) / 2;
        &self.bytes[qual_start..qual_start + l_seq]
    }

    /// Sum of base qualities, the duplicate-marking tiebreak.
    pub fn total_quality(&self) -> i32 {
        self.qual()
            .iter()
            .map(|&q| if q == 255 { 0 } else { q as i32 })
            .sum()
    }

    /// Global genome location, given the per-reference global offsets.
    pub fn location(&self, ref_offsets: &[u32]) -> Option<u32> {
        let ref_id = self.ref_id();
        if ref_id < 0 || self.flag() & sam_flags::UNMAPPED != 0 {
            return None;
        }
        ref_offsets
            .get(ref_id as usize)
            .map(|&base| base + self.pos() as u32)
    }

    pub fn next_location(&self, ref_offsets: &[u32]) -> Option<u32> {
        let ref_id = self.next_ref_id();
        if ref_id < 0 {
            return None;
        }
        ref_offsets
            .get(ref_id as usize)
            .map(|&base| base + self.next_pos() as u32)
    }
}

pub fn set_flag(record_bytes: &mut [u8], flag: u16) {
    record_bytes[layout::FLAG..layout::FLAG + 2].copy_from_slice(&flag.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct BamReader {
    reader: Box<dyn DataReader>,
    genome: Arc<Genome>,
    header_consumed: bool,
    ref_offsets: Vec<u32>,
}

impl BamReader {
    pub fn open(path: &Path, file_id: u32, genome: Arc<Genome>) -> io::Result<Self> {
        use crate::io::data_reader::OverlappedDataReader;
        let overflow = 4 * MAX_READ_SIZE + 4096;
        let mut inner = OverlappedDataReader::open(path, 0, 0.0)?;
        inner.set_file_id(file_id);
        let mut reader: Box<dyn DataReader> =
            Box::new(GzipDataReader::wrap(Box::new(inner), overflow, IO_BUFFER_SIZE, 0.0));
        reader.reinit(0, 0)?;
        Ok(BamReader {
            reader,
            genome,
            header_consumed: false,
            ref_offsets: Vec::new(),
        })
    }

    /// Pull exactly `n` decoded bytes, crossing batches as needed.
    fn read_bytes(&mut self, n: usize) -> io::Result<Option<Vec<u8>>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            match self.reader.get_data()? {
                Some(slice) => {
                    let take = (n - out.len()).min(slice.bytes.len());
                    out.extend_from_slice(&slice.bytes[..take]);
                    self.reader.advance(take);
                }
                None => {
                    if self.reader.is_eof() {
                        if out.is_empty() {
                            return Ok(None);
                        }
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "truncated BAM input at file offset {}",
                                self.reader.file_offset()
                            ),
                        ));
                    }
                    self.reader.next_batch(true)?;
                }
            }
        }
        Ok(Some(out))
    }

    fn consume_header(&mut self) -> io::Result<()> {
        let magic = self.read_bytes(4)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "empty BAM input")
        })?;
        if magic != BAM_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a BAM file (bad magic)",
            ));
        }
        let l_text = self.read_u32()? as usize;
        let _text = self.read_exactly(l_text)?;
        let n_ref = self.read_u32()? as usize;
        self.ref_offsets = Vec::with_capacity(n_ref);
        for _ in 0..n_ref {
            let l_name = self.read_u32()? as usize;
            let name_bytes = self.read_exactly(l_name)?;
            let _l_ref = self.read_u32()?;
            let name = String::from_utf8_lossy(&name_bytes[..l_name.saturating_sub(1)]);
            let offset = self.genome.offset_of_piece(&name).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("BAM reference '{}' is not in the loaded genome", name),
                )
            })?;
            self.ref_offsets.push(offset);
        }
        self.header_consumed = true;
        Ok(())
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let bytes = self.read_exactly(4)?;
        Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap()))
    }

    fn read_exactly(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.read_bytes(n)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "truncated BAM input at file offset {}",
                    self.reader.file_offset()
                ),
            )
        })
    }

    pub fn ref_offsets(&self) -> &[u32] {
        &self.ref_offsets
    }
}

/// Decode one record body (everything after block_size) into a Read in
/// its original as-sequenced orientation. None for records the aligner
/// can't use (secondary, supplementary, no sequence).
fn decode_record_body(body: &[u8], file_offset: u64) -> io::Result<Option<Read>> {
    if body.len() < layout::READ_NAME - 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("BAM record too small at file offset {}", file_offset),
        ));
    }
    let get_i32 = |off: usize| i32::from_le_bytes(body[off..off + 4].try_into().unwrap());
    let l_read_name = body[layout::L_READ_NAME - 4] as usize;
    let n_cigar = u16::from_le_bytes(
        body[layout::N_CIGAR_OP - 4..layout::N_CIGAR_OP - 2].try_into().unwrap(),
    ) as usize;
    let flag = u16::from_le_bytes(body[layout::FLAG - 4..layout::FLAG - 2].try_into().unwrap());
    let l_seq = get_i32(layout::L_SEQ - 4) as usize;

    let name_start = layout::READ_NAME - 4;
    let cigar_start = name_start + l_read_name;
    let seq_start = cigar_start + 4 * n_cigar;
    let qual_start = seq_start + (l_seq + 1) / 2;
    if qual_start + l_seq > body.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("BAM record field lengths overrun at file offset {}", file_offset),
        ));
    }

    // Validate CIGAR opcodes even though we realign.
    for chunk in body[cigar_start..seq_start].chunks_exact(4) {
        let op = u32::from_le_bytes(chunk.try_into().unwrap());
        if bam_op_char((op & 0xf) as u8).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "CIGAR opcode {} out of range at file offset {}",
                    op & 0xf,
                    file_offset
                ),
            ));
        }
    }

    if flag & (sam_flags::SECONDARY | sam_flags::SUPPLEMENTARY) != 0 || l_seq == 0 {
        return Ok(None);
    }

    let name = body[name_start..name_start + l_read_name.saturating_sub(1)].to_vec();
    let mut seq = Vec::with_capacity(l_seq);
    for i in 0..l_seq {
        let byte = body[seq_start + i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
        seq.push(SEQ_NIBBLE_CHARS[nibble as usize]);
    }
    let qual: Vec<u8> = body[qual_start..qual_start + l_seq]
        .iter()
        .map(|&q| if q == 255 { b'I' } else { q + 33 })
        .collect();

    let mut read = Read::new(name, seq, qual);
    if flag & sam_flags::REVERSE_COMPLEMENT != 0 {
        read.reverse_complement_in_place();
    }
    Ok(Some(read))
}

impl ReadReader for BamReader {
    fn next_read(&mut self) -> io::Result<Option<Read>> {
        if !self.header_consumed {
            self.consume_header()?;
        }
        loop {
            let batch = self.reader.batch();
            let file_offset = self.reader.file_offset();
            let block_size = match self.read_bytes(4)? {
                Some(b) => u32::from_le_bytes(b[..4].try_into().unwrap()) as usize,
                None => return Ok(None),
            };
            let body = self.read_exactly(block_size)?;
            match decode_record_body(&body, file_offset)? {
                Some(mut read) => {
                    read.set_batch(batch);
                    return Ok(Some(read));
                }
                None => continue,
            }
        }
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.reader.release_handle()
    }
}
