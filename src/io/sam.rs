// SAM text input and output. The reader recovers position/orientation
// (and the original read) from existing alignments; the writer formats
// fresh alignment records, including the pair bookkeeping fields.

use crate::align::cigar::CigarBuf;
use crate::align::lv::LandauVishkin;
use crate::align::SingleAlignment;
use crate::defaults::{IO_BUFFER_SIZE, MAX_READ_SIZE};
use crate::genome::Genome;
use crate::io::data_reader::{DataReader, ReleaseHandle};
use crate::io::gzip_reader::GzipDataReader;
use crate::io::{is_gzipped, ReadReader};
use crate::read::{Direction, Read};
use bio::alphabets::dna;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod sam_flags {
    pub const MULTI_SEGMENT: u16 = 0x1;
    pub const ALL_ALIGNED: u16 = 0x2;
    pub const UNMAPPED: u16 = 0x4;
    pub const NEXT_UNMAPPED: u16 = 0x8;
    pub const REVERSE_COMPLEMENT: u16 = 0x10;
    pub const NEXT_REVERSED: u16 = 0x20;
    pub const FIRST_SEGMENT: u16 = 0x40;
    pub const LAST_SEGMENT: u16 = 0x80;
    pub const SECONDARY: u16 = 0x100;
    pub const DUPLICATE: u16 = 0x400;
    pub const SUPPLEMENTARY: u16 = 0x800;
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct SamReader {
    reader: Box<dyn DataReader>,
    genome: Arc<Genome>,
    header_consumed: bool,
}

impl SamReader {
    pub fn open(path: &Path, file_id: u32, genome: Arc<Genome>) -> io::Result<Self> {
        use crate::io::data_reader::{MemMapDataReader, OverlappedDataReader};
        let overflow = 4 * MAX_READ_SIZE + 4096;
        let mut reader: Box<dyn DataReader> = if is_gzipped(path)? {
            let mut inner = OverlappedDataReader::open(path, 0, 0.0)?;
            inner.set_file_id(file_id);
            Box::new(GzipDataReader::wrap(Box::new(inner), overflow, IO_BUFFER_SIZE, 0.0))
        } else {
            let mut inner = MemMapDataReader::open(path, overflow, 0.0)?;
            inner.set_file_id(file_id);
            Box::new(inner)
        };
        reader.reinit(0, 0)?;
        Ok(SamReader {
            reader,
            genome,
            header_consumed: false,
        })
    }

    /// Consume `@` header lines, validating `@SQ` entries against the
    /// loaded genome.
    fn consume_header(&mut self) -> io::Result<()> {
        loop {
            let consumed = {
                let slice = match self.reader.get_data()? {
                    Some(s) => s,
                    None => {
                        if self.reader.is_eof() {
                            break;
                        }
                        self.reader.next_batch(true)?;
                        continue;
                    }
                };
                let mut pos = 0usize;
                while pos < slice.bytes.len() && slice.bytes[pos] == b'@' {
                    let line_end = slice.bytes[pos..]
                        .iter()
                        .position(|&b| b == b'\n')
                        .map(|n| pos + n)
                        .ok_or_else(|| {
                            io::Error::new(io::ErrorKind::InvalidData, "unterminated SAM header line")
                        })?;
                    let line = &slice.bytes[pos..line_end];
                    if line.starts_with(b"@SQ") {
                        validate_sq_line(line, &self.genome)?;
                    }
                    pos = line_end + 1;
                }
                pos
            };
            self.reader.advance(consumed);
            if consumed == 0 {
                break;
            }
            // A header line might be the last content before a batch
            // boundary; loop again to check the next slice.
            match self.reader.get_data()? {
                Some(s) if !s.bytes.is_empty() && s.bytes[0] == b'@' => continue,
                _ => break,
            }
        }
        self.header_consumed = true;
        Ok(())
    }
}

fn validate_sq_line(line: &[u8], genome: &Genome) -> io::Result<()> {
    let text = String::from_utf8_lossy(line);
    let mut name: Option<&str> = None;
    let mut len: Option<u32> = None;
    for field in text.split('\t').skip(1) {
        if let Some(sn) = field.strip_prefix("SN:") {
            name = Some(sn);
        } else if let Some(ln) = field.strip_prefix("LN:") {
            len = ln.trim().parse().ok();
        }
    }
    let name = name.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "@SQ line without SN: field")
    })?;
    let offset = genome.offset_of_piece(name).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("@SQ names '{}', which is not in the loaded genome", name),
        )
    })?;
    if let Some(len) = len {
        let idx = genome.piece_index_at(offset).unwrap();
        if genome.piece_length(idx) != len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "@SQ length for '{}' is {}, genome says {}",
                    name,
                    len,
                    genome.piece_length(idx)
                ),
            ));
        }
    }
    Ok(())
}

impl ReadReader for SamReader {
    fn next_read(&mut self) -> io::Result<Option<Read>> {
        if !self.header_consumed {
            self.consume_header()?;
        }
        loop {
            let batch = self.reader.batch();
            let at_eof = self.reader.is_eof();
            let file_offset = self.reader.file_offset();
            let (parsed, consumed) = {
                let slice = match self.reader.get_data()? {
                    Some(s) => s,
                    None => {
                        if at_eof {
                            return Ok(None);
                        }
                        self.reader.next_batch(true)?;
                        continue;
                    }
                };
                parse_sam_line(slice.bytes, at_eof, file_offset)?
            };
            self.reader.advance(consumed);
            match parsed {
                SamLine::Record(mut read) => {
                    read.set_batch(batch);
                    return Ok(Some(read));
                }
                SamLine::Skipped => continue,
            }
        }
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.reader.release_handle()
    }
}

enum SamLine {
    Record(Read),
    Skipped,
}

fn parse_sam_line(bytes: &[u8], at_eof: bool, file_offset: u64) -> io::Result<(SamLine, usize)> {
    let mut pos = 0;
    while pos < bytes.len() && (bytes[pos] == b'\n' || bytes[pos] == b'\r') {
        pos += 1;
    }
    if pos >= bytes.len() {
        return Ok((SamLine::Skipped, pos));
    }
    let line_end = match bytes[pos..].iter().position(|&b| b == b'\n') {
        Some(n) => pos + n,
        None if at_eof => bytes.len(),
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("SAM record at offset {} larger than the overflow region", file_offset),
            ))
        }
    };
    let consumed = (line_end + 1).min(bytes.len());
    let mut end = line_end;
    if end > pos && bytes[end - 1] == b'\r' {
        end -= 1;
    }
    let line = &bytes[pos..end];

    let fields: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
    if fields.len() < 11 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "SAM record at offset {} has {} fields, 11 required",
                file_offset,
                fields.len()
            ),
        ));
    }
    let flag: u16 = std::str::from_utf8(fields[1])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad FLAG field at offset {}", file_offset),
            )
        })?;

    if flag & (sam_flags::SECONDARY | sam_flags::SUPPLEMENTARY) != 0 {
        return Ok((SamLine::Skipped, consumed));
    }
    let seq = fields[9];
    if seq == b"*" {
        return Ok((SamLine::Skipped, consumed));
    }
    let mut seq = seq.to_vec();
    seq.make_ascii_uppercase();
    let qual: Vec<u8> = if fields[10] == b"*" {
        vec![b'I'; seq.len()]
    } else {
        fields[10].to_vec()
    };
    if qual.len() != seq.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("SEQ/QUAL length mismatch at offset {}", file_offset),
        ));
    }

    let mut read = Read::new(fields[0].to_vec(), seq, qual);
    if flag & sam_flags::REVERSE_COMPLEMENT != 0 {
        // Stored in genome orientation; recover the as-sequenced read.
        read.reverse_complement_in_place();
    }
    Ok((SamLine::Record(read), consumed))
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// A record readied for emission in either SAM or BAM form.
#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub qname: Vec<u8>,
    pub flag: u16,
    /// Piece index, None for unmapped.
    pub rname: Option<usize>,
    /// One-based position within the piece; 0 for unmapped.
    pub pos: u32,
    pub mapq: i32,
    pub cigar: Option<String>,
    pub cigar_bam: Vec<u32>,
    /// Bases in genome orientation (reverse complemented for RC hits).
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
    /// Reference bases consumed, for TLEN.
    pub ref_span: u32,
}

static CIGAR_OVERFLOW_WARNED: AtomicBool = AtomicBool::new(false);

/// Build a `PreparedRecord` for a read, computing the CIGAR by
/// re-extending at the reported location.
pub fn prepare_record(
    read: &Read,
    alignment: &SingleAlignment,
    genome: &Genome,
    lv: &mut LandauVishkin,
    cigar_buf: &mut CigarBuf,
    use_m: bool,
) -> PreparedRecord {
    let mut record = PreparedRecord {
        qname: read.id().to_vec(),
        flag: 0,
        rname: None,
        pos: 0,
        mapq: 0,
        cigar: None,
        cigar_bam: Vec::new(),
        seq: read.unclipped_data().to_vec(),
        qual: read.unclipped_quality().to_vec(),
        ref_span: 0,
    };

    if !alignment.result.is_aligned() {
        record.flag |= sam_flags::UNMAPPED;
        return record;
    }

    let rc = alignment.direction == Direction::Rc;
    let (oriented_seq, oriented_qual, front_clip, back_clip) = if rc {
        let mut q = read.unclipped_quality().to_vec();
        q.reverse();
        (
            dna::revcomp(read.unclipped_data()),
            q,
            read.back_clipping(),
            read.front_clipping(),
        )
    } else {
        (
            read.unclipped_data().to_vec(),
            read.unclipped_quality().to_vec(),
            read.front_clipping(),
            read.back_clipping(),
        )
    };
    let aligned_len = oriented_seq.len() - front_clip - back_clip;
    let aligned = &oriented_seq[front_clip..front_clip + aligned_len];
    let aligned_qual = &oriented_qual[front_clip..front_clip + aligned_len];

    let window_len = aligned_len + lv.max_k();
    let text = genome.substring_within_piece(alignment.location, window_len);
    let lv_result = match text {
        Some(text) => lv.compute_with_cigar(
            text,
            aligned,
            aligned_qual,
            lv.max_k() as i32,
            cigar_buf,
        ),
        None => crate::align::lv::LvResult::not_found(),
    };

    if lv_result.score < 0 {
        // Couldn't reproduce the alignment at emission time; report the
        // read unmapped rather than emit a wrong CIGAR.
        record.flag |= sam_flags::UNMAPPED;
        return record;
    }

    cigar_buf.push(b'S', back_clip as u32);
    cigar_buf.push_front_clip(front_clip as u32);
    let rendered = cigar_buf.render(use_m);
    if rendered.is_none() {
        if !CIGAR_OVERFLOW_WARNED.swap(true, Ordering::Relaxed) {
            log::warn!(
                "a CIGAR string exceeded the scratch limit; affected reads are emitted unmapped"
            );
        }
        record.flag |= sam_flags::UNMAPPED;
        return record;
    }

    let piece_idx = genome
        .piece_index_at(alignment.location)
        .expect("aligned location must fall inside the genome");
    let piece_start = genome.pieces()[piece_idx].beginning_offset;

    record.flag |= if rc { sam_flags::REVERSE_COMPLEMENT } else { 0 };
    record.rname = Some(piece_idx);
    record.pos = alignment.location - piece_start + 1;
    record.mapq = alignment.mapq;
    record.ref_span = cigar_buf.reference_bases();
    record.cigar = rendered;
    record.cigar_bam = cigar_buf.bam_ops(use_m);
    record.seq = oriented_seq;
    record.qual = oriented_qual;
    record
}

/// Pair bookkeeping applied at emission.
#[derive(Debug, Clone, Copy)]
pub struct PairEmit<'a> {
    pub mate: &'a PreparedRecord,
    pub first_in_pair: bool,
    pub proper: bool,
}

pub fn pair_flags(rec: &mut PreparedRecord, pair: &PairEmit) {
    rec.flag |= sam_flags::MULTI_SEGMENT;
    rec.flag |= if pair.first_in_pair {
        sam_flags::FIRST_SEGMENT
    } else {
        sam_flags::LAST_SEGMENT
    };
    if pair.proper {
        rec.flag |= sam_flags::ALL_ALIGNED;
    }
    if pair.mate.flag & sam_flags::UNMAPPED != 0 {
        rec.flag |= sam_flags::NEXT_UNMAPPED;
    }
    if pair.mate.flag & sam_flags::REVERSE_COMPLEMENT != 0 {
        rec.flag |= sam_flags::NEXT_REVERSED;
    }
}

/// Template length: signed span of a pair on one piece, positive for the
/// leftmost segment.
pub fn template_length(rec: &PreparedRecord, mate: &PreparedRecord) -> i64 {
    if rec.flag & sam_flags::UNMAPPED != 0
        || mate.flag & sam_flags::UNMAPPED != 0
        || rec.rname != mate.rname
    {
        return 0;
    }
    let self_start = rec.pos as i64;
    let self_end = rec.pos as i64 + rec.ref_span as i64 - 1;
    let mate_start = mate.pos as i64;
    let mate_end = mate.pos as i64 + mate.ref_span as i64 - 1;
    let span = self_end.max(mate_end) - self_start.min(mate_start) + 1;
    if (self_start, self_end) <= (mate_start, mate_end) {
        span
    } else {
        -span
    }
}

/// The text header for a run against `genome`.
pub fn sam_header(genome: &Genome) -> String {
    let mut header = String::from("@HD\tVN:1.6\tSO:unsorted\n");
    for (idx, piece) in genome.pieces().iter().enumerate() {
        header.push_str(&format!(
            "@SQ\tSN:{}\tLN:{}\n",
            piece.name,
            genome.piece_length(idx)
        ));
    }
    header.push_str(&format!(
        "@PG\tID:seedex\tPN:seedex\tVN:{}\n",
        env!("CARGO_PKG_VERSION")
    ));
    header
}

/// Append one SAM text line.
pub fn emit_sam(
    out: &mut Vec<u8>,
    rec: &PreparedRecord,
    pair: Option<&PairEmit>,
    genome: &Genome,
) -> io::Result<()> {
    let rname = match rec.rname {
        Some(idx) => genome.pieces()[idx].name.as_str(),
        None => "*",
    };
    let (rnext, pnext, tlen) = match pair {
        Some(p) => {
            let mate = p.mate;
            let rnext = match mate.rname {
                Some(_) if rec.rname == mate.rname => "=".to_string(),
                Some(idx) => genome.pieces()[idx].name.clone(),
                None => "*".to_string(),
            };
            (rnext, mate.pos, template_length(rec, mate))
        }
        None => ("*".to_string(), 0, 0),
    };
    out.write_all(&rec.qname)?;
    write!(
        out,
        "\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t",
        rec.flag,
        rname,
        rec.pos,
        rec.mapq,
        rec.cigar.as_deref().unwrap_or("*"),
        rnext,
        pnext,
        tlen
    )?;
    out.write_all(&rec.seq)?;
    out.push(b'\t');
    out.write_all(&rec.qual)?;
    out.push(b'\n');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::DataBatch;

    fn test_genome() -> Arc<Genome> {
        Arc::new(
            Genome::from_pieces(vec![
                ("chr1".to_string(), vec![b'A'; 1000]),
                ("chr2".to_string(), vec![b'C'; 500]),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn sq_validation_accepts_known_pieces() {
        let g = test_genome();
        assert!(validate_sq_line(b"@SQ\tSN:chr1\tLN:1000", &g).is_ok());
        assert!(validate_sq_line(b"@SQ\tSN:chrX\tLN:1000", &g).is_err());
        assert!(validate_sq_line(b"@SQ\tSN:chr2\tLN:9", &g).is_err());
        assert!(validate_sq_line(b"@SQ\tLN:1000", &g).is_err());
    }

    #[test]
    fn parse_line_recovers_rc_read() {
        let line = b"r1\t16\tchr1\t100\t60\t4M\t*\t0\t0\tACGT\tIIII\n";
        let (parsed, consumed) = parse_sam_line(line, false, 0).unwrap();
        assert_eq!(consumed, line.len());
        match parsed {
            SamLine::Record(read) => {
                // Stored ACGT reverse complemented back to the original.
                assert_eq!(read.data(), dna::revcomp(b"ACGT").as_slice());
            }
            SamLine::Skipped => panic!("expected a record"),
        }
    }

    #[test]
    fn parse_line_skips_secondary() {
        let line = b"r1\t256\tchr1\t100\t60\t4M\t*\t0\t0\tACGT\tIIII\n";
        let (parsed, _) = parse_sam_line(line, false, 0).unwrap();
        assert!(matches!(parsed, SamLine::Skipped));
    }

    #[test]
    fn parse_line_rejects_short_lines() {
        let line = b"r1\t0\tchr1\t100\n";
        assert!(parse_sam_line(line, false, 0).is_err());
    }

    #[test]
    fn header_lists_pieces_and_lengths() {
        let g = test_genome();
        let header = sam_header(&g);
        assert!(header.contains("@SQ\tSN:chr1\tLN:1000"));
        assert!(header.contains("@SQ\tSN:chr2\tLN:500"));
        assert!(header.starts_with("@HD"));
    }

    #[test]
    fn emit_unmapped_record() {
        let g = test_genome();
        let mut read = Read::new(b"u1".to_vec(), b"ACGTACGT".to_vec(), b"IIIIIIII".to_vec());
        read.set_batch(DataBatch::new(0, 1));
        let mut lv = LandauVishkin::new_forward(8);
        let mut cigar = CigarBuf::new();
        let rec = prepare_record(
            &read,
            &SingleAlignment::not_found(),
            &g,
            &mut lv,
            &mut cigar,
            false,
        );
        let mut out = Vec::new();
        emit_sam(&mut out, &rec, None, &g).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "u1\t4\t*\t0\t0\t*\t*\t0\t0\tACGTACGT\tIIIIIIII\n");
    }

    #[test]
    fn template_length_signs() {
        let mut a = PreparedRecord {
            qname: b"a".to_vec(),
            flag: 0,
            rname: Some(0),
            pos: 100,
            mapq: 60,
            cigar: None,
            cigar_bam: vec![],
            seq: vec![],
            qual: vec![],
            ref_span: 100,
        };
        let mut b = a.clone();
        b.pos = 400;
        assert_eq!(template_length(&a, &b), 400);
        assert_eq!(template_length(&b, &a), -400);
        a.flag = sam_flags::UNMAPPED;
        assert_eq!(template_length(&a, &b), 0);
    }
}
