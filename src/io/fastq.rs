// FASTQ parsing over a batch reader. Records that straddle a batch
// boundary are always whole in memory thanks to the reader's overflow
// region, so the parser never reassembles partial records.

use crate::defaults::{IO_BUFFER_SIZE, MAX_READ_SIZE};
use crate::io::data_reader::{DataReader, ReleaseHandle};
use crate::io::gzip_reader::GzipDataReader;
use crate::io::{is_gzipped, ReadReader};
use crate::read::Read;
use std::io;
use std::path::Path;

/// Room for one full record past a batch boundary.
fn record_overflow() -> usize {
    2 * MAX_READ_SIZE + 4096
}

pub struct FastqReader {
    reader: Box<dyn DataReader>,
    clip_low_quality: bool,
}

impl FastqReader {
    /// Open a FASTQ file, transparently unwrapping gzip.
    pub fn open(path: &Path, file_id: u32, clip_low_quality: bool) -> io::Result<Self> {
        let reader = open_data_reader(path, file_id)?;
        Ok(FastqReader {
            reader,
            clip_low_quality,
        })
    }

    /// For tests: wrap an already-initialized reader.
    pub fn from_reader(reader: Box<dyn DataReader>, clip_low_quality: bool) -> Self {
        FastqReader {
            reader,
            clip_low_quality,
        }
    }
}

/// Open `path` as a batch reader with FASTQ-sized overflow, behind the
/// gzip layer when the magic says so. Plain files are memory mapped;
/// compressed streams get the overlapped read-ahead reader, whose large
/// sequential buffers suit the decompressor.
pub fn open_data_reader(path: &Path, file_id: u32) -> io::Result<Box<dyn DataReader>> {
    use crate::io::data_reader::{MemMapDataReader, OverlappedDataReader};
    let overflow = record_overflow();
    let mut reader: Box<dyn DataReader> = if is_gzipped(path)? {
        log::debug!("{}: gzip input detected", path.display());
        let mut inner = OverlappedDataReader::open(path, 0, 0.0)?;
        inner.set_file_id(file_id);
        Box::new(GzipDataReader::wrap(
            Box::new(inner),
            overflow,
            IO_BUFFER_SIZE,
            0.0,
        ))
    } else {
        let mut inner = MemMapDataReader::open(path, overflow, 0.0)?;
        inner.set_file_id(file_id);
        Box::new(inner)
    };
    reader.reinit(0, 0)?;
    Ok(reader)
}

impl ReadReader for FastqReader {
    fn next_read(&mut self) -> io::Result<Option<Read>> {
        loop {
            let batch = self.reader.batch();
            let at_eof = self.reader.is_eof();
            let parsed = match self.reader.get_data()? {
                Some(slice) => parse_record(slice.bytes, at_eof)?,
                None => {
                    if at_eof {
                        return Ok(None);
                    }
                    self.reader.next_batch(true)?;
                    continue;
                }
            };
            match parsed {
                ParseOutcome::Record(mut read, consumed) => {
                    self.reader.advance(consumed);
                    read.set_batch(batch);
                    if self.clip_low_quality {
                        read.clip_low_quality_tail();
                    }
                    return Ok(Some(read));
                }
                ParseOutcome::OnlyWhitespace(consumed) => {
                    self.reader.advance(consumed);
                }
            }
        }
    }

    fn release_handle(&self) -> ReleaseHandle {
        self.reader.release_handle()
    }
}

enum ParseOutcome {
    Record(Read, usize),
    /// Trailing blank lines before EOF.
    OnlyWhitespace(usize),
}

fn parse_record(bytes: &[u8], at_eof: bool) -> io::Result<ParseOutcome> {
    let mut pos = 0;
    while pos < bytes.len() && (bytes[pos] == b'\n' || bytes[pos] == b'\r') {
        pos += 1;
    }
    if pos >= bytes.len() {
        return Ok(ParseOutcome::OnlyWhitespace(pos));
    }

    let malformed = |what: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed FASTQ record: {}", what),
        )
    };

    if bytes[pos] != b'@' {
        return Err(malformed("expected '@' at record start"));
    }

    let take_line = |pos: &mut usize| -> io::Result<(usize, usize)> {
        let start = *pos;
        match bytes[start..].iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let mut end = start + nl;
                if end > start && bytes[end - 1] == b'\r' {
                    end -= 1;
                }
                *pos = start + nl + 1;
                Ok((start, end))
            }
            None if at_eof => {
                // Final record without trailing newline.
                let end = bytes.len();
                *pos = end;
                Ok((start, end))
            }
            None => Err(malformed(
                "record larger than the reader's overflow region",
            )),
        }
    };

    let (id_start, id_end) = take_line(&mut pos)?;
    let (seq_start, seq_end) = take_line(&mut pos)?;
    let (plus_start, _plus_end) = take_line(&mut pos)?;
    let (qual_start, qual_end) = take_line(&mut pos)?;

    if bytes.get(plus_start) != Some(&b'+') {
        return Err(malformed("expected '+' separator line"));
    }
    let seq = &bytes[seq_start..seq_end];
    let qual = &bytes[qual_start..qual_end];
    if seq.len() != qual.len() {
        return Err(malformed("sequence and quality lengths differ"));
    }
    if seq.is_empty() {
        return Err(malformed("empty sequence"));
    }

    // Id runs from past the '@' to the first whitespace.
    let id_bytes = &bytes[id_start + 1..id_end];
    let id_len = id_bytes
        .iter()
        .position(|&b| b == b' ' || b == b'\t')
        .unwrap_or(id_bytes.len());

    let mut seq = seq.to_vec();
    seq.make_ascii_uppercase();
    Ok(ParseOutcome::Record(
        Read::new(id_bytes[..id_len].to_vec(), seq, qual.to_vec()),
        pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::data_reader::OverlappedDataReader;
    use std::io::Write;

    fn write_fastq(records: &[(&str, &str, &str)]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq");
        let mut f = std::fs::File::create(&path).unwrap();
        for (id, seq, qual) in records {
            writeln!(f, "@{}\n{}\n+\n{}", id, seq, qual).unwrap();
        }
        (dir, path)
    }

    fn collect_reads(reader: &mut FastqReader) -> Vec<Read> {
        let mut reads = Vec::new();
        while let Some(read) = reader.next_read().unwrap() {
            reads.push(read);
        }
        reads
    }

    #[test]
    fn parses_simple_records() {
        let (_dir, path) = write_fastq(&[
            ("r1 extra comment", "ACGT", "IIII"),
            ("r2", "GGGGTT", "IIIIII"),
        ]);
        let mut reader = FastqReader::open(&path, 0, false).unwrap();
        let reads = collect_reads(&mut reader);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].id(), b"r1");
        assert_eq!(reads[0].data(), b"ACGT");
        assert_eq!(reads[1].data(), b"GGGGTT");
        assert_eq!(reads[1].quality(), b"IIIIII");
    }

    #[test]
    fn hash_quality_triggers_back_clip() {
        let (_dir, path) = write_fastq(&[("r1", "ACGTACGT", "IIIIII##")]);
        let mut reader = FastqReader::open(&path, 0, true).unwrap();
        let reads = collect_reads(&mut reader);
        assert_eq!(reads[0].len(), 6);
        assert_eq!(reads[0].data(), b"ACGTAC");
    }

    #[test]
    fn records_crossing_batch_boundaries_survive() {
        // Tiny buffers force most records to straddle a boundary.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("many.fastq");
        let mut f = std::fs::File::create(&path).unwrap();
        for i in 0..500 {
            writeln!(f, "@read{}\n{}\n+\n{}", i, "ACGTACGTGA".repeat(8), "I".repeat(80))
                .unwrap();
        }
        drop(f);
        let mut inner = OverlappedDataReader::with_buffer_size(&path, 512, 0.0, 1024).unwrap();
        inner.set_file_id(0);
        let mut boxed: Box<dyn DataReader> = Box::new(inner);
        boxed.reinit(0, 0).unwrap();
        let mut reader = FastqReader::from_reader(boxed, false);
        let reads = collect_reads(&mut reader);
        assert_eq!(reads.len(), 500);
        assert_eq!(reads[499].id(), b"read499");
        // Batch ids move forward as we cross boundaries.
        assert!(reads[499].batch().batch_id > reads[0].batch().batch_id);
    }

    #[test]
    fn gzipped_input_is_transparent() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq.gz");
        let mut enc = GzEncoder::new(std::fs::File::create(&path).unwrap(), Compression::fast());
        for i in 0..50 {
            writeln!(enc, "@g{}\nACGTACGTAC\n+\nIIIIIIIIII", i).unwrap();
        }
        enc.finish().unwrap();
        let mut reader = FastqReader::open(&path, 0, false).unwrap();
        let reads = collect_reads(&mut reader);
        assert_eq!(reads.len(), 50);
        assert_eq!(reads[49].id(), b"g49");
    }

    #[test]
    fn garbage_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.fastq");
        std::fs::write(&path, "not a fastq file\nat all\n").unwrap();
        let mut reader = FastqReader::open(&path, 0, false).unwrap();
        assert!(reader.next_read().is_err());
    }
}
