// A sequencing read and the batch tag that ties it back to the I/O buffer
// it was parsed from.

use bio::alphabets::dna;
use std::fmt;

/// Identifies one contiguous decoded region of one input file. Every read
/// carries the batch it was parsed from; the supplier queue refcounts
/// batches to decide when a reader may recycle its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataBatch {
    pub file_id: u32,
    pub batch_id: u32,
}

impl DataBatch {
    pub fn new(file_id: u32, batch_id: u32) -> Self {
        DataBatch { file_id, batch_id }
    }

    pub fn as_key(self) -> u64 {
        ((self.file_id as u64) << 32) | self.batch_id as u64
    }
}

impl fmt::Display for DataBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.batch_id)
    }
}

/// Which orientation of the read we are talking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Rc,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Forward => Direction::Rc,
            Direction::Rc => Direction::Forward,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Rc => 1,
        }
    }
}

pub const NUM_DIRECTIONS: usize = 2;

/// A DNA read: identifier, bases (`ACGTN`), Phred+33 qualities, and a
/// clipping window into the unclipped sequence.
#[derive(Debug, Clone)]
pub struct Read {
    id: Vec<u8>,
    data: Vec<u8>,
    quality: Vec<u8>,
    front_clipping: usize,
    back_clipping: usize,
    batch: DataBatch,
}

impl Default for Read {
    fn default() -> Self {
        Read::new(Vec::new(), Vec::new(), Vec::new())
    }
}

impl Read {
    pub fn new(id: Vec<u8>, data: Vec<u8>, quality: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), quality.len());
        Read {
            id,
            data,
            quality,
            front_clipping: 0,
            back_clipping: 0,
            batch: DataBatch::new(0, 0),
        }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The clipped sequence (what the aligner sees).
    pub fn data(&self) -> &[u8] {
        &self.data[self.front_clipping..self.data.len() - self.back_clipping]
    }

    pub fn quality(&self) -> &[u8] {
        &self.quality[self.front_clipping..self.quality.len() - self.back_clipping]
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.front_clipping - self.back_clipping
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unclipped_len(&self) -> usize {
        self.data.len()
    }

    pub fn unclipped_data(&self) -> &[u8] {
        &self.data
    }

    pub fn unclipped_quality(&self) -> &[u8] {
        &self.quality
    }

    pub fn front_clipping(&self) -> usize {
        self.front_clipping
    }

    pub fn back_clipping(&self) -> usize {
        self.back_clipping
    }

    pub fn batch(&self) -> DataBatch {
        self.batch
    }

    pub fn set_batch(&mut self, batch: DataBatch) {
        self.batch = batch;
    }

    /// Clip trailing bases whose quality has collapsed to `#` (Phred 2),
    /// the Illumina "read segment quality control indicator". Clipping
    /// starts at the first `#` of the trailing run.
    pub fn clip_low_quality_tail(&mut self) {
        let q = &self.quality;
        let mut first_hash = q.len();
        while first_hash > self.front_clipping && q[first_hash - 1] == b'#' {
            first_hash -= 1;
        }
        self.back_clipping = q.len() - first_hash;
    }

    pub fn set_clipping(&mut self, front: usize, back: usize) {
        debug_assert!(front + back <= self.data.len());
        self.front_clipping = front;
        self.back_clipping = back;
    }

    /// Reverse-complement the read in place: bases are complemented and
    /// reversed, the quality string is reversed, and the clipping window
    /// flips ends.
    pub fn reverse_complement_in_place(&mut self) {
        self.data = dna::revcomp(&self.data);
        self.quality.reverse();
        std::mem::swap(&mut self.front_clipping, &mut self.back_clipping);
    }

    pub fn count_of_ns(&self) -> usize {
        self.data().iter().filter(|&&b| b == b'N' || b == b'n').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipping_window() {
        let mut r = Read::new(
            b"r1".to_vec(),
            b"ACGTACGT".to_vec(),
            b"IIIIII##".to_vec(),
        );
        r.clip_low_quality_tail();
        assert_eq!(r.len(), 6);
        assert_eq!(r.data(), b"ACGTAC");
        assert_eq!(r.quality(), b"IIIIII");
        assert_eq!(r.unclipped_len(), 8);
    }

    #[test]
    fn reverse_complement_round_trip() {
        let mut r = Read::new(b"r1".to_vec(), b"ACGTN".to_vec(), b"ABCDE".to_vec());
        r.set_clipping(1, 0);
        let orig = r.clone();
        r.reverse_complement_in_place();
        assert_eq!(r.unclipped_data(), b"NACGT");
        assert_eq!(r.unclipped_quality(), b"EDCBA");
        assert_eq!(r.front_clipping(), 0);
        assert_eq!(r.back_clipping(), 1);
        r.reverse_complement_in_place();
        assert_eq!(r.unclipped_data(), orig.unclipped_data());
        assert_eq!(r.unclipped_quality(), orig.unclipped_quality());
        assert_eq!(r.front_clipping(), orig.front_clipping());
    }

    #[test]
    fn n_count_respects_clipping() {
        let mut r = Read::new(b"r".to_vec(), b"NNACGTNN".to_vec(), b"IIIIII##".to_vec());
        r.clip_low_quality_tail();
        assert_eq!(r.count_of_ns(), 2);
    }

    #[test]
    fn batch_key_orders_by_file_then_batch() {
        let a = DataBatch::new(0, 5);
        let b = DataBatch::new(0, 6);
        let c = DataBatch::new(1, 0);
        assert!(a < b && b < c);
        assert!(a.as_key() < b.as_key() && b.as_key() < c.as_key());
    }
}
