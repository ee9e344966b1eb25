// Genome index: a read-only hash from fixed-length seeds (k-mers, packed
// 2-bit) to the genome locations where they occur. Lookups answer for both
// orientations at once; hit lists are stored sorted descending so that the
// paired-end intersection can walk them high-to-low without sorting.

use crate::genome::{Genome, GenomePiece};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read as IoRead, Write};
use std::path::Path;
use std::sync::Arc;

const INDEX_MAGIC: &[u8; 4] = b"SDX1";
const INDEX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// A packed seed: up to 31 bases, 2 bits each. Seeds containing `N` have
/// no packed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seed(u64);

impl Seed {
    /// Pack `seed_len` bases starting at `bases[0]`. None if any base is
    /// not one of `ACGTacgt`.
    pub fn from_bases(bases: &[u8], seed_len: usize) -> Option<Seed> {
        debug_assert!(seed_len <= 31 && bases.len() >= seed_len);
        let mut packed = 0u64;
        for &b in &bases[..seed_len] {
            packed = (packed << 2) | base_code(b)? as u64;
        }
        Some(Seed(packed))
    }

    /// The packed reverse complement of this seed.
    pub fn reverse_complement(self, seed_len: usize) -> Seed {
        let mut fwd = self.0;
        let mut rc = 0u64;
        for _ in 0..seed_len {
            rc = (rc << 2) | (3 - (fwd & 3));
            fwd >>= 2;
        }
        Seed(rc)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// True if `bases[..seed_len]` contains only `ACGT` letters.
    pub fn text_represents_a_seed(bases: &[u8], seed_len: usize) -> bool {
        bases.len() >= seed_len && bases[..seed_len].iter().all(|&b| base_code(b).is_some())
    }
}

#[inline]
fn base_code(b: u8) -> Option<u8> {
    match b {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

static EMPTY_HITS: [u32; 0] = [];

/// Read-only seed index over a genome.
pub struct GenomeIndex {
    genome: Arc<Genome>,
    seed_len: usize,
    // Locations are forward-strand positions of the seed, descending.
    table: HashMap<u64, Vec<u32>>,
}

impl GenomeIndex {
    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    pub fn genome_arc(&self) -> Arc<Genome> {
        Arc::clone(&self.genome)
    }

    pub fn seed_len(&self) -> usize {
        self.seed_len
    }

    /// All genome locations where `seed` occurs, for the seed itself and
    /// for its reverse complement, each sorted descending.
    pub fn lookup(&self, seed: Seed) -> (&[u32], &[u32]) {
        let fwd = self
            .table
            .get(&seed.as_u64())
            .map(|v| v.as_slice())
            .unwrap_or(&EMPTY_HITS);
        let rc = self
            .table
            .get(&seed.reverse_complement(self.seed_len).as_u64())
            .map(|v| v.as_slice())
            .unwrap_or(&EMPTY_HITS);
        (fwd, rc)
    }

    /// Build an index in memory by scanning every seed position of the
    /// genome. This is what the `index` subcommand and the tests use; big
    /// production references would be indexed once and loaded with
    /// `load`.
    pub fn from_genome(genome: Arc<Genome>, seed_len: usize) -> io::Result<Self> {
        if !(16..=31).contains(&seed_len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("seed length {} out of range 16..=31", seed_len),
            ));
        }
        let mut table: HashMap<u64, Vec<u32>> = HashMap::new();
        for piece_idx in 0..genome.num_pieces() {
            let start = genome.pieces()[piece_idx].beginning_offset;
            let len = genome.piece_length(piece_idx) as usize;
            if len < seed_len {
                continue;
            }
            let bases = genome.substring(start, len).unwrap();
            for offset in 0..=(len - seed_len) {
                if let Some(seed) = Seed::from_bases(&bases[offset..], seed_len) {
                    table
                        .entry(seed.as_u64())
                        .or_default()
                        .push(start + offset as u32);
                }
            }
        }
        // Locations were appended ascending; the lookup contract wants
        // descending.
        for hits in table.values_mut() {
            hits.reverse();
        }
        log::debug!(
            "indexed {} distinct {}-mers over {} bases",
            table.len(),
            seed_len,
            genome.count_of_bases()
        );
        Ok(GenomeIndex {
            genome,
            seed_len,
            table,
        })
    }

    /// Write the index (including the genome) to `path`.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::with_capacity(INDEX_BUFFER_SIZE, File::create(path)?);
        out.write_all(INDEX_MAGIC)?;
        out.write_all(&(self.seed_len as u32).to_le_bytes())?;

        out.write_all(&(self.genome.num_pieces() as u32).to_le_bytes())?;
        for piece in self.genome.pieces() {
            let name = piece.name.as_bytes();
            out.write_all(&(name.len() as u32).to_le_bytes())?;
            out.write_all(name)?;
            out.write_all(&piece.beginning_offset.to_le_bytes())?;
        }
        let n_bases = self.genome.count_of_bases();
        out.write_all(&(n_bases as u64).to_le_bytes())?;
        out.write_all(self.genome.substring(0, n_bases as usize).unwrap())?;

        out.write_all(&(self.table.len() as u64).to_le_bytes())?;
        for (&key, hits) in &self.table {
            out.write_all(&key.to_le_bytes())?;
            out.write_all(&(hits.len() as u32).to_le_bytes())?;
            for &h in hits {
                out.write_all(&h.to_le_bytes())?;
            }
        }
        out.flush()
    }

    /// Load an index previously written with `save`.
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut file = BufReader::with_capacity(INDEX_BUFFER_SIZE, File::open(path)?);
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != INDEX_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: not a seedex index (bad magic)", path.display()),
            ));
        }
        let seed_len = read_u32(&mut file)? as usize;
        if !(16..=31).contains(&seed_len) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: corrupt seed length {}", path.display(), seed_len),
            ));
        }

        let n_pieces = read_u32(&mut file)? as usize;
        let mut pieces = Vec::with_capacity(n_pieces);
        for _ in 0..n_pieces {
            let name_len = read_u32(&mut file)? as usize;
            let mut name = vec![0u8; name_len];
            file.read_exact(&mut name)?;
            let beginning_offset = read_u32(&mut file)?;
            pieces.push(GenomePiece {
                name: String::from_utf8(name).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "piece name is not UTF-8")
                })?,
                beginning_offset,
            });
        }
        let n_bases = read_u64(&mut file)? as usize;
        let mut bases = vec![0u8; n_bases];
        file.read_exact(&mut bases)?;
        let genome = Arc::new(Genome::new(bases, pieces)?);

        let n_seeds = read_u64(&mut file)?;
        let mut table = HashMap::with_capacity(n_seeds as usize);
        for _ in 0..n_seeds {
            let key = read_u64(&mut file)?;
            let n_hits = read_u32(&mut file)? as usize;
            let mut hits = Vec::with_capacity(n_hits);
            let mut buf = [0u8; 4];
            for _ in 0..n_hits {
                file.read_exact(&mut buf)?;
                hits.push(u32::from_le_bytes(buf));
            }
            table.insert(key, hits);
        }
        log::info!(
            "loaded index: {} pieces, {} bases, seed length {}",
            genome.num_pieces(),
            genome.count_of_bases(),
            seed_len
        );
        Ok(GenomeIndex {
            genome,
            seed_len,
            table,
        })
    }
}

fn read_u32<R: IoRead>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: IoRead>(r: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_genome() -> Arc<Genome> {
        // 40 bases, long enough for 16-mers at many offsets.
        Arc::new(
            Genome::from_pieces(vec![(
                "chr1".to_string(),
                b"ACGTACGTACGTACGTTTTTGGGGCCCCAAAATCTCTCTC".to_vec(),
            )])
            .unwrap(),
        )
    }

    #[test]
    fn seed_packing_rejects_n() {
        assert!(Seed::from_bases(b"ACGTACGTACGTACGT", 16).is_some());
        assert!(Seed::from_bases(b"ACGTACGTNCGTACGT", 16).is_none());
        assert!(!Seed::text_represents_a_seed(b"ACGTACGTNCGTACGT", 16));
    }

    #[test]
    fn seed_reverse_complement_involution() {
        let s = Seed::from_bases(b"ACGTACGTACGTACGT", 16).unwrap();
        assert_eq!(s.reverse_complement(16).reverse_complement(16), s);
    }

    #[test]
    fn lookup_finds_all_occurrences_descending() {
        let index = GenomeIndex::from_genome(small_genome(), 16).unwrap();
        // "ACGTACGTACGTACGT" occurs at offset 0 only (offset 4 runs into T's).
        let seed = Seed::from_bases(b"ACGTACGTACGTACGT", 16).unwrap();
        let (fwd, _) = index.lookup(seed);
        assert_eq!(fwd, &[0]);

        // Every indexed hit list is descending.
        for hits in index.table.values() {
            assert!(hits.windows(2).all(|w| w[0] > w[1]));
        }
    }

    #[test]
    fn rc_lookup_matches_forward_of_complement() {
        let index = GenomeIndex::from_genome(small_genome(), 16).unwrap();
        let seed = Seed::from_bases(b"ACGTACGTACGTACGT", 16).unwrap();
        let rc_seed = seed.reverse_complement(16);
        let (fwd_of_rc, _) = index.lookup(rc_seed);
        let (_, rc_of_fwd) = index.lookup(seed);
        assert_eq!(fwd_of_rc, rc_of_fwd);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.sdx");
        let index = GenomeIndex::from_genome(small_genome(), 16).unwrap();
        index.save(&path).unwrap();
        let loaded = GenomeIndex::load(&path).unwrap();
        assert_eq!(loaded.seed_len(), 16);
        assert_eq!(loaded.genome().count_of_bases(), 40);
        let seed = Seed::from_bases(b"ACGTACGTACGTACGT", 16).unwrap();
        assert_eq!(loaded.lookup(seed).0, index.lookup(seed).0);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.sdx");
        std::fs::write(&path, b"NOPE").unwrap();
        assert!(GenomeIndex::load(&path).is_err());
    }
}
