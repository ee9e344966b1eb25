// End-to-end scenarios: reference -> index -> FASTQ -> pipeline -> SAM/BAM.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seedex::genome::Genome;
use seedex::index::GenomeIndex;
use seedex::options::AlignOptions;
use seedex::pipeline;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct TestSetup {
    _dir: tempfile::TempDir,
    root: PathBuf,
    genome: Arc<Genome>,
    index_path: PathBuf,
}

fn setup(genome_len: usize, seed: u64) -> TestSetup {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut rng = StdRng::seed_from_u64(seed);
    let bases: Vec<u8> = (0..genome_len).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect();
    let genome = Arc::new(Genome::from_pieces(vec![("chr1".to_string(), bases)]).unwrap());
    let index = GenomeIndex::from_genome(Arc::clone(&genome), 20).unwrap();
    let index_path = root.join("ref.sdx");
    index.save(&index_path).unwrap();
    TestSetup {
        _dir: dir,
        root,
        genome,
        index_path,
    }
}

fn write_fastq(path: &Path, reads: &[(&str, Vec<u8>)]) {
    let mut f = std::fs::File::create(path).unwrap();
    for (id, seq) in reads {
        writeln!(
            f,
            "@{}\n{}\n+\n{}",
            id,
            String::from_utf8_lossy(seq),
            "I".repeat(seq.len())
        )
        .unwrap();
    }
}

#[derive(Debug)]
struct SamLine {
    qname: String,
    flag: u16,
    rname: String,
    pos: u32,
    mapq: i32,
    cigar: String,
    tlen: i64,
}

fn read_sam(path: &Path) -> Vec<SamLine> {
    let text = std::fs::read_to_string(path).unwrap();
    text.lines()
        .filter(|l| !l.starts_with('@'))
        .map(|l| {
            let f: Vec<&str> = l.split('\t').collect();
            SamLine {
                qname: f[0].to_string(),
                flag: f[1].parse().unwrap(),
                rname: f[2].to_string(),
                pos: f[3].parse().unwrap(),
                mapq: f[4].parse().unwrap(),
                cigar: f[5].to_string(),
                tlen: f[8].parse().unwrap(),
            }
        })
        .collect()
}

fn align(setup: &TestSetup, fastq: &[PathBuf], paired: bool, out_name: &str) -> PathBuf {
    let out = setup.root.join(out_name);
    let mut options = AlignOptions::new(setup.index_path.clone(), fastq.to_vec());
    options.paired = paired;
    options.output_file = Some(out.clone());
    options.output_format = AlignOptions::detect_output_format(&out);
    options.num_threads = 2;
    pipeline::run(&options).unwrap();
    out
}

#[test]
fn exact_match_single_end() {
    let setup = setup(20_000, 101);
    let read = setup.genome.substring(1_000, 100).unwrap().to_vec();
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("exact", read)]);

    let out = align(&setup, &[fastq], false, "out.sam");
    let lines = read_sam(&out);
    assert_eq!(lines.len(), 1);
    let rec = &lines[0];
    assert_eq!(rec.qname, "exact");
    assert_eq!(rec.flag, 0);
    assert_eq!(rec.rname, "chr1");
    assert_eq!(rec.pos, 1_001); // one-based
    assert_eq!(rec.mapq, 70);
    assert_eq!(rec.cigar, "100=");
}

#[test]
fn single_mismatch() {
    let setup = setup(20_000, 102);
    let mut read = setup.genome.substring(2_000, 100).unwrap().to_vec();
    read[50] = match read[50] {
        b'A' => b'C',
        _ => b'A',
    };
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("mm", read)]);

    let out = align(&setup, &[fastq], false, "out.sam");
    let rec = &read_sam(&out)[0];
    assert_eq!(rec.pos, 2_001);
    assert!(rec.mapq >= 60, "mapq was {}", rec.mapq);
    assert_eq!(rec.cigar, "50=1X49=");
}

#[test]
fn single_base_deletion() {
    let setup = setup(20_000, 103);
    let mut read = setup.genome.substring(3_000, 100).unwrap().to_vec();
    read.remove(50);
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("del", read)]);

    let out = align(&setup, &[fastq], false, "out.sam");
    let rec = &read_sam(&out)[0];
    assert_eq!(rec.pos, 3_001);
    assert_eq!(rec.cigar, "50=1D49=");
}

#[test]
fn reverse_complement_match() {
    let setup = setup(20_000, 104);
    let read = bio::alphabets::dna::revcomp(setup.genome.substring(4_000, 100).unwrap());
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("rc", read)]);

    let out = align(&setup, &[fastq], false, "out.sam");
    let rec = &read_sam(&out)[0];
    assert_eq!(rec.flag & 0x10, 0x10);
    assert_eq!(rec.pos, 4_001);
    assert_eq!(rec.cigar, "100=");
}

#[test]
fn proper_pair_tlen_and_flags() {
    let setup = setup(40_000, 105);
    let r0 = setup.genome.substring(5_000, 100).unwrap().to_vec();
    let r1 = bio::alphabets::dna::revcomp(setup.genome.substring(5_300, 100).unwrap());
    let fq0 = setup.root.join("r1.fastq");
    let fq1 = setup.root.join("r2.fastq");
    write_fastq(&fq0, &[("pair", r0)]);
    write_fastq(&fq1, &[("pair", r1)]);

    let out = align(&setup, &[fq0, fq1], true, "out.sam");
    let lines = read_sam(&out);
    assert_eq!(lines.len(), 2);
    let first = lines.iter().find(|l| l.flag & 0x40 != 0).unwrap();
    let second = lines.iter().find(|l| l.flag & 0x80 != 0).unwrap();
    assert_eq!(first.pos, 5_001);
    assert_eq!(second.pos, 5_301);
    // Multi-segment, all aligned, mate orientations.
    assert_eq!(first.flag & 0x1, 0x1);
    assert_eq!(first.flag & 0x2, 0x2);
    assert_eq!(first.flag & 0x20, 0x20);
    assert_eq!(second.flag & 0x10, 0x10);
    assert_eq!(first.tlen, 400);
    assert_eq!(second.tlen, -400);
}

#[test]
fn ambiguous_repeat_read() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut rng = StdRng::seed_from_u64(106);
    let block: Vec<u8> = (0..200).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect();
    let mut bases: Vec<u8> = (0..40_000).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect();
    let sites = [2_000usize, 9_000, 16_000, 23_000, 30_000];
    for &s in &sites {
        bases[s..s + 200].copy_from_slice(&block);
    }
    let genome = Arc::new(Genome::from_pieces(vec![("chr1".to_string(), bases)]).unwrap());
    let index = GenomeIndex::from_genome(Arc::clone(&genome), 20).unwrap();
    let index_path = root.join("ref.sdx");
    index.save(&index_path).unwrap();
    let fastq = root.join("reads.fastq");
    write_fastq(&fastq, &[("rep", block[50..150].to_vec())]);

    let out = root.join("out.sam");
    let mut options = AlignOptions::new(index_path, vec![fastq]);
    options.output_file = Some(out.clone());
    options.num_threads = 1;
    pipeline::run(&options).unwrap();

    let rec = &read_sam(&out)[0];
    assert!(rec.mapq <= 3, "mapq was {}", rec.mapq);
    assert!(
        sites.iter().any(|&s| rec.pos == (s + 50 + 1) as u32),
        "pos {} not at any repeat site",
        rec.pos
    );
}

#[test]
fn short_and_n_heavy_reads_come_back_unmapped() {
    let setup = setup(20_000, 107);
    let short = setup.genome.substring(1_000, 30).unwrap().to_vec();
    let mut enns = setup.genome.substring(2_000, 100).unwrap().to_vec();
    for b in enns.iter_mut().take(30) {
        *b = b'N';
    }
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("short", short), ("enns", enns)]);

    let out = align(&setup, &[fastq], false, "out.sam");
    let lines = read_sam(&out);
    assert_eq!(lines.len(), 2);
    for rec in &lines {
        assert_eq!(rec.flag & 0x4, 0x4, "{} should be unmapped", rec.qname);
        assert_eq!(rec.cigar, "*");
        assert_eq!(rec.rname, "*");
    }
}

#[test]
fn bam_output_round_trips() {
    use flate2::read::MultiGzDecoder;
    use std::io::Read as IoRead;

    let setup = setup(20_000, 108);
    let read = setup.genome.substring(6_000, 100).unwrap().to_vec();
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("bamread", read)]);

    let out = align(&setup, &[fastq], false, "out.bam");
    let compressed = std::fs::read(&out).unwrap();
    assert!(compressed.ends_with(&seedex::io::gzip_writer::BGZF_EOF));

    let mut decoded = Vec::new();
    MultiGzDecoder::new(&compressed[..])
        .read_to_end(&mut decoded)
        .unwrap();

    assert_eq!(&decoded[..4], b"BAM\x01");
    let l_text = u32::from_le_bytes(decoded[4..8].try_into().unwrap()) as usize;
    let mut pos = 8 + l_text;
    let n_ref = u32::from_le_bytes(decoded[pos..pos + 4].try_into().unwrap()) as usize;
    pos += 4;
    assert_eq!(n_ref, 1);
    for _ in 0..n_ref {
        let l_name = u32::from_le_bytes(decoded[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4 + l_name + 4;
    }

    let view = seedex::io::bam::BamRecordView::at(&decoded[pos..]).unwrap();
    assert_eq!(view.read_name(), b"bamread");
    assert_eq!(view.ref_id(), 0);
    assert_eq!(view.pos(), 5_999); // zero-based
    assert_eq!(view.flag() & 0x4, 0);
}

#[test]
fn sam_input_realigns_to_same_location() {
    let setup = setup(20_000, 109);
    let read = setup.genome.substring(7_000, 100).unwrap().to_vec();
    let fastq = setup.root.join("reads.fastq");
    write_fastq(&fastq, &[("sam1", read)]);
    let first = align(&setup, &[fastq], false, "first.sam");

    // Feed the SAM output back in as input.
    let mut options = AlignOptions::new(
        setup.index_path.clone(),
        vec![first.clone()],
    );
    options.input_format = AlignOptions::detect_input_format(&first);
    let second = setup.root.join("second.sam");
    options.output_file = Some(second.clone());
    options.num_threads = 1;
    pipeline::run(&options).unwrap();

    let rec = &read_sam(&second)[0];
    assert_eq!(rec.pos, 7_001);
    assert_eq!(rec.cigar, "100=");
}
