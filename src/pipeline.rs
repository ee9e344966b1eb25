// End-to-end alignment run: reader threads fill the supplier queue,
// worker threads (one aligner, one writer each) drain it, and the writer
// supplier stitches every worker's output into one file.

use crate::align::cigar::CigarBuf;
use crate::align::lv::LandauVishkin;
use crate::align::paired::IntersectingPairedEndAligner;
use crate::align::single::BaseAligner;
use crate::align::AlignmentResult;
use crate::defaults::{WRITE_BUFFER_COUNT, WRITE_BUFFER_SIZE};
use crate::genome::Genome;
use crate::index::GenomeIndex;
use crate::io::bam::{bam_header_bytes, emit_bam, BamReader};
use crate::io::data_writer::{compose, DataWriterSupplier, FilterSupplier};
use crate::io::dup_mark::DupMarkFilterSupplier;
use crate::io::fastq::FastqReader;
use crate::io::gzip_writer::GzipWriterFilterSupplier;
use crate::io::sam::{emit_sam, pair_flags, prepare_record, sam_header, PairEmit, SamReader};
use crate::io::supplier::{PairedReadSupplier, ReadSupplier, ReadSupplierQueue};
use crate::io::ReadReader;
use crate::options::{AlignOptions, InputFormat, OutputFormat};
use crate::stats::AlignerStats;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

pub fn run(options: &AlignOptions) -> io::Result<()> {
    let start = Instant::now();
    let index = Arc::new(GenomeIndex::load(&options.index_path)?);
    let genome = index.genome_arc();

    let output_path = options.output_file.clone().unwrap_or_else(|| {
        let default = match options.output_format {
            OutputFormat::Sam => "out.sam",
            OutputFormat::Bam => "out.bam",
        };
        log::info!("no output file given, writing {}", default);
        PathBuf::from(default)
    });

    let filter: Option<Arc<dyn FilterSupplier>> = match options.output_format {
        OutputFormat::Sam => None,
        OutputFormat::Bam => {
            let gzip = GzipWriterFilterSupplier::new() as Arc<dyn FilterSupplier>;
            Some(if options.mark_duplicates {
                compose(DupMarkFilterSupplier::new(&genome), gzip)
            } else {
                gzip
            })
        }
    };
    let writer_supplier = DataWriterSupplier::create(
        &output_path,
        filter,
        WRITE_BUFFER_COUNT,
        WRITE_BUFFER_SIZE,
    )?;

    // The header goes out first, as its own batch (and BGZF block).
    {
        let mut header_writer = writer_supplier.get_writer()?;
        match options.output_format {
            OutputFormat::Sam => header_writer.append_raw(sam_header(&genome).as_bytes())?,
            OutputFormat::Bam => header_writer.append_raw(&bam_header_bytes(&genome))?,
        }
        header_writer.close()?;
    }

    let mut queue = build_queue(options, &genome)?;

    let n_workers = options.num_threads.max(1);
    let stats = Mutex::new(AlignerStats::new());
    let first_error: Mutex<Option<io::Error>> = Mutex::new(None);

    rayon::scope(|scope| {
        for worker_id in 0..n_workers {
            let writer_supplier = Arc::clone(&writer_supplier);
            let index = Arc::clone(&index);
            let genome = Arc::clone(&genome);
            let stats = &stats;
            let first_error = &first_error;
            if options.paired {
                let supplier = queue.generate_paired_supplier();
                scope.spawn(move |_| {
                    maybe_bind_to_processor(options.bind_to_processors, worker_id);
                    let result = paired_worker(
                        supplier,
                        index,
                        genome,
                        writer_supplier,
                        options,
                        stats,
                    );
                    if let Err(e) = result {
                        log::error!("worker failed: {}", e);
                        first_error.lock().unwrap().get_or_insert(e);
                    }
                });
            } else {
                let supplier = queue.generate_supplier();
                scope.spawn(move |_| {
                    maybe_bind_to_processor(options.bind_to_processors, worker_id);
                    let result = single_worker(
                        supplier,
                        index,
                        genome,
                        writer_supplier,
                        options,
                        stats,
                    );
                    if let Err(e) = result {
                        log::error!("worker failed: {}", e);
                        first_error.lock().unwrap().get_or_insert(e);
                    }
                });
            }
        }
    });

    queue.wait_until_finished()?;
    writer_supplier.close()?;

    if let Some(e) = first_error.into_inner().unwrap() {
        return Err(e);
    }
    stats.into_inner().unwrap().log_summary(start.elapsed());
    Ok(())
}

fn build_queue(options: &AlignOptions, genome: &Arc<Genome>) -> io::Result<ReadSupplierQueue> {
    let open_one = |path: &PathBuf, file_id: u32| -> io::Result<Box<dyn ReadReader>> {
        Ok(match options.input_format {
            InputFormat::Fastq => Box::new(FastqReader::open(path, file_id, true)?),
            InputFormat::Sam => Box::new(SamReader::open(path, file_id, Arc::clone(genome))?),
            InputFormat::Bam => Box::new(BamReader::open(path, file_id, Arc::clone(genome))?),
        })
    };

    match (options.input_files.len(), options.paired) {
        (1, false) => ReadSupplierQueue::start_single(open_one(&options.input_files[0], 0)?),
        (1, true) => {
            ReadSupplierQueue::start_paired_interleaved(open_one(&options.input_files[0], 0)?)
        }
        (2, true) => ReadSupplierQueue::start_paired_files(
            open_one(&options.input_files[0], 0)?,
            open_one(&options.input_files[1], 1)?,
        ),
        (n, paired) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported input combination: {} files, paired={}", n, paired),
        )),
    }
}

fn single_worker(
    mut supplier: ReadSupplier,
    index: Arc<GenomeIndex>,
    genome: Arc<Genome>,
    writer_supplier: Arc<DataWriterSupplier>,
    options: &AlignOptions,
    stats: &Mutex<AlignerStats>,
) -> io::Result<()> {
    let mut aligner = BaseAligner::new(Arc::clone(&index), &options.aligner);
    let mut output_lv = LandauVishkin::new_forward(
        (options.aligner.max_k + options.aligner.extra_search_depth) as usize,
    );
    let mut cigar = CigarBuf::new();
    let mut writer = writer_supplier.get_writer()?;
    let mut record_bytes = Vec::with_capacity(4096);
    let mut local = AlignerStats::new();

    while let Some(read) = supplier.next_read() {
        local.total_reads += 1;
        let alignment = aligner.align_read(&read);
        match alignment.result {
            AlignmentResult::SingleHit => {
                local.useful_reads += 1;
                local.single_hits += 1;
            }
            AlignmentResult::MultipleHits => {
                local.useful_reads += 1;
                local.multi_hits += 1;
            }
            AlignmentResult::NotFound => local.not_found += 1,
        }

        let rec = prepare_record(&read, &alignment, &genome, &mut output_lv, &mut cigar, options.use_m_cigar);
        record_bytes.clear();
        match options.output_format {
            OutputFormat::Sam => emit_sam(&mut record_bytes, &rec, None, &genome)?,
            OutputFormat::Bam => emit_bam(&mut record_bytes, &rec, None),
        }
        let location = if alignment.result.is_aligned() {
            alignment.location
        } else {
            0
        };
        writer.append(&record_bytes, location)?;
    }

    writer.close()?;
    local.locations_scored = aligner.counters.locations_scored;
    local.hash_table_lookups = aligner.counters.hash_table_lookups;
    local.reads_ignored_too_many_ns = aligner.counters.reads_ignored_too_many_ns;
    local.reads_ignored_too_short = aligner.counters.reads_ignored_too_short;
    stats.lock().unwrap().add(&local);
    Ok(())
}

fn paired_worker(
    mut supplier: PairedReadSupplier,
    index: Arc<GenomeIndex>,
    genome: Arc<Genome>,
    writer_supplier: Arc<DataWriterSupplier>,
    options: &AlignOptions,
    stats: &Mutex<AlignerStats>,
) -> io::Result<()> {
    let mut aligner = IntersectingPairedEndAligner::new(Arc::clone(&index), &options.aligner);
    let mut output_lv = LandauVishkin::new_forward(
        (options.aligner.max_k + options.aligner.extra_search_depth) as usize,
    );
    let mut cigar = CigarBuf::new();
    let mut writer = writer_supplier.get_writer()?;
    let mut record_bytes = Vec::with_capacity(4096);
    let mut local = AlignerStats::new();

    while let Some((read0, read1)) = supplier.next_pair() {
        local.total_reads += 2;
        local.total_pairs += 1;
        let pair = aligner.align_pair(&read0, &read1);
        if pair.aligned_as_pair {
            local.pairs_aligned_as_pairs += 1;
        }
        for alignment in pair.results.iter() {
            match alignment.result {
                AlignmentResult::SingleHit => {
                    local.useful_reads += 1;
                    local.single_hits += 1;
                }
                AlignmentResult::MultipleHits => {
                    local.useful_reads += 1;
                    local.multi_hits += 1;
                }
                AlignmentResult::NotFound => local.not_found += 1,
            }
        }

        let reads = [&read0, &read1];
        let mut prepared = [
            prepare_record(reads[0], &pair.results[0], &genome, &mut output_lv, &mut cigar, options.use_m_cigar),
            prepare_record(reads[1], &pair.results[1], &genome, &mut output_lv, &mut cigar, options.use_m_cigar),
        ];
        let proper = pair.aligned_as_pair
            && prepared
                .iter()
                .all(|r| r.flag & crate::io::sam::sam_flags::UNMAPPED == 0);
        {
            let (first, second) = prepared.split_at_mut(1);
            pair_flags(
                &mut first[0],
                &PairEmit {
                    mate: &second[0],
                    first_in_pair: true,
                    proper,
                },
            );
            pair_flags(
                &mut second[0],
                &PairEmit {
                    mate: &first[0],
                    first_in_pair: false,
                    proper,
                },
            );
        }

        for which in 0..2 {
            let mate = &prepared[1 - which];
            let emit = PairEmit {
                mate,
                first_in_pair: which == 0,
                proper,
            };
            record_bytes.clear();
            match options.output_format {
                OutputFormat::Sam => {
                    emit_sam(&mut record_bytes, &prepared[which], Some(&emit), &genome)?
                }
                OutputFormat::Bam => emit_bam(&mut record_bytes, &prepared[which], Some(&emit)),
            }
            let location = if pair.results[which].result.is_aligned() {
                pair.results[which].location
            } else {
                0
            };
            writer.append(&record_bytes, location)?;
        }
    }

    writer.close()?;
    local.extender_calls = aligner.counters.extender_calls;
    stats.lock().unwrap().add(&local);
    Ok(())
}

#[cfg(target_os = "linux")]
fn maybe_bind_to_processor(bind: bool, worker_id: usize) {
    if !bind {
        return;
    }
    // SAFETY: CPU_* macros operate on a locally owned cpu_set_t.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(worker_id % num_cpus::get(), &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::warn!("failed to pin worker {} to a CPU", worker_id);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn maybe_bind_to_processor(bind: bool, _worker_id: usize) {
    if bind {
        log::warn!("CPU pinning is only supported on Linux");
    }
}
