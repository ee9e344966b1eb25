use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use seedex::genome::Genome;
use seedex::index::GenomeIndex;
use seedex::options::{AlignOptions, InputFormat, OutputFormat};
use seedex::pipeline;

#[derive(Parser)]
#[command(name = "seedex")]
#[command(about = "seedex - seed-and-extend short-read DNA aligner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a seed index for a reference genome
    Index {
        /// Input FASTA file
        #[arg(value_name = "REF.FA")]
        fasta: PathBuf,

        /// Output index file (default: REF.FA.sdx)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Seed (k-mer) length
        #[arg(short = 's', long, value_name = "INT", default_value = "20")]
        seed_len: usize,
    },

    /// Align reads against a seed index
    Align {
        /// Index file built with 'index'
        #[arg(value_name = "INDEX")]
        index: PathBuf,

        /// Input reads: one FASTQ/SAM/BAM file, or two FASTQ files for
        /// split paired-end input
        #[arg(value_name = "READS", required = true)]
        reads: Vec<PathBuf>,

        /// Output file; .bam extension selects BAM output (default: out.sam)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Align as read pairs (automatic with two input files)
        #[arg(short = 'p', long)]
        paired: bool,

        /// Maximum edit distance per read (per pair when paired)
        #[arg(short = 'd', long, value_name = "INT", default_value = "8")]
        max_dist: u32,

        /// Skip seeds with more hits than this
        #[arg(short = 'n', long, value_name = "INT", default_value = "300")]
        max_hits: u32,

        /// Score gap required between best and second-best hit
        #[arg(short = 'c', long, value_name = "INT", default_value = "2")]
        conf_diff: u32,

        /// Maximum seeds to look up per read
        #[arg(short = 'x', long, value_name = "INT", default_value = "25")]
        max_seeds: u32,

        /// Minimum paired-end spacing
        #[arg(long, value_name = "INT", default_value = "50")]
        min_spacing: u32,

        /// Maximum paired-end spacing
        #[arg(long, value_name = "INT", default_value = "1000")]
        max_spacing: u32,

        /// Score the first max-hits locations of overly popular seeds
        /// instead of skipping them
        #[arg(long)]
        explore_popular_seeds: bool,

        /// Stop at the first hit within the distance limit (filtering mode)
        #[arg(short = 'F', long)]
        stop_on_first_hit: bool,

        /// Emit M CIGAR operations instead of =/X
        #[arg(short = 'M', long)]
        m_cigar: bool,

        /// Skip duplicate marking in BAM output
        #[arg(long)]
        no_mark_duplicates: bool,

        /// Worker threads (default: all cores)
        #[arg(short = 't', long, value_name = "INT")]
        threads: Option<usize>,

        /// Pin each worker to a CPU
        #[arg(short = 'b', long)]
        bind_to_processors: bool,

        /// Verbosity: 1=error, 2=warning, 3=info, 4=debug, 5+=trace
        #[arg(short = 'v', long, value_name = "INT", default_value = "3")]
        verbosity: i32,
    },
}

fn init_logger(verbosity: i32) {
    let level = match verbosity {
        v if v <= 1 => log::LevelFilter::Error,
        2 => log::LevelFilter::Warn,
        3 => log::LevelFilter::Info,
        4 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn build_index(fasta: &PathBuf, output: Option<PathBuf>, seed_len: usize) -> std::io::Result<()> {
    let out = output.unwrap_or_else(|| {
        let mut p = fasta.clone().into_os_string();
        p.push(".sdx");
        PathBuf::from(p)
    });
    log::info!("reading reference {}", fasta.display());
    let reader = bio::io::fasta::Reader::from_file(fasta).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("{}: {}", fasta.display(), e))
    })?;
    let mut parts = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, format!("bad FASTA record: {}", e))
        })?;
        parts.push((record.id().to_string(), record.seq().to_vec()));
    }
    let genome = Arc::new(Genome::from_pieces(parts)?);
    log::info!(
        "indexing {} pieces, {} bases, seed length {}",
        genome.num_pieces(),
        genome.count_of_bases(),
        seed_len
    );
    let index = GenomeIndex::from_genome(genome, seed_len)?;
    index.save(&out)?;
    log::info!("wrote {}", out.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Index {
            fasta,
            output,
            seed_len,
        } => {
            env_logger::Builder::from_default_env()
                .filter_level(log::LevelFilter::Info)
                .format_timestamp(None)
                .format_target(false)
                .init();
            if let Err(e) = build_index(&fasta, output, seed_len) {
                log::error!("index building failed: {}", e);
                std::process::exit(1);
            }
        }

        Commands::Align {
            index,
            reads,
            output,
            paired,
            max_dist,
            max_hits,
            conf_diff,
            max_seeds,
            min_spacing,
            max_spacing,
            explore_popular_seeds,
            stop_on_first_hit,
            m_cigar,
            no_mark_duplicates,
            threads,
            bind_to_processors,
            verbosity,
        } => {
            init_logger(verbosity);

            if reads.len() > 2 {
                log::error!("at most two read files are supported, got {}", reads.len());
                std::process::exit(1);
            }
            if reads.len() == 2 && !paired {
                log::info!("two read files given, assuming paired-end input");
            }

            let num_threads = threads.unwrap_or_else(num_cpus::get).max(1);
            if let Err(e) = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build_global()
            {
                log::warn!("thread pool already configured: {}", e);
            }
            log::info!(
                "using {} worker thread{}",
                num_threads,
                if num_threads == 1 { "" } else { "s" }
            );

            let mut options = AlignOptions::new(index, reads);
            options.paired = paired || options.input_files.len() == 2;
            options.input_format = AlignOptions::detect_input_format(&options.input_files[0]);
            options.output_format = output
                .as_deref()
                .map(AlignOptions::detect_output_format)
                .unwrap_or(OutputFormat::Sam);
            options.output_file = output;
            options.num_threads = num_threads;
            options.bind_to_processors = bind_to_processors;
            options.use_m_cigar = m_cigar;
            options.mark_duplicates = !no_mark_duplicates;
            options.aligner.max_k = max_dist;
            options.aligner.max_hits = max_hits;
            options.aligner.conf_diff = conf_diff;
            options.aligner.max_seeds = max_seeds;
            options.aligner.min_spacing = min_spacing;
            options.aligner.max_spacing = max_spacing;
            options.aligner.explore_popular_seeds = explore_popular_seeds;
            options.aligner.stop_on_first_hit = stop_on_first_hit;

            if options.input_format != InputFormat::Fastq && options.input_files.len() == 2 {
                log::error!("split paired input is only supported for FASTQ");
                std::process::exit(1);
            }

            if let Err(e) = pipeline::run(&options) {
                log::error!("alignment failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
