// Run configuration. One read-only record shared by the engines and the
// pipeline; per-thread mutable state lives in the aligners and stats.

use crate::defaults::*;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Sam,
    Bam,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Fastq,
    Sam,
    Bam,
}

/// Knobs for the alignment engines.
#[derive(Debug, Clone)]
pub struct AlignerConfig {
    /// Minimum score gap between best and second-best for a SingleHit.
    pub conf_diff: u32,
    /// Seeds with more hits than this are skipped (or explored partially).
    pub max_hits: u32,
    /// Edit distance limit K.
    pub max_k: u32,
    /// Max seeds looked up per read.
    pub max_seeds: u32,
    /// Raise conf_diff by one once this many popular seeds were skipped.
    pub adaptive_conf_diff_threshold: u32,
    /// Keep searching this far beyond the best score found so far.
    pub extra_search_depth: u32,
    /// Banded-extender call budget per read; Hamming distance after that.
    pub lv_limit: u64,
    /// Score the first max_hits locations of overly popular seeds instead
    /// of skipping them.
    pub explore_popular_seeds: bool,
    /// Stop as soon as any location scores within K (filtering mode).
    pub stop_on_first_hit: bool,
    pub max_read_size: usize,
    // Paired-end only.
    pub min_spacing: u32,
    pub max_spacing: u32,
    /// Hit-count ceiling per seed lookup in the intersecting engine.
    pub max_big_hits: u32,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        AlignerConfig {
            conf_diff: DEFAULT_CONF_DIFF,
            max_hits: DEFAULT_MAX_HITS,
            max_k: DEFAULT_MAX_DIST,
            max_seeds: DEFAULT_MAX_SEEDS,
            adaptive_conf_diff_threshold: DEFAULT_ADAPTIVE_CONF_DIFF_THRESHOLD,
            extra_search_depth: DEFAULT_EXTRA_SEARCH_DEPTH,
            lv_limit: DEFAULT_LV_LIMIT,
            explore_popular_seeds: false,
            stop_on_first_hit: false,
            max_read_size: MAX_READ_SIZE,
            min_spacing: DEFAULT_MIN_SPACING,
            max_spacing: DEFAULT_MAX_SPACING,
            max_big_hits: DEFAULT_MAX_BIG_HITS,
        }
    }
}

/// Everything the pipeline needs for one run.
#[derive(Debug, Clone)]
pub struct AlignOptions {
    pub index_path: PathBuf,
    pub input_files: Vec<PathBuf>,
    pub output_file: Option<PathBuf>,
    pub input_format: InputFormat,
    pub output_format: OutputFormat,
    pub paired: bool,
    pub num_threads: usize,
    pub bind_to_processors: bool,
    /// Emit `M` CIGAR ops instead of `=`/`X`.
    pub use_m_cigar: bool,
    /// Mark duplicates in BAM output.
    pub mark_duplicates: bool,
    pub aligner: AlignerConfig,
}

impl AlignOptions {
    pub fn new(index_path: PathBuf, input_files: Vec<PathBuf>) -> Self {
        AlignOptions {
            index_path,
            input_files,
            output_file: None,
            input_format: InputFormat::Fastq,
            output_format: OutputFormat::Sam,
            paired: false,
            num_threads: 1,
            bind_to_processors: false,
            use_m_cigar: false,
            mark_duplicates: true,
            aligner: AlignerConfig::default(),
        }
    }

    /// Guess input format from the file name, ignoring a trailing `.gz`.
    pub fn detect_input_format(path: &std::path::Path) -> InputFormat {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let stem = name.strip_suffix(".gz").unwrap_or(name);
        if stem.ends_with(".sam") {
            InputFormat::Sam
        } else if stem.ends_with(".bam") {
            InputFormat::Bam
        } else {
            InputFormat::Fastq
        }
    }

    pub fn detect_output_format(path: &std::path::Path) -> OutputFormat {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".bam") {
            OutputFormat::Bam
        } else {
            OutputFormat::Sam
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn format_detection() {
        assert_eq!(
            AlignOptions::detect_input_format(Path::new("reads.fastq.gz")),
            InputFormat::Fastq
        );
        assert_eq!(
            AlignOptions::detect_input_format(Path::new("in.sam")),
            InputFormat::Sam
        );
        assert_eq!(
            AlignOptions::detect_input_format(Path::new("in.bam")),
            InputFormat::Bam
        );
        assert_eq!(
            AlignOptions::detect_output_format(Path::new("out.bam")),
            OutputFormat::Bam
        );
        assert_eq!(
            AlignOptions::detect_output_format(Path::new("out.sam")),
            OutputFormat::Sam
        );
    }
}
