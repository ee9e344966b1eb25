// Per-thread alignment statistics, merged and logged at shutdown.

#[derive(Debug, Default, Clone)]
pub struct AlignerStats {
    pub total_reads: u64,
    pub useful_reads: u64,
    pub single_hits: u64,
    pub multi_hits: u64,
    pub not_found: u64,
    pub total_pairs: u64,
    pub pairs_aligned_as_pairs: u64,
    pub extender_calls: u64,
    pub locations_scored: u64,
    pub hash_table_lookups: u64,
    pub reads_ignored_too_many_ns: u64,
    pub reads_ignored_too_short: u64,
}

impl AlignerStats {
    pub fn new() -> Self {
        AlignerStats::default()
    }

    pub fn add(&mut self, other: &AlignerStats) {
        self.total_reads += other.total_reads;
        self.useful_reads += other.useful_reads;
        self.single_hits += other.single_hits;
        self.multi_hits += other.multi_hits;
        self.not_found += other.not_found;
        self.total_pairs += other.total_pairs;
        self.pairs_aligned_as_pairs += other.pairs_aligned_as_pairs;
        self.extender_calls += other.extender_calls;
        self.locations_scored += other.locations_scored;
        self.hash_table_lookups += other.hash_table_lookups;
        self.reads_ignored_too_many_ns += other.reads_ignored_too_many_ns;
        self.reads_ignored_too_short += other.reads_ignored_too_short;
    }

    pub fn log_summary(&self, elapsed: std::time::Duration) {
        let aligned = self.single_hits + self.multi_hits;
        let pct = |n: u64| {
            if self.total_reads == 0 {
                0.0
            } else {
                100.0 * n as f64 / self.total_reads as f64
            }
        };
        log::info!(
            "{} reads: {} aligned ({:.2}%), {} single hits ({:.2}%), {} multiple hits ({:.2}%), {} not found ({:.2}%)",
            self.total_reads,
            aligned,
            pct(aligned),
            self.single_hits,
            pct(self.single_hits),
            self.multi_hits,
            pct(self.multi_hits),
            self.not_found,
            pct(self.not_found),
        );
        if self.total_pairs > 0 {
            log::info!(
                "{} pairs, {} aligned as proper pairs ({:.2}%)",
                self.total_pairs,
                self.pairs_aligned_as_pairs,
                if self.total_pairs == 0 {
                    0.0
                } else {
                    100.0 * self.pairs_aligned_as_pairs as f64 / self.total_pairs as f64
                }
            );
        }
        if self.reads_ignored_too_many_ns + self.reads_ignored_too_short > 0 {
            log::info!(
                "{} reads skipped ({} too many Ns, {} too short)",
                self.reads_ignored_too_many_ns + self.reads_ignored_too_short,
                self.reads_ignored_too_many_ns,
                self.reads_ignored_too_short
            );
        }
        log::debug!(
            "{} index lookups, {} locations scored, {} extender calls",
            self.hash_table_lookups,
            self.locations_scored,
            self.extender_calls
        );
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            log::info!(
                "{:.1}s elapsed, {:.0} reads/s",
                secs,
                self.total_reads as f64 / secs
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_everything() {
        let mut a = AlignerStats {
            total_reads: 10,
            single_hits: 7,
            multi_hits: 2,
            not_found: 1,
            ..AlignerStats::default()
        };
        let b = AlignerStats {
            total_reads: 5,
            single_hits: 5,
            ..AlignerStats::default()
        };
        a.add(&b);
        assert_eq!(a.total_reads, 15);
        assert_eq!(a.single_hits, 12);
        assert_eq!(a.multi_hits, 2);
    }
}
