// Mapping quality: a Phred-scaled estimate that the reported location is
// correct, derived from the ratio of the best candidate's match
// probability to the probability mass of everything scored.

/// The highest MAPQ we ever emit. Reserved for alignments with no evidence
/// of any competing location at all.
pub const MAX_MAPQ: i32 = 70;

/// Probability mass beyond which MAPQ is pinned at 0 no matter what else
/// is scored; lets the engines stop searching early.
pub const SATURATION_PROBABILITY: f64 = 4.9;

#[derive(Debug, Clone, Copy, Default)]
pub struct MapqInputs {
    /// How many overly popular seeds were skipped for this read.
    pub popular_seeds_skipped: u32,
    /// Whether Hamming distance substituted for the banded extender.
    pub used_hamming: bool,
    /// Largest similarity-map cluster among scored locations, if a
    /// similarity map is loaded.
    pub biggest_cluster_scored: Option<u32>,
}

/// Compute MAPQ from the probability mass. `p_best` is the best
/// candidate's match probability, `p_all` the sum over all scored
/// candidates (merged locations counted once).
pub fn compute_mapq(p_all: f64, p_best: f64, score: i32, inputs: MapqInputs) -> i32 {
    // Limited float precision can leave the sum a hair below its largest
    // term.
    let p_all = p_all.max(p_best);
    debug_assert!(p_best >= 0.0);

    // 70 only when there is no evidence of a competing location at all.
    if p_all == p_best && inputs.popular_seeds_skipped == 0 && score < 5 && !inputs.used_hamming {
        return MAX_MAPQ;
    }

    let correctness = if p_all > 0.0 { p_best / p_all } else { 0.0 };
    let mut mapq = if correctness >= 1.0 {
        69
    } else {
        69.min((-10.0 * (1.0 - correctness).log10()) as i32)
    };

    // Hamming can miss gapped alignments entirely, so its confidence is
    // capped.
    if inputs.used_hamming {
        if mapq > 26 {
            mapq = 26;
        } else if mapq > 10 {
            mapq -= 1;
        }
    }

    if let Some(cluster) = inputs.biggest_cluster_scored {
        if cluster > 1 {
            mapq -= (3.0 * (cluster as f64).log10()) as i32;
        }
    }

    // Each skipped popular seed is a place we never looked.
    mapq -= (inputs.popular_seeds_skipped.saturating_sub(10) / 2) as i32;

    mapq.max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_perfect_hit_gets_70() {
        let q = compute_mapq(0.99, 0.99, 0, MapqInputs::default());
        assert_eq!(q, MAX_MAPQ);
    }

    #[test]
    fn high_score_caps_at_69() {
        // Same probabilities but score >= 5 loses the special case.
        let q = compute_mapq(0.9, 0.9, 5, MapqInputs::default());
        assert_eq!(q, 69);
    }

    #[test]
    fn ambiguity_drives_mapq_down() {
        // Two equally likely locations: p_best/p_all = 0.5 -> ~3.
        let q = compute_mapq(0.6, 0.3, 1, MapqInputs::default());
        assert!(q <= 3, "expected near-zero mapq, got {}", q);
        // Five equally likely locations.
        let q5 = compute_mapq(0.5, 0.1, 0, MapqInputs::default());
        assert!(q5 <= 1);
    }

    #[test]
    fn monotone_in_probability_mass() {
        let mut last = i32::MAX;
        for all in [0.3, 0.35, 0.5, 1.0, 2.0] {
            let q = compute_mapq(all, 0.3, 1, MapqInputs::default());
            assert!(q <= last);
            last = q;
        }
    }

    #[test]
    fn hamming_penalty() {
        let strong = MapqInputs {
            used_hamming: true,
            ..Default::default()
        };
        let q = compute_mapq(0.9, 0.9, 1, strong);
        assert_eq!(q, 26);
    }

    #[test]
    fn popular_seed_penalty_only_past_ten() {
        let few = MapqInputs {
            popular_seeds_skipped: 8,
            ..Default::default()
        };
        let many = MapqInputs {
            popular_seeds_skipped: 30,
            ..Default::default()
        };
        let q_few = compute_mapq(0.9, 0.9, 1, few);
        let q_many = compute_mapq(0.9, 0.9, 1, many);
        assert_eq!(q_few, 69);
        assert_eq!(q_many, 69 - 10);
    }

    #[test]
    fn cluster_subtraction() {
        let clustered = MapqInputs {
            biggest_cluster_scored: Some(1000),
            ..Default::default()
        };
        let q = compute_mapq(0.9, 0.9, 1, clustered);
        assert_eq!(q, 69 - 9);
    }

    #[test]
    fn never_negative() {
        let bad = MapqInputs {
            popular_seeds_skipped: 1000,
            used_hamming: true,
            biggest_cluster_scored: Some(1_000_000),
        };
        assert_eq!(compute_mapq(5.0, 0.0001, 7, bad), 0);
    }
}
