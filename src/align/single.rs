// Single-end seed-and-extend engine. Seed hits are merged into a hash
// table of candidate windows; windows covered by the most seeds are scored
// first so the search can stop as soon as nothing unseen could beat the
// best alignment found.
//
// Not thread safe; each worker owns its own instance. All of the large
// state (element pool, hash anchors, scratch reads) is allocated once at
// construction and recycled across reads.

use crate::align::lv::{hamming_distance, LandauVishkin};
use crate::align::mapq::{compute_mapq, MapqInputs, MAX_MAPQ, SATURATION_PROBABILITY};
use crate::align::{AlignmentResult, SingleAlignment};
use crate::defaults::MIN_READ_LENGTH;
use crate::index::{GenomeIndex, Seed};
use crate::options::AlignerConfig;
use crate::read::{Direction, Read, NUM_DIRECTIONS};
use bio::alphabets::dna;
use std::sync::Arc;

/// Candidates within this many bases collapse into one hash-table element,
/// absorbing indel-induced offset wobble. Can't exceed 31 or the per-base
/// bitmasks overflow.
pub const MAX_MERGE_DIST: u32 = 31;

const CANDIDATES_PER_ELEMENT: u32 = 2 * MAX_MERGE_DIST;
const UNUSED_SCORE: u32 = 0xffff;
const NONE: u32 = u32::MAX;

#[derive(Clone)]
struct HashTableElement {
    // Doubly linked list through the weight buckets.
    weight_next: u32,
    weight_prev: u32,
    // Singly linked hash-chain.
    next: u32,
    // Bit per offset-in-element that some seed proposed / that we scored.
    candidates_used: u64,
    candidates_scored: u64,
    base_genome_location: u32,
    direction: Direction,
    weight: u32,
    best_score: u32,
    best_score_probability: f64,
    seed_offsets: [u16; CANDIDATES_PER_ELEMENT as usize],
}

impl HashTableElement {
    fn empty() -> Self {
        HashTableElement {
            weight_next: NONE,
            weight_prev: NONE,
            next: NONE,
            candidates_used: 0,
            candidates_scored: 0,
            base_genome_location: 0,
            direction: Direction::Forward,
            weight: 0,
            best_score: UNUSED_SCORE,
            best_score_probability: 0.0,
            seed_offsets: [0; CANDIDATES_PER_ELEMENT as usize],
        }
    }
}

/// Hash bucket with an epoch tag: a stale epoch means "empty", which makes
/// clearing the whole table an O(1) counter bump.
#[derive(Clone, Copy)]
struct HashTableAnchor {
    element: u32,
    epoch: u64,
}

/// Counters a single alignment run leaves behind; rolled into the
/// per-thread stats by the pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleAlignerCounters {
    pub hash_table_lookups: u64,
    pub locations_scored: u64,
    pub hits_ignored_too_popular: u64,
    pub reads_ignored_too_many_ns: u64,
    pub reads_ignored_too_short: u64,
}

pub struct BaseAligner {
    index: Arc<GenomeIndex>,
    seed_len: usize,
    conf_diff: u32,
    max_hits: u32,
    max_k: u32,
    max_seeds: u32,
    adaptive_conf_diff_threshold: u32,
    extra_search_depth: u32,
    lv_limit: u64,
    explore_popular_seeds: bool,
    stop_on_first_hit: bool,
    max_read_size: usize,

    lv: LandauVishkin,

    // Scratch, allocated once.
    rc_data: Vec<u8>,
    rc_quality: Vec<u8>,
    seed_used: Vec<u64>,

    // Element pool. Indices 0..=max_weight are the weight-list sentinels.
    pool: Vec<HashTableElement>,
    n_used: u32,
    max_weight: u32,
    highest_used_weight: u32,
    anchors: [Vec<HashTableAnchor>; NUM_DIRECTIONS],
    epoch: u64,
    pool_exhausted_logged: bool,

    pub counters: SingleAlignerCounters,
}

impl BaseAligner {
    pub fn new(index: Arc<GenomeIndex>, config: &AlignerConfig) -> Self {
        let seed_len = index.seed_len();
        let max_weight = config.max_seeds.max(1);
        let pool_size =
            max_weight + 1 + config.max_hits * config.max_seeds * NUM_DIRECTIONS as u32;
        let table_size =
            ((config.max_hits as usize * config.max_seeds as usize) * 3 / 2 + 1).next_power_of_two();
        let anchors = [
            vec![HashTableAnchor { element: NONE, epoch: 0 }; table_size],
            vec![HashTableAnchor { element: NONE, epoch: 0 }; table_size],
        ];
        BaseAligner {
            index,
            seed_len,
            conf_diff: config.conf_diff,
            max_hits: config.max_hits,
            max_k: config.max_k,
            max_seeds: config.max_seeds,
            adaptive_conf_diff_threshold: config.adaptive_conf_diff_threshold,
            extra_search_depth: config.extra_search_depth,
            lv_limit: config.lv_limit,
            explore_popular_seeds: config.explore_popular_seeds,
            stop_on_first_hit: config.stop_on_first_hit,
            max_read_size: config.max_read_size,
            lv: LandauVishkin::new_forward(
                (config.max_k + config.extra_search_depth) as usize,
            ),
            rc_data: vec![0; config.max_read_size],
            rc_quality: vec![0; config.max_read_size],
            seed_used: vec![0; (config.max_read_size + 63) / 64],
            pool: vec![HashTableElement::empty(); pool_size as usize],
            n_used: 0,
            max_weight,
            highest_used_weight: 0,
            anchors,
            epoch: 0,
            pool_exhausted_logged: false,
            counters: SingleAlignerCounters::default(),
        }
    }

    pub fn set_explore_popular_seeds(&mut self, value: bool) {
        self.explore_popular_seeds = value;
    }

    pub fn set_stop_on_first_hit(&mut self, value: bool) {
        self.stop_on_first_hit = value;
    }

    pub fn max_k(&self) -> u32 {
        self.max_k
    }

    /// Align one read against both orientations of the genome.
    pub fn align_read(&mut self, read: &Read) -> SingleAlignment {
        let read_len = read.len();
        if read_len < MIN_READ_LENGTH || read_len < self.seed_len {
            self.counters.reads_ignored_too_short += 1;
            return SingleAlignment::not_found();
        }
        if read_len > self.max_read_size {
            log::warn!(
                "read '{}' is {} bases, longer than the configured maximum {}; skipping",
                String::from_utf8_lossy(read.id()),
                read_len,
                self.max_read_size
            );
            return SingleAlignment::not_found();
        }
        if read.count_of_ns() > self.max_k as usize {
            self.counters.reads_ignored_too_many_ns += 1;
            return SingleAlignment::not_found();
        }

        self.begin_alignment(read);

        // A local handle keeps the lookup borrows off `self` while the
        // candidate table underneath mutates.
        let index = Arc::clone(&self.index);
        let mut popular_seeds_skipped = 0u32;
        let mut first_pass_seeds_not_skipped = [0u32; NUM_DIRECTIONS];

        // Seed walk: non-overlapping offsets first, then wrap with a
        // one-base shift until every offset was considered or the seed
        // budget runs out.
        let data = read.data();
        let n_possible = read_len - self.seed_len + 1;
        let mut next_seed = 0usize;
        let mut wrap_count = 0usize;
        let mut n_lookups = 0usize;
        while n_lookups < n_possible && n_lookups < self.max_seeds as usize {
            if next_seed >= n_possible {
                wrap_count += 1;
                if wrap_count >= self.seed_len {
                    break;
                }
                next_seed = wrap_count;
            }
            while next_seed < n_possible && self.is_seed_used(next_seed) {
                next_seed += 1;
            }
            if next_seed >= n_possible {
                continue;
            }
            self.set_seed_used(next_seed);

            let seed = match Seed::from_bases(&data[next_seed..], self.seed_len) {
                Some(s) => s,
                None => {
                    // Ns in the window; this offset can never seed.
                    next_seed += 1;
                    continue;
                }
            };

            let (fwd_hits, rc_hits) = index.lookup(seed);
            self.counters.hash_table_lookups += 1;
            n_lookups += 1;

            for dir in [Direction::Forward, Direction::Rc] {
                let hits = match dir {
                    Direction::Forward => fwd_hits,
                    Direction::Rc => rc_hits,
                };
                let seed_offset = match dir {
                    Direction::Forward => next_seed,
                    Direction::Rc => read_len - self.seed_len - next_seed,
                };
                if hits.len() > self.max_hits as usize && !self.explore_popular_seeds {
                    self.counters.hits_ignored_too_popular += hits.len() as u64;
                    popular_seeds_skipped += 1;
                    continue;
                }
                if wrap_count == 0 {
                    first_pass_seeds_not_skipped[dir.index()] += 1;
                }
                let capped = &hits[..hits.len().min(self.max_hits as usize)];
                for &hit in capped {
                    if (hit as usize) < seed_offset {
                        continue;
                    }
                    self.note_candidate(hit - seed_offset as u32, dir, seed_offset as u16);
                }
            }

            next_seed += self.seed_len;
        }

        self.score_candidates(
            read,
            popular_seeds_skipped,
            first_pass_seeds_not_skipped,
        )
    }

    fn begin_alignment(&mut self, read: &Read) {
        self.epoch += 1;
        self.lv.begin_read();
        self.highest_used_weight = 0;
        self.n_used = self.max_weight + 1;
        for w in 0..=self.max_weight {
            self.pool[w as usize].weight_next = w;
            self.pool[w as usize].weight_prev = w;
        }
        for w in self.seed_used.iter_mut() {
            *w = 0;
        }

        // Reverse complement scratch for the RC orientation.
        let data = read.data();
        let quality = read.quality();
        self.rc_data[..data.len()].copy_from_slice(&dna::revcomp(data));
        for (i, &q) in quality.iter().rev().enumerate() {
            self.rc_quality[i] = q;
        }
    }

    #[inline]
    fn is_seed_used(&self, offset: usize) -> bool {
        self.seed_used[offset / 64] & (1 << (offset % 64)) != 0
    }

    #[inline]
    fn set_seed_used(&mut self, offset: usize) {
        self.seed_used[offset / 64] |= 1 << (offset % 64);
    }

    #[inline]
    fn hash_slot(&self, base: u32) -> usize {
        (base.wrapping_mul(131)) as usize & (self.anchors[0].len() - 1)
    }

    fn find_element(&self, base: u32, direction: Direction) -> Option<u32> {
        let anchor = &self.anchors[direction.index()][self.hash_slot(base)];
        if anchor.epoch != self.epoch {
            return None;
        }
        let mut h = anchor.element;
        while h != NONE {
            let el = &self.pool[h as usize];
            if el.base_genome_location == base && el.direction == direction {
                return Some(h);
            }
            h = el.next;
        }
        None
    }

    /// Register one candidate location proposed by a seed hit.
    fn note_candidate(&mut self, location: u32, direction: Direction, seed_offset: u16) {
        let window_base = location - location % MAX_MERGE_DIST;
        // The covering element may be anchored at this window or the one
        // below (elements span two windows).
        let mut found: Option<(u32, u32)> = None;
        for base in [Some(window_base), window_base.checked_sub(MAX_MERGE_DIST)]
            .into_iter()
            .flatten()
        {
            if let Some(h) = self.find_element(base, direction) {
                let offset = location - base;
                if offset < CANDIDATES_PER_ELEMENT {
                    found = Some((h, offset));
                    break;
                }
            }
        }
        let (h, offset) = match found {
            Some(f) => f,
            None => match self.allocate_element(window_base, direction) {
                Some(h) => (h, location - window_base),
                None => return,
            },
        };

        let bit = 1u64 << offset;
        let el = &mut self.pool[h as usize];
        if el.candidates_used & bit != 0 {
            // Another seed already proposed this exact offset; weight
            // counts distinct offsets, not repeated confirmations.
            return;
        }
        el.candidates_used |= bit;
        el.seed_offsets[offset as usize] = seed_offset;
        self.increment_weight(h);
    }

    fn allocate_element(&mut self, base: u32, direction: Direction) -> Option<u32> {
        if (self.n_used as usize) >= self.pool.len() {
            if !self.pool_exhausted_logged {
                log::debug!("candidate element pool exhausted; extra candidates dropped");
                self.pool_exhausted_logged = true;
            }
            return None;
        }
        let h = self.n_used;
        self.n_used += 1;

        let slot = self.hash_slot(base);
        let epoch = self.epoch;
        let anchor = &mut self.anchors[direction.index()][slot];
        let chain = if anchor.epoch == epoch { anchor.element } else { NONE };
        anchor.epoch = epoch;
        anchor.element = h;

        // Link into weight list 0 until the first candidate lands.
        let old_head = self.pool[0].weight_next;
        {
            let el = &mut self.pool[h as usize];
            *el = HashTableElement::empty();
            el.base_genome_location = base;
            el.direction = direction;
            el.next = chain;
            el.weight_next = old_head;
            el.weight_prev = 0;
        }
        self.pool[old_head as usize].weight_prev = h;
        self.pool[0].weight_next = h;
        Some(h)
    }

    fn increment_weight(&mut self, h: u32) {
        // Unlink.
        let (prev, next, weight) = {
            let el = &self.pool[h as usize];
            (el.weight_prev, el.weight_next, el.weight)
        };
        self.pool[prev as usize].weight_next = next;
        self.pool[next as usize].weight_prev = prev;

        let new_weight = (weight + 1).min(self.max_weight);
        let sentinel = new_weight;
        let old_head = self.pool[sentinel as usize].weight_next;
        {
            let el = &mut self.pool[h as usize];
            el.weight = new_weight;
            el.weight_next = old_head;
            el.weight_prev = sentinel;
        }
        self.pool[old_head as usize].weight_prev = h;
        self.pool[sentinel as usize].weight_next = h;
        self.highest_used_weight = self.highest_used_weight.max(new_weight);
    }

    fn score_candidates(
        &mut self,
        read: &Read,
        popular_seeds_skipped: u32,
        first_pass_seeds_not_skipped: [u32; NUM_DIRECTIONS],
    ) -> SingleAlignment {
        let read_len = read.len();
        let genome = self.index.genome_arc();

        let mut best_score = UNUSED_SCORE;
        let mut best_location = u32::MAX;
        let mut best_direction = Direction::Forward;
        let mut best_probability = 0.0f64;
        let mut best_element = NONE;
        let mut second_best_score = UNUSED_SCORE;
        let mut probability_of_all_candidates = 0.0f64;
        let mut score_limit = (self.max_k + self.extra_search_depth) as i32;
        let mut lv_calls: u64 = 0;
        let mut used_hamming = false;

        let min_first_pass =
            first_pass_seeds_not_skipped[0].min(first_pass_seeds_not_skipped[1]);

        'outer: for w in (1..=self.highest_used_weight).rev() {
            // Anything in this or a lower list missed at least this many
            // disjoint seeds, so it can't score below that number.
            let lowest_possible_score = min_first_pass.saturating_sub(w);
            if lowest_possible_score as i32 > score_limit {
                break;
            }

            let sentinel = w;
            let mut h = self.pool[sentinel as usize].weight_next;
            while h != sentinel {
                let next_h = self.pool[h as usize].weight_next;
                let mut unscored =
                    self.pool[h as usize].candidates_used & !self.pool[h as usize].candidates_scored;
                while unscored != 0 {
                    let offset = unscored.trailing_zeros();
                    unscored &= unscored - 1;
                    self.pool[h as usize].candidates_scored |= 1u64 << offset;

                    let (base, direction) = {
                        let el = &self.pool[h as usize];
                        (el.base_genome_location, el.direction)
                    };
                    let location = base + offset;
                    let window_len =
                        read_len + (self.max_k + self.extra_search_depth) as usize;
                    let text = match genome.substring_within_piece(location, window_len) {
                        Some(t) => t,
                        None => continue,
                    };
                    if (text.len() as i64) < read_len as i64 - score_limit as i64 {
                        // Chromosome-end truncation left too little
                        // reference to possibly fit.
                        continue;
                    }

                    let (pattern, quality): (&[u8], &[u8]) = match direction {
                        Direction::Forward => (read.data(), read.quality()),
                        Direction::Rc => {
                            (&self.rc_data[..read_len], &self.rc_quality[..read_len])
                        }
                    };

                    let result = if lv_calls < self.lv_limit {
                        let cache_key =
                            (location as u64) | ((direction.index() as u64) << 32);
                        self.lv
                            .compute_cached(text, pattern, quality, score_limit, cache_key)
                    } else {
                        used_hamming = true;
                        hamming_distance(text, pattern, quality, score_limit)
                    };
                    lv_calls += 1;
                    self.counters.locations_scored += 1;

                    if result.score < 0 {
                        continue;
                    }
                    let score = result.score as u32;

                    // Merged candidates (same element) count once toward
                    // the probability mass: only the element's best
                    // probability contributes.
                    {
                        let el = &mut self.pool[h as usize];
                        if result.match_probability > el.best_score_probability {
                            probability_of_all_candidates +=
                                result.match_probability - el.best_score_probability;
                            el.best_score_probability = result.match_probability;
                        }
                        if score < el.best_score {
                            el.best_score = score;
                        }
                    }

                    if score < best_score
                        || (score == best_score && result.match_probability > best_probability)
                    {
                        if best_element != h && best_element != NONE {
                            second_best_score = best_score;
                        }
                        best_score = score;
                        best_location = location;
                        best_direction = direction;
                        best_probability = result.match_probability;
                        best_element = h;
                    } else if h != best_element && score < second_best_score {
                        second_best_score = score;
                    }

                    score_limit =
                        score_limit.min(best_score as i32 + self.extra_search_depth as i32);

                    if probability_of_all_candidates >= SATURATION_PROBABILITY {
                        break 'outer;
                    }
                    if self.stop_on_first_hit && best_score <= self.max_k {
                        break 'outer;
                    }
                }
                h = next_h;
            }
        }

        if best_score == UNUSED_SCORE || best_score > self.max_k {
            return SingleAlignment::not_found();
        }

        let conf_diff_effective = self.conf_diff
            + u32::from(popular_seeds_skipped >= self.adaptive_conf_diff_threshold);
        let result = if second_best_score == UNUSED_SCORE
            || best_score + conf_diff_effective <= second_best_score
        {
            AlignmentResult::SingleHit
        } else {
            AlignmentResult::MultipleHits
        };

        let mapq = compute_mapq(
            probability_of_all_candidates,
            best_probability,
            best_score as i32,
            MapqInputs {
                popular_seeds_skipped,
                used_hamming,
                biggest_cluster_scored: None,
            },
        )
        .min(MAX_MAPQ);

        SingleAlignment {
            result,
            location: best_location,
            direction: best_direction,
            score: best_score as i32,
            mapq,
            best_hit_probability: best_probability,
            all_hits_probability: probability_of_all_candidates.max(best_probability),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::Genome;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_genome(len: usize, seed: u64) -> Arc<Genome> {
        let mut rng = StdRng::seed_from_u64(seed);
        let bases: Vec<u8> = (0..len)
            .map(|_| b"ACGT"[rng.gen_range(0..4)])
            .collect();
        Arc::new(Genome::from_pieces(vec![("chr1".to_string(), bases)]).unwrap())
    }

    fn test_config() -> AlignerConfig {
        AlignerConfig {
            max_hits: 32,
            max_seeds: 8,
            ..AlignerConfig::default()
        }
    }

    fn read_from(genome: &Genome, start: u32, len: usize) -> Read {
        let seq = genome.substring(start, len).unwrap().to_vec();
        let qual = vec![b'I'; len];
        Read::new(format!("r{}", start).into_bytes(), seq, qual)
    }

    #[test]
    fn exact_match_is_single_hit() {
        let genome = random_genome(20_000, 11);
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let read = read_from(&genome, 1_000, 100);
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::SingleHit);
        assert_eq!(a.location, 1_000);
        assert_eq!(a.direction, Direction::Forward);
        assert_eq!(a.score, 0);
        assert_eq!(a.mapq, MAX_MAPQ);
    }

    #[test]
    fn single_mismatch_scores_one() {
        let genome = random_genome(20_000, 12);
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let mut read = read_from(&genome, 2_000, 100);
        let mut seq = read.data().to_vec();
        seq[50] = match seq[50] {
            b'A' => b'C',
            _ => b'A',
        };
        read = Read::new(b"mm".to_vec(), seq, vec![b'I'; 100]);
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::SingleHit);
        assert_eq!(a.location, 2_000);
        assert_eq!(a.score, 1);
        assert!(a.mapq >= 60, "mapq was {}", a.mapq);
    }

    #[test]
    fn reverse_complement_read_found_rc() {
        let genome = random_genome(20_000, 13);
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let mut read = read_from(&genome, 3_000, 100);
        read.reverse_complement_in_place();
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::SingleHit);
        assert_eq!(a.location, 3_000);
        assert_eq!(a.direction, Direction::Rc);
        assert_eq!(a.score, 0);
    }

    #[test]
    fn deletion_in_read_scores_one() {
        let genome = random_genome(20_000, 14);
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let mut seq = genome.substring(4_000, 101).unwrap().to_vec();
        seq.remove(50);
        let read = Read::new(b"del".to_vec(), seq, vec![b'I'; 100]);
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::SingleHit);
        assert_eq!(a.location, 4_000);
        assert_eq!(a.score, 1);
    }

    #[test]
    fn repeat_read_is_multiple_hits_with_low_mapq() {
        // Plant the same 200bp block at five sites.
        let mut rng = StdRng::seed_from_u64(15);
        let block: Vec<u8> = (0..200).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect();
        let mut bases: Vec<u8> = (0..30_000).map(|_| b"ACGT"[rng.gen_range(0..4)]).collect();
        let sites = [1_000usize, 6_000, 12_000, 18_000, 24_000];
        for &s in &sites {
            bases[s..s + 200].copy_from_slice(&block);
        }
        let genome =
            Arc::new(Genome::from_pieces(vec![("chr1".to_string(), bases)]).unwrap());
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let read = Read::new(b"rep".to_vec(), block[50..150].to_vec(), vec![b'I'; 100]);
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::MultipleHits);
        assert!(a.mapq <= 3, "mapq was {}", a.mapq);
        assert!(sites.iter().any(|&s| a.location == (s + 50) as u32));
    }

    #[test]
    fn short_read_rejected() {
        let genome = random_genome(20_000, 16);
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let read = read_from(&genome, 100, 30);
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::NotFound);
        assert_eq!(aligner.counters.reads_ignored_too_short, 1);
    }

    #[test]
    fn n_heavy_read_rejected() {
        let genome = random_genome(20_000, 17);
        let index = Arc::new(GenomeIndex::from_genome(genome.clone(), 20).unwrap());
        let mut aligner = BaseAligner::new(index, &test_config());
        let mut seq = genome.substring(5_000, 100).unwrap().to_vec();
        for b in seq.iter_mut().take(20) {
            *b = b'N';
        }
        let read = Read::new(b"n".to_vec(), seq, vec![b'I'; 100]);
        let a = aligner.align_read(&read);
        assert_eq!(a.result, AlignmentResult::NotFound);
        assert_eq!(aligner.counters.reads_ignored_too_many_ns, 1);
    }
}
