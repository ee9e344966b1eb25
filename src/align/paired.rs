// Paired-end alignment by set intersection: instead of aligning each end
// separately and hoping they land near each other, the seed-hit sets of
// the two ends are intersected under the spacing constraint and only
// locations with a plausible mate anywhere in range are ever scored.
//
// Only two orientation combinations are consistent with standard library
// geometry: (read0 forward, read1 RC) and the mirror image. The engine
// walks both "set pairs" in lockstep, interleaving them so that a good
// pair found on either side tightens the score limit for both.

use crate::align::lv::{LandauVishkin, SNP_PROB};
use crate::align::mapq::{compute_mapq, MapqInputs, SATURATION_PROBABILITY};
use crate::align::single::BaseAligner;
use crate::align::{AlignmentResult, PairedAlignment, SingleAlignment};
use crate::defaults::MIN_READ_LENGTH;
use crate::index::{GenomeIndex, Seed};
use crate::options::AlignerConfig;
use crate::read::{Direction, Read, NUM_DIRECTIONS};
use bio::alphabets::dna;
use std::sync::Arc;

const NUM_SET_PAIRS: usize = 2;
const NUM_READS_PER_PAIR: usize = 2;
const UNUSED_PAIR_SCORE: i32 = 65536;

/// Candidates this close together are treated as the same location
/// (indel-induced wobble), mirroring the single-end merge window.
const MAX_MERGE_DISTANCE: u32 = 31;

/// One seed lookup in a hit set. `hits` is the index's descending list;
/// the cursor only ever moves forward (toward lower locations).
struct HitSetLookup<'a> {
    seed_offset: u32,
    hits: &'a [u32],
    cursor: usize,
    /// Disjoint-seed group this lookup belongs to (seeds within one wrap
    /// generation don't share read bases).
    group: u32,
}

impl<'a> HitSetLookup<'a> {
    /// Read-start location at the cursor, or None when exhausted (or only
    /// hits too close to the genome start remain).
    fn current(&self) -> Option<u32> {
        self.hits[self.cursor..]
            .first()
            .and_then(|&h| h.checked_sub(self.seed_offset))
    }

    fn advance_to_leq(&mut self, max_loc: u32) {
        while let Some(&h) = self.hits.get(self.cursor) {
            match h.checked_sub(self.seed_offset) {
                Some(loc) if loc <= max_loc => break,
                _ => self.cursor += 1,
            }
        }
    }
}

/// The seed hits of one (read, direction), walkable from the highest
/// genome location to the lowest.
struct HashTableHitSet<'a> {
    lookups: Vec<HitSetLookup<'a>>,
    n_groups: u32,
    most_recent: u32,
}

impl<'a> HashTableHitSet<'a> {
    fn new(max_seeds: usize) -> Self {
        HashTableHitSet {
            lookups: Vec::with_capacity(max_seeds),
            n_groups: 0,
            most_recent: u32::MAX,
        }
    }

    fn record_lookup(&mut self, seed_offset: u32, hits: &'a [u32], group: u32) {
        if hits.is_empty() {
            return;
        }
        self.n_groups = self.n_groups.max(group + 1);
        self.lookups.push(HitSetLookup {
            seed_offset,
            hits,
            cursor: 0,
            group,
        });
    }

    fn total_hits(&self) -> usize {
        self.lookups.iter().map(|l| l.hits.len()).sum()
    }

    fn first_hit(&mut self) -> Option<(u32, u32, u32)> {
        self.next_hit_leq(u32::MAX)
    }

    /// Highest remaining location <= `max_loc`, with its seed offset and
    /// best possible score.
    fn next_hit_leq(&mut self, max_loc: u32) -> Option<(u32, u32, u32)> {
        let mut best: Option<(u32, u32)> = None;
        for l in self.lookups.iter_mut() {
            l.advance_to_leq(max_loc);
            if let Some(loc) = l.current() {
                if best.map_or(true, |(b, _)| loc > b) {
                    best = Some((loc, l.seed_offset));
                }
            }
        }
        let (loc, seed_offset) = best?;
        self.most_recent = loc;
        Some((loc, seed_offset, self.best_possible_score(loc)))
    }

    /// The next location strictly below the last one returned.
    fn next_lower_hit(&mut self) -> Option<(u32, u32, u32)> {
        let below = self.most_recent.checked_sub(1)?;
        self.next_hit_leq(below)
    }

    /// Every disjoint seed group with no hit near `loc` proves at least
    /// one edit, since its seeds share no read bases.
    fn best_possible_score(&self, loc: u32) -> u32 {
        let mut group_hit = [false; 64];
        for l in &self.lookups {
            if let Some(cur) = l.current() {
                if cur.abs_diff(loc) <= MAX_MERGE_DISTANCE {
                    group_hit[(l.group as usize).min(63)] = true;
                }
            }
        }
        let matched = group_hit[..self.n_groups.min(64) as usize]
            .iter()
            .filter(|&&g| g)
            .count() as u32;
        self.n_groups - matched
    }
}

#[derive(Debug, Clone, Copy)]
struct HitLocation {
    genome_location: u32,
    genome_location_offset: i32,
    seed_offset: u32,
    is_scored: bool,
    score: i32,
    /// Limit the location was scored with; a -1 at a lower limit must be
    /// rescored when more slack becomes available.
    max_k_used: i32,
    match_probability: f64,
}

/// Fixed-size ring of recent hit locations, kept strictly descending from
/// tail (highest) to head (lowest).
struct HitLocationRingBuffer {
    buffer: Vec<HitLocation>,
    head: usize,
    tail: usize,
}

impl HitLocationRingBuffer {
    fn new(size: usize) -> Self {
        HitLocationRingBuffer {
            buffer: vec![
                HitLocation {
                    genome_location: 0,
                    genome_location_offset: 0,
                    seed_offset: 0,
                    is_scored: false,
                    score: -1,
                    max_k_used: -1,
                    match_probability: 0.0,
                };
                size
            ],
            head: 0,
            tail: 0,
        }
    }

    fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn insert_head(&mut self, genome_location: u32, seed_offset: u32) {
        let size = self.buffer.len();
        debug_assert!((self.head + 1) % size != self.tail, "ring buffer overflow");
        debug_assert!(
            self.is_empty()
                || genome_location < self.buffer[(self.head + size - 1) % size].genome_location,
            "ring insertions must be strictly descending"
        );
        self.buffer[self.head] = HitLocation {
            genome_location,
            genome_location_offset: 0,
            seed_offset,
            is_scored: false,
            score: -1,
            max_k_used: -1,
            match_probability: 0.0,
        };
        self.head = (self.head + 1) % size;
    }

    fn insert_head_scored(
        &mut self,
        genome_location: u32,
        seed_offset: u32,
        score: i32,
        match_probability: f64,
    ) {
        self.insert_head(genome_location, seed_offset);
        let size = self.buffer.len();
        let slot = &mut self.buffer[(self.head + size - 1) % size];
        slot.is_scored = true;
        slot.score = score;
        slot.match_probability = match_probability;
    }

    /// Drop entries (from the tail, i.e. the highest locations) above
    /// `highest_to_keep`.
    fn trim_above_location(&mut self, highest_to_keep: u32) {
        while self.tail != self.head
            && self.buffer[self.tail].genome_location > highest_to_keep
        {
            self.tail = (self.tail + 1) % self.buffer.len();
        }
    }

    fn tail_location(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            Some(self.buffer[self.tail].genome_location)
        }
    }

    /// Lowest (most recently inserted) location.
    fn head_location(&self) -> Option<u32> {
        if self.is_empty() {
            None
        } else {
            let size = self.buffer.len();
            Some(self.buffer[(self.head + size - 1) % size].genome_location)
        }
    }

    /// Index walk from tail (highest location) toward head.
    fn first_index(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.tail)
        }
    }

    fn next_index(&self, index: usize) -> Option<usize> {
        let next = (index + 1) % self.buffer.len();
        if next == self.head {
            None
        } else {
            Some(next)
        }
    }

    fn at(&self, index: usize) -> &HitLocation {
        &self.buffer[index]
    }

    fn at_mut(&mut self, index: usize) -> &mut HitLocation {
        &mut self.buffer[index]
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PairedAlignerCounters {
    pub extender_calls: u64,
    pub small_hits_considered: u64,
    pub pairs_via_fallback: u64,
}

pub struct IntersectingPairedEndAligner {
    index: Arc<GenomeIndex>,
    seed_len: usize,
    max_k: u32,
    max_seeds: u32,
    min_spacing: u32,
    max_spacing: u32,
    max_big_hits: u32,
    extra_search_depth: u32,
    max_read_size: usize,

    lv: LandauVishkin,
    reverse_lv: LandauVishkin,
    base_aligner: BaseAligner,

    // Per-read scratch: RC data/quality, and reversed copies of both
    // orientations for the reverse extender.
    rc_data: [Vec<u8>; NUM_READS_PER_PAIR],
    rc_quality: [Vec<u8>; NUM_READS_PER_PAIR],
    reversed_data: [[Vec<u8>; NUM_DIRECTIONS]; NUM_READS_PER_PAIR],
    reversed_quality: [[Vec<u8>; NUM_DIRECTIONS]; NUM_READS_PER_PAIR],
    read_len: [usize; NUM_READS_PER_PAIR],

    seed_used: Vec<u64>,
    mate_hits: [HitLocationRingBuffer; NUM_SET_PAIRS],
    fewer_hits_ring: [HitLocationRingBuffer; NUM_SET_PAIRS],

    pub counters: PairedAlignerCounters,
}

impl IntersectingPairedEndAligner {
    pub fn new(index: Arc<GenomeIndex>, config: &AlignerConfig) -> Self {
        let seed_len = index.seed_len();
        // Window span plus one slot for the hit fetched just past the
        // bottom of the window, plus the ring's always-empty slot.
        let mate_ring_size = 2 * config.max_spacing as usize + 4;
        let merge_ring_size = 2 * MAX_MERGE_DISTANCE as usize + 2;
        let lv_k = (config.max_k + config.extra_search_depth) as usize;
        IntersectingPairedEndAligner {
            index: Arc::clone(&index),
            seed_len,
            max_k: config.max_k,
            max_seeds: config.max_seeds.min(30),
            min_spacing: config.min_spacing,
            max_spacing: config.max_spacing,
            max_big_hits: config.max_big_hits,
            extra_search_depth: config.extra_search_depth,
            max_read_size: config.max_read_size,
            lv: LandauVishkin::new_forward(lv_k),
            reverse_lv: LandauVishkin::new_reverse(lv_k),
            base_aligner: BaseAligner::new(index, config),
            rc_data: [vec![0; config.max_read_size], vec![0; config.max_read_size]],
            rc_quality: [vec![0; config.max_read_size], vec![0; config.max_read_size]],
            reversed_data: std::array::from_fn(|_| {
                std::array::from_fn(|_| vec![0; config.max_read_size])
            }),
            reversed_quality: std::array::from_fn(|_| {
                std::array::from_fn(|_| vec![0; config.max_read_size])
            }),
            read_len: [0; NUM_READS_PER_PAIR],
            seed_used: vec![0; (config.max_read_size + 63) / 64],
            mate_hits: [
                HitLocationRingBuffer::new(mate_ring_size),
                HitLocationRingBuffer::new(mate_ring_size),
            ],
            fewer_hits_ring: [
                HitLocationRingBuffer::new(merge_ring_size),
                HitLocationRingBuffer::new(merge_ring_size),
            ],
            counters: PairedAlignerCounters::default(),
        }
    }

    pub fn align_pair(&mut self, read0: &Read, read1: &Read) -> PairedAlignment {
        let reads = [read0, read1];

        // Ends too short or too N-ridden to intersect go through the
        // single-end engine, capped at full confidence.
        if reads.iter().any(|r| r.len() < MIN_READ_LENGTH)
            || reads
                .iter()
                .map(|r| r.count_of_ns())
                .sum::<usize>()
                > self.max_k as usize
        {
            return self.align_with_base_aligner(read0, read1);
        }
        for r in &reads {
            if r.len() > self.max_read_size {
                log::warn!(
                    "read '{}' is {} bases, longer than the configured maximum {}; skipping pair",
                    String::from_utf8_lossy(r.id()),
                    r.len(),
                    self.max_read_size
                );
                return PairedAlignment {
                    results: [SingleAlignment::not_found(), SingleAlignment::not_found()],
                    aligned_as_pair: false,
                };
            }
        }

        self.prepare_scratch(read0, read1);
        self.lv.begin_read();
        self.reverse_lv.begin_read();
        for ring in self.mate_hits.iter_mut().chain(self.fewer_hits_ring.iter_mut()) {
            ring.clear();
        }

        // Phase 1: seed lookups into four hit sets, one per (read,
        // direction). The hit sets borrow the index through a local
        // handle so `self` stays mutable for the rings and the scorer.
        let index = Arc::clone(&self.index);
        let mut hit_sets: [[HashTableHitSet; NUM_DIRECTIONS]; NUM_READS_PER_PAIR] =
            std::array::from_fn(|_| {
                std::array::from_fn(|_| HashTableHitSet::new(self.max_seeds as usize))
            });
        let mut popular_seeds_skipped = [0u32; NUM_READS_PER_PAIR];

        for which_read in 0..NUM_READS_PER_PAIR {
            let read_len = self.read_len[which_read];
            let data = reads[which_read].data();
            let n_possible = read_len - self.seed_len + 1;
            for w in self.seed_used.iter_mut() {
                *w = 0;
            }

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
                        next_seed += 1;
                        continue;
                    }
                };
                let (fwd_hits, rc_hits) = index.lookup(seed);
                n_lookups += 1;

                for dir in [Direction::Forward, Direction::Rc] {
                    let hits = match dir {
                        Direction::Forward => fwd_hits,
                        Direction::Rc => rc_hits,
                    };
                    let offset = match dir {
                        Direction::Forward => next_seed,
                        Direction::Rc => read_len - self.seed_len - next_seed,
                    };
                    if hits.len() < self.max_big_hits as usize {
                        hit_sets[which_read][dir.index()].record_lookup(
                            offset as u32,
                            hits,
                            wrap_count as u32,
                        );
                    } else {
                        popular_seeds_skipped[which_read] += 1;
                    }
                }
                next_seed += self.seed_len;
            }
        }

        // Phase 2: intersect. Work the read with fewer total hits against
        // the mate's ring buffer, alternating set pairs to pull the score
        // limit down evenly.
        let total_hits = |r: usize| {
            hit_sets[r][0].total_hits() + hit_sets[r][1].total_hits()
        };
        let read_with_more_hits = usize::from(total_hits(0) > total_hits(1));
        let read_with_fewer_hits = 1 - read_with_more_hits;

        // Directions per set pair, indexed by read.
        let set_pair_direction: [[Direction; NUM_READS_PER_PAIR]; NUM_SET_PAIRS] = [
            [Direction::Forward, Direction::Rc],
            [Direction::Rc, Direction::Forward],
        ];

        struct IntersectionState {
            done: bool,
            fewer_loc: u32,
            fewer_seed_offset: u32,
            more_loc: u32,
        }
        let mut states: [IntersectionState; NUM_SET_PAIRS] = std::array::from_fn(|_| {
            IntersectionState {
                done: false,
                fewer_loc: 0,
                fewer_seed_offset: 0,
                more_loc: u32::MAX,
            }
        });

        for (i, state) in states.iter_mut().enumerate() {
            let dir = set_pair_direction[i][read_with_fewer_hits];
            match hit_sets[read_with_fewer_hits][dir.index()].first_hit() {
                Some((loc, seed_offset, _)) => {
                    state.fewer_loc = loc;
                    state.fewer_seed_offset = seed_offset;
                }
                None => state.done = true,
            }
        }

        let mut best_pair_score = UNUSED_PAIR_SCORE;
        let mut probability_of_best_pair = 0.0f64;
        let mut probability_of_all_pairs = 0.0f64;
        let mut best_location = [u32::MAX; NUM_READS_PER_PAIR];
        let mut best_direction = [Direction::Forward; NUM_READS_PER_PAIR];
        let mut best_score = [-1i32; NUM_READS_PER_PAIR];
        let mut score_limit = (self.max_k + self.extra_search_depth) as i32;

        let mut which = usize::from(states[0].done);

        'intersect: while !(states[0].done && states[1].done) {
            if states[which].done {
                which = 1 - which;
                continue;
            }
            let fewer_dir = set_pair_direction[which][read_with_fewer_hits];
            let more_dir = set_pair_direction[which][read_with_more_hits];
            let small_loc = states[which].fewer_loc;
            self.counters.small_hits_considered += 1;

            // A hit within the merge window of the one just scored is the
            // same candidate seen through a different seed (indel wobble);
            // its pairs were already counted.
            if let Some(head_loc) = self.fewer_hits_ring[which].head_location() {
                if head_loc.abs_diff(small_loc) <= MAX_MERGE_DISTANCE {
                    match hit_sets[read_with_fewer_hits][fewer_dir.index()].next_lower_hit() {
                        Some((loc, seed_offset, _)) => {
                            states[which].fewer_loc = loc;
                            states[which].fewer_seed_offset = seed_offset;
                        }
                        None => states[which].done = true,
                    }
                    if !states[1 - which].done {
                        which = 1 - which;
                    }
                    continue;
                }
            }

            // Pull the mate cursor into range and keep the ring buffer
            // populated with every mate hit that could pair with this (or
            // a later, lower) small-side hit.
            let window_high = small_loc.saturating_add(self.max_spacing);
            if states[which].more_loc > window_high {
                self.mate_hits[which].clear();
                match hit_sets[read_with_more_hits][more_dir.index()].next_hit_leq(window_high) {
                    Some((loc, seed_offset, _)) => {
                        states[which].more_loc = loc;
                        self.mate_hits[which].insert_head(loc, seed_offset);
                    }
                    None => {
                        states[which].done = true;
                        which = 1 - which;
                        continue;
                    }
                }
            } else {
                self.mate_hits[which].trim_above_location(window_high);
            }

            let min_location = small_loc.saturating_sub(self.max_spacing);

            if self.mate_hits[which].is_empty()
                || self.mate_hits[which].tail_location().unwrap() < min_location
            {
                // No mate anywhere in range; jump the small side down to
                // where one could exist.
                let more_loc = self.mate_hits[which]
                    .tail_location()
                    .unwrap_or(states[which].more_loc);
                match hit_sets[read_with_fewer_hits][fewer_dir.index()]
                    .next_hit_leq(more_loc.saturating_add(self.max_spacing))
                {
                    Some((loc, seed_offset, _)) => {
                        states[which].fewer_loc = loc;
                        states[which].fewer_seed_offset = seed_offset;
                        if !states[1 - which].done {
                            which = 1 - which;
                        }
                    }
                    None => {
                        states[which].done = true;
                        which = 1 - which;
                    }
                }
                continue;
            }

            // Two hits close enough to pair; score the small side.
            let (fewer_score, fewer_probability, fewer_offset) = self.score_location(
                reads[read_with_fewer_hits],
                read_with_fewer_hits,
                fewer_dir,
                small_loc,
                states[which].fewer_seed_offset,
                score_limit,
            );

            if fewer_score < 0 {
                match hit_sets[read_with_fewer_hits][fewer_dir.index()].next_lower_hit() {
                    Some((loc, seed_offset, _)) => {
                        states[which].fewer_loc = loc;
                        states[which].fewer_seed_offset = seed_offset;
                        if !states[1 - which].done {
                            which = 1 - which;
                        }
                    }
                    None => {
                        states[which].done = true;
                        which = 1 - which;
                    }
                }
                continue;
            }

            self.fewer_hits_ring[which].trim_above_location(
                small_loc.saturating_add(MAX_MERGE_DISTANCE),
            );
            self.fewer_hits_ring[which].insert_head_scored(
                small_loc,
                states[which].fewer_seed_offset,
                fewer_score,
                fewer_probability,
            );

            // Top the ring buffer up down to the bottom of the window.
            while states[which].more_loc >= min_location {
                match hit_sets[read_with_more_hits][more_dir.index()].next_lower_hit() {
                    Some((loc, seed_offset, _)) => {
                        states[which].more_loc = loc;
                        self.mate_hits[which].insert_head(loc, seed_offset);
                    }
                    None => break,
                }
            }

            // Score every mate candidate in the window against this hit.
            let mut index = self.mate_hits[which].first_index();
            while let Some(idx) = index {
                let mate = *self.mate_hits[which].at(idx);
                if mate.genome_location < min_location {
                    break;
                }
                let larger = mate.genome_location.max(small_loc);
                let smaller = mate.genome_location.min(small_loc);
                let delta = larger - smaller;
                if delta <= self.max_spacing && delta >= self.min_spacing {
                    let mate_limit = score_limit - fewer_score;
                    if !mate.is_scored || (mate.score == -1 && mate.max_k_used < mate_limit) {
                        let (score, probability, offset) = self.score_location(
                            reads[read_with_more_hits],
                            read_with_more_hits,
                            more_dir,
                            mate.genome_location,
                            mate.seed_offset,
                            mate_limit,
                        );
                        let slot = self.mate_hits[which].at_mut(idx);
                        slot.is_scored = true;
                        slot.score = score;
                        slot.match_probability = probability;
                        slot.genome_location_offset = offset;
                        slot.max_k_used = mate_limit;
                    }

                    let mate = *self.mate_hits[which].at(idx);
                    if mate.score != -1 {
                        let pair_probability = mate.match_probability * fewer_probability;
                        let pair_score = mate.score + fewer_score;
                        if pair_score <= self.max_k as i32
                            && (pair_score < best_pair_score
                                || (pair_score == best_pair_score
                                    && pair_probability > probability_of_best_pair))
                        {
                            best_pair_score = pair_score;
                            probability_of_best_pair = pair_probability;
                            best_location[read_with_fewer_hits] =
                                (small_loc as i64 + fewer_offset as i64) as u32;
                            best_location[read_with_more_hits] = (mate.genome_location as i64
                                + mate.genome_location_offset as i64)
                                as u32;
                            best_score[read_with_fewer_hits] = fewer_score;
                            best_score[read_with_more_hits] = mate.score;
                            best_direction[read_with_fewer_hits] = fewer_dir;
                            best_direction[read_with_more_hits] = more_dir;
                            score_limit = best_pair_score + self.extra_search_depth as i32;
                        }
                        probability_of_all_pairs += pair_probability;
                        if probability_of_all_pairs >= SATURATION_PROBABILITY {
                            // Nothing can rescue this pair from MAPQ 0.
                            break 'intersect;
                        }
                    }
                }
                index = self.mate_hits[which].next_index(idx);
            }

            // Advance the small side and hand the turn to the other set
            // pair.
            match hit_sets[read_with_fewer_hits][fewer_dir.index()].next_lower_hit() {
                Some((loc, seed_offset, _)) => {
                    states[which].fewer_loc = loc;
                    states[which].fewer_seed_offset = seed_offset;
                }
                None => states[which].done = true,
            }
            if !states[1 - which].done {
                which = 1 - which;
            }
        }

        if best_pair_score == UNUSED_PAIR_SCORE {
            return PairedAlignment {
                results: [SingleAlignment::not_found(), SingleAlignment::not_found()],
                aligned_as_pair: false,
            };
        }

        let mut results = [SingleAlignment::not_found(), SingleAlignment::not_found()];
        for which_read in 0..NUM_READS_PER_PAIR {
            let mapq = compute_mapq(
                probability_of_all_pairs,
                probability_of_best_pair,
                best_score[which_read],
                MapqInputs {
                    popular_seeds_skipped: popular_seeds_skipped[which_read],
                    used_hamming: false,
                    biggest_cluster_scored: None,
                },
            );
            results[which_read] = SingleAlignment {
                result: if mapq > 10 {
                    AlignmentResult::SingleHit
                } else {
                    AlignmentResult::MultipleHits
                },
                location: best_location[which_read],
                direction: best_direction[which_read],
                score: best_score[which_read],
                mapq,
                best_hit_probability: probability_of_best_pair,
                all_hits_probability: probability_of_all_pairs.max(probability_of_best_pair),
            };
        }
        PairedAlignment {
            results,
            aligned_as_pair: true,
        }
    }

    /// Score one oriented read at one candidate location by extending
    /// right of the seed with the forward extender and left of it with
    /// the reverse extender over reversed data; the seed itself is a
    /// known match.
    fn score_location(
        &mut self,
        read: &Read,
        which_read: usize,
        direction: Direction,
        genome_location: u32,
        seed_offset: u32,
        score_limit: i32,
    ) -> (i32, f64, i32) {
        if score_limit < 0 {
            return (-1, 0.0, 0);
        }
        self.counters.extender_calls += 1;
        let read_len = self.read_len[which_read];
        let genome = self.index.genome_arc();
        let slack = (self.max_k + self.extra_search_depth) as usize;

        let window = match genome.substring_within_piece(genome_location, read_len + slack) {
            Some(w) => w,
            None => return (-1, 0.0, 0),
        };
        if (window.len() as i64) < read_len as i64 - score_limit as i64 {
            return (-1, 0.0, 0);
        }

        let (data, quality): (&[u8], &[u8]) = match direction {
            Direction::Forward => (read.data(), read.quality()),
            Direction::Rc => (
                &self.rc_data[which_read][..read_len],
                &self.rc_quality[which_read][..read_len],
            ),
        };

        let seed_offset = seed_offset as usize;
        let tail_start = seed_offset + self.seed_len;
        if tail_start > read_len || tail_start > window.len() {
            return (-1, 0.0, 0);
        }

        let cache_key = (genome_location as u64 + tail_start as u64)
            | ((direction.index() as u64) << 32)
            | ((which_read as u64) << 33)
            | ((tail_start as u64) << 34);

        let tail = self.lv.compute_cached(
            &window[tail_start..],
            &data[tail_start..],
            &quality[tail_start..],
            score_limit,
            cache_key,
        );
        if tail.score < 0 {
            return (-1, 0.0, 0);
        }

        // Head: reverse-extend from the seed start over the reversed read.
        let seed_start_abs = genome_location as usize + seed_offset;
        let piece_start = genome
            .piece_at(genome_location)
            .map(|p| p.beginning_offset as usize)
            .unwrap_or(0);
        let left_avail = (seed_start_abs - piece_start).min(seed_offset + slack);
        let left_text = genome
            .substring((seed_start_abs - left_avail) as u32, left_avail)
            .unwrap_or(&[]);

        let rev_data = &self.reversed_data[which_read][direction.index()][..read_len];
        let rev_quality = &self.reversed_quality[which_read][direction.index()][..read_len];
        let head = self.reverse_lv.compute_cached(
            left_text,
            &rev_data[read_len - seed_offset..],
            &rev_quality[read_len - seed_offset..],
            score_limit - tail.score,
            cache_key | 1 << 63,
        );
        if head.score < 0 {
            return (-1, 0.0, 0);
        }

        let score = tail.score + head.score;
        let probability = tail.match_probability
            * head.match_probability
            * (1.0 - SNP_PROB).powi(self.seed_len as i32);
        // Indels left of the seed shift where the alignment actually
        // starts.
        let location_offset = seed_offset as i32 - head.text_used as i32;
        (score, probability.min(1.0), location_offset)
    }

    fn align_with_base_aligner(&mut self, read0: &Read, read1: &Read) -> PairedAlignment {
        self.counters.pairs_via_fallback += 1;
        let mut results = [
            self.base_aligner.align_read(read0),
            self.base_aligner.align_read(read1),
        ];
        for r in results.iter_mut() {
            r.mapq = r.mapq.min(crate::align::mapq::MAX_MAPQ);
        }
        PairedAlignment {
            results,
            aligned_as_pair: false,
        }
    }

    fn prepare_scratch(&mut self, read0: &Read, read1: &Read) {
        let reads = [read0, read1];
        for (which, read) in reads.iter().enumerate() {
            let data = read.data();
            let quality = read.quality();
            let len = data.len();
            self.read_len[which] = len;

            self.rc_data[which][..len].copy_from_slice(&dna::revcomp(data));
            for (i, &q) in quality.iter().rev().enumerate() {
                self.rc_quality[which][i] = q;
            }
            for (i, &b) in data.iter().rev().enumerate() {
                self.reversed_data[which][Direction::Forward.index()][i] = b;
                self.reversed_quality[which][Direction::Forward.index()][i] = quality[len - 1 - i];
            }
            // Reversing the RC = complement in original order.
            for i in 0..len {
                self.reversed_data[which][Direction::Rc.index()][i] =
                    self.rc_data[which][len - 1 - i];
                self.reversed_quality[which][Direction::Rc.index()][i] =
                    self.rc_quality[which][len - 1 - i];
            }
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
}
