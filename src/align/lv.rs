// Banded approximate matching (Landau-Vishkin): for each edit count d the
// furthest pattern prefix reachable on each diagonal is extended by free
// matches, so the work is O(k^2 + matches) instead of O(n*k). The traced
// path yields both the CIGAR and a per-alignment match probability.

use crate::align::cigar::CigarBuf;
use std::collections::HashMap;

pub const SNP_PROB: f64 = 0.001;
pub const GAP_OPEN_PROB: f64 = 0.001;
pub const GAP_EXTEND_PROB: f64 = 0.5;

/// Outcome of one extension. `score == -1` means "no alignment within k";
/// in that case the probability is 0 and `text_used` is meaningless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LvResult {
    pub score: i32,
    pub match_probability: f64,
    /// How many text bytes the alignment consumed (from the front in the
    /// forward direction, from the back in reverse).
    pub text_used: usize,
}

impl LvResult {
    pub fn not_found() -> Self {
        LvResult {
            score: -1,
            match_probability: 0.0,
            text_used: 0,
        }
    }
}

struct CacheEntry {
    epoch: u64,
    k: i32,
    result: LvResult,
}

const BT_START: u8 = 0;
const BT_SUB: u8 = 1;
const BT_INS: u8 = 2;
const BT_DEL: u8 = 3;

// Cap on retained cache entries; the map is wiped at the next read
// boundary once it grows past this.
const CACHE_HIGH_WATER: usize = 1 << 16;

/// One directional extender with its scoring table and result cache. The
/// caches of repeated candidate scoring make this worth owning per
/// aligner; it is not thread safe.
pub struct LandauVishkin {
    max_k: usize,
    reverse: bool,
    stride: usize,
    // (max_k + 1) rows of 2*max_k + 1 diagonals.
    l: Vec<i32>,
    bt: Vec<u8>,
    // Traceback scratch: (op, len, pattern_pos), innermost edit last.
    ops_scratch: Vec<(u8, u32, u32)>,
    phred_to_error: [f64; 256],
    cache: HashMap<u64, CacheEntry>,
    epoch: u64,
}

impl LandauVishkin {
    pub fn new_forward(max_k: usize) -> Self {
        Self::new(max_k, false)
    }

    pub fn new_reverse(max_k: usize) -> Self {
        Self::new(max_k, true)
    }

    fn new(max_k: usize, reverse: bool) -> Self {
        assert!(max_k >= 1);
        let stride = 2 * max_k + 1;
        let cells = (max_k + 1) * stride;
        let mut phred_to_error = [0.0f64; 256];
        for (q, p) in phred_to_error.iter_mut().enumerate() {
            let phred = q.saturating_sub(33) as f64;
            // Error probabilities below the SNP prior add nothing.
            *p = 10f64.powf(-phred / 10.0).max(1e-10);
        }
        LandauVishkin {
            max_k,
            reverse,
            stride,
            l: vec![-1; cells],
            bt: vec![BT_START; cells],
            ops_scratch: Vec::with_capacity(64),
            phred_to_error,
            cache: HashMap::new(),
            epoch: 0,
        }
    }

    pub fn max_k(&self) -> usize {
        self.max_k
    }

    /// Invalidate the cache; called once per read.
    pub fn begin_read(&mut self) {
        self.epoch += 1;
        if self.cache.len() > CACHE_HIGH_WATER {
            self.cache.clear();
        }
    }

    /// Cached extension: repeated scoring of the same candidate at the
    /// same (or looser) limit returns instantly.
    pub fn compute_cached(
        &mut self,
        text: &[u8],
        pattern: &[u8],
        quality: &[u8],
        k: i32,
        cache_key: u64,
    ) -> LvResult {
        if let Some(e) = self.cache.get(&cache_key) {
            if e.epoch == self.epoch {
                if e.result.score >= 0 && e.result.score <= k {
                    return e.result;
                }
                if e.result.score < 0 && e.k >= k {
                    return LvResult::not_found();
                }
            }
        }
        let result = self.compute(text, pattern, quality, k, None);
        let epoch = self.epoch;
        self.cache.insert(cache_key, CacheEntry { epoch, k, result });
        result
    }

    /// Extension with a traced CIGAR (forward direction only). Ops are
    /// accumulated as `=`/`X`/`I`/`D`; rendering picks the `M` form.
    pub fn compute_with_cigar(
        &mut self,
        text: &[u8],
        pattern: &[u8],
        quality: &[u8],
        k: i32,
        cigar: &mut CigarBuf,
    ) -> LvResult {
        debug_assert!(!self.reverse, "CIGAR tracing is a forward-direction operation");
        cigar.clear();
        self.compute(text, pattern, quality, k, Some(cigar))
    }

    /// Uncached extension.
    pub fn compute(
        &mut self,
        text: &[u8],
        pattern: &[u8],
        quality: &[u8],
        k: i32,
        mut cigar: Option<&mut CigarBuf>,
    ) -> LvResult {
        let n = pattern.len() as i32;
        let t = text.len() as i32;
        let k = k.min(self.max_k as i32);
        if k < 0 || t < n - k {
            return LvResult::not_found();
        }
        if n == 0 {
            return LvResult {
                score: 0,
                match_probability: 1.0,
                text_used: 0,
            };
        }
        debug_assert_eq!(pattern.len(), quality.len());

        for d in 0..=k {
            for diag in -d..=d {
                let (mut i, choice) = if d == 0 {
                    (0, BT_START)
                } else {
                    let sub = self.predecessor(d, diag, 0).map(|v| v + 1);
                    let ins = self.predecessor(d, diag, 1).map(|v| v + 1);
                    let del = self.predecessor(d, diag, -1);
                    // Prefer substitutions over indels on ties; it keeps
                    // the traced path compact.
                    let mut best = (sub, BT_SUB);
                    if del > best.0 {
                        best = (del, BT_DEL);
                    }
                    if ins > best.0 {
                        best = (ins, BT_INS);
                    }
                    match best.0 {
                        Some(v) if v <= n && v + diag <= t && v + diag >= 0 => (v, best.1),
                        _ => {
                            self.set(d, diag, -1, BT_START);
                            continue;
                        }
                    }
                };
                // Slide down the diagonal over free matches.
                while i < n
                    && i + diag < t
                    && bases_match(pattern[i as usize], self.text_at(text, (i + diag) as usize))
                {
                    i += 1;
                }
                self.set(d, diag, i, choice);
            }
            // Check the whole row for completion so that among equal edit
            // counts the diagonal with the fewest net indels wins.
            let mut done: Option<i32> = None;
            for diag in -d..=d {
                if self.get(d, diag) >= n && done.map_or(true, |b| diag.abs() < b.abs()) {
                    done = Some(diag);
                }
            }
            if let Some(diag) = done {
                let prob = self.traceback(d, diag, quality, cigar.as_deref_mut());
                return LvResult {
                    score: d,
                    match_probability: prob,
                    text_used: (n + diag) as usize,
                };
            }
        }
        LvResult::not_found()
    }

    /// A reverse-direction view of the text: index j counts from the end.
    /// The pattern and quality are expected pre-reversed by the caller.
    #[inline]
    fn text_at(&self, text: &[u8], j: usize) -> u8 {
        if self.reverse {
            text[text.len() - 1 - j]
        } else {
            text[j]
        }
    }

    #[inline]
    fn idx(&self, d: i32, diag: i32) -> usize {
        debug_assert!(d >= 0 && diag.unsigned_abs() as usize <= self.max_k);
        d as usize * self.stride + (diag + self.max_k as i32) as usize
    }

    #[inline]
    fn get(&self, d: i32, diag: i32) -> i32 {
        self.l[self.idx(d, diag)]
    }

    #[inline]
    fn set(&mut self, d: i32, diag: i32, val: i32, choice: u8) {
        let idx = self.idx(d, diag);
        self.l[idx] = val;
        self.bt[idx] = choice;
    }

    #[inline]
    fn predecessor(&self, d: i32, diag: i32, delta: i32) -> Option<i32> {
        let pd = diag + delta;
        if pd.abs() > d - 1 {
            return None;
        }
        let v = self.get(d - 1, pd);
        if v < 0 { None } else { Some(v) }
    }

    /// Walk the backtrack pointers from the terminal cell, emitting ops and
    /// computing the match probability (product of per-position priors).
    fn traceback(
        &mut self,
        d_final: i32,
        diag_final: i32,
        quality: &[u8],
        cigar: Option<&mut CigarBuf>,
    ) -> f64 {
        let mut ops = std::mem::take(&mut self.ops_scratch);
        ops.clear();

        let mut d = d_final;
        let mut diag = diag_final;
        let mut i = self.get(d, diag);
        loop {
            if d == 0 {
                if i > 0 {
                    ops.push((b'=', i as u32, 0));
                }
                break;
            }
            match self.bt[self.idx(d, diag)] {
                BT_SUB => {
                    let prev = self.get(d - 1, diag);
                    let run = i - (prev + 1);
                    if run > 0 {
                        ops.push((b'=', run as u32, (prev + 1) as u32));
                    }
                    ops.push((b'X', 1, prev as u32));
                    i = prev;
                }
                BT_INS => {
                    let prev = self.get(d - 1, diag + 1);
                    let run = i - (prev + 1);
                    if run > 0 {
                        ops.push((b'=', run as u32, (prev + 1) as u32));
                    }
                    ops.push((b'I', 1, prev as u32));
                    i = prev;
                    diag += 1;
                }
                BT_DEL => {
                    let prev = self.get(d - 1, diag - 1);
                    let run = i - prev;
                    if run > 0 {
                        ops.push((b'=', run as u32, prev as u32));
                    }
                    ops.push((b'D', 1, 0));
                    i = prev;
                    diag -= 1;
                }
                _ => unreachable!("broken backtrack chain"),
            }
            d -= 1;
        }

        // ops is innermost-first; walk it reversed to get read order,
        // multiplying priors and coalescing gap runs as we go.
        let mut probability = 1.0f64;
        let mut gap_op = 0u8;
        let mut gap_len = 0u32;
        if let Some(c) = cigar {
            for &(op, len, pos) in ops.iter().rev() {
                probability *= self.op_probability(op, len, pos, quality, &mut gap_op, &mut gap_len);
                c.push(op, len);
            }
        } else {
            for &(op, len, pos) in ops.iter().rev() {
                probability *= self.op_probability(op, len, pos, quality, &mut gap_op, &mut gap_len);
            }
        }

        self.ops_scratch = ops;
        probability.min(1.0)
    }

    #[inline]
    fn op_probability(
        &self,
        op: u8,
        len: u32,
        pos: u32,
        quality: &[u8],
        gap_op: &mut u8,
        gap_len: &mut u32,
    ) -> f64 {
        match op {
            b'=' => {
                *gap_op = 0;
                (1.0 - SNP_PROB).powi(len as i32)
            }
            b'X' => {
                *gap_op = 0;
                self.phred_to_error[quality[pos as usize] as usize]
            }
            b'I' | b'D' => {
                // A continuing run pays the extension prior; a fresh run
                // pays the open prior.
                if *gap_op == op {
                    *gap_len += len;
                    GAP_EXTEND_PROB.powi(len as i32)
                } else {
                    *gap_op = op;
                    *gap_len = len;
                    GAP_OPEN_PROB * GAP_EXTEND_PROB.powi(len as i32 - 1)
                }
            }
            _ => 1.0,
        }
    }
}

#[inline]
fn bases_match(a: u8, b: u8) -> bool {
    // N never matches anything, itself included.
    a == b && a != b'N' && a != b'n'
}

/// Plain Hamming distance with the same probability model (no indels).
/// Used once the Landau-Vishkin call budget for a read is exhausted.
pub fn hamming_distance(text: &[u8], pattern: &[u8], quality: &[u8], k: i32) -> LvResult {
    if text.len() < pattern.len() || k < 0 {
        return LvResult::not_found();
    }
    let mut score = 0i32;
    let mut probability = 1.0f64;
    for (i, (&p, &t)) in pattern.iter().zip(text.iter()).enumerate() {
        if bases_match(p, t) {
            probability *= 1.0 - SNP_PROB;
        } else {
            score += 1;
            if score > k {
                return LvResult::not_found();
            }
            probability *= 10f64.powf(-(quality[i].saturating_sub(33) as f64) / 10.0).max(1e-10);
        }
    }
    LvResult {
        score,
        match_probability: probability.min(1.0),
        text_used: pattern.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qual(n: usize) -> Vec<u8> {
        vec![b'I'; n] // Phred 40
    }

    #[test]
    fn exact_match() {
        let mut lv = LandauVishkin::new_forward(8);
        let r = lv.compute(b"ACGTACGTACGT", b"ACGTACGT", &qual(8), 8, None);
        assert_eq!(r.score, 0);
        assert_eq!(r.text_used, 8);
        assert!(r.match_probability > 0.99 * (1.0 - SNP_PROB).powi(8));
    }

    #[test]
    fn single_mismatch() {
        let mut lv = LandauVishkin::new_forward(8);
        let r = lv.compute(b"ACGTACGTAC", b"ACGAACGTAC", &qual(10), 8, None);
        assert_eq!(r.score, 1);
        assert_eq!(r.text_used, 10);
    }

    #[test]
    fn deletion_from_pattern() {
        let mut lv = LandauVishkin::new_forward(8);
        // Pattern is the text with one base removed: one D op, text_used
        // is one longer than the pattern.
        let r = lv.compute(b"ACGTTACGT", b"ACGTACGT", &qual(8), 8, None);
        assert_eq!(r.score, 1);
        assert_eq!(r.text_used, 9);
    }

    #[test]
    fn insertion_in_pattern() {
        let mut lv = LandauVishkin::new_forward(8);
        let r = lv.compute(b"ACGTACGT", b"ACGTTACGT", &qual(9), 8, None);
        assert_eq!(r.score, 1);
        assert_eq!(r.text_used, 8);
    }

    #[test]
    fn beyond_limit_is_minus_one() {
        let mut lv = LandauVishkin::new_forward(8);
        let r = lv.compute(b"AAAAAAAAAA", b"CCCCCCCCCC", &qual(10), 3, None);
        assert_eq!(r.score, -1);
        assert_eq!(r.match_probability, 0.0);
    }

    #[test]
    fn cigar_for_mismatch() {
        let mut lv = LandauVishkin::new_forward(8);
        let mut cigar = CigarBuf::new();
        let text = b"AACCGGTTAACCGGTTAACC";
        let mut pattern = text.to_vec();
        pattern[10] = b'G'; // was C
        let r = lv.compute_with_cigar(text, &pattern, &qual(20), 8, &mut cigar);
        assert_eq!(r.score, 1);
        assert_eq!(cigar.render(false).unwrap(), "10=1X9=");
        assert_eq!(cigar.render(true).unwrap(), "20M");
    }

    #[test]
    fn cigar_for_deletion() {
        let mut lv = LandauVishkin::new_forward(8);
        let mut cigar = CigarBuf::new();
        let text = b"ACGTCATGGCTACGTCATCC";
        let mut pattern = text.to_vec();
        pattern.remove(10);
        let r = lv.compute_with_cigar(text, &pattern, &qual(19), 8, &mut cigar);
        assert_eq!(r.score, 1);
        assert_eq!(cigar.render(false).unwrap(), "10=1D9=");
        assert_eq!(cigar.read_bases(), 19);
        assert_eq!(cigar.reference_bases(), 20);
    }

    #[test]
    fn reverse_matches_suffix() {
        let mut lv = LandauVishkin::new_reverse(8);
        // Pattern (reversed by the caller) should match the tail of text.
        let text = b"TTTTTTACGTACGT";
        let pattern = b"ACGTACGT";
        let rev: Vec<u8> = pattern.iter().rev().copied().collect();
        let r = lv.compute(text, &rev, &qual(8), 8, None);
        assert_eq!(r.score, 0);
        assert_eq!(r.text_used, 8);
    }

    #[test]
    fn reverse_scores_edit_near_front_of_suffix() {
        let mut lv = LandauVishkin::new_reverse(8);
        let text = b"TTTTTTACGAACGT"; // mismatch 4 back from the end
        let pattern = b"ACGTACGT";
        let rev: Vec<u8> = pattern.iter().rev().copied().collect();
        let r = lv.compute(text, &rev, &qual(8), 8, None);
        assert_eq!(r.score, 1);
    }

    #[test]
    fn cache_hit_returns_same_result() {
        let mut lv = LandauVishkin::new_forward(8);
        lv.begin_read();
        let a = lv.compute_cached(b"ACGTACGTAC", b"ACGAACGTAC", &qual(10), 8, 42);
        let b = lv.compute_cached(b"ACGTACGTAC", b"ACGAACGTAC", &qual(10), 8, 42);
        assert_eq!(a, b);
        // A not-found at limit 2 must not satisfy a later query at limit 8.
        let c = lv.compute_cached(b"AACCGGTTAACCGGTT", b"TTGGCCAATTGGCCAA", &qual(16), 2, 43);
        assert_eq!(c.score, -1);
    }

    #[test]
    fn n_bases_never_match() {
        let mut lv = LandauVishkin::new_forward(8);
        let r = lv.compute(b"ACGTNCGT", b"ACGTNCGT", &qual(8), 8, None);
        assert_eq!(r.score, 1); // the N column costs an edit
    }

    #[test]
    fn hamming_agrees_with_lv_on_substitutions() {
        let mut lv = LandauVishkin::new_forward(8);
        let text = b"ACGTACGTACGTACGT";
        let mut pattern = text.to_vec();
        pattern[3] = b'A';
        pattern[12] = b'C';
        let q = qual(16);
        let h = hamming_distance(text, &pattern, &q, 8);
        let l = lv.compute(text, &pattern, &q, 8, None);
        assert_eq!(h.score, l.score);
        assert!((h.match_probability - l.match_probability).abs() < 1e-12);
    }
}
