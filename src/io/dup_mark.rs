// Duplicate marking over the BAM record stream, as a Modify filter in
// front of the gzip framing. Records sharing a coordinate run are
// partitioned by (position pair, orientation pair); within a partition
// the highest-quality read (or pair, by summed base quality across both
// mates) survives and the rest gain the duplicate flag. The first-mate
// partition is decided before its pair sums are known; when the
// second-mate pass overturns that pick, the earlier flags are backpatched
// in place if the first mates are still in the writable batch, and
// otherwise the written winner stands and the better pair's second mate
// is forcibly flagged.

use crate::genome::Genome;
use crate::io::bam::{set_flag, BamRecordView};
use crate::io::data_writer::{FilterContext, FilterKind, FilterSupplier, WriteFilter};
use crate::io::sam::sam_flags;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;

/// Partition key: both mate locations (sorted) and their orientations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DupKey {
    locations: [u32; 2],
    rc: [bool; 2],
}

impl DupKey {
    fn from_view(view: &BamRecordView<'_>, ref_offsets: &[u32]) -> DupKey {
        let loc = view.location(ref_offsets).unwrap_or(u32::MAX);
        let next = view.next_location(ref_offsets).unwrap_or(u32::MAX);
        let flag = view.flag();
        let rc = flag & sam_flags::REVERSE_COMPLEMENT != 0;
        let next_rc = flag & sam_flags::NEXT_REVERSED != 0;
        if loc <= next {
            DupKey {
                locations: [loc, next],
                rc: [rc, next_rc],
            }
        } else {
            DupKey {
                locations: [next, loc],
                rc: [next_rc, rc],
            }
        }
    }
}

/// One first mate of a processed partition, remembered so the second-mate
/// pass can add its quality into the pair sum and backpatch its flag.
struct FirstMate {
    name: Vec<u8>,
    quality: i32,
    abs_offset: u64,
}

/// What we remember about a processed first-mate partition until the
/// second mates come by.
struct MateInfo {
    /// Winner of the first-mate-only comparison (the flags already
    /// written reflect this pick).
    best_read_id: Vec<u8>,
    first_mates: Vec<FirstMate>,
}

pub struct DupMarkFilterSupplier {
    ref_offsets: Vec<u32>,
}

impl DupMarkFilterSupplier {
    pub fn new(genome: &Genome) -> Arc<Self> {
        Arc::new(DupMarkFilterSupplier {
            ref_offsets: genome.pieces().iter().map(|p| p.beginning_offset).collect(),
        })
    }
}

impl FilterSupplier for DupMarkFilterSupplier {
    fn kind(&self) -> FilterKind {
        FilterKind::Modify
    }

    fn get_filter(&self) -> Box<dyn WriteFilter> {
        Box::new(DupMarkFilter {
            ref_offsets: self.ref_offsets.clone(),
            offsets: Vec::new(),
            run_start: 0,
            run_location: u32::MAX,
            run_count: 0,
            mates: HashMap::new(),
        })
    }

    fn wants_history(&self) -> bool {
        true
    }
}

#[derive(Clone)]
struct RecordMeta {
    abs_offset: u64,
    flag: u16,
    key: DupKey,
    quality: i32,
    name: Vec<u8>,
}

pub struct DupMarkFilter {
    ref_offsets: Vec<u32>,
    // Batch-relative offsets of records appended since the last flush.
    offsets: Vec<usize>,
    // Coordinate-run state, carried across batches.
    run_start: u64,
    run_location: u32,
    run_count: u32,
    mates: HashMap<DupKey, MateInfo>,
}

impl DupMarkFilter {
    /// Copy out the metadata of every record in [run_start, run_end),
    /// walking history and the current batch as one logical stream.
    fn collect_run(
        &self,
        ctx: &FilterContext<'_>,
        run_start: u64,
        run_end: u64,
    ) -> Vec<RecordMeta> {
        let mut metas = Vec::new();
        let mut offset = run_start;
        while offset < run_end {
            let view = match self.view_at(ctx, offset) {
                Some(v) => v,
                None => break, // run start predates retained history
            };
            metas.push(RecordMeta {
                abs_offset: offset,
                flag: view.flag(),
                key: DupKey::from_view(&view, &self.ref_offsets),
                quality: view.total_quality(),
                name: view.read_name().to_vec(),
            });
            offset += view.total_len() as u64;
        }
        metas
    }

    fn view_at<'a>(&self, ctx: &'a FilterContext<'_>, abs: u64) -> Option<BamRecordView<'a>> {
        let base = ctx.logical_offset;
        if abs >= base {
            let rel = (abs - base) as usize;
            return BamRecordView::at(ctx.current.get(rel..)?);
        }
        for retained in ctx.history {
            if abs >= retained.logical_offset
                && abs < retained.logical_offset + retained.data.len() as u64
            {
                let rel = (abs - retained.logical_offset) as usize;
                return BamRecordView::at(&retained.data[rel..]);
            }
        }
        None
    }

    /// Rewrite the duplicate bit of a record that is still in the current
    /// (writable) batch; the backpatch path.
    fn set_duplicate_flag(&self, ctx: &mut FilterContext<'_>, abs: u64, duplicate: bool) {
        let rel = (abs - ctx.logical_offset) as usize;
        let flag = match BamRecordView::at(&ctx.current[rel..]) {
            Some(view) => view.flag(),
            None => return,
        };
        let flag = if duplicate {
            flag | sam_flags::DUPLICATE
        } else {
            flag & !sam_flags::DUPLICATE
        };
        set_flag(&mut ctx.current[rel..], flag);
    }

    /// Set or clear the duplicate flag; only records still in the current
    /// batch can be rewritten.
    fn mark_duplicate(&self, ctx: &mut FilterContext<'_>, meta: &RecordMeta) {
        if meta.flag & sam_flags::UNMAPPED != 0 {
            // Unmapped reads are never marked, matching common practice.
            return;
        }
        let base = ctx.logical_offset;
        if meta.abs_offset < base {
            // First-mate batch already out of reach; this is the
            // best-effort boundary.
            log::debug!(
                "duplicate flag for a record at logical offset {} lost to a flushed batch",
                meta.abs_offset
            );
            return;
        }
        let rel = (meta.abs_offset - base) as usize;
        set_flag(&mut ctx.current[rel..], meta.flag | sam_flags::DUPLICATE);
    }

    fn process_run(&mut self, ctx: &mut FilterContext<'_>, run_start: u64, run_end: u64) {
        let metas = self.collect_run(ctx, run_start, run_end);
        if metas.len() < 2 {
            return;
        }

        // Partition indices by key, separating pair roles.
        let mut singles: HashMap<&DupKey, Vec<usize>> = HashMap::new();
        let mut firsts: HashMap<&DupKey, Vec<usize>> = HashMap::new();
        let mut seconds: HashMap<&DupKey, Vec<usize>> = HashMap::new();
        for (i, meta) in metas.iter().enumerate() {
            if meta.flag & sam_flags::MULTI_SEGMENT == 0 {
                singles.entry(&meta.key).or_default().push(i);
            } else if meta.flag & sam_flags::LAST_SEGMENT != 0 {
                seconds.entry(&meta.key).or_default().push(i);
            } else {
                firsts.entry(&meta.key).or_default().push(i);
            }
        }

        let mut to_mark: Vec<usize> = Vec::new();

        for members in singles.values() {
            if members.len() < 2 {
                continue;
            }
            let best = *members
                .iter()
                .max_by_key(|&&i| metas[i].quality)
                .unwrap();
            to_mark.extend(members.iter().filter(|&&i| i != best));
        }

        for (key, members) in &firsts {
            let best = *members
                .iter()
                .max_by_key(|&&i| metas[i].quality)
                .unwrap();
            if members.len() > 1 {
                to_mark.extend(members.iter().filter(|&&i| i != best));
            }
            self.mates.insert(
                (*key).clone(),
                MateInfo {
                    best_read_id: metas[best].name.clone(),
                    first_mates: members
                        .iter()
                        .map(|&i| FirstMate {
                            name: metas[i].name.clone(),
                            quality: metas[i].quality,
                            abs_offset: metas[i].abs_offset,
                        })
                        .collect(),
                },
            );
        }

        // Flag rewrites on first mates whose partition was decided before
        // the pair sums were known; applied after the plain marks so a
        // cleared flag isn't re-set.
        let mut backpatches: Vec<(u64, bool)> = Vec::new();

        for (key, members) in &seconds {
            let keep = match self.mates.remove(*key) {
                Some(info) => {
                    // The surviving pair is the one with the highest
                    // summed base quality across both mates.
                    let pair_quality = |i: usize| {
                        metas[i].quality
                            + info
                                .first_mates
                                .iter()
                                .find(|fm| fm.name == metas[i].name)
                                .map_or(0, |fm| fm.quality)
                    };
                    let winner = *members
                        .iter()
                        .max_by_key(|&&i| pair_quality(i))
                        .unwrap();
                    if metas[winner].name == info.best_read_id {
                        winner
                    } else {
                        // The pair sum overturns the first-mate-only
                        // pick. Rewrite the earlier decision when those
                        // records are still writable; a flushed
                        // first-mate batch forces the flag onto the
                        // better pair's second mate instead.
                        let old_best = info
                            .first_mates
                            .iter()
                            .find(|fm| fm.name == info.best_read_id);
                        let new_best = info
                            .first_mates
                            .iter()
                            .find(|fm| fm.name == metas[winner].name);
                        let base = ctx.logical_offset;
                        match (old_best, new_best) {
                            (Some(old), Some(new))
                                if old.abs_offset >= base && new.abs_offset >= base =>
                            {
                                backpatches.push((old.abs_offset, true));
                                backpatches.push((new.abs_offset, false));
                                winner
                            }
                            _ => {
                                log::debug!(
                                    "duplicate backpatch for pair '{}' lost to a flushed batch",
                                    String::from_utf8_lossy(&metas[winner].name)
                                );
                                members
                                    .iter()
                                    .copied()
                                    .find(|&i| metas[i].name == info.best_read_id)
                                    .unwrap_or(winner)
                            }
                        }
                    }
                }
                // The first-mate run predates this filter's view
                // entirely; best effort within the second-mate partition.
                None => *members
                    .iter()
                    .max_by_key(|&&i| metas[i].quality)
                    .unwrap(),
            };
            if members.len() > 1 {
                to_mark.extend(members.iter().filter(|&&i| i != keep));
            }
        }

        for i in to_mark {
            self.mark_duplicate(ctx, &metas[i]);
        }
        for (abs, duplicate) in backpatches {
            self.set_duplicate_flag(ctx, abs, duplicate);
        }
    }
}

impl WriteFilter for DupMarkFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Modify
    }

    fn on_advance(&mut self, batch_offset: usize, _bytes: usize, _location: u32) {
        self.offsets.push(batch_offset);
    }

    fn on_next_batch(&mut self, ctx: &mut FilterContext<'_>) -> io::Result<()> {
        let base = ctx.logical_offset;
        let offsets = std::mem::take(&mut self.offsets);
        for rel in offsets {
            let (location, next_location) = {
                let view = match BamRecordView::at(&ctx.current[rel..]) {
                    Some(v) => v,
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "record offsets out of step with buffer contents",
                        ))
                    }
                };
                (
                    view.location(&self.ref_offsets),
                    view.next_location(&self.ref_offsets),
                )
            };
            let abs = base + rel as u64;
            let logical_location = match location.or(next_location) {
                Some(l) => l,
                None => continue, // both ends unmapped; can't be a duplicate
            };
            if logical_location == self.run_location {
                if location.is_some() {
                    self.run_count += 1;
                }
            } else {
                if self.run_count > 1 {
                    let (start, end) = (self.run_start, abs);
                    self.process_run(ctx, start, end);
                }
                self.run_location = logical_location;
                self.run_start = abs;
                self.run_count = u32::from(location.is_some());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::data_writer::RetainedBatch;
    use crate::io::sam::PreparedRecord;

    fn genome() -> Genome {
        Genome::from_pieces(vec![("chr1".to_string(), vec![b'A'; 100_000])]).unwrap()
    }

    fn record(name: &str, pos: u32, qual: u8, flag: u16) -> PreparedRecord {
        PreparedRecord {
            qname: name.as_bytes().to_vec(),
            flag,
            rname: Some(0),
            pos,
            mapq: 60,
            cigar: Some("10M".to_string()),
            cigar_bam: vec![10 << 4],
            seq: b"ACGTACGTAC".to_vec(),
            qual: vec![qual; 10],
            ref_span: 10,
        }
    }

    /// Encode records into one logical batch, run the filter over it, and
    /// return each record's final flags.
    fn run_filter(records: &[PreparedRecord]) -> Vec<u16> {
        let g = genome();
        let supplier = DupMarkFilterSupplier::new(&g);
        let mut filter = supplier.get_filter();

        let mut batch = Vec::new();
        let mut offsets = Vec::new();
        for rec in records {
            offsets.push(batch.len());
            let before = batch.len();
            crate::io::bam::emit_bam(&mut batch, rec, None);
            filter.on_advance(before, batch.len() - before, 0);
        }
        let mut ctx = FilterContext {
            current: &mut batch,
            history: &[],
            logical_offset: 0,
            physical_offset: Some(0),
            logical_snapshot: None,
        };
        filter.on_next_batch(&mut ctx).unwrap();

        offsets
            .iter()
            .map(|&o| BamRecordView::at(&batch[o..]).unwrap().flag())
            .collect()
    }

    #[test]
    fn lower_quality_single_end_duplicate_is_flagged() {
        let flags = run_filter(&[
            record("a", 100, b'I', 0),
            record("b", 100, b'#', 0),
            // Sentinel at another position flushes the run.
            record("z", 5_000, b'I', 0),
        ]);
        assert_eq!(flags[0] & sam_flags::DUPLICATE, 0);
        assert_ne!(flags[1] & sam_flags::DUPLICATE, 0);
        assert_eq!(flags[2] & sam_flags::DUPLICATE, 0);
    }

    #[test]
    fn distinct_positions_are_not_duplicates() {
        let flags = run_filter(&[
            record("a", 100, b'I', 0),
            record("b", 200, b'I', 0),
            record("z", 5_000, b'I', 0),
        ]);
        assert!(flags.iter().all(|f| f & sam_flags::DUPLICATE == 0));
    }

    #[test]
    fn orientation_splits_partitions() {
        let flags = run_filter(&[
            record("a", 100, b'I', 0),
            record("b", 100, b'#', sam_flags::REVERSE_COMPLEMENT),
            record("z", 5_000, b'I', 0),
        ]);
        // Different orientations never compete.
        assert!(flags.iter().all(|f| f & sam_flags::DUPLICATE == 0));
    }

    /// Encode one record with its mate coordinate wired in, so both ends
    /// of a pair share a partition key.
    fn encode_paired(rec: &PreparedRecord, mate_pos: u32) -> Vec<u8> {
        let mut out = Vec::new();
        let mut mate = rec.clone();
        mate.pos = mate_pos;
        crate::io::bam::emit_bam(
            &mut out,
            rec,
            Some(&crate::io::sam::PairEmit {
                mate: &mate,
                first_in_pair: rec.flag & sam_flags::FIRST_SEGMENT != 0,
                proper: true,
            }),
        );
        out
    }

    /// Feed pre-encoded records through the filter as one logical batch
    /// and return (per-record final flags, batch bytes).
    fn run_encoded(
        filter: &mut Box<dyn WriteFilter>,
        encoded: &[Vec<u8>],
        history: &[RetainedBatch],
        logical_offset: u64,
    ) -> (Vec<u16>, Vec<u8>) {
        let mut batch = Vec::new();
        let mut offsets = Vec::new();
        for rec in encoded {
            offsets.push(batch.len());
            filter.on_advance(batch.len(), rec.len(), 0);
            batch.extend_from_slice(rec);
        }
        let mut ctx = FilterContext {
            current: &mut batch,
            history,
            logical_offset,
            physical_offset: Some(0),
            logical_snapshot: None,
        };
        filter.on_next_batch(&mut ctx).unwrap();
        let flags = offsets
            .iter()
            .map(|&o| BamRecordView::at(&batch[o..]).unwrap().flag())
            .collect();
        (flags, batch)
    }

    fn encode_single(rec: &PreparedRecord) -> Vec<u8> {
        let mut out = Vec::new();
        crate::io::bam::emit_bam(&mut out, rec, None);
        out
    }

    #[test]
    fn pair_winner_keeps_both_mates() {
        let pflag = sam_flags::MULTI_SEGMENT | sam_flags::ALL_ALIGNED;
        let a1 = record("pa", 100, b'I', pflag | sam_flags::FIRST_SEGMENT);
        let b1 = record("pb", 100, b'#', pflag | sam_flags::FIRST_SEGMENT);
        let a2 = record("pa", 400, b'I', pflag | sam_flags::LAST_SEGMENT);
        let b2 = record("pb", 400, b'#', pflag | sam_flags::LAST_SEGMENT);
        let g = genome();
        let supplier = DupMarkFilterSupplier::new(&g);
        let mut filter = supplier.get_filter();
        let encoded = vec![
            encode_paired(&a1, 400),
            encode_paired(&b1, 400),
            encode_paired(&a2, 100),
            encode_paired(&b2, 100),
            // Sentinel flushes the last run.
            encode_single(&record("z", 50_000, b'I', 0)),
        ];
        let (flags, _) = run_encoded(&mut filter, &encoded, &[], 0);
        // Pair "pa" (higher quality on both ends) survives; "pb" is
        // flagged on both ends.
        assert_eq!(flags[0] & sam_flags::DUPLICATE, 0, "pa first");
        assert_ne!(flags[1] & sam_flags::DUPLICATE, 0, "pb first");
        assert_eq!(flags[2] & sam_flags::DUPLICATE, 0, "pa second");
        assert_ne!(flags[3] & sam_flags::DUPLICATE, 0, "pb second");
    }

    #[test]
    fn pair_sum_overrides_first_mate_only_pick() {
        // "pa" has the better first mate (400 vs 360) but "pb" the far
        // better pair sum (360+400 vs 400+20); the second-mate pass must
        // overturn the first decision and backpatch both first mates.
        let pflag = sam_flags::MULTI_SEGMENT | sam_flags::ALL_ALIGNED;
        let a1 = record("pa", 100, b'I', pflag | sam_flags::FIRST_SEGMENT);
        let b1 = record("pb", 100, b'E', pflag | sam_flags::FIRST_SEGMENT);
        let a2 = record("pa", 400, b'#', pflag | sam_flags::LAST_SEGMENT);
        let b2 = record("pb", 400, b'I', pflag | sam_flags::LAST_SEGMENT);
        let g = genome();
        let supplier = DupMarkFilterSupplier::new(&g);
        let mut filter = supplier.get_filter();
        let encoded = vec![
            encode_paired(&a1, 400),
            encode_paired(&b1, 400),
            encode_paired(&a2, 100),
            encode_paired(&b2, 100),
            encode_single(&record("z", 50_000, b'I', 0)),
        ];
        let (flags, _) = run_encoded(&mut filter, &encoded, &[], 0);
        assert_ne!(flags[0] & sam_flags::DUPLICATE, 0, "pa first");
        assert_eq!(flags[1] & sam_flags::DUPLICATE, 0, "pb first");
        assert_ne!(flags[2] & sam_flags::DUPLICATE, 0, "pa second");
        assert_eq!(flags[3] & sam_flags::DUPLICATE, 0, "pb second");
    }

    #[test]
    fn flushed_first_mates_force_flag_on_second_partition() {
        // Same qualities as above, but the first mates go out in an
        // earlier batch. The backpatch can't reach them, so the written
        // first-mate winner ("pa") stands and the better pair's second
        // mate is forcibly flagged instead.
        let pflag = sam_flags::MULTI_SEGMENT | sam_flags::ALL_ALIGNED;
        let a1 = record("pa", 100, b'I', pflag | sam_flags::FIRST_SEGMENT);
        let b1 = record("pb", 100, b'E', pflag | sam_flags::FIRST_SEGMENT);
        let a2 = record("pa", 400, b'#', pflag | sam_flags::LAST_SEGMENT);
        let b2 = record("pb", 400, b'I', pflag | sam_flags::LAST_SEGMENT);
        let g = genome();
        let supplier = DupMarkFilterSupplier::new(&g);
        let mut filter = supplier.get_filter();

        let first_batch = vec![
            encode_paired(&a1, 400),
            encode_paired(&b1, 400),
            encode_single(&record("y", 5_000, b'I', 0)),
        ];
        let (first_flags, first_bytes) = run_encoded(&mut filter, &first_batch, &[], 0);
        assert_eq!(first_flags[0] & sam_flags::DUPLICATE, 0, "pa first");
        assert_ne!(first_flags[1] & sam_flags::DUPLICATE, 0, "pb first");

        let history = [RetainedBatch {
            logical_offset: 0,
            data: first_bytes.clone(),
        }];
        let second_batch = vec![
            encode_paired(&a2, 100),
            encode_paired(&b2, 100),
            encode_single(&record("z", 6_000, b'I', 0)),
        ];
        let (second_flags, _) = run_encoded(
            &mut filter,
            &second_batch,
            &history,
            first_bytes.len() as u64,
        );
        assert_eq!(second_flags[0] & sam_flags::DUPLICATE, 0, "pa second");
        assert_ne!(second_flags[1] & sam_flags::DUPLICATE, 0, "pb second");
    }
}
