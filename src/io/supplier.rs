// Balanced read supplier queue. Reader threads parse records into
// fixed-size queue elements; worker threads pop them. A refcount tracker
// per data batch drives `release_before` on the underlying readers, which
// is what lets I/O buffers be recycled. In split-FASTQ mode two reader
// threads are kept within a small element imbalance of each other, and
// consumers pop one element from each file atomically, so the i-th record
// of file A always pairs with the i-th record of file B.

use crate::defaults::{MAX_IMBALANCE, READS_PER_ELEMENT};
use crate::io::data_reader::ReleaseHandle;
use crate::io::ReadReader;
use crate::read::{DataBatch, Read};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Reference counts per live batch; when a batch's count hits zero the
/// lowest still-live batch of that file becomes the release horizon.
#[derive(Debug, Default)]
pub struct BatchTracker {
    pending: HashMap<u64, u32>,
}

impl BatchTracker {
    pub fn new() -> Self {
        BatchTracker::default()
    }

    pub fn add_read(&mut self, batch: DataBatch) {
        *self.pending.entry(batch.as_key()).or_insert(0) += 1;
    }

    /// Returns the batch to `release_before` when this was the last
    /// reference to `batch`.
    pub fn remove_read(&mut self, batch: DataBatch) -> Option<DataBatch> {
        let key = batch.as_key();
        let count = self.pending.get_mut(&key).expect("removing an untracked batch");
        debug_assert!(*count > 0);
        if *count > 1 {
            *count -= 1;
            return None;
        }
        self.pending.remove(&key);
        let min_live = self
            .pending
            .keys()
            .filter(|&&k| (k >> 32) as u32 == batch.file_id)
            .map(|&k| k as u32)
            .min()
            .unwrap_or(u32::MAX);
        if batch.batch_id < min_live {
            Some(DataBatch::new(batch.file_id, min_live))
        } else {
            None
        }
    }
}

pub struct ReadQueueElement {
    pub reads: Vec<Read>,
}

impl ReadQueueElement {
    fn new() -> Self {
        ReadQueueElement {
            reads: Vec::with_capacity(READS_PER_ELEMENT),
        }
    }
}

struct QueueState {
    ready: [VecDeque<ReadQueueElement>; 2],
    empty: Vec<ReadQueueElement>,
    balance: i32,
    n_readers_running: usize,
    n_suppliers_running: usize,
    all_reads_queued: bool,
    tracker: BatchTracker,
    error: Option<io::Error>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    reads_ready: Condvar,
    empty_available: Condvar,
    all_consumed: Condvar,
    throttle: [Condvar; 2],
    release: [Option<ReleaseHandle>; 2],
    two_files: bool,
}

pub struct ReadSupplierQueue {
    inner: Arc<QueueInner>,
    reader_threads: Vec<JoinHandle<()>>,
}

enum ReaderMode {
    Single,
    /// Two consecutive records form a pair; elements hold whole pairs.
    PairedInterleaved,
}

impl ReadSupplierQueue {
    /// One input stream (FASTQ, SAM, or BAM), unpaired consumption.
    pub fn start_single(reader: Box<dyn ReadReader>) -> io::Result<Self> {
        Self::start(vec![reader], ReaderMode::Single)
    }

    /// One input stream whose consecutive records are mates.
    pub fn start_paired_interleaved(reader: Box<dyn ReadReader>) -> io::Result<Self> {
        Self::start(vec![reader], ReaderMode::PairedInterleaved)
    }

    /// Split-FASTQ: mates come from two files aligned by record order.
    pub fn start_paired_files(
        reader0: Box<dyn ReadReader>,
        reader1: Box<dyn ReadReader>,
    ) -> io::Result<Self> {
        Self::start(vec![reader0, reader1], ReaderMode::Single)
    }

    fn start(readers: Vec<Box<dyn ReadReader>>, mode: ReaderMode) -> io::Result<Self> {
        let two_files = readers.len() == 2;
        let mut release: [Option<ReleaseHandle>; 2] = [None, None];
        for (i, r) in readers.iter().enumerate() {
            release[i] = Some(r.release_handle());
        }
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                ready: [VecDeque::new(), VecDeque::new()],
                empty: (0..4).map(|_| ReadQueueElement::new()).collect(),
                balance: 0,
                n_readers_running: readers.len(),
                n_suppliers_running: 0,
                all_reads_queued: false,
                tracker: BatchTracker::new(),
                error: None,
            }),
            reads_ready: Condvar::new(),
            empty_available: Condvar::new(),
            all_consumed: Condvar::new(),
            throttle: [Condvar::new(), Condvar::new()],
            release,
            two_files,
        });

        let mut reader_threads = Vec::new();
        let stride = match mode {
            ReaderMode::Single => 1,
            ReaderMode::PairedInterleaved => 2,
        };
        for (which, reader) in readers.into_iter().enumerate() {
            let inner = Arc::clone(&inner);
            reader_threads.push(
                std::thread::Builder::new()
                    .name(format!("read-supplier-{}", which))
                    .spawn(move || reader_thread(inner, reader, which, stride))?,
            );
        }
        Ok(ReadSupplierQueue {
            inner,
            reader_threads,
        })
    }

    pub fn generate_supplier(&self) -> ReadSupplier {
        let mut state = self.inner.state.lock().unwrap();
        state.n_suppliers_running += 1;
        for _ in 0..2 {
            state.empty.push(ReadQueueElement::new());
        }
        self.inner.empty_available.notify_all();
        ReadSupplier {
            queue: Arc::clone(&self.inner),
            current: None,
            next_index: 0,
            finished: false,
        }
    }

    pub fn generate_paired_supplier(&self) -> PairedReadSupplier {
        let mut state = self.inner.state.lock().unwrap();
        state.n_suppliers_running += 1;
        let extra = if self.inner.two_files { 4 } else { 2 };
        for _ in 0..extra {
            state.empty.push(ReadQueueElement::new());
        }
        self.inner.empty_available.notify_all();
        PairedReadSupplier {
            queue: Arc::clone(&self.inner),
            current: [None, None],
            next_index: 0,
            finished: false,
        }
    }

    /// Block until every queued read has been consumed.
    pub fn wait_until_finished(&mut self) -> io::Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            while !(state.all_reads_queued && state.n_suppliers_running == 0) {
                state = self.inner.all_consumed.wait(state).unwrap();
            }
            if let Some(e) = state.error.take() {
                return Err(e);
            }
        }
        for handle in self.reader_threads.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

fn reader_thread(
    inner: Arc<QueueInner>,
    mut reader: Box<dyn ReadReader>,
    which: usize,
    stride: usize,
) {
    let balance_increment: i32 = if which == 0 { 1 } else { -1 };
    let mut done = false;

    while !done {
        let mut element = {
            let mut state = inner.state.lock().unwrap();
            if inner.two_files {
                while state.balance * balance_increment > MAX_IMBALANCE {
                    state = inner.throttle[which].wait(state).unwrap();
                }
            }
            while state.empty.is_empty() {
                state = inner.empty_available.wait(state).unwrap();
            }
            state.empty.pop().unwrap()
        };
        element.reads.clear();

        // Fill the element completely; it may span several data batches,
        // each of which gets its own tracker reference. Fixed-size
        // elements keep the two sides of a split-FASTQ run index-aligned.
        let mut last_batch: Option<DataBatch> = None;
        while element.reads.len() + stride <= READS_PER_ELEMENT {
            let mut group = Vec::with_capacity(stride);
            let mut hit_end = false;
            for _ in 0..stride {
                match reader.next_read() {
                    Ok(Some(read)) => group.push(read),
                    Ok(None) => {
                        hit_end = true;
                        break;
                    }
                    Err(e) => {
                        log::error!("input reader failed: {}", e);
                        let mut state = inner.state.lock().unwrap();
                        state.error.get_or_insert(e);
                        hit_end = true;
                        break;
                    }
                }
            }
            if hit_end {
                if !group.is_empty() && stride == 2 {
                    log::warn!("odd record count in paired input; final record dropped");
                }
                done = true;
                break;
            }
            for read in &group {
                let batch = read.batch();
                if last_batch != Some(batch) {
                    let mut state = inner.state.lock().unwrap();
                    state.tracker.add_read(batch);
                    last_batch = Some(batch);
                }
            }
            element.reads.extend(group);
        }

        let mut state = inner.state.lock().unwrap();
        if !element.reads.is_empty() {
            state.ready[which].push_back(element);
            inner.reads_ready.notify_all();
            if inner.two_files {
                state.balance += balance_increment;
                if state.balance * balance_increment > MAX_IMBALANCE {
                    // We can get at most one past the limit; our next
                    // iteration parks on the throttle.
                } else if state.balance * -balance_increment == MAX_IMBALANCE {
                    inner.throttle[1 - which].notify_all();
                }
            }
        } else {
            state.empty.push(element);
            inner.empty_available.notify_all();
        }
        if done {
            state.n_readers_running -= 1;
            if state.n_readers_running == 0 {
                state.all_reads_queued = true;
                inner.reads_ready.notify_all();
            }
        }
    }
}

fn pop_element(inner: &QueueInner, which: usize) -> Option<ReadQueueElement> {
    let mut state = inner.state.lock().unwrap();
    loop {
        if let Some(element) = state.ready[which].pop_front() {
            return Some(element);
        }
        if state.all_reads_queued {
            return None;
        }
        state = inner.reads_ready.wait(state).unwrap();
    }
}

/// Pop one element from each file under a single lock acquisition so
/// concurrent paired consumers can't interleave and desynchronize the
/// mates.
fn pop_element_pair(inner: &QueueInner) -> Option<(ReadQueueElement, ReadQueueElement)> {
    let mut state = inner.state.lock().unwrap();
    loop {
        if !state.ready[0].is_empty() && !state.ready[1].is_empty() {
            let e0 = state.ready[0].pop_front().unwrap();
            let e1 = state.ready[1].pop_front().unwrap();
            return Some((e0, e1));
        }
        if state.all_reads_queued {
            if !state.ready[0].is_empty() || !state.ready[1].is_empty() {
                log::warn!(
                    "paired input files have unequal record counts; trailing records dropped"
                );
            }
            return None;
        }
        state = inner.reads_ready.wait(state).unwrap();
    }
}

fn done_with_element(inner: &QueueInner, mut element: ReadQueueElement) {
    let mut state = inner.state.lock().unwrap();
    let mut last: Option<DataBatch> = None;
    for read in &element.reads {
        let batch = read.batch();
        if last == Some(batch) {
            continue;
        }
        last = Some(batch);
        if let Some(release_target) = state.tracker.remove_read(batch) {
            if let Some(handle) = inner.release[batch.file_id as usize % 2].as_ref() {
                handle.release_before(release_target);
            }
        }
    }
    element.reads.clear();
    state.empty.push(element);
    inner.empty_available.notify_all();
}

fn supplier_finished(inner: &QueueInner) {
    let mut state = inner.state.lock().unwrap();
    debug_assert!(state.n_suppliers_running > 0);
    state.n_suppliers_running -= 1;
    if state.n_suppliers_running == 0 {
        inner.all_consumed.notify_all();
    }
}

pub struct ReadSupplier {
    queue: Arc<QueueInner>,
    current: Option<ReadQueueElement>,
    next_index: usize,
    finished: bool,
}

impl ReadSupplier {
    pub fn next_read(&mut self) -> Option<Read> {
        if self.finished {
            return None;
        }
        if let Some(element) = self.current.as_ref() {
            if self.next_index >= element.reads.len() {
                done_with_element(&self.queue, self.current.take().unwrap());
            }
        }
        if self.current.is_none() {
            match pop_element(&self.queue, 0) {
                Some(element) => {
                    self.current = Some(element);
                    self.next_index = 0;
                }
                None => {
                    self.finished = true;
                    supplier_finished(&self.queue);
                    return None;
                }
            }
        }
        let element = self.current.as_mut().unwrap();
        let read = std::mem::take(&mut element.reads[self.next_index]);
        self.next_index += 1;
        Some(read)
    }
}

impl Drop for ReadSupplier {
    fn drop(&mut self) {
        if let Some(element) = self.current.take() {
            done_with_element(&self.queue, element);
        }
        if !self.finished {
            supplier_finished(&self.queue);
        }
    }
}

pub struct PairedReadSupplier {
    queue: Arc<QueueInner>,
    // In two-file mode both slots hold index-aligned elements; in
    // single-file (interleaved) mode only slot 0 runs, with a stride of
    // two.
    current: [Option<ReadQueueElement>; 2],
    next_index: usize,
    finished: bool,
}

impl PairedReadSupplier {
    pub fn next_pair(&mut self) -> Option<(Read, Read)> {
        if self.finished {
            return None;
        }
        let two_files = self.queue.two_files;
        let stride = if two_files { 1 } else { 2 };
        if let Some(element) = self.current[0].as_ref() {
            let limit = match self.current[1].as_ref() {
                Some(second) => element.reads.len().min(second.reads.len()),
                None => element.reads.len(),
            };
            if self.next_index + stride > limit {
                done_with_element(&self.queue, self.current[0].take().unwrap());
                if let Some(second) = self.current[1].take() {
                    done_with_element(&self.queue, second);
                }
            }
        }
        if self.current[0].is_none() {
            if two_files {
                match pop_element_pair(&self.queue) {
                    Some((e0, e1)) => {
                        if e0.reads.len() != e1.reads.len() {
                            log::warn!(
                                "paired elements of unequal length ({} vs {}); excess dropped",
                                e0.reads.len(),
                                e1.reads.len()
                            );
                        }
                        self.current = [Some(e0), Some(e1)];
                    }
                    None => {
                        self.finished = true;
                        supplier_finished(&self.queue);
                        return None;
                    }
                }
            } else {
                match pop_element(&self.queue, 0) {
                    Some(element) => {
                        debug_assert_eq!(element.reads.len() % 2, 0);
                        self.current = [Some(element), None];
                    }
                    None => {
                        self.finished = true;
                        supplier_finished(&self.queue);
                        return None;
                    }
                }
            }
            self.next_index = 0;
        }
        if two_files {
            let r0 = std::mem::take(&mut self.current[0].as_mut().unwrap().reads[self.next_index]);
            let r1 = std::mem::take(&mut self.current[1].as_mut().unwrap().reads[self.next_index]);
            self.next_index += 1;
            Some((r0, r1))
        } else {
            let element = self.current[0].as_mut().unwrap();
            let r0 = std::mem::take(&mut element.reads[self.next_index]);
            let r1 = std::mem::take(&mut element.reads[self.next_index + 1]);
            self.next_index += 2;
            Some((r0, r1))
        }
    }
}

impl Drop for PairedReadSupplier {
    fn drop(&mut self) {
        for slot in self.current.iter_mut() {
            if let Some(element) = slot.take() {
                done_with_element(&self.queue, element);
            }
        }
        if !self.finished {
            supplier_finished(&self.queue);
        }
    }
}
