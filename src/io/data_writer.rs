// Async batched output. Each worker owns a writer with rotating buffers;
// finished buffers are handed to a background thread that writes them at
// file offsets reserved from a shared allocator, so many writers can fill
// one file without coordinating beyond one mutex. Filters sit between a
// buffer and the disk: observation (Read), in-place rewrites (Modify),
// duplication into a side channel (Copy), or wholesale replacement
// (Transform, e.g. gzip framing).

use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterKind {
    Read,
    Modify,
    Copy,
    Transform,
}

/// A previous logical batch kept in memory for filters that look back
/// (duplicate marking's mate search).
pub struct RetainedBatch {
    pub logical_offset: u64,
    pub data: Vec<u8>,
}

pub struct FilterContext<'a> {
    /// The logical batch. Transform filters replace its contents.
    pub current: &'a mut Vec<u8>,
    pub history: &'a [RetainedBatch],
    /// Absolute logical offset of `current[0]`.
    pub logical_offset: u64,
    /// Absolute physical offset, known up front only for non-transform
    /// filters; transforms get it via `on_batch_written`.
    pub physical_offset: Option<u64>,
    /// A transform filter that replaces `current` leaves the original
    /// logical bytes here so the writer can retain them for look-back
    /// filters.
    pub logical_snapshot: Option<Vec<u8>>,
}

pub trait WriteFilter: Send {
    fn kind(&self) -> FilterKind;

    /// One record was appended at `batch_offset` within the current
    /// logical batch.
    fn on_advance(&mut self, _batch_offset: usize, _bytes: usize, _location: u32) {}

    /// The batch is about to be written (after any upstream filter ran).
    fn on_next_batch(&mut self, _ctx: &mut FilterContext<'_>) -> io::Result<()> {
        Ok(())
    }

    /// Final offsets for the batch just handed to the disk; transform
    /// filters resolve their pending anchors here.
    fn on_batch_written(&mut self, _physical_offset: u64, _logical_offset: u64) {}
}

pub trait FilterSupplier: Send + Sync {
    fn kind(&self) -> FilterKind;
    fn get_filter(&self) -> Box<dyn WriteFilter>;
    /// Trailing bytes appended at close (e.g. the BGZF end marker).
    fn closing_bytes(&self) -> Vec<u8> {
        Vec::new()
    }
    /// True if the filter looks back at previous logical batches.
    fn wants_history(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Composition
// ---------------------------------------------------------------------------

struct ComposeFilter {
    a: Box<dyn WriteFilter>,
    b: Box<dyn WriteFilter>,
}

impl WriteFilter for ComposeFilter {
    fn kind(&self) -> FilterKind {
        self.a.kind().max(self.b.kind())
    }

    fn on_advance(&mut self, batch_offset: usize, bytes: usize, location: u32) {
        self.a.on_advance(batch_offset, bytes, location);
        self.b.on_advance(batch_offset, bytes, location);
    }

    fn on_next_batch(&mut self, ctx: &mut FilterContext<'_>) -> io::Result<()> {
        self.a.on_next_batch(ctx)?;
        self.b.on_next_batch(ctx)
    }

    fn on_batch_written(&mut self, physical_offset: u64, logical_offset: u64) {
        self.a.on_batch_written(physical_offset, logical_offset);
        self.b.on_batch_written(physical_offset, logical_offset);
    }
}

struct ComposeFilterSupplier {
    a: Arc<dyn FilterSupplier>,
    b: Arc<dyn FilterSupplier>,
}

impl FilterSupplier for ComposeFilterSupplier {
    fn kind(&self) -> FilterKind {
        self.a.kind().max(self.b.kind())
    }

    fn get_filter(&self) -> Box<dyn WriteFilter> {
        Box::new(ComposeFilter {
            a: self.a.get_filter(),
            b: self.b.get_filter(),
        })
    }

    fn closing_bytes(&self) -> Vec<u8> {
        let mut out = self.a.closing_bytes();
        out.extend_from_slice(&self.b.closing_bytes());
        out
    }

    fn wants_history(&self) -> bool {
        self.a.wants_history() || self.b.wants_history()
    }
}

/// Apply `a` then `b`; the composite has the stronger kind.
pub fn compose(a: Arc<dyn FilterSupplier>, b: Arc<dyn FilterSupplier>) -> Arc<dyn FilterSupplier> {
    Arc::new(ComposeFilterSupplier { a, b })
}

// ---------------------------------------------------------------------------
// Supplier: shared file + offset allocator
// ---------------------------------------------------------------------------

pub struct DataWriterSupplier {
    file: Arc<File>,
    offsets: Mutex<(u64, u64)>,
    filter_supplier: Option<Arc<dyn FilterSupplier>>,
    buffer_size: usize,
    buffer_count: usize,
}

impl DataWriterSupplier {
    pub fn create(
        path: &Path,
        filter_supplier: Option<Arc<dyn FilterSupplier>>,
        buffer_count: usize,
        buffer_size: usize,
    ) -> io::Result<Arc<Self>> {
        debug_assert!(buffer_count >= 2);
        let file = File::create(path)?;
        Ok(Arc::new(DataWriterSupplier {
            file: Arc::new(file),
            offsets: Mutex::new((0, 0)),
            filter_supplier,
            buffer_size,
            buffer_count,
        }))
    }

    /// Atomically reserve physical and logical file space.
    fn advance(&self, physical: u64, logical: u64) -> (u64, u64) {
        let mut offsets = self.offsets.lock().unwrap();
        let reserved = *offsets;
        offsets.0 += physical;
        offsets.1 += logical;
        reserved
    }

    pub fn get_writer(self: &Arc<Self>) -> io::Result<AsyncDataWriter> {
        AsyncDataWriter::new(
            Arc::clone(self),
            self.filter_supplier.as_ref().map(|f| f.get_filter()),
            self.filter_supplier.as_ref().map_or(false, |f| f.wants_history()),
            self.buffer_count,
            self.buffer_size,
        )
    }

    /// Finish the file. All writers must have been closed first.
    pub fn close(&self) -> io::Result<()> {
        if let Some(fs) = self.filter_supplier.as_ref() {
            let trailer = fs.closing_bytes();
            if !trailer.is_empty() {
                let (physical, _) = self.advance(trailer.len() as u64, 0);
                self.file.write_all_at(&trailer, physical)?;
            }
        }
        self.file.sync_all()
    }
}

// ---------------------------------------------------------------------------
// Per-worker async writer
// ---------------------------------------------------------------------------

struct WriteJob {
    data: Vec<u8>,
    len: usize,
    offset: u64,
}

pub struct AsyncDataWriter {
    supplier: Arc<DataWriterSupplier>,
    filter: Option<Box<dyn WriteFilter>>,
    buffer_size: usize,

    current: Vec<u8>,
    spare: Vec<Vec<u8>>,
    in_flight: usize,
    job_tx: Option<Sender<WriteJob>>,
    done_rx: Receiver<io::Result<Vec<u8>>>,
    thread: Option<JoinHandle<()>>,

    retain_history: bool,
    history: Vec<RetainedBatch>,
    closed: bool,
}

impl AsyncDataWriter {
    fn new(
        supplier: Arc<DataWriterSupplier>,
        filter: Option<Box<dyn WriteFilter>>,
        retain_history: bool,
        buffer_count: usize,
        buffer_size: usize,
    ) -> io::Result<Self> {
        let (job_tx, job_rx) = bounded::<WriteJob>(buffer_count);
        let (done_tx, done_rx) = bounded::<io::Result<Vec<u8>>>(buffer_count);
        let file = Arc::clone(&supplier.file);
        let thread = std::thread::Builder::new()
            .name("async-writer".to_string())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let result = file
                        .write_all_at(&job.data[..job.len], job.offset)
                        .map(|_| job.data);
                    if done_tx.send(result).is_err() {
                        return;
                    }
                }
            })?;
        Ok(AsyncDataWriter {
            supplier,
            filter,
            buffer_size,
            current: Vec::with_capacity(buffer_size),
            spare: (1..buffer_count)
                .map(|_| Vec::with_capacity(buffer_size))
                .collect(),
            in_flight: 0,
            job_tx: Some(job_tx),
            done_rx,
            thread: Some(thread),
            retain_history,
            history: Vec::new(),
            closed: false,
        })
    }

    /// Append one record. `location` is its (global) genome location, 0
    /// for unmapped; filters see it via on_advance.
    pub fn append(&mut self, bytes: &[u8], location: u32) -> io::Result<()> {
        if self.current.len() + bytes.len() > self.buffer_size && !self.current.is_empty() {
            self.next_batch()?;
        }
        if let Some(filter) = self.filter.as_mut() {
            filter.on_advance(self.current.len(), bytes.len(), location);
        }
        self.current.extend_from_slice(bytes);
        Ok(())
    }

    /// Append bytes that aren't a record (the file header); record-level
    /// filters don't see them.
    pub fn append_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.current.len() + bytes.len() > self.buffer_size && !self.current.is_empty() {
            self.next_batch()?;
        }
        self.current.extend_from_slice(bytes);
        Ok(())
    }

    /// Flush the current buffer through the filter chain and hand it to
    /// the write thread.
    pub fn next_batch(&mut self) -> io::Result<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        let logical_used = self.current.len() as u64;
        let is_transform = self
            .filter
            .as_ref()
            .map_or(false, |f| f.kind() >= FilterKind::Copy);

        let (physical_offset, logical_offset, write_len, logical_snapshot) = if is_transform {
            // Logical space is known up front; physical space only once
            // the transform has run.
            let (_, logical) = self.supplier.advance(0, logical_used);
            let filter = self.filter.as_mut().unwrap();
            let mut ctx = FilterContext {
                current: &mut self.current,
                history: &self.history,
                logical_offset: logical,
                physical_offset: None,
                logical_snapshot: None,
            };
            filter.on_next_batch(&mut ctx)?;
            let snapshot = ctx.logical_snapshot.take();
            let physical_used = self.current.len() as u64;
            let (physical, _) = self.supplier.advance(physical_used, 0);
            filter.on_batch_written(physical, logical);
            (physical, logical, physical_used as usize, snapshot)
        } else {
            let (physical, logical) = self.supplier.advance(logical_used, logical_used);
            if let Some(filter) = self.filter.as_mut() {
                let mut ctx = FilterContext {
                    current: &mut self.current,
                    history: &self.history,
                    logical_offset: logical,
                    physical_offset: Some(physical),
                    logical_snapshot: None,
                };
                filter.on_next_batch(&mut ctx)?;
                filter.on_batch_written(physical, logical);
            }
            (physical, logical, self.current.len(), None)
        };

        // Rotate buffers: reclaim one from the writer thread if the pool
        // ran dry.
        let mut next = match self.spare.pop() {
            Some(buf) => buf,
            None => {
                let buf = self
                    .done_rx
                    .recv()
                    .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer thread died"))??;
                self.in_flight -= 1;
                buf
            }
        };
        next.clear();
        let full = std::mem::replace(&mut self.current, next);

        if self.retain_history {
            // Keep the (post-modify) logical bytes for look-back filters.
            let logical_copy = match logical_snapshot {
                Some(snapshot) => snapshot,
                None => full.clone(),
            };
            self.history.clear();
            self.history.push(RetainedBatch {
                logical_offset,
                data: logical_copy,
            });
        }

        self.job_tx
            .as_ref()
            .expect("writer already closed")
            .send(WriteJob {
                data: full,
                len: write_len,
                offset: physical_offset,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer thread died"))?;
        self.in_flight += 1;
        Ok(())
    }

    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.next_batch()?;
        self.job_tx = None;
        let mut result = Ok(());
        while self.in_flight > 0 {
            match self.done_rx.recv() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => result = Err(e),
                Err(_) => break,
            }
            self.in_flight -= 1;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.closed = true;
        result
    }
}

impl Drop for AsyncDataWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                log::error!("async writer close failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_writer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let supplier = DataWriterSupplier::create(&path, None, 2, 1024).unwrap();
        let mut writer = supplier.get_writer().unwrap();
        let mut expect = Vec::new();
        for i in 0..100u32 {
            let rec = format!("record {:04}\n", i).into_bytes();
            expect.extend_from_slice(&rec);
            writer.append(&rec, i).unwrap();
        }
        writer.close().unwrap();
        supplier.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), expect);
    }

    #[test]
    fn parallel_writers_share_offsets_without_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let supplier = DataWriterSupplier::create(&path, None, 2, 256).unwrap();
        let mut handles = Vec::new();
        for t in 0..4 {
            let mut writer = supplier.get_writer().unwrap();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let rec = format!("w{}r{:03}\n", t, i).into_bytes();
                    writer.append(&rec, 0).unwrap();
                }
                writer.close().unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        supplier.close().unwrap();
        let written = std::fs::read(&path).unwrap();
        // Every record appears exactly once, nothing torn.
        let text = String::from_utf8(written).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 800);
        lines.sort_unstable();
        lines.dedup();
        assert_eq!(lines.len(), 800);
    }

    struct CountingFilter {
        records: Arc<Mutex<usize>>,
        batches: Arc<Mutex<usize>>,
    }

    impl WriteFilter for CountingFilter {
        fn kind(&self) -> FilterKind {
            FilterKind::Read
        }

        fn on_advance(&mut self, _offset: usize, _bytes: usize, _location: u32) {
            *self.records.lock().unwrap() += 1;
        }

        fn on_next_batch(&mut self, _ctx: &mut FilterContext<'_>) -> io::Result<()> {
            *self.batches.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct CountingSupplier {
        records: Arc<Mutex<usize>>,
        batches: Arc<Mutex<usize>>,
    }

    impl FilterSupplier for CountingSupplier {
        fn kind(&self) -> FilterKind {
            FilterKind::Read
        }

        fn get_filter(&self) -> Box<dyn WriteFilter> {
            Box::new(CountingFilter {
                records: Arc::clone(&self.records),
                batches: Arc::clone(&self.batches),
            })
        }
    }

    struct UppercaseTransform;

    impl WriteFilter for UppercaseTransform {
        fn kind(&self) -> FilterKind {
            FilterKind::Transform
        }

        fn on_next_batch(&mut self, ctx: &mut FilterContext<'_>) -> io::Result<()> {
            let transformed: Vec<u8> = ctx.current.iter().map(|b| b.to_ascii_uppercase()).collect();
            *ctx.current = transformed;
            Ok(())
        }
    }

    struct UppercaseSupplier;

    impl FilterSupplier for UppercaseSupplier {
        fn kind(&self) -> FilterKind {
            FilterKind::Transform
        }

        fn get_filter(&self) -> Box<dyn WriteFilter> {
            Box::new(UppercaseTransform)
        }

        fn closing_bytes(&self) -> Vec<u8> {
            b"<eof>".to_vec()
        }
    }

    #[test]
    fn read_filter_sees_every_record_and_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let records = Arc::new(Mutex::new(0));
        let batches = Arc::new(Mutex::new(0));
        let supplier = DataWriterSupplier::create(
            &path,
            Some(Arc::new(CountingSupplier {
                records: Arc::clone(&records),
                batches: Arc::clone(&batches),
            })),
            2,
            128,
        )
        .unwrap();
        let mut writer = supplier.get_writer().unwrap();
        for _ in 0..50 {
            writer.append(b"0123456789", 0).unwrap();
        }
        writer.close().unwrap();
        supplier.close().unwrap();
        assert_eq!(*records.lock().unwrap(), 50);
        // 500 bytes at 128 per batch -> at least 4 flushes.
        assert!(*batches.lock().unwrap() >= 4);
    }

    #[test]
    fn transform_filter_replaces_contents_and_close_appends_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let supplier =
            DataWriterSupplier::create(&path, Some(Arc::new(UppercaseSupplier)), 2, 1024).unwrap();
        let mut writer = supplier.get_writer().unwrap();
        writer.append(b"hello filter world\n", 0).unwrap();
        writer.close().unwrap();
        supplier.close().unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, b"HELLO FILTER WORLD\n<eof>");
    }

    #[test]
    fn compose_orders_a_then_b() {
        let a = Arc::new(UppercaseSupplier) as Arc<dyn FilterSupplier>;
        let records = Arc::new(Mutex::new(0));
        let batches = Arc::new(Mutex::new(0));
        let b = Arc::new(CountingSupplier {
            records: Arc::clone(&records),
            batches: Arc::clone(&batches),
        }) as Arc<dyn FilterSupplier>;
        let composed = compose(b, a);
        assert_eq!(composed.kind(), FilterKind::Transform);
    }
}
