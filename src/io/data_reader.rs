// Buffered batch readers. Both implementations honor the same contract:
// bytes arrive in fixed-size batches with monotonically increasing batch
// ids, each batch ends with `overflow` bytes that reappear at the start
// of the next batch (so a record straddling the boundary is visible as
// contiguous memory), and a batch's buffer is only recycled once every
// consumer of its reads has released it.

use crate::read::DataBatch;
use crossbeam_channel::{bounded, Receiver, Sender};
use memmap2::Mmap;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// A view of the current batch from the consumer's position onward.
pub struct DataSlice<'a> {
    pub bytes: &'a [u8],
    /// How many of `bytes` may begin a new record; the rest is overflow
    /// shared with the next batch.
    pub start_bytes: usize,
}

/// Cross-thread handle for releasing batches: workers finish reads long
/// after the reader thread moved on, and their release is what lets the
/// reader recycle (or advance past) old buffers.
pub trait BatchRelease: Send + Sync {
    fn release_before(&self, batch: DataBatch);
}

pub type ReleaseHandle = Arc<dyn BatchRelease>;

pub trait DataReader: Send {
    /// Position the reader over `[start, start+amount)` of the file
    /// (amount 0 = to the end) and begin read-ahead.
    fn reinit(&mut self, start: u64, amount: u64) -> io::Result<()>;

    /// Peek at up to `wanted` bytes from the start of the readable range
    /// without consuming them.
    fn read_header(&mut self, wanted: usize) -> io::Result<Vec<u8>>;

    /// The unconsumed bytes of the current batch, or None when the batch
    /// is exhausted (call `next_batch`) or everything was delivered.
    fn get_data(&mut self) -> io::Result<Option<DataSlice<'_>>>;

    fn advance(&mut self, bytes: usize);

    /// Move to the next batch, carrying consumed-overflow state over.
    /// With `keep_open` the finished batch stays referenced until an
    /// explicit `release_before`.
    fn next_batch(&mut self, keep_open: bool) -> io::Result<()>;

    fn is_eof(&self) -> bool;

    fn batch(&self) -> DataBatch;

    fn release_before(&mut self, batch: DataBatch) {
        self.release_handle().release_before(batch);
    }

    fn release_handle(&self) -> ReleaseHandle;

    /// Scratch storage associated with the current batch.
    fn extra(&mut self) -> &mut [u8];

    fn file_offset(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Overlapped reader: a background thread keeps a small ring of buffers in
// flight ahead of the consumer.
// ---------------------------------------------------------------------------

struct FilledBuffer {
    data: Vec<u8>,
    valid: usize,
    start_bytes: usize,
    batch_id: u32,
    file_offset: u64,
    is_eof: bool,
    extra: Vec<u8>,
}

struct OverlappedRelease {
    retired: Mutex<VecDeque<FilledBuffer>>,
    empty_tx: Mutex<Option<Sender<FilledBuffer>>>,
}

impl BatchRelease for OverlappedRelease {
    fn release_before(&self, batch: DataBatch) {
        let mut retired = self.retired.lock().unwrap();
        let tx = self.empty_tx.lock().unwrap();
        while let Some(front) = retired.front() {
            if front.batch_id < batch.batch_id {
                let buf = retired.pop_front().unwrap();
                if let Some(tx) = tx.as_ref() {
                    // A send failure just means the reader already shut
                    // down; the buffer is dropped.
                    let _ = tx.send(buf);
                }
            } else {
                break;
            }
        }
    }
}

pub struct OverlappedDataReader {
    file: Arc<File>,
    file_len: u64,
    file_id: u32,
    buffer_size: usize,
    overflow: usize,
    extra_bytes: usize,
    next_batch_id: u32,

    filled_rx: Option<Receiver<io::Result<FilledBuffer>>>,
    reader_thread: Option<JoinHandle<()>>,
    release: Arc<OverlappedRelease>,

    current: Option<FilledBuffer>,
    offset: usize,
}

impl OverlappedDataReader {
    pub fn open(path: &Path, overflow: usize, extra_factor: f64) -> io::Result<Self> {
        Self::with_buffer_size(path, overflow, extra_factor, crate::defaults::IO_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        path: &Path,
        overflow: usize,
        extra_factor: f64,
        buffer_size: usize,
    ) -> io::Result<Self> {
        debug_assert!(extra_factor >= 0.0);
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let extra_bytes = ((buffer_size + overflow) as f64 * extra_factor) as usize;
        Ok(OverlappedDataReader {
            file: Arc::new(file),
            file_len,
            file_id: 0,
            buffer_size,
            overflow,
            extra_bytes,
            next_batch_id: 1,
            filled_rx: None,
            reader_thread: None,
            release: Arc::new(OverlappedRelease {
                retired: Mutex::new(VecDeque::new()),
                empty_tx: Mutex::new(None),
            }),
            current: None,
            offset: 0,
        })
    }

    pub fn set_file_id(&mut self, file_id: u32) {
        self.file_id = file_id;
    }

    fn shutdown_reader(&mut self) {
        *self.release.empty_tx.lock().unwrap() = None;
        self.filled_rx = None;
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        self.release.retired.lock().unwrap().clear();
        self.current = None;
    }

    fn current(&self) -> &FilledBuffer {
        self.current.as_ref().expect("reader not initialized; call reinit first")
    }
}

impl Drop for OverlappedDataReader {
    fn drop(&mut self) {
        self.shutdown_reader();
    }
}

impl DataReader for OverlappedDataReader {
    fn reinit(&mut self, start: u64, amount: u64) -> io::Result<()> {
        self.shutdown_reader();

        let n_buffers = crate::defaults::IO_BUFFER_COUNT;
        let (empty_tx, empty_rx) = bounded::<FilledBuffer>(n_buffers);
        let (filled_tx, filled_rx) = bounded::<io::Result<FilledBuffer>>(n_buffers);
        for _ in 0..n_buffers {
            empty_tx
                .send(FilledBuffer {
                    data: vec![0; self.buffer_size],
                    valid: 0,
                    start_bytes: 0,
                    batch_id: 0,
                    file_offset: 0,
                    is_eof: false,
                    extra: vec![0; self.extra_bytes],
                })
                .expect("seeding empty-buffer channel");
        }
        *self.release.empty_tx.lock().unwrap() = Some(empty_tx);

        let file = Arc::clone(&self.file);
        let file_len = self.file_len;
        let buffer_size = self.buffer_size;
        let overflow = self.overflow;
        let mut next_id = self.next_batch_id;
        let ending = if amount == 0 {
            file_len
        } else {
            file_len.min(start + amount)
        };

        let handle = std::thread::Builder::new()
            .name("overlapped-reader".to_string())
            .spawn(move || {
                let mut read_offset = start;
                let final_offset = file_len.min(ending + overflow as u64);
                let final_start = file_len.min(ending);
                while let Ok(mut buf) = empty_rx.recv() {
                    buf.batch_id = next_id;
                    next_id += 1;
                    buf.file_offset = read_offset;
                    if read_offset >= final_start {
                        buf.valid = 0;
                        buf.start_bytes = 0;
                        buf.is_eof = true;
                        if filled_tx.send(Ok(buf)).is_err() {
                            return;
                        }
                        continue;
                    }
                    let amount_to_read =
                        ((final_offset - read_offset) as usize).min(buffer_size);
                    buf.is_eof = read_offset + amount_to_read as u64 == final_offset;
                    buf.start_bytes = (buffer_size - overflow)
                        .min((final_start - read_offset) as usize);
                    match file.read_exact_at(&mut buf.data[..amount_to_read], read_offset) {
                        Ok(()) => {
                            buf.valid = amount_to_read;
                            read_offset += buf.start_bytes as u64;
                            if filled_tx.send(Ok(buf)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = filled_tx.send(Err(e));
                            return;
                        }
                    }
                }
            })?;

        self.reader_thread = Some(handle);
        // Wait for the first buffer so get_data never races the thread.
        self.current = Some(filled_rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "reader thread died during reinit")
        })??);
        self.next_batch_id = self.current.as_ref().unwrap().batch_id + 1;
        self.filled_rx = Some(filled_rx);
        self.offset = 0;
        Ok(())
    }

    fn read_header(&mut self, wanted: usize) -> io::Result<Vec<u8>> {
        let n = wanted.min(self.file_len as usize);
        let mut header = vec![0u8; n];
        self.file.read_exact_at(&mut header, 0)?;
        Ok(header)
    }

    fn get_data(&mut self) -> io::Result<Option<DataSlice<'_>>> {
        let offset = self.offset;
        let info = self.current();
        // Past the record-starting section: either the batch is done or
        // (at EOF) everything was delivered. The overflow tail beyond
        // start_bytes belongs to the next batch's section.
        if offset >= info.start_bytes {
            return Ok(None);
        }
        Ok(Some(DataSlice {
            bytes: &info.data[offset..info.valid],
            start_bytes: info.start_bytes - offset,
        }))
    }

    fn advance(&mut self, bytes: usize) {
        self.offset = (self.offset + bytes).min(self.current().valid);
    }

    fn next_batch(&mut self, keep_open: bool) -> io::Result<()> {
        let info = self.current();
        if info.is_eof {
            if !keep_open {
                let next = DataBatch::new(self.file_id, info.batch_id + 1);
                self.release.release_before(next);
            }
            return Ok(());
        }
        let overflow_consumed = self.offset.saturating_sub(info.start_bytes);

        let filled_rx = self
            .filled_rx
            .as_ref()
            .expect("reader not initialized; call reinit first");
        let next = filled_rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "reader thread died")
        })??;
        self.next_batch_id = next.batch_id + 1;

        let old = self.current.replace(next).unwrap();
        self.release.retired.lock().unwrap().push_back(old);
        self.offset = overflow_consumed;

        if !keep_open {
            let current = DataBatch::new(self.file_id, self.current().batch_id);
            self.release.release_before(current);
        }
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.current().is_eof
    }

    fn batch(&self) -> DataBatch {
        DataBatch::new(self.file_id, self.current().batch_id)
    }

    fn release_handle(&self) -> ReleaseHandle {
        Arc::clone(&self.release) as ReleaseHandle
    }

    fn extra(&mut self) -> &mut [u8] {
        let buf = self.current.as_mut().expect("reader not initialized");
        &mut buf.extra
    }

    fn file_offset(&self) -> u64 {
        let info = self.current();
        info.file_offset + self.offset as u64
    }
}

// ---------------------------------------------------------------------------
// Memory-mapped reader: the active range is mapped once and carved into
// logical batches; a single-waiter gate blocks the consumer when it runs
// too far ahead of releases.
// ---------------------------------------------------------------------------

struct MmapFlow {
    state: Mutex<MmapFlowState>,
    released: Condvar,
}

struct MmapFlowState {
    current_batch: u32,
    earliest_unreleased: u32,
}

impl BatchRelease for MmapFlow {
    fn release_before(&self, batch: DataBatch) {
        let mut state = self.state.lock().unwrap();
        if batch.batch_id > state.earliest_unreleased {
            state.earliest_unreleased = batch.batch_id.min(state.current_batch);
            self.released.notify_all();
        }
    }
}

pub struct MemMapDataReader {
    file: File,
    file_len: u64,
    file_id: u32,
    batch_count: usize,
    batch_size: usize,
    overflow: usize,
    batch_extra: usize,

    map: Option<Mmap>,
    map_delta: usize,
    map_offset: u64,
    map_start_size: usize,
    map_size: usize,

    offset: usize,
    start_bytes: usize,
    valid_bytes: usize,
    flow: Arc<MmapFlow>,
    extra: Vec<u8>,
}

impl MemMapDataReader {
    pub fn open(path: &Path, overflow: usize, extra_factor: f64) -> io::Result<Self> {
        Self::with_batch_size(
            path,
            overflow,
            extra_factor,
            crate::defaults::MMAP_BATCH_SIZE,
            crate::defaults::MMAP_BATCH_COUNT,
        )
    }

    pub fn with_batch_size(
        path: &Path,
        overflow: usize,
        extra_factor: f64,
        batch_size: usize,
        batch_count: usize,
    ) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let batch_extra = ((batch_size + overflow) as f64 * extra_factor) as usize;
        Ok(MemMapDataReader {
            file,
            file_len,
            file_id: 0,
            batch_count,
            batch_size,
            overflow,
            batch_extra,
            map: None,
            map_delta: 0,
            map_offset: 0,
            map_start_size: 0,
            map_size: 0,
            offset: 0,
            start_bytes: 0,
            valid_bytes: 0,
            flow: Arc::new(MmapFlow {
                state: Mutex::new(MmapFlowState {
                    current_batch: 1,
                    earliest_unreleased: 1,
                }),
                released: Condvar::new(),
            }),
            extra: vec![0; batch_count * batch_extra],
        })
    }

    pub fn set_file_id(&mut self, file_id: u32) {
        self.file_id = file_id;
    }

    fn current_batch(&self) -> u32 {
        self.flow.state.lock().unwrap().current_batch
    }

    fn page_size() -> u64 {
        // SAFETY: sysconf with a valid name has no preconditions.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
    }
}

impl DataReader for MemMapDataReader {
    fn reinit(&mut self, start: u64, amount: u64) -> io::Result<()> {
        self.map = None;
        let start_size = if amount == 0 {
            self.file_len.saturating_sub(start)
        } else {
            amount.min(self.file_len.saturating_sub(start))
        };
        let total = (start_size + self.overflow as u64).min(self.file_len.saturating_sub(start));
        if total == 0 {
            // Empty range; report immediate EOF rather than mapping
            // nothing.
            self.map = None;
            self.map_start_size = 0;
            self.map_size = 0;
            self.offset = 0;
            self.start_bytes = 0;
            self.valid_bytes = 0;
            let mut state = self.flow.state.lock().unwrap();
            state.current_batch = 1;
            state.earliest_unreleased = 1;
            return Ok(());
        }

        let page = Self::page_size();
        let aligned = start / page * page;
        let delta = (start - aligned) as usize;
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(aligned)
                .len(total as usize + delta)
                .map(&self.file)
        }
        .map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("failed to map input at {}+{}: {}", start, total, e),
            )
        })?;

        self.map = Some(map);
        self.map_delta = delta;
        self.map_offset = start;
        self.map_start_size = start_size as usize;
        self.map_size = total as usize;
        self.offset = 0;
        self.start_bytes = self.map_start_size.min(self.batch_size);
        self.valid_bytes = self.map_size.min(self.batch_size + self.overflow);
        {
            let mut state = self.flow.state.lock().unwrap();
            state.current_batch = 1;
            state.earliest_unreleased = 1;
        }
        self.flow.released.notify_all();
        Ok(())
    }

    fn read_header(&mut self, wanted: usize) -> io::Result<Vec<u8>> {
        let n = wanted.min(self.file_len as usize);
        let mut header = vec![0u8; n];
        self.file.read_exact_at(&mut header, 0)?;
        Ok(header)
    }

    fn get_data(&mut self) -> io::Result<Option<DataSlice<'_>>> {
        // Gate: don't run more than batch_count batches ahead of the
        // slowest release.
        {
            let mut state = self.flow.state.lock().unwrap();
            while state.current_batch - state.earliest_unreleased >= self.batch_count as u32 {
                state = self.flow.released.wait(state).unwrap();
            }
        }
        if self.offset >= self.start_bytes {
            return Ok(None);
        }
        let batch = self.current_batch() as usize;
        let base = self.map_delta + (batch - 1) * self.batch_size;
        let map = self.map.as_ref().expect("reader not initialized");
        let lo = base + self.offset;
        let hi = base + self.valid_bytes;
        Ok(Some(DataSlice {
            bytes: &map[lo..hi],
            start_bytes: self.start_bytes - self.offset,
        }))
    }

    fn advance(&mut self, bytes: usize) {
        self.offset = (self.offset + bytes).min(self.valid_bytes);
    }

    fn next_batch(&mut self, keep_open: bool) -> io::Result<()> {
        if self.is_eof() {
            return Ok(());
        }
        let overflow_consumed = self.offset.saturating_sub(self.start_bytes);
        let batch = {
            let mut state = self.flow.state.lock().unwrap();
            state.current_batch += 1;
            if !keep_open {
                state.earliest_unreleased = state.current_batch;
                self.flow.released.notify_all();
            }
            state.current_batch as usize
        };
        self.offset = overflow_consumed;
        self.start_bytes = self
            .batch_size
            .min(self.map_start_size.saturating_sub((batch - 1) * self.batch_size));
        self.valid_bytes = (self.batch_size + self.overflow)
            .min(self.map_size.saturating_sub((batch - 1) * self.batch_size));
        Ok(())
    }

    fn is_eof(&self) -> bool {
        self.current_batch() as usize * self.batch_size >= self.map_size
    }

    fn batch(&self) -> DataBatch {
        DataBatch::new(self.file_id, self.current_batch())
    }

    fn release_handle(&self) -> ReleaseHandle {
        Arc::clone(&self.flow) as ReleaseHandle
    }

    fn extra(&mut self) -> &mut [u8] {
        if self.batch_extra == 0 {
            return &mut [];
        }
        let index = (self.current_batch() as usize - 1) % self.batch_count;
        &mut self.extra[index * self.batch_extra..(index + 1) * self.batch_extra]
    }

    fn file_offset(&self) -> u64 {
        self.map_offset + ((self.current_batch() as usize - 1) * self.batch_size + self.offset) as u64
    }
}
