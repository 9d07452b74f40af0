//! Append-only output logs with many independent tail-from-zero readers.
//!
//! Each job owns two of these (stdout, stderr). A single writer appends byte
//! chunks as they arrive from the helper's pipes; any number of readers walk
//! the buffer from offset zero, suspend at the tail while the log is open,
//! and observe end-of-stream once the log is closed and drained. The buffer
//! is never truncated for the life of the job, so a reader attached at any
//! moment sees the full history.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Upper bound on a single chunk handed to a reader.
const MAX_READ_CHUNK: usize = 64 * 1024;

pub struct OutputLog {
    inner: Mutex<LogInner>,
    /// Wakes parked readers after an append or close. Wake-ups are
    /// notifications, not handoffs: each reader re-reads its own cursor.
    notify: Notify,
    readers: AtomicUsize,
}

struct LogInner {
    buf: Vec<u8>,
    closed: bool,
}

impl OutputLog {
    pub fn new() -> Arc<Self> {
        Arc::new(OutputLog {
            inner: Mutex::new(LogInner {
                buf: Vec::new(),
                closed: false,
            }),
            notify: Notify::new(),
            readers: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a chunk and wake waiting readers. Appends after close are
    /// dropped; the reaper only closes a log once its pipe has drained.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.buf.extend_from_slice(bytes);
        }
        self.notify.notify_waiters();
    }

    /// Seal the log: length is final, drained readers see end-of-stream.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of everything appended so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().buf.clone()
    }

    /// Number of readers currently attached.
    pub fn attached_readers(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    /// New cursor positioned at offset zero.
    pub fn reader(self: &Arc<Self>) -> LogReader {
        self.readers.fetch_add(1, Ordering::SeqCst);
        LogReader {
            log: Arc::clone(self),
            pos: 0,
        }
    }
}

enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Pending,
}

/// Cursor over an [`OutputLog`]. Readers progress independently; dropping a
/// reader detaches it from the log.
pub struct LogReader {
    log: Arc<OutputLog>,
    pos: usize,
}

impl LogReader {
    /// Next chunk past the cursor. Returns `None` at end-of-stream (log
    /// closed and fully drained); suspends while caught up on an open log.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            // Register interest before checking state so an append or close
            // between the check and the await cannot be missed.
            let log = Arc::clone(&self.log);
            let notified = log.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.step() {
                ReadStep::Data(chunk) => return Some(chunk),
                ReadStep::Eof => return None,
                ReadStep::Pending => notified.await,
            }
        }
    }

    fn step(&mut self) -> ReadStep {
        let inner = self.log.lock();
        if self.pos < inner.buf.len() {
            let end = inner.buf.len().min(self.pos + MAX_READ_CHUNK);
            let chunk = inner.buf[self.pos..end].to_vec();
            self.pos = end;
            ReadStep::Data(chunk)
        } else if inner.closed {
            ReadStep::Eof
        } else {
            ReadStep::Pending
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        self.log.readers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(reader: &mut LogReader) -> Vec<u8> {
        let mut all = Vec::new();
        while let Some(chunk) = reader.next_chunk().await {
            all.extend_from_slice(&chunk);
        }
        all
    }

    #[tokio::test]
    async fn reader_sees_history_then_live_then_eof() {
        let log = OutputLog::new();
        log.append(b"before ");

        let mut reader = log.reader();
        assert_eq!(reader.next_chunk().await.as_deref(), Some(&b"before "[..]));

        log.append(b"after");
        assert_eq!(reader.next_chunk().await.as_deref(), Some(&b"after"[..]));

        log.close();
        assert_eq!(reader.next_chunk().await, None);
    }

    #[tokio::test]
    async fn reader_attached_after_close_sees_full_history() {
        let log = OutputLog::new();
        log.append(b"hello\n");
        log.close();

        let mut reader = log.reader();
        assert_eq!(drain(&mut reader).await, b"hello\n");
    }

    #[tokio::test]
    async fn closed_empty_log_is_immediate_eof() {
        let log = OutputLog::new();
        log.close();
        let mut reader = log.reader();
        assert_eq!(reader.next_chunk().await, None);
    }

    #[tokio::test]
    async fn parked_reader_wakes_on_append_and_close() {
        let log = OutputLog::new();
        let mut reader = log.reader();

        let writer = Arc::clone(&log);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(b"late");
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.close();
        });

        assert_eq!(drain(&mut reader).await, b"late");
        handle.await.expect("writer task");
    }

    #[tokio::test]
    async fn concurrent_readers_each_see_the_same_sequence() {
        let log = OutputLog::new();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mut reader = log.reader();
            handles.push(tokio::spawn(async move { drain(&mut reader).await }));
        }

        let writer = Arc::clone(&log);
        let feed = tokio::spawn(async move {
            for i in 0..50u8 {
                writer.append(&[i]);
                if i % 8 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            writer.close();
        });

        let expected: Vec<u8> = (0..50u8).collect();
        for handle in handles {
            assert_eq!(handle.await.expect("reader task"), expected);
        }
        feed.await.expect("writer task");
    }

    #[tokio::test]
    async fn appends_after_close_are_dropped() {
        let log = OutputLog::new();
        log.append(b"kept");
        log.close();
        log.append(b"dropped");
        assert_eq!(log.len(), 4);
    }

    #[tokio::test]
    async fn reader_count_tracks_attach_and_detach() {
        let log = OutputLog::new();
        assert_eq!(log.attached_readers(), 0);
        let a = log.reader();
        let b = log.reader();
        assert_eq!(log.attached_readers(), 2);
        drop(a);
        assert_eq!(log.attached_readers(), 1);
        drop(b);
        assert_eq!(log.attached_readers(), 0);
    }

    #[tokio::test]
    async fn large_appends_are_chunked_but_complete() {
        let log = OutputLog::new();
        let payload = vec![7u8; MAX_READ_CHUNK * 2 + 123];
        log.append(&payload);
        log.close();

        let mut reader = log.reader();
        let first = reader.next_chunk().await.expect("first chunk");
        assert_eq!(first.len(), MAX_READ_CHUNK);
        let mut all = first;
        while let Some(chunk) = reader.next_chunk().await {
            all.extend_from_slice(&chunk);
        }
        assert_eq!(all, payload);
    }
}
