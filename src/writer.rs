//! Dedicated writer task for frame sending.
//!
//! Each connection runs one writer task fed by an mpsc channel of pooled
//! send events. Handlers and the public send methods never touch the socket
//! directly; they stage a frame into a rented event and queue it.
//!
//! ```text
//! send_to ──┐
//! handler ──┼─► mpsc::Sender<PooledEvent> ─► writer task ─► transport
//! reply ────┘
//! ```
//!
//! The task batches whatever is already queued into a single vectored write,
//! and every event returns to its pool when the write (or the failure path)
//! drops it. A pending-frame gauge bounds how far producers may run ahead of
//! the socket.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::SendError;
use crate::pool::PooledEvent;

/// Default maximum pending frames before the queue pushes back.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default bound on waiting for queue space.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames folded into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before senders wait.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// How long a sender waits for queue space before giving up.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for queueing frames onto the writer task. Cheaply cloneable.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<PooledEvent>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a staged frame, waiting out backpressure up to the configured
    /// bound.
    pub async fn send(&self, event: PooledEvent) -> Result<(), SendError> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_space().await?;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(event).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            SendError::Disposed
        })
    }

    /// Queue a staged frame without waiting. Fails with `Unknown` when the
    /// queue is at capacity.
    pub fn try_send(&self, event: PooledEvent) -> Result<(), SendError> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            return Err(SendError::Unknown);
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(event).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => SendError::Unknown,
                mpsc::error::TrySendError::Closed(_) => SendError::Disposed,
            }
        })
    }

    async fn wait_for_space(&self) -> Result<(), SendError> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);
        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(SendError::Unknown);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the queue is at capacity.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }
}

/// Spawn the writer task over `writer` and return the queue handle plus the
/// task's join handle.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<std::io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: Arc::clone(&pending),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));
    (handle, task)
}

/// Receive staged frames and write them out in batches.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<PooledEvent>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(ev) => ev,
            // all senders gone, clean shutdown
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(ev) => batch.push(ev),
                Err(_) => break,
            }
        }

        let batch_len = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_len, Ordering::Release);
        // dropping the batch returns every event to its pool
        drop(batch);
        result?;
    }
}

/// Write a batch of frames with a single vectored write where the kernel
/// buffer allows, continuing past partial writes otherwise.
async fn write_batch<W>(writer: &mut W, batch: &[PooledEvent]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let slices: Vec<IoSlice<'_>> = batch
        .iter()
        .filter(|ev| !ev.is_empty())
        .map(|ev| IoSlice::new(ev.bytes()))
        .collect();
    if slices.is_empty() {
        return Ok(());
    }
    let total: usize = batch.iter().map(|ev| ev.len()).sum();

    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        ));
    }

    while written < total {
        let remaining = build_remaining_slices(batch, written);
        let n = writer.write_vectored(&remaining).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        written += n;
    }

    writer.flush().await
}

/// Rebuild the slice list after a partial write of `skip_bytes`.
fn build_remaining_slices(batch: &[PooledEvent], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut passed = 0;
    for ev in batch {
        let end = passed + ev.len();
        if skip_bytes < end {
            let start_within = skip_bytes.saturating_sub(passed);
            slices.push(IoSlice::new(&ev.bytes()[start_within..]));
        }
        passed = end;
    }
    slices
}
