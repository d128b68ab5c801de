//! Dedicated writer task for connection frames.
//!
//! Every call running on a connection pushes its frames into one mpsc
//! channel; a single task drains it and writes whatever is queued with one
//! vectored write.
//!
//! ```text
//! call 1 ─┐
//! call 2 ─┼─► WriterHandle ─► mpsc ─► writer task ─► socket
//! call N ─┘
//! ```
//!
//! The handle counts frames that were queued but not yet written. Once that
//! count reaches `max_pending_frames`, `send` waits for the writer to catch
//! up and fails with `BackpressureTimeout` if it does not within
//! `backpressure_timeout`.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::error::{LinkwireError, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames gathered into one write.
const MAX_WRITE_BATCH: usize = 64;

/// A frame with its header already encoded.
#[derive(Debug)]
pub struct OutboundFrame {
    pub header: [u8; HEADER_SIZE],
    pub payload: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header.encode(),
            payload: frame.payload,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_pending_frames: usize,
    pub channel_capacity: usize,
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

struct Pending {
    count: AtomicUsize,
    drained: Notify,
}

/// Cloneable handle feeding the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    pending: Arc<Pending>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting out backpressure.
    pub async fn send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.is_backpressure_active() {
            tokio::time::timeout(self.timeout, self.wait_for_drain())
                .await
                .map_err(|_| LinkwireError::BackpressureTimeout)?;
        }

        self.pending.count.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame.into()).await.map_err(|_| {
            self.pending.count.fetch_sub(1, Ordering::AcqRel);
            LinkwireError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting; fails if backpressure is active.
    pub fn try_send(&self, frame: impl Into<OutboundFrame>) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(LinkwireError::BackpressureTimeout);
        }

        self.pending.count.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame.into()).map_err(|e| {
            self.pending.count.fetch_sub(1, Ordering::AcqRel);
            match e {
                mpsc::error::TrySendError::Full(_) => LinkwireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => LinkwireError::ConnectionClosed,
            }
        })
    }

    async fn wait_for_drain(&self) {
        loop {
            let drained = self.pending.drained.notified();
            if !self.is_backpressure_active() {
                return;
            }
            drained.await;
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }
}

/// Spawn the writer task over `writer`.
///
/// The task ends with `Ok(())` once every handle is dropped, or with the
/// first write error.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(Pending {
        count: AtomicUsize::new(0),
        drained: Notify::new(),
    });

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames.max(1),
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<Pending>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_WRITE_BATCH);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_WRITE_BATCH {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let written = batch.len();
        let result = write_batch(&mut writer, &batch).await;
        batch.clear();
        pending.count.fetch_sub(written, Ordering::AcqRel);
        pending.drained.notify_waiters();
        result?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

/// Write `batch` with as few `write_vectored` calls as the sink allows.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut written = 0;

    while written < total {
        let slices = build_remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(LinkwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "connection stopped accepting bytes",
            )));
        }
        written += n;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything in `batch` after the first `skip` bytes.
fn build_remaining_slices(batch: &[OutboundFrame], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip < end {
                slices.push(IoSlice::new(&part[skip.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }

    slices
}
