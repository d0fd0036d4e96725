//! Bounded chunk queues for the capture and playback directions
//!
//! The two directions deliberately differ under pressure: the capture queue
//! evicts its oldest chunks so the freshest microphone audio always gets in,
//! while the playback queue blocks the producer so rendered speech is never
//! dropped. Do not unify them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// FIFO of byte chunks with a total-byte budget
#[derive(Debug, Default)]
struct ChunkQueue {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
}

impl ChunkQueue {
    fn push_back(&mut self, chunk: Vec<u8>) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    fn pop_front(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.bytes -= chunk.len();
        Some(chunk)
    }

    /// Pop at most `max_bytes`, splitting the head chunk if needed.
    fn pop_up_to(&mut self, max_bytes: usize) -> Option<Vec<u8>> {
        let mut head = self.pop_front()?;
        if head.len() > max_bytes {
            let rest = head.split_off(max_bytes);
            self.bytes += rest.len();
            self.chunks.push_front(rest);
        }
        Some(head)
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

/// Capture-direction queue: evict-oldest under pressure.
///
/// Single producer (the frame-received path) and single consumer (the audio
/// read path); the internal lock is held only across the evict+insert or pop
/// sequence, never across a wait.
#[derive(Debug)]
pub struct CaptureBuffer {
    inner: Mutex<ChunkQueue>,
    available: Notify,
    capacity: usize,
}

impl CaptureBuffer {
    /// Create a queue with the given total-byte capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ChunkQueue::default()),
            available: Notify::new(),
            capacity,
        }
    }

    /// Insert a chunk, evicting the oldest buffered chunks if there is not
    /// enough free space. Always succeeds; a chunk larger than the whole
    /// queue is dropped with a diagnostic.
    pub async fn push(&self, chunk: Vec<u8>) {
        if chunk.len() > self.capacity {
            tracing::warn!(
                len = chunk.len(),
                capacity = self.capacity,
                "capture chunk exceeds queue capacity, dropping"
            );
            return;
        }
        {
            let mut q = self.inner.lock().await;
            while self.capacity - q.bytes < chunk.len() {
                // Favor recency: the oldest audio is the least useful
                let evicted = q.pop_front();
                debug_assert!(evicted.is_some());
                if evicted.is_none() {
                    break;
                }
            }
            q.push_back(chunk);
        }
        self.available.notify_one();
    }

    /// Pop up to `max_bytes` of the oldest buffered audio, waiting at most
    /// `timeout` for data. Returns `None` on timeout.
    pub async fn read(&self, max_bytes: usize, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            {
                let mut q = self.inner.lock().await;
                if let Some(chunk) = q.pop_up_to(max_bytes) {
                    return Some(chunk);
                }
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Drain and discard everything buffered.
    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    /// Total buffered bytes.
    pub async fn len_bytes(&self) -> usize {
        self.inner.lock().await.bytes
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.chunks.is_empty()
    }
}

/// Playback-direction queue: block the producer under pressure.
///
/// `push` waits for free space instead of dropping, so backpressure reaches
/// the network/decode path. The pacing tick drains with `try_pop`.
#[derive(Debug)]
pub struct PlaybackBuffer {
    inner: Mutex<ChunkQueue>,
    space: Notify,
    capacity: usize,
    /// Bumped by `clear`; a push that started before the flush must not land
    /// its chunk in the flushed queue
    epoch: AtomicU64,
}

impl PlaybackBuffer {
    /// Create a queue with the given total-byte capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ChunkQueue::default()),
            space: Notify::new(),
            capacity,
            epoch: AtomicU64::new(0),
        }
    }

    /// Insert a chunk, waiting until the queue has room.
    ///
    /// Never drops under pressure. If the queue is flushed while this call is
    /// in flight, the chunk belongs to the flushed stream and is discarded.
    pub async fn push(&self, chunk: Vec<u8>) {
        let mut chunk = chunk;
        if chunk.len() > self.capacity {
            tracing::warn!(
                len = chunk.len(),
                capacity = self.capacity,
                "playback chunk exceeds queue capacity, truncating"
            );
            chunk.truncate(self.capacity);
        }
        let epoch = self.epoch.load(Ordering::Acquire);
        loop {
            let notified = self.space.notified();
            {
                let mut q = self.inner.lock().await;
                if self.epoch.load(Ordering::Acquire) != epoch {
                    tracing::debug!(len = chunk.len(), "dropping chunk queued across a flush");
                    return;
                }
                if self.capacity - q.bytes >= chunk.len() {
                    q.push_back(chunk);
                    return;
                }
            }
            notified.await;
        }
    }

    /// Pop up to `max_bytes` without waiting.
    pub async fn try_pop(&self, max_bytes: usize) -> Option<Vec<u8>> {
        let chunk = self.inner.lock().await.pop_up_to(max_bytes);
        if chunk.is_some() {
            self.space.notify_one();
        }
        chunk
    }

    /// Flush everything queued. Called when playback is disabled, not when
    /// the producer stops. Producers blocked in [`push`](Self::push) wake and
    /// discard their chunk.
    pub async fn clear(&self) {
        let mut q = self.inner.lock().await;
        q.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        drop(q);
        self.space.notify_waiters();
    }

    /// Total buffered bytes.
    pub async fn len_bytes(&self) -> usize {
        self.inner.lock().await.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_eviction_keeps_newest() {
        let buf = CaptureBuffer::new(100);
        buf.push(vec![1u8; 60]).await;
        assert_eq!(buf.len_bytes().await, 60);

        // 40 free; the second 60-byte chunk evicts the first entirely
        buf.push(vec![2u8; 60]).await;
        assert_eq!(buf.len_bytes().await, 60);

        let chunk = buf.read(512, Duration::from_millis(10)).await.unwrap();
        assert_eq!(chunk, vec![2u8; 60]);
        assert!(buf.is_empty().await);
    }

    #[tokio::test]
    async fn test_capture_eviction_ordering() {
        let buf = CaptureBuffer::new(100);
        for tag in 0u8..10 {
            buf.push(vec![tag; 30]).await;
        }
        // Only the last three 30-byte chunks fit; oldest-first readout
        let mut tags = Vec::new();
        while let Some(chunk) = buf.read(512, Duration::from_millis(5)).await {
            tags.push(chunk[0]);
        }
        assert_eq!(tags, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_capture_read_timeout() {
        let buf = CaptureBuffer::new(100);
        let start = std::time::Instant::now();
        assert!(buf.read(512, Duration::from_millis(20)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_capture_read_split_chunk() {
        let buf = CaptureBuffer::new(100);
        buf.push((0u8..80).collect()).await;

        let first = buf.read(50, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 50);
        let second = buf.read(50, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.len(), 30);
        assert_eq!(second[0], 50);
    }

    #[tokio::test]
    async fn test_capture_wakes_blocked_reader() {
        let buf = std::sync::Arc::new(CaptureBuffer::new(100));
        let reader = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move { buf.read(512, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buf.push(vec![9u8; 10]).await;
        let got = reader.await.unwrap();
        assert_eq!(got.unwrap(), vec![9u8; 10]);
    }

    #[tokio::test]
    async fn test_playback_backpressure_blocks_then_drains() {
        let buf = std::sync::Arc::new(PlaybackBuffer::new(100));
        buf.push(vec![1u8; 100]).await;

        let producer = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move {
                buf.push(vec![2u8; 50]).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "push must block while full");

        // Draining makes room; the blocked producer completes, nothing dropped
        let drained = buf.try_pop(60).await.unwrap();
        assert_eq!(drained.len(), 60);
        producer.await.unwrap();
        assert_eq!(buf.len_bytes().await, 90);
    }

    #[tokio::test]
    async fn test_playback_try_pop_empty() {
        let buf = PlaybackBuffer::new(100);
        assert!(buf.try_pop(40).await.is_none());
    }

    #[tokio::test]
    async fn test_playback_clear_discards_blocked_push() {
        let buf = std::sync::Arc::new(PlaybackBuffer::new(50));
        buf.push(vec![1u8; 50]).await;
        let producer = {
            let buf = std::sync::Arc::clone(&buf);
            tokio::spawn(async move { buf.push(vec![2u8; 50]).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The flush unblocks the producer, and the chunk it was holding goes
        // with the flushed stream instead of surfacing after re-enable
        buf.clear().await;
        producer.await.unwrap();
        assert_eq!(buf.len_bytes().await, 0);

        // Pushes that start after the flush land normally
        buf.push(vec![3u8; 20]).await;
        assert_eq!(buf.try_pop(50).await.unwrap(), vec![3u8; 20]);
    }
}
