//! Lock-free single-producer / single-consumer byte ring
//!
//! Both realtime pipelines in the engine are decoupled through this ring:
//! the recorder's USB reader feeds the disk writer through one, and the
//! realtime convolution worker feeds the audio output callback through
//! another. The ring never blocks, never allocates after construction and
//! never performs a syscall; a full ring results in a short write, an empty
//! ring in a short read.
//!
//! The ring is split into a [`RingProducer`] / [`RingConsumer`] pair over
//! shared storage so the single-writer-per-index invariant holds by
//! construction: only the producer can move the write index, only the
//! consumer can move the read index. One byte of capacity is reserved to
//! distinguish full from empty, so a ring of capacity `C` holds at most
//! `C - 1` bytes.
//!
//! Ordering contract: payload bytes are written before the write index is
//! published (release), and the consumer acquires the write index before
//! touching the payload. Symmetrically for the read index, so the producer
//! never overwrites bytes the consumer is still reading.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared ring storage. Indices are kept in `0..capacity`.
struct RingShared {
    buffer: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    /// Write index, owned by the producer
    write: AtomicUsize,
    /// Read index, owned by the consumer
    read: AtomicUsize,
}

// The UnsafeCell is only ever accessed in disjoint regions: the producer
// writes `[write, read)` (mod capacity), the consumer reads `[read, write)`.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    #[inline]
    fn used(&self, write: usize, read: usize) -> usize {
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    #[inline]
    fn free(&self, write: usize, read: usize) -> usize {
        self.capacity - self.used(write, read) - 1
    }
}

/// Byte ring factory
pub struct RingBuffer;

impl RingBuffer {
    /// Create a ring of the given capacity and split it into its two ends.
    ///
    /// Usable capacity is `capacity - 1` bytes.
    pub fn with_capacity(capacity: usize) -> (RingProducer, RingConsumer) {
        assert!(capacity >= 2, "ring capacity must be at least 2 bytes");
        let shared = Arc::new(RingShared {
            buffer: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
        });
        (
            RingProducer { shared: shared.clone() },
            RingConsumer { shared },
        )
    }
}

/// Writing end of the ring. Exactly one per ring.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

impl RingProducer {
    /// Copy up to `src.len()` bytes into the ring, returning how many were
    /// accepted. A full ring yields a short (possibly zero) write; the
    /// caller decides whether that is an overflow worth counting.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let shared = &*self.shared;
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);

        let to_write = src.len().min(shared.free(write, read));
        if to_write == 0 {
            return 0;
        }

        // Safety: the producer exclusively owns the region between `write`
        // and `read - 1`; the consumer will not read it until the release
        // store below publishes it.
        let buffer = unsafe { &mut *shared.buffer.get() };

        let first = to_write.min(shared.capacity - write);
        buffer[write..write + first].copy_from_slice(&src[..first]);
        if first < to_write {
            buffer[..to_write - first].copy_from_slice(&src[first..to_write]);
        }

        shared
            .write
            .store((write + to_write) % shared.capacity, Ordering::Release);
        to_write
    }

    /// Free space in bytes (relaxed snapshot)
    pub fn available_write(&self) -> usize {
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Relaxed);
        self.shared.free(write, read)
    }

    /// Metrics handle sharing this ring's storage
    pub fn metrics(&self) -> RingMetrics {
        RingMetrics { shared: self.shared.clone() }
    }
}

/// Reading end of the ring. Exactly one per ring.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

impl RingConsumer {
    /// Copy up to `dst.len()` bytes out of the ring, returning how many were
    /// produced. An empty ring yields a short (possibly zero) read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        let shared = &*self.shared;
        let read = shared.read.load(Ordering::Relaxed);
        let write = shared.write.load(Ordering::Acquire);

        let to_read = dst.len().min(shared.used(write, read));
        if to_read == 0 {
            return 0;
        }

        // Safety: the consumer exclusively owns `[read, write)`, published
        // by the producer's release store.
        let buffer = unsafe { &*shared.buffer.get() };

        let first = to_read.min(shared.capacity - read);
        dst[..first].copy_from_slice(&buffer[read..read + first]);
        if first < to_read {
            dst[first..to_read].copy_from_slice(&buffer[..to_read - first]);
        }

        shared
            .read
            .store((read + to_read) % shared.capacity, Ordering::Release);
        to_read
    }

    /// Discard up to `count` bytes without copying them out. Returns the
    /// number of bytes discarded. Used by the playback callback to drop
    /// stale audio after a worker restart.
    pub fn skip(&mut self, count: usize) -> usize {
        let shared = &*self.shared;
        let read = shared.read.load(Ordering::Relaxed);
        let write = shared.write.load(Ordering::Acquire);

        let to_skip = count.min(shared.used(write, read));
        if to_skip > 0 {
            shared
                .read
                .store((read + to_skip) % shared.capacity, Ordering::Release);
        }
        to_skip
    }

    /// Readable bytes (relaxed snapshot)
    pub fn available_read(&self) -> usize {
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Relaxed);
        self.shared.used(write, read)
    }

    /// Metrics handle sharing this ring's storage
    pub fn metrics(&self) -> RingMetrics {
        RingMetrics { shared: self.shared.clone() }
    }
}

/// Read-only view of a ring's fill state for polling from any thread.
///
/// Snapshots are relaxed: they are exact only once both ends are quiescent,
/// which is all the metrics surface needs.
#[derive(Clone)]
pub struct RingMetrics {
    shared: Arc<RingShared>,
}

impl RingMetrics {
    pub fn available_read(&self) -> usize {
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Relaxed);
        self.shared.used(write, read)
    }

    pub fn available_write(&self) -> usize {
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Relaxed);
        self.shared.free(write, read)
    }

    /// Total capacity in bytes (usable capacity is one byte less)
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Reset both indices to zero.
///
/// Requires exclusive access to both ends of the same ring, which proves no
/// concurrent reader or writer exists.
pub fn reset(producer: &mut RingProducer, consumer: &mut RingConsumer) {
    assert!(
        Arc::ptr_eq(&producer.shared, &consumer.shared),
        "reset requires both ends of the same ring"
    );
    producer.shared.write.store(0, Ordering::Release);
    producer.shared.read.store(0, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ring() {
        let (producer, mut consumer) = RingBuffer::with_capacity(16);
        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf), 0);
        assert_eq!(consumer.available_read(), 0);
        assert_eq!(producer.available_write(), 15);
    }

    #[test]
    fn test_write_then_read() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(16);
        assert_eq!(producer.write(&[1, 2, 3, 4]), 4);
        assert_eq!(consumer.available_read(), 4);

        let mut buf = [0u8; 8];
        assert_eq!(consumer.read(&mut buf), 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(consumer.available_read(), 0);
    }

    #[test]
    fn test_short_write_when_full() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(8);
        // Usable capacity is 7
        assert_eq!(producer.write(&[0; 10]), 7);
        assert_eq!(producer.write(&[0; 1]), 0);

        let mut buf = [0u8; 3];
        assert_eq!(consumer.read(&mut buf), 3);
        assert_eq!(producer.write(&[0; 10]), 3);
    }

    #[test]
    fn test_accounting_invariant() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(32);
        let metrics = producer.metrics();
        let mut scratch = [0u8; 13];

        for step in 0..200 {
            let n = (step * 7) % 13 + 1;
            producer.write(&scratch[..n]);
            let m = (step * 5) % 11 + 1;
            consumer.read(&mut scratch[..m]);

            assert!(metrics.available_read() <= 31);
            assert_eq!(
                metrics.available_read() + metrics.available_write() + 1,
                metrics.capacity()
            );
        }
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(10);
        let mut out = [0u8; 10];

        // Push the indices near the end, then force a wrapped write
        assert_eq!(producer.write(&[0; 6]), 6);
        assert_eq!(consumer.read(&mut out[..6]), 6);
        assert_eq!(producer.write(&[10, 11, 12, 13, 14, 15]), 6);
        assert_eq!(consumer.read(&mut out[..6]), 6);
        assert_eq!(&out[..6], &[10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn test_skip_discards_in_order() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(16);
        producer.write(&[1, 2, 3, 4, 5]);
        assert_eq!(consumer.skip(3), 3);
        let mut buf = [0u8; 4];
        assert_eq!(consumer.read(&mut buf), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(consumer.skip(100), 0);
    }

    #[test]
    fn test_reset() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(16);
        producer.write(&[1, 2, 3]);
        reset(&mut producer, &mut consumer);
        assert_eq!(consumer.available_read(), 0);
        assert_eq!(producer.available_write(), 15);
    }

    /// FIFO property under concurrency: the bytes read are exactly the
    /// prefix of the bytes written, in order.
    #[test]
    fn test_threaded_fifo() {
        const TOTAL: usize = 1 << 20;
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4096);

        let writer = std::thread::spawn(move || {
            let mut written = 0usize;
            let mut chunk = [0u8; 257];
            while written < TOTAL {
                let n = chunk.len().min(TOTAL - written);
                for (i, byte) in chunk[..n].iter_mut().enumerate() {
                    *byte = ((written + i) % 251) as u8;
                }
                let accepted = producer.write(&chunk[..n]);
                written += accepted;
                if accepted == 0 {
                    std::thread::yield_now();
                }
            }
        });

        let mut read_total = 0usize;
        let mut buf = [0u8; 311];
        while read_total < TOTAL {
            let n = consumer.read(&mut buf);
            for (i, &byte) in buf[..n].iter().enumerate() {
                assert_eq!(byte, ((read_total + i) % 251) as u8);
            }
            read_total += n;
            if n == 0 {
                std::thread::yield_now();
            }
        }

        writer.join().unwrap();
        assert_eq!(read_total, TOTAL);
    }
}
