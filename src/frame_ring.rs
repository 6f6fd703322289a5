/// Frame ring for captured audio
///
/// Single-producer single-consumer ring between a capture callback (writer)
/// and the detection worker (reader). The writer never blocks: when the ring
/// is full, the incoming samples that do not fit are discarded and counted.
/// The reader only ever hands out complete frames, so no silence is
/// substituted for missing audio.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::audio::AudioSample;

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Create a ring holding `capacity` samples
pub fn frame_ring(capacity: usize) -> (FrameWriter, FrameReader) {
    debug!("Creating frame ring with capacity: {} samples", capacity);

    let (producer, consumer) = RingBuffer::new(capacity.max(1)).split();
    let dropped = Arc::new(CachePadded::new(AtomicU64::new(0)));

    (
        FrameWriter {
            producer,
            dropped: Arc::clone(&dropped),
        },
        FrameReader { consumer, dropped },
    )
}

/// Capture side of the ring
pub struct FrameWriter {
    producer: RingProducer,
    dropped: Arc<CachePadded<AtomicU64>>,
}

impl FrameWriter {
    /// Push samples, returning how many were stored.
    ///
    /// Samples beyond the free space are dropped (overflow is tolerated).
    pub fn push(&mut self, samples: &[AudioSample]) -> usize {
        let written = self.producer.push_slice(samples);

        if written < samples.len() {
            let lost = (samples.len() - written) as u64;
            self.dropped.fetch_add(lost, Ordering::Relaxed);
            trace!("Frame ring full, dropped {} samples", lost);
        }

        written
    }
}

/// Worker side of the ring
pub struct FrameReader {
    consumer: RingConsumer,
    dropped: Arc<CachePadded<AtomicU64>>,
}

impl FrameReader {
    /// Pop exactly `len` samples, or nothing if a full frame is not buffered yet
    pub fn pop_frame(&mut self, len: usize) -> Option<Vec<AudioSample>> {
        if self.consumer.occupied_len() < len {
            return None;
        }

        let mut frame = vec![0; len];
        let read = self.consumer.pop_slice(&mut frame);
        debug_assert_eq!(read, len);

        Some(frame)
    }

    /// Samples currently buffered
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.consumer.capacity().get()
    }

    /// Total samples dropped by the writer on overflow
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything buffered
    pub fn clear(&mut self) {
        let occupied = self.consumer.occupied_len();
        self.consumer.skip(occupied);
        debug!("Cleared frame ring ({} samples)", occupied);
    }
}
