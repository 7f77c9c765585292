use super::shm::{round_to_page, SharedRegion};
use super::{Sample, SampleReader, SAMPLE_SIZE};
use crate::config::ProfilerConfig;
use crate::error::BufferError;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

pub(crate) const BUFFER_MAGIC: u64 = u64::from_ne_bytes(*b"PROFRING");

/// Bookkeeping stored in the last bytes of the mapping.
///
/// `generation` is odd while a slot is being written.
#[repr(C)]
pub(crate) struct BufferHeader {
    pub(crate) magic: u64,
    pub(crate) capacity: u64,
    pub(crate) count: AtomicU64,
    pub(crate) head: AtomicU64,
    pub(crate) generation: AtomicU64,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<BufferHeader>();

pub(crate) fn header_offset(mapping_len: usize) -> usize {
    mapping_len - HEADER_SIZE
}

/// Fixed-capacity sample ring living in shared memory.
///
/// Samples start at offset 0 of the mapping, so a reader sees a flat array
/// of `len()` records. Once the ring wraps, that array is rotated by `head`;
/// [`SampleReader`] undoes the rotation. Slots never written read as all-ones.
/// Raw mappers that ignore the header may observe a slot mid-write.
pub struct SampleBuffer {
    region: SharedRegion,
    capacity: usize,
    writer: Mutex<()>,
}

impl SampleBuffer {
    pub fn new(name: &str, capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::TooSmall(0));
        }
        let data_len = capacity
            .checked_mul(SAMPLE_SIZE)
            .ok_or(BufferError::TooLarge(capacity))?;
        let mapping_len = data_len
            .checked_add(HEADER_SIZE)
            .and_then(round_to_page)
            .ok_or(BufferError::TooLarge(capacity))?;
        let region = SharedRegion::create(name, mapping_len).map_err(BufferError::Map)?;

        unsafe {
            std::ptr::write_bytes(region.as_mut_ptr(), 0xff, data_len);
            let header = region.as_mut_ptr().add(header_offset(region.len())) as *mut BufferHeader;
            header.write(BufferHeader {
                magic: BUFFER_MAGIC,
                capacity: capacity as u64,
                count: AtomicU64::new(0),
                head: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            });
        }

        Ok(Self {
            region,
            capacity,
            writer: Mutex::new(()),
        })
    }

    pub fn from_config(config: &ProfilerConfig) -> Result<Self, BufferError> {
        if config.buffer_bytes < SAMPLE_SIZE {
            return Err(BufferError::TooSmall(config.buffer_bytes));
        }
        Self::new(&config.shm_name, config.capacity())
    }

    fn header(&self) -> &BufferHeader {
        unsafe { &*(self.region.as_ptr().add(header_offset(self.region.len())) as *const BufferHeader) }
    }

    fn slots(&self) -> *mut Sample {
        self.region.as_mut_ptr() as *mut Sample
    }

    /// Writes `sample` over the oldest slot once the ring is full.
    pub fn append(&self, sample: Sample) {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let header = self.header();

        let head = header.head.load(Ordering::Relaxed) as usize;
        let count = header.count.load(Ordering::Relaxed);
        let generation = header.generation.load(Ordering::Relaxed);

        header.generation.store(generation.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);

        unsafe { self.slots().add(head).write_volatile(sample) };

        header
            .head
            .store(((head + 1) % self.capacity) as u64, Ordering::Release);
        header
            .count
            .store((count + 1).min(self.capacity as u64), Ordering::Release);
        header
            .generation
            .store(generation.wrapping_add(2), Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.header().count.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// Samples in chronological order, read under the writer lock.
    pub fn snapshot(&self) -> Vec<Sample> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let header = self.header();
        let head = header.head.load(Ordering::Relaxed) as usize;
        let count = header.count.load(Ordering::Relaxed) as usize;
        chronological(self.slots(), self.capacity, head, count)
    }

    pub fn latest(&self) -> Option<Sample> {
        self.snapshot().pop()
    }

    /// A second, read-only mapping of the same memory.
    pub fn reader(&self) -> Result<SampleReader, BufferError> {
        SampleReader::open(self.as_fd())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.region.raw_fd()
    }

    /// Bytes a reader has to map, header included.
    pub fn mapping_len(&self) -> usize {
        self.region.len()
    }
}

impl AsFd for SampleBuffer {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.region.as_fd()
    }
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("region", &self.region)
            .finish()
    }
}

/// Copies `count` slots ending just before `head`, oldest first.
pub(crate) fn chronological(
    slots: *const Sample,
    capacity: usize,
    head: usize,
    count: usize,
) -> Vec<Sample> {
    let count = count.min(capacity);
    let start = (head + capacity - count) % capacity;
    (0..count)
        .map(|i| unsafe { slots.add((start + i) % capacity).read_volatile() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(timestamp: u64) -> Sample {
        Sample {
            timestamp,
            ..Default::default()
        }
    }

    fn timestamps(samples: &[Sample]) -> Vec<u64> {
        samples.iter().map(|s| s.timestamp).collect()
    }

    #[test]
    fn keeps_most_recent_in_order_after_wrap() {
        let buffer = SampleBuffer::new("ring-wrap", 3).unwrap();
        for t in 1..=5 {
            buffer.append(at(t));
        }
        assert_eq!(buffer.len(), 3);
        assert!(buffer.is_full());
        assert_eq!(timestamps(&buffer.snapshot()), vec![3, 4, 5]);
        assert_eq!(buffer.latest(), Some(at(5)));
    }

    #[test]
    fn len_tracks_appends_until_full() {
        let buffer = SampleBuffer::new("ring-len", 4).unwrap();
        assert!(buffer.is_empty());
        buffer.append(at(1));
        buffer.append(at(2));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.capacity(), 4);
        assert_eq!(timestamps(&buffer.snapshot()), vec![1, 2]);
    }

    #[test]
    fn unused_slots_are_all_ones() {
        let buffer = SampleBuffer::new("ring-fill", 2).unwrap();
        buffer.append(at(9));
        let raw = unsafe { std::slice::from_raw_parts(buffer.slots() as *const u64, 8) };
        assert_eq!(&raw[..4], &[9, 0, 0, 0]);
        assert_eq!(&raw[4..], &[u64::MAX; 4]);
    }

    #[test]
    fn header_sits_at_the_end_of_the_mapping() {
        let buffer = SampleBuffer::new("ring-header", 16_384).unwrap();
        assert!(buffer.mapping_len() >= 16_384 * SAMPLE_SIZE + HEADER_SIZE);
        assert_eq!(buffer.header().magic, BUFFER_MAGIC);
        assert_eq!(buffer.header().capacity, 16_384);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            SampleBuffer::new("ring-zero", 0),
            Err(BufferError::TooSmall(0))
        ));
    }

    #[test]
    fn oversized_capacity_is_an_error() {
        for capacity in [usize::MAX, usize::MAX / SAMPLE_SIZE] {
            assert!(matches!(
                SampleBuffer::new("ring-huge", capacity),
                Err(BufferError::TooLarge(c)) if c == capacity
            ));
        }
    }
}
