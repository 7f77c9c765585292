use super::circular_buffer::{chronological, header_offset, BufferHeader, BUFFER_MAGIC, HEADER_SIZE};
use super::shm::SharedRegion;
use super::{Sample, SAMPLE_SIZE};
use crate::error::BufferError;
use std::os::fd::BorrowedFd;
use std::sync::atomic::{fence, Ordering};

/// Attempts before a reader gives up on a writer that keeps the ring busy.
pub const MAX_READ_ATTEMPTS: usize = 64;

/// Read-only view of a [`SampleBuffer`](super::SampleBuffer) mapping.
///
/// Reads never block the writer. A read that overlaps an append is retried.
#[derive(Debug)]
pub struct SampleReader {
    region: SharedRegion,
    capacity: usize,
}

impl SampleReader {
    /// Maps the buffer behind `fd`, for instance one received from the
    /// profiling process.
    pub fn open(fd: BorrowedFd<'_>) -> Result<Self, BufferError> {
        let region = SharedRegion::open_read_only(fd).map_err(BufferError::Map)?;
        if region.len() < HEADER_SIZE + SAMPLE_SIZE {
            return Err(BufferError::BadHeader);
        }

        let header = unsafe { &*(region.as_ptr().add(header_offset(region.len())) as *const BufferHeader) };
        if header.magic != BUFFER_MAGIC {
            return Err(BufferError::BadHeader);
        }
        let capacity = usize::try_from(header.capacity).map_err(|_| BufferError::BadHeader)?;
        let fits = capacity
            .checked_mul(SAMPLE_SIZE)
            .is_some_and(|bytes| bytes <= header_offset(region.len()));
        if capacity == 0 || !fits {
            return Err(BufferError::BadHeader);
        }

        Ok(Self { region, capacity })
    }

    fn header(&self) -> &BufferHeader {
        unsafe { &*(self.region.as_ptr().add(header_offset(self.region.len())) as *const BufferHeader) }
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

    /// A consistent copy of every stored sample, oldest first.
    pub fn snapshot(&self) -> Result<Vec<Sample>, BufferError> {
        let header = self.header();
        let slots = self.region.as_ptr() as *const Sample;

        for _ in 0..MAX_READ_ATTEMPTS {
            let before = header.generation.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let head = header.head.load(Ordering::Relaxed) as usize % self.capacity;
            let count = header.count.load(Ordering::Relaxed) as usize;
            let samples = chronological(slots, self.capacity, head, count);

            fence(Ordering::Acquire);
            if header.generation.load(Ordering::Relaxed) == before {
                return Ok(samples);
            }
        }

        Err(BufferError::Contended(MAX_READ_ATTEMPTS))
    }

    pub fn latest(&self) -> Result<Option<Sample>, BufferError> {
        Ok(self.snapshot()?.pop())
    }
}
