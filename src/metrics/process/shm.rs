//! A `memfd`-backed `MAP_SHARED` region.
//!
//! The mapping is created once and never moved, so another address space can
//! map the same fd and see writes without any copy.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// `None` when the rounded length does not fit in `usize`.
pub(crate) fn round_to_page(len: usize) -> Option<usize> {
    let page = page_size();
    len.div_ceil(page).checked_mul(page)
}

pub(crate) struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    fd: OwnedFd,
    writable: bool,
}

// Safety: the region is plain memory; synchronisation of its contents is the
// caller's job (see SampleBuffer's writer protocol).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Creates a new anonymous file of `len` bytes (page-rounded) and maps it
    /// read-write.
    pub(crate) fn create(name: &str, len: usize) -> io::Result<Self> {
        let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let len = round_to_page(len.max(1))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "region too large"))?;

        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let size = libc::off_t::try_from(len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Self::map(fd, len, true)
    }

    /// Maps an existing region read-only. The length is taken from the file.
    pub(crate) fn open_read_only(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let len = usize::try_from(stat.st_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty region"));
        }
        Self::map(fd.try_clone_to_owned()?, len, false)
    }

    fn map(fd: OwnedFd, len: usize, writable: bool) -> io::Result<Self> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(base as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        Ok(Self {
            ptr,
            len,
            fd,
            writable,
        })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Only valid on regions created with [`SharedRegion::create`].
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        debug_assert!(self.writable, "write through a read-only mapping");
        self.ptr.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            log::warn!("munmap of {} bytes failed: {}", self.len, io::Error::last_os_error());
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("len", &self.len)
            .field("fd", &self.fd.as_raw_fd())
            .field("writable", &self.writable)
            .finish()
    }
}
