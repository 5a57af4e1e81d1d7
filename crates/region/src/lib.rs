//! The request region: a contiguous byte array of fixed-width request
//! slots, remotely written by clients and polled by the owning workers.
//!
//! This memory is mutated by the fabric from outside the borrow checker's
//! view. It is owned here as a raw region with byte-level views; nothing
//! ever aliases it with a typed pointer, and the opcode byte of a slot is
//! only touched through atomics (Acquire on observe, Release on publish).

use std::alloc;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

pub const CACHE_LINE: usize = 64;
pub const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("region layout dimension `{0}` must be nonzero")]
    ZeroDimension(&'static str),
    #[error("slot size {0} must be exactly one {CACHE_LINE}-byte cache line")]
    SlotSize(usize),
    #[error("allocation of {0} bytes failed")]
    AllocFailed(usize),
    #[error("{op} failed (errno {errno})")]
    Shm { op: &'static str, errno: i32 },
    #[error("write of {len} bytes at offset {offset} overruns the {region}-byte region")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region: usize,
    },
    #[error("worker index {index} out of range ({workers} workers)")]
    WorkerIndex { index: usize, workers: usize },
}

/// Geometry of a request region: `num_workers x num_clients x window_size`
/// slots, each one cache line wide so a slot is covered by one remote
/// write and never straddles two lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub num_workers: usize,
    pub num_clients: usize,
    pub window_size: usize,
    pub slot_size: usize,
}

impl RegionLayout {
    pub fn new(
        num_workers: usize,
        num_clients: usize,
        window_size: usize,
        slot_size: usize,
    ) -> Result<Self, Error> {
        for (name, dim) in [
            ("num_workers", num_workers),
            ("num_clients", num_clients),
            ("window_size", window_size),
        ] {
            if dim == 0 {
                return Err(Error::ZeroDimension(name));
            }
        }
        if slot_size != CACHE_LINE {
            return Err(Error::SlotSize(slot_size));
        }
        Ok(Self {
            num_workers,
            num_clients,
            window_size,
            slot_size,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.num_workers * self.num_clients * self.window_size
    }

    /// Byte offset of slot `(worker, client, slot)`.
    pub fn slot_offset(&self, worker: usize, client: usize, slot: usize) -> usize {
        assert!(worker < self.num_workers && client < self.num_clients && slot < self.window_size);
        (worker * self.num_clients * self.window_size + client * self.window_size + slot)
            * self.slot_size
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_count() * self.slot_size
    }

    /// Allocated size: the slot array rounded up to the hugepage size.
    pub fn len(&self) -> usize {
        self.slot_bytes().div_ceil(HUGEPAGE_SIZE) * HUGEPAGE_SIZE
    }
}

enum Backing {
    Owned,
    Shared { id: libc::c_int, owner: bool },
}

/// An owned request region over anonymous memory or a shared segment.
pub struct RequestRegion {
    base: NonNull<u8>,
    layout: RegionLayout,
    backing: Backing,
}

// Safety: the region is plain bytes. Concurrent access follows the slot
// protocol: a slot's opcode byte moves zero->nonzero only by the writing
// client and nonzero->zero only by the owning worker, both through
// atomics; body bytes are published before the opcode and read only after
// observing it.
unsafe impl Send for RequestRegion {}
unsafe impl Sync for RequestRegion {}

impl RequestRegion {
    /// A zeroed region in process-private memory.
    pub fn anonymous(layout: RegionLayout) -> Result<Self, Error> {
        let len = layout.len();
        let alloc_layout = alloc::Layout::from_size_align(len, CACHE_LINE)
            .map_err(|_| Error::AllocFailed(len))?;

        // Safety: `len` is nonzero (layout dimensions are validated).
        let base = unsafe { alloc::alloc_zeroed(alloc_layout) };
        let base = NonNull::new(base).ok_or(Error::AllocFailed(len))?;
        Ok(Self {
            base,
            layout,
            backing: Backing::Owned,
        })
    }

    /// Create (or reuse) the shared segment for `key` and zero its slots.
    /// The segment persists across restarts as long as the key is stable.
    pub fn shared(key: i32, layout: RegionLayout) -> Result<Self, Error> {
        let region = Self::segment(key, layout, true)?;
        // Safety: freshly attached segment of `layout.len()` bytes; no
        // other thread holds a view of it yet.
        unsafe { std::ptr::write_bytes(region.base.as_ptr(), 0, layout.len()) };
        Ok(region)
    }

    /// Attach to a segment some master already created.
    pub fn attach(key: i32, layout: RegionLayout) -> Result<Self, Error> {
        Self::segment(key, layout, false)
    }

    fn segment(key: i32, layout: RegionLayout, create: bool) -> Result<Self, Error> {
        let len = layout.len();
        let mut flags = 0o666;
        if create {
            flags |= libc::IPC_CREAT;
        }

        // Hugepage-backed first; plain pages when the system has none.
        let id = if create {
            match unsafe { libc::shmget(key, len, flags | libc::SHM_HUGETLB) } {
                -1 => {
                    tracing::debug!(key, "no hugepages for request region, using plain pages");
                    unsafe { libc::shmget(key, len, flags) }
                }
                id => id,
            }
        } else {
            unsafe { libc::shmget(key, len, flags) }
        };
        if id == -1 {
            return Err(Error::Shm {
                op: "shmget",
                errno: errno(),
            });
        }

        let base = unsafe { libc::shmat(id, std::ptr::null(), 0) };
        if base as isize == -1 {
            return Err(Error::Shm {
                op: "shmat",
                errno: errno(),
            });
        }
        Ok(Self {
            base: NonNull::new(base as *mut u8).ok_or(Error::Shm {
                op: "shmat",
                errno: 0,
            })?,
            layout,
            backing: Backing::Shared { id, owner: create },
        })
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn slot(&self, worker: usize, client: usize, slot: usize) -> SlotRef<'_> {
        let offset = self.layout.slot_offset(worker, client, slot);
        SlotRef {
            // Safety: slot_offset asserts the indices, so the slot lies
            // within the allocation.
            ptr: unsafe { self.base.as_ptr().add(offset) },
            slot_size: self.layout.slot_size,
            _region: PhantomData,
        }
    }

    /// The landing path of a one-sided remote write: bytes become visible
    /// in ascending address order, with the final byte published last by a
    /// Release store. A poller that observes that byte nonzero therefore
    /// observes everything before it.
    pub fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), Error> {
        let region = self.layout.len();
        if offset.checked_add(bytes.len()).map_or(true, |end| end > region) {
            return Err(Error::OutOfBounds {
                offset,
                len: bytes.len(),
                region,
            });
        }
        let Some((&last, body)) = bytes.split_last() else {
            return Ok(());
        };

        // Safety: bounds checked above; `body` never overlaps the region
        // (it is caller memory).
        unsafe {
            let dst = self.base.as_ptr().add(offset);
            std::ptr::copy_nonoverlapping(body.as_ptr(), dst, body.len());
            atomic_byte(dst.add(body.len())).store(last, Ordering::Release);
        }
        Ok(())
    }
}

impl Drop for RequestRegion {
    fn drop(&mut self) {
        match self.backing {
            Backing::Owned => {
                let alloc_layout =
                    alloc::Layout::from_size_align(self.layout.len(), CACHE_LINE).unwrap();
                // Safety: allocated in `anonymous` with this exact layout.
                unsafe { alloc::dealloc(self.base.as_ptr(), alloc_layout) };
            }
            Backing::Shared { id, owner } => unsafe {
                libc::shmdt(self.base.as_ptr() as *const libc::c_void);
                if owner {
                    libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut());
                }
            },
        }
    }
}

/// A borrowed view of one request slot.
#[derive(Clone, Copy)]
pub struct SlotRef<'a> {
    ptr: *mut u8,
    slot_size: usize,
    _region: PhantomData<&'a RequestRegion>,
}

impl<'a> SlotRef<'a> {
    /// The opcode byte, at the slot's highest address. An Acquire load:
    /// nonzero means the rest of the slot is visible.
    pub fn opcode(&self) -> u8 {
        // Safety: the slot lies within the region allocation.
        unsafe { atomic_byte(self.ptr.add(self.slot_size - 1)).load(Ordering::Acquire) }
    }

    /// Every byte below the opcode. Only meaningful after `opcode()`
    /// returned nonzero.
    pub fn body(&self) -> &'a [u8] {
        // Safety: in-bounds, and the writing client does not touch these
        // bytes again until the slot is cleared.
        unsafe { std::slice::from_raw_parts(self.ptr, self.slot_size - 1) }
    }

    /// Reset the slot to idle. A Release store, after which the slot's
    /// client may write it again.
    pub fn clear(&self) {
        // Safety: as in `opcode`.
        unsafe { atomic_byte(self.ptr.add(self.slot_size - 1)).store(0, Ordering::Release) }
    }
}

/// One worker's column of the region: the only view a worker polls, so a
/// worker can never observe another worker's slots.
#[derive(Clone)]
pub struct Column {
    region: Arc<RequestRegion>,
    worker: usize,
}

impl Column {
    pub fn new(region: Arc<RequestRegion>, worker: usize) -> Result<Self, Error> {
        let workers = region.layout().num_workers;
        if worker >= workers {
            return Err(Error::WorkerIndex {
                index: worker,
                workers,
            });
        }
        Ok(Self { region, worker })
    }

    pub fn layout(&self) -> &RegionLayout {
        self.region.layout()
    }

    pub fn slot(&self, client: usize, slot: usize) -> SlotRef<'_> {
        self.region.slot(self.worker, client, slot)
    }
}

// Safety: AtomicU8 has the same layout as u8, and every access to the
// opcode byte in this process goes through this helper.
unsafe fn atomic_byte<'a>(ptr: *mut u8) -> &'a AtomicU8 {
    &*(ptr as *mut AtomicU8)
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
