//! # Physical Frame Allocator
//!
//! One managed zone `[base, base + frames * 4096)` starting at 1 MiB, with
//! one [`FrameState`] byte per frame. The state array lives in physical
//! memory right after the kernel image and is itself marked
//! [`FrameState::Kernel`].
//!
//! Allocation scans forward from a `last_free` cursor for `n` consecutive
//! free frames, wraps around to the start of the zone once, and fails only
//! when both passes miss. Freeing a run below the cursor pulls the cursor
//! back, so low frames are reused first.
//!
//! Counts are computed by scanning the state array on demand; nothing is
//! tracked incrementally.
//!
//! Freeing a frame that is already free, outside the zone, or protected
//! (reserved, kernel, bad) is an invariant violation and panics.

use core::fmt;
use core::ops::Range;
use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_info::memory::{FRAME_SIZE, PMM_ZONE_BASE};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, align_down, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info};

/// State of one 4 KiB frame.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameState {
    Free = 0,
    /// Handed out by [`FrameZone::alloc`].
    Used = 1,
    /// Firmware, device or hole; set aside by [`FrameZone::reserve`].
    Reserved = 2,
    /// Kernel image or the state array itself.
    Kernel = 3,
    /// Reported defective by firmware.
    Bad = 4,
}

impl FrameState {
    /// States that may never be freed.
    #[must_use]
    pub const fn is_protected(self) -> bool {
        matches!(self, Self::Reserved | Self::Kernel | Self::Bad)
    }
}

/// Reasons the zone cannot be built. All of them are fatal at boot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameInitError {
    #[error("firmware memory map is empty")]
    EmptyMemoryMap,
    #[error("no usable memory above {0}")]
    NoUsableMemory(PhysicalAddress),
    #[error("frame state array at {start}..{end} falls outside the managed zone")]
    StateArrayOutsideZone {
        start: PhysicalAddress,
        end: PhysicalAddress,
    },
}

/// Recoverable allocation failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("zero-length frame run")]
    ZeroCount,
    #[error("no run of {0} free frames")]
    OutOfFrames(u64),
    #[error("frame {0} is not free")]
    NotFree(PhysicalAddress),
    #[error("{0} is outside the managed zone")]
    OutsideZone(PhysicalAddress),
    #[error("{0} is not frame aligned")]
    Misaligned(PhysicalAddress),
}

/// Snapshot of zone occupancy, in frames.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Reserved, kernel and bad frames.
    pub reserved: u64,
}

/// The managed zone and its per-frame state.
pub struct FrameZone {
    base: PhysicalAddress,
    states: &'static mut [FrameState],
    last_free: usize,
}

impl fmt::Debug for FrameZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameZone")
            .field("base", &self.base)
            .field("frames", &self.states.len())
            .field("last_free", &self.last_free)
            .finish_non_exhaustive()
    }
}

impl FrameZone {
    /// Zone over `states.len()` frames starting at `base`, all free.
    ///
    /// # Panics
    /// If `base` is not frame aligned.
    #[must_use]
    pub fn new(base: PhysicalAddress, states: &'static mut [FrameState]) -> Self {
        assert!(base.is_aligned::<Size4K>(), "zone base {base} not frame aligned");
        states.fill(FrameState::Free);
        Self {
            base,
            states,
            last_free: 0,
        }
    }

    /// Build the zone from the firmware memory map.
    ///
    /// The zone spans from 1 MiB to the end of the highest usable region. The
    /// state array is placed at the first frame boundary after
    /// `kernel_image`. Every frame starts out reserved; frames inside usable
    /// regions are then freed, bad regions marked bad, other firmware
    /// regions re-reserved, and finally the kernel image and the state array
    /// marked as kernel frames.
    ///
    /// # Errors
    /// See [`FrameInitError`].
    pub fn from_memory_map<M: PhysMapper>(
        mapper: &M,
        regions: &[MemoryRegion],
        kernel_image: Range<PhysicalAddress>,
    ) -> Result<Self, FrameInitError> {
        let base = PhysicalAddress::new(PMM_ZONE_BASE);
        if regions.is_empty() {
            return Err(FrameInitError::EmptyMemoryMap);
        }

        let highest = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(MemoryRegion::end)
            .max()
            .map_or(0, |end| align_down(end, FRAME_SIZE));
        if highest <= base.as_u64() {
            return Err(FrameInitError::NoUsableMemory(base));
        }

        let frames = (highest - base.as_u64()) / FRAME_SIZE;
        let array_start = align_up(kernel_image.end.as_u64().max(base.as_u64()), FRAME_SIZE)
            .unwrap_or(u64::MAX);
        let array_end = array_start.saturating_add(frames);
        if array_end > highest {
            return Err(FrameInitError::StateArrayOutsideZone {
                start: PhysicalAddress::new(array_start),
                end: PhysicalAddress::new(array_end),
            });
        }

        #[allow(clippy::cast_possible_truncation)]
        let len = frames as usize;
        let states = {
            // Safety: the array range lies inside the zone, past the kernel
            // image, and nothing else uses it yet.
            let ptr = core::ptr::from_mut(unsafe {
                mapper.phys_to_mut::<u8>(PhysicalAddress::new(array_start))
            });
            unsafe {
                core::ptr::write_bytes(ptr, FrameState::Reserved as u8, len);
                core::slice::from_raw_parts_mut(ptr.cast::<FrameState>(), len)
            }
        };

        let mut zone = Self {
            base,
            states,
            last_free: 0,
        };

        for r in regions.iter().filter(|r| r.is_usable()) {
            zone.mark_span(r.base, r.end(), FrameState::Free);
        }
        for r in regions.iter().filter(|r| !r.is_usable()) {
            let state = if r.kind == MemoryRegionKind::Bad {
                FrameState::Bad
            } else {
                FrameState::Reserved
            };
            zone.mark_span(r.base, r.end(), state);
        }
        zone.mark_span(
            kernel_image.start.as_u64(),
            kernel_image.end.as_u64(),
            FrameState::Kernel,
        );
        zone.mark_span(array_start, array_end, FrameState::Kernel);

        zone.last_free = zone
            .states
            .iter()
            .position(|s| *s == FrameState::Free)
            .unwrap_or(0);

        let stats = zone.stats();
        info!(
            "PMM: zone {}..{} ({} frames), state array at {array_start:#x}, free={} reserved={}",
            zone.base,
            zone.end(),
            stats.total,
            stats.free,
            stats.reserved
        );
        Ok(zone)
    }

    /// Set the state of every frame of `[start, end)` that lies in the zone.
    ///
    /// Free spans only cover whole frames; any other state also claims
    /// partially covered frames.
    fn mark_span(&mut self, start: u64, end: u64, state: FrameState) {
        let (lo, hi) = if state == FrameState::Free {
            (
                align_up(start, FRAME_SIZE).unwrap_or(u64::MAX),
                align_down(end, FRAME_SIZE),
            )
        } else {
            (
                align_down(start, FRAME_SIZE),
                align_up(end, FRAME_SIZE).unwrap_or(u64::MAX),
            )
        };
        let lo = lo.max(self.base.as_u64());
        let hi = hi.min(self.end().as_u64());
        if lo >= hi {
            return;
        }
        let first = self.frame_index(lo);
        let last = self.frame_index(hi);
        self.states[first..last].fill(state);
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn frame_index(&self, addr: u64) -> usize {
        ((addr - self.base.as_u64()) / FRAME_SIZE) as usize
    }

    const fn frame_addr(&self, idx: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + idx as u64 * FRAME_SIZE)
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Exclusive end of the zone.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        self.frame_addr(self.states.len())
    }

    #[must_use]
    pub fn frames(&self) -> u64 {
        self.states.len() as u64
    }

    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.last_free
    }

    /// Index of the run `[addr, addr + n * 4096)` if it is aligned and inside
    /// the zone.
    fn run_index(&self, addr: PhysicalAddress, n: u64) -> Result<usize, FrameError> {
        if !addr.is_aligned::<Size4K>() {
            return Err(FrameError::Misaligned(addr));
        }
        let end = n
            .checked_mul(FRAME_SIZE)
            .and_then(|len| addr.as_u64().checked_add(len));
        match end {
            Some(end) if addr >= self.base && end <= self.end().as_u64() => {
                Ok(self.frame_index(addr.as_u64()))
            }
            _ => Err(FrameError::OutsideZone(addr)),
        }
    }

    /// First index in `[from, start_limit)` that begins `n` free frames.
    fn find_run(&self, from: usize, start_limit: usize, n: usize) -> Option<usize> {
        let len = self.states.len();
        let mut i = from;
        if n > len {
            return None;
        }
        while i < start_limit && i <= len - n {
            match self.states[i..i + n]
                .iter()
                .rposition(|s| *s != FrameState::Free)
            {
                None => return Some(i),
                Some(busy) => i += busy + 1,
            }
        }
        None
    }

    /// Take `n` contiguous free frames.
    ///
    /// # Errors
    /// [`FrameError::ZeroCount`] for `n == 0`, [`FrameError::OutOfFrames`] if
    /// no run exists.
    pub fn alloc(&mut self, n: u64) -> Result<PhysicalAddress, FrameError> {
        if n == 0 {
            return Err(FrameError::ZeroCount);
        }
        let count = match usize::try_from(n) {
            Ok(count) if count <= self.states.len() => count,
            _ => return Err(FrameError::OutOfFrames(n)),
        };
        let cursor = self.last_free;
        let found = self
            .find_run(cursor, self.states.len(), count)
            .or_else(|| self.find_run(0, cursor, count));
        let Some(idx) = found else {
            debug!("PMM: no run of {n} free frames");
            return Err(FrameError::OutOfFrames(n));
        };
        self.states[idx..idx + count].fill(FrameState::Used);
        self.last_free = idx;
        Ok(self.frame_addr(idx))
    }

    /// Return `n` frames starting at `addr`.
    ///
    /// # Panics
    /// If the run is misaligned, leaves the zone, or contains a frame that is
    /// not [`FrameState::Used`]. Each of these means some caller's ownership
    /// bookkeeping is corrupt.
    pub fn free(&mut self, addr: PhysicalAddress, n: u64) {
        if n == 0 {
            return;
        }
        let idx = match self.run_index(addr, n) {
            Ok(idx) => idx,
            Err(e) => panic!("PMM: free({addr}, {n}): {e}"),
        };
        #[allow(clippy::cast_possible_truncation)]
        let run = &mut self.states[idx..idx + n as usize];
        for (i, state) in run.iter().enumerate() {
            match state {
                FrameState::Used => {}
                FrameState::Free => panic!(
                    "PMM: double free of frame {} (run {addr} x{n})",
                    PhysicalAddress::new(addr.as_u64() + i as u64 * FRAME_SIZE)
                ),
                protected => panic!(
                    "PMM: free of {protected:?} frame {} (run {addr} x{n})",
                    PhysicalAddress::new(addr.as_u64() + i as u64 * FRAME_SIZE)
                ),
            }
        }
        run.fill(FrameState::Free);
        if idx < self.last_free {
            self.last_free = idx;
        }
    }

    /// Set aside `n` free frames starting at `addr`.
    ///
    /// # Errors
    /// Fails without changing anything if the run is invalid or any frame in
    /// it is not free.
    pub fn reserve(&mut self, addr: PhysicalAddress, n: u64) -> Result<(), FrameError> {
        if n == 0 {
            return Err(FrameError::ZeroCount);
        }
        let idx = self.run_index(addr, n)?;
        #[allow(clippy::cast_possible_truncation)]
        let run = &mut self.states[idx..idx + n as usize];
        if let Some(busy) = run.iter().position(|s| *s != FrameState::Free) {
            return Err(FrameError::NotFree(PhysicalAddress::new(
                addr.as_u64() + busy as u64 * FRAME_SIZE,
            )));
        }
        run.fill(FrameState::Reserved);
        Ok(())
    }

    /// State of the frame containing `addr`, or `None` outside the zone.
    #[must_use]
    pub fn state_of(&self, addr: PhysicalAddress) -> Option<FrameState> {
        let frame = addr.page::<Size4K>().base();
        self.run_index(frame, 1)
            .ok()
            .map(|idx| self.states[idx])
    }

    /// `true` if the frame containing `addr` is in the zone and allocated.
    #[must_use]
    pub fn owns(&self, addr: PhysicalAddress) -> bool {
        self.state_of(addr) == Some(FrameState::Used)
    }

    /// Count frames by state.
    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let mut s = FrameStats {
            total: self.frames(),
            ..FrameStats::default()
        };
        for state in self.states.iter() {
            match state {
                FrameState::Free => s.free += 1,
                FrameState::Used => s.used += 1,
                _ => s.reserved += 1,
            }
        }
        s
    }
}

/// The zone behind its lock; the allocator every other component uses.
pub struct FrameAllocator {
    zone: SpinLock<FrameZone>,
}

impl FrameAllocator {
    #[must_use]
    pub const fn new(zone: FrameZone) -> Self {
        Self {
            zone: SpinLock::new(zone),
        }
    }

    /// See [`FrameZone::alloc`].
    ///
    /// # Errors
    /// See [`FrameZone::alloc`].
    pub fn alloc(&self, n: u64) -> Result<PhysicalAddress, FrameError> {
        self.zone.with_lock(|z| z.alloc(n))
    }

    /// [`alloc`](Self::alloc) followed by zero-filling through `mapper`.
    ///
    /// # Errors
    /// See [`FrameZone::alloc`].
    pub fn alloc_zeroed<M: PhysMapper>(&self, mapper: &M, n: u64) -> Result<PhysicalAddress, FrameError> {
        let base = self.alloc(n)?;
        let first = base.page::<Size4K>();
        for i in 0..n {
            mapper.zero_frame(first.add(i));
        }
        Ok(base)
    }

    /// See [`FrameZone::free`].
    ///
    /// # Panics
    /// See [`FrameZone::free`].
    pub fn free(&self, addr: PhysicalAddress, n: u64) {
        self.zone.with_lock(|z| z.free(addr, n));
    }

    /// See [`FrameZone::reserve`].
    ///
    /// # Errors
    /// See [`FrameZone::reserve`].
    pub fn reserve(&self, addr: PhysicalAddress, n: u64) -> Result<(), FrameError> {
        self.zone.with_lock(|z| z.reserve(addr, n))
    }

    #[must_use]
    pub fn state_of(&self, addr: PhysicalAddress) -> Option<FrameState> {
        self.zone.with_lock(|z| z.state_of(addr))
    }

    #[must_use]
    pub fn owns(&self, addr: PhysicalAddress) -> bool {
        self.zone.with_lock(|z| z.owns(addr))
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        self.zone.with_lock(|z| z.stats())
    }

    /// `(base, frames)` of the managed zone.
    #[must_use]
    pub fn zone_bounds(&self) -> (PhysicalAddress, u64) {
        self.zone.with_lock(|z| (z.base(), z.frames()))
    }
}

impl FrameAlloc for FrameAllocator {
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.alloc(1).ok().map(|pa| pa.page::<Size4K>())
    }

    fn free_4k(&self, frame: PhysicalPage<Size4K>) {
        self.free(frame.base(), 1);
    }
}
