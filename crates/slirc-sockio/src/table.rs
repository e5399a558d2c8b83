//! Connection table and readiness sets.
//!
//! A dense table indexed by file descriptor maps each open descriptor to the
//! generation-checked [`ConnId`] that owns it, so a recycled descriptor can
//! never be confused with the connection that used it before. Two bitsets
//! record which descriptors the next poll pass should wait on for reading
//! and for writing.

use std::os::fd::RawFd;

use crate::connection::ConnId;

const BITS_PER_BLOCK: usize = 64;

/// Growable bitset over small non-negative descriptors.
#[derive(Debug, Default, Clone)]
pub struct FdSet {
    blocks: Vec<u64>,
}

impl FdSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn locate(fd: RawFd) -> Option<(usize, u64)> {
        let idx = usize::try_from(fd).ok()?;
        Some((idx / BITS_PER_BLOCK, 1u64 << (idx % BITS_PER_BLOCK)))
    }

    pub fn insert(&mut self, fd: RawFd) {
        let Some((block, mask)) = Self::locate(fd) else {
            return;
        };
        if block >= self.blocks.len() {
            self.blocks.resize(block + 1, 0);
        }
        self.blocks[block] |= mask;
    }

    pub fn remove(&mut self, fd: RawFd) {
        if let Some((block, mask)) = Self::locate(fd)
            && let Some(bits) = self.blocks.get_mut(block)
        {
            *bits &= !mask;
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        Self::locate(fd)
            .and_then(|(block, mask)| self.blocks.get(block).map(|bits| bits & mask != 0))
            .unwrap_or(false)
    }

    pub fn set(&mut self, fd: RawFd, on: bool) {
        if on {
            self.insert(fd);
        } else {
            self.remove(fd);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&bits| bits == 0)
    }

    /// Descriptors in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.blocks.iter().enumerate().flat_map(|(block, &bits)| {
            (0..BITS_PER_BLOCK)
                .filter(move |bit| bits & (1u64 << bit) != 0)
                .map(move |bit| (block * BITS_PER_BLOCK + bit) as RawFd)
        })
    }
}

/// Descriptor → connection index plus the two readiness sets.
#[derive(Debug, Default)]
pub struct ConnTable {
    by_fd: Vec<Option<ConnId>>,
    read_set: FdSet,
    write_set: FdSet,
}

impl ConnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as the owner of `fd`, growing the table if needed, and
    /// mark it read-ready unless `muted`.
    pub fn register(&mut self, fd: RawFd, id: ConnId, muted: bool) {
        let Ok(idx) = usize::try_from(fd) else {
            return;
        };
        if idx >= self.by_fd.len() {
            self.by_fd.resize(idx + 1, None);
        }
        self.by_fd[idx] = Some(id);
        self.read_set.set(fd, !muted);
        self.write_set.remove(fd);
    }

    /// Forget `fd` and clear both of its readiness bits.
    pub fn unregister(&mut self, fd: RawFd) {
        if let Ok(idx) = usize::try_from(fd)
            && let Some(slot) = self.by_fd.get_mut(idx)
        {
            *slot = None;
        }
        self.read_set.remove(fd);
        self.write_set.remove(fd);
    }

    pub fn lookup(&self, fd: RawFd) -> Option<ConnId> {
        usize::try_from(fd)
            .ok()
            .and_then(|idx| self.by_fd.get(idx).copied().flatten())
    }

    #[inline]
    pub fn set_read(&mut self, fd: RawFd, on: bool) {
        self.read_set.set(fd, on);
    }

    #[inline]
    pub fn set_write(&mut self, fd: RawFd, on: bool) {
        self.write_set.set(fd, on);
    }

    #[inline]
    pub fn wants_read(&self, fd: RawFd) -> bool {
        self.read_set.contains(fd)
    }

    #[inline]
    pub fn wants_write(&self, fd: RawFd) -> bool {
        self.write_set.contains(fd)
    }

    /// Every descriptor in either readiness set, ascending.
    pub fn interested(&self) -> Vec<RawFd> {
        let mut fds: Vec<RawFd> = self.read_set.iter().chain(self.write_set.iter()).collect();
        fds.sort_unstable();
        fds.dedup();
        fds
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.by_fd.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
