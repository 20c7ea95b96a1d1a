use std::os::unix::io::RawFd;

use crate::clause::Direction;
use crate::error::{PollsetError, Result};
use crate::waiter::Waiter;

/// Per-descriptor bookkeeping shared by every backend; `Ext` carries the
/// backend-specific extension (spec section 3): `idx` for the `poll`
/// backend, `currevs`/`next` for epoll/kqueue, plus `firing` for kqueue.
#[derive(Debug, Clone)]
pub(crate) struct Slot<Ext> {
    pub(crate) in_waiter: Option<Waiter>,
    pub(crate) out_waiter: Option<Waiter>,
    pub(crate) cached: bool,
    pub(crate) ext: Ext,
}

impl<Ext: Default> Default for Slot<Ext> {
    fn default() -> Self {
        Slot {
            in_waiter: None,
            out_waiter: None,
            cached: false,
            ext: Ext::default(),
        }
    }
}

impl<Ext> Slot<Ext> {
    pub(crate) fn waiter(&self, direction: Direction) -> &Option<Waiter> {
        match direction {
            Direction::In => &self.in_waiter,
            Direction::Out => &self.out_waiter,
        }
    }

    pub(crate) fn waiter_mut(&mut self, direction: Direction) -> &mut Option<Waiter> {
        match direction {
            Direction::In => &mut self.in_waiter,
            Direction::Out => &mut self.out_waiter,
        }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        self.in_waiter.is_some() || self.out_waiter.is_some()
    }
}

/// A dense, `MaxFds`-sized, fd-indexed table of [`Slot`]s.
///
/// Direct indexing keeps every lookup O(1) at the cost of sizing the array
/// to the process's descriptor limit up front (spec section 3 / Design
/// Note 9: a hash map would be the alternative on a system with unbounded
/// fd numbers).
#[derive(Debug)]
pub(crate) struct FdTable<Ext> {
    slots: Vec<Slot<Ext>>,
}

impl<Ext: Default + Clone> FdTable<Ext> {
    pub(crate) fn with_capacity(max_fds: usize) -> FdTable<Ext> {
        FdTable {
            slots: vec![Slot::default(); max_fds],
        }
    }

    /// Bounds-check `fd` and return its slot, or `BadFd` if it's outside the
    /// table (which necessarily means it was never registered as open).
    pub(crate) fn get(&self, fd: RawFd) -> Result<&Slot<Ext>> {
        self.index(fd).map(|i| &self.slots[i])
    }

    pub(crate) fn get_mut(&mut self, fd: RawFd) -> Result<&mut Slot<Ext>> {
        self.index(fd).map(move |i| &mut self.slots[i])
    }

    fn index(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= self.slots.len() {
            Err(PollsetError::BadFd)
        } else {
            Ok(fd as usize)
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }
}
