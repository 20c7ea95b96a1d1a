//! Array-poll backend (spec section 4.2): the POSIX fallback, used whenever
//! neither epoll nor kqueue is available, or when `force-old-poll` is set.
//!
//! State is a packed `Vec<libc::pollfd>`; each registered fd keeps its
//! index in `PollExt::idx` so dispatch and compaction stay O(1) per slot.

use std::os::unix::io::RawFd;

use crate::clause::{CancelHandle, Clause, Direction, Scheduler};
use crate::error::{PollsetError, Result};
use crate::table::FdTable;
use crate::waiter::Waiter;

#[derive(Debug, Clone, Default)]
pub(crate) struct PollExt {
    /// Position of this fd's entry in `Backend::pollfds`, once cached.
    idx: Option<usize>,
}

pub(crate) struct Backend {
    table: FdTable<PollExt>,
    pollfds: Vec<libc::pollfd>,
}

const ERROR_BITS: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

fn direction_bit(direction: Direction) -> libc::c_short {
    match direction {
        Direction::In => libc::POLLIN,
        Direction::Out => libc::POLLOUT,
    }
}

impl Backend {
    pub(crate) fn new(max_fds: usize) -> Result<Backend> {
        Ok(Backend {
            table: FdTable::with_capacity(max_fds),
            pollfds: Vec::new(),
        })
    }

    pub(crate) fn wait_in(
        &mut self,
        scheduler: &mut dyn Scheduler,
        clause: Clause,
        id: i32,
        fd: RawFd,
    ) -> Result<()> {
        self.wait(scheduler, clause, id, fd, Direction::In)
    }

    pub(crate) fn wait_out(
        &mut self,
        scheduler: &mut dyn Scheduler,
        clause: Clause,
        id: i32,
        fd: RawFd,
    ) -> Result<()> {
        self.wait(scheduler, clause, id, fd, Direction::Out)
    }

    fn wait(
        &mut self,
        scheduler: &mut dyn Scheduler,
        clause: Clause,
        id: i32,
        fd: RawFd,
        direction: Direction,
    ) -> Result<()> {
        let slot = self.table.get_mut(fd)?;
        if slot.waiter(direction).is_some() {
            return Err(PollsetError::AlreadyRegistered);
        }

        if !slot.cached {
            match syscall!(fcntl(fd, libc::F_GETFD)) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Err(PollsetError::BadFd),
                Err(e) => panic!("fcntl(F_GETFD, {fd}) failed unexpectedly: {e}"),
            }
            slot.cached = true;
        }

        let idx = match slot.ext.idx {
            Some(idx) => idx,
            None => {
                let idx = self.pollfds.len();
                self.pollfds.push(libc::pollfd {
                    fd,
                    events: 0,
                    revents: 0,
                });
                idx
            }
        };
        let slot = self.table.get_mut(fd)?;
        slot.ext.idx = Some(idx);
        *slot.waiter_mut(direction) = Some(Waiter { clause, id });
        self.pollfds[idx].events |= direction_bit(direction);

        log::trace!("poll backend: registered fd {fd} for {direction:?}");
        scheduler.wait_for(clause, id, CancelHandle { fd, direction });
        Ok(())
    }

    /// Called by the scheduler (via `Pollset::cancel`) to tear down a waiter
    /// before it fired.
    pub(crate) fn cancel(&mut self, fd: RawFd, direction: Direction) {
        let Ok(slot) = self.table.get_mut(fd) else {
            return;
        };
        if slot.waiter_mut(direction).take().is_none() {
            return;
        }
        if let Some(idx) = slot.ext.idx {
            self.pollfds[idx].events &= !direction_bit(direction);
            if self.pollfds[idx].events == 0 {
                self.remove_slot(idx);
            }
        }
    }

    pub(crate) fn clean(&mut self, fd: RawFd) {
        let Ok(slot) = self.table.get_mut(fd) else {
            return;
        };
        assert!(
            !slot.has_waiters(),
            "clean({fd}) called with a live waiter"
        );
        slot.cached = false;
        if let Some(idx) = slot.ext.idx.take() {
            self.remove_slot(idx);
        }
    }

    /// Swap-remove `pollfds[idx]` and fix up the moved entry's `PollExt::idx`.
    fn remove_slot(&mut self, idx: usize) {
        let last = self.pollfds.len() - 1;
        self.pollfds.swap_remove(idx);
        if idx != last {
            let moved_fd = self.pollfds[idx].fd;
            if let Ok(moved_slot) = self.table.get_mut(moved_fd) {
                moved_slot.ext.idx = Some(idx);
            }
        }
    }

    pub(crate) fn poll(
        &mut self,
        scheduler: &mut dyn Scheduler,
        timeout_ms: i32,
    ) -> Result<bool> {
        let n = match syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms,
        )) {
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Err(PollsetError::Interrupted),
            Err(e) => panic!("poll(2) failed unexpectedly: {e}"),
        };
        if n == 0 {
            return Ok(false);
        }

        let mut fired = false;
        let mut i = 0;
        while i < self.pollfds.len() {
            let fd = self.pollfds[i].fd;
            let revents = self.pollfds[i].revents;
            if revents == 0 {
                i += 1;
                continue;
            }
            self.pollfds[i].revents = 0;
            let has_errors = revents & ERROR_BITS != 0;

            if revents & libc::POLLIN != 0 || has_errors {
                if let Ok(slot) = self.table.get_mut(fd) {
                    if let Some(w) = slot.in_waiter.take() {
                        self.pollfds[i].events &= !libc::POLLIN;
                        scheduler.trigger(w.clause, 0);
                        fired = true;
                    }
                }
            }
            if revents & libc::POLLOUT != 0 || has_errors {
                if let Ok(slot) = self.table.get_mut(fd) {
                    if let Some(w) = slot.out_waiter.take() {
                        self.pollfds[i].events &= !libc::POLLOUT;
                        scheduler.trigger(w.clause, 0);
                        fired = true;
                    }
                }
            }

            if self.pollfds[i].events == 0 {
                if let Ok(slot) = self.table.get_mut(fd) {
                    slot.ext.idx = None;
                }
                self.remove_slot(i);
                // The swapped-in entry now sits at `i`; re-examine it.
                continue;
            }
            i += 1;
        }
        Ok(fired)
    }

    #[cfg(test)]
    pub(crate) fn pollfd_count(&self) -> usize {
        self.pollfds.len()
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.table.capacity()
    }
}
