//! Linux epoll backend (spec section 4.3).
//!
//! Registrations are batched into a changelist and reconciled against the
//! kernel once per `poll` cycle instead of issuing `epoll_ctl` on every
//! `wait_in`/`wait_out` call, which is how this backend differs from a
//! plain mio-style epoll selector (mio applies `epoll_ctl` immediately on
//! every register/reregister/deregister).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::clause::{CancelHandle, Clause, Direction, Scheduler};
use crate::error::{PollsetError, Result};
use crate::table::FdTable;
use crate::waiter::Waiter;

const IN_BIT: u8 = 0b01;
const OUT_BIT: u8 = 0b10;

const MAX_EVENTS: usize = 128;

#[derive(Debug, Clone, Default)]
pub(crate) struct ReactorExt {
    /// Event types currently registered with the kernel for this fd.
    currevs: u8,
    /// Changelist link: `None` iff this fd is not currently queued for
    /// kernel-side reconciliation at the next `poll`.
    next: Option<RawFd>,
}

pub(crate) struct Backend {
    table: FdTable<ReactorExt>,
    epfd: OwnedFd,
    changelist_head: Option<RawFd>,
    events: Vec<libc::epoll_event>,
}

fn direction_bit(direction: Direction) -> u8 {
    match direction {
        Direction::In => IN_BIT,
        Direction::Out => OUT_BIT,
    }
}

fn desired_mask(in_waiter: &Option<Waiter>, out_waiter: &Option<Waiter>) -> u8 {
    (if in_waiter.is_some() { IN_BIT } else { 0 }) | (if out_waiter.is_some() { OUT_BIT } else { 0 })
}

fn epoll_events_for(mask: u8) -> u32 {
    let mut events = 0;
    if mask & IN_BIT != 0 {
        events |= libc::EPOLLIN as u32;
    }
    if mask & OUT_BIT != 0 {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_event_for(fd: RawFd, mask: u8) -> libc::epoll_event {
    libc::epoll_event {
        events: epoll_events_for(mask),
        u64: fd as u64,
        #[cfg(target_os = "redox")]
        _pad: 0,
    }
}

impl Backend {
    pub(crate) fn new(max_fds: usize) -> Result<Backend> {
        let epfd = match syscall!(epoll_create1(libc::EPOLL_CLOEXEC)) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(e) if e.raw_os_error() == Some(libc::ENOMEM) || e.raw_os_error() == Some(libc::EMFILE) => {
                return Err(PollsetError::OutOfMemory)
            }
            Err(e) => panic!("epoll_create1 failed unexpectedly: {e}"),
        };
        Ok(Backend {
            table: FdTable::with_capacity(max_fds),
            epfd,
            changelist_head: None,
            events: Vec::with_capacity(MAX_EVENTS),
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
            let bit = direction_bit(direction);
            let mut ev = epoll_event_for(fd, bit);
            match syscall!(epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut ev
            )) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Err(PollsetError::BadFd),
                Err(e)
                    if e.raw_os_error() == Some(libc::ELOOP)
                        || e.raw_os_error() == Some(libc::EPERM) =>
                {
                    return Err(PollsetError::NotSupported)
                }
                Err(e) => panic!("epoll_ctl(ADD, {fd}) failed unexpectedly: {e}"),
            }
            slot.cached = true;
            slot.ext.currevs = bit;
            slot.ext.next = None;
        } else if slot.ext.next.is_none() {
            slot.ext.next = self.changelist_head;
            self.changelist_head = Some(fd);
        }

        *slot.waiter_mut(direction) = Some(Waiter { clause, id });
        log::trace!("epoll backend: registered fd {fd} for {direction:?}");
        scheduler.wait_for(clause, id, CancelHandle { fd, direction });
        Ok(())
    }

    pub(crate) fn cancel(&mut self, fd: RawFd, direction: Direction) {
        let Ok(slot) = self.table.get_mut(fd) else {
            return;
        };
        if slot.waiter_mut(direction).take().is_none() {
            return;
        }
        self.mark_dirty(fd);
    }

    fn mark_dirty(&mut self, fd: RawFd) {
        let Ok(slot) = self.table.get_mut(fd) else {
            return;
        };
        if slot.ext.next.is_none() {
            slot.ext.next = self.changelist_head;
            self.changelist_head = Some(fd);
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
        if slot.ext.currevs != 0 {
            match syscall!(epoll_ctl(
                self.epfd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut()
            )) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => panic!("epoll_ctl(DEL, {fd}) failed unexpectedly: {e}"),
            }
        }
        self.unlink_from_changelist(fd);
        let Ok(slot) = self.table.get_mut(fd) else {
            return;
        };
        slot.ext.currevs = 0;
        slot.cached = false;
    }

    fn unlink_from_changelist(&mut self, fd: RawFd) {
        if self.changelist_head == Some(fd) {
            let next = self.table.get(fd).ok().and_then(|s| s.ext.next);
            self.changelist_head = next;
        } else {
            let mut cursor = self.changelist_head;
            while let Some(cur) = cursor {
                let next = self.table.get(cur).ok().and_then(|s| s.ext.next);
                if next == Some(fd) {
                    let after = self.table.get(fd).ok().and_then(|s| s.ext.next);
                    if let Ok(slot) = self.table.get_mut(cur) {
                        slot.ext.next = after;
                    }
                    break;
                }
                cursor = next;
            }
        }
        if let Ok(slot) = self.table.get_mut(fd) {
            slot.ext.next = None;
        }
    }

    /// Reconcile the kernel's registration for every fd on the changelist
    /// against its current waiter-derived desired mask.
    fn apply_changes(&mut self) {
        let mut cursor = self.changelist_head.take();
        while let Some(fd) = cursor {
            let Ok(slot) = self.table.get_mut(fd) else {
                cursor = None;
                continue;
            };
            let next = slot.ext.next;
            let desired = desired_mask(&slot.in_waiter, &slot.out_waiter);
            let currevs = slot.ext.currevs;
            slot.ext.next = None;

            if desired != currevs {
                if desired == 0 {
                    match syscall!(epoll_ctl(
                        self.epfd.as_raw_fd(),
                        libc::EPOLL_CTL_DEL,
                        fd,
                        std::ptr::null_mut()
                    )) {
                        Ok(_) => {}
                        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                        Err(e) => panic!("epoll_ctl(DEL, {fd}) failed unexpectedly: {e}"),
                    }
                } else {
                    let op = if currevs == 0 {
                        libc::EPOLL_CTL_ADD
                    } else {
                        libc::EPOLL_CTL_MOD
                    };
                    let mut ev = epoll_event_for(fd, desired);
                    if let Err(e) = syscall!(epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev)) {
                        panic!("epoll_ctl({op}, {fd}) failed unexpectedly: {e}");
                    }
                }
                if let Ok(slot) = self.table.get_mut(fd) {
                    slot.ext.currevs = desired;
                }
            }
            cursor = next;
        }
    }

    pub(crate) fn poll(&mut self, scheduler: &mut dyn Scheduler, timeout_ms: i32) -> Result<bool> {
        self.apply_changes();

        self.events.clear();
        let n = match syscall!(epoll_wait(
            self.epfd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.capacity() as i32,
            timeout_ms,
        )) {
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Err(PollsetError::Interrupted),
            Err(e) => panic!("epoll_wait failed unexpectedly: {e}"),
        };
        // SAFETY: epoll_wait guarantees the first `n` elements are initialized.
        unsafe { self.events.set_len(n as usize) };

        let mut fired = false;
        for i in 0..self.events.len() {
            let fd = self.events[i].u64 as RawFd;
            let mask = self.events[i].events as libc::c_int;

            let Ok(slot) = self.table.get_mut(fd) else {
                continue;
            };
            if slot.in_waiter.is_some() && mask & (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                let w = slot.in_waiter.take().unwrap();
                scheduler.trigger(w.clause, 0);
                fired = true;
            }
            if slot.out_waiter.is_some() && mask & (libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) != 0 {
                let w = slot.out_waiter.take().unwrap();
                scheduler.trigger(w.clause, 0);
                fired = true;
            }

            let desired = desired_mask(&slot.in_waiter, &slot.out_waiter);
            if desired != slot.ext.currevs {
                self.mark_dirty(fd);
            }
        }
        Ok(fired)
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.table.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingScheduler {
        triggered: Vec<(Clause, i32)>,
    }

    impl RecordingScheduler {
        fn new() -> RecordingScheduler {
            RecordingScheduler { triggered: Vec::new() }
        }
    }

    impl Scheduler for RecordingScheduler {
        fn wait_for(&mut self, _clause: Clause, _id: i32, _cancel: CancelHandle) {}
        fn trigger(&mut self, clause: Clause, rc: i32) {
            self.triggered.push((clause, rc));
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn pipe_ready_triggers_and_clears_registration() {
        let (r, w) = pipe();
        let mut backend = Backend::new(64).unwrap();
        let mut sched = RecordingScheduler::new();

        backend.wait_in(&mut sched, Clause(1), 0, r).unwrap();
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

        let woke = backend.poll(&mut sched, 1_000).unwrap();
        assert!(woke);
        assert_eq!(sched.triggered, vec![(Clause(1), 0)]);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn already_registered_rejected() {
        let (r, w) = pipe();
        let mut backend = Backend::new(64).unwrap();
        let mut sched = RecordingScheduler::new();

        backend.wait_in(&mut sched, Clause(1), 0, r).unwrap();
        let err = backend.wait_in(&mut sched, Clause(2), 0, r).unwrap_err();
        assert!(matches!(err, PollsetError::AlreadyRegistered));

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn changelist_coalesces_multiple_pushes_into_one_reconciliation() {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);
        let mut backend = Backend::new(64).unwrap();
        let mut sched = RecordingScheduler::new();

        backend.wait_in(&mut sched, Clause(1), 0, a).unwrap();
        // Second direction on an already-cached fd: pushed onto the changelist.
        backend.wait_out(&mut sched, Clause(2), 0, a).unwrap();
        assert_eq!(backend.changelist_head, Some(a));

        unsafe { libc::close(b) };
        let woke = backend.poll(&mut sched, 1_000).unwrap();
        assert!(woke);
        assert_eq!(sched.triggered.len(), 2);
        assert_eq!(backend.changelist_head, None);

        unsafe { libc::close(a) };
    }
}
