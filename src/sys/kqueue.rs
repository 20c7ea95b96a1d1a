//! BSD/macOS kqueue backend (spec section 4.4).
//!
//! Like the epoll backend, registrations are batched: `EV_ADD`/`EV_DELETE`
//! changes accumulate per fd and are flushed through `kevent` in one or two
//! calls per `poll` cycle rather than one `kevent` call per `wait_in`/
//! `wait_out`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use crate::clause::{CancelHandle, Clause, Direction, Scheduler};
use crate::error::{PollsetError, Result};
use crate::table::FdTable;
use crate::waiter::Waiter;

const IN_BIT: u8 = 0b01;
const OUT_BIT: u8 = 0b10;

/// Upper bound on how many raw `kevent` change entries we'll batch into a
/// single `kevent()` call before flushing early (two entries per fd: one
/// per filter).
const CHANGE_BATCH: usize = 256;
const MAX_EVENTS: usize = 128;

#[derive(Debug, Clone, Default)]
pub(crate) struct ReactorExt {
    currevs: u8,
    /// Changelist link: `None` iff this fd has no pending reconciliation.
    next: Option<RawFd>,
}

pub(crate) struct Backend {
    table: FdTable<ReactorExt>,
    kq: OwnedFd,
    changelist_head: Option<RawFd>,
    events: Vec<libc::kevent>,
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

fn kevent_zeroed() -> libc::kevent {
    libc::kevent {
        ident: 0,
        filter: 0,
        flags: 0,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

impl Backend {
    pub(crate) fn new(max_fds: usize) -> Result<Backend> {
        let kq = match syscall!(kqueue()) {
            Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
            Err(e) if e.raw_os_error() == Some(libc::ENOMEM) || e.raw_os_error() == Some(libc::EMFILE) => {
                return Err(PollsetError::OutOfMemory)
            }
            Err(e) => panic!("kqueue() failed unexpectedly: {e}"),
        };
        Ok(Backend {
            table: FdTable::with_capacity(max_fds),
            kq,
            changelist_head: None,
            events: vec![kevent_zeroed(); MAX_EVENTS],
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
            let filter = filter_for(direction);
            let mut ev = change(fd, filter, libc::EV_ADD | libc::EV_CLEAR);
            match syscall!(kevent(
                self.kq.as_raw_fd(),
                &mut ev,
                1,
                ptr::null_mut(),
                0,
                ptr::null()
            )) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => return Err(PollsetError::BadFd),
                Err(e)
                    if e.raw_os_error() == Some(libc::ENODEV)
                        || e.raw_os_error() == Some(libc::EPERM) =>
                {
                    return Err(PollsetError::NotSupported)
                }
                Err(e) => panic!("kevent(ADD, {fd}) failed unexpectedly: {e}"),
            }
            slot.cached = true;
            slot.ext.currevs = direction_bit(direction);
            slot.ext.next = None;
        } else if slot.ext.next.is_none() {
            slot.ext.next = self.changelist_head;
            self.changelist_head = Some(fd);
        }

        *slot.waiter_mut(direction) = Some(Waiter { clause, id });
        log::trace!("kqueue backend: registered fd {fd} for {direction:?}");
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
        let currevs = slot.ext.currevs;
        let mut deletes = [kevent_zeroed(); 2];
        let mut n = 0;
        if currevs & IN_BIT != 0 {
            deletes[n] = change(fd, libc::EVFILT_READ, libc::EV_DELETE);
            n += 1;
        }
        if currevs & OUT_BIT != 0 {
            deletes[n] = change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
            n += 1;
        }
        if n > 0 {
            // Individual deletes may independently fail with ENOENT if the
            // kernel already dropped the registration (e.g. the fd was
            // closed behind our back); kevent applies changes best-effort
            // and doesn't distinguish which of the batch failed, so we
            // retry one at a time instead of trusting a single batched call.
            for c in &mut deletes[..n] {
                match syscall!(kevent(self.kq.as_raw_fd(), c, 1, ptr::null_mut(), 0, ptr::null())) {
                    Ok(_) => {}
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                    Err(e) => panic!("kevent(DELETE, {fd}) failed unexpectedly: {e}"),
                }
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

    /// Build the raw `EV_ADD`/`EV_DELETE` change list for every fd queued
    /// since the last flush, applying it in one `kevent` call (chunked at
    /// `CHANGE_BATCH` entries; each kqueue backend caps its own batch the
    /// way spec section 4.4 describes for its changelist).
    fn apply_changes(&mut self) {
        let mut changes = Vec::new();
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

            if desired & IN_BIT != currevs & IN_BIT {
                let flags = if desired & IN_BIT != 0 {
                    libc::EV_ADD | libc::EV_CLEAR
                } else {
                    libc::EV_DELETE
                };
                changes.push(change(fd, libc::EVFILT_READ, flags));
            }
            if desired & OUT_BIT != currevs & OUT_BIT {
                let flags = if desired & OUT_BIT != 0 {
                    libc::EV_ADD | libc::EV_CLEAR
                } else {
                    libc::EV_DELETE
                };
                changes.push(change(fd, libc::EVFILT_WRITE, flags));
            }
            if let Ok(slot) = self.table.get_mut(fd) {
                slot.ext.currevs = desired;
            }
            cursor = next;
        }

        for chunk in changes.chunks_mut(CHANGE_BATCH) {
            match syscall!(kevent(
                self.kq.as_raw_fd(),
                chunk.as_mut_ptr(),
                chunk.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null()
            )) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => panic!("kevent(changelist flush) failed unexpectedly: {e}"),
            }
        }
    }

    pub(crate) fn poll(&mut self, scheduler: &mut dyn Scheduler, timeout_ms: i32) -> Result<bool> {
        self.apply_changes();

        let ts = if timeout_ms < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            })
        };
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const _);

        let n = match syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            ts_ptr,
        )) {
            Ok(n) => n,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => return Err(PollsetError::Interrupted),
            Err(e) => panic!("kevent(wait) failed unexpectedly: {e}"),
        };
        if n == 0 {
            return Ok(false);
        }

        let mut fired = false;
        for ev in &self.events[..n as usize] {
            let fd = ev.ident as RawFd;
            let is_eof = ev.flags & libc::EV_EOF != 0;
            let is_read = ev.filter == libc::EVFILT_READ;
            let is_write = ev.filter == libc::EVFILT_WRITE;

            let Ok(slot) = self.table.get_mut(fd) else {
                continue;
            };
            // EOF on either filter implies both directions are ready: the
            // peer is gone, so neither read nor write will ever block again.
            if (is_read || is_eof) && slot.in_waiter.is_some() {
                let w = slot.in_waiter.take().unwrap();
                scheduler.trigger(w.clause, 0);
                fired = true;
            }
            if (is_write || is_eof) && slot.out_waiter.is_some() {
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

fn filter_for(direction: Direction) -> i16 {
    match direction {
        Direction::In => libc::EVFILT_READ,
        Direction::Out => libc::EVFILT_WRITE,
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
    fn pipe_ready_triggers() {
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
    fn hangup_triggers_both_directions() {
        let mut fds = [0; 2];
        assert_eq!(
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
            0
        );
        let (a, b) = (fds[0], fds[1]);
        let mut backend = Backend::new(64).unwrap();
        let mut sched = RecordingScheduler::new();

        backend.wait_in(&mut sched, Clause(1), 0, a).unwrap();
        backend.wait_out(&mut sched, Clause(2), 0, a).unwrap();

        unsafe { libc::close(b) };

        let woke = backend.poll(&mut sched, 1_000).unwrap();
        assert!(woke);
        assert_eq!(sched.triggered.len(), 2);

        unsafe { libc::close(a) };
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
}
