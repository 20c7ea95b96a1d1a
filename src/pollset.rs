use std::os::unix::io::RawFd;

use crate::clause::{CancelHandle, Clause, Scheduler};
use crate::config::PollsetConfig;
use crate::error::Result;
use crate::sys;

/// A file-descriptor readiness multiplexer for one worker.
///
/// Coroutines register interest in a descriptor becoming readable
/// ([`wait_in`](Pollset::wait_in)) or writable ([`wait_out`](Pollset::wait_out));
/// [`poll`](Pollset::poll) blocks until the kernel reports at least one of
/// them ready, or `timeout_ms` elapses, and triggers every woken clause
/// through the caller's [`Scheduler`].
///
/// A `Pollset` is not `Send`/`Sync`: it belongs to exactly one worker thread,
/// the same way the coroutine runtime it backs is single-threaded per
/// worker.
pub struct Pollset {
    backend: sys::Backend,
}

impl Pollset {
    /// Create a pollset sized from the process's current `RLIMIT_NOFILE`.
    pub fn init() -> Result<Pollset> {
        Pollset::init_with_config(PollsetConfig::new())
    }

    /// Create a pollset using an explicit [`PollsetConfig`].
    pub fn init_with_config(config: PollsetConfig) -> Result<Pollset> {
        let max_fds = config.resolve_max_fds()?;
        log::debug!("pollset: initializing with max_fds = {max_fds}");
        Ok(Pollset {
            backend: sys::Backend::new(max_fds)?,
        })
    }

    /// Register `clause` to wait for `fd` to become readable.
    ///
    /// Fails with [`PollsetError::AlreadyRegistered`](crate::PollsetError::AlreadyRegistered)
    /// if another clause is already waiting on `(fd, In)`, or
    /// [`PollsetError::BadFd`](crate::PollsetError::BadFd) if `fd` is not a
    /// currently open descriptor. On success, `scheduler.wait_for` is called
    /// exactly once with a [`CancelHandle`] the scheduler can later pass to
    /// [`cancel`](Pollset::cancel).
    pub fn wait_in(
        &mut self,
        scheduler: &mut dyn Scheduler,
        clause: Clause,
        id: i32,
        fd: RawFd,
    ) -> Result<()> {
        self.backend.wait_in(scheduler, clause, id, fd)
    }

    /// Register `clause` to wait for `fd` to become writable. See
    /// [`wait_in`](Pollset::wait_in).
    pub fn wait_out(
        &mut self,
        scheduler: &mut dyn Scheduler,
        clause: Clause,
        id: i32,
        fd: RawFd,
    ) -> Result<()> {
        self.backend.wait_out(scheduler, clause, id, fd)
    }

    /// Tear down a waiter that has not yet fired, identified by the
    /// [`CancelHandle`] handed to the scheduler at registration time. A
    /// no-op if the handle no longer names a live waiter (it already fired,
    /// or the fd was cleaned).
    pub fn cancel(&mut self, handle: CancelHandle) {
        self.backend.cancel(handle.fd, handle.direction)
    }

    /// Drop all cached state for `fd` before it is closed.
    ///
    /// The caller must ensure no clause is currently waiting on `fd` in
    /// either direction; violating this is a programming error and panics,
    /// per spec section 7 ("clean() on a descriptor with a live waiter is a
    /// bug, not a recoverable condition").
    pub fn clean(&mut self, fd: RawFd) {
        self.backend.clean(fd)
    }

    /// Block for at most `timeout_ms` milliseconds (or indefinitely if
    /// negative) waiting for at least one registered descriptor to become
    /// ready, triggering every woken clause through `scheduler`.
    ///
    /// Returns `Ok(true)` if at least one clause was triggered, `Ok(false)`
    /// on a timeout with nothing ready. A signal interrupting the
    /// underlying syscall surfaces as
    /// [`PollsetError::Interrupted`](crate::PollsetError::Interrupted); the
    /// caller re-issues `poll` with whatever timeout remains.
    pub fn poll(&mut self, scheduler: &mut dyn Scheduler, timeout_ms: i32) -> Result<bool> {
        self.backend.poll(scheduler, timeout_ms)
    }
}
