use std::os::unix::io::RawFd;

/// Which direction a clause is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Waiting for the descriptor to become readable.
    In,
    /// Waiting for the descriptor to become writable.
    Out,
}

/// An opaque handle to a clause owned by the scheduler.
///
/// `Pollset` never looks inside a `Clause`; it only threads it back through
/// [`Scheduler::trigger`] when the clause's descriptor becomes ready. Two
/// clauses compare equal iff they name the same waiting coroutine alternative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Clause(pub u64);

/// What the scheduler hands back to [`Pollset::cancel`](crate::Pollset::cancel)
/// to tear down a waiter before it fires.
///
/// This is the idiomatic-Rust stand-in for the "cleanup callback" described
/// in the spec: rather than `Pollset` handing the scheduler a closure that
/// captures `Pollset` itself, the scheduler holds this small `Copy` value and
/// calls back into `Pollset` directly when a clause is cancelled (e.g.
/// because a sibling alternative in the same `choose` fired first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancelHandle {
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
}

/// The host scheduler's half of the contract with [`Pollset`].
///
/// Implemented by the coroutine runtime that owns this worker's `Pollset`;
/// out of scope for this crate beyond the trait boundary itself. `Pollset`
/// only ever calls into a `Scheduler`, never the reverse.
pub trait Scheduler {
    /// Link `clause` into the scheduler's own bookkeeping for its `choose`
    /// alternative, recording `id` as the caller-supplied tag for this wait
    /// and `cancel` as the handle to pass back to [`Pollset::cancel`] if the
    /// clause needs to be torn down before it fires.
    fn wait_for(&mut self, clause: Clause, id: i32, cancel: CancelHandle);

    /// Resume the coroutine owning `clause` with result code `rc`. Mio-style
    /// backends call this once per ready `(fd, direction)` per poll cycle.
    fn trigger(&mut self, clause: Clause, rc: i32);
}
