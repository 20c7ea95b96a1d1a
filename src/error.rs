use std::fmt;

/// The surface-visible error taxonomy of [`Pollset`](crate::Pollset).
///
/// Internal invariant violations (`clean` called on a descriptor with a live
/// waiter, a slot/array mismatch, an unexpected kernel return code) are not
/// part of this enum: this layer treats them as bugs and panics rather than
/// trying to recover from a corrupted data structure (spec section 7).
#[derive(Debug)]
pub enum PollsetError {
    /// Registration targeted a closed or never-opened descriptor.
    BadFd,
    /// Another clause already holds the `(fd, direction)` slot.
    AlreadyRegistered,
    /// The kernel refuses to poll this fd kind (regular files, `/dev/null`,
    /// some pseudo-terminals, ...).
    NotSupported,
    /// Allocating the descriptor table or the kernel-side pollset failed.
    OutOfMemory,
    /// The underlying wait was aborted by a signal before any event fired.
    /// Not fatal: the caller should retry.
    Interrupted,
}

impl fmt::Display for PollsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollsetError::BadFd => "descriptor is not open",
            PollsetError::AlreadyRegistered => {
                "another clause is already registered for this (fd, direction)"
            }
            PollsetError::NotSupported => "descriptor kind cannot be polled by this backend",
            PollsetError::OutOfMemory => "failed to allocate pollset state",
            PollsetError::Interrupted => "wait interrupted by a signal",
        })
    }
}

impl std::error::Error for PollsetError {}

pub type Result<T> = std::result::Result<T, PollsetError>;
