//! `pollset` is the file-descriptor readiness multiplexer for a cooperative,
//! single-threaded coroutine runtime.
//!
//! A [`Pollset`] belongs to exactly one worker. Coroutines register interest
//! in a file descriptor becoming readable or writable via [`Pollset::wait_in`]
//! / [`Pollset::wait_out`]; [`Pollset::poll`] blocks until the kernel reports
//! at least one of them ready (or a timeout elapses) and triggers the
//! waiting clauses through the [`Scheduler`] trait.
//!
//! Exactly one backend is compiled in, chosen by `cfg(target_os = ..)`: an
//! `epoll` reactor on Linux/Android/illumos/Redox, a `kqueue` reactor on the
//! BSDs and macOS, and a plain `poll(2)` array scan everywhere else (or
//! anywhere with the `force-old-poll` feature enabled). See [`sys`] for the
//! backend implementations and [`Pollset`] for the shared public API.
//!
//! This crate does not implement the coroutine scheduler, clause/choose
//! semantics, stack switching, or timers -- it only calls into them through
//! [`Scheduler`].

#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
mod macros;

mod clause;
mod config;
mod error;
mod pollset;
mod sys;
mod table;
mod waiter;

pub use clause::{CancelHandle, Clause, Direction, Scheduler};
pub use config::PollsetConfig;
pub use error::{PollsetError, Result};
pub use pollset::Pollset;
