use std::mem::MaybeUninit;

use crate::error::{PollsetError, Result};

/// A fallback descriptor table size used when `getrlimit` itself fails.
///
/// This only matters on a system broken enough that `RLIMIT_NOFILE` can't be
/// read at all; it exists so `init` has a sane default instead of failing
/// outright.
const DEFAULT_MAX_FDS: usize = 4096;

/// Configuration for [`Pollset::init`](crate::Pollset::init).
///
/// By default the descriptor table is sized from the process's current
/// `RLIMIT_NOFILE` soft limit (spec section 3: "a build-time or boot-time
/// upper bound on descriptor values"). Call [`PollsetConfig::with_max_fds`]
/// to pin it to a fixed value instead, e.g. when the embedding runtime
/// already tracks the limit itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollsetConfig {
    max_fds: Option<usize>,
}

impl PollsetConfig {
    /// A config that resolves `MaxFds` from `getrlimit(RLIMIT_NOFILE)` at
    /// `init` time.
    pub fn new() -> PollsetConfig {
        PollsetConfig { max_fds: None }
    }

    /// Override the descriptor table size instead of querying the kernel.
    pub fn with_max_fds(mut self, max_fds: usize) -> PollsetConfig {
        self.max_fds = Some(max_fds);
        self
    }

    /// Resolve the `MaxFds` this config implies.
    pub(crate) fn resolve_max_fds(&self) -> Result<usize> {
        if let Some(max_fds) = self.max_fds {
            return Ok(max_fds);
        }

        // SAFETY: `rlimit` is a plain-old-data struct; `getrlimit` fills it
        // in completely on success.
        let mut rlim = MaybeUninit::<libc::rlimit>::uninit();
        let max_fds = match syscall!(getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr())) {
            Ok(_) => {
                let rlim = unsafe { rlim.assume_init() };
                if rlim.rlim_cur == libc::RLIM_INFINITY || rlim.rlim_cur == 0 {
                    DEFAULT_MAX_FDS
                } else {
                    rlim.rlim_cur as usize
                }
            }
            Err(_) => {
                log::debug!("getrlimit(RLIMIT_NOFILE) failed, falling back to a default");
                DEFAULT_MAX_FDS
            }
        };

        if max_fds == 0 {
            return Err(PollsetError::OutOfMemory);
        }
        Ok(max_fds)
    }
}
