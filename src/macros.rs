//! Macros to ease conditional code based on the selected backend.

#![allow(unused_macros)]

/// Helper macro to execute a system call that returns an `io::Result`.
//
// Macro must be defined before any modules that use it.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// The `epoll` backend is selected: `os-poll` requirements met, running on a
/// kernel with epoll, and `force-old-poll` not set.
macro_rules! cfg_epoll_backend {
    ($($item:item)*) => {
        $(
            #[cfg(all(
                any(
                    target_os = "android",
                    target_os = "illumos",
                    target_os = "linux",
                    target_os = "redox",
                ),
                not(feature = "force-old-poll")
            ))]
            $item
        )*
    };
}

/// The `kqueue` backend is selected.
macro_rules! cfg_kqueue_backend {
    ($($item:item)*) => {
        $(
            #[cfg(all(
                any(
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd",
                ),
                not(feature = "force-old-poll")
            ))]
            $item
        )*
    };
}

/// The `poll` backend is selected: either a platform without epoll/kqueue,
/// or `force-old-poll` forced it.
macro_rules! cfg_poll_backend {
    ($($item:item)*) => {
        $(
            #[cfg(any(
                not(any(
                    target_os = "android",
                    target_os = "illumos",
                    target_os = "linux",
                    target_os = "redox",
                    target_os = "dragonfly",
                    target_os = "freebsd",
                    target_os = "ios",
                    target_os = "macos",
                    target_os = "netbsd",
                    target_os = "openbsd",
                )),
                feature = "force-old-poll"
            ))]
            $item
        )*
    };
}
