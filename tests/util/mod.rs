#![allow(dead_code)]

use std::os::unix::io::RawFd;
use std::sync::Once;

use pollset::{CancelHandle, Clause, Scheduler};

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    })
}

/// Records every `trigger` call it receives; stands in for the coroutine
/// scheduler these integration tests don't have.
#[derive(Default)]
pub struct TestScheduler {
    pub triggered: Vec<(Clause, i32)>,
    pub cancels: Vec<CancelHandle>,
}

impl TestScheduler {
    pub fn new() -> TestScheduler {
        TestScheduler::default()
    }
}

impl Scheduler for TestScheduler {
    fn wait_for(&mut self, _clause: Clause, _id: i32, cancel: CancelHandle) {
        self.cancels.push(cancel);
    }

    fn trigger(&mut self, clause: Clause, rc: i32) {
        self.triggered.push((clause, rc));
    }
}

pub fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

pub fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) },
        0
    );
    (fds[0], fds[1])
}

pub fn open_regular_file() -> RawFd {
    let path = b"/dev/null\0";
    let fd = unsafe { libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY) };
    assert!(fd >= 0, "open(/dev/null) failed");
    fd
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
