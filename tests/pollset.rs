use std::time::Duration;

use pollset::{Clause, Pollset, PollsetConfig};

mod util;

use util::{close, init, open_regular_file, pipe, socketpair, TestScheduler};

#[test]
fn timeout_with_nothing_registered() {
    init();

    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    let woke = pollset.poll(&mut sched, 50).unwrap();
    assert!(!woke);
    assert!(sched.triggered.is_empty());
}

#[test]
fn readable_pipe_wakes_its_clause() {
    init();

    let (r, w) = pipe();
    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    pollset.wait_in(&mut sched, Clause(1), 0, r).unwrap();
    assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);

    let woke = pollset
        .poll(&mut sched, Duration::from_secs(1).as_millis() as i32)
        .unwrap();
    assert!(woke);
    assert_eq!(sched.triggered, vec![(Clause(1), 0)]);

    pollset.clean(r);
    close(r);
    close(w);
}

#[test]
fn dual_direction_on_one_fd_coalesces_into_one_cycle() {
    init();

    let (a, b) = socketpair();
    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    // `a` is writable immediately (empty send buffer); make it readable too
    // by writing from the peer before the poll cycle.
    assert_eq!(unsafe { libc::write(b, b"y".as_ptr() as *const _, 1) }, 1);

    pollset.wait_in(&mut sched, Clause(1), 0, a).unwrap();
    pollset.wait_out(&mut sched, Clause(2), 0, a).unwrap();

    let woke = pollset.poll(&mut sched, 1_000).unwrap();
    assert!(woke);
    assert_eq!(sched.triggered.len(), 2);
    assert!(sched.triggered.contains(&(Clause(1), 0)));
    assert!(sched.triggered.contains(&(Clause(2), 0)));

    pollset.clean(a);
    close(a);
    close(b);
}

#[test]
fn peer_hangup_wakes_both_directions() {
    init();

    let (a, b) = socketpair();
    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    pollset.wait_in(&mut sched, Clause(1), 0, a).unwrap();
    pollset.wait_out(&mut sched, Clause(2), 0, a).unwrap();

    close(b);

    let woke = pollset.poll(&mut sched, 1_000).unwrap();
    assert!(woke);
    assert_eq!(sched.triggered.len(), 2);

    pollset.clean(a);
    close(a);
}

#[test]
fn already_registered_direction_is_rejected() {
    init();

    let (r, w) = pipe();
    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    pollset.wait_in(&mut sched, Clause(1), 0, r).unwrap();
    let err = pollset.wait_in(&mut sched, Clause(2), 0, r).unwrap_err();
    assert!(matches!(err, pollset::PollsetError::AlreadyRegistered));

    pollset.clean(r);
    close(r);
    close(w);
}

#[test]
fn closed_descriptor_is_rejected() {
    init();

    let (r, w) = pipe();
    close(r);
    close(w);

    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    let err = pollset.wait_in(&mut sched, Clause(1), 0, r).unwrap_err();
    assert!(matches!(err, pollset::PollsetError::BadFd));
}

#[test]
#[cfg(not(feature = "force-old-poll"))]
fn regular_file_is_not_supported() {
    // Only epoll/kqueue reject non-pollable fd kinds up front; the
    // array-poll fallback has no such check (POSIX `poll(2)` always reports
    // regular files as ready), so this is skipped under `force-old-poll`.
    init();

    let fd = open_regular_file();
    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    let err = pollset.wait_in(&mut sched, Clause(1), 0, fd).unwrap_err();
    assert!(matches!(err, pollset::PollsetError::NotSupported));

    close(fd);
}

#[test]
fn cancel_before_firing_unregisters_cleanly() {
    init();

    let (r, w) = pipe();
    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(64)).unwrap();
    let mut sched = TestScheduler::new();

    pollset.wait_in(&mut sched, Clause(1), 0, r).unwrap();
    let handle = *sched.cancels.last().unwrap();
    pollset.cancel(handle);

    // Now writing and polling should wake nothing: the clause was cancelled.
    assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
    let woke = pollset.poll(&mut sched, 50).unwrap();
    assert!(!woke);
    assert!(sched.triggered.is_empty());

    pollset.clean(r);
    close(r);
    close(w);
}

#[test]
fn many_descriptors_wake_independently() {
    init();

    let mut pollset = Pollset::init_with_config(PollsetConfig::new().with_max_fds(256)).unwrap();
    let mut sched = TestScheduler::new();

    let pairs: Vec<_> = (0..8).map(|_| pipe()).collect();
    for (i, (r, _w)) in pairs.iter().enumerate() {
        pollset
            .wait_in(&mut sched, Clause(i as u64), 0, *r)
            .unwrap();
    }
    for (_r, w) in &pairs {
        assert_eq!(unsafe { libc::write(*w, b"x".as_ptr() as *const _, 1) }, 1);
    }

    let woke = pollset.poll(&mut sched, 1_000).unwrap();
    assert!(woke);
    assert_eq!(sched.triggered.len(), pairs.len());

    for (r, w) in pairs {
        pollset.clean(r);
        close(r);
        close(w);
    }
}
