//! Backend selection. Exactly one of `poll`, `epoll`, `kqueue` is compiled,
//! chosen by `cfg(target_os = ..)` (or forced by the `force-old-poll`
//! feature); see the `cfg_*_backend!` macros in `crate::macros`.

cfg_epoll_backend! {
    mod epoll;
    pub(crate) use self::epoll::Backend;
}

cfg_kqueue_backend! {
    mod kqueue;
    pub(crate) use self::kqueue::Backend;
}

cfg_poll_backend! {
    mod poll;
    pub(crate) use self::poll::Backend;
}
