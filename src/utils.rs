use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::{io, ptr};

use nix::libc;
use nix::sys::epoll::{Epoll, EpollEvent};

/// Calls `epoll_ctl` with a raw descriptor.
///
/// `nix::sys::epoll::Epoll` only accepts `AsFd`, but removal has to work on a
/// descriptor number whose file may already have been closed by its owner.
pub fn epoll_ctl(
    epfd: &Epoll,
    op: libc::c_int,
    fd: RawFd,
    mut event: Option<EpollEvent>,
) -> io::Result<()> {
    let event = match event.as_mut() {
        Some(ev) => (ev as *mut EpollEvent).cast::<libc::epoll_event>(),
        None => ptr::null_mut(),
    };
    let ret = unsafe { libc::epoll_ctl(epfd.0.as_raw_fd(), op, fd, event) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// `true` for the errors `EPOLL_CTL_DEL` reports once the descriptor is gone:
/// closed (`EBADF`) or closed and its number reused (`ENOENT`).
pub fn is_stale_fd(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT))
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves the guarded data consistent
/// before it can unwind, so a poisoned lock carries no broken invariant.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
