//! Wraps Linux `epoll`. Level-triggered: once a node is reported ready,
//! the caller is expected to retry non-blockingly until it sees
//! `WouldBlock`, at which point it re-registers (see [`crate::scheduler`]).
//! Level triggering was chosen over edge triggering because it keeps the
//! re-arm logic entirely inside `Scheduler::park_io`, rather than needing
//! every [`crate::socket::Socket`] operation to re-arm by hand.

use std::io;
use std::os::unix::io::RawFd;

use smallvec::SmallVec;

use crate::node::Interest;

fn interest_to_epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.contains(Interest::READABLE) {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

fn epoll_bits_to_interest(bits: u32) -> Interest {
    let mut interest = Interest::empty();
    if bits & (libc::EPOLLIN as u32) != 0 {
        interest |= Interest::READABLE;
    }
    if bits & (libc::EPOLLOUT as u32) != 0 {
        interest |= Interest::WRITABLE;
    }
    // EPOLLHUP/EPOLLERR imply the fd is actionable in both directions;
    // the socket layer's next syscall will surface the real error.
    if bits & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
        interest = Interest::READABLE | Interest::WRITABLE;
    }
    interest
}

/// Thin wrapper over an `epoll` instance.
pub struct Poller {
    epfd: RawFd,
    capacity: usize,
}

impl Poller {
    /// Create a new poller with a readiness batch capacity hint.
    pub fn new(capacity: usize) -> io::Result<Self> {
        // SAFETY: epoll_create1 has no preconditions; we check its
        // return value for failure below.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd, capacity: capacity.max(1) })
    }

    /// Begin watching `fd` for `interest`. Fails if `fd` is already
    /// registered with this poller.
    pub fn add(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll_bits(interest),
            u64: token,
        };
        // SAFETY: `ev` is a valid, fully initialized epoll_event and
        // `epfd`/`fd` are both open for the duration of this call.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Change the watched event set for `fd`. A no-op if `interest`
    /// already matches the last call to `add`/`modify`.
    pub fn modify(&self, fd: RawFd, interest: Interest, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_to_epoll_bits(interest),
            u64: token,
        };
        // SAFETY: same as `add`; EPOLL_CTL_MOD requires `fd` to already
        // be registered, which is an invariant the scheduler maintains.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Stop watching `fd`. Safe to call even if `fd` was never added or
    /// was already removed.
    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: EPOLL_CTL_DEL ignores the `event` argument on Linux but
        // the syscall still requires a non-null pointer pre-2.6.9; we pass
        // a throwaway value for portability.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Block for at most `timeout_ms` (0 = return immediately, negative =
    /// forever) and return every `(token, ready_interest)` pair that
    /// became ready. Each token appears at most once.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<SmallVec<[(u64, Interest); 16]>> {
        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; self.capacity];
        // SAFETY: `buf` is a valid, writable buffer of `capacity` events
        // that outlives the call.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.as_mut_ptr(),
                buf.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(SmallVec::new());
            }
            return Err(err);
        }
        let mut out = SmallVec::new();
        for ev in &buf[..n as usize] {
            out.push((ev.u64, epoll_bits_to_interest(ev.events as u32)));
        }
        Ok(out)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: epfd was opened by this struct and is not used after
        // this point.
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn make_pipe() -> (std::fs::File, std::fs::File) {
        let mut fds = [0i32; 2];
        // SAFETY: `fds` is a valid 2-element buffer.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        unsafe {
            use std::os::unix::io::FromRawFd;
            (std::fs::File::from_raw_fd(fds[0]), std::fs::File::from_raw_fd(fds[1]))
        }
    }

    #[test]
    fn wait_reports_readable_pipe() {
        let poller = Poller::new(16).unwrap();
        let (reader, mut writer) = make_pipe();
        poller.add(reader.as_raw_fd(), Interest::READABLE, 42).unwrap();

        use std::io::Write;
        writer.write_all(b"x").unwrap();

        let ready = poller.wait(1_000).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 42);
        assert!(ready[0].1.contains(Interest::READABLE));

        poller.remove(reader.as_raw_fd()).unwrap();
    }

    #[test]
    fn modify_with_same_interest_is_a_noop() {
        let poller = Poller::new(16).unwrap();
        let (reader, _writer) = make_pipe();
        poller.add(reader.as_raw_fd(), Interest::READABLE, 7).unwrap();
        poller.modify(reader.as_raw_fd(), Interest::READABLE, 7).unwrap();
        poller.remove(reader.as_raw_fd()).unwrap();
    }

    #[test]
    fn remove_is_safe_when_not_registered() {
        let poller = Poller::new(16).unwrap();
        let (reader, _writer) = make_pipe();
        assert!(poller.remove(reader.as_raw_fd()).is_ok());
    }

    #[test]
    fn wait_times_out_with_no_events() {
        let poller = Poller::new(16).unwrap();
        let ready = poller.wait(10).unwrap();
        assert!(ready.is_empty());
    }
}
