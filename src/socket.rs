//! Cooperative socket I/O: a file descriptor, its [`SchedNode`], and a
//! pluggable [`SocketClass`] dispatch table. Every operation here runs in
//! the context of whichever task calls it and follows one suspension
//! protocol: try the syscall non-blockingly, park on the poller if it
//! would block, and on resume either retry, fail with `timeout`, or fail
//! with `cancelled`.

use std::cell::Cell;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::addr::Addr;
use crate::buffer::GrowableBuf;
use crate::error::{Error, Result};
use crate::node::{Interest, SchedNode, WakeCause};
use crate::scheduler::Scheduler;
use crate::task::TaskId;

const READ_CHUNK: usize = 4096;

/// Address family a socket is opened for. POSIX requires this at
/// `socket(2)` time; the distilled operation table omits it only because
/// it takes it for granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    V4,
    V6,
}

impl Domain {
    fn to_af(self) -> i32 {
        match self {
            Domain::V4 => libc::AF_INET,
            Domain::V6 => libc::AF_INET6,
        }
    }

    /// The family that would carry `addr`.
    pub fn of(addr: &Addr) -> Self {
        match addr {
            Addr::V4(_) => Domain::V4,
            Addr::V6(_) => Domain::V6,
        }
    }
}

/// Capability dispatch table specializing I/O behavior for a socket
/// variant. [`Tcp`] and [`Udp`] are the defaults; a TLS or other layered
/// class wraps one of these and delegates, overriding only the methods
/// whose semantics change (typically `read`/`write`).
pub trait SocketClass {
    /// `SOCK_STREAM` or `SOCK_DGRAM`.
    fn socket_type(&self) -> i32;

    fn open(&self, domain: Domain) -> io::Result<RawFd> {
        // SAFETY: `domain.to_af()` and `self.socket_type()` are valid
        // libc constants; the return value is checked below.
        let fd = unsafe {
            libc::socket(
                domain.to_af(),
                self.socket_type() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn close(&self, fd: RawFd) {
        // SAFETY: caller guarantees `fd` is open and unused afterward.
        unsafe {
            libc::close(fd);
        }
    }

    fn dup(&self, fd: RawFd) -> io::Result<RawFd> {
        // SAFETY: `fd` is a valid, currently open descriptor.
        let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if new_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(new_fd)
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` writable bytes for the
        // duration of the call.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        check_ssize(n)
    }

    fn recvfrom(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Addr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: `buf`, `storage`, and `len` are all valid for the
        // duration of the call.
        let n = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        let n = check_ssize(n)?;
        let addr = sockaddr_storage_to_addr(&storage)?;
        Ok((n, addr))
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is valid for `buf.len()` readable bytes for the
        // duration of the call.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        check_ssize(n)
    }

    fn writev(&self, fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
        let iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.as_ptr() as *mut _,
                iov_len: b.len(),
            })
            .collect();
        // SAFETY: every iovec borrows a slice that outlives this call.
        let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };
        check_ssize(n)
    }

    fn sendto(&self, fd: RawFd, buf: &[u8], dst: Addr) -> io::Result<usize> {
        let (storage, len) = addr_to_sockaddr(dst);
        // SAFETY: `buf` and `storage` are both valid for the duration of
        // the call.
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const _,
                buf.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        check_ssize(n)
    }

    fn sendfile(&self, fd: RawFd, in_fd: RawFd, offset: &mut i64, count: usize) -> io::Result<usize> {
        // SAFETY: `offset` is a valid pointer to an in/out `off_t` for the
        // duration of the call.
        let n = unsafe { libc::sendfile(fd, in_fd, offset as *mut i64, count) };
        check_ssize(n)
    }
}

/// Default TCP class.
pub struct Tcp;

impl SocketClass for Tcp {
    fn socket_type(&self) -> i32 {
        libc::SOCK_STREAM
    }
}

/// Default UDP class.
pub struct Udp;

impl SocketClass for Udp {
    fn socket_type(&self) -> i32 {
        libc::SOCK_DGRAM
    }
}

fn check_ssize(n: libc::ssize_t) -> io::Result<usize> {
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn addr_to_sockaddr(addr: Addr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        Addr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // SAFETY: `storage` is large enough to hold a `sockaddr_in`
            // and is exclusively owned here.
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        Addr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            // SAFETY: `storage` is large enough to hold a `sockaddr_in6`
            // and is exclusively owned here.
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

fn sockaddr_storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<Addr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            // SAFETY: `ss_family` confirms the stored sockaddr is
            // `sockaddr_in`-sized and laid out accordingly.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(sin.sin_port);
            Ok(Addr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            // SAFETY: `ss_family` confirms the stored sockaddr is
            // `sockaddr_in6`-sized and laid out accordingly.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(Addr::V6(SocketAddrV6::new(
                ip,
                port,
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

fn raw_connect(fd: RawFd, dst: Addr) -> io::Result<()> {
    let (storage, len) = addr_to_sockaddr(dst);
    // SAFETY: `storage`/`len` describe a valid sockaddr for the call.
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        return Err(err);
    }
    Ok(())
}

fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `err`/`len` are valid for the duration of the call.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

fn raw_bind(fd: RawFd, dst: Addr, backlog: i32, listen: bool) -> io::Result<()> {
    let (storage, len) = addr_to_sockaddr(dst);
    // SAFETY: `storage`/`len` describe a valid sockaddr for the call.
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if listen {
        // SAFETY: `fd` was just bound above.
        let rc = unsafe { libc::listen(fd, backlog) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn raw_accept(fd: RawFd) -> io::Result<(RawFd, Addr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: `storage`/`len` are valid for the duration of the call.
    let fd2 = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd2 < 0 {
        return Err(io::Error::last_os_error());
    }
    let addr = sockaddr_storage_to_addr(&storage)?;
    Ok((fd2, addr))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn advance_offsets(offsets: &mut [usize], buffers: &[&[u8]], mut n: usize) {
    for (off, buf) in offsets.iter_mut().zip(buffers) {
        let remaining = buf.len() - *off;
        if remaining == 0 {
            continue;
        }
        let take = remaining.min(n);
        *off += take;
        n -= take;
        if n == 0 {
            break;
        }
    }
}

/// A file descriptor plus its scheduling node and class dispatch table.
/// Dropping a `Socket` unregisters it from the poller and closes its fd;
/// this is the Rust-idiomatic form of the spec's separate `close`/
/// `destroy` operations.
pub struct Socket {
    sched: Scheduler,
    node: Rc<SchedNode>,
    class: Rc<dyn SocketClass>,
    owner_task: TaskId,
    io_calls: Cell<u32>,
    parent_fd: Option<RawFd>,
}

impl Socket {
    /// Open a fresh, unbound socket of `class` for `domain`, owned by the
    /// calling task.
    pub fn new(sched: &Scheduler, class: Rc<dyn SocketClass>, domain: Domain) -> Result<Socket> {
        let fd = class.open(domain).map_err(Error::from_io)?;
        let node = Rc::new(SchedNode::new(fd));
        sched.register_node(node.clone());
        let owner = sched
            .current_task()
            .expect("Socket::new called outside a task context")
            .id;
        sched.attach_owned_socket(owner, fd);
        Ok(Socket {
            sched: sched.clone(),
            node,
            class,
            owner_task: owner,
            io_calls: Cell::new(0),
            parent_fd: None,
        })
    }

    /// Duplicate this socket's fd and register a new `Socket` for it on
    /// `dest_sched`, owned by whatever task is current there. In
    /// practice this is only meaningful when `dest_sched` is being
    /// driven by the calling thread (typically the same scheduler):
    /// `Scheduler` is `!Send`, so a cross-thread peer's registries
    /// cannot be touched from here.
    pub fn dup(&self, dest_sched: &Scheduler) -> Result<Socket> {
        let fd = self.class.dup(self.node.fd()).map_err(Error::from_io)?;
        let node = Rc::new(SchedNode::new(fd));
        dest_sched.register_node(node.clone());
        let owner = dest_sched
            .current_task()
            .expect("dup called outside a task context on dest_sched")
            .id;
        dest_sched.attach_owned_socket(owner, fd);
        Ok(Socket {
            sched: dest_sched.clone(),
            node,
            class: self.class.clone(),
            owner_task: owner,
            io_calls: Cell::new(0),
            parent_fd: None,
        })
    }

    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.node.fd()
    }

    /// The listener's fd this socket was accepted from, if any. Weak
    /// back-reference kept only for accounting (spec §3/§9).
    pub fn parent_fd(&self) -> Option<RawFd> {
        self.parent_fd
    }

    /// Set the deadline the next blocking operation on the *calling
    /// task* will use. `ms = 0` disables it. Not tied to this socket
    /// specifically: the deadline lives on the task, matching the spec's
    /// `socket_timeout(ms)` semantics of "consumed by the next blocking
    /// op", which may be on a different socket.
    pub fn timeout(&self, ms: u64) {
        let task = self
            .sched
            .current_task()
            .expect("timeout called outside a task context");
        task.pending_timeout_ms.set(if ms == 0 { None } else { Some(ms) });
    }

    /// Bind to `dst` and, for stream classes, start listening with
    /// `backlog`. Never blocks.
    pub fn bind(&self, dst: Addr, backlog: i32) -> Result<()> {
        let listen = self.class.socket_type() == libc::SOCK_STREAM;
        raw_bind(self.node.fd(), dst, backlog, listen).map_err(Error::from_io)
    }

    /// Connect to `dst`, suspending on writable readiness until the
    /// handshake resolves.
    pub async fn connect(&self, dst: Addr) -> Result<()> {
        match raw_connect(self.node.fd(), dst) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.block_on_io(Interest::WRITABLE, || take_socket_error(self.node.fd()))
                    .await
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    /// Accept one pending connection, suspending on readable readiness.
    /// The returned socket is owned by the calling task.
    pub async fn accept(&self) -> Result<(Socket, Addr)> {
        let (fd, addr) = self
            .block_on_io(Interest::READABLE, || raw_accept(self.node.fd()))
            .await?;
        let node = Rc::new(SchedNode::new(fd));
        self.sched.register_node(node.clone());
        let owner = self
            .sched
            .current_task()
            .expect("accept called outside a task context")
            .id;
        self.sched.attach_owned_socket(owner, fd);
        Ok((
            Socket {
                sched: self.sched.clone(),
                node,
                class: self.class.clone(),
                owner_task: owner,
                io_calls: Cell::new(0),
                parent_fd: Some(self.node.fd()),
            },
            addr,
        ))
    }

    /// Read up to `buf.len()` bytes. `0` means the peer closed the
    /// connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.block_on_io(Interest::READABLE, || self.class.read(self.node.fd(), buf))
            .await
    }

    /// Read one datagram (or stream chunk) plus its source address.
    pub async fn recvfrom(&self, buf: &mut [u8]) -> Result<(usize, Addr)> {
        self.block_on_io(Interest::READABLE, || {
            self.class.recvfrom(self.node.fd(), buf)
        })
        .await
    }

    /// Write `buf`, possibly short.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.block_on_io(Interest::WRITABLE, || self.class.write(self.node.fd(), buf))
            .await
    }

    /// Write every buffer in `buffers` in order, re-parking on short
    /// writes until the whole sequence is drained. Returns total bytes
    /// written.
    pub async fn writev(&self, buffers: &[&[u8]]) -> Result<usize> {
        let mut offsets = vec![0usize; buffers.len()];
        let mut total = 0usize;
        // Resolved lazily on the first real suspend, then reused for every
        // later retry of this same call so the configured timeout bounds
        // the whole write, not just its first park (see
        // `Scheduler::take_io_deadline`).
        let mut deadline: Option<u64> = None;
        let mut deadline_resolved = false;
        loop {
            let remaining: Vec<&[u8]> = buffers
                .iter()
                .zip(&offsets)
                .map(|(b, &off)| &b[off..])
                .filter(|s| !s.is_empty())
                .collect();
            if remaining.is_empty() {
                self.io_calls.set(0);
                return Ok(total);
            }
            match self.class.writev(self.node.fd(), &remaining) {
                Ok(n) => {
                    self.io_calls.set(0);
                    total += n;
                    advance_offsets(&mut offsets, buffers, n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !deadline_resolved {
                        deadline = self.sched.take_io_deadline();
                        deadline_resolved = true;
                    }
                    match self.sched.park_io(&self.node, Interest::WRITABLE, deadline).await? {
                        WakeCause::IoReady => {
                            let calls = self.io_calls.get() + 1;
                            if calls >= self.sched.config().max_io_calls {
                                self.io_calls.set(0);
                                self.sched.yield_now().await;
                            } else {
                                self.io_calls.set(calls);
                            }
                        }
                        WakeCause::Timeout => return Err(Error::Timeout),
                        WakeCause::Cancelled => return Err(Error::Cancelled),
                        WakeCause::None => unreachable!("park_io resolved with WakeCause::None"),
                    }
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }

    /// Send one datagram to `dst`.
    pub async fn sendto(&self, buf: &[u8], dst: Addr) -> Result<usize> {
        self.block_on_io(Interest::WRITABLE, || {
            self.class.sendto(self.node.fd(), buf, dst)
        })
        .await
    }

    /// Read one chunk and append it to `buf`, growing `buf` as needed.
    /// Returns the number of bytes appended; `0` means the peer closed
    /// the connection.
    pub async fn readb(&self, buf: &mut dyn GrowableBuf) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.read(&mut chunk).await?;
        buf.append(&chunk[..n]);
        Ok(n)
    }

    /// Accumulate into `buf` until `delim` is found (which may span
    /// multiple reads) or `max` bytes have been accumulated. Returns the
    /// total bytes in `buf` including the delimiter, or `0` on EOF before
    /// any delimiter was seen.
    pub async fn readline(&self, buf: &mut dyn GrowableBuf, delim: &[u8], max: usize) -> Result<usize> {
        loop {
            let before = buf.len();
            if before >= max {
                return Err(Error::Overflow { max });
            }
            let want = (max - before).min(READ_CHUNK);
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Ok(0);
            }
            buf.append(&chunk[..n]);

            let scan_start = before.saturating_sub(delim.len().saturating_sub(1));
            if let Some(pos) = find_subslice(&buf.as_slice()[scan_start..], delim) {
                return Ok(scan_start + pos + delim.len());
            }
            if buf.len() >= max {
                return Err(Error::Overflow { max });
            }
        }
    }

    /// Read exactly `expected.len()` bytes, failing as soon as a byte
    /// diverges from `expected` without reading past it.
    pub async fn expect(&self, buf: &mut dyn GrowableBuf, expected: &[u8]) -> Result<usize> {
        while buf.len() < expected.len() {
            let before = buf.len();
            let want = expected.len() - before;
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.read(&mut chunk[..want.min(READ_CHUNK)]).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
            let new_bytes = &chunk[..n];
            for (i, &b) in new_bytes.iter().enumerate() {
                if b != expected[before + i] {
                    buf.append(&new_bytes[..i]);
                    return Err(Error::Mismatch { offset: before + i });
                }
            }
            buf.append(new_bytes);
        }
        Ok(expected.len())
    }

    /// Write the entirety of `buf`.
    pub async fn writeb(&self, buf: &dyn GrowableBuf) -> Result<usize> {
        self.writev(&[buf.as_slice()]).await
    }

    /// `sendfile(2)`-based zero-copy send from `in_fd`, advancing
    /// `offset` in place.
    pub async fn sendfile(&self, in_fd: RawFd, offset: &mut i64, count: usize) -> Result<usize> {
        self.block_on_io(Interest::WRITABLE, || {
            self.class.sendfile(self.node.fd(), in_fd, offset, count)
        })
        .await
    }

    async fn block_on_io<T>(&self, interest: Interest, mut attempt: impl FnMut() -> io::Result<T>) -> Result<T> {
        // Resolved lazily on the first real suspend, then reused for every
        // later retry of this same logical operation so the configured
        // timeout bounds the whole operation, not just its first park (see
        // `Scheduler::take_io_deadline`).
        let mut deadline: Option<u64> = None;
        let mut deadline_resolved = false;
        loop {
            match attempt() {
                Ok(v) => {
                    self.io_calls.set(0);
                    return Ok(v);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !deadline_resolved {
                        deadline = self.sched.take_io_deadline();
                        deadline_resolved = true;
                    }
                    match self.sched.park_io(&self.node, interest, deadline).await? {
                        WakeCause::IoReady => {
                            let calls = self.io_calls.get() + 1;
                            if calls >= self.sched.config().max_io_calls {
                                self.io_calls.set(0);
                                self.sched.yield_now().await;
                            } else {
                                self.io_calls.set(calls);
                            }
                        }
                        WakeCause::Timeout => return Err(Error::Timeout),
                        WakeCause::Cancelled => return Err(Error::Cancelled),
                        WakeCause::None => unreachable!("park_io resolved with WakeCause::None"),
                    }
                }
                Err(e) => return Err(Error::from_io(e)),
            }
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.sched.detach_owned_socket(self.owner_task, self.node.fd());
        self.sched.unregister_node(self.node.fd());
        self.class.close(self.node.fd());
    }
}
