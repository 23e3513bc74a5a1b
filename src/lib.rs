//! `evloop`: a single-threaded, cooperative networking runtime.
//!
//! A [`scheduler::Scheduler`] multiplexes many I/O-bound
//! [`task::TaskId`]-identified tasks onto one OS thread via a
//! readiness-based event loop. [`wheel::TimerWheel`] and
//! [`poller::Poller`] are the two leaf components the scheduler drives;
//! [`socket::Socket`] is the primary client, parking the current task on
//! the scheduler whenever a syscall would block. [`peer`] runs several
//! independent schedulers as a fixed pool, one per OS thread, sharing no
//! mutable state.
//!
//! Logging is structured (`tracing`), configuration loads from TOML with
//! a default fallback ([`config::RuntimeConfig`]), and every fallible
//! operation returns [`error::Result`].
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod addr;
pub mod buffer;
pub mod config;
pub mod error;
pub mod node;
pub mod peer;
pub mod poller;
pub mod scheduler;
pub mod socket;
pub mod task;
pub mod time;
pub mod wheel;

/// Common imports for embedders.
pub mod prelude {
    pub use crate::addr::Addr;
    pub use crate::config::RuntimeConfig;
    pub use crate::error::{Error, Result};
    pub use crate::node::Interest;
    pub use crate::scheduler::Scheduler;
    pub use crate::socket::{Domain, Socket, SocketClass, Tcp, Udp};
    pub use crate::task::TaskId;
}
