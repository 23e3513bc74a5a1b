//! Per-object scheduling record: registration state, owner task, and the
//! wakeup bookkeeping the [`crate::scheduler::Scheduler`] needs.

use std::cell::Cell;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

bitflags! {
    /// The event kinds a [`SchedNode`] may be watched for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        /// Readable: the next non-blocking read/accept/recvfrom is
        /// expected to make progress.
        const READABLE = 0b01;
        /// Writable: the next non-blocking write/connect/sendto is
        /// expected to make progress.
        const WRITABLE = 0b10;
    }
}

/// Why a parked task was re-enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// Not yet woken.
    None,
    /// A registered fd became ready for the interest it was parked on.
    IoReady,
    /// The task's deadline fired before any I/O readiness.
    Timeout,
    /// `scheduler_stop` cancelled this task; it must unwind.
    Cancelled,
}

/// Every schedulable I/O object (currently: every [`crate::socket::Socket`])
/// carries one of these. `owner_task` is a weak back-reference used only
/// during wakeup — the owning [`crate::task`] remains the exclusive owner
/// of the socket itself.
#[derive(Debug)]
pub struct SchedNode {
    fd: RawFd,
    interest: Cell<Interest>,
    registered: Cell<Interest>,
    owner_task: Cell<Option<u64>>,
}

impl SchedNode {
    /// Create a node for a freshly opened file descriptor. Not yet
    /// registered with any poller.
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            interest: Cell::new(Interest::empty()),
            registered: Cell::new(Interest::empty()),
            owner_task: Cell::new(None),
        }
    }

    /// The underlying file descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn desired_interest(&self) -> Interest {
        self.interest.get()
    }

    pub(crate) fn set_desired_interest(&self, interest: Interest) {
        self.interest.set(interest);
    }

    pub(crate) fn registered_interest(&self) -> Interest {
        self.registered.get()
    }

    pub(crate) fn set_registered_interest(&self, interest: Interest) {
        self.registered.set(interest);
    }

    pub(crate) fn owner_task(&self) -> Option<u64> {
        self.owner_task.get()
    }

    pub(crate) fn set_owner_task(&self, task_id: Option<u64>) {
        self.owner_task.set(task_id);
    }

    /// Whether the poller currently watches this node for anything.
    pub fn is_registered(&self) -> bool {
        !self.registered.get().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_has_no_registration() {
        let node = SchedNode::new(3);
        assert!(!node.is_registered());
        assert_eq!(node.owner_task(), None);
    }

    #[test]
    fn interest_bits_compose() {
        let both = Interest::READABLE | Interest::WRITABLE;
        assert!(both.contains(Interest::READABLE));
        assert!(both.contains(Interest::WRITABLE));
    }
}
