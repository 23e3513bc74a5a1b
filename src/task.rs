//! The cooperative task abstraction.
//!
//! Tasks are represented as generator-style state machines (boxed
//! `Future<Output = ()>`), driven by the scheduler's own minimal executor,
//! rather than as stackful coroutines with hand-switched contexts — the
//! external contract (suspension points, wake causes, FIFO run queue,
//! exactly-one-task-running) is identical either way, and spec §9
//! explicitly sanctions either representation. See `DESIGN.md` for the
//! rationale.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;

use crate::node::{SchedNode, WakeCause};
use crate::wheel::TimerHandle;
use std::rc::Rc;

/// Unique, scheduler-local task identifier.
pub type TaskId = u64;

/// `runnable → running → (parked-io | parked-timer | parked-both) →
/// runnable → … → finished`. `Finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In the run queue, not yet polled this tick.
    Runnable,
    /// Currently the scheduler's `current_task`.
    Running,
    /// Parked on I/O readiness only.
    ParkedIo,
    /// Parked on a deadline only.
    ParkedTimer,
    /// Parked on both I/O readiness and a deadline.
    ParkedBoth,
    /// The entry function returned; all registrations and the stack are
    /// released.
    Finished,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished)
    }
}

/// The bookkeeping half of a task: everything the scheduler needs to
/// track wakeups and cleanup, independent of the boxed future itself.
pub(crate) struct TaskHandleInner {
    pub id: TaskId,
    pub state: Cell<TaskState>,
    pub wake_cause: Cell<WakeCause>,
    /// Socket node this task is currently parked on, if any.
    pub parked_node: RefCell<Option<Rc<SchedNode>>>,
    /// Pending timer-wheel entry backing the current park, if any.
    pub timer_handle: Cell<Option<TimerHandle>>,
    /// Per-operation deadline set by `Socket::timeout(ms)`, consumed by
    /// the next blocking call.
    pub pending_timeout_ms: Cell<Option<u64>>,
    /// Sockets this task opened directly (not `dup`'d elsewhere), closed
    /// automatically when the task finishes.
    pub owned_sockets: RefCell<Vec<RawFd>>,
}

impl TaskHandleInner {
    pub fn new(id: TaskId) -> Rc<Self> {
        Rc::new(Self {
            id,
            state: Cell::new(TaskState::Runnable),
            wake_cause: Cell::new(WakeCause::None),
            parked_node: RefCell::new(None),
            timer_handle: Cell::new(None),
            pending_timeout_ms: Cell::new(None),
            owned_sockets: RefCell::new(Vec::new()),
        })
    }
}

pub(crate) type BoxedFuture = Pin<Box<dyn Future<Output = ()>>>;

/// A task's full state: its bookkeeping handle plus the boxed future
/// driving it. Owned exclusively by the [`crate::scheduler::Scheduler`].
pub(crate) struct TaskSlot {
    pub handle: Rc<TaskHandleInner>,
    pub future: RefCell<BoxedFuture>,
}

/// Build a no-op [`std::task::Waker`].
///
/// This runtime's own scheduler is the only driver of task futures: a
/// suspension always resolves by the scheduler pushing the task id back
/// onto the run queue (see `Scheduler::park_io`/`task_wait`), so the
/// `Waker` handed to `Future::poll` is never invoked by the futures this
/// crate defines. A real waker is still required to satisfy the `Future`
/// trait's signature.
pub(crate) fn noop_waker() -> std::task::Waker {
    use std::task::{RawWaker, RawWakerVTable, Waker};

    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        raw_waker()
    }
    fn raw_waker() -> RawWaker {
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }

    // SAFETY: every vtable function is a no-op over a null data pointer;
    // there is no data to dereference, clone, or free.
    unsafe { Waker::from_raw(raw_waker()) }
}
