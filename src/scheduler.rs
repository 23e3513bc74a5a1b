//! Owns the run queue, timer wheel, poller, and every task/socket
//! registered with it; drives the cooperative event loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::node::{Interest, SchedNode, WakeCause};
use crate::poller::Poller;
use crate::task::{noop_waker, BoxedFuture, TaskHandleInner, TaskId, TaskSlot, TaskState};
use crate::time::now_ms;
use crate::wheel::TimerWheel;

struct Inner {
    run_queue: RefCell<VecDeque<TaskId>>,
    tasks: RefCell<FxHashMap<TaskId, Rc<TaskSlot>>>,
    nodes: RefCell<FxHashMap<RawFd, Rc<SchedNode>>>,
    wheel: RefCell<TimerWheel>,
    poller: Poller,
    current_task: RefCell<Option<Rc<TaskHandleInner>>>,
    next_task_id: Cell<TaskId>,
    stopping: Cell<bool>,
    parked_count: Cell<usize>,
    config: RuntimeConfig,
}

/// A single-threaded, cooperative runtime instance. Cheap to clone: a
/// `Scheduler` is a reference-counted handle shared by every task and
/// socket that belongs to it. Never move a `Scheduler` handle to another
/// OS thread — see [`crate::peer`] for running several as independent
/// peers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<Inner>,
}

enum ParkTimeoutSource {
    /// An absolute monotonic deadline already resolved once (by
    /// [`Scheduler::take_io_deadline`]) at the start of a logical socket
    /// operation, and reused on every internal retry of that same
    /// operation — see that method's doc comment for why this must be
    /// absolute rather than re-derived per park.
    Absolute(Option<u64>),
    /// A one-off relative deadline, independent of any socket's
    /// configured timeout (used by `task_wait`).
    Explicit(u64),
    /// No deadline at all (used by `task_release`).
    None,
}

impl Scheduler {
    /// Create a scheduler with default tunables.
    pub fn new() -> io::Result<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a scheduler with explicit tunables.
    pub fn with_config(config: RuntimeConfig) -> io::Result<Self> {
        let poller = Poller::new(config.poll_event_capacity)?;
        Ok(Self {
            inner: Rc::new(Inner {
                run_queue: RefCell::new(VecDeque::new()),
                tasks: RefCell::new(FxHashMap::default()),
                nodes: RefCell::new(FxHashMap::default()),
                wheel: RefCell::new(TimerWheel::new()),
                poller,
                current_task: RefCell::new(None),
                next_task_id: Cell::new(0),
                stopping: Cell::new(false),
                parked_count: Cell::new(0),
                config,
            }),
        })
    }

    /// This scheduler's configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Allocate a stack, prime `entry`, and enqueue the resulting task as
    /// runnable. Returns immediately; `entry` has not run yet.
    pub fn task_start<F, Fut>(&self, entry: F) -> TaskId
    where
        F: FnOnce(Scheduler) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let id = self.inner.next_task_id.get();
        self.inner.next_task_id.set(id + 1);

        let handle = TaskHandleInner::new(id);
        let sched = self.clone();
        let future: BoxedFuture = Box::pin(async move {
            entry(sched).await;
        });
        let slot = Rc::new(TaskSlot {
            handle: handle.clone(),
            future: RefCell::new(future),
        });
        self.inner.tasks.borrow_mut().insert(id, slot);
        self.inner.run_queue.borrow_mut().push_back(id);
        trace!(task_id = id, "task_start");
        id
    }

    /// Run until the run queue empties and no task remains parked.
    /// Also terminated by [`Scheduler::stop`], which cancels every
    /// parked task so it can unwind.
    pub fn run(&self) {
        loop {
            let now = now_ms();

            let due = self.inner.wheel.borrow_mut().pop_due(now);
            for (_handle, task_id) in due {
                self.wake_task(task_id, WakeCause::Timeout);
            }

            if let Some(task_id) = self.inner.run_queue.borrow_mut().pop_front() {
                self.run_one(task_id);
                continue;
            }

            if self.inner.parked_count.get() == 0 {
                break;
            }

            let timeout_ms: i32 = match self.inner.wheel.borrow().next_deadline() {
                Some(deadline) => deadline.saturating_sub(now).min(i32::MAX as u64) as i32,
                None => -1,
            };
            trace!(timeout_ms, parked = self.inner.parked_count.get(), "poller.wait");
            let ready = self
                .inner
                .poller
                .wait(timeout_ms)
                .expect("poller wait failed");
            for (token, _events) in ready {
                let fd = token as RawFd;
                let node = self.inner.nodes.borrow().get(&fd).cloned();
                if let Some(node) = node {
                    if let Some(task_id) = node.owner_task() {
                        self.wake_task(task_id, WakeCause::IoReady);
                    }
                }
            }
        }
    }

    /// Mark the scheduler as stopping; every currently parked task is
    /// woken with [`WakeCause::Cancelled`] so it can unwind. Does not
    /// forcibly terminate anything — `run()` still drains the run queue
    /// normally.
    pub fn stop(&self) {
        self.inner.stopping.set(true);
        let parked_ids: Vec<TaskId> = self
            .inner
            .tasks
            .borrow()
            .values()
            .filter(|slot| {
                matches!(
                    slot.handle.state.get(),
                    TaskState::ParkedIo | TaskState::ParkedTimer | TaskState::ParkedBoth
                )
            })
            .map(|slot| slot.handle.id)
            .collect();
        for id in parked_ids {
            self.wake_task(id, WakeCause::Cancelled);
        }
    }

    /// Yield the current task to the tail of the run queue, resuming it
    /// on a later scheduler tick without any blocking condition.
    pub async fn yield_now(&self) {
        let task = self
            .current_task()
            .expect("yield_now called outside a task context");
        self.inner.run_queue.borrow_mut().push_back(task.id);
        YieldOnce {
            polled_once: Cell::new(false),
        }
        .await;
    }

    /// Suspend the current task for at least `ms` milliseconds. `ms = 0`
    /// is equivalent to [`Scheduler::yield_now`].
    pub async fn task_wait(&self, ms: u64) {
        if ms == 0 {
            self.yield_now().await;
            return;
        }
        let task = self
            .begin_park(None, Interest::empty(), ParkTimeoutSource::Explicit(ms))
            .expect("begin_park without a node never touches the poller");
        let _ = ParkFuture::new(task).await;
    }

    /// Suspend the current task until [`Scheduler::task_resume`] is
    /// called with its id.
    pub async fn task_release(&self) {
        let task = self
            .begin_park(None, Interest::empty(), ParkTimeoutSource::None)
            .expect("begin_park without a node never touches the poller");
        let _ = ParkFuture::new(task).await;
    }

    /// Re-enqueue `task_id` as runnable. Used internally by
    /// [`crate::socket::Socket`]; exposed for embedders coordinating
    /// handoff between tasks.
    pub fn task_resume(&self, task_id: TaskId) {
        self.wake_task(task_id, WakeCause::IoReady);
    }

    /// Suspend the current task until `node` becomes ready for
    /// `interest`, or `deadline_ms` (an absolute monotonic deadline from
    /// [`Scheduler::take_io_deadline`]) fires. Used by every blocking
    /// [`crate::socket::Socket`] operation. Fails with `Error::Syscall` if
    /// registering `node` with the poller fails, rather than panicking —
    /// the socket remains usable for a subsequent call.
    pub(crate) async fn park_io(
        &self,
        node: &Rc<SchedNode>,
        interest: Interest,
        deadline_ms: Option<u64>,
    ) -> Result<WakeCause> {
        let task = self.begin_park(
            Some(node.clone()),
            interest,
            ParkTimeoutSource::Absolute(deadline_ms),
        )?;
        Ok(ParkFuture::new(task).await)
    }

    /// Resolve the deadline the *next* logical blocking operation on the
    /// current task should use: whatever `Socket::timeout(ms)` last set
    /// (consumed here, matching the spec's "consumed by the next blocking
    /// op"), falling back to `config.default_timeout_ms`. Returns an
    /// absolute monotonic deadline rather than a relative one so that a
    /// single logical operation spanning several internal suspend/resume
    /// cycles (e.g. repeated `WouldBlock` retries against the same fd) can
    /// pass the same value to every [`Scheduler::park_io`] call instead of
    /// either re-deriving a fresh relative deadline each retry (which
    /// would silently extend the budget) or losing it after the first
    /// retry (the bug this replaced).
    pub(crate) fn take_io_deadline(&self) -> Option<u64> {
        let task = self
            .current_task()
            .expect("take_io_deadline called outside a task context");
        let ms = task.pending_timeout_ms.take().or({
            let default_ms = self.inner.config.default_timeout_ms;
            (default_ms > 0).then_some(default_ms)
        })?;
        Some(now_ms() + ms)
    }

    pub(crate) fn current_task(&self) -> Option<Rc<TaskHandleInner>> {
        self.inner.current_task.borrow().clone()
    }

    pub(crate) fn register_node(&self, node: Rc<SchedNode>) {
        self.inner.nodes.borrow_mut().insert(node.fd(), node);
    }

    pub(crate) fn unregister_node(&self, fd: RawFd) {
        if let Some(node) = self.inner.nodes.borrow_mut().remove(&fd) {
            if node.is_registered() {
                let _ = self.inner.poller.remove(fd);
            }
        }
    }

    pub(crate) fn attach_owned_socket(&self, task_id: TaskId, fd: RawFd) {
        if let Some(slot) = self.inner.tasks.borrow().get(&task_id) {
            slot.handle.owned_sockets.borrow_mut().push(fd);
        }
    }

    pub(crate) fn detach_owned_socket(&self, task_id: TaskId, fd: RawFd) {
        if let Some(slot) = self.inner.tasks.borrow().get(&task_id) {
            slot.handle.owned_sockets.borrow_mut().retain(|&f| f != fd);
        }
    }

    fn begin_park(
        &self,
        node: Option<Rc<SchedNode>>,
        interest: Interest,
        timeout_source: ParkTimeoutSource,
    ) -> Result<Rc<TaskHandleInner>> {
        let task = self
            .current_task()
            .expect("blocking operation called outside a task context");
        task.wake_cause.set(WakeCause::None);

        if self.inner.stopping.get() {
            // Already stopping: resolve immediately with `cancelled` rather
            // than actually parking, but still re-enqueue so the awaiting
            // `ParkFuture`'s second poll is reached on the next tick — a
            // task must never be left un-enqueued and un-parked, or it
            // would hang forever with no registration left to wake it.
            task.wake_cause.set(WakeCause::Cancelled);
            task.state.set(TaskState::Runnable);
            self.inner.run_queue.borrow_mut().push_back(task.id);
            return Ok(task);
        }

        if let Some(node) = &node {
            node.set_desired_interest(interest);
            node.set_owner_task(Some(task.id));
            if node.registered_interest().is_empty() {
                if let Err(e) = self.inner.poller.add(node.fd(), interest, node.fd() as u64) {
                    node.set_owner_task(None);
                    return Err(Error::from_io(e));
                }
            } else if node.registered_interest() != interest {
                if let Err(e) = self.inner.poller.modify(node.fd(), interest, node.fd() as u64) {
                    node.set_owner_task(None);
                    return Err(Error::from_io(e));
                }
            }
            node.set_registered_interest(interest);
            *task.parked_node.borrow_mut() = Some(node.clone());
        }

        let deadline_ms = match timeout_source {
            ParkTimeoutSource::Absolute(deadline) => deadline,
            ParkTimeoutSource::Explicit(ms) => Some(now_ms() + ms),
            ParkTimeoutSource::None => None,
        };
        if let Some(deadline) = deadline_ms {
            let handle = self.inner.wheel.borrow_mut().insert(task.id, deadline);
            task.timer_handle.set(Some(handle));
        }

        let state = match (node.is_some(), task.timer_handle.get().is_some()) {
            (true, true) => TaskState::ParkedBoth,
            (true, false) => TaskState::ParkedIo,
            (false, true) => TaskState::ParkedTimer,
            (false, false) => TaskState::ParkedIo,
        };
        task.state.set(state);
        self.inner.parked_count.set(self.inner.parked_count.get() + 1);
        Ok(task)
    }

    fn wake_task(&self, task_id: TaskId, cause: WakeCause) {
        let slot = match self.inner.tasks.borrow().get(&task_id).cloned() {
            Some(slot) => slot,
            None => return,
        };
        let task = &slot.handle;
        if !matches!(
            task.state.get(),
            TaskState::ParkedIo | TaskState::ParkedTimer | TaskState::ParkedBoth
        ) {
            return;
        }

        if let Some(handle) = task.timer_handle.take() {
            if !matches!(cause, WakeCause::Timeout) {
                self.inner.wheel.borrow_mut().cancel(handle);
            }
        }
        if let Some(node) = task.parked_node.borrow_mut().take() {
            if node.is_registered() {
                let _ = self.inner.poller.remove(node.fd());
                node.set_registered_interest(Interest::empty());
            }
            node.set_owner_task(None);
        }

        task.wake_cause.set(cause);
        task.state.set(TaskState::Runnable);
        self.inner
            .parked_count
            .set(self.inner.parked_count.get().saturating_sub(1));
        self.inner.run_queue.borrow_mut().push_back(task_id);
    }

    fn run_one(&self, task_id: TaskId) {
        let slot = match self.inner.tasks.borrow().get(&task_id).cloned() {
            Some(slot) => slot,
            None => return,
        };
        slot.handle.state.set(TaskState::Running);
        *self.inner.current_task.borrow_mut() = Some(slot.handle.clone());

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let poll_result = {
            let mut fut = slot.future.borrow_mut();
            fut.as_mut().poll(&mut cx)
        };

        *self.inner.current_task.borrow_mut() = None;

        match poll_result {
            Poll::Ready(()) => {
                slot.handle.state.set(TaskState::Finished);
                self.finish_task(&slot.handle);
                self.inner.tasks.borrow_mut().remove(&task_id);
                trace!(task_id, "task finished");
            }
            Poll::Pending => {}
        }
    }

    fn finish_task(&self, handle: &Rc<TaskHandleInner>) {
        let fds: Vec<RawFd> = handle.owned_sockets.borrow_mut().drain(..).collect();
        for fd in fds {
            self.unregister_node(fd);
            // SAFETY: `fd` was opened by this task and has just been
            // removed from the node registry; nothing else references it.
            unsafe {
                libc::close(fd);
            }
        }
    }
}

struct YieldOnce {
    polled_once: Cell<bool>,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if !this.polled_once.get() {
            this.polled_once.set(true);
            return Poll::Pending;
        }
        Poll::Ready(())
    }
}

struct ParkFuture {
    task: Rc<TaskHandleInner>,
    polled_once: Cell<bool>,
}

impl ParkFuture {
    fn new(task: Rc<TaskHandleInner>) -> Self {
        Self {
            task,
            polled_once: Cell::new(false),
        }
    }
}

impl Future for ParkFuture {
    type Output = WakeCause;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WakeCause> {
        let this = self.get_mut();
        if !this.polled_once.get() {
            this.polled_once.set(true);
            return Poll::Pending;
        }
        Poll::Ready(this.task.wake_cause.get())
    }
}
