//! A fixed pool of peer schedulers, each on its own OS thread. Peers
//! share no mutable state: every task and socket belongs to exactly one
//! scheduler for its whole life, matching the runtime's explicit
//! non-goal of cross-scheduler task migration.
//!
//! `Scheduler` is deliberately `!Send` (its `Inner` holds `Rc`/`RefCell`),
//! so a peer can never be reached, stopped, or polled from outside its own
//! thread. `spawn_stop`/`PeerHandle::signal_stop` work around this the
//! same way a `running: Arc<AtomicBool>` flag gates a worker pool's threads
//! elsewhere in the wider workspace: setting the flag is `Send`-safe, and
//! each peer's own watcher task (running on the correct thread) is what
//! actually calls `Scheduler::stop` on itself once it observes the flag.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::RuntimeConfig;
use crate::scheduler::Scheduler;

/// How often a peer's watcher task polls its stop flag.
const STOP_POLL_INTERVAL_MS: u64 = 10;

struct PeerSlot {
    id: usize,
    config: RuntimeConfig,
    entry: Arc<dyn Fn(usize, Scheduler) + Send + Sync>,
    stop_flag: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

/// A handle to one peer in a [`PeerPool`]. Never exposes the peer's
/// `Scheduler` itself — only signaling and liveness, which is all that is
/// safe to touch from outside the peer's own thread.
pub struct PeerHandle<'a> {
    slot: &'a PeerSlot,
}

impl<'a> PeerHandle<'a> {
    /// This peer's index within its pool, `0..n`.
    pub fn id(&self) -> usize {
        self.slot.id
    }

    /// Signal just this peer to stop. Equivalent to calling
    /// [`PeerPool::spawn_stop`] for this one peer only.
    pub fn signal_stop(&self) {
        self.slot.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Whether this peer has not yet been started via `spawn_start`.
    pub fn is_pending(&self) -> bool {
        self.slot.join_handle.is_none()
    }

    /// Whether this peer's thread has started and already exited.
    pub fn is_finished(&self) -> bool {
        self.slot
            .join_handle
            .as_ref()
            .is_some_and(|h| h.is_finished())
    }
}

/// A fixed pool of peer schedulers. Created with [`spawn`], which only
/// describes the pool; [`PeerPool::spawn_start`] actually launches the OS
/// threads.
pub struct PeerPool {
    peers: Vec<PeerSlot>,
}

/// Describe a pool of `n` peer schedulers, each to be run on its own OS
/// thread once [`PeerPool::spawn_start`] is called. `n = None` falls back
/// to `config.default_peer_count`, matching that field's documented
/// "when not told otherwise" behavior.
///
/// `entry(id, scheduler)` is called once per peer, on that peer's own
/// thread, after its `Scheduler` has been constructed but before the pool
/// starts driving it — `entry`'s job is only to seed the peer's initial
/// tasks (typically via `Scheduler::task_start`), not to call
/// `Scheduler::run` itself; the pool does that.
pub fn spawn<F>(n: Option<usize>, config: RuntimeConfig, entry: F) -> PeerPool
where
    F: Fn(usize, Scheduler) + Send + Sync + 'static,
{
    let n = n.unwrap_or(config.default_peer_count);
    let entry: Arc<dyn Fn(usize, Scheduler) + Send + Sync> = Arc::new(entry);
    let peers = (0..n)
        .map(|id| PeerSlot {
            id,
            config: config.clone(),
            entry: entry.clone(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            join_handle: None,
        })
        .collect();
    PeerPool { peers }
}

impl PeerPool {
    /// Number of peers in the pool.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// A handle to peer `id`, or `None` if `id` is out of range.
    pub fn spawn_get(&self, id: usize) -> Option<PeerHandle<'_>> {
        self.peers.get(id).map(|slot| PeerHandle { slot })
    }

    /// Launch every not-yet-started peer's OS thread: construct its
    /// `Scheduler`, call `entry(id, scheduler)` to seed its initial tasks,
    /// install a watcher task that polls this peer's stop flag, then drive
    /// the scheduler until it finishes naturally or is stopped. Idempotent
    /// — peers already started are left alone.
    pub fn spawn_start(&mut self) -> io::Result<()> {
        for slot in &mut self.peers {
            if slot.join_handle.is_some() {
                continue;
            }
            let id = slot.id;
            let config = slot.config.clone();
            let entry = slot.entry.clone();
            let stop_flag = slot.stop_flag.clone();
            let handle = std::thread::Builder::new()
                .name(format!("evloop-peer-{id}"))
                .spawn(move || {
                    let sched = Scheduler::with_config(config)
                        .expect("failed to create peer scheduler's poller");
                    sched.task_start(move |sched| async move {
                        loop {
                            if stop_flag.load(Ordering::SeqCst) {
                                sched.stop();
                                return;
                            }
                            sched.task_wait(STOP_POLL_INTERVAL_MS).await;
                        }
                    });
                    entry(id, sched.clone());
                    sched.run();
                })?;
            slot.join_handle = Some(handle);
        }
        Ok(())
    }

    /// Signal every peer to stop. Each peer's own watcher task notices
    /// this on its own thread (at most [`STOP_POLL_INTERVAL_MS`] later)
    /// and calls `Scheduler::stop` on itself.
    pub fn spawn_stop(&self) {
        for slot in &self.peers {
            slot.stop_flag.store(true, Ordering::SeqCst);
        }
    }

    /// Block until every started peer's thread has exited. Peers never
    /// started via `spawn_start` are skipped.
    pub fn spawn_join(mut self) {
        for slot in &mut self.peers {
            if let Some(handle) = slot.join_handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};

    #[test]
    fn four_peers_each_count_to_a_thousand_independently() {
        let counters: Arc<Vec<AtomicUsize>> =
            Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
        let counters_for_peers = counters.clone();

        let mut pool = spawn(Some(4), RuntimeConfig::default(), move |id, sched| {
            let counters = counters_for_peers.clone();
            sched.task_start(move |sched| async move {
                for _ in 0..1000 {
                    counters[id].fetch_add(1, StdOrdering::SeqCst);
                    sched.task_wait(0).await;
                }
            });
        });

        pool.spawn_start().unwrap();

        // The pool's watcher task keeps each peer alive until explicitly
        // stopped (that's what makes `spawn_stop` able to signal a peer at
        // all), so wait for the counting tasks to actually finish before
        // asking the pool to shut down.
        while counters.iter().any(|c| c.load(StdOrdering::SeqCst) < 1000) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        pool.spawn_stop();
        pool.spawn_join();

        for counter in counters.iter() {
            assert_eq!(counter.load(StdOrdering::SeqCst), 1000);
        }
    }

    #[test]
    fn spawn_with_no_explicit_count_uses_default_peer_count() {
        let config = RuntimeConfig {
            default_peer_count: 3,
            ..RuntimeConfig::default()
        };
        let pool = spawn(None, config, |_id, _sched| {});
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn spawn_stop_halts_a_peer_running_forever() {
        // `entry` seeds no tasks of its own, so the only thing keeping
        // this peer's scheduler alive is the pool's own watcher task,
        // which loops until `spawn_stop`/`PeerHandle::signal_stop` flips
        // its flag. Without that external signal the thread would run
        // until the process exits.
        let mut pool = spawn(Some(1), RuntimeConfig::default(), |_id, _sched| {});
        pool.spawn_start().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!pool.spawn_get(0).unwrap().is_finished());
        pool.spawn_get(0).unwrap().signal_stop();
        pool.spawn_join();
    }
}
