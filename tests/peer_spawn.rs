// Four peer schedulers, each on its own thread, each counting to 1000 via
// task_wait(0) yields. No cross-scheduler state is touched.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use evloop::config::RuntimeConfig;
use evloop::peer::spawn;

#[test]
fn test_four_peers_reach_a_thousand_each_independently() {
    let counters: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    let for_peers = counters.clone();

    let mut pool = spawn(Some(4), RuntimeConfig::default(), move |id, sched| {
        let counters = for_peers.clone();
        sched.task_start(move |sched| async move {
            for _ in 0..1000 {
                counters[id].fetch_add(1, Ordering::SeqCst);
                sched.task_wait(0).await;
            }
        });
    });

    pool.spawn_start().unwrap();
    assert_eq!(pool.len(), 4);

    // Each peer's pool-installed watcher task keeps its scheduler alive
    // until explicitly stopped, so wait for the actual work to finish
    // before shutting the pool down.
    while counters.iter().any(|c| c.load(Ordering::SeqCst) < 1000) {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    pool.spawn_stop();
    pool.spawn_join();

    for counter in counters.iter() {
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }
}

#[test]
fn test_spawn_get_and_signal_stop_targets_one_peer() {
    let mut pool = spawn(Some(2), RuntimeConfig::default(), |_id, _sched| {});
    pool.spawn_start().unwrap();

    let peer0 = pool.spawn_get(0).unwrap();
    assert_eq!(peer0.id(), 0);
    peer0.signal_stop();

    // Give peer 0's watcher a chance to notice and exit; peer 1 is left
    // running until the pool-wide stop below.
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert!(pool.spawn_get(0).unwrap().is_finished());
    assert!(!pool.spawn_get(1).unwrap().is_finished());

    pool.spawn_stop();
    pool.spawn_join();
}
