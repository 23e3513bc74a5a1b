// Connecting to an unroutable TEST-NET-1 address must time out, not hang.
use std::cell::Cell;
use std::rc::Rc;

use evloop::prelude::*;

#[test]
fn test_connect_times_out_within_configured_window() {
    let sched = Scheduler::new().unwrap();
    let outcome: Rc<Cell<Option<bool>>> = Rc::new(Cell::new(None));
    let outcome2 = outcome.clone();

    sched.task_start(move |sched| async move {
        let client = Socket::new(&sched, Rc::new(Tcp), Domain::V4).unwrap();
        client.timeout(100);
        let result = client.connect(Addr::parse("192.0.2.1", 1).unwrap()).await;
        outcome2.set(Some(matches!(result, Err(Error::Timeout))));
    });

    let start = evloop::time::now_ms();
    sched.run();
    let elapsed = evloop::time::now_ms() - start;

    assert_eq!(outcome.get(), Some(true));
    assert!(elapsed >= 100, "elapsed = {elapsed}ms, expected >= 100ms");
    assert!(elapsed < 150 + 200, "elapsed = {elapsed}ms, expected < ~350ms");
}
