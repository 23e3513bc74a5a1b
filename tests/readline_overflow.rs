// readline must fail with Overflow after accumulating exactly `max` bytes
// when the peer never sends the delimiter.
use std::cell::Cell;
use std::rc::Rc;

use evloop::prelude::*;

#[test]
fn test_readline_overflow_stops_at_exactly_max_bytes() {
    let sched = Scheduler::new().unwrap();
    let port = 42501u16;
    let result: Rc<Cell<Option<(usize, usize)>>> = Rc::new(Cell::new(None));
    let result2 = result.clone();

    sched.task_start(move |sched| async move {
        let listener = Socket::new(&sched, Rc::new(Tcp), Domain::V4).unwrap();
        listener.bind(Addr::parse("127.0.0.1", port).unwrap(), 16).unwrap();
        let (conn, _from) = listener.accept().await.unwrap();

        let mut buf: Vec<u8> = Vec::new();
        match conn.readline(&mut buf, b"\n", 512).await {
            Err(Error::Overflow { max }) => result2.set(Some((max, buf.len()))),
            other => panic!("expected Overflow, got {other:?}"),
        }
    });

    sched.task_start(move |sched| async move {
        sched.task_wait(5).await;
        let client = Socket::new(&sched, Rc::new(Tcp), Domain::V4).unwrap();
        client.connect(Addr::parse("127.0.0.1", port).unwrap()).await.unwrap();
        let payload = vec![b'x'; 1024];
        client.write(&payload).await.unwrap();
    });

    sched.run();
    assert_eq!(result.get(), Some((512, 512)));
}
