// Echo server: one task accepts and echoes, one task connects and verifies.
use std::rc::Rc;

use evloop::prelude::*;

#[test]
fn test_echo_roundtrip_then_scheduler_terminates() {
    let sched = Scheduler::new().unwrap();
    let port = 42500u16;

    sched.task_start(move |sched| async move {
        let listener = Socket::new(&sched, Rc::new(Tcp), Domain::V4).unwrap();
        listener.bind(Addr::parse("127.0.0.1", port).unwrap(), 16).unwrap();
        let (conn, _from) = listener.accept().await.unwrap();

        let mut buf = [0u8; 5];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        conn.write(&buf).await.unwrap();
    });

    sched.task_start(move |sched| async move {
        sched.task_wait(5).await;
        let client = Socket::new(&sched, Rc::new(Tcp), Domain::V4).unwrap();
        client.connect(Addr::parse("127.0.0.1", port).unwrap()).await.unwrap();
        client.write(b"hello").await.unwrap();

        let mut buf = [0u8; 5];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    });

    sched.run();
    // Reaching here means both tasks finished and the loop terminated
    // with no tasks left parked.
}
