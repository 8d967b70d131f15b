//! Cross-component integration scenarios: a task driven through a real `Executor`, with an
//! `AsyncSocket` operation suspending on the shared `Reactor` thread.

use std::net::SocketAddr;
use std::time::Duration;

use reedux::executor::Executor;
use reedux::reactor::Reactor;
use reedux::socket::{resolve, AsyncSocket};
use reedux::task::Task;

fn loopback_listener() -> (AsyncSocket, SocketAddr) {
    let addr = resolve("127.0.0.1:0").unwrap();
    let listener = AsyncSocket::create_tcp(&addr).unwrap();
    listener.bind(&addr).unwrap();
    listener.listen(16).unwrap();

    let mut local: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    unsafe {
        libc::getsockname(
            listener.raw_fd(),
            &mut local as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
    }
    let port = u16::from_be(local.sin_port);
    let connect_addr = resolve(format!("127.0.0.1:{port}")).unwrap();
    (listener, connect_addr)
}

#[test]
fn echo_task_runs_to_completion_on_a_real_executor() {
    let _ = env_logger::try_init();
    Reactor::spawn_thread();
    let exec = Executor::builder().worker_count(2).build();

    let (listener, connect_addr) = loopback_listener();
    let accept_exec = exec.clone();

    let join = exec.run_on_executor(Task::new(async move {
        let client = AsyncSocket::create_tcp(&connect_addr)?;

        // Accept runs as its own task on the pool so it can suspend on the reactor while this
        // task drives the connect concurrently -- sequencing them would deadlock, since accept
        // doesn't complete until the connect this task is about to issue actually arrives.
        let accept_join =
            accept_exec.run_on_executor(Task::new(async move { listener.accept().await }));

        client.connect(connect_addr).await?;
        let server = accept_join.await?;

        client.write(b"ping!").await?;
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < 5 {
            read += server.read(&mut buf[read..]).await?;
        }
        assert_eq!(&buf, b"ping!");
        Ok(())
    }));

    let result = reedux::task::sync_wait(Task::new(async move { join.await }));
    result.unwrap();
    exec.shutdown();
}

#[test]
fn timers_registered_out_of_order_fire_in_deadline_order() {
    let reactor = Reactor::spawn_thread();
    let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    let order_a = order.clone();
    reactor.after(Duration::from_millis(150), move || {
        order_a.lock().unwrap().push("A");
    });
    let order_b = order.clone();
    reactor.after(Duration::from_millis(10), move || {
        order_b.lock().unwrap().push("B");
    });

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);
}
