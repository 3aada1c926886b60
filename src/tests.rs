// The MIT License (MIT)

// Copyright (c) 2021 Corio Developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! End-to-end scenarios for the whole runtime. Everything runs on a
//! single scheduler so that interleaving (not parallelism) is what is
//! being tested; timing asserts carry slack for loaded test machines.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Once};
use std::time::Instant;

use crate::{go, hook, sleep, sock, Config, Event, Mutex, Pool};

fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        Config::new().sched_num(1).apply();
    });
}

#[test]
fn test_go_and_sleep() {
    init();
    let (tx, rx) = channel();
    let start = Instant::now();

    for _ in 0..3 {
        let tx = tx.clone();
        go(move || {
            sleep(50);
            tx.send(()).unwrap();
        });
    }
    for _ in 0..3 {
        rx.recv().unwrap();
    }

    let elapsed = start.elapsed().as_millis();
    assert!(elapsed >= 50, "sleeps finished after {} ms", elapsed);
    // the three sleeps must overlap on one scheduler
    assert!(elapsed < 150, "sleeps took {} ms, not concurrent", elapsed);
}

#[test]
fn test_event_signal() {
    init();
    let ev = Arc::new(Event::new());
    let (tx, rx) = channel();

    let ev2 = ev.clone();
    go(move || {
        ev2.wait();
        tx.send("A").unwrap();
    });

    std::thread::sleep(std::time::Duration::from_millis(10));
    let start = Instant::now();
    ev.signal();

    assert_eq!(rx.recv().unwrap(), "A");
    assert!(start.elapsed().as_millis() < 100);
}

#[test]
fn test_event_timeout() {
    init();
    let ev = Arc::new(Event::new());
    let (tx, rx) = channel();

    go(move || {
        let start = Instant::now();
        let ok = ev.wait_ms(30);
        tx.send((ok, start.elapsed().as_millis())).unwrap();
    });

    let (ok, elapsed) = rx.recv().unwrap();
    assert!(!ok);
    assert!(elapsed >= 30, "timed out after only {} ms", elapsed);
    assert!(elapsed < 300, "timed out after {} ms", elapsed);
}

#[test]
fn test_event_signal_vs_timeout_once() {
    init();
    // fire the signal right around the deadline many times; each wait
    // must observe exactly one outcome
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel();

    for _ in 0..20 {
        let ev = Arc::new(Event::new());
        let hits2 = hits.clone();
        let tx = tx.clone();
        let ev2 = ev.clone();
        go(move || {
            let _ = ev2.wait_ms(5);
            hits2.fetch_add(1, Ordering::Relaxed);
            tx.send(()).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        ev.signal();
    }
    for _ in 0..20 {
        rx.recv().unwrap();
    }
    assert_eq!(hits.load(Ordering::Relaxed), 20);
}

#[test]
fn test_mutex_counter() {
    init();
    let counter = Arc::new(Mutex::new(0u32));
    let (tx, rx) = channel();

    for _ in 0..10 {
        let counter = counter.clone();
        let tx = tx.clone();
        go(move || {
            for _ in 0..100 {
                let mut c = counter.lock();
                *c += 1;
                drop(c);
                crate::yield_now();
            }
            tx.send(()).unwrap();
        });
    }
    for _ in 0..10 {
        rx.recv().unwrap();
    }

    let c = counter.try_lock().expect("uncontended lock");
    assert_eq!(*c, 1000);
}

#[test]
fn test_mutex_handoff_is_fifo() {
    init();
    let m = Arc::new(Mutex::new(()));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = channel();

    let hold = m.clone();
    let (started_tx, started_rx) = channel();
    go(move || {
        let g = hold.lock();
        started_tx.send(()).unwrap();
        sleep(30);
        drop(g);
    });
    started_rx.recv().unwrap();

    for i in 0..4 {
        let m = m.clone();
        let order = order.clone();
        let tx = tx.clone();
        go(move || {
            let _g = m.lock();
            order.lock().push(i);
            tx.send(()).unwrap();
        });
        // serialize arrival order
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    for _ in 0..4 {
        rx.recv().unwrap();
    }
    assert_eq!(*order.try_lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn test_echo_1mib() {
    init();
    const N: usize = 1024 * 1024;
    let (port_tx, port_rx) = channel();
    let (tx, rx) = channel();

    go(move || {
        let fd = sock::tcp_socket(false).unwrap();
        sock::bind(fd, &"127.0.0.1:0".parse().unwrap()).unwrap();
        sock::listen(fd, 8).unwrap();
        port_tx.send(sock::local_addr(fd).unwrap().port()).unwrap();

        let (conn, _peer) = sock::accept(fd).unwrap();
        let mut buf = vec![0u8; N];
        let r = sock::recvn(conn, &mut buf, 10_000).unwrap();
        assert_eq!(r, N);
        sock::send(conn, &buf, 10_000).unwrap();
        sock::close(conn, 0).unwrap();
        sock::close(fd, 0).unwrap();
    });

    let port = port_rx.recv().unwrap();
    go(move || {
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let fd = sock::tcp_socket(false).unwrap();
        sock::connect(fd, &addr, 3000).unwrap();

        let data: Vec<u8> = (0..N).map(|i| (i % 251) as u8).collect();
        sock::send(fd, &data, 10_000).unwrap();

        let mut back = vec![0u8; N];
        let r = sock::recvn(fd, &mut back, 10_000).unwrap();
        sock::close(fd, 0).unwrap();
        tx.send(r == N && back == data).unwrap();
    });

    assert!(rx.recv().unwrap(), "echoed bytes differ");
}

#[test]
fn test_recv_peer_close() {
    init();
    let (port_tx, port_rx) = channel();
    let (tx, rx) = channel();

    go(move || {
        let fd = sock::tcp_socket(false).unwrap();
        sock::bind(fd, &"127.0.0.1:0".parse().unwrap()).unwrap();
        sock::listen(fd, 8).unwrap();
        port_tx.send(sock::local_addr(fd).unwrap().port()).unwrap();

        let (conn, _) = sock::accept(fd).unwrap();
        sock::close(conn, 0).unwrap();
        sock::close(fd, 0).unwrap();
    });

    let port = port_rx.recv().unwrap();
    go(move || {
        let addr = format!("127.0.0.1:{}", port).parse().unwrap();
        let fd = sock::tcp_socket(false).unwrap();
        sock::connect(fd, &addr, 3000).unwrap();
        let mut buf = [0u8; 64];
        let r = sock::recv(fd, &mut buf, 3000).unwrap();
        sock::close(fd, 0).unwrap();
        tx.send(r).unwrap();
    });

    assert_eq!(rx.recv().unwrap(), 0);
}

#[test]
fn test_hook_transparency() {
    init();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = channel();

    // a neighbor coroutine that must keep running during the wait
    let stop2 = stop.clone();
    let ticks2 = ticks.clone();
    go(move || {
        while !stop2.load(Ordering::Relaxed) {
            sleep(1);
            ticks2.fetch_add(1, Ordering::Relaxed);
        }
    });

    let stop3 = stop.clone();
    go(move || {
        // an ordinary blocking socket with a receive timeout set
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let tv = libc::timeval { tv_sec: 0, tv_usec: 100_000 };
        let r = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        assert_eq!(r, 0);

        hook::connect(fd, &addr).unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 16];
        let err = hook::recv(fd, &mut buf, 0).unwrap_err();
        let elapsed = start.elapsed().as_millis();

        stop3.store(true, Ordering::Relaxed);
        let _ = hook::close(fd);
        tx.send((err.raw_os_error(), elapsed)).unwrap();
    });

    let (errno, elapsed) = rx.recv().unwrap();
    assert_eq!(errno, Some(libc::ETIMEDOUT));
    assert!(elapsed >= 100, "timed out after only {} ms", elapsed);
    // the scheduler stayed live for the whole wait
    assert!(ticks.load(Ordering::Relaxed) >= 10);
    drop(listener);
}

#[test]
fn test_hook_poll_single_fd() {
    init();
    let (tx, rx) = channel();

    go(move || {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        // nothing to read: times out
        let mut pfd = [libc::pollfd { fd: rd, events: libc::POLLIN, revents: 0 }];
        let start = Instant::now();
        let n = hook::poll(&mut pfd, 50).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed().as_millis() >= 50);

        // readable: reports the fd
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) }, 1);
        let mut pfd = [libc::pollfd { fd: rd, events: libc::POLLIN, revents: 0 }];
        let n = hook::poll(&mut pfd, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(pfd[0].revents, libc::POLLIN);

        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
        tx.send(()).unwrap();
    });

    rx.recv().unwrap();
}

#[test]
fn test_pool_reuse_and_creator() {
    init();
    let (tx, rx) = channel();

    go(move || {
        let pool: Pool<Vec<u8>> = Pool::with_creator(|| vec![0u8; 8], 4);
        let a = pool.pop().unwrap();
        assert_eq!(a.len(), 8);

        let mut b = a;
        b.push(1);
        pool.push(b);
        assert_eq!(pool.len(), 1);

        let c = pool.pop().unwrap();
        assert_eq!(c.len(), 9); // the pushed object came back
        tx.send(()).unwrap();
    });

    rx.recv().unwrap();
}

#[test]
fn test_stack_isolation_across_yields() {
    init();
    let (tx, rx) = channel();

    for k in 0..2u64 {
        let tx = tx.clone();
        go(move || {
            let marker = 0xdead_beef_0000_0000u64 | k;
            for _ in 0..100 {
                crate::yield_now();
                assert_eq!(marker, 0xdead_beef_0000_0000u64 | k);
            }
            tx.send(()).unwrap();
        });
    }
    for _ in 0..2 {
        rx.recv().unwrap();
    }
}

#[test]
fn test_panic_does_not_kill_scheduler() {
    init();
    let (tx, rx) = channel();

    go(|| {
        panic!("intentional panic inside a coroutine");
    });
    go(move || {
        sleep(10);
        tx.send(1).unwrap();
    });

    assert_eq!(rx.recv().unwrap(), 1);
}

#[test]
fn test_spawn_inside_coroutine() {
    init();
    let (tx, rx) = channel();

    go(move || {
        let tx2 = tx.clone();
        go(move || {
            tx2.send(2).unwrap();
        });
        tx.send(1).unwrap();
    });

    let mut got = vec![rx.recv().unwrap(), rx.recv().unwrap()];
    got.sort_unstable();
    assert_eq!(got, vec![1, 2]);
}

#[test]
fn test_sched_and_coroutine_ids() {
    init();
    assert_eq!(crate::sched_id(), -1);
    assert_eq!(crate::coroutine_id(), -1);

    let (tx, rx) = channel();
    go(move || {
        tx.send((crate::sched_id(), crate::coroutine_id())).unwrap();
    });
    let (sid, cid) = rx.recv().unwrap();
    assert!(sid >= 0);
    assert!(cid >= 0);
}

#[test]
fn test_rpc_hello() {
    init();

    struct Hello;
    impl crate::rpc::Service for Hello {
        fn process(&self, req: &serde_json::Value, res: &mut serde_json::Value) {
            res["method"] = req["method"].clone();
            res["err"] = serde_json::Value::from(200);
        }
    }

    let server = crate::rpc::Server::new(Hello);
    let port = server.start("127.0.0.1", 0).unwrap();

    let (tx, rx) = channel();
    go(move || {
        let mut client = crate::rpc::Client::new("127.0.0.1", port);
        let req = serde_json::json!({ "method": "ping" });
        let res = client.call(&req).unwrap();
        tx.send(res).unwrap();
    });

    let res = rx.recv().unwrap();
    assert_eq!(res["method"], "ping");
    assert_eq!(res["err"], 200);
}
