//! End-to-end scenarios driving a real `IoReactor` over loopback
//! sockets and the public `shim` surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibrio::reactor::IoReactor;
use fibrio::{shim, sleep};

fn unix_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let std_addr: std::net::SocketAddrV4 = match addr {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => panic!("tests use IPv4 loopback only"),
    };
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let sin: &mut libc::sockaddr_in = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = std_addr.port().to_be();
    sin.sin_addr.s_addr = u32::from_ne_bytes(std_addr.ip().octets());
    (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

/// Sleep yields: "B" logs before "A" despite A running first, and
/// `sleep` returns no earlier than its argument.
#[test]
fn sleep_yields_to_other_ready_work() {
    let _ = env_logger::try_init();
    let reactor = IoReactor::new(1, true, "sleep-yield").unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();
    let slept_ms = Arc::new(AtomicU64::new(0));

    let log_a = log.clone();
    let slept_ms_a = slept_ms.clone();
    let reactor_a = reactor.clone();
    reactor.schedule(
        move || {
            sleep(1);
            log_a.lock().unwrap().push("A");
            slept_ms_a.store(started.elapsed().as_millis() as u64, Ordering::SeqCst);
            reactor_a.stop();
        },
        None,
    );
    let log_b = log.clone();
    reactor.schedule(
        move || {
            log_b.lock().unwrap().push("B");
        },
        None,
    );

    reactor.start();
    assert_eq!(*log.lock().unwrap(), vec!["B", "A"]);
    assert!(slept_ms.load(Ordering::SeqCst) >= 1000);
}

/// Connect-timeout: connecting to an unroutable address returns
/// ETIMEDOUT within the requested window.
#[test]
fn connect_with_timeout_expires() {
    let _ = env_logger::try_init();
    let reactor = IoReactor::new(1, true, "connect-timeout").unwrap();
    let result: Arc<Mutex<Option<(i64, Option<i32>)>>> = Arc::new(Mutex::new(None));
    let result2 = result.clone();
    let reactor2 = reactor.clone();

    reactor.schedule(
        move || {
            let fd = shim::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
            // TEST-NET-1, port chosen to be a black hole for this process.
            let addr: SocketAddr = "192.0.2.1:9".parse().unwrap();
            let (storage, len) = unix_sockaddr(addr);
            let started = Instant::now();
            let res = shim::connect_with_timeout(fd, &storage as *const _ as *const libc::sockaddr, len, 300);
            let elapsed = started.elapsed().as_millis() as i64;
            *result2.lock().unwrap() = Some((elapsed, res.err().and_then(|e| e.raw_os_error())));
            unsafe {
                libc::close(fd);
            }
            reactor2.stop();
        },
        None,
    );

    reactor.start();
    let (elapsed, errno) = result.lock().unwrap().take().unwrap();
    assert_eq!(errno, Some(libc::ETIMEDOUT));
    assert!((250..2000).contains(&elapsed), "elapsed = {elapsed}ms");
}

/// Echo server: a client write is echoed back, and the server's
/// `recv` observes EOF (0) when the client closes.
#[test]
fn echo_server_round_trip() {
    let _ = env_logger::try_init();
    let reactor = IoReactor::new(2, true, "echo-server").unwrap();

    // Built through the shim's own `socket()` so the fd lands in the
    // registry the way a real handler's listening socket would: freshly
    // created, still reporting as "blocking" to the user even though
    // the shim has already forced it non-blocking at the kernel level.
    let listener_fd = shim::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
    let port = 18020u16;
    unsafe {
        let one: libc::c_int = 1;
        libc::setsockopt(
            listener_fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let (storage, len) = unix_sockaddr(format!("127.0.0.1:{port}").parse().unwrap());
    let bind_rc = unsafe { libc::bind(listener_fd, &storage as *const _ as *const libc::sockaddr, len) };
    assert_eq!(bind_rc, 0, "bind: {}", std::io::Error::last_os_error());
    let listen_rc = unsafe { libc::listen(listener_fd, 128) };
    assert_eq!(listen_rc, 0, "listen: {}", std::io::Error::last_os_error());
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let reactor_accept = reactor.clone();
    reactor.schedule(
        move || {
            let mut peer_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let mut peer: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let client_fd = shim::accept(listener_fd, &mut peer as *mut _ as *mut libc::sockaddr, &mut peer_len).unwrap();
            reactor_accept.schedule(
                move || {
                    let mut buf = [0u8; 64];
                    loop {
                        match shim::recv(client_fd, &mut buf, 0) {
                            Ok(0) => break,
                            Ok(n) => {
                                let mut sent = 0;
                                while sent < n {
                                    sent += shim::send(client_fd, &buf[sent..n], 0).unwrap();
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    let _ = shim::close(client_fd);
                    IoReactor::current().unwrap().stop();
                },
                None,
            );
        },
        None,
    );

    let client = std::thread::spawn(move || {
        use std::io::{Read, Write};
        std::thread::sleep(Duration::from_millis(30));
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        drop(stream);
    });

    reactor.start();
    client.join().unwrap();
}

/// Timer-cancel: a recurring timer canceled after two-or-more
/// firings never fires again.
#[test]
fn timer_cancel_stops_recurrence() {
    let _ = env_logger::try_init();
    let reactor = IoReactor::new(1, false, "timer-cancel").unwrap();
    let count = Arc::new(AtomicU32::new(0));
    let c2 = count.clone();
    let handle = reactor.add_timer(15, move || { c2.fetch_add(1, Ordering::SeqCst); }, true);

    reactor.start(); // spawns its one worker thread; returns immediately
    std::thread::sleep(Duration::from_millis(55));
    handle.cancel();
    let after_cancel = count.load(Ordering::SeqCst);
    assert!(after_cancel >= 2, "expected at least 2 firings, got {after_cancel}");

    std::thread::sleep(Duration::from_millis(60));
    reactor.stop();
    assert_eq!(count.load(Ordering::SeqCst), after_cancel);
}

/// Concurrent close during read: one coroutine's `recv` on fd X
/// is in flight when another coroutine closes X out from under it.
/// The blocked `recv` must return an error rather than hang or touch
/// freed state.
#[test]
fn concurrent_close_during_read() {
    let _ = env_logger::try_init();
    let reactor = IoReactor::new(2, true, "close-during-read").unwrap();

    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair: {}", std::io::Error::last_os_error());
    let (read_fd, write_fd) = (fds[0], fds[1]);
    // Register the fd the way `shim::socket()` would have, since this
    // one came from a raw `socketpair()` call the shim never saw.
    shim::registry_get(read_fd, true);

    let recv_result: Arc<Mutex<Option<std::io::Result<usize>>>> = Arc::new(Mutex::new(None));
    let recv_result2 = recv_result.clone();
    let reactor_reader = reactor.clone();
    reactor.schedule(
        move || {
            let mut buf = [0u8; 16];
            let res = shim::recv(read_fd, &mut buf, 0);
            *recv_result2.lock().unwrap() = Some(res);
            reactor_reader.stop();
        },
        None,
    );

    reactor.schedule(
        move || {
            // Give the reader time to register its read event and
            // suspend in `recv` before closing out from under it.
            std::thread::sleep(Duration::from_millis(40));
            shim::close(read_fd).unwrap();
        },
        None,
    );

    reactor.start();
    unsafe {
        libc::close(write_fd);
    }

    let res = recv_result.lock().unwrap().take().unwrap();
    let err = res.expect_err("recv on a concurrently-closed fd must error, not hang or succeed");
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

/// Batch enqueue: a large range-scheduled batch all execute.
#[test]
fn batch_enqueue_all_execute() {
    let _ = env_logger::try_init();
    let reactor = IoReactor::new(2, true, "batch-enqueue").unwrap();
    let count = Arc::new(AtomicU32::new(0));
    let reactor_done = reactor.clone();
    let remaining = Arc::new(AtomicU32::new(1000));

    for _ in 0..1000u32 {
        let count = count.clone();
        let remaining = remaining.clone();
        let reactor_done = reactor_done.clone();
        reactor.schedule(
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    reactor_done.stop();
                }
            },
            None,
        );
    }

    reactor.start();
    assert_eq!(count.load(Ordering::SeqCst), 1000);
}
