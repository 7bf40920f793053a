use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_io::addr::InetAddress;
use reactor_io::event_loop::EventLoop;
use reactor_io::tcp_connection::TcpConnection;
use reactor_io::tcp_server::{ServerOptions, TcpServer};

/// Lowers this process's `RLIMIT_NOFILE` soft limit to `n`. The server
/// thread inherits the process-wide limit, so dropping it before the server
/// starts reliably drives the acceptor into `EMFILE` once enough clients
/// pile up, without needing to actually open thousands of descriptors.
fn lower_fd_limit(n: u64) {
    let limit = libc::rlimit {
        rlim_cur: n,
        rlim_max: n,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) };
    assert_eq!(ret, 0, "setrlimit failed: {}", std::io::Error::last_os_error());
}

fn spawn_echo_server(accepted: Arc<AtomicUsize>) -> SocketAddr {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = InetAddress::new("127.0.0.1", 0).unwrap();

        let mut options = ServerOptions::default();
        options.thread_num = 1;

        let server = TcpServer::new(&mut base_loop, addr, "emfile-test", options).unwrap();

        server.set_connection_callback(move |conn| {
            if conn.lock().unwrap().connected() {
                accepted.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _ts| {
            let data = buf.retrieve_all_as_string();
            TcpConnection::send(conn, data.as_bytes());
        });

        let local_addr = server.local_addr().unwrap();
        server.start().unwrap();
        tx.send(local_addr).unwrap();
        base_loop.run().unwrap();
    });

    rx.recv_timeout(Duration::from_secs(5)).expect("server failed to start")
}

/// Drives the acceptor's fd into exhaustion, confirms it doesn't busy-spin
/// (the listener stays registered and the process stays responsive), then
/// frees a descriptor and confirms the acceptor recovers and accepts again.
#[test]
fn recovers_from_fd_exhaustion_without_busy_spin() {
    let accepted = Arc::new(AtomicUsize::new(0));
    let addr = spawn_echo_server(accepted.clone());

    // A generous number of live connections relative to the lowered limit
    // below guarantees the process-wide fd ceiling gets hit.
    let mut held = Vec::new();
    for _ in 0..8 {
        if let Ok(s) = TcpStream::connect(addr) {
            held.push(s);
        }
        thread::sleep(Duration::from_millis(5));
    }

    lower_fd_limit(64);

    // Push connection attempts past the now-tiny limit; some will fail to
    // connect at all (the OS itself refuses them), which is fine -- the
    // point is to force the server's `accept()` to observe `EMFILE` at
    // least once while fds are scarce.
    for _ in 0..32 {
        let _ = TcpStream::connect(addr);
        thread::sleep(Duration::from_millis(2));
    }

    thread::sleep(Duration::from_millis(200));
    let accepted_under_pressure = accepted.load(Ordering::SeqCst);

    // Free descriptors by dropping every held client; the acceptor's idle
    // fd trick should let the listener recover once slots are available
    // again rather than leaving it permanently wedged.
    held.clear();
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect(addr).expect("acceptor should recover and accept again");
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"ping").unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).expect("recovered connection should still echo");
    assert_eq!(&buf, b"ping");

    assert!(accepted_under_pressure >= 1, "at least some connections should have succeeded before exhaustion");
}
