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

fn spawn_server(
    high_water_mark: usize,
    on_high_water_mark: Arc<AtomicUsize>,
    on_write_complete: Arc<AtomicUsize>,
) -> SocketAddr {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = InetAddress::new("127.0.0.1", 0).unwrap();

        let mut options = ServerOptions::default();
        options.thread_num = 1;
        options.high_water_mark = high_water_mark;

        let server = TcpServer::new(&mut base_loop, addr, "backpressure-test", options).unwrap();

        server.set_high_water_mark_callback_shim(on_high_water_mark.clone());
        server.set_write_complete_callback_shim(on_write_complete.clone());

        let local_addr = server.local_addr().unwrap();
        server.start().unwrap();
        tx.send(local_addr).unwrap();
        base_loop.run().unwrap();
    });

    rx.recv_timeout(Duration::from_secs(5)).expect("server failed to start")
}

/// Payload sent by the server, well beyond what a freshly-connected
/// loopback socket's send buffer (and the client's still-unscaled receive
/// window) can absorb in one non-blocking `write()`. A payload on the
/// order of the default 4 KiB high-water mark is not enough: an empty
/// loopback socket routinely accepts a few KiB in a single write before
/// the client has read anything, so the direct-write fast path in
/// `send_in_loop` would finish it in one shot and the output buffer would
/// never actually queue past the mark. Several MiB guarantees a large
/// remainder gets buffered regardless of the host's socket buffer sizes.
const PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// A single large send with a 1 KiB high-water mark and a slow reader:
/// the high-water-mark callback must fire with `queued >= 1024`, and the
/// write-complete callback must fire exactly once once the client finally
/// drains the socket.
#[test]
fn high_water_mark_fires_then_write_completes_once() {
    let _ = env_logger::try_init();

    let high_water_hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let write_complete_hits: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let addr = spawn_server(1024, high_water_hits.clone(), write_complete_hits.clone());

    let mut client = TcpStream::connect(addr).expect("connect");
    // Don't read yet: let the server's multi-MiB send pile up in its
    // output buffer and cross the 1 KiB high-water mark first.
    thread::sleep(Duration::from_millis(150));

    let mut buf = vec![0u8; PAYLOAD_LEN];
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut total = 0;
    while total < buf.len() {
        let n = client.read(&mut buf[total..]).expect("read");
        assert!(n > 0, "server closed early");
        total += n;
    }

    thread::sleep(Duration::from_millis(100));

    assert!(
        high_water_hits.load(Ordering::SeqCst) >= 1,
        "expected the high-water-mark callback to fire at least once"
    );
    assert_eq!(
        write_complete_hits.load(Ordering::SeqCst),
        1,
        "expected the write-complete callback to fire exactly once"
    );

    drop(client);
}

trait TestHooks {
    fn set_high_water_mark_callback_shim(&self, hits: Arc<AtomicUsize>);
    fn set_write_complete_callback_shim(&self, hits: Arc<AtomicUsize>);
}

impl TestHooks for TcpServer {
    fn set_high_water_mark_callback_shim(&self, hits: Arc<AtomicUsize>) {
        self.set_connection_callback(move |conn| {
            let connected = conn.lock().unwrap().connected();
            if connected {
                let hits = hits.clone();
                conn.lock().unwrap().set_high_water_mark_callback(move |_conn, _queued| {
                    hits.fetch_add(1, Ordering::SeqCst);
                });
                let blob = vec![b'x'; PAYLOAD_LEN];
                TcpConnection::send(conn, &blob);
            }
        });
    }

    fn set_write_complete_callback_shim(&self, hits: Arc<AtomicUsize>) {
        self.set_write_complete_callback(move |_conn| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
}
