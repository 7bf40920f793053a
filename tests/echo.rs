use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use reactor_io::addr::InetAddress;
use reactor_io::event_loop::EventLoop;
use reactor_io::tcp_connection::TcpConnection;
use reactor_io::tcp_server::{ServerOptions, TcpServer};

/// Boots a server on its own thread with `num_threads` worker loops plus the
/// base (acceptor) loop, runs `configure` against it before `start()`, and
/// hands back its bound address once listening.
fn spawn_server(
    num_threads: usize,
    configure: impl FnOnce(&Arc<TcpServer>) + Send + 'static,
) -> SocketAddr {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = InetAddress::new("127.0.0.1", 0).unwrap();

        let mut options = ServerOptions::default();
        options.thread_num = num_threads;

        let server = TcpServer::new(&mut base_loop, addr, "echo-test", options).unwrap();
        configure(&server);

        let local_addr = server.local_addr().unwrap();
        server.start().unwrap();
        tx.send(local_addr).unwrap();
        base_loop.run().unwrap();
    });

    rx.recv_timeout(Duration::from_secs(5)).expect("server failed to start")
}

fn echo_server(num_threads: usize) -> SocketAddr {
    spawn_server(num_threads, |server| {
        server.set_message_callback(|conn, buf, _ts| {
            let bytes = buf.retrieve_all_as_string();
            TcpConnection::send(conn, bytes.as_bytes());
        });
    })
}

#[test]
fn echoes_a_single_message() {
    let addr = echo_server(3);

    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    client.write_all(b"hello").unwrap();

    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn round_robins_connections_across_workers() {
    let workers = 3;
    let seen: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_server = seen.clone();

    let addr = spawn_server(workers, move |server| {
        server.set_connection_callback(move |conn| {
            if conn.lock().unwrap().connected() {
                seen_in_server.lock().unwrap().push(thread::current().id());
            }
        });
    });

    for _ in 0..(workers * 3) {
        let client = TcpStream::connect(addr).expect("connect");
        // Hold the connection open briefly so the server-side connection
        // callback has run before the next client connects; a fresh accept
        // otherwise might land on the same worker as a not-yet-established
        // previous connection under heavy round-robin contention.
        thread::sleep(Duration::from_millis(20));
        drop(client);
    }

    thread::sleep(Duration::from_millis(200));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), workers * 3);

    let mut counts: std::collections::HashMap<ThreadId, usize> = std::collections::HashMap::new();
    for id in seen.iter() {
        *counts.entry(*id).or_insert(0) += 1;
    }

    assert_eq!(counts.len(), workers, "expected exactly {workers} distinct worker threads");
    for count in counts.values() {
        assert_eq!(*count, 3, "expected each worker to receive exactly 3 connections");
    }
}
