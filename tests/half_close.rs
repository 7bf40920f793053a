use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reactor_io::addr::InetAddress;
use reactor_io::event_loop::EventLoop;
use reactor_io::tcp_connection::TcpConnection;
use reactor_io::tcp_server::{ServerOptions, TcpServer};

/// A server that echoes everything it's sent, then half-closes its write
/// side as soon as the *first* message has been queued -- before the client
/// has read any of it. The shutdown must be deferred until the output
/// buffer actually drains; if it fired eagerly against a slow reader, the
/// client would see a truncated echo instead of the full payload followed
/// by EOF.
fn half_closing_echo_server() -> SocketAddr {
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let mut base_loop = EventLoop::new().unwrap();
        let addr = InetAddress::new("127.0.0.1", 0).unwrap();

        let mut options = ServerOptions::default();
        options.thread_num = 1;

        let server = TcpServer::new(&mut base_loop, addr, "half-close-test", options).unwrap();

        server.set_message_callback(|conn, buf, _ts| {
            let data = buf.retrieve_all_as_string();
            TcpConnection::send(conn, data.as_bytes());
            TcpConnection::shutdown(conn);
        });

        let local_addr = server.local_addr().unwrap();
        server.start().unwrap();
        tx.send(local_addr).unwrap();
        base_loop.run().unwrap();
    });

    rx.recv_timeout(Duration::from_secs(5)).expect("server failed to start")
}

#[test]
fn shutdown_defers_until_output_buffer_drains_then_half_closes() {
    let addr = half_closing_echo_server();
    let payload = vec![b'a'; 1 << 20];

    let mut client = TcpStream::connect(addr).expect("connect");
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    client.write_all(&payload).unwrap();
    // The client keeps its own write side open; only the server's write
    // side should close once the echoed payload has fully drained.
    client.shutdown(Shutdown::Write).unwrap();

    let mut echoed = Vec::with_capacity(payload.len());
    client.read_to_end(&mut echoed).expect("read full echo before EOF");

    assert_eq!(echoed.len(), payload.len(), "the full 1 MiB payload must arrive before EOF");
    assert_eq!(echoed, payload);
}
