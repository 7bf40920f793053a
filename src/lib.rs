//! A multi-reactor TCP server runtime: one [`EventLoop`] per OS thread,
//! cooperative within a loop and parallel across loops, in the muduo
//! lineage.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`epoll`]: the raw `epoll` wrapper (`Token`, `Ready`, `EpollOpt`,
//!   `Events`) plus the [`epoll::Source`] trait file descriptors implement to
//!   register themselves.
//! - [`channel`] / [`poller`]: a `Channel` binds one fd's readiness to typed
//!   callbacks; a `Poller` owns every `Channel` registered with one loop.
//! - [`event_loop`] / [`event_loop_thread`]: the reactor itself, its
//!   cross-thread handle, and the thread pool that runs a fixed number of
//!   worker loops round-robin.
//! - [`buffer`]: the growable read/write byte buffer connections use.
//! - [`acceptor`] / [`tcp_connection`] / [`tcp_server`]: the non-blocking
//!   accept path, the per-connection state machine, and the server object
//!   that assembles the two with the thread pool.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_io::addr::InetAddress;
//! use reactor_io::event_loop::EventLoop;
//! use reactor_io::tcp_server::{ServerOptions, TcpServer};
//!
//! let mut base_loop = EventLoop::new().unwrap();
//! let addr = InetAddress::new("0.0.0.0", 9000).unwrap();
//! let server = TcpServer::new(&mut base_loop, addr, "echo", ServerOptions::default()).unwrap();
//!
//! server.set_message_callback(|conn, buf, _ts| {
//!     let bytes = buf.retrieve_all_as_string();
//!     reactor_io::tcp_connection::TcpConnection::send(conn, bytes.as_bytes());
//! });
//!
//! server.start().unwrap();
//! base_loop.run().unwrap();
//! ```

mod sys;

pub mod epoll;
pub mod net;

pub mod acceptor;
pub mod addr;
pub mod buffer;
pub mod channel;
pub mod event_loop;
pub mod event_loop_thread;
pub mod poller;
pub mod queue;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timestamp;
pub mod waker;

pub use acceptor::Acceptor;
pub use addr::InetAddress;
pub use buffer::Buffer;
pub use channel::Channel;
pub use epoll::{EpollOpt, Event, Events, Ready, Source, Token};
pub use event_loop::{EventLoop, EventLoopHandle};
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use poller::Poller;
pub use tcp_connection::TcpConnection;
pub use tcp_server::{ServerOptions, TcpServer};
pub use timestamp::Timestamp;
