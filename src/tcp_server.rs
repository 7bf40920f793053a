use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::acceptor::{Acceptor, TcpListenerAccepted};
use crate::addr::InetAddress;
use crate::buffer::Buffer;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_thread::EventLoopThreadPool;
use crate::tcp_connection::{TcpConnection, DEFAULT_HIGH_WATER_MARK};
use crate::timestamp::Timestamp;

/// Tunables a caller sets before `TcpServer::start()`. `reuse_port` replaces
/// the source's `Option` enum (`kNoReusePort`/`kReusePort`) with a plain
/// bool alongside the other knobs.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub reuse_port: bool,
    pub thread_num: usize,
    pub high_water_mark: usize,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            reuse_port: false,
            thread_num: 0,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

type ConnectionCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>, &mut Buffer, Timestamp) + Send + Sync>;
type WriteCompleteCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync>;
type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// Assembles an [`Acceptor`] bound to the base loop with an
/// [`EventLoopThreadPool`] of worker loops: accepted sockets are handed off
/// round-robin to a worker, wrapped in a [`TcpConnection`], and tracked in
/// a name-keyed connection map that only the base loop touches.
pub struct TcpServer {
    base_loop: EventLoopHandle,
    name: String,
    acceptor: Arc<Mutex<Acceptor>>,
    thread_pool: Arc<Mutex<EventLoopThreadPool>>,
    connections: Arc<Mutex<HashMap<String, Arc<Mutex<TcpConnection>>>>>,
    next_conn_id: AtomicUsize,
    started: AtomicBool,
    options: ServerOptions,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    pub fn new(
        base_event_loop: &mut EventLoop,
        listen_addr: InetAddress,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> io::Result<Arc<TcpServer>> {
        let name = name.into();
        let acceptor = Acceptor::new(base_event_loop, listen_addr, options.reuse_port)?;
        let thread_pool = EventLoopThreadPool::new(base_event_loop.handle(), name.clone());

        let server = Arc::new(TcpServer {
            base_loop: base_event_loop.handle(),
            name,
            acceptor: Arc::new(Mutex::new(acceptor)),
            thread_pool: Arc::new(Mutex::new(thread_pool)),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicUsize::new(1),
            started: AtomicBool::new(false),
            options,
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
        });

        {
            let server_weak = Arc::downgrade(&server);
            let mut acceptor = server.acceptor.lock().unwrap();
            acceptor.set_new_connection_callback(move |accepted: TcpListenerAccepted| {
                if let Some(server) = server_weak.upgrade() {
                    server.new_connection(accepted);
                }
            });
        }

        // Wired here (not in `start()`) because only here do we hold a real
        // `&mut EventLoop` for the base loop; `start()` only has an
        // `EventLoopHandle` and must reach the channel via a posted job.
        let token = server.acceptor.lock().unwrap().token();
        let acceptor_for_read = server.acceptor.clone();
        let channel = base_event_loop.channel_mut(token).expect("acceptor channel missing");
        channel.set_read_callback(move |_event_loop, _ts| {
            acceptor_for_read.lock().unwrap().handle_read();
        });

        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.acceptor.lock().unwrap().local_addr()
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.lock().unwrap().set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync + 'static) {
        *self.connection_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&self, cb: impl Fn(&Arc<Mutex<TcpConnection>>, &mut Buffer, Timestamp) + Send + Sync + 'static) {
        *self.message_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&self, cb: impl Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync + 'static) {
        *self.write_complete_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        *self.thread_init_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Idempotent via atomic test-and-increment: starts the worker pool with
    /// the thread-init callback, then posts `Acceptor::listen()` to the
    /// base loop.
    pub fn start(self: &Arc<TcpServer>) -> io::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let init_cb = self.thread_init_callback.lock().unwrap().clone();
        self.thread_pool.lock().unwrap().start(init_cb.clone())?;

        info!("TcpServer [{}] starting on {} threads", self.name, self.options.thread_num);

        // `EventLoopThreadPool::start` only runs `init_cb` on worker
        // threads it actually spawns; with `thread_num == 0` there are
        // none, so the base loop -- which doubles as the only loop in that
        // case -- needs the callback applied directly here.
        let no_worker_threads = self.options.thread_num == 0;
        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(Box::new(move |event_loop| {
            if no_worker_threads {
                if let Some(cb) = init_cb.as_ref() {
                    cb(event_loop);
                }
            }
            acceptor.lock().unwrap().listen(event_loop).expect("acceptor listen failed");
        }))?;

        Ok(())
    }

    fn new_connection(&self, accepted: TcpListenerAccepted) {
        let worker = self.thread_pool.lock().unwrap().get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer_addr = accepted.peer_addr;
        let name = format!("{}-{}#{}", self.name, peer_addr, conn_id);
        let local_addr = accepted.stream.local_addr();

        let connection_cb = self.connection_callback.lock().unwrap().clone();
        let message_cb = self.message_callback.lock().unwrap().clone();
        let write_complete_cb = self.write_complete_callback.lock().unwrap().clone();
        let high_water_mark = self.options.high_water_mark;

        let connections = self.connections.clone();
        let name_for_close = name.clone();

        let stream = accepted.stream;
        let name_for_job = name.clone();

        let _ = worker.run_in_loop(Box::new(move |event_loop| {
            let local_addr = local_addr.unwrap_or(peer_addr);
            let token = event_loop.new_channel(std::os::unix::io::AsRawFd::as_raw_fd(&stream));

            let conn = match TcpConnection::new(event_loop.handle(), token, name_for_job.clone(), stream, local_addr, peer_addr) {
                Ok(conn) => Arc::new(Mutex::new(conn)),
                Err(e) => {
                    log::error!("failed to construct TcpConnection: {}", e);
                    let _ = event_loop.remove_channel(token);
                    return;
                }
            };

            {
                let mut guard = conn.lock().unwrap();
                if let Some(cb) = connection_cb.clone() {
                    guard.set_connection_callback(move |c| cb(c));
                }
                if let Some(cb) = message_cb.clone() {
                    guard.set_message_callback(move |c, buf, ts| cb(c, buf, ts));
                }
                if let Some(cb) = write_complete_cb.clone() {
                    guard.set_write_complete_callback(move |c| cb(c));
                }
                guard.set_high_water_mark(high_water_mark);
            }

            {
                let connections = connections.clone();
                let name_for_close = name_for_close.clone();
                let mut guard = conn.lock().unwrap();
                guard.set_close_callback(move |c| {
                    let mut map = connections.lock().unwrap();
                    map.remove(&name_for_close);
                    drop(map);
                    let c = c.clone();
                    let handle = c.lock().unwrap().loop_handle().clone();
                    let _ = handle.queue_in_loop(Box::new(move |event_loop| {
                        TcpConnection::connect_destroyed(&c, event_loop);
                    }));
                });
            }

            connections.lock().unwrap().insert(name_for_job.clone(), conn.clone());

            TcpConnection::bind_channel(&conn, event_loop);
            TcpConnection::connect_established(&conn, event_loop);
        }));
    }

    pub fn connections_len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}
