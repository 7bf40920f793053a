use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use log::{error, warn};

use crate::addr::InetAddress;
use crate::epoll::{Ready, Token};
use crate::event_loop::EventLoop;
use crate::net::tcp::TcpListener;

type NewConnectionCallback = Box<dyn FnMut(TcpListenerAccepted) + Send>;

/// An accepted connection handed to `TcpServer`: the stream plus the peer
/// address `getpeername` reported for it.
pub struct TcpListenerAccepted {
    pub stream: crate::net::tcp::TcpStream,
    pub peer_addr: SocketAddr,
}

/// Owns the listening socket and its channel on the base loop. Resists
/// descriptor exhaustion on accept with a pre-reserved idle fd: when
/// `accept` fails with `EMFILE`, the idle fd is closed to free one slot,
/// the stuck connection is accepted and immediately dropped, and the idle
/// fd is re-opened -- this keeps a perpetually-ready listener from
/// busy-spinning once the process hits its descriptor limit.
pub struct Acceptor {
    listener: TcpListener,
    token: Token,
    listening: bool,
    idle_fd: Option<File>,
    new_connection_callback: Option<NewConnectionCallback>,
}

impl Acceptor {
    pub fn new(event_loop: &mut EventLoop, listen_addr: InetAddress, reuseport: bool) -> io::Result<Acceptor> {
        let listener = TcpListener::bind(listen_addr.as_socket_addr())?;
        if reuseport {
            listener.set_reuseport(true)?;
        }

        let token = event_loop.new_channel(listener.as_raw_fd());
        let idle_fd = File::open("/dev/null").ok();

        Ok(Acceptor {
            listener,
            token,
            listening: false,
            idle_fd,
            new_connection_callback: None,
        })
    }

    pub fn set_new_connection_callback(&mut self, cb: impl FnMut(TcpListenerAccepted) + Send + 'static) {
        self.new_connection_callback = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Puts the listener into listening mode and enables read interest on
    /// its channel. Must run on the owning (base) loop. The caller (see
    /// `TcpServer::new`, which holds this `Acceptor` behind an
    /// `Arc<Mutex<_>>`) is responsible for wiring the channel's actual read
    /// callback to `Acceptor::handle_read` before calling this, the same
    /// shared-ownership pattern `TcpConnection` uses for its own channel.
    pub fn listen(&mut self, event_loop: &mut EventLoop) -> io::Result<()> {
        event_loop.assert_in_loop_thread();
        self.listening = true;
        let channel = event_loop.channel_mut(self.token).expect("acceptor channel missing");
        channel.enable_reading();
        event_loop.update_channel(self.token)
    }

    /// Accepts as many pending connections as are ready and invokes the
    /// new-connection callback for each. Called by `TcpServer` when the
    /// acceptor's channel reports readable.
    pub fn handle_read(&mut self) {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                // SO_KEEPALIVE is set on `TcpConnection::new`, once the
                // stream has a worker loop to call home to; not here.
                if let Some(cb) = self.new_connection_callback.as_mut() {
                    cb(TcpListenerAccepted { stream, peer_addr });
                }
                // else: dropping `stream` here closes the fd, matching
                // "if no callback set, close the fd".
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if is_emfile(&e) => {
                warn!("acceptor: fd exhaustion on accept, recovering idle fd trick");
                self.idle_fd = None;
                if let Ok((_stream, _addr)) = self.listener.accept() {
                    // accept-and-drop: frees the descriptor that was stuck
                    // pending, since `_stream` is dropped at end of scope.
                }
                self.idle_fd = File::open("/dev/null").ok();
            }
            Err(e) => {
                error!("acceptor: accept failed: {}", e);
            }
        }
    }

    pub fn readiness(&self) -> Ready {
        Ready::readable()
    }
}

fn is_emfile(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EMFILE)
}
