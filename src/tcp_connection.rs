use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use crate::buffer::Buffer;
use crate::epoll::Token;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::net::tcp::TcpStream;
use crate::timestamp::Timestamp;

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

type ConnectionCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync>;
type MessageCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>, &mut Buffer, Timestamp) + Send + Sync>;
type WriteCompleteCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync>;
type HighWaterMarkCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>, usize) + Send + Sync>;
type CloseCallback = Arc<dyn Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync>;

/// One accepted connection's state machine: `Connecting -> Connected ->
/// {Disconnecting ->}? Disconnected`. Lives behind `Arc<Mutex<_>>` because
/// the channel's tie needs a weak observer and the channel's own callback
/// closures need a strong one to call back into. The mutex only ever
/// contends with itself on the owning worker thread -- every entry point
/// that mutates state either runs inside that loop's dispatch or is hopped
/// onto it first via `runInLoop`/`queueInLoop` -- so it is never actually
/// contended across threads running concurrently.
///
/// Every dispatch method below clones whatever callback it needs to fire
/// out of the guard and drops the lock *before* invoking it. User callbacks
/// routinely call back into `send`/`shutdown`/`connected`/`peer_addr` on the
/// very same `Arc<Mutex<TcpConnection>>` they were handed (the echo
/// callback in this crate's own doc example does exactly this) -- a
/// `std::sync::Mutex` is not reentrant, so holding the guard across a
/// callback invocation would deadlock the worker loop against itself the
/// first time a handler called back in.
pub struct TcpConnection {
    loop_handle: EventLoopHandle,
    token: Token,
    name: String,
    stream: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: State,
    reading: bool,
    input_buffer: Buffer,
    output_buffer: Buffer,
    high_water_mark: usize,
    connection_callback: Option<ConnectionCallback>,
    message_callback: Option<MessageCallback>,
    write_complete_callback: Option<WriteCompleteCallback>,
    high_water_mark_callback: Option<HighWaterMarkCallback>,
    close_callback: Option<CloseCallback>,
}

impl TcpConnection {
    pub fn new(
        loop_handle: EventLoopHandle,
        token: Token,
        name: String,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> io::Result<TcpConnection> {
        stream.set_keepalive(true)?;

        Ok(TcpConnection {
            loop_handle,
            token,
            name,
            stream,
            local_addr,
            peer_addr,
            state: State::Connecting,
            reading: true,
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            connection_callback: None,
            message_callback: None,
            write_complete_callback: None,
            high_water_mark_callback: None,
            close_callback: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn loop_handle(&self) -> &EventLoopHandle {
        &self.loop_handle
    }

    /// `reading_` is set at construction in the source and never toggled
    /// again -- there is no public API to pause reads. Kept as a latent
    /// hook for the same reason: a future read-pausing feature would flip
    /// this and disable the channel's read interest to match.
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn set_high_water_mark(&mut self, bytes: usize) {
        self.high_water_mark = bytes;
    }

    pub fn set_connection_callback(&mut self, cb: impl Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync + 'static) {
        self.connection_callback = Some(Arc::new(cb));
    }

    pub fn set_message_callback(&mut self, cb: impl Fn(&Arc<Mutex<TcpConnection>>, &mut Buffer, Timestamp) + Send + Sync + 'static) {
        self.message_callback = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(&mut self, cb: impl Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync + 'static) {
        self.write_complete_callback = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(&mut self, cb: impl Fn(&Arc<Mutex<TcpConnection>>, usize) + Send + Sync + 'static) {
        self.high_water_mark_callback = Some(Arc::new(cb));
    }

    /// Internal hook the owning `TcpServer` installs to learn when this
    /// connection has fully closed, so it can erase it from its map.
    pub(crate) fn set_close_callback(&mut self, cb: impl Fn(&Arc<Mutex<TcpConnection>>) + Send + Sync + 'static) {
        self.close_callback = Some(Arc::new(cb));
    }

    /// Wires the channel's callbacks to dispatch back into `this` and ties
    /// the channel to `this`'s lifetime. Must run on the owning worker loop,
    /// once, right after construction, with the same `Arc` the caller keeps.
    pub(crate) fn bind_channel(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop) {
        let token = this.lock().unwrap().token;

        let read_owner = this.clone();
        let write_owner = this.clone();
        let close_owner = this.clone();
        let error_owner = this.clone();

        let channel = event_loop.channel_mut(token).expect("connection channel missing");
        channel.set_read_callback(move |event_loop, ts| {
            TcpConnection::handle_read(&read_owner, event_loop, ts);
        });
        channel.set_write_callback(move |event_loop| {
            TcpConnection::handle_write(&write_owner, event_loop);
        });
        channel.set_close_callback(move |event_loop| {
            TcpConnection::handle_close(&close_owner, event_loop);
        });
        channel.set_error_callback(move |_event_loop| {
            TcpConnection::handle_error(&error_owner);
        });
        channel.tie(this);
    }

    /// Sets state to `Connected`, enables read interest, fires the
    /// connection callback. Must run on the owning worker loop.
    pub fn connect_established(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop) {
        let (token, cb) = {
            let mut conn = this.lock().unwrap();
            conn.state = State::Connected;
            (conn.token, conn.connection_callback.clone())
        };

        if let Some(channel) = event_loop.channel_mut(token) {
            channel.enable_reading();
        }
        let _ = event_loop.update_channel(token);

        if let Some(f) = cb {
            f(this);
        }
    }

    /// Removes the channel from the poller. Must run on the owning worker
    /// loop, after `handleClose` has already set state to `Disconnected`.
    pub fn connect_destroyed(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop) {
        let token = {
            let mut conn = this.lock().unwrap();
            conn.state = State::Disconnected;
            conn.token
        };

        if let Some(channel) = event_loop.channel_mut(token) {
            channel.disable_all();
        }
        let _ = event_loop.update_channel(token);
        let _ = event_loop.remove_channel(token);
    }

    fn handle_read(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop, receive_time: Timestamp) {
        let result = {
            let mut conn = this.lock().unwrap();
            conn.input_buffer.read_from(&conn.stream)
        };

        match result {
            Ok(0) => TcpConnection::handle_close(this, event_loop),
            Ok(_n) => {
                let cb = this.lock().unwrap().message_callback.clone();
                if let Some(cb) = cb {
                    // The buffer is swapped out (not borrowed from a held
                    // guard) so `cb` can freely call back into `this`
                    // (e.g. `send`) without relocking against itself.
                    let mut buf = std::mem::take(&mut this.lock().unwrap().input_buffer);
                    cb(this, &mut buf, receive_time);
                    this.lock().unwrap().input_buffer = buf;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("TcpConnection::handleRead error: {}", e);
                TcpConnection::handle_error(this);
            }
        }
    }

    /// Writes the readable region of the output buffer; on drain, disables
    /// write interest, fires the write-complete callback, and -- if
    /// shutdown was requested while output was still pending -- performs
    /// the deferred half-close now.
    fn handle_write(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop) {
        let token = this.lock().unwrap().token;

        if !event_loop.channel(token).map(|c| c.is_writing()).unwrap_or(false) {
            return;
        }

        let (drained, write_complete_cb, should_shutdown);
        {
            let mut conn = this.lock().unwrap();
            match conn.output_buffer.write_to(&conn.stream) {
                Ok(_n) => {
                    drained = conn.output_buffer.readable_bytes() == 0;
                    write_complete_cb = if drained { conn.write_complete_callback.clone() } else { None };
                    should_shutdown = drained && conn.state == State::Disconnecting;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return;
                }
                Err(e) => {
                    error!("TcpConnection::handleWrite error: {}", e);
                    return;
                }
            }
        }

        if drained {
            if let Some(channel) = event_loop.channel_mut(token) {
                channel.disable_writing();
            }
            let _ = event_loop.update_channel(token);
        }

        if let Some(f) = write_complete_cb {
            f(this);
        }

        if should_shutdown {
            TcpConnection::shutdown_in_loop(this, event_loop);
        }
    }

    fn handle_close(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop) {
        let (already_closed, token, connection_cb, close_cb) = {
            let mut conn = this.lock().unwrap();
            let already_closed = conn.state == State::Disconnected;
            conn.state = State::Disconnected;
            (already_closed, conn.token, conn.connection_callback.clone(), conn.close_callback.clone())
        };

        if already_closed {
            return;
        }

        if let Some(channel) = event_loop.channel_mut(token) {
            channel.disable_all();
        }
        let _ = event_loop.update_channel(token);

        if let Some(f) = connection_cb {
            f(this);
        }
        if let Some(f) = close_cb {
            f(this);
        }
    }

    fn handle_error(this: &Arc<Mutex<TcpConnection>>) {
        let conn = this.lock().unwrap();
        match conn.stream.take_error() {
            Ok(Some(e)) => warn!("TcpConnection [{}] SO_ERROR: {}", conn.name, e),
            Ok(None) => warn!("TcpConnection [{}] handleError with no SO_ERROR set", conn.name),
            Err(e) => warn!("TcpConnection [{}] failed to read SO_ERROR: {}", conn.name, e),
        }
    }

    /// Thread-safe entry point: always hops to the worker loop (see the note
    /// on `EventLoopHandle::run_in_loop` for why even same-thread callers go
    /// through the queue) and appends to the output path there.
    pub fn send(this: &Arc<Mutex<TcpConnection>>, data: &[u8]) {
        let (connected, loop_handle) = {
            let conn = this.lock().unwrap();
            (conn.state == State::Connected, conn.loop_handle.clone())
        };

        if !connected {
            return;
        }

        let this = this.clone();
        let data = data.to_vec();
        let _ = loop_handle.run_in_loop(Box::new(move |event_loop| {
            TcpConnection::send_in_loop(&this, event_loop, &data);
        }));
    }

    fn send_in_loop(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop, data: &[u8]) {
        let token = this.lock().unwrap().token;

        let mut remaining = data.len();
        let mut offset = 0usize;
        let mut fault_error = false;
        let mut write_complete_cb = None;
        let mut high_water_mark_cb = None;
        let mut high_water_queued = 0usize;

        {
            let mut conn = this.lock().unwrap();

            if conn.state == State::Disconnected {
                warn!("TcpConnection [{}] send after disconnect, dropping", conn.name);
                return;
            }

            let channel_writable = event_loop.channel(token).map(|c| c.is_writing()).unwrap_or(false);
            if !channel_writable && conn.output_buffer.readable_bytes() == 0 {
                match conn.stream.write_once(data) {
                    Ok(n) => {
                        offset = n;
                        remaining = data.len() - n;
                        if remaining == 0 {
                            write_complete_cb = conn.write_complete_callback.clone();
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        if e.raw_os_error() == Some(libc::EPIPE) || e.raw_os_error() == Some(libc::ECONNRESET) {
                            fault_error = true;
                        }
                        error!("TcpConnection [{}] write error: {}", conn.name, e);
                    }
                }
            }

            if !fault_error && remaining > 0 {
                let old_pending = conn.output_buffer.readable_bytes();
                if old_pending < conn.high_water_mark && old_pending + remaining >= conn.high_water_mark {
                    high_water_mark_cb = conn.high_water_mark_callback.clone();
                    high_water_queued = old_pending + remaining;
                }
                conn.output_buffer.append(&data[offset..]);

                if !channel_writable {
                    drop(conn);
                    if let Some(channel) = event_loop.channel_mut(token) {
                        channel.enable_writing();
                    }
                    let _ = event_loop.update_channel(token);
                }
            }
        }

        if let Some(f) = write_complete_cb {
            f(this);
        }
        if let Some(f) = high_water_mark_cb {
            f(this, high_water_queued);
        }
    }

    pub fn shutdown(this: &Arc<Mutex<TcpConnection>>) {
        let loop_handle = {
            let mut conn = this.lock().unwrap();
            if conn.state == State::Connected {
                conn.state = State::Disconnecting;
            }
            conn.loop_handle.clone()
        };

        let this = this.clone();
        let _ = loop_handle.run_in_loop(Box::new(move |event_loop| {
            TcpConnection::shutdown_in_loop(&this, event_loop);
        }));
    }

    /// Half-closes the write side only once the output buffer has fully
    /// drained (write interest off); otherwise defers -- `handleWrite`
    /// retries this once the buffer empties. The original source shuts the
    /// write side down unconditionally here, which can truncate buffered
    /// output still queued behind a slow reader; this guard is the fix.
    fn shutdown_in_loop(this: &Arc<Mutex<TcpConnection>>, event_loop: &mut EventLoop) {
        let conn = this.lock().unwrap();
        let writing = event_loop.channel(conn.token).map(|c| c.is_writing()).unwrap_or(false);
        if writing {
            debug!("TcpConnection [{}] shutdown deferred, output buffer not drained", conn.name);
            return;
        }
        if let Err(e) = conn.stream.shutdown(std::net::Shutdown::Write) {
            warn!("TcpConnection [{}] shutdown(write) failed: {}", conn.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_default_is_64_mebibytes() {
        assert_eq!(DEFAULT_HIGH_WATER_MARK, 64 * 1024 * 1024);
    }
}
