use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::epoll::Ready;
use crate::event_loop::EventLoop;
use crate::tcp_connection::TcpConnection;
use crate::timestamp::Timestamp;

/// Membership of a [`Channel`] in the [`Poller`](crate::poller::Poller)'s
/// registry. Mirrors the `kNew`/`kAdded`/`kDeleted` states muduo's `Channel`
/// carries; a channel removed from the OS multiplexer but still tracked
/// (interest went to zero) stays `Deleted` rather than dropping out of the
/// registry, so re-enabling interest later doesn't need a fresh registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Added,
    Deleted,
}

type ReadCallback = Box<dyn FnMut(&mut EventLoop, Timestamp) + Send>;
type EventCallback = Box<dyn FnMut(&mut EventLoop) + Send>;

/// Binds one file descriptor's readiness to typed callbacks. A `Channel`
/// does not own its fd and is bound to exactly one `EventLoop`/`Poller` for
/// its whole life; it is addressed from outside by the `Token` the poller
/// handed back at registration.
///
/// Callbacks take `&mut EventLoop` rather than closing over one, because the
/// `Channel` they fire from lives inside that same `EventLoop`'s `Poller`.
/// Dispatch therefore proceeds in two steps (see
/// [`EventLoop::dispatch_channel`](crate::event_loop::EventLoop)): the four
/// callback boxes are taken out of the `Channel` first, breaking the borrow
/// on the `Poller`, then invoked with a genuine `&mut EventLoop` in hand, and
/// finally put back. A callback that needs to toggle its own channel's
/// interest (`sendInLoop` enabling write interest, `handleWrite` disabling
/// it) just calls the `EventLoop` methods directly with the token it was
/// constructed with.
pub struct Channel {
    fd: RawFd,
    interest: Ready,
    revents: Ready,
    state: ChannelState,
    tie: Option<Weak<Mutex<TcpConnection>>>,
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

/// The callback boxes taken out of a `Channel` for the duration of dispatch.
#[derive(Default)]
pub(crate) struct ChannelCallbacks {
    read_callback: Option<ReadCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl ChannelCallbacks {
    /// Runs the close/error/read/write callbacks (in that priority order,
    /// each independent of the others -- a hang-up does not suppress a
    /// readable callback also firing) against `revents`.
    pub(crate) fn dispatch(&mut self, event_loop: &mut EventLoop, revents: Ready, receive_time: Timestamp) {
        if revents.is_hup() && !revents.is_readable() {
            if let Some(cb) = self.close_callback.as_mut() {
                cb(event_loop);
            }
        }

        if revents.is_error() {
            if let Some(cb) = self.error_callback.as_mut() {
                cb(event_loop);
            }
        }

        if revents.is_readable() {
            if let Some(cb) = self.read_callback.as_mut() {
                cb(event_loop, receive_time);
            }
        }

        if revents.is_writable() {
            if let Some(cb) = self.write_callback.as_mut() {
                cb(event_loop);
            }
        }
    }
}

impl Channel {
    pub(crate) fn new(fd: RawFd) -> Channel {
        Channel {
            fd,
            interest: Ready::empty(),
            revents: Ready::empty(),
            state: ChannelState::New,
            tie: None,
            read_callback: None,
            write_callback: None,
            close_callback: None,
            error_callback: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest
    }

    pub fn revents(&self) -> Ready {
        self.revents
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ChannelState) {
        self.state = state;
    }

    pub(crate) fn set_revents(&mut self, revents: Ready) {
        self.revents = revents;
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest.is_empty()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn enable_reading(&mut self) {
        self.interest.insert(Ready::readable());
    }

    pub fn disable_reading(&mut self) {
        self.interest.remove(Ready::readable());
    }

    pub fn enable_writing(&mut self) {
        self.interest.insert(Ready::writable());
    }

    pub fn disable_writing(&mut self) {
        self.interest.remove(Ready::writable());
    }

    pub fn disable_all(&mut self) {
        self.interest = Ready::empty();
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(&mut EventLoop, Timestamp) + Send + 'static) {
        self.read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut(&mut EventLoop) + Send + 'static) {
        self.write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut(&mut EventLoop) + Send + 'static) {
        self.close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut(&mut EventLoop) + Send + 'static) {
        self.error_callback = Some(Box::new(cb));
    }

    /// Ties this channel's dispatch to `owner`'s lifetime: before invoking
    /// any callback, the tie is upgraded to a strong reference and held for
    /// the duration of dispatch; if the owner is already gone, dispatch is
    /// skipped entirely. Only `TcpConnection` channels need a tie (not the
    /// acceptor's or the wakeup channel's).
    pub fn tie(&mut self, owner: &Arc<Mutex<TcpConnection>>) {
        self.tie = Some(Arc::downgrade(owner));
    }

    /// `true` if this channel has no tie, or its tie still upgrades -- i.e.
    /// dispatch should proceed. A strong reference taken here is dropped
    /// again immediately; its only purpose was to prove the owner is still
    /// alive, not to hold it past this check.
    pub(crate) fn should_dispatch(&self) -> bool {
        match &self.tie {
            Some(tie) => tie.upgrade().is_some(),
            None => true,
        }
    }

    pub(crate) fn take_callbacks(&mut self) -> ChannelCallbacks {
        ChannelCallbacks {
            read_callback: self.read_callback.take(),
            write_callback: self.write_callback.take(),
            close_callback: self.close_callback.take(),
            error_callback: self.error_callback.take(),
        }
    }

    pub(crate) fn restore_callbacks(&mut self, cbs: ChannelCallbacks) {
        self.read_callback = cbs.read_callback;
        self.write_callback = cbs.write_callback;
        self.close_callback = cbs.close_callback;
        self.error_callback = cbs.error_callback;
    }
}
