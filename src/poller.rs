use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use indexmap::IndexMap;
use log::trace;
use slab::Slab;

use crate::channel::{Channel, ChannelState};
use crate::epoll::{Epoll, EpollOpt, Events, Token};
use crate::timestamp::Timestamp;

/// Owns every [`Channel`] registered with one `EventLoop`, keyed by `Token`,
/// plus the `epoll` instance they're registered against. Channels are
/// level-triggered: the core's handlers read or write once per wake-up
/// rather than looping until `EWOULDBLOCK`, so a re-arming edge-triggered
/// mode would silently drop events.
pub struct Poller {
    epoll: Epoll,
    events: Events,
    channels: Slab<Channel>,
    registered: IndexMap<RawFd, Token>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            events: Events::with_capacity(16),
            channels: Slab::new(),
            registered: IndexMap::new(),
        })
    }

    /// Blocks up to `timeout`, then fills `active` with the tokens of every
    /// channel whose readiness changed, and returns a timestamp sampled
    /// after the wake.
    pub fn poll(&mut self, timeout: Option<Duration>, active: &mut Vec<Token>) -> io::Result<Timestamp> {
        let n = self.epoll.wait(&mut self.events, timeout)?;
        let now = Timestamp::now();

        active.clear();
        for i in 0..n {
            if let Some(event) = self.events.get(i) {
                let token = event.token();
                if let Some(channel) = self.channels.get_mut(token.0) {
                    channel.set_revents(event.readiness());
                    active.push(token);
                }
            }
        }

        Ok(now)
    }

    pub fn new_channel(&mut self, fd: RawFd) -> Token {
        Token(self.channels.insert(Channel::new(fd)))
    }

    pub fn channel(&self, token: Token) -> Option<&Channel> {
        self.channels.get(token.0)
    }

    pub fn channel_mut(&mut self, token: Token) -> Option<&mut Channel> {
        self.channels.get_mut(token.0)
    }

    /// Transitions a channel's OS/poller registration to match its current
    /// interest bitset. `New`/`Deleted` install it and mark `Added`; `Added`
    /// with empty interest removes it from the OS but keeps it mapped
    /// (`Deleted`) so re-enabling doesn't need a fresh registration; `Added`
    /// with non-empty interest just re-arms it.
    pub fn update_channel(&mut self, token: Token) -> io::Result<()> {
        let (fd, state, interest) = {
            let channel = self.channels.get(token.0).expect("update_channel: unknown token");
            (channel.fd(), channel.state(), channel.interest())
        };

        trace!("poller: update fd={} state={:?} interest={:?}", fd, state, interest);

        match state {
            ChannelState::New | ChannelState::Deleted => {
                self.epoll.add(&fd, token, interest, EpollOpt::level())?;
                self.registered.insert(fd, token);
                self.channels.get_mut(token.0).unwrap().set_state(ChannelState::Added);
            }
            ChannelState::Added => {
                if interest.is_empty() {
                    self.epoll.delete(&fd)?;
                    self.channels.get_mut(token.0).unwrap().set_state(ChannelState::Deleted);
                } else {
                    self.epoll.modify(&fd, token, interest, EpollOpt::level())?;
                }
            }
        }

        Ok(())
    }

    /// Erases a channel from the registry entirely, deleting it from the OS
    /// multiplexer first if it was still `Added`.
    pub fn remove_channel(&mut self, token: Token) -> io::Result<()> {
        let (fd, state) = {
            let channel = self.channels.get(token.0).expect("remove_channel: unknown token");
            (channel.fd(), channel.state())
        };

        trace!("poller: remove fd={} state={:?}", fd, state);

        self.registered.shift_remove(&fd);
        if state == ChannelState::Added {
            self.epoll.delete(&fd)?;
        }

        self.channels.remove(token.0);

        Ok(())
    }

    pub fn has_channel(&self, token: Token) -> bool {
        self.channels
            .get(token.0)
            .map(|c| c.state() == ChannelState::Added)
            .unwrap_or(false)
    }

    /// Looks a channel up by its raw fd rather than its `Token`. Mirrors the
    /// `fd -> Channel*` mapping spec.md's Poller data model calls for
    /// directly, distinct from `hasChannel`'s token-identity check.
    pub fn token_for_fd(&self, fd: RawFd) -> Option<Token> {
        self.registered.get(&fd).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn add_then_remove_tracks_state_and_fd_lookup() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();

        let mut poller = Poller::new().unwrap();
        let token = poller.new_channel(fd);
        assert!(!poller.has_channel(token));

        poller.channel_mut(token).unwrap().enable_reading();
        poller.update_channel(token).unwrap();
        assert!(poller.has_channel(token));
        assert_eq!(poller.token_for_fd(fd), Some(token));

        poller.channel_mut(token).unwrap().disable_all();
        poller.update_channel(token).unwrap();
        assert_eq!(poller.channel(token).unwrap().state(), ChannelState::Deleted);
        assert!(!poller.has_channel(token));

        poller.remove_channel(token).unwrap();
        assert!(poller.channel(token).is_none());
        assert_eq!(poller.token_for_fd(fd), None);
    }

    #[test]
    fn poll_reports_listener_readiness_after_connect() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.as_raw_fd();

        let mut poller = Poller::new().unwrap();
        let token = poller.new_channel(fd);
        poller.channel_mut(token).unwrap().enable_reading();
        poller.update_channel(token).unwrap();

        let _client = std::net::TcpStream::connect(addr).unwrap();

        let mut active = Vec::new();
        poller.poll(Some(Duration::from_secs(5)), &mut active).unwrap();
        assert_eq!(active, vec![token]);
        assert!(poller.channel(token).unwrap().revents().is_readable());
    }
}
