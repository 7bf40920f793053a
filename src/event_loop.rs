use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{debug, info};

use crate::channel::Channel;
use crate::epoll::Token;
use crate::poller::Poller;
use crate::queue::Queue;
use crate::timestamp::Timestamp;

/// A unit of work posted across threads to run on a specific loop. Takes
/// `&mut EventLoop` so a queued functor can touch channels (enable/disable
/// interest, register/remove) the same way a channel callback can.
pub type Job = Box<dyn FnOnce(&mut EventLoop) + Send + 'static>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_IN_THIS_THREAD: Cell<bool> = Cell::new(false);
}

/// The `Send + Sync` half of an `EventLoop`: everything a different thread
/// is allowed to touch. Cheap to clone (an `Arc` around a lock-free queue
/// plus two atomics) and freely shareable once handed out.
#[derive(Clone)]
pub struct EventLoopHandle {
    queue: Queue<Job>,
    quit: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
    thread_id: ThreadId,
}

impl EventLoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop methods must run on the owning thread"
        );
    }

    /// Posts `f` to run on the owning loop. The original source runs `f`
    /// inline when the caller is already on the loop's thread, which it can
    /// do because `runInLoop` is a method on a live `EventLoop*`; a cloned
    /// `EventLoopHandle` only ever has the `Send + Sync` half of the loop in
    /// hand, never a live `&mut EventLoop`; even same-thread callers reach
    /// this from inside a channel callback, where the `EventLoop` is
    /// already mutably borrowed by the dispatch call above them on the
    /// stack. So every call -- same-thread or not -- goes through the
    /// queue; same-thread callers still get their functor run before the
    /// next poll, since `queue_in_loop` wakes (and `run` drains) before
    /// blocking again.
    pub fn run_in_loop(&self, f: Job) -> io::Result<()> {
        self.queue_in_loop(f)
    }

    /// Appends `f` to the pending-functor queue. Wakes the loop iff the
    /// caller isn't the owning thread, or the loop is mid-drain (so a
    /// functor queued from inside another functor isn't deferred a whole
    /// poll cycle).
    pub fn queue_in_loop(&self, f: Job) -> io::Result<()> {
        if self.queue.push(f).is_err() {
            return Err(io::Error::new(io::ErrorKind::Other, "event loop queue closed"));
        }

        if !self.is_in_loop_thread() || self.draining.load(Ordering::SeqCst) {
            self.wakeup()?;
        }

        Ok(())
    }

    pub fn wakeup(&self) -> io::Result<()> {
        self.queue.wake()
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            let _ = self.wakeup();
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.queue.as_raw_fd()
    }
}

/// Single-threaded reactor: owns a `Poller` and a pending-functor queue,
/// and runs until `quit()` is observed. Confined for its whole life to the
/// thread that constructs it -- a second `EventLoop` on the same thread is
/// a programming error and is fatal.
pub struct EventLoop {
    poller: Poller,
    handle: EventLoopHandle,
    wakeup_token: Token,
    looping: bool,
    active: Vec<Token>,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        LOOP_IN_THIS_THREAD.with(|flag| {
            assert!(
                !flag.get(),
                "another EventLoop already exists in this thread"
            );
            flag.set(true);
        });

        let mut poller = Poller::new()?;
        let queue = Queue::<Job>::unbounded()?;

        let wakeup_token = poller.new_channel(queue.as_raw_fd());
        {
            let channel = poller.channel_mut(wakeup_token).unwrap();
            // Draining happens unconditionally every iteration (step 4 of
            // `run`); this callback only needs to exist so the channel has
            // read interest to report on.
            channel.set_read_callback(|_loop, _ts| {});
            channel.enable_reading();
        }
        poller.update_channel(wakeup_token)?;

        let handle = EventLoopHandle {
            queue,
            quit: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
            thread_id: thread::current().id(),
        };

        debug!("EventLoop created in thread {:?}", handle.thread_id);

        Ok(EventLoop {
            poller,
            handle,
            wakeup_token,
            looping: false,
            active: Vec::new(),
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.handle.assert_in_loop_thread();
    }

    /// Runs until `quit()` is observed. Each iteration: poll up to 10s,
    /// dispatch every active channel's `handle_event`, then drain whatever
    /// functors were pending at the start of the drain.
    pub fn run(&mut self) -> io::Result<()> {
        self.looping = true;
        info!("EventLoop start looping");

        while !self.handle.quit.load(Ordering::SeqCst) {
            let now = self.poller.poll(Some(POLL_TIMEOUT), &mut self.active)?;

            let active = std::mem::take(&mut self.active);
            for token in &active {
                self.dispatch_channel(*token, now);
            }
            self.active = active;

            self.drain_pending_functors();
        }

        info!("EventLoop stop looping");
        self.looping = false;
        Ok(())
    }

    /// Dispatches one ready channel's callbacks. The callback boxes are
    /// taken out of the `Channel` first (breaking the borrow on `Poller`)
    /// so the callbacks themselves can take `&mut EventLoop` and mutate any
    /// channel, including their own, then put back once dispatch returns.
    fn dispatch_channel(&mut self, token: Token, now: Timestamp) {
        let (revents, dispatch) = match self.poller.channel(token) {
            Some(channel) => (channel.revents(), channel.should_dispatch()),
            None => return,
        };

        if !dispatch {
            return;
        }

        let mut callbacks = match self.poller.channel_mut(token) {
            Some(channel) => channel.take_callbacks(),
            None => return,
        };

        callbacks.dispatch(self, revents, now);

        if let Some(channel) = self.poller.channel_mut(token) {
            channel.restore_callbacks(callbacks);
        }
    }

    /// Swaps exactly the functors pending at the start of this call into a
    /// local vector and runs them, rather than holding the queue's lock (it
    /// has none) for the whole drain -- this bounds one drain to the
    /// snapshot taken and lets a functor queue further work without
    /// deadlocking against itself.
    fn drain_pending_functors(&mut self) {
        self.handle.draining.store(true, Ordering::SeqCst);

        let pending = self.handle.queue.pending();
        for _ in 0..pending {
            match self.handle.queue.pop() {
                Ok(job) => job(self),
                Err(_) => break,
            }
        }

        self.handle.draining.store(false, Ordering::SeqCst);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn run_in_loop(&self, f: Job) -> io::Result<()> {
        self.handle.run_in_loop(f)
    }

    pub fn queue_in_loop(&self, f: Job) -> io::Result<()> {
        self.handle.queue_in_loop(f)
    }

    pub fn wakeup(&self) -> io::Result<()> {
        self.handle.wakeup()
    }

    pub fn new_channel(&mut self, fd: RawFd) -> Token {
        self.assert_in_loop_thread();
        self.poller.new_channel(fd)
    }

    pub fn channel(&self, token: Token) -> Option<&Channel> {
        self.poller.channel(token)
    }

    pub fn channel_mut(&mut self, token: Token) -> Option<&mut Channel> {
        self.assert_in_loop_thread();
        self.poller.channel_mut(token)
    }

    pub fn update_channel(&mut self, token: Token) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.update_channel(token)
    }

    pub fn remove_channel(&mut self, token: Token) -> io::Result<()> {
        self.assert_in_loop_thread();
        self.poller.remove_channel(token)
    }

    pub fn has_channel(&self, token: Token) -> bool {
        self.poller.has_channel(token)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.poller.remove_channel(self.wakeup_token);
        LOOP_IN_THIS_THREAD.with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    #[test]
    fn cross_thread_quit_returns_promptly() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();

        let quitter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.quit();
        });

        let started = Instant::now();
        event_loop.run().unwrap();
        quitter.join().unwrap();

        assert!(started.elapsed() < POLL_TIMEOUT, "quit() should wake the poll, not wait out its timeout");
    }

    #[test]
    fn queue_in_loop_preserves_posting_order() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..5 {
            let order = order.clone();
            handle.queue_in_loop(Box::new(move |_| order.lock().unwrap().push(i))).unwrap();
        }

        let quit_handle = handle.clone();
        handle
            .queue_in_loop(Box::new(move |_| quit_handle.quit()))
            .unwrap();

        event_loop.run().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn queued_work_from_a_second_thread_runs_on_the_owning_loop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_in_loop = ran.clone();

        let runner = thread::spawn(move || {
            let mut event_loop = EventLoop::new().unwrap();
            tx.send(event_loop.handle()).unwrap();
            event_loop.run().unwrap();
        });

        let handle = rx.recv().unwrap();
        handle
            .run_in_loop(Box::new(move |_| {
                ran_in_loop.store(true, Ordering::SeqCst);
            }))
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        handle.quit();
        runner.join().unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }
}
