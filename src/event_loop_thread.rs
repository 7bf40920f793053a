use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::info;

use crate::event_loop::{EventLoop, EventLoopHandle};

type InitCallback = Box<dyn FnOnce(&EventLoop) + Send + 'static>;

/// Spawns a thread that constructs an `EventLoop` on its own stack and
/// publishes the handle back to the caller under a mutex + condition
/// variable -- the same handshake the original source used a semaphore for,
/// expressed with `std::sync` primitives. The thread is left detached once
/// started; nothing in this design joins worker threads during normal
/// operation.
pub struct EventLoopThread {
    init_callback: Option<InitCallback>,
    name: String,
}

impl EventLoopThread {
    pub fn new() -> EventLoopThread {
        EventLoopThread {
            init_callback: None,
            name: String::new(),
        }
    }

    pub fn with_init_callback(cb: impl FnOnce(&EventLoop) + Send + 'static) -> EventLoopThread {
        EventLoopThread {
            init_callback: Some(Box::new(cb)),
            name: String::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> EventLoopThread {
        self.name = name.into();
        self
    }

    /// Blocks until the spawned thread's `EventLoop` is constructed and
    /// returns a handle to it.
    pub fn start_loop(self) -> std::io::Result<EventLoopHandle> {
        let published: Arc<(Mutex<Option<EventLoopHandle>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let published_in_thread = published.clone();
        let init_callback = self.init_callback;
        let name = self.name;

        thread::spawn(move || {
            let mut event_loop = EventLoop::new().expect("failed to create EventLoop on worker thread");

            {
                let (lock, cvar) = &*published_in_thread;
                let mut guard = lock.lock().unwrap();
                *guard = Some(event_loop.handle());
                cvar.notify_one();
            }

            if let Some(cb) = init_callback {
                cb(&event_loop);
            }

            info!("EventLoopThread '{}' entering loop", name);
            event_loop.run().expect("EventLoop::run returned an error");
        });

        let (lock, cvar) = &*published;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        Ok(guard.clone().unwrap())
    }
}

impl Default for EventLoopThread {
    fn default() -> EventLoopThread {
        EventLoopThread::new()
    }
}

/// `numThreads == 0` means the base loop is the only loop; otherwise spawns
/// N worker threads up front and round-robins across them.
pub struct EventLoopThreadPool {
    base_loop: EventLoopHandle,
    name: String,
    num_threads: usize,
    loops: Vec<EventLoopHandle>,
    next: std::sync::atomic::AtomicUsize,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: EventLoopHandle, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.into(),
            num_threads: 0,
            loops: Vec::new(),
            next: std::sync::atomic::AtomicUsize::new(0),
            started: false,
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// `init_callback` runs once per worker loop, on that loop's own thread,
    /// right after construction and before it starts polling. When
    /// `num_threads == 0` there are no worker threads to run it on; the
    /// caller (`TcpServer::start`) is responsible for applying it to the
    /// base loop directly in that case.
    pub fn start(&mut self, init_callback: Option<Arc<dyn Fn(&EventLoop) + Send + Sync>>) -> std::io::Result<()> {
        assert!(!self.started, "EventLoopThreadPool already started");
        self.started = true;

        for i in 0..self.num_threads {
            let thread_name = format!("{}-{}", self.name, i);
            let thread = match &init_callback {
                Some(cb) => {
                    let cb = cb.clone();
                    EventLoopThread::with_init_callback(move |l| cb(l)).named(thread_name)
                }
                None => EventLoopThread::new().named(thread_name),
            };
            let handle = thread.start_loop()?;
            self.loops.push(handle);
        }

        Ok(())
    }

    /// Round-robins across worker loops; returns the base loop when there
    /// are none. Only valid to call from the base loop's thread.
    pub fn get_next_loop(&self) -> EventLoopHandle {
        debug_assert!(self.base_loop.is_in_loop_thread());

        if self.loops.is_empty() {
            return self.base_loop.clone();
        }

        let idx = self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % self.loops.len();
        self.loops[idx].clone()
    }

    pub fn get_all_loops(&self) -> Vec<EventLoopHandle> {
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }
}
