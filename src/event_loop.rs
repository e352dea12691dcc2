//! Event loop consumed by connections.
//!
//! Three capabilities, nothing more: readable hooks on raw descriptors,
//! deferred tasks postable from any thread, and single-shot timers. Backed
//! by a mio poll; cross-thread posting goes through a waker-protected
//! vector that the loop swaps out after each wakeup.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

const WAKER_TOKEN: Token = Token(1 << 30);

type DeferredTask = Box<dyn FnOnce() + Send>;

/// What a hook wants done with its registration after running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookAction {
    Keep,
    Remove,
}

struct Source {
    fd: RawFd,
    hook: Box<dyn FnMut() -> HookAction + Send>,
}

struct LoopShared {
    waker: Waker,
    tasks: Mutex<Vec<DeferredTask>>,
    stopped: AtomicBool,
}

impl LoopShared {
    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            kvlog::error!("Failed to wake event loop", ?err);
        }
    }
}

/// Cloneable handle for posting deferred tasks and stopping the loop from
/// any thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Queues a closure to run on the loop thread after the current
    /// dispatch completes.
    pub fn deferred_invoke(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.tasks.lock().unwrap().push(Box::new(task));
        self.shared.wake();
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.wake();
    }
}

struct TimerState {
    deadline: Mutex<Option<Instant>>,
    period: Duration,
    removed: AtomicBool,
    shared: Arc<LoopShared>,
}

/// Arms and disarms a single-shot timer registered with the loop. Usable
/// from any thread; arming wakes the loop so the poll timeout shrinks.
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    /// (Re)arms the timer to fire one period from now. No-op once the
    /// timer has been removed.
    pub fn start(&self) {
        if self.state.removed.load(Ordering::Acquire) {
            return;
        }
        *self.state.deadline.lock().unwrap() = Some(Instant::now() + self.state.period);
        self.state.shared.wake();
    }

    pub fn stop(&self) {
        *self.state.deadline.lock().unwrap() = None;
    }

    /// Disarms the timer and drops its registration at the loop's next
    /// iteration. Terminal: the timer cannot be armed again. The owner
    /// must call this when done with the timer, or its registration
    /// outlives it in the loop.
    pub fn remove(&self) {
        self.state.removed.store(true, Ordering::Release);
        *self.state.deadline.lock().unwrap() = None;
        self.state.shared.wake();
    }

    pub fn is_armed(&self) -> bool {
        self.state.deadline.lock().unwrap().is_some()
    }
}

struct TimerEntry {
    state: Arc<TimerState>,
    hook: Box<dyn FnMut() -> HookAction + Send>,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Arc<LoopShared>,
    sources: Slab<Source>,
    timers: Slab<TimerEntry>,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(128),
            shared: Arc::new(LoopShared { waker, tasks: Mutex::new(Vec::new()), stopped: AtomicBool::new(false) }),
            sources: Slab::new(),
            timers: Slab::new(),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: self.shared.clone() }
    }

    /// Registers a readable hook for a descriptor. The hook runs on the
    /// loop thread whenever bytes may be available and can remove its own
    /// registration by returning [`HookAction::Remove`].
    pub fn register_readable(&mut self, fd: RawFd, hook: Box<dyn FnMut() -> HookAction + Send>) -> io::Result<()> {
        let entry = self.sources.vacant_entry();
        self.poll.registry().register(&mut SourceFd(&fd), Token(entry.key()), Interest::READABLE)?;
        entry.insert(Source { fd, hook });
        Ok(())
    }

    /// Registers a single-shot timer. It fires once per [`TimerHandle::start`];
    /// the hook can drop the registration by returning [`HookAction::Remove`],
    /// and the owner drops it with [`TimerHandle::remove`].
    pub fn add_single_shot_timer(&mut self, period: Duration, hook: Box<dyn FnMut() -> HookAction + Send>) -> TimerHandle {
        let state = Arc::new(TimerState {
            deadline: Mutex::new(None),
            period,
            removed: AtomicBool::new(false),
            shared: self.shared.clone(),
        });
        self.timers.insert(TimerEntry { state: state.clone(), hook });
        TimerHandle { state }
    }

    #[cfg(test)]
    pub(crate) fn timer_count(&self) -> usize {
        self.timers.len()
    }

    fn next_timeout(&self, max_wait: Option<Duration>) -> Option<Duration> {
        let now = Instant::now();
        let mut timeout = max_wait;
        for (_, timer) in &self.timers {
            let Some(deadline) = *timer.state.deadline.lock().unwrap() else {
                continue;
            };
            let until = deadline.saturating_duration_since(now);
            timeout = Some(match timeout {
                Some(current) => current.min(until),
                None => until,
            });
        }
        timeout
    }

    /// Runs one poll iteration: readable hooks, deferred tasks, then due
    /// timers. Blocks at most until the nearest armed timer deadline or
    /// `max_wait`, whichever is sooner.
    pub fn poll_once(&mut self, max_wait: Option<Duration>) {
        let timeout = self.next_timeout(max_wait);
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                kvlog::error!("Event loop poll failed", ?err);
            }
            return;
        }

        let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in tokens {
            if token == WAKER_TOKEN {
                continue;
            }
            let Some(source) = self.sources.get_mut(token.0) else {
                continue;
            };
            if (source.hook)() == HookAction::Remove {
                let source = self.sources.remove(token.0);
                if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&source.fd)) {
                    kvlog::error!("Failed to deregister readable source", ?err, fd = source.fd);
                }
            }
        }

        let mut tasks = Vec::new();
        std::mem::swap(&mut tasks, &mut self.shared.tasks.lock().unwrap());
        for task in tasks {
            task();
        }

        self.timers.retain(|_, timer| !timer.state.removed.load(Ordering::Acquire));

        let now = Instant::now();
        let due: Vec<usize> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.state.deadline.lock().unwrap().is_some_and(|at| at <= now))
            .map(|(key, _)| key)
            .collect();
        for key in due {
            let timer = &mut self.timers[key];
            *timer.state.deadline.lock().unwrap() = None;
            if (timer.hook)() == HookAction::Remove {
                self.timers.remove(key);
            }
        }
    }

    /// Runs until [`LoopHandle::stop`] is called.
    pub fn run(&mut self) {
        while !self.shared.stopped.load(Ordering::Acquire) {
            self.poll_once(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn deferred_task_runs_on_poll() {
        let mut event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.handle().deferred_invoke(move || flag.store(true, Ordering::Release));
        event_loop.poll_once(Some(Duration::from_millis(100)));
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn deferred_task_wakes_blocking_poll() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.deferred_invoke(move || flag.store(true, Ordering::Release));
        });
        // No timeout: only the waker can end this poll.
        event_loop.poll_once(None);
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn readable_hook_fires_and_can_remove_itself() {
        let mut event_loop = EventLoop::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();

        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        let reader_fd = reader.as_raw_fd();
        event_loop
            .register_readable(
                reader_fd,
                Box::new(move || {
                    let mut sink = [0u8; 64];
                    let _ = (&reader).read(&mut sink);
                    counter.fetch_add(1, Ordering::AcqRel);
                    HookAction::Remove
                }),
            )
            .unwrap();

        writer.write_all(b"x").unwrap();
        event_loop.poll_once(Some(Duration::from_millis(200)));
        assert_eq!(fires.load(Ordering::Acquire), 1);

        // Registration was removed, so further writes go unnoticed.
        writer.write_all(b"y").unwrap();
        event_loop.poll_once(Some(Duration::from_millis(50)));
        assert_eq!(fires.load(Ordering::Acquire), 1);
    }

    #[test]
    fn timer_fires_once_per_arm() {
        let mut event_loop = EventLoop::new().unwrap();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        let timer = event_loop.add_single_shot_timer(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
                HookAction::Keep
            }),
        );

        event_loop.poll_once(Some(Duration::from_millis(30)));
        assert_eq!(fires.load(Ordering::Acquire), 0, "unarmed timer must not fire");

        timer.start();
        assert!(timer.is_armed());
        while fires.load(Ordering::Acquire) == 0 {
            event_loop.poll_once(Some(Duration::from_millis(50)));
        }
        assert!(!timer.is_armed());

        event_loop.poll_once(Some(Duration::from_millis(30)));
        assert_eq!(fires.load(Ordering::Acquire), 1, "single-shot timer fired twice");

        timer.start();
        while fires.load(Ordering::Acquire) == 1 {
            event_loop.poll_once(Some(Duration::from_millis(50)));
        }
    }

    #[test]
    fn stopped_timer_does_not_fire() {
        let mut event_loop = EventLoop::new().unwrap();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        let timer = event_loop.add_single_shot_timer(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
                HookAction::Keep
            }),
        );
        timer.start();
        timer.stop();
        std::thread::sleep(Duration::from_millis(20));
        event_loop.poll_once(Some(Duration::from_millis(10)));
        assert_eq!(fires.load(Ordering::Acquire), 0);
    }

    #[test]
    fn removed_timer_is_deregistered_and_cannot_rearm() {
        let mut event_loop = EventLoop::new().unwrap();
        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        let timer = event_loop.add_single_shot_timer(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
                HookAction::Keep
            }),
        );
        assert_eq!(event_loop.timer_count(), 1);

        timer.start();
        timer.remove();
        assert!(!timer.is_armed());
        std::thread::sleep(Duration::from_millis(20));
        event_loop.poll_once(Some(Duration::from_millis(10)));
        assert_eq!(fires.load(Ordering::Acquire), 0);
        assert_eq!(event_loop.timer_count(), 0, "removed timer must leave the registry");

        // Removal is terminal.
        timer.start();
        assert!(!timer.is_armed());
        event_loop.poll_once(Some(Duration::from_millis(30)));
        assert_eq!(fires.load(Ordering::Acquire), 0);
    }

    #[test]
    fn run_exits_on_stop() {
        let mut event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle();
        let runner = std::thread::spawn(move || event_loop.run());
        handle.stop();
        runner.join().unwrap();
    }
}
