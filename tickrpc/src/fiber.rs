//! Default cooperative backend: fibers emulated with parked OS threads.
//!
//! Each activation runs on its own worker thread, but the engine thread and
//! the worker never run at the same time: control is handed back and forth
//! through a mutex+condvar baton. `resume` parks the caller until the fiber
//! yields or completes; `yield_now` parks the fiber until the next resume.
//! That strict alternation is exactly the engine's single-runnable-task
//! guarantee, and it is what justifies the one unsafe Send wrapper below.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Condvar, Mutex};

use slab::Slab;

use crate::task::{Coroutine, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatonState {
    /// The engine side holds the baton; the fiber is parked (or unstarted).
    Engine,
    /// The fiber holds the baton; the resumer is parked.
    Fiber,
    /// The fiber's entry returned.
    Done,
}

struct Baton {
    state: Mutex<BatonState>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self { state: Mutex::new(BatonState::Engine), cv: Condvar::new() }
    }

    /// Fiber side: park until the baton is handed over. False once done.
    fn wait_for_fiber(&self) -> bool {
        let mut st = self.state.lock().expect("baton poisoned");
        while *st == BatonState::Engine {
            st = self.cv.wait(st).expect("baton poisoned");
        }
        *st == BatonState::Fiber
    }

    /// Fiber side: hand the baton back and park until resumed.
    fn hand_back_and_wait(&self) {
        let mut st = self.state.lock().expect("baton poisoned");
        *st = BatonState::Engine;
        self.cv.notify_all();
        while *st == BatonState::Engine {
            st = self.cv.wait(st).expect("baton poisoned");
        }
    }

    /// Engine side: hand the baton over and park until it comes back.
    /// Returns true when the fiber completed.
    fn hand_over_and_wait(&self) -> bool {
        let mut st = self.state.lock().expect("baton poisoned");
        if *st == BatonState::Done {
            return true;
        }
        *st = BatonState::Fiber;
        self.cv.notify_all();
        while *st == BatonState::Fiber {
            st = self.cv.wait(st).expect("baton poisoned");
        }
        *st == BatonState::Done
    }

    /// Fiber side: mark completion and wake the resumer.
    fn finish(&self) {
        let mut st = self.state.lock().expect("baton poisoned");
        *st = BatonState::Done;
        self.cv.notify_all();
    }
}

// The fiber entry (and everything it captures, including Rc-based engine
// state) crosses onto the worker thread inside this wrapper.
//
// Safety: the worker only executes between `hand_over_and_wait` and the
// matching hand-back, while the engine thread is parked on the baton; every
// handoff is a mutex acquire/release pair, so accesses from the two threads
// are both mutually exclusive and ordered by happens-before.
struct AssertSend<T>(T);
unsafe impl<T> Send for AssertSend<T> {}

/// Handle to one fiber.
pub struct FiberHandle {
    baton: Arc<Baton>,
    key: Cell<usize>,
    backend: Weak<BackendInner>,
    self_weak: Weak<FiberHandle>,
}

impl TaskHandle for FiberHandle {
    fn yield_now(&self) {
        self.baton.hand_back_and_wait();
    }

    fn resume(&self) {
        let inner = self.backend.upgrade();
        let prev = match (&inner, self.self_weak.upgrade()) {
            (Some(inner), Some(me)) => inner.current.replace(Some(me)),
            _ => None,
        };

        let done = self.baton.hand_over_and_wait();

        if let Some(inner) = inner {
            *inner.current.borrow_mut() = prev;
            if done {
                let mut fibers = inner.fibers.borrow_mut();
                if fibers.contains(self.key.get()) {
                    fibers.remove(self.key.get());
                }
            }
        }
    }
}

struct BackendInner {
    fibers: RefCell<Slab<Rc<FiberHandle>>>,
    current: RefCell<Option<Rc<FiberHandle>>>,
    max: Cell<usize>,
}

/// Thread-backed [`Coroutine`] implementation.
pub struct FiberBackend {
    inner: Rc<BackendInner>,
}

impl FiberBackend {
    pub fn new(max_fibers: usize) -> Self {
        Self {
            inner: Rc::new(BackendInner {
                fibers: RefCell::new(Slab::new()),
                current: RefCell::new(None),
                max: Cell::new(max_fibers),
            }),
        }
    }
}

impl Coroutine for FiberBackend {
    fn spawn(&self, entry: Box<dyn FnOnce()>) -> bool {
        if self.inner.fibers.borrow().len() >= self.inner.max.get() {
            return false;
        }

        let baton = Arc::new(Baton::new());
        let handle = Rc::new_cyclic(|weak| FiberHandle {
            baton: Arc::clone(&baton),
            key: Cell::new(usize::MAX),
            backend: Rc::downgrade(&self.inner),
            self_weak: weak.clone(),
        });
        let key = self.inner.fibers.borrow_mut().insert(Rc::clone(&handle));
        handle.key.set(key);

        let payload = AssertSend((entry, Arc::clone(&baton)));
        let spawned = std::thread::Builder::new()
            .name("tickrpc-fiber".into())
            .spawn(move || {
                let payload = payload;
                let AssertSend((entry, baton)) = payload;
                if baton.wait_for_fiber() {
                    entry();
                }
                baton.finish();
            })
            .is_ok();

        if !spawned {
            self.inner.fibers.borrow_mut().remove(key);
            return false;
        }

        // Run the first slice to completion or first yield.
        handle.resume();
        true
    }

    fn current(&self) -> Option<Rc<dyn TaskHandle>> {
        self.inner.current.borrow().clone().map(|h| h as Rc<dyn TaskHandle>)
    }

    fn running_count(&self) -> usize {
        self.inner.fibers.borrow().len()
    }

    fn max_count(&self) -> usize {
        self.inner.max.get()
    }

    fn set_max_count(&self, max: usize) {
        self.inner.max.set(max);
    }
}
