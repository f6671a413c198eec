//! Cooperative task contracts.
//!
//! The engine does not own a concurrency primitive; a backend implementing
//! [`Coroutine`] is injected through the engine options. The engine only
//! relies on the contract below:
//!
//! - `spawn` starts an activation and runs it cooperatively until it yields
//!   or completes, on the caller's schedule;
//! - at most one activation is runnable at a time on one engine;
//! - `yield_now` is legal only inside a running activation, `resume` only on
//!   a suspended one.

use std::cell::Cell;
use std::rc::Rc;

/// Handle to one cooperative activation.
pub trait TaskHandle {
    /// Suspends the running activation and returns control to the resumer.
    /// Legal only from inside the activation.
    fn yield_now(&self);

    /// Re-enters a suspended activation and runs it until it yields again or
    /// completes. Legal only from outside the activation.
    fn resume(&self);
}

/// Cooperative task backend.
pub trait Coroutine {
    /// Starts a new activation running `entry`. The entry must begin
    /// executing before `spawn` returns (it may suspend partway through).
    /// Returns `false` on exhaustion.
    fn spawn(&self, entry: Box<dyn FnOnce()>) -> bool;

    /// Handle of the activation currently executing, if any.
    fn current(&self) -> Option<Rc<dyn TaskHandle>>;

    /// Activations started and not yet completed.
    fn running_count(&self) -> usize;

    /// Bound on simultaneously live activations.
    fn max_count(&self) -> usize;

    /// Adjusts the bound.
    fn set_max_count(&self, max: usize);
}

/// Completion counter for fan-out calls: arm it with a count, mark work
/// `done` as replies land, and the callback fires when the count reaches
/// zero. Single-threaded, like everything on the engine.
pub struct WaitGroup {
    remaining: Cell<u32>,
    on_done: Cell<Option<Box<dyn FnOnce()>>>,
}

impl WaitGroup {
    pub fn new(count: u32, on_done: Option<Box<dyn FnOnce()>>) -> Rc<Self> {
        Rc::new(Self { remaining: Cell::new(count), on_done: Cell::new(on_done) })
    }

    /// Marks one unit of work complete; fires the callback at zero.
    pub fn done(&self) {
        let left = self.remaining.get();
        if left == 0 {
            return;
        }
        self.remaining.set(left - 1);
        if left == 1 {
            if let Some(cb) = self.on_done.take() {
                cb();
            }
        }
    }

    /// True when every unit completed.
    pub fn is_ready(&self) -> bool {
        self.remaining.get() == 0
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn wait_group_fires_once_at_zero() {
        let fired: Rc<RefCell<u32>> = Rc::default();
        let f = fired.clone();
        let wg = WaitGroup::new(2, Some(Box::new(move || *f.borrow_mut() += 1)));
        assert!(!wg.is_ready());
        wg.done();
        assert_eq!(*fired.borrow(), 0);
        wg.done();
        assert_eq!(*fired.borrow(), 1);
        assert!(wg.is_ready());
        wg.done();
        assert_eq!(*fired.borrow(), 1, "extra done calls are ignored");
    }
}
