//! Pending-call table: correlates outgoing RPC sequence IDs with suspended
//! callers and retires stale calls through the timer wheel.
//!
//! Every live row owns exactly one armed timer. The timer fires
//! `awake(seq_id, Timeout)` and runs the continuation; a matching reply
//! cancels the timer and consumes the row. After `awake` returns a context,
//! no timer can fire for that seq_id; after the timer fired, later replies
//! find nothing.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{error, trace, warn};

use crate::clock::Clock;
use crate::context::{ClientCompletionFn, ClientContext, CurrentContext, RecycleFn};
use crate::error::RetCode;
use crate::seq::SeqGenerator;
use crate::stats::Statistics;
use crate::task::Coroutine;
use crate::timer::TimerWheel;

/// How an issued call wants to be continued.
pub struct AsyncTask {
    /// User continuation, run when the reply or timeout lands.
    pub callback: Option<ClientCompletionFn>,
    /// Cleanup hook, run after the continuation.
    pub recycle: Option<RecycleFn>,
    /// Blocking alternative: when set in cooperative-task mode, this is
    /// called instead of yielding the current task.
    pub blocking: Option<Box<dyn FnOnce()>>,
}

impl AsyncTask {
    pub fn empty() -> Self {
        Self { callback: None, recycle: None, blocking: None }
    }

    pub fn with_callback(callback: ClientCompletionFn) -> Self {
        Self { callback: Some(callback), recycle: None, blocking: None }
    }
}

/// seq_id -> suspended caller, plus the timers that unstick them.
pub struct PendingTable {
    wheel: TimerWheel,
    table: RefCell<HashMap<u64, Rc<ClientContext>>>,
    clock: Rc<Clock>,
    seq: Rc<SeqGenerator>,
    stats: Rc<Statistics>,
    current: Rc<CurrentContext>,
    coroutine: Option<Rc<dyn Coroutine>>,
}

impl PendingTable {
    pub fn new(
        clock: Rc<Clock>,
        seq: Rc<SeqGenerator>,
        stats: Rc<Statistics>,
        current: Rc<CurrentContext>,
        coroutine: Option<Rc<dyn Coroutine>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            wheel: TimerWheel::new(),
            table: RefCell::new(HashMap::new()),
            clock,
            seq,
            stats,
            current,
            coroutine,
        })
    }

    /// True when a cooperative-task backend is attached.
    pub fn use_tasks(&self) -> bool {
        self.coroutine.is_some()
    }

    /// Fires due timeout timers. Phase 0 of the loop.
    pub fn drain_timers(&self, now_ms: u64) -> u32 {
        self.wheel.drain(now_ms)
    }

    /// Outstanding calls.
    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    /// Suspends the caller behind `seq_id` until a reply or the timeout.
    ///
    /// Arms the timer, inserts the row, wires the continuation from `task`,
    /// then suspends according to the engine mode: yield the current task,
    /// run the blocking alternative, or mark the parent request continued
    /// and return immediately.
    pub fn pending(
        self: &Rc<Self>,
        seq_id: u64,
        timeout_ms: u32,
        ctx: Rc<ClientContext>,
        task: AsyncTask,
    ) -> i32 {
        let seq_id = if seq_id != 0 { seq_id } else { self.seq.next() };
        let deadline = self.clock.now_ms() + timeout_ms as u64;

        let weak = Rc::downgrade(self);
        let timer_id = self.wheel.add(
            Rc::new(move |_, _| {
                if let Some(table) = weak.upgrade() {
                    if let Some(expired) = table.awake(seq_id, RetCode::Timeout.value()) {
                        expired.run();
                    }
                }
            }),
            deadline,
            0,
        );
        if timer_id == 0 {
            error!(seq_id, "arming pending-call timer failed");
            return RetCode::SystemError.value();
        }

        ctx.timer_id.set(timer_id);
        ctx.seq_id.set(seq_id);

        match self.table.borrow_mut().entry(seq_id) {
            Entry::Occupied(_) => {
                self.wheel.cancel(timer_id);
                error!(seq_id, "pending-call row already occupied");
                return RetCode::SystemError.value();
            }
            Entry::Vacant(slot) => {
                slot.insert(Rc::clone(&ctx));
            }
        }

        trace!(seq_id, timer_id, deadline, "pending");
        self.stats.save_max_pending_num(self.len() as u32);

        let parent = ctx.parent.clone();
        let running_task = self.coroutine.as_ref().and_then(|c| c.current());

        if self.use_tasks() && task.blocking.is_some() {
            // Custom blocking primitive supplied by the caller.
            ctx.set_callback(task.callback, task.recycle);
            self.current.set(None);
            if let Some(blocking) = task.blocking {
                blocking();
            }
            self.current.set(parent);
        } else if let Some(handle) = running_task {
            // Cooperative-task mode: park this task; the continuation's
            // recycle hook resumes it.
            let resumer = Rc::clone(&handle);
            ctx.set_callback(task.callback, Some(Box::new(move || resumer.resume())));
            self.current.set(None);
            handle.yield_now();
            self.current.set(parent);
        } else {
            // Callback mode: mark the parent suspended and return to the
            // loop; the reply path runs the continuation inline.
            let current = Rc::clone(&self.current);
            let user_cb = task.callback;
            let parent_for_cb = parent.clone();
            ctx.set_callback(
                Some(Box::new(move |ret_code, body| {
                    if let Some(parent) = &parent_for_cb {
                        parent.to_be_continue.set(false);
                        current.set(Some(Rc::clone(parent)));
                    }
                    if let Some(cb) = user_cb {
                        cb(ret_code, body);
                    }
                    if let Some(parent) = &parent_for_cb {
                        if parent.is_finish() {
                            parent.run();
                        }
                    }
                })),
                task.recycle,
            );
            if let Some(parent) = &parent {
                parent.to_be_continue.set(true);
            }
            self.current.set(None);
        }

        RetCode::Success.value()
    }

    /// Consumes the row for `seq_id`, recording `ret_code` into its context.
    /// Cancels the paired timer unless the timeout itself is the reason.
    /// Returns the context so the caller can run its continuation.
    pub fn awake(&self, seq_id: u64, ret_code: i32) -> Option<Rc<ClientContext>> {
        let ctx = match self.table.borrow_mut().remove(&seq_id) {
            Some(ctx) => ctx,
            None => {
                warn!(seq_id, ret_code, "no pending call for seq_id");
                return None;
            }
        };

        if ret_code != RetCode::Timeout.value() {
            self.wheel.cancel(ctx.timer_id.get());
        } else {
            self.stats.inc_rpc_timeout();
        }

        trace!(seq_id, timer_id = ctx.timer_id.get(), ret_code, "awake");
        ctx.ret_code.set(ret_code);
        ctx.timer_id.set(0);
        Some(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameHead;
    use crate::context::ServerContext;
    use std::cell::Cell;

    fn table() -> Rc<PendingTable> {
        let clock = Rc::new(Clock::new());
        let seq = Rc::new(SeqGenerator::from_clock(&clock));
        PendingTable::new(
            clock,
            seq,
            Rc::new(Statistics::new()),
            CurrentContext::new(),
            None,
        )
    }

    #[test]
    fn reply_before_timeout_runs_continuation_once() {
        let table = table();
        let current = CurrentContext::new();
        let ctx = ClientContext::new(1, 0, &current);
        let runs = Rc::new(Cell::new(0u32));
        let r = runs.clone();

        let ret = table.pending(
            7,
            100,
            Rc::clone(&ctx),
            AsyncTask::with_callback(Box::new(move |_, _| r.set(r.get() + 1))),
        );
        assert_eq!(ret, 0);
        assert_eq!(table.len(), 1);

        let awoken = table.awake(7, 0).expect("row present");
        awoken.run();
        assert_eq!(runs.get(), 1);
        assert_eq!(table.len(), 0);

        // Late timer fires into nothing.
        assert_eq!(table.drain_timers(10_000), 0, "timer was cancelled");
        assert!(table.awake(7, 0).is_none(), "row consumed");
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn timeout_retires_the_row_exactly_once() {
        let table = table();
        let current = CurrentContext::new();
        let ctx = ClientContext::new(1, 0, &current);
        let seen: Rc<RefCell<Vec<i32>>> = Rc::default();
        let s = seen.clone();

        table.pending(
            9,
            50,
            ctx,
            AsyncTask::with_callback(Box::new(move |ret, body| {
                assert!(body.is_none());
                s.borrow_mut().push(ret);
            })),
        );

        assert_eq!(table.drain_timers(49), 0);
        assert_eq!(table.drain_timers(50), 1);
        assert_eq!(*seen.borrow(), vec![RetCode::Timeout.value()]);
        assert_eq!(table.len(), 0);

        // A reply arriving after the timeout finds nothing.
        assert!(table.awake(9, 0).is_none());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn callback_mode_marks_parent_continued() {
        let clock = Rc::new(Clock::new());
        let seq = Rc::new(SeqGenerator::from_clock(&clock));
        let current = CurrentContext::new();
        let table = PendingTable::new(
            clock,
            seq,
            Rc::new(Statistics::new()),
            Rc::clone(&current),
            None,
        );

        let parent = ServerContext::new(FrameHead { gid: 5, ..Default::default() }, 0);
        let finished = Rc::new(Cell::new(false));
        let f = finished.clone();
        parent.set_callback(Box::new(move |_| f.set(true)), None);
        current.set(Some(Rc::clone(&parent)));

        let ctx = ClientContext::new(1, 0, &current);
        table.pending(11, 100, ctx, AsyncTask::empty());

        assert!(parent.to_be_continue.get());
        assert!(current.is_idle(), "pending clears the current slot");
        assert!(!parent.is_finish());

        let awoken = table.awake(11, 0).unwrap();
        awoken.run();
        assert!(!parent.to_be_continue.get());
        assert!(finished.get(), "parent completion fired after continuation");
    }

    #[test]
    fn duplicate_seq_id_fails_and_cancels_timer() {
        let table = table();
        let current = CurrentContext::new();
        let a = ClientContext::new(1, 0, &current);
        let b = ClientContext::new(2, 0, &current);

        assert_eq!(table.pending(3, 100, a, AsyncTask::empty()), 0);
        assert_eq!(
            table.pending(3, 100, b, AsyncTask::empty()),
            RetCode::SystemError.value()
        );
        assert_eq!(table.len(), 1);
        // Only the surviving row's timer fires.
        assert_eq!(table.drain_timers(10_000), 1);
    }
}
