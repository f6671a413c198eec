//! Timed-event adapter: periodic callbacks wrapped as request-like
//! activations.
//!
//! A fired timer does not run the user task directly. It registers an event
//! record, serializes a fixed-layout descriptor, and routes it through the
//! attached scheduler under a reserved tag (or deals with it immediately
//! when no scheduler is attached). At deal time the task runs inside a
//! fresh [`ServerContext`], in a cooperative task when the backend is
//! attached, so timed work may issue suspending RPCs exactly like a
//! request handler.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{error, info, trace, warn};

use crate::clock::Clock;
use crate::codec::FrameHead;
use crate::context::{CurrentContext, ServerContext};
use crate::scheduler::Scheduler;
use crate::seq::SeqGenerator;
use crate::task::Coroutine;
use crate::timer::TimerWheel;

/// A timed-event body; its return value becomes the context ret_code.
pub type TimedTask = Rc<dyn Fn() -> i32>;

/// Observer of completed timed events.
pub type FinishWatchFn = Box<dyn Fn(&ServerContext, u64)>;

/// Serialized descriptor crossing the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventInfo {
    event_id: u64,
    gid: u64,
    timer_id: u64,
    interval_ms: u32,
}

const EVENT_INFO_BYTES: usize = 28;

impl EventInfo {
    fn to_bytes(self) -> [u8; EVENT_INFO_BYTES] {
        let mut out = [0u8; EVENT_INFO_BYTES];
        out[0..8].copy_from_slice(&self.event_id.to_le_bytes());
        out[8..16].copy_from_slice(&self.gid.to_le_bytes());
        out[16..24].copy_from_slice(&self.timer_id.to_le_bytes());
        out[24..28].copy_from_slice(&self.interval_ms.to_le_bytes());
        out
    }

    fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != EVENT_INFO_BYTES {
            return None;
        }
        Some(Self {
            event_id: u64::from_le_bytes(data[0..8].try_into().ok()?),
            gid: u64::from_le_bytes(data[8..16].try_into().ok()?),
            timer_id: u64::from_le_bytes(data[16..24].try_into().ok()?),
            interval_ms: u32::from_le_bytes(data[24..28].try_into().ok()?),
        })
    }
}

struct EventRecord {
    task: TimedTask,
    gid: u64,
}

/// Wraps periodic callbacks as engine activations.
pub struct TimedEvents {
    wheel: TimerWheel,
    events: RefCell<HashMap<u64, EventRecord>>,
    clock: Rc<Clock>,
    seq: Rc<SeqGenerator>,
    current: Rc<CurrentContext>,
    coroutine: Option<Rc<dyn Coroutine>>,
    scheduler: RefCell<Option<(Rc<dyn Scheduler>, u64)>>,
    watch: RefCell<Option<FinishWatchFn>>,
}

impl TimedEvents {
    pub fn new(
        clock: Rc<Clock>,
        seq: Rc<SeqGenerator>,
        current: Rc<CurrentContext>,
        coroutine: Option<Rc<dyn Coroutine>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            wheel: TimerWheel::new(),
            events: RefCell::new(HashMap::new()),
            clock,
            seq,
            current,
            coroutine,
            scheduler: RefCell::new(None),
            watch: RefCell::new(None),
        })
    }

    /// Routes fired events through `scheduler` under `tag`.
    pub fn set_scheduler(&self, scheduler: Rc<dyn Scheduler>, tag: u64) {
        *self.scheduler.borrow_mut() = Some((scheduler, tag));
    }

    /// Installs a completion observer.
    pub fn set_finish_watch(&self, watch: FinishWatchFn) {
        *self.watch.borrow_mut() = Some(watch);
    }

    /// Arms a timed event at `deadline_ms`; `interval_ms > 0` re-arms it
    /// after each firing. Returns the timer id, 0 on failure.
    pub fn add_event(
        self: &Rc<Self>,
        gid: u64,
        task: TimedTask,
        deadline_ms: u64,
        interval_ms: u32,
    ) -> u64 {
        let weak = Rc::downgrade(self);
        self.wheel.add(
            Rc::new(move |timer_id, interval| {
                let Some(timed) = weak.upgrade() else { return };
                let event_id = timed.seq.next();
                timed
                    .events
                    .borrow_mut()
                    .insert(event_id, EventRecord { task: Rc::clone(&task), gid });
                let info = EventInfo { event_id, gid, timer_id, interval_ms: interval };
                trace!(gid, event_id, timer_id, "timed event fired");

                let scheduler = timed.scheduler.borrow().clone();
                match scheduler {
                    Some((scheduler, tag)) => {
                        if !scheduler.on_request(event_id, gid, &info.to_bytes(), tag) {
                            warn!(gid, event_id, "scheduler rejected timed event");
                            timed.events.borrow_mut().remove(&event_id);
                        }
                    }
                    None => {
                        timed.deal_event(&info.to_bytes());
                    }
                }
            }),
            deadline_ms,
            interval_ms,
        )
    }

    /// Cancels a timed event. One-shot events already handed to the
    /// scheduler still run; cancelled interval events parked in the
    /// scheduler are dropped at deal time.
    pub fn del_event(&self, timer_id: u64) -> bool {
        self.wheel.cancel(timer_id)
    }

    /// Fires due timers. Phase 0 of the loop (skipped while stopping).
    pub fn drain_timers(&self, now_ms: u64) -> u32 {
        self.wheel.drain(now_ms)
    }

    /// Armed timers.
    pub fn len(&self) -> usize {
        self.wheel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wheel.is_empty()
    }

    /// Runs one serialized event descriptor, from the scheduler or directly.
    pub fn deal_event(self: &Rc<Self>, data: &[u8]) -> bool {
        let Some(info) = EventInfo::from_bytes(data) else {
            error!(len = data.len(), "malformed timed-event descriptor");
            return false;
        };

        let record = match self.events.borrow_mut().remove(&info.event_id) {
            Some(record) => record,
            None => {
                warn!(gid = info.gid, event_id = info.event_id, "unknown timed event");
                return false;
            }
        };

        // An interval event whose timer vanished was cancelled while parked.
        if info.interval_ms > 0 && !self.wheel.exists(info.timer_id) {
            info!(
                gid = info.gid,
                event_id = info.event_id,
                timer_id = info.timer_id,
                "interval event cancelled while queued"
            );
            return false;
        }

        let head = FrameHead { gid: record.gid, ..FrameHead::default() };
        let ctx = ServerContext::new(head, u32::MAX);
        ctx.start_ms.set(self.clock.now_ms());

        let finisher = Rc::downgrade(self);
        let ctx_for_finish = Rc::clone(&ctx);
        let gid = record.gid;
        ctx.set_callback(
            Box::new(move |_ret| {
                if let Some(timed) = finisher.upgrade() {
                    timed.event_finish(&ctx_for_finish, gid);
                }
            }),
            None,
        );

        let run_ctx = Rc::clone(&ctx);
        let current = Rc::clone(&self.current);
        let task = record.task;
        let run = move || {
            current.set(Some(Rc::clone(&run_ctx)));
            run_ctx.ret_code.set(task());
            if run_ctx.is_finish() {
                run_ctx.run();
            }
        };

        match &self.coroutine {
            Some(coroutine) => {
                if !coroutine.spawn(Box::new(run)) {
                    error!(gid, event_id = info.event_id, "timed event task spawn failed");
                    return false;
                }
            }
            None => run(),
        }
        true
    }

    fn event_finish(&self, ctx: &ServerContext, gid: u64) {
        if let Some((scheduler, _)) = self.scheduler.borrow().as_ref() {
            scheduler.on_response(gid);
        }
        if let Some(watch) = self.watch.borrow().as_ref() {
            watch(ctx, gid);
        }
        ctx.end_ms.set(self.clock.now_ms());
        self.current.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn timed() -> Rc<TimedEvents> {
        let clock = Rc::new(Clock::new());
        let seq = Rc::new(SeqGenerator::from_clock(&clock));
        TimedEvents::new(clock, seq, CurrentContext::new(), None)
    }

    #[test]
    fn event_runs_at_deadline_without_scheduler() {
        let timed = timed();
        let runs = Rc::new(Cell::new(0u32));
        let r = runs.clone();
        let id = timed.add_event(1, Rc::new(move || {
            r.set(r.get() + 1);
            0
        }), 100, 0);
        assert_ne!(id, 0);

        assert_eq!(timed.drain_timers(99), 0);
        assert_eq!(timed.drain_timers(100), 1);
        assert_eq!(runs.get(), 1);
        assert!(timed.is_empty());
    }

    #[test]
    fn interval_event_repeats_until_cancelled() {
        let timed = timed();
        let runs = Rc::new(Cell::new(0u32));
        let r = runs.clone();
        let id = timed.add_event(1, Rc::new(move || {
            r.set(r.get() + 1);
            0
        }), 10, 10);

        timed.drain_timers(10);
        timed.drain_timers(20);
        assert_eq!(runs.get(), 2);
        assert!(timed.del_event(id));
        timed.drain_timers(100);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn cancelled_interval_event_is_dropped_at_deal_time() {
        let clock = Rc::new(Clock::new());
        let seq = Rc::new(SeqGenerator::from_clock(&clock));
        let timed = TimedEvents::new(clock, seq, CurrentContext::new(), None);
        let sched = Rc::new(crate::scheduler::FifoScheduler::new(4096).unwrap());
        timed.set_scheduler(sched.clone() as Rc<dyn Scheduler>, 99);

        let t = Rc::clone(&timed);
        sched.set_proc(Box::new(move |_, data, tag| {
            assert_eq!(tag, 99);
            t.deal_event(data)
        }));

        let runs = Rc::new(Cell::new(0u32));
        let r = runs.clone();
        let id = timed.add_event(1, Rc::new(move || {
            r.set(r.get() + 1);
            0
        }), 10, 10);

        // Fire into the scheduler, then cancel before the drain.
        timed.drain_timers(10);
        assert!(timed.del_event(id));
        sched.loop_once(0);
        assert_eq!(runs.get(), 0, "cancelled interval event must not run");
    }

    #[test]
    fn scheduler_routed_event_runs_on_drain() {
        let timed = timed();
        let sched = Rc::new(crate::scheduler::FifoScheduler::new(4096).unwrap());
        timed.set_scheduler(sched.clone() as Rc<dyn Scheduler>, 42);
        let t = Rc::clone(&timed);
        sched.set_proc(Box::new(move |_, data, _| t.deal_event(data)));

        let runs = Rc::new(Cell::new(0u32));
        let r = runs.clone();
        timed.add_event(3, Rc::new(move || {
            r.set(r.get() + 1);
            0
        }), 5, 0);

        timed.drain_timers(5);
        assert_eq!(runs.get(), 0, "parked in the scheduler");
        assert_eq!(sched.cache_num(3), 1);
        sched.loop_once(0);
        assert_eq!(runs.get(), 1);
        assert_eq!(sched.cache_num(3), 0);
    }
}
