//! The server loop: three-phase time-sliced `proc` with adaptive ingress
//! control.
//!
//! Phase 0 retires due timers (pending calls, then timed events unless
//! stopping). Phase 1 runs user and module work inside the remaining
//! budget, floored at `min_on_proc_ms` so supervisory logic never starves.
//! Phase 2 drains the scheduler and the default transport under the
//! adaptive frame budget, then `adjust` applies fast-shrink / slow-grow to
//! that budget: one overloaded tick backs off by `dec_delta`, recovery
//! climbs by `inc_delta` only when the tick ran comfortably inside budget.

use std::cell::Cell;
use std::rc::Rc;

use tracing::{info, warn};

use crate::clock::{Clock, MonotonicTime, TimeSource};
use crate::config::{EngineOptions, FlowControl, FrameLimits};
use crate::context::CurrentContext;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::fingerprint::CrashGuard;
use crate::module::{EngineModule, ModulePriority, ModuleRegistry};
use crate::pending::PendingTable;
use crate::routing::ServiceMesh;
use crate::scheduler::Scheduler;
use crate::seq::SeqGenerator;
use crate::stats::Statistics;
use crate::timed::{TimedEvents, TimedTask};
use crate::transport::{Transport, MAX_TRANSPORTS};

/// Scheduler tag reserved for timed-event records; one past the last
/// transport index so the two namespaces never collide.
pub const TIMED_EVENT_TAG: u64 = MAX_TRANSPORTS as u64;

/// User hooks co-scheduled with the loop.
pub trait LoopHooks {
    fn on_init(&mut self) -> bool {
        true
    }
    fn on_tick(&mut self, _now_ms: u64, _tick_count: u64) {}
    /// Phase-1 work slice; returns how much work was done.
    fn on_proc(&mut self, _now_ms: u64, _remain_ms: u64, _stopping: bool) -> usize {
        0
    }
    fn on_finish(&mut self) {}
}

/// One engine instance, owned by one thread.
pub struct ServerLoop {
    clock: Rc<Clock>,
    time: Rc<dyn TimeSource>,
    stats: Rc<Statistics>,
    dispatcher: Dispatcher,
    timed: Rc<TimedEvents>,
    modules: ModuleRegistry,
    scheduler: Option<Rc<dyn Scheduler>>,
    service_mesh: Option<Rc<dyn ServiceMesh>>,
    hooks: Option<Box<dyn LoopHooks>>,
    frame: FrameLimits,
    flow: FlowControl,
    max_tick_ms: u32,
    default_transport: u32,
    stop: bool,
    last_stop_log_ms: Cell<u64>,
}

impl ServerLoop {
    /// Builds the engine from validated options.
    pub fn new(options: EngineOptions) -> Result<Self> {
        options.validate()?;

        let clock = Rc::new(Clock::new());
        let time: Rc<dyn TimeSource> =
            options.time_source.clone().unwrap_or_else(|| Rc::new(MonotonicTime::new()));
        let seq = Rc::new(SeqGenerator::from_clock(&clock));
        let stats = Rc::new(Statistics::new());
        let current = CurrentContext::new();

        let coroutine = options.coroutine.clone();
        if let Some(backend) = &coroutine {
            backend.set_max_count(options.max_task_num as usize);
        }

        let pending = PendingTable::new(
            Rc::clone(&clock),
            Rc::clone(&seq),
            Rc::clone(&stats),
            Rc::clone(&current),
            coroutine.clone(),
        );

        let guard = match &options.crash_guard_path {
            Some(path) => Some(CrashGuard::open(path).map_err(Error::Fingerprint)?),
            None => None,
        };

        let dispatcher = Dispatcher::new(
            Rc::clone(&clock),
            Rc::clone(&seq),
            Rc::clone(&stats),
            Rc::clone(&current),
            pending,
            coroutine.clone(),
            guard,
        );

        let timed = TimedEvents::new(Rc::clone(&clock), seq, Rc::clone(&current), coroutine);

        info!(
            task_mode = options.coroutine.is_some(),
            max_proc_ms = options.frame.max_proc_ms,
            "engine initialized"
        );

        Ok(Self {
            clock,
            time,
            stats,
            dispatcher,
            timed,
            modules: ModuleRegistry::new(),
            scheduler: None,
            service_mesh: None,
            hooks: None,
            frame: options.frame,
            flow: options.flow_ctrl,
            max_tick_ms: options.max_tick_ms,
            default_transport: 0,
            stop: false,
            last_stop_log_ms: Cell::new(0),
        })
    }

    /// Runs user and module init hooks, High priority first.
    pub fn init(&mut self) -> bool {
        if let Some(hooks) = &mut self.hooks {
            if !hooks.on_init() {
                return false;
            }
        }
        self.modules.init()
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn LoopHooks>) {
        self.hooks = Some(hooks);
    }

    /// Swaps in a service-mesh collaborator, returning the old one.
    pub fn set_service_mesh(
        &mut self,
        mesh: Rc<dyn ServiceMesh>,
    ) -> Option<Rc<dyn ServiceMesh>> {
        self.service_mesh.replace(mesh)
    }

    /// Attaches the request scheduler and wires its dequeue processor to
    /// the dispatcher and the timed-event adapter.
    pub fn set_scheduler(&mut self, scheduler: Rc<dyn Scheduler>) -> Result<()> {
        if self.scheduler.is_some() {
            return Err(Error::SchedulerAlreadySet);
        }

        // Weak captures: the scheduler is owned by the dispatcher and the
        // timed adapter, so the processor must not own them back.
        let dispatcher = self.dispatcher.downgrade();
        let timed = Rc::downgrade(&self.timed);
        scheduler.set_proc(Box::new(move |_gid, data, tag| {
            if tag == TIMED_EVENT_TAG {
                timed.upgrade().map_or(false, |timed| timed.deal_event(data))
            } else {
                dispatcher
                    .upgrade()
                    .map_or(false, |dispatcher| dispatcher.deal_req_pkg(data, tag as u32))
            }
        }));

        self.dispatcher.set_scheduler(Rc::clone(&scheduler));
        self.timed.set_scheduler(Rc::clone(&scheduler), TIMED_EVENT_TAG);
        self.scheduler = Some(scheduler);
        Ok(())
    }

    /// Attaches a transport; the default one is drained in phase 2.
    pub fn add_transport(
        &mut self,
        index: u32,
        transport: Transport,
        is_default: bool,
    ) -> Result<()> {
        self.dispatcher.add_transport(index, transport)?;
        if is_default {
            self.default_transport = index;
        }
        Ok(())
    }

    pub fn add_module<T: EngineModule>(&mut self, module: T, priority: ModulePriority) -> bool {
        self.modules.add(module, priority)
    }

    pub fn remove_module<T: EngineModule>(&mut self) -> bool {
        self.modules.remove::<T>()
    }

    pub fn module<T: EngineModule>(&self) -> Option<&T> {
        self.modules.get::<T>()
    }

    pub fn module_mut<T: EngineModule>(&mut self) -> Option<&mut T> {
        self.modules.get_mut::<T>()
    }

    /// Arms a timed event; see [`TimedEvents::add_event`].
    pub fn add_timer(&self, gid: u64, task: TimedTask, deadline_ms: u64, interval_ms: u32) -> u64 {
        self.timed.add_event(gid, task, deadline_ms, interval_ms)
    }

    pub fn cancel_timer(&self, timer_id: u64) -> bool {
        self.timed.del_event(timer_id)
    }

    /// This engine's endpoint id, from the default transport.
    pub fn id(&self) -> u32 {
        self.dispatcher
            .transport(self.default_transport)
            .map_or(0, |t| t.channel.my_id())
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Rc<Statistics> {
        &self.stats
    }

    pub fn clock(&self) -> &Rc<Clock> {
        &self.clock
    }

    /// Current adaptive frame budget (for observability).
    pub fn flow_ctrl(&self) -> FlowControl {
        self.flow
    }

    pub fn is_stopping(&self) -> bool {
        self.stop
    }

    /// Advances the logical clock and runs tick hooks.
    pub fn tick(&mut self, now_ms: u64, tick_count: u64) {
        self.clock.update(now_ms * 1000);

        let begin = self.time.now_ms();
        if let Some(hooks) = &mut self.hooks {
            hooks.on_tick(now_ms, tick_count);
        }
        self.modules.tick(now_ms, tick_count);
        let elapsed = self.time.now_ms().saturating_sub(begin);

        if elapsed > self.max_tick_ms as u64 {
            warn!(elapsed, max_tick_ms = self.max_tick_ms, "tick over budget");
            self.stats.with_counters(|c| c.tick_timeout += 1);
        }
        self.stats.with_counters(|c| c.tick_deal_time = c.tick_deal_time.max(elapsed as u32));
    }

    /// One three-phase work slice. Returns the total work done.
    pub fn proc(&mut self, now_ms: u64) -> usize {
        self.stats.with_counters(|c| c.on_proc_num += 1);
        let begin = self.time.now_ms();

        // Phase 0: deadline-driven work.
        let ctx_count = self.dispatcher.pending().drain_timers(now_ms);
        let timed_count = if self.stop { 0 } else { self.timed.drain_timers(now_ms) };

        let end0 = self.time.now_ms();
        let phase0 = end0.saturating_sub(begin);
        if phase0 > self.frame.max_ctx_proc_ms as u64 {
            warn!(
                phase0,
                max_ctx_proc_ms = self.frame.max_ctx_proc_ms,
                ctx_count,
                timed_count,
                "phase 0 over budget"
            );
            self.stats.with_counters(|c| c.proc_timeout_0 += 1);
        }
        self.stats.with_counters(|c| c.proc_deal_time_0 = c.proc_deal_time_0.max(phase0 as u32));

        // Phase 1: user and module work, floored at min_on_proc_ms.
        let remain_ms = if end0 + self.frame.min_on_proc_ms as u64
            > begin + self.frame.max_proc_ms as u64
        {
            self.frame.min_on_proc_ms as u64
        } else {
            begin + self.frame.max_proc_ms as u64 - end0
        };

        let mut proc_count = 0usize;
        if let Some(hooks) = &mut self.hooks {
            proc_count += hooks.on_proc(now_ms, remain_ms, self.stop);
        }
        proc_count += self.modules.proc(now_ms, remain_ms, self.stop);
        if let Some(mesh) = &self.service_mesh {
            proc_count += mesh.process() as usize;
        }

        let end1 = self.time.now_ms();
        let phase1 = end1.saturating_sub(end0);
        self.stats.with_counters(|c| c.proc_deal_time_1 = c.proc_deal_time_1.max(phase1 as u32));
        if phase1 > remain_ms {
            warn!(phase1, remain_ms, proc_count, "phase 1 over budget");
            self.stats.with_counters(|c| c.proc_timeout_1 += 1);
        }

        // Phase 2: ingress under the adaptive budget. Scheduler first, then
        // the default transport gets what is left (floored at min_num).
        let mut pkg_count = 0u32;
        if let Some(scheduler) = &self.scheduler {
            pkg_count += scheduler.loop_once(self.flow.max_deal_pkg_num);
        }

        if self.scheduler.is_some() || !self.stop {
            let one_loop = if self.flow.max_deal_pkg_num > pkg_count + self.flow.min_num {
                self.flow.max_deal_pkg_num - pkg_count
            } else {
                self.flow.min_num
            };
            pkg_count += self.dispatcher.pump(self.default_transport, one_loop);
        }

        let end2 = self.time.now_ms();
        let phase2 = end2.saturating_sub(end1);
        self.stats.with_counters(|c| c.proc_deal_time_2 = c.proc_deal_time_2.max(phase2 as u32));
        if phase2 > remain_ms {
            warn!(phase2, remain_ms, pkg_count, "phase 2 over budget");
            self.stats.with_counters(|c| c.proc_timeout_2 += 1);
        }

        self.adjust(remain_ms, phase2);

        let total = self.time.now_ms().saturating_sub(begin);
        if total > self.frame.max_proc_ms as u64 {
            warn!(
                total,
                max_proc_ms = self.frame.max_proc_ms,
                ctx_count,
                timed_count,
                deal = proc_count + pkg_count as usize,
                "proc over budget"
            );
            self.stats.with_counters(|c| c.proc_total_timeout += 1);
        }

        ctx_count as usize + timed_count as usize + proc_count + pkg_count as usize
    }

    /// Fast-shrink, slow-grow admission control over the frame budget.
    fn adjust(&mut self, remain_ms: u64, used_ms: u64) {
        let flow = &mut self.flow;
        if used_ms > remain_ms + flow.judge_range_ms as u64 {
            if flow.max_deal_pkg_num > flow.min_num + flow.dec_delta {
                flow.max_deal_pkg_num -= flow.dec_delta;
            } else if flow.max_deal_pkg_num > flow.min_num {
                flow.max_deal_pkg_num = flow.min_num;
            }
        } else if used_ms + 2 * (flow.judge_range_ms as u64) < remain_ms {
            if flow.max_deal_pkg_num + flow.inc_delta < flow.max_num {
                flow.max_deal_pkg_num += flow.inc_delta;
            } else if flow.max_deal_pkg_num < flow.max_num {
                flow.max_deal_pkg_num = flow.max_num;
            }
        }
    }

    /// Stops admitting new work; pending calls keep draining.
    pub fn notify_quit(&mut self) {
        if self.stop {
            return;
        }
        self.stop = true;
        if let Some(scheduler) = &self.scheduler {
            scheduler.set_stop(true);
        }
        info!(pending = self.dispatcher.pending().len(), "quit requested");
    }

    /// True once nothing remains in flight. Logs the holdup at most every
    /// 200 ms until then.
    pub fn stop_ready(&self) -> bool {
        if !self.stop {
            return false;
        }
        let pending = self.dispatcher.pending().len();
        if pending == 0 {
            return true;
        }

        let now = self.time.now_ms();
        if self.last_stop_log_ms.get() + 200 < now {
            warn!(pending, "waiting for pending calls before stop");
            self.last_stop_log_ms.set(now);
        }
        false
    }

    /// Runs user and module finish hooks.
    pub fn finish(&mut self) -> bool {
        if let Some(hooks) = &mut self.hooks {
            hooks.on_finish();
        }
        self.modules.finish();
        info!(stopping = self.stop, "engine finished");
        true
    }
}
