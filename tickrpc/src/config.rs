//! Engine configuration.

use std::path::PathBuf;
use std::rc::Rc;

use crate::clock::TimeSource;
use crate::error::{Error, Result};
use crate::task::Coroutine;

/// Per-proc time slicing bounds (milliseconds).
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Upper bound for one whole `proc` call.
    pub max_proc_ms: u32,
    /// Upper bound for phase 0 (timers and contexts).
    pub max_ctx_proc_ms: u32,
    /// Guaranteed floor for phase 1 (user and module work).
    pub min_on_proc_ms: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self { max_proc_ms: 100, max_ctx_proc_ms: 50, min_on_proc_ms: 10 }
    }
}

/// Adaptive ingress budget: fast shrink, slow grow.
#[derive(Debug, Clone, Copy)]
pub struct FlowControl {
    /// Current per-proc frame budget.
    pub max_deal_pkg_num: u32,
    /// Ceiling for the budget.
    pub max_num: u32,
    /// Floor for the budget; also the guaranteed ingress while stopping.
    pub min_num: u32,
    /// Growth step on an easy tick.
    pub inc_delta: u32,
    /// Shrink step on an overloaded tick.
    pub dec_delta: u32,
    /// Tolerance band for the overload judgement (ms).
    pub judge_range_ms: u32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            max_deal_pkg_num: 100,
            max_num: 1000,
            min_num: 10,
            inc_delta: 5,
            dec_delta: 20,
            judge_range_ms: 2,
        }
    }
}

/// Options consumed by [`ServerLoop::new`](crate::server::ServerLoop::new).
pub struct EngineOptions {
    /// Cooperative-task backend; `None` selects callback mode.
    pub coroutine: Option<Rc<dyn Coroutine>>,
    /// Bound on simultaneously live tasks (applied to the backend).
    pub max_task_num: u32,
    pub frame: FrameLimits,
    pub flow_ctrl: FlowControl,
    /// Warn threshold for the tick path (ms).
    pub max_tick_ms: u32,
    /// Where the crash-fingerprint record lives; `None` disables it.
    pub crash_guard_path: Option<PathBuf>,
    /// Phase-accounting time source; `None` selects the monotonic default.
    pub time_source: Option<Rc<dyn TimeSource>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            coroutine: None,
            max_task_num: 1024,
            frame: FrameLimits::default(),
            flow_ctrl: FlowControl::default(),
            max_tick_ms: 1000,
            crash_guard_path: None,
            time_source: None,
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coroutine(mut self, backend: Rc<dyn Coroutine>) -> Self {
        self.coroutine = Some(backend);
        self
    }

    pub fn with_max_task_num(mut self, max: u32) -> Self {
        self.max_task_num = max;
        self
    }

    pub fn with_frame(mut self, frame: FrameLimits) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_flow_ctrl(mut self, flow_ctrl: FlowControl) -> Self {
        self.flow_ctrl = flow_ctrl;
        self
    }

    pub fn with_max_tick_ms(mut self, max_tick_ms: u32) -> Self {
        self.max_tick_ms = max_tick_ms;
        self
    }

    pub fn with_crash_guard_path(mut self, path: PathBuf) -> Self {
        self.crash_guard_path = Some(path);
        self
    }

    pub fn with_time_source(mut self, source: Rc<dyn TimeSource>) -> Self {
        self.time_source = Some(source);
        self
    }

    /// Range validation: `0 < min_on <= max_ctx <= max_proc` on the frame
    /// side, `min <= current <= max` on the flow side.
    pub fn validate(&self) -> Result<()> {
        let flow = &self.flow_ctrl;
        if flow.min_num > flow.max_num {
            return Err(Error::InvalidConfig(format!(
                "min_num({}) > max_num({})",
                flow.min_num, flow.max_num
            )));
        }
        if flow.max_deal_pkg_num > flow.max_num || flow.max_deal_pkg_num < flow.min_num {
            return Err(Error::InvalidConfig(format!(
                "max_deal_pkg_num({}) not in [{}, {}]",
                flow.max_deal_pkg_num, flow.min_num, flow.max_num
            )));
        }

        let frame = &self.frame;
        if frame.min_on_proc_ms == 0 {
            return Err(Error::InvalidConfig("min_on_proc_ms must be positive".into()));
        }
        if frame.min_on_proc_ms > frame.max_ctx_proc_ms {
            return Err(Error::InvalidConfig(format!(
                "min_on_proc_ms({}) > max_ctx_proc_ms({})",
                frame.min_on_proc_ms, frame.max_ctx_proc_ms
            )));
        }
        if frame.min_on_proc_ms > frame.max_proc_ms {
            return Err(Error::InvalidConfig(format!(
                "min_on_proc_ms({}) > max_proc_ms({})",
                frame.min_on_proc_ms, frame.max_proc_ms
            )));
        }
        if frame.max_ctx_proc_ms > frame.max_proc_ms {
            return Err(Error::InvalidConfig(format!(
                "max_ctx_proc_ms({}) > max_proc_ms({})",
                frame.max_ctx_proc_ms, frame.max_proc_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineOptions::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_flow_rejected() {
        let mut opts = EngineOptions::default();
        opts.flow_ctrl.max_deal_pkg_num = opts.flow_ctrl.max_num + 1;
        assert!(opts.validate().is_err());

        let mut opts = EngineOptions::default();
        opts.flow_ctrl.min_num = opts.flow_ctrl.max_num + 1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn frame_floor_must_be_positive() {
        let mut opts = EngineOptions::default();
        opts.frame.min_on_proc_ms = 0;
        assert!(opts.validate().is_err());

        let mut opts = EngineOptions::default();
        opts.frame.min_on_proc_ms = opts.frame.max_proc_ms + 1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn frame_bounds_must_be_ordered() {
        // min_on above the phase-0 bound violates min <= ctx <= max.
        let mut opts = EngineOptions::default();
        opts.frame.min_on_proc_ms = opts.frame.max_ctx_proc_ms + 1;
        assert!(opts.validate().is_err());

        let mut opts = EngineOptions::default();
        opts.frame.max_ctx_proc_ms = opts.frame.max_proc_ms + 1;
        assert!(opts.validate().is_err());
    }
}
