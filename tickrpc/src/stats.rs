//! Runtime statistics: rolling counters, per-cmd latency histograms, and
//! max-value meters.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};

/// Latency bucket edges in milliseconds. The bucket for a duration `d` is
/// the largest edge `<= d`, with `d == 0` treated as 1.
pub const COST_BUCKET_EDGES: [u32; 8] = [0, 50, 100, 500, 1000, 3000, 5000, 60000];

/// Largest bucket edge at or below `duration_ms`.
pub fn cost_bucket(duration_ms: u32) -> u32 {
    let d = duration_ms.max(1);
    let mut edge = COST_BUCKET_EDGES[0];
    for &e in &COST_BUCKET_EDGES {
        if e <= d {
            edge = e;
        } else {
            break;
        }
    }
    edge
}

/// Engine-wide rolling counters, cleared as one unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineCounters {
    pub recv_pkg_num: u32,
    pub recv_error_pkg_num: u32,
    pub send_pkg_num: u32,
    pub send_error_pkg_num: u32,
    pub rpc_time_out_num: u32,
    pub on_proc_num: u32,
    pub proc_timeout_0: u32,
    pub proc_timeout_1: u32,
    pub proc_timeout_2: u32,
    pub proc_total_timeout: u32,
    pub proc_deal_time_0: u32,
    pub proc_deal_time_1: u32,
    pub proc_deal_time_2: u32,
    pub tick_timeout: u32,
    pub tick_deal_time: u32,
    pub task_num_max: u32,
    pub task_pending_num_max: u32,
}

/// Per-cmd statistics for the receive side.
#[derive(Debug, Clone, Default)]
pub struct RecvCmdInfo {
    pub total_recv_num: u32,
    pub expire_drop: u32,
    pub schedule_drop: u32,
    pub max_req_size: u32,
    pub max_rsp_size: u32,
    /// ret_code -> count.
    pub ret_code_num: HashMap<i32, u32>,
    /// Handler cost histogram, bucket edge -> count.
    pub cost: BTreeMap<u32, u32>,
    /// Queue wait histogram, bucket edge -> count.
    pub queue_cost: BTreeMap<u32, u32>,
}

/// Per-cmd statistics for the send side.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendCmdInfo {
    pub total_send_num: u32,
    pub max_send_size: u32,
}

/// Statistics hub shared across the loop and dispatcher. All mutation
/// happens on the engine thread; external exporters read snapshots.
#[derive(Debug, Default)]
pub struct Statistics {
    counters: RefCell<EngineCounters>,
    recv_cmd: RefCell<HashMap<u32, RecvCmdInfo>>,
    send_cmd: RefCell<HashMap<u32, SendCmdInfo>>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the rolling counters.
    pub fn counters(&self) -> EngineCounters {
        *self.counters.borrow()
    }

    /// Runs `f` over the mutable counters.
    pub fn with_counters(&self, f: impl FnOnce(&mut EngineCounters)) {
        f(&mut self.counters.borrow_mut());
    }

    /// Copy of the receive-side info for `cmd`.
    pub fn recv_cmd_info(&self, cmd: u32) -> Option<RecvCmdInfo> {
        self.recv_cmd.borrow().get(&cmd).cloned()
    }

    /// Copy of the send-side info for `cmd`.
    pub fn send_cmd_info(&self, cmd: u32) -> Option<SendCmdInfo> {
        self.send_cmd.borrow().get(&cmd).copied()
    }

    /// Clears every rolling counter and per-cmd table.
    pub fn clear(&self) {
        *self.counters.borrow_mut() = EngineCounters::default();
        self.recv_cmd.borrow_mut().clear();
        self.send_cmd.borrow_mut().clear();
    }

    pub fn inc_rpc_timeout(&self) {
        self.counters.borrow_mut().rpc_time_out_num += 1;
    }

    pub fn inc_recv_pkg(&self) {
        self.counters.borrow_mut().recv_pkg_num += 1;
    }

    pub fn inc_recv_error(&self) {
        self.counters.borrow_mut().recv_error_pkg_num += 1;
    }

    pub fn inc_send_pkg(&self) {
        self.counters.borrow_mut().send_pkg_num += 1;
    }

    pub fn inc_send_error(&self) {
        self.counters.borrow_mut().send_error_pkg_num += 1;
    }

    pub fn save_max_task_num(&self, n: u32) {
        let mut c = self.counters.borrow_mut();
        c.task_num_max = c.task_num_max.max(n);
    }

    pub fn save_max_pending_num(&self, n: u32) {
        let mut c = self.counters.borrow_mut();
        c.task_pending_num_max = c.task_pending_num_max.max(n);
    }

    /// Records a completed handler: ret-code count plus cost bucket.
    pub fn record_handler_cost(&self, cmd: u32, duration_ms: u32, ret_code: i32) {
        let mut map = self.recv_cmd.borrow_mut();
        let info = map.entry(cmd).or_default();
        *info.ret_code_num.entry(ret_code).or_default() += 1;
        *info.cost.entry(cost_bucket(duration_ms)).or_default() += 1;
    }

    /// Records time a frame waited between arrival and decode.
    pub fn record_queue_cost(&self, cmd: u32, wait_ms: u32) {
        let mut map = self.recv_cmd.borrow_mut();
        *map.entry(cmd).or_default().queue_cost.entry(cost_bucket(wait_ms)).or_default() += 1;
    }

    /// Counts a received request and tracks its body size.
    pub fn record_req_size(&self, cmd: u32, body_size: u32) {
        let mut map = self.recv_cmd.borrow_mut();
        let info = map.entry(cmd).or_default();
        info.total_recv_num += 1;
        info.max_req_size = info.max_req_size.max(body_size);
    }

    /// Tracks a reply body size for a handled request.
    pub fn record_rsp_size(&self, cmd: u32, body_size: u32) {
        let mut map = self.recv_cmd.borrow_mut();
        let info = map.entry(cmd).or_default();
        info.max_rsp_size = info.max_rsp_size.max(body_size);
    }

    /// Tracks an outgoing call body size.
    pub fn record_send_size(&self, cmd: u32, body_size: u32) {
        let mut map = self.send_cmd.borrow_mut();
        let info = map.entry(cmd).or_default();
        info.max_send_size = info.max_send_size.max(body_size);
    }

    /// Counts an outgoing call for `cmd`.
    pub fn add_send_cmd(&self, cmd: u32) {
        self.send_cmd.borrow_mut().entry(cmd).or_default().total_send_num += 1;
    }

    pub fn add_expire_drop(&self, cmd: u32) {
        self.recv_cmd.borrow_mut().entry(cmd).or_default().expire_drop += 1;
    }

    pub fn add_schedule_drop(&self, cmd: u32) {
        self.recv_cmd.borrow_mut().entry(cmd).or_default().schedule_drop += 1;
    }
}
