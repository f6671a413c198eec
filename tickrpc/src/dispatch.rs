//! RPC dispatcher: decodes inbound frames, drives handlers through their
//! lifecycle, correlates replies, and issues outgoing calls.
//!
//! Inbound path per frame: decode -> queue-wait accounting -> crash
//! fingerprint -> recv interceptors -> request/response split. Requests are
//! parked in the scheduler when one is attached, otherwise dispatched
//! immediately; responses wake the pending-call table. The fingerprint is
//! marked before dispatch and cleared once the frame is fully processed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::{error, trace, warn};

use crate::clock::Clock;
use crate::codec::FrameHead;
use crate::context::{ClientCompletionFn, ClientContext, CurrentContext, ServerContext};
use crate::error::{Error, RetCode, Result};
use crate::fingerprint::CrashGuard;
use crate::flags::FrameFlags;
use crate::interceptor::Interceptors;
use crate::pending::{AsyncTask, PendingTable};
use crate::scheduler::Scheduler;
use crate::seq::SeqGenerator;
use crate::stats::Statistics;
use crate::task::Coroutine;
use crate::transport::{Transport, MAX_TRANSPORTS};

/// Request handler: `(dispatcher, context, request body) -> ret_code`. The
/// reply body goes into the context's response slot.
pub type Handler = Rc<dyn Fn(&Dispatcher, &Rc<ServerContext>, &[u8]) -> i32>;

#[derive(Clone)]
struct Method {
    handler: Handler,
    is_private: bool,
}

/// Options for one outgoing call.
#[derive(Debug, Clone, Copy)]
pub struct RpcOptions {
    pub transport: u32,
    pub gid: u64,
    pub cmd: u32,
    pub svr_type: u32,
    /// Destination hint handed to routing (0 = let routing pick).
    pub dest: u32,
    pub broadcast: bool,
    /// Relative timeout; 0 disables the deadline header field.
    pub timeout_ms: u32,
    pub version: u32,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            transport: 0,
            gid: 0,
            cmd: 0,
            svr_type: 0,
            dest: 0,
            broadcast: false,
            timeout_ms: 3000,
            version: 0,
        }
    }
}

/// Outcome of a blocking call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub ret_code: i32,
    pub body: Option<Vec<u8>>,
}

enum CallMode {
    OneWay,
    Blocking,
    Callback(ClientCompletionFn),
    CustomBlocking(Box<dyn FnOnce()>, ClientCompletionFn),
}

struct DispatcherInner {
    clock: Rc<Clock>,
    seq: Rc<SeqGenerator>,
    stats: Rc<Statistics>,
    current: Rc<CurrentContext>,
    pending: Rc<PendingTable>,
    coroutine: Option<Rc<dyn Coroutine>>,
    transports: RefCell<Vec<Option<Rc<Transport>>>>,
    methods: RefCell<HashMap<u32, Method>>,
    interceptors: Interceptors,
    scheduler: RefCell<Option<Rc<dyn Scheduler>>>,
    guard: Option<CrashGuard>,
}

/// The request-lifecycle engine core. Cheap to clone; all clones share one
/// dispatcher state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

/// Non-owning dispatcher reference for closures the dispatcher itself keeps
/// alive (scheduler processors), so attachment never forms a cycle.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<DispatcherInner>,
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Rc<Clock>,
        seq: Rc<SeqGenerator>,
        stats: Rc<Statistics>,
        current: Rc<CurrentContext>,
        pending: Rc<PendingTable>,
        coroutine: Option<Rc<dyn Coroutine>>,
        guard: Option<CrashGuard>,
    ) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                clock,
                seq,
                stats,
                current,
                pending,
                coroutine,
                transports: RefCell::new((0..MAX_TRANSPORTS).map(|_| None).collect()),
                methods: RefCell::new(HashMap::new()),
                interceptors: Interceptors::new(),
                scheduler: RefCell::new(None),
                guard,
            }),
        }
    }

    /// Attaches a transport at `index`.
    pub fn add_transport(&self, index: u32, transport: Transport) -> Result<()> {
        let mut transports = self.inner.transports.borrow_mut();
        match transports.get_mut(index as usize) {
            Some(slot @ None) => {
                *slot = Some(Rc::new(transport));
                Ok(())
            }
            _ => Err(Error::TransportSlot(index)),
        }
    }

    /// The transport at `index`, if attached.
    pub fn transport(&self, index: u32) -> Option<Rc<Transport>> {
        self.inner.transports.borrow().get(index as usize)?.clone()
    }

    /// Registers the handler for `cmd`. Private methods reject frames that
    /// carry the client flag.
    pub fn register_method(&self, cmd: u32, handler: Handler, is_private: bool) -> Result<()> {
        let mut methods = self.inner.methods.borrow_mut();
        if methods.contains_key(&cmd) {
            return Err(Error::DuplicateCmd(cmd));
        }
        methods.insert(cmd, Method { handler, is_private });
        Ok(())
    }

    pub(crate) fn set_scheduler(&self, scheduler: Rc<dyn Scheduler>) {
        *self.inner.scheduler.borrow_mut() = Some(scheduler);
    }

    /// The pending-call table (loop phase 0 drains its timers).
    pub fn pending(&self) -> &Rc<PendingTable> {
        &self.inner.pending
    }

    /// Interceptor chains.
    pub fn interceptors(&self) -> &Interceptors {
        &self.inner.interceptors
    }

    pub fn stats(&self) -> &Rc<Statistics> {
        &self.inner.stats
    }

    pub fn clock(&self) -> &Rc<Clock> {
        &self.inner.clock
    }

    /// The context of the request currently executing, per the
    /// current-request contract.
    pub fn current_server_context(&self) -> Option<Rc<ServerContext>> {
        self.inner.current.get()
    }

    /// A non-owning handle to this dispatcher.
    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher { inner: Rc::downgrade(&self.inner) }
    }

    /// Drains up to `max_frames` frames from a transport's channel.
    pub fn pump(&self, transport_index: u32, max_frames: u32) -> u32 {
        let Some(transport) = self.transport(transport_index) else {
            return 0;
        };
        let disp = self.clone();
        transport.channel.poll(max_frames, &mut |data, recv_id, arrived_ms| {
            disp.on_recv(transport_index, data, recv_id, arrived_ms)
        })
    }

    /// Inbound entry for one raw frame.
    pub fn on_recv(&self, transport_index: u32, data: &[u8], recv_id: u32, arrived_ms: u64) -> i32 {
        let Some(transport) = self.transport(transport_index) else {
            return RetCode::SystemError.value();
        };

        let (head, body) = {
            let mut codec = transport.recv_codec.borrow_mut();
            if !codec.decode(data) {
                error!(recv_id, len = data.len(), "frame decode failed");
                self.inner.stats.inc_recv_error();
                return RetCode::SystemError.value();
            }
            (FrameHead::from_codec(&**codec), codec.body().to_vec())
        };

        self.inner.stats.inc_recv_pkg();
        let now = self.inner.clock.now_ms();
        if now >= arrived_ms {
            self.inner.stats.record_queue_cost(head.cmd, (now - arrived_ms) as u32);
        }

        trace!(
            gid = head.gid,
            cmd = format_args!("{:#010X}", head.cmd),
            is_rsp = head.is_response(),
            seq_id = head.seq_id,
            body_len = head.body_len,
            recv_id,
            arrived_ms,
            "on recv"
        );

        if let Some(guard) = &self.inner.guard {
            if !guard.check_and_mark(head.gid, head.seq_id, head.cmd) {
                error!(
                    gid = head.gid,
                    cmd = format_args!("{:#010X}", head.cmd),
                    seq_id = head.seq_id,
                    src = head.src,
                    recv_id,
                    "frame matches crash fingerprint, dropped"
                );
                guard.clear();
                return RetCode::Success.value();
            }
        }

        if !head.is_response() {
            self.inner.stats.record_req_size(head.cmd, head.body_len);
        }

        if self.inner.interceptors.run_recv(transport_index, recv_id) {
            trace!(gid = head.gid, seq_id = head.seq_id, "frame intercepted");
        } else if head.is_response() {
            self.deal_response(&head, body);
        } else {
            let scheduler = self.inner.scheduler.borrow().clone();
            match scheduler {
                Some(scheduler) => {
                    let seq = self.inner.seq.next();
                    if !scheduler.on_request(seq, head.gid, data, transport_index as u64) {
                        error!(
                            gid = head.gid,
                            cmd = format_args!("{:#010X}", head.cmd),
                            other_seq_id = head.seq_id,
                            "scheduler rejected request"
                        );
                        self.inner.stats.add_schedule_drop(head.cmd);
                    }
                }
                None => {
                    self.deal_request(transport_index, head, body);
                }
            }
        }

        if let Some(guard) = &self.inner.guard {
            guard.clear();
        }
        RetCode::Success.value()
    }

    /// Re-decodes and dispatches a request frame parked by the scheduler.
    pub fn deal_req_pkg(&self, data: &[u8], transport_index: u32) -> bool {
        let Some(transport) = self.transport(transport_index) else {
            return false;
        };
        let (head, body) = {
            let mut codec = transport.recv_codec.borrow_mut();
            if !codec.decode(data) {
                error!(len = data.len(), "parked frame decode failed");
                return false;
            }
            (FrameHead::from_codec(&**codec), codec.body().to_vec())
        };
        self.deal_request(transport_index, head, body)
    }

    fn deal_request(&self, transport_index: u32, head: FrameHead, body: Vec<u8>) -> bool {
        let now = self.inner.clock.now_ms();
        if head.timeout > 0 && head.timeout < now {
            self.inner.stats.add_expire_drop(head.cmd);
            warn!(
                gid = head.gid,
                cmd = format_args!("{:#010X}", head.cmd),
                other_seq_id = head.seq_id,
                expired = head.timeout,
                "request past its deadline, dropped"
            );
            return false;
        }

        let method = match self.inner.methods.borrow().get(&head.cmd) {
            Some(method) => method.clone(),
            None => {
                error!(
                    gid = head.gid,
                    cmd = format_args!("{:#010X}", head.cmd),
                    "no method for cmd"
                );
                return false;
            }
        };

        if head.flags.contains(FrameFlags::FROM_CLIENT) && method.is_private {
            error!(
                gid = head.gid,
                cmd = format_args!("{:#010X}", head.cmd),
                "private method called from client"
            );
            return false;
        }

        let ctx = ServerContext::new(head, transport_index);
        ctx.start_ms.set(now);
        trace!(
            gid = head.gid,
            cmd = format_args!("{:#010X}", head.cmd),
            other_seq_id = head.seq_id,
            ctx_id = ctx.id,
            "deal request"
        );

        let finish_disp = self.clone();
        let finish_ctx = Rc::clone(&ctx);
        ctx.set_callback(Box::new(move |_ret| finish_disp.method_finish(&finish_ctx)), None);

        let disp = self.clone();
        let run_ctx = Rc::clone(&ctx);
        let handler = method.handler;
        let run = move || {
            if let Some(coroutine) = &disp.inner.coroutine {
                disp.inner.stats.save_max_task_num(coroutine.running_count() as u32);
            }
            disp.inner.current.set(Some(Rc::clone(&run_ctx)));
            if disp.inner.interceptors.run_req(&run_ctx) {
                trace!(gid = run_ctx.gid, "request intercepted");
                run_ctx.ignore.set(true);
            } else {
                let ret = handler(&disp, &run_ctx, &body);
                run_ctx.ret_code.set(ret);
            }
            if run_ctx.is_finish() {
                run_ctx.run();
            }
        };

        match &self.inner.coroutine {
            Some(coroutine) => {
                if !coroutine.spawn(Box::new(run)) {
                    error!(
                        gid = ctx.gid,
                        cmd = format_args!("{:#010X}", ctx.head.cmd),
                        "task spawn failed"
                    );
                    return false;
                }
            }
            None => run(),
        }
        true
    }

    fn deal_response(&self, head: &FrameHead, body: Vec<u8>) {
        let Some(ctx) = self.inner.pending.awake(head.seq_id, head.ret_code) else {
            return;
        };

        if head.cmd != ctx.cmd {
            error!(
                gid = head.gid,
                seq_id = head.seq_id,
                cmd = format_args!("{:#010X}", head.cmd),
                expect = format_args!("{:#010X}", ctx.cmd),
                "reply cmd does not match the pending call"
            );
            ctx.ret_code.set(RetCode::SystemError.value());
        }

        trace!(
            gid = head.gid,
            seq_id = head.seq_id,
            ret_code = ctx.ret_code.get(),
            body_len = head.body_len,
            "deal response"
        );
        *ctx.response.borrow_mut() = Some(body);
        ctx.run();
    }

    /// Completion path of an inbound request: reply interception, reply
    /// frame construction, per-cmd accounting.
    fn method_finish(&self, ctx: &Rc<ServerContext>) {
        let intercepted = self.inner.interceptors.run_rsp(ctx);
        if intercepted {
            trace!(
                gid = ctx.gid,
                cmd = format_args!("{:#010X}", ctx.head.cmd),
                "reply intercepted"
            );
        }

        if !ctx.ignore.get() && !ctx.head.flags.contains(FrameFlags::DONT_RSP) && !intercepted {
            if let Some(transport) = self.transport(ctx.transport) {
                let body = ctx.response.borrow().clone();
                {
                    let mut codec = transport.send_codec.borrow_mut();
                    codec.reset();
                    codec.set_src(transport.channel.my_id());
                    codec.set_dst(ctx.head.src);
                    codec.set_timeout(0);
                    codec.set_gid(ctx.head.gid);
                    codec.set_seq_id(ctx.head.seq_id);
                    codec.set_cmd(ctx.head.cmd);
                    codec.set_svr_type(ctx.head.svr_type);
                    codec.set_version(ctx.head.version);
                    codec.set_ret_code(ctx.ret_code.get());
                    codec.set_flags(ctx.head.flags | FrameFlags::DONT_RSP | FrameFlags::RSP);
                }
                let ret = self.send_payload(&transport, &body, true);
                if ret != RetCode::Success.value() {
                    error!(
                        gid = ctx.gid,
                        cmd = format_args!("{:#010X}", ctx.head.cmd),
                        ret,
                        "reply send failed"
                    );
                }
            }
        }

        ctx.end_ms.set(self.inner.clock.now_ms());
        self.inner.stats.record_handler_cost(
            ctx.head.cmd,
            ctx.duration_ms(),
            ctx.ret_code.get(),
        );

        if let Some(scheduler) = self.inner.scheduler.borrow().as_ref() {
            scheduler.on_response(ctx.gid);
        }
        self.inner.current.set(None);
    }

    /// Serializes `body` into the staged send codec, runs the send chain,
    /// encodes, and hands the frame to the channel.
    fn send_payload(&self, transport: &Rc<Transport>, body: &[u8], is_reply: bool) -> i32 {
        let len = body.len();
        let (cmd, gid, broadcast) = {
            let codec = transport.send_codec.borrow();
            (codec.cmd(), codec.gid(), codec.flags().contains(FrameFlags::BROADCAST))
        };

        if is_reply {
            self.inner.stats.record_rsp_size(cmd, len as u32);
        } else {
            self.inner.stats.record_send_size(cmd, len as u32);
        }

        {
            let mut codec = transport.send_codec.borrow_mut();
            let max = codec.body_buf().len();
            if len * 100 >= max * 85 {
                error!(
                    gid,
                    cmd = format_args!("{:#010X}", cmd),
                    len,
                    max,
                    "payload at or above 85% of the send buffer"
                );
                if len >= max {
                    return RetCode::SendMsgTooLong.value();
                }
            }
            codec.body_buf()[..len].copy_from_slice(body);
            if !codec.set_body_len(len as u32) {
                error!(gid, cmd = format_args!("{:#010X}", cmd), len, "body length rejected");
                return RetCode::MsgSerializeError.value();
            }

            if self.inner.interceptors.run_send(&mut **codec) {
                trace!(gid, cmd = format_args!("{:#010X}", cmd), "send intercepted");
                return RetCode::Success.value();
            }

            if codec.encode().is_none() {
                error!(gid, cmd = format_args!("{:#010X}", cmd), "encode failed");
                return RetCode::SystemError.value();
            }
        }

        let ret = if broadcast { transport.broadcast_encoded() } else { transport.send_encoded() };
        if ret != RetCode::Success.value() {
            error!(gid, cmd = format_args!("{:#010X}", cmd), ret, "channel send failed");
            self.inner.stats.inc_send_error();
            return ret;
        }
        self.inner.stats.inc_send_pkg();
        trace!(gid, cmd = format_args!("{:#010X}", cmd), len, "sent");
        RetCode::Success.value()
    }

    /// One-way call: no reply expected, no suspension.
    pub fn notify(&self, opts: &RpcOptions, body: &[u8]) -> i32 {
        self.rpc_inner(opts, body, CallMode::OneWay).0
    }

    /// Blocking call. Legal only inside a cooperative task: the task yields
    /// until the reply or timeout.
    pub fn call(&self, opts: &RpcOptions, body: &[u8]) -> CallResult {
        let in_task = self
            .inner
            .coroutine
            .as_ref()
            .is_some_and(|c| c.current().is_some());
        if !in_task {
            error!(
                gid = opts.gid,
                cmd = format_args!("{:#010X}", opts.cmd),
                "blocking call outside a cooperative task"
            );
            return CallResult { ret_code: RetCode::SystemError.value(), body: None };
        }

        let (ret, ctx) = self.rpc_inner(opts, body, CallMode::Blocking);
        match ctx {
            Some(ctx) => CallResult {
                ret_code: ctx.ret_code.get(),
                body: ctx.response.borrow_mut().take(),
            },
            None => CallResult { ret_code: ret, body: None },
        }
    }

    /// Call continued by `callback` when the reply or timeout lands. Works
    /// in both engine modes; in callback mode the issuing request stays live
    /// until the continuation finishes it.
    pub fn call_with(&self, opts: &RpcOptions, body: &[u8], callback: ClientCompletionFn) -> i32 {
        self.rpc_inner(opts, body, CallMode::Callback(callback)).0
    }

    /// Call that parks the caller in `blocking` instead of yielding, for
    /// callers bringing their own wait primitive.
    pub fn call_blocking_with(
        &self,
        opts: &RpcOptions,
        body: &[u8],
        blocking: Box<dyn FnOnce()>,
        callback: ClientCompletionFn,
    ) -> i32 {
        self.rpc_inner(opts, body, CallMode::CustomBlocking(blocking, callback)).0
    }

    fn rpc_inner(
        &self,
        opts: &RpcOptions,
        body: &[u8],
        mode: CallMode,
    ) -> (i32, Option<Rc<ClientContext>>) {
        let expect_response = !matches!(mode, CallMode::OneWay);
        if opts.broadcast && expect_response {
            error!(gid = opts.gid, "a broadcast cannot expect a response");
            return (RetCode::SystemError.value(), None);
        }

        self.inner.stats.add_send_cmd(opts.cmd);

        let Some(transport) = self.transport(opts.transport) else {
            error!(transport = opts.transport, "no such transport");
            return (RetCode::SystemError.value(), None);
        };

        let seq_id = if expect_response { self.inner.seq.next() } else { 0 };

        {
            let mut codec = transport.send_codec.borrow_mut();
            codec.reset();
            codec.set_src(transport.channel.my_id());
            codec.set_dst(opts.dest);
            codec.set_timeout(if opts.timeout_ms > 0 {
                self.inner.clock.now_ms() + opts.timeout_ms as u64
            } else {
                0
            });
            codec.set_gid(opts.gid);
            codec.set_cmd(opts.cmd);
            codec.set_svr_type(opts.svr_type);
            codec.set_version(opts.version);
            codec.set_ret_code(RetCode::Success.value());
            let mut flags = FrameFlags::empty();
            if !expect_response {
                flags |= FrameFlags::DONT_RSP;
            }
            if opts.broadcast {
                flags |= FrameFlags::BROADCAST;
            }
            codec.set_flags(flags);
            codec.set_seq_id(seq_id);

            if self.inner.interceptors.run_call(&mut **codec, body) {
                trace!(
                    gid = opts.gid,
                    cmd = format_args!("{:#010X}", opts.cmd),
                    seq_id,
                    "call intercepted"
                );
                return (RetCode::Success.value(), None);
            }
        }

        let ret = self.send_payload(&transport, body, false);
        if ret != RetCode::Success.value() {
            error!(
                gid = opts.gid,
                cmd = format_args!("{:#010X}", opts.cmd),
                ret,
                "request send failed"
            );
            return (ret, None);
        }

        trace!(
            gid = opts.gid,
            cmd = format_args!("{:#010X}", opts.cmd),
            seq_id,
            "rpc issued"
        );

        if !expect_response {
            return (RetCode::Success.value(), None);
        }

        let ctx = ClientContext::new(opts.cmd, opts.transport, &self.inner.current);
        let gid = opts.gid;
        let cmd = opts.cmd;

        let (user_cb, blocking): (Option<ClientCompletionFn>, Option<Box<dyn FnOnce()>>) =
            match mode {
                CallMode::Blocking => (None, None),
                CallMode::Callback(cb) => (Some(cb), None),
                CallMode::CustomBlocking(blocking, cb) => (Some(cb), Some(blocking)),
                CallMode::OneWay => unreachable!("handled above"),
            };

        // Reply interception wraps whatever the caller supplied.
        let chains = self.clone();
        let observe: ClientCompletionFn = Box::new(move |ret_code, reply| {
            if ret_code != RetCode::Success.value() {
                warn!(gid, cmd = format_args!("{:#010X}", cmd), seq_id, ret_code, "rpc failed");
            }
            chains.inner.interceptors.run_reply(ret_code, seq_id, reply);
            if let Some(cb) = user_cb {
                cb(ret_code, reply);
            }
        });

        let task = AsyncTask { callback: Some(observe), recycle: None, blocking };
        let ret = self.inner.pending.pending(seq_id, opts.timeout_ms, Rc::clone(&ctx), task);
        if ret != RetCode::Success.value() {
            return (ret, None);
        }
        (RetCode::Success.value(), Some(ctx))
    }
}
