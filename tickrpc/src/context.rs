//! Request and call contexts.
//!
//! A [`ServerContext`] tracks one inbound request from decode to reply; a
//! [`ClientContext`] tracks one outgoing RPC until its reply or timeout.
//! Both carry a run-once completion callback plus an optional recycle hook,
//! fired together by `run`.
//!
//! The "current request" is published through [`CurrentContext`], a slot
//! owned by the engine rather than a thread-local: the cooperative backend
//! may run activations on worker threads, but the engine guarantees at most
//! one activation is runnable at a time, so one engine-local slot is exact.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::FrameHead;

static CONTEXT_IDS: AtomicU64 = AtomicU64::new(1);

fn next_context_id() -> u64 {
    CONTEXT_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Completion callback invoked with the final ret_code.
pub type CompletionFn = Box<dyn FnOnce(i32)>;

/// Recycle hook invoked after the completion callback.
pub type RecycleFn = Box<dyn FnOnce()>;

/// Per-inbound-request state.
pub struct ServerContext {
    /// Process-unique context id.
    pub id: u64,
    /// Header of the request frame, as decoded.
    pub head: FrameHead,
    /// Transport the request arrived on.
    pub transport: u32,
    /// Caller-chosen correlation key.
    pub gid: u64,
    pub start_ms: Cell<u64>,
    pub end_ms: Cell<u64>,
    pub ret_code: Cell<i32>,
    /// True while the handler is suspended awaiting an outgoing RPC; the
    /// reply path must not fire yet.
    pub to_be_continue: Cell<bool>,
    /// Set by a request interceptor to suppress handler and reply.
    pub ignore: Cell<bool>,
    /// Handler-owned reply body slot.
    pub response: RefCell<Vec<u8>>,
    callback: RefCell<Option<CompletionFn>>,
    recycle: RefCell<Option<RecycleFn>>,
}

impl ServerContext {
    pub fn new(head: FrameHead, transport: u32) -> Rc<Self> {
        Rc::new(Self {
            id: next_context_id(),
            head,
            transport,
            gid: head.gid,
            start_ms: Cell::new(0),
            end_ms: Cell::new(0),
            ret_code: Cell::new(0),
            to_be_continue: Cell::new(false),
            ignore: Cell::new(false),
            response: RefCell::new(Vec::new()),
            callback: RefCell::new(None),
            recycle: RefCell::new(None),
        })
    }

    pub fn set_callback(&self, callback: CompletionFn, recycle: Option<RecycleFn>) {
        *self.callback.borrow_mut() = Some(callback);
        *self.recycle.borrow_mut() = recycle;
    }

    /// The request is finished when the handler failed outright or is not
    /// suspended on an outgoing call.
    pub fn is_finish(&self) -> bool {
        self.ret_code.get() != 0 || !self.to_be_continue.get()
    }

    /// Fires the completion callback (once) and then the recycle hook.
    pub fn run(&self) {
        let cb = self.callback.borrow_mut().take();
        if let Some(cb) = cb {
            cb(self.ret_code.get());
        }
        let recycle = self.recycle.borrow_mut().take();
        if let Some(recycle) = recycle {
            recycle();
        }
    }

    /// Wall time between dispatch and completion.
    pub fn duration_ms(&self) -> u32 {
        self.end_ms.get().saturating_sub(self.start_ms.get()) as u32
    }

    /// Stores the reply body the completion path will serialize.
    pub fn set_response(&self, body: &[u8]) {
        let mut slot = self.response.borrow_mut();
        slot.clear();
        slot.extend_from_slice(body);
    }
}

/// Continuation invoked with `(ret_code, reply body)`. The body is absent
/// on timeout and on send-side failures.
pub type ClientCompletionFn = Box<dyn FnOnce(i32, Option<&[u8]>)>;

/// Per-outgoing-RPC state.
pub struct ClientContext {
    /// Process-unique context id.
    pub id: u64,
    /// Cmd of the outgoing call, cross-checked against the reply.
    pub cmd: u32,
    /// Transport the call left on.
    pub transport: u32,
    pub seq_id: Cell<u64>,
    pub timer_id: Cell<u64>,
    pub ret_code: Cell<i32>,
    /// Reply body, filled before the continuation runs.
    pub response: RefCell<Option<Vec<u8>>>,
    /// The request this call was issued from, if any.
    pub parent: Option<Rc<ServerContext>>,
    callback: RefCell<Option<ClientCompletionFn>>,
    recycle: RefCell<Option<RecycleFn>>,
}

impl ClientContext {
    /// Captures the issuing request from `current` so the reply can restore
    /// the caller's view.
    pub fn new(cmd: u32, transport: u32, current: &CurrentContext) -> Rc<Self> {
        Rc::new(Self {
            id: next_context_id(),
            cmd,
            transport,
            seq_id: Cell::new(0),
            timer_id: Cell::new(0),
            ret_code: Cell::new(0),
            response: RefCell::new(None),
            parent: current.get(),
            callback: RefCell::new(None),
            recycle: RefCell::new(None),
        })
    }

    pub fn set_callback(&self, callback: Option<ClientCompletionFn>, recycle: Option<RecycleFn>) {
        *self.callback.borrow_mut() = callback;
        *self.recycle.borrow_mut() = recycle;
    }

    /// Fires the continuation with the recorded ret_code and reply body,
    /// then the recycle hook. The body stays stored so a blocking caller
    /// can read it after being resumed by the recycle hook.
    pub fn run(&self) {
        let cb = self.callback.borrow_mut().take();
        if let Some(cb) = cb {
            let body = self.response.borrow().clone();
            cb(self.ret_code.get(), body.as_deref());
        }
        let recycle = self.recycle.borrow_mut().take();
        if let Some(recycle) = recycle {
            recycle();
        }
    }
}

/// Engine-owned slot publishing the currently executing request.
///
/// Contract: during a handler's execution window this holds its context;
/// during a reply continuation it holds the waiter's context; otherwise it
/// is empty.
#[derive(Default)]
pub struct CurrentContext {
    slot: RefCell<Option<Rc<ServerContext>>>,
}

impl CurrentContext {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn set(&self, ctx: Option<Rc<ServerContext>>) {
        *self.slot.borrow_mut() = ctx;
    }

    pub fn get(&self) -> Option<Rc<ServerContext>> {
        self.slot.borrow().clone()
    }

    /// Gid of the current request, 0 when idle.
    pub fn gid(&self) -> u64 {
        self.slot.borrow().as_ref().map_or(0, |c| c.gid)
    }

    pub fn is_idle(&self) -> bool {
        self.slot.borrow().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_predicate() {
        let ctx = ServerContext::new(FrameHead::default(), 0);
        assert!(ctx.is_finish(), "fresh context is finished");
        ctx.to_be_continue.set(true);
        assert!(!ctx.is_finish());
        ctx.ret_code.set(-1);
        assert!(ctx.is_finish(), "a failed handler finishes even when suspended");
    }

    #[test]
    fn run_fires_callback_then_recycle_once() {
        let ctx = ServerContext::new(FrameHead::default(), 0);
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::default();
        let o1 = order.clone();
        let o2 = order.clone();
        ctx.set_callback(
            Box::new(move |_| o1.borrow_mut().push("callback")),
            Some(Box::new(move || o2.borrow_mut().push("recycle"))),
        );
        ctx.run();
        ctx.run();
        assert_eq!(*order.borrow(), vec!["callback", "recycle"]);
    }

    #[test]
    fn client_context_captures_parent() {
        let current = CurrentContext::new();
        let parent = ServerContext::new(FrameHead { gid: 9, ..Default::default() }, 0);
        current.set(Some(parent.clone()));
        let client = ClientContext::new(0x10, 0, &current);
        assert_eq!(client.parent.as_ref().unwrap().id, parent.id);
        assert_eq!(current.gid(), 9);
        current.set(None);
        assert!(current.is_idle());
    }

    #[test]
    fn client_run_hands_over_response() {
        let current = CurrentContext::new();
        let client = ClientContext::new(1, 0, &current);
        client.ret_code.set(-3);
        *client.response.borrow_mut() = Some(b"late".to_vec());
        let got: Rc<RefCell<Option<(i32, Option<Vec<u8>>)>>> = Rc::default();
        let g = got.clone();
        client.set_callback(
            Some(Box::new(move |ret, body| {
                *g.borrow_mut() = Some((ret, body.map(|b| b.to_vec())))
            })),
            None,
        );
        client.run();
        assert_eq!(*got.borrow(), Some((-3, Some(b"late".to_vec()))));
        assert!(client.response.borrow().is_some(), "body stays for blocking readers");
    }
}
