//! Interceptor chains.
//!
//! Every chain runs all of its members and OR-reduces the "intercepted"
//! booleans, so interceptors can be idempotent observers. The rsp, send, and
//! reply chains register front-first (onion ordering): the member added last
//! sees the frame first on the way out.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::codec::WriteCodec;
use crate::context::ServerContext;

/// Inbound frame observer: `(transport index, source endpoint)`.
pub type RecvInterceptor = Rc<dyn Fn(u32, u32) -> bool>;
/// Runs before the handler; may mark the context ignored.
pub type ReqInterceptor = Rc<dyn Fn(&Rc<ServerContext>) -> bool>;
/// Runs before the reply is built; `true` consumes the reply.
pub type RspInterceptor = Rc<dyn Fn(&Rc<ServerContext>) -> bool>;
/// Runs after serialization, before encode; `true` consumes the frame.
pub type SendInterceptor = Rc<dyn Fn(&mut dyn WriteCodec) -> bool>;
/// Runs on an outgoing call before serialization; `true` consumes the call.
pub type CallInterceptor = Rc<dyn Fn(&mut dyn WriteCodec, &[u8]) -> bool>;
/// Observes a reply continuation: `(ret_code, seq_id, reply body)`. The body
/// is absent on timeout.
pub type ReplyInterceptor = Rc<dyn Fn(i32, u64, Option<&[u8]>)>;

/// The six chains of the dispatcher.
#[derive(Default)]
pub struct Interceptors {
    recv: RefCell<VecDeque<RecvInterceptor>>,
    req: RefCell<VecDeque<ReqInterceptor>>,
    rsp: RefCell<VecDeque<RspInterceptor>>,
    send: RefCell<VecDeque<SendInterceptor>>,
    call: RefCell<VecDeque<CallInterceptor>>,
    reply: RefCell<VecDeque<ReplyInterceptor>>,
}

impl Interceptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_recv(&self, f: RecvInterceptor) {
        self.recv.borrow_mut().push_back(f);
    }

    pub fn add_req(&self, f: ReqInterceptor) {
        self.req.borrow_mut().push_back(f);
    }

    pub fn add_rsp(&self, f: RspInterceptor) {
        self.rsp.borrow_mut().push_front(f);
    }

    pub fn add_send(&self, f: SendInterceptor) {
        self.send.borrow_mut().push_front(f);
    }

    pub fn add_call(&self, f: CallInterceptor) {
        self.call.borrow_mut().push_back(f);
    }

    pub fn add_reply(&self, f: ReplyInterceptor) {
        self.reply.borrow_mut().push_front(f);
    }

    pub fn run_recv(&self, transport: u32, recv_id: u32) -> bool {
        let chain = self.recv.borrow().clone();
        let mut intercepted = false;
        for f in &chain {
            intercepted |= f(transport, recv_id);
        }
        intercepted
    }

    pub fn run_req(&self, ctx: &Rc<ServerContext>) -> bool {
        let chain = self.req.borrow().clone();
        let mut intercepted = false;
        for f in &chain {
            intercepted |= f(ctx);
        }
        intercepted
    }

    pub fn run_rsp(&self, ctx: &Rc<ServerContext>) -> bool {
        let chain = self.rsp.borrow().clone();
        let mut intercepted = false;
        for f in &chain {
            intercepted |= f(ctx);
        }
        intercepted
    }

    pub fn run_send(&self, codec: &mut dyn WriteCodec) -> bool {
        let chain = self.send.borrow().clone();
        let mut intercepted = false;
        for f in &chain {
            intercepted |= f(codec);
        }
        intercepted
    }

    pub fn run_call(&self, codec: &mut dyn WriteCodec, req_body: &[u8]) -> bool {
        let chain = self.call.borrow().clone();
        let mut intercepted = false;
        for f in &chain {
            intercepted |= f(codec, req_body);
        }
        intercepted
    }

    pub fn run_reply(&self, ret_code: i32, seq_id: u64, body: Option<&[u8]>) {
        let chain = self.reply.borrow().clone();
        for f in &chain {
            f(ret_code, seq_id, body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn or_reduction_runs_every_member() {
        let chains = Interceptors::new();
        let calls = Rc::new(Cell::new(0u32));

        let c1 = calls.clone();
        chains.add_recv(Rc::new(move |_, _| {
            c1.set(c1.get() + 1);
            false
        }));
        let c2 = calls.clone();
        chains.add_recv(Rc::new(move |_, _| {
            c2.set(c2.get() + 1);
            true
        }));
        let c3 = calls.clone();
        chains.add_recv(Rc::new(move |_, _| {
            c3.set(c3.get() + 1);
            false
        }));

        assert!(chains.run_recv(0, 0), "one true member intercepts");
        assert_eq!(calls.get(), 3, "later members still run");
    }

    #[test]
    fn reply_chain_is_onion_ordered() {
        let chains = Interceptors::new();
        let order: Rc<RefCell<Vec<u32>>> = Rc::default();
        for tag in [1u32, 2] {
            let o = order.clone();
            chains.add_reply(Rc::new(move |_, _, _| o.borrow_mut().push(tag)));
        }
        chains.run_reply(0, 1, None);
        assert_eq!(*order.borrow(), vec![2, 1], "last registered runs first");
    }
}
