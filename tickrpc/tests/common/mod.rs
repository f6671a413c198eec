//! Shared test fixtures: a fixed-layout frame codec, a loopback channel,
//! static routing, and a hand-advanced time source.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use tickrpc::{
    Channel, EngineOptions, FrameFlags, FrameHead, ReadCodec, RecvCodec, RecvSink, Routing,
    SendCodec, ServerLoop, TimeSource, Transport, WriteCodec,
};

/// Fixed little-endian header: cmd, svr_type, gid, seq_id, src, dst,
/// timeout, ret_code, version, flags, body_len.
pub const HEADER_LEN: usize = 54;
pub const MAX_BODY: usize = 1024;

pub fn encode_frame(head: &FrameHead, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&head.cmd.to_le_bytes());
    out.extend_from_slice(&head.svr_type.to_le_bytes());
    out.extend_from_slice(&head.gid.to_le_bytes());
    out.extend_from_slice(&head.seq_id.to_le_bytes());
    out.extend_from_slice(&head.src.to_le_bytes());
    out.extend_from_slice(&head.dst.to_le_bytes());
    out.extend_from_slice(&head.timeout.to_le_bytes());
    out.extend_from_slice(&head.ret_code.to_le_bytes());
    out.extend_from_slice(&head.version.to_le_bytes());
    out.extend_from_slice(&head.flags.bits().to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_frame(data: &[u8]) -> Option<(FrameHead, Vec<u8>)> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let head = FrameHead {
        cmd: u32::from_le_bytes(data[0..4].try_into().ok()?),
        svr_type: u32::from_le_bytes(data[4..8].try_into().ok()?),
        gid: u64::from_le_bytes(data[8..16].try_into().ok()?),
        seq_id: u64::from_le_bytes(data[16..24].try_into().ok()?),
        src: u32::from_le_bytes(data[24..28].try_into().ok()?),
        dst: u32::from_le_bytes(data[28..32].try_into().ok()?),
        timeout: u64::from_le_bytes(data[32..40].try_into().ok()?),
        ret_code: i32::from_le_bytes(data[40..44].try_into().ok()?),
        version: u32::from_le_bytes(data[44..48].try_into().ok()?),
        flags: FrameFlags::from_bits_truncate(u16::from_le_bytes(data[48..50].try_into().ok()?)),
        body_len: u32::from_le_bytes(data[50..54].try_into().ok()?),
    };
    let body_len = head.body_len as usize;
    if data.len() < HEADER_LEN + body_len {
        return None;
    }
    Some((head, data[HEADER_LEN..HEADER_LEN + body_len].to_vec()))
}

/// Decoder half of the test transport.
#[derive(Default)]
pub struct TestRecvCodec {
    head: FrameHead,
    body: Vec<u8>,
    decoded: bool,
}

impl ReadCodec for TestRecvCodec {
    fn cmd(&self) -> u32 {
        self.head.cmd
    }
    fn svr_type(&self) -> u32 {
        self.head.svr_type
    }
    fn gid(&self) -> u64 {
        self.head.gid
    }
    fn seq_id(&self) -> u64 {
        self.head.seq_id
    }
    fn src(&self) -> u32 {
        self.head.src
    }
    fn dst(&self) -> u32 {
        self.head.dst
    }
    fn timeout(&self) -> u64 {
        self.head.timeout
    }
    fn ret_code(&self) -> i32 {
        self.head.ret_code
    }
    fn version(&self) -> u32 {
        self.head.version
    }
    fn flags(&self) -> FrameFlags {
        self.head.flags
    }
    fn body_len(&self) -> u32 {
        self.body.len() as u32
    }
    fn body(&self) -> &[u8] {
        &self.body
    }
    fn raw(&self) -> Option<&[u8]> {
        None
    }
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl RecvCodec for TestRecvCodec {
    fn decode(&mut self, data: &[u8]) -> bool {
        match decode_frame(data) {
            Some((head, body)) => {
                self.head = head;
                self.body = body;
                self.decoded = true;
                true
            }
            None => false,
        }
    }

    fn has_decoded(&self) -> bool {
        self.decoded
    }
}

/// Encoder half of the test transport.
pub struct TestSendCodec {
    head: FrameHead,
    body: Box<[u8; MAX_BODY]>,
    body_len: usize,
    frame: Vec<u8>,
    encoded: bool,
}

impl Default for TestSendCodec {
    fn default() -> Self {
        Self {
            head: FrameHead::default(),
            body: Box::new([0u8; MAX_BODY]),
            body_len: 0,
            frame: Vec::new(),
            encoded: false,
        }
    }
}

impl ReadCodec for TestSendCodec {
    fn cmd(&self) -> u32 {
        self.head.cmd
    }
    fn svr_type(&self) -> u32 {
        self.head.svr_type
    }
    fn gid(&self) -> u64 {
        self.head.gid
    }
    fn seq_id(&self) -> u64 {
        self.head.seq_id
    }
    fn src(&self) -> u32 {
        self.head.src
    }
    fn dst(&self) -> u32 {
        self.head.dst
    }
    fn timeout(&self) -> u64 {
        self.head.timeout
    }
    fn ret_code(&self) -> i32 {
        self.head.ret_code
    }
    fn version(&self) -> u32 {
        self.head.version
    }
    fn flags(&self) -> FrameFlags {
        self.head.flags
    }
    fn body_len(&self) -> u32 {
        self.body_len as u32
    }
    fn body(&self) -> &[u8] {
        &self.body[..self.body_len]
    }
    fn raw(&self) -> Option<&[u8]> {
        if self.encoded {
            Some(&self.frame)
        } else {
            None
        }
    }
    fn reset(&mut self) {
        self.head = FrameHead::default();
        self.body_len = 0;
        self.frame.clear();
        self.encoded = false;
    }
}

impl WriteCodec for TestSendCodec {
    fn set_cmd(&mut self, cmd: u32) {
        self.head.cmd = cmd;
    }
    fn set_svr_type(&mut self, svr_type: u32) {
        self.head.svr_type = svr_type;
    }
    fn set_gid(&mut self, gid: u64) {
        self.head.gid = gid;
    }
    fn set_seq_id(&mut self, seq_id: u64) {
        self.head.seq_id = seq_id;
    }
    fn set_src(&mut self, src: u32) {
        self.head.src = src;
    }
    fn set_dst(&mut self, dst: u32) {
        self.head.dst = dst;
    }
    fn set_timeout(&mut self, deadline_ms: u64) {
        self.head.timeout = deadline_ms;
    }
    fn set_ret_code(&mut self, ret_code: i32) {
        self.head.ret_code = ret_code;
    }
    fn set_version(&mut self, version: u32) {
        self.head.version = version;
    }
    fn set_flags(&mut self, flags: FrameFlags) {
        self.head.flags = flags;
    }
    fn body_buf(&mut self) -> &mut [u8] {
        &mut self.body[..]
    }
    fn set_body_len(&mut self, len: u32) -> bool {
        if len as usize > MAX_BODY {
            return false;
        }
        self.body_len = len as usize;
        true
    }
    fn set_body(&mut self, data: &[u8]) -> bool {
        if data.len() > MAX_BODY {
            return false;
        }
        self.body[..data.len()].copy_from_slice(data);
        self.body_len = data.len();
        true
    }
}

impl SendCodec for TestSendCodec {
    fn encode(&mut self) -> Option<usize> {
        let mut head = self.head;
        head.body_len = self.body_len as u32;
        self.frame = encode_frame(&head, &self.body[..self.body_len]);
        self.encoded = true;
        Some(self.frame.len())
    }

    fn has_encoded(&self) -> bool {
        self.encoded
    }
}

pub type Inbox = Rc<RefCell<VecDeque<(Vec<u8>, u32, u64)>>>;
pub type Outbox = Rc<RefCell<Vec<(u32, Vec<u8>)>>>;

/// In-memory channel: tests stuff the inbox and inspect the outbox.
pub struct LoopbackChannel {
    id: u32,
    inbox: Inbox,
    outbox: Outbox,
}

impl LoopbackChannel {
    pub fn new(id: u32) -> (Self, Inbox, Outbox) {
        let inbox: Inbox = Rc::default();
        let outbox: Outbox = Rc::default();
        (Self { id, inbox: inbox.clone(), outbox: outbox.clone() }, inbox, outbox)
    }
}

impl Channel for LoopbackChannel {
    fn my_id(&self) -> u32 {
        self.id
    }

    fn send(&self, dest: u32, frame: &[u8]) -> i32 {
        self.outbox.borrow_mut().push((dest, frame.to_vec()));
        0
    }

    fn poll(&self, max_frames: u32, sink: RecvSink<'_>) -> u32 {
        let mut delivered = 0u32;
        while delivered < max_frames {
            let next = self.inbox.borrow_mut().pop_front();
            match next {
                Some((frame, src, arrived)) => {
                    sink(&frame, src, arrived);
                    delivered += 1;
                }
                None => break,
            }
        }
        delivered
    }
}

/// Routing over a fixed table; a nonzero hint wins.
#[derive(Default)]
pub struct StaticRouting {
    routes: RefCell<HashMap<u32, Vec<u32>>>,
}

impl Routing for StaticRouting {
    fn add_route(&self, svr_type: u32, node_id: u32, _version: u32) {
        self.routes.borrow_mut().entry(svr_type).or_default().push(node_id);
    }

    fn del_route(&self, svr_type: u32, node_id: u32) {
        if let Some(nodes) = self.routes.borrow_mut().get_mut(&svr_type) {
            nodes.retain(|&n| n != node_id);
        }
    }

    fn is_node_exist(&self, node_id: u32, svr_type: u32) -> bool {
        self.routes.borrow().get(&svr_type).is_some_and(|nodes| nodes.contains(&node_id))
    }

    fn node_num(&self, svr_type: u32, _version: u32) -> usize {
        self.routes.borrow().get(&svr_type).map_or(0, Vec::len)
    }

    fn send_dest(&self, svr_type: u32, _gid: u64, expect_dest: u32, _version: u32) -> u32 {
        if expect_dest != 0 {
            return expect_dest;
        }
        self.routes.borrow().get(&svr_type).and_then(|nodes| nodes.first().copied()).unwrap_or(0)
    }

    fn all_send_dest(&self, svr_type: u32, _world_id: u32, _version: u32) -> Vec<u32> {
        self.routes.borrow().get(&svr_type).cloned().unwrap_or_default()
    }

    fn clear(&self) {
        self.routes.borrow_mut().clear();
    }
}

/// Hand-advanced time source for phase accounting.
#[derive(Default)]
pub struct FakeTime {
    ms: Cell<u64>,
}

impl FakeTime {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn advance(&self, ms: u64) {
        self.ms.set(self.ms.get() + ms);
    }
}

impl TimeSource for FakeTime {
    fn now_ms(&self) -> u64 {
        self.ms.get()
    }
}

/// An engine wired to one loopback transport (index 0, endpoint id 1).
pub struct TestEnv {
    pub engine: ServerLoop,
    pub inbox: Inbox,
    pub outbox: Outbox,
}

pub const LOCAL_ID: u32 = 1;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn build_engine(options: EngineOptions) -> TestEnv {
    init_tracing();
    let mut engine = ServerLoop::new(options).expect("options validate");
    let (channel, inbox, outbox) = LoopbackChannel::new(LOCAL_ID);
    let transport = Transport::new(
        Box::new(channel),
        Box::new(TestRecvCodec::default()),
        Box::new(TestSendCodec::default()),
        None,
    );
    engine.add_transport(0, transport, true).expect("slot 0 free");
    TestEnv { engine, inbox, outbox }
}

/// Queues an inbound request frame.
pub fn push_request(env: &TestEnv, head: FrameHead, body: &[u8], arrived_ms: u64) {
    env.inbox.borrow_mut().push_back((encode_frame(&head, body), head.src, arrived_ms));
}

/// Decodes every frame the engine sent so far.
pub fn sent_frames(env: &TestEnv) -> Vec<(u32, FrameHead, Vec<u8>)> {
    env.outbox
        .borrow()
        .iter()
        .map(|(dest, frame)| {
            let (head, body) = decode_frame(frame).expect("well-formed frame");
            (*dest, head, body)
        })
        .collect()
}
