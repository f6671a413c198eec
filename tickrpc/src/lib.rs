//! tickrpc - a single-threaded, cooperative, tick-driven RPC runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ ServerLoop                 tick(now) / proc(now)               │
//! │  phase 0: pending-call timers, timed events                    │
//! │  phase 1: hooks, modules, service mesh    (min_on_proc floor)  │
//! │  phase 2: scheduler drain, transport pump (adaptive budget)    │
//! └──────────────┬─────────────────────────────────────────────────┘
//!                │
//! ┌──────────────▼─────────────────────────────────────────────────┐
//! │ Dispatcher                                                     │
//! │  decode → fingerprint → interceptors → request/response split  │
//! │  requests: scheduler or handler (task / callback mode)         │
//! │  responses: PendingTable::awake → continuation                 │
//! └──────┬──────────────┬──────────────┬───────────────────────────┘
//!        │              │              │
//!   Transport      PendingTable    Coroutine backend
//!  (Channel +      (seq_id rows    (FiberBackend or
//!   codecs +        + TimerWheel)   injected)
//!   Routing)
//! ```
//!
//! An engine instance is owned by one OS thread. Handlers either run to
//! completion (callback mode) or inside cooperative tasks that may block on
//! outgoing calls (task mode); either way exactly one activation runs at a
//! time, and every deadline comes from the loop-driven logical clock.
//!
//! Fixed-capacity state that must survive restart (the crash-fingerprint
//! record, scheduler buffers) lives in [`shmpool`] containers.

pub mod channel;
pub mod clock;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fiber;
pub mod fingerprint;
pub mod flags;
pub mod interceptor;
pub mod module;
pub mod pending;
pub mod routing;
pub mod scheduler;
pub mod seq;
pub mod server;
pub mod stats;
pub mod task;
pub mod timed;
pub mod timer;
pub mod transport;

pub use channel::{Channel, RecvSink};
pub use clock::{Clock, MonotonicTime, TimeSource};
pub use codec::{FrameHead, ReadCodec, RecvCodec, SendCodec, WriteCodec};
pub use config::{EngineOptions, FlowControl, FrameLimits};
pub use context::{ClientContext, CurrentContext, ServerContext};
pub use dispatch::{CallResult, Dispatcher, Handler, RpcOptions, WeakDispatcher};
pub use error::{Error, Result, RetCode};
pub use fiber::FiberBackend;
pub use fingerprint::CrashGuard;
pub use flags::FrameFlags;
pub use interceptor::Interceptors;
pub use module::{EngineModule, ModulePriority, ModuleRegistry};
pub use pending::{AsyncTask, PendingTable};
pub use routing::{Routing, ServiceMesh};
pub use scheduler::{FifoScheduler, Scheduler};
pub use seq::SeqGenerator;
pub use server::{LoopHooks, ServerLoop, TIMED_EVENT_TAG};
pub use stats::{cost_bucket, EngineCounters, RecvCmdInfo, SendCmdInfo, Statistics};
pub use task::{Coroutine, TaskHandle, WaitGroup};
pub use timed::{TimedEvents, TimedTask};
pub use timer::{TimerTask, TimerWheel};
pub use transport::{Transport, MAX_TRANSPORTS};
