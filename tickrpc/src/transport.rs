//! Transport: the (channel, recv codec, send codec, routing) quadruple.

use std::cell::RefCell;

use crate::channel::Channel;
use crate::codec::{RecvCodec, SendCodec};
use crate::error::RetCode;
use crate::routing::Routing;

/// Upper bound on transports per engine.
pub const MAX_TRANSPORTS: u32 = 10;

/// One wire attachment of the engine. The codecs sit behind `RefCell`
/// because the dispatcher stages frames into them while the transport is
/// shared; borrows are confined to single encode/decode windows.
pub struct Transport {
    pub channel: Box<dyn Channel>,
    pub recv_codec: RefCell<Box<dyn RecvCodec>>,
    pub send_codec: RefCell<Box<dyn SendCodec>>,
    pub routing: Option<Box<dyn Routing>>,
}

impl Transport {
    pub fn new(
        channel: Box<dyn Channel>,
        recv_codec: Box<dyn RecvCodec>,
        send_codec: Box<dyn SendCodec>,
        routing: Option<Box<dyn Routing>>,
    ) -> Self {
        Self {
            channel,
            recv_codec: RefCell::new(recv_codec),
            send_codec: RefCell::new(send_codec),
            routing,
        }
    }

    /// Unicasts the frame currently encoded in the send codec. The
    /// destination hint is resolved through routing when one is attached.
    pub fn send_encoded(&self) -> i32 {
        let codec = self.send_codec.borrow();
        self.send_frame(&**codec, codec.dst())
    }

    /// Broadcasts the frame currently encoded in the send codec to every
    /// routed destination.
    pub fn broadcast_encoded(&self) -> i32 {
        let codec = self.send_codec.borrow();
        self.broadcast_frame(&**codec, codec.dst())
    }

    fn send_frame(&self, codec: &dyn SendCodec, mut dst: u32) -> i32 {
        if let Some(routing) = &self.routing {
            dst = routing.send_dest(codec.svr_type(), codec.gid(), dst, codec.version());
            if dst == 0 {
                return RetCode::RouterFindDstError.value();
            }
        }

        let frame = match codec.raw() {
            Some(frame) => frame,
            None => return RetCode::SystemError.value(),
        };
        if self.channel.send(dst, frame) != 0 {
            return RetCode::ChannelSendError.value();
        }
        RetCode::Success.value()
    }

    fn broadcast_frame(&self, codec: &dyn SendCodec, world_id: u32) -> i32 {
        let routing = match &self.routing {
            Some(routing) => routing,
            None => return RetCode::RouterFindDstError.value(),
        };
        let dests = routing.all_send_dest(codec.svr_type(), world_id, codec.version());
        if dests.is_empty() {
            return RetCode::RouterFindDstError.value();
        }

        let frame = match codec.raw() {
            Some(frame) => frame,
            None => return RetCode::SystemError.value(),
        };
        for dest in dests {
            // Best effort per destination, as broadcast semantics demand.
            let _ = self.channel.send(dest, frame);
        }
        RetCode::Success.value()
    }
}
