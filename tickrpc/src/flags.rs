//! Frame flag bits carried in every codec header.

use bitflags::bitflags;

bitflags! {
    /// u16 flag bitset carried on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        /// This frame is a reply.
        const RSP = 0x0001;
        /// The receiver must not send a reply.
        const DONT_RSP = 0x0002;
        /// The frame entered through the client access layer.
        const FROM_CLIENT = 0x0004;
        /// Broadcast frame.
        const BROADCAST = 0x0008;
        /// Client-critical frame.
        const CLIENT_KEY = 0x0010;
        /// Server-critical frame.
        const SVR_KEY = 0x0020;
        /// Intra-service forward.
        const FORWARD = 0x0040;
    }
}
