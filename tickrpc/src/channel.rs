//! Framed bidirectional wire contract.

/// Sink invoked per received frame: `(frame bytes, source id, arrived ms)`,
/// returning an error code (0 = ok).
pub type RecvSink<'a> = &'a mut dyn FnMut(&[u8], u32, u64) -> i32;

/// A bidirectional framed wire. Concrete drivers (sockets, shared-memory
/// channels) live outside the engine.
pub trait Channel {
    /// This endpoint's id.
    fn my_id(&self) -> u32;

    /// Sends one frame to `dest`. 0 on success, a driver-specific nonzero
    /// code on failure.
    fn send(&self, dest: u32, frame: &[u8]) -> i32;

    /// Drives reception: delivers up to `max_frames` frames into `sink` and
    /// returns how many were delivered.
    fn poll(&self, max_frames: u32, sink: RecvSink<'_>) -> u32;
}
