//! Wire transports an engine can send segments over.
//!
//! An engine is generic over its transport: any type implementing
//! [`SegmentTransport`] can carry its segments, with no shared base type or
//! inheritance between the concrete transports.

mod encap;
mod shared_udp;
mod shm;
mod stream;
mod udp;

pub use encap::{read_frame, write_frame};
pub use shared_udp::{SharedUdpHandle, SharedUdpPort, SharedUdpPortDispatcher};
pub use shm::{ShmPoller, ShmTransport};
pub use stream::StreamTransport;
pub use udp::Transport;

/// The capability an [`crate::engine::LtpEngine`] needs from its transport:
/// write one already-encoded segment out. Inbound delivery isn't part of
/// this trait because it's push-based (a `Fwd` handed to the transport's
/// constructor, routed straight to the engine's own read entry point) and
/// varies in shape by transport (datagram vs. byte-stream vs. polled ring).
pub trait SegmentTransport {
	fn send(&self, segment: &[u8]);

	/// Splits one inbound chunk into zero or more complete segments.
	/// Datagram transports hand back the chunk unchanged (the default);
	/// byte-stream transports buffer and deframe.
	fn decode_frames(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
		vec![chunk.to_vec()]
	}
}
