//! LTP segments carried over a connected Unix domain stream socket.
//!
//! Unlike UDP, a stream socket doesn't preserve datagram boundaries, so
//! each segment is wrapped in a CCSDS encapsulation frame and reassembled
//! from however many bytes a single read happens to return. Framing is
//! state threaded through [`SegmentTransport::decode_frames`] rather than a
//! read loop of its own: the engine that owns this transport drives the
//! socket through its own read forward and calls back in here to deframe.

use std::os::unix::net::UnixStream;

use collections::bytes::{Cursor, Slice};
use log::error;
use runtime::Io;
use stakker::Fwd;
use utils::error::*;

use super::encap::{read_frame, write_frame};

pub struct StreamTransport {
	link: Io<UnixStream>,
	pending: Vec<u8>,
}

impl StreamTransport {
	/// `read_fwd` should point at the owning engine's own read entry point;
	/// raw (unframed) chunks flow straight there, and the engine calls back
	/// into [`SegmentTransport::decode_frames`] to pull complete segments out.
	pub fn new(socket: UnixStream, read_fwd: Fwd<Slice>) -> Option<Self> {
		socket.set_nonblocking(true).ok_or(|err| error!("Failed to configure LTP IPC socket: {err}"))?;
		let link = Io::new(socket, read_fwd);

		Some(Self { link, pending: Vec::new() })
	}

	pub fn send(&self, segment: &[u8]) {
		let mut framed = Vec::with_capacity(segment.len() + 8);
		write_frame(segment, &mut framed);

		if self.link.write(|cur: Cursor| cur.push(framed.as_slice())).is_err() {
			error!("Failed to send LTP segment over IPC transport");
		}
	}
}

impl super::SegmentTransport for StreamTransport {
	fn send(&self, segment: &[u8]) {
		StreamTransport::send(self, segment)
	}

	fn decode_frames(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
		self.pending.extend_from_slice(chunk);

		let mut offset = 0;
		let mut segments = Vec::new();

		while let Some((payload, consumed)) = read_frame(&self.pending[offset..]) {
			segments.push(payload.to_vec());
			offset += consumed;
		}

		self.pending.drain(..offset);
		segments
	}
}

#[cfg(test)]
mod tests {
	use super::super::encap::write_frame;

	#[test]
	fn frames_split_across_reads_still_parse() {
		let mut framed = Vec::new();
		write_frame(b"hello", &mut framed);
		write_frame(b"world", &mut framed);

		let mut pending = framed[..3].to_vec();
		assert_eq!(super::super::encap::read_frame(&pending), None);

		pending.extend_from_slice(&framed[3..]);

		let mut offset = 0;
		let mut out = Vec::new();

		while let Some((payload, consumed)) = super::super::encap::read_frame(&pending[offset..]) {
			out.push(payload.to_vec());
			offset += consumed;
		}

		assert_eq!(out, vec![b"hello".to_vec(), b"world".to_vec()]);
	}
}
