use std::net::{SocketAddr, UdpSocket};

use collections::bytes::{Cursor, Slice};
use log::error;
use runtime::Io;
use stakker::Fwd;
use utils::error::*;

/// A connected UDP socket carrying one engine's segments to its single
/// configured remote engine.
pub struct Transport {
	link: Io<UdpSocket>,
}

impl Transport {
	pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, read_fwd: Fwd<Slice>) -> Option<Self> {
		let socket: std::io::Result<UdpSocket> = try {
			let socket = UdpSocket::bind(local_addr)?;
			socket.set_nonblocking(true)?;
			socket.connect(remote_addr)?;
			socket
		};

		let socket = socket.ok_or(|err| error!("Failed to create LTP transport socket: {err}"))?;
		let link = Io::new(socket, read_fwd);

		Some(Self { link })
	}

	/// Writes one segment, silently dropping it if the socket would block
	/// beyond what the kernel send buffer can hold (retransmission is the
	/// session layer's job, not the transport's).
	pub fn send(&self, segment: &[u8]) {
		if self.link.write(|cur: Cursor| cur.push(segment)).is_err() {
			error!("Failed to send LTP segment");
		}
	}
}

impl super::SegmentTransport for Transport {
	fn send(&self, segment: &[u8]) {
		Transport::send(self, segment)
	}
}
