//! Shared-memory-style transport for two co-located engines.
//!
//! The real IPC binding this stands in for uses a pair of named shared
//! memory segments and `has_free_space`/`has_data` semaphores per
//! direction. Cross-process shared memory has no counterpart anywhere in
//! this workspace's dependency stack, so this binds the same contract —
//! a bounded ring with blocking-free producer/consumer handoff — to a
//! single process via `std::sync`, which is sufficient for the
//! benchmarking / co-located-engines use this binding is scoped to.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use collections::bytes::Slice;
use stakker::{fwd, Fwd, CX};

struct Ring {
	slots: Mutex<VecDeque<Vec<u8>>>,
	has_data: Condvar,
	has_free_space: Condvar,
	capacity: usize,
}

impl Ring {
	fn new(capacity: usize) -> Self {
		Self { slots: Mutex::new(VecDeque::with_capacity(capacity)), has_data: Condvar::new(), has_free_space: Condvar::new(), capacity }
	}

	fn push(&self, packet: Vec<u8>) {
		let mut slots = self.slots.lock().expect("shm ring mutex poisoned");

		while slots.len() >= self.capacity {
			slots = self.has_free_space.wait(slots).expect("shm ring mutex poisoned");
		}

		slots.push_back(packet);
		self.has_data.notify_one();
	}

	fn pop(&self) -> Vec<u8> {
		let mut slots = self.slots.lock().expect("shm ring mutex poisoned");

		while slots.is_empty() {
			slots = self.has_data.wait(slots).expect("shm ring mutex poisoned");
		}

		let packet = slots.pop_front().expect("checked non-empty above");
		self.has_free_space.notify_one();
		packet
	}

	fn try_pop(&self) -> Option<Vec<u8>> {
		let mut slots = self.slots.lock().expect("shm ring mutex poisoned");
		let packet = slots.pop_front();

		if packet.is_some() {
			self.has_free_space.notify_one();
		}

		packet
	}
}

/// One direction's worth of the shared-memory binding. A pair of these,
/// cross-wired, connects two co-located engines.
pub struct ShmTransport {
	tx: Arc<Ring>,
	rx: Arc<Ring>,
}

impl ShmTransport {
	/// Builds a cross-wired pair: `a`'s tx ring is `b`'s rx ring and vice versa.
	pub fn pair(capacity: usize) -> (Self, Self) {
		let left = Arc::new(Ring::new(capacity));
		let right = Arc::new(Ring::new(capacity));

		(Self { tx: left.clone(), rx: right.clone() }, Self { tx: right, rx: left })
	}

	pub fn send_one(&self, packet: &[u8]) {
		self.tx.push(packet.to_vec());
	}

	pub fn send_many(&self, batch: &[&[u8]]) {
		for packet in batch {
			self.send_one(packet);
		}
	}

	/// Blocks until a packet is available.
	pub fn recv_blocking(&self) -> Vec<u8> {
		self.rx.pop()
	}

	/// Drains whatever is already queued without blocking.
	pub fn try_recv(&self) -> Option<Vec<u8>> {
		self.rx.try_pop()
	}
}

impl super::SegmentTransport for ShmTransport {
	fn send(&self, segment: &[u8]) {
		self.send_one(segment);
	}
}

/// `ShmTransport` has no reactor integration of its own (its ring is plain
/// `std::sync`, polled, not pushed), so this bridges it to the push-based
/// `Fwd` an engine's read path expects: a `Stakker` timer drains whatever's
/// queued and forwards each packet on.
pub struct ShmPoller {
	transport: ShmTransport,
	read_fwd: Fwd<Slice>,
	interval: Duration,
}

impl ShmPoller {
	pub fn init(cx: CX![], transport: ShmTransport, read_fwd: Fwd<Slice>, interval: Duration) -> Option<Self> {
		let mut this = Self { transport, read_fwd, interval };
		this.schedule(cx);
		Some(this)
	}

	fn schedule(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(self.interval, move |s| actor.apply(s, move |this, cx| this.tick(cx)));
	}

	fn tick(&mut self, cx: CX![]) {
		while let Some(packet) = self.transport.try_recv() {
			let mut slice = Slice::new(packet.len());
			slice.copy_from_slice(&packet);
			fwd!([self.read_fwd], slice);
		}

		self.schedule(cx);
	}
}

#[cfg(test)]
mod tests {
	use std::thread;
	use std::time::Duration;

	use super::*;

	#[test]
	fn packets_cross_from_one_side_to_the_other() {
		let (a, b) = ShmTransport::pair(4);

		a.send_one(b"hello");
		assert_eq!(b.recv_blocking(), b"hello");

		b.send_one(b"world");
		assert_eq!(a.recv_blocking(), b"world");
	}

	#[test]
	fn producer_blocks_until_consumer_drains_a_full_ring() {
		let (a, b) = ShmTransport::pair(1);

		a.send_one(b"first");

		let a = Arc::new(a);
		let a_writer = a.clone();

		let writer = thread::spawn(move || a_writer.send_one(b"second"));

		thread::sleep(Duration::from_millis(20));
		assert_eq!(b.recv_blocking(), b"first");

		writer.join().unwrap();
		assert_eq!(b.recv_blocking(), b"second");
	}

	#[test]
	fn try_recv_does_not_block_on_empty_ring() {
		let (_a, b) = ShmTransport::pair(4);
		assert_eq!(b.try_recv(), None);
	}
}
