//! Thin sender-side manager, grounded on the original architecture's
//! `OutductManager`: owns one engine per next-hop and forwards a
//! transmission request to the right one. No routing policy is applied —
//! the caller already knows which next hop it wants.

use std::collections::HashMap;

use stakker::{call, ActorOwn};

use crate::engine::LtpEngine;
use crate::transport::SegmentTransport;

/// Owns one send-only [`LtpEngine`] per next-hop engine id.
pub struct OutductManager<T: SegmentTransport + 'static> {
	engines: HashMap<u64, ActorOwn<LtpEngine<T>>>,
}

impl<T: SegmentTransport + 'static> Default for OutductManager<T> {
	fn default() -> Self {
		Self { engines: HashMap::new() }
	}
}

impl<T: SegmentTransport + 'static> OutductManager<T> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, next_hop_engine_id: u64, engine: ActorOwn<LtpEngine<T>>) {
		self.engines.insert(next_hop_engine_id, engine);
	}

	pub fn deregister(&mut self, next_hop_engine_id: u64) {
		self.engines.remove(&next_hop_engine_id);
	}

	/// Forwards a transmission request to the engine registered for
	/// `next_hop_engine_id`. Returns `false` (and the caller should treat
	/// this as a failed send) if no engine is registered for that next hop.
	pub fn forward(&self, next_hop_engine_id: u64, client_service_id: u64, red_data: Vec<u8>, green_data: Vec<u8>) -> bool {
		let Some(engine) = self.engines.get(&next_hop_engine_id) else {
			return false;
		};

		call!([engine], send(client_service_id, red_data, green_data));
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::Transport;

	#[test]
	fn forwarding_to_an_unregistered_next_hop_fails() {
		let manager: OutductManager<Transport> = OutductManager::new();
		assert!(!manager.forward(999, 1, Vec::new(), Vec::new()));
	}
}
