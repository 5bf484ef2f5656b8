//! Session number generation.

use crate::segment::SessionId;

/// Generates a fresh session number for a session originated by `engine_id`,
/// with `engine_index` embedded in the low byte so a receiver→sender
/// segment can be routed back to this engine on a port shared with others.
///
/// Clearing/setting only the low byte of an already-32-bit-ranged random
/// value can't push it above `u32::MAX`, so this still honors `force_32_bit`.
pub fn generate(engine_id: u64, engine_index: u8, force_32_bit: bool) -> SessionId {
	let random = if force_32_bit { rand::random::<u32>() as u64 } else { rand::random::<u64>() };
	let session_number = (random & !0xff) | engine_index as u64;

	SessionId { originator_engine_id: engine_id, session_number }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn force_32_bit_stays_in_range() {
		for _ in 0..100 {
			let id = generate(1, 0x42, true);
			assert!(id.session_number <= u32::MAX as u64);
		}
	}

	#[test]
	fn carries_the_originator_engine_id() {
		let id = generate(99, 0, false);
		assert_eq!(id.originator_engine_id, 99);
	}

	#[test]
	fn embeds_the_engine_index_in_the_low_byte() {
		for _ in 0..100 {
			let id = generate(1, 0x7f, false);
			assert_eq!(id.session_number & 0xff, 0x7f);
		}
	}
}
