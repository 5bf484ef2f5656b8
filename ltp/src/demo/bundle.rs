//! A length-prefixed opaque payload, treated as "the block" in place of a
//! real bundle codec. No custody, no CBOR, no BPv7 — just enough framing
//! for integration tests to hand the engine something block-shaped and
//! get the same bytes back out.

/// Wraps `payload` with a 4-byte big-endian length prefix.
pub fn wrap(payload: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(payload.len() + 4);
	out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
	out.extend_from_slice(payload);
	out
}

/// Strips the length prefix written by [`wrap`]. Returns `None` if `block`
/// is shorter than its declared length.
pub fn unwrap(block: &[u8]) -> Option<&[u8]> {
	let (len_bytes, rest) = block.split_at_checked(4)?;
	let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
	(rest.len() >= len).then(|| &rest[..len])
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wrap_unwrap_roundtrips() {
		let payload = b"The quick brown fox jumps over the lazy dog!";
		let wrapped = wrap(payload);
		assert_eq!(unwrap(&wrapped), Some(payload.as_slice()));
	}

	#[test]
	fn truncated_block_is_rejected() {
		let mut wrapped = wrap(b"hello");
		wrapped.truncate(wrapped.len() - 1);
		assert_eq!(unwrap(&wrapped), None);
	}
}
