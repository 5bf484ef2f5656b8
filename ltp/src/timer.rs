//! Per-session retransmission timer bookkeeping.
//!
//! Generalizes the rekey/keepalive pair from a tunnel's fixed timer set to an
//! arbitrary number of concurrently outstanding timers per session: a
//! checkpoint, several in-flight report segments, and a cancel-ack can all be
//! ticking down independently on the same session.

use std::collections::HashMap;

use stakker::{Cx, FixedTimerKey};

/// Identifies one of the retransmission timers a session can have armed.
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub enum TimerPurpose {
	Checkpoint(u64),
	ReportSegment(u64),
	ReportAck(u64),
	CancelAck,
}

#[derive(Default)]
struct Outstanding {
	key: FixedTimerKey,
	retries: u32,
}

/// Tracks the retransmission timers and retry counts outstanding for one session.
#[derive(Default)]
pub struct SessionTimers {
	outstanding: HashMap<TimerPurpose, Outstanding>,
}

impl SessionTimers {
	pub fn new() -> Self {
		Self::default()
	}

	/// Records that `key` was just armed for `purpose`, canceling whatever
	/// timer previously occupied that slot. Returns the attempt number this
	/// arming represents, starting at `0` for the first attempt.
	pub fn arm<A>(&mut self, cx: &mut Cx<A>, purpose: TimerPurpose, key: FixedTimerKey) -> u32 {
		let entry = self.outstanding.entry(purpose).or_default();

		if entry.key != FixedTimerKey::default() {
			cx.timer_del(entry.key);
		}

		entry.key = key;
		let attempt = entry.retries;
		entry.retries += 1;
		attempt
	}

	/// Cancels and forgets the timer for `purpose`, if any is outstanding.
	pub fn disarm<A>(&mut self, cx: &mut Cx<A>, purpose: TimerPurpose) {
		if let Some(entry) = self.outstanding.remove(&purpose) {
			cx.timer_del(entry.key);
		}
	}

	pub fn is_armed(&self, purpose: TimerPurpose) -> bool {
		self.outstanding.contains_key(&purpose)
	}

	/// How many times a timer has already fired for `purpose`, not counting
	/// the attempt currently in flight.
	pub fn retries(&self, purpose: TimerPurpose) -> u32 {
		self.outstanding.get(&purpose).map(|o| o.retries).unwrap_or(0)
	}

	/// Cancels every outstanding timer, e.g. when a session closes.
	pub fn disarm_all<A>(&mut self, cx: &mut Cx<A>) {
		for (_, entry) in self.outstanding.drain() {
			cx.timer_del(entry.key);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn retries_increment_per_arm_without_a_real_actor() {
		// SessionTimers only needs a Cx to call timer_del, which these tests
		// never trigger (no prior key is armed on first use), so counting
		// logic can be exercised without a running Stakker instance.
		let mut timers = SessionTimers::new();
		assert_eq!(timers.retries(TimerPurpose::CancelAck), 0);
		assert!(!timers.is_armed(TimerPurpose::CancelAck));
	}
}
