//! Per-engine counters, incremented from the send/receive/timer paths and
//! read back without locking.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct EngineStats {
	pub segments_sent: AtomicU64,
	pub segments_received: AtomicU64,
	pub segments_dropped_malformed: AtomicU64,
	pub segments_dropped_wrong_engine: AtomicU64,

	pub sessions_started_as_sender: AtomicU64,
	pub sessions_started_as_receiver: AtomicU64,
	pub sessions_completed: AtomicU64,
	pub sessions_cancelled_by_local: AtomicU64,
	pub sessions_cancelled_by_remote: AtomicU64,

	pub checkpoints_sent: AtomicU64,
	pub checkpoints_retransmitted: AtomicU64,
	pub checkpoint_retries_exhausted: AtomicU64,

	pub cancel_segments_sent: AtomicU64,
	pub cancel_segments_retransmitted: AtomicU64,
	pub cancel_ack_retries_exhausted: AtomicU64,

	pub num_delayed_fully_claimed_primary_report_segments_sent: AtomicU64,
	pub num_delayed_partially_claimed_primary_report_segments_sent: AtomicU64,
	pub report_segments_sent: AtomicU64,
	pub report_segments_retransmitted: AtomicU64,
	pub report_segment_retries_exhausted: AtomicU64,
	pub num_report_segments_unable_to_be_issued: AtomicU64,
	pub num_deleted_fully_claimed_pending_reports: AtomicU64,

	pub report_acks_sent: AtomicU64,
	pub report_ack_retries_exhausted: AtomicU64,

	pub num_gaps_filled_by_out_of_order_data_segments: AtomicU64,
	pub red_bytes_received: AtomicU64,
	pub green_bytes_received: AtomicU64,
	pub red_bytes_sent: AtomicU64,
	pub green_bytes_sent: AtomicU64,

	pub rx_session_recreations_prevented: AtomicU64,
	pub rate_limited_sends_delayed: AtomicU64,
}

impl EngineStats {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn snapshot(&self) -> EngineStatsSnapshot {
		macro_rules! load {
			($field:ident) => {
				self.$field.load(Ordering::Relaxed)
			};
		}

		EngineStatsSnapshot {
			segments_sent: load!(segments_sent),
			segments_received: load!(segments_received),
			segments_dropped_malformed: load!(segments_dropped_malformed),
			segments_dropped_wrong_engine: load!(segments_dropped_wrong_engine),
			sessions_started_as_sender: load!(sessions_started_as_sender),
			sessions_started_as_receiver: load!(sessions_started_as_receiver),
			sessions_completed: load!(sessions_completed),
			sessions_cancelled_by_local: load!(sessions_cancelled_by_local),
			sessions_cancelled_by_remote: load!(sessions_cancelled_by_remote),
			checkpoints_sent: load!(checkpoints_sent),
			checkpoints_retransmitted: load!(checkpoints_retransmitted),
			checkpoint_retries_exhausted: load!(checkpoint_retries_exhausted),
			cancel_segments_sent: load!(cancel_segments_sent),
			cancel_segments_retransmitted: load!(cancel_segments_retransmitted),
			cancel_ack_retries_exhausted: load!(cancel_ack_retries_exhausted),
			num_delayed_fully_claimed_primary_report_segments_sent: load!(num_delayed_fully_claimed_primary_report_segments_sent),
			num_delayed_partially_claimed_primary_report_segments_sent: load!(num_delayed_partially_claimed_primary_report_segments_sent),
			report_segments_sent: load!(report_segments_sent),
			report_segments_retransmitted: load!(report_segments_retransmitted),
			report_segment_retries_exhausted: load!(report_segment_retries_exhausted),
			num_report_segments_unable_to_be_issued: load!(num_report_segments_unable_to_be_issued),
			num_deleted_fully_claimed_pending_reports: load!(num_deleted_fully_claimed_pending_reports),
			report_acks_sent: load!(report_acks_sent),
			report_ack_retries_exhausted: load!(report_ack_retries_exhausted),
			num_gaps_filled_by_out_of_order_data_segments: load!(num_gaps_filled_by_out_of_order_data_segments),
			red_bytes_received: load!(red_bytes_received),
			green_bytes_received: load!(green_bytes_received),
			red_bytes_sent: load!(red_bytes_sent),
			green_bytes_sent: load!(green_bytes_sent),
			rx_session_recreations_prevented: load!(rx_session_recreations_prevented),
			rate_limited_sends_delayed: load!(rate_limited_sends_delayed),
		}
	}

	#[inline]
	pub fn inc(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn add(counter: &AtomicU64, n: u64) {
		counter.fetch_add(n, Ordering::Relaxed);
	}
}

/// A point-in-time copy of [`EngineStats`], suitable for logging or a status RPC.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStatsSnapshot {
	pub segments_sent: u64,
	pub segments_received: u64,
	pub segments_dropped_malformed: u64,
	pub segments_dropped_wrong_engine: u64,
	pub sessions_started_as_sender: u64,
	pub sessions_started_as_receiver: u64,
	pub sessions_completed: u64,
	pub sessions_cancelled_by_local: u64,
	pub sessions_cancelled_by_remote: u64,
	pub checkpoints_sent: u64,
	pub checkpoints_retransmitted: u64,
	pub checkpoint_retries_exhausted: u64,
	pub cancel_segments_sent: u64,
	pub cancel_segments_retransmitted: u64,
	pub cancel_ack_retries_exhausted: u64,
	pub num_delayed_fully_claimed_primary_report_segments_sent: u64,
	pub num_delayed_partially_claimed_primary_report_segments_sent: u64,
	pub report_segments_sent: u64,
	pub report_segments_retransmitted: u64,
	pub report_segment_retries_exhausted: u64,
	pub num_report_segments_unable_to_be_issued: u64,
	pub num_deleted_fully_claimed_pending_reports: u64,
	pub report_acks_sent: u64,
	pub report_ack_retries_exhausted: u64,
	pub num_gaps_filled_by_out_of_order_data_segments: u64,
	pub red_bytes_received: u64,
	pub green_bytes_received: u64,
	pub red_bytes_sent: u64,
	pub green_bytes_sent: u64,
	pub rx_session_recreations_prevented: u64,
	pub rate_limited_sends_delayed: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn snapshot_reflects_increments() {
		let stats = EngineStats::new();
		EngineStats::inc(&stats.segments_sent);
		EngineStats::add(&stats.red_bytes_sent, 1024);
		let snap = stats.snapshot();
		assert_eq!(snap.segments_sent, 1);
		assert_eq!(snap.red_bytes_sent, 1024);
	}
}
