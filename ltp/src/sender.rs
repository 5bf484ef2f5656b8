//! Sender-side session state machine.
//!
//! Pure protocol logic: given inputs (a block to send, received report
//! segments, timer expiries) it produces a list of [`Effect`]s for the
//! engine to carry out (write a segment, arm/disarm a timer, finish the
//! session). It owns no socket and no `Stakker` context, which keeps it
//! unit-testable without a running actor.

use std::ops::Range;
use std::time::Duration;

use collections::interval::IntervalSet;

use crate::config::EngineConfig;
use crate::segment::{CancelReason, CheckpointSerials, DataFlags, DataSegment, ReceptionClaim, ReportSegment, SessionId};
use crate::stats::EngineStats;
use crate::timer::TimerPurpose;

/// Something the engine must do as a result of driving the state machine.
pub enum Effect {
	Send(DataSegment),
	SendCancel(CancelReason),
	ArmTimer(TimerPurpose, Duration),
	DisarmTimer(TimerPurpose),
	Complete,
	Cancelled,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
enum Phase {
	Sending,
	AwaitingReports,
	CancelPending,
	Complete,
	Cancelled,
}

pub struct SessionSender {
	session: SessionId,
	client_service_id: u64,
	red_data: Vec<u8>,
	green_data: Vec<u8>,
	next_offset: u64,
	acked: IntervalSet,
	next_checkpoint_serial: u64,
	segments_since_checkpoint: u32,
	phase: Phase,
	pending_cancel_reason: CancelReason,
}

impl SessionSender {
	pub fn new(session: SessionId, client_service_id: u64, red_data: Vec<u8>, green_data: Vec<u8>) -> Self {
		Self {
			session,
			client_service_id,
			red_data,
			green_data,
			next_offset: 0,
			acked: IntervalSet::new(),
			next_checkpoint_serial: 1,
			segments_since_checkpoint: 0,
			phase: Phase::Sending,
			pending_cancel_reason: CancelReason::UserCancelled,
		}
	}

	pub fn session(&self) -> SessionId {
		self.session
	}

	fn total_len(&self) -> u64 {
		(self.red_data.len() + self.green_data.len()) as u64
	}

	fn red_len(&self) -> u64 {
		self.red_data.len() as u64
	}

	/// Emits data segments for the whole block, mtu-sized, in order. Called
	/// once per session; retransmission after this goes through
	/// [`Self::handle_report`] and [`Self::handle_checkpoint_timeout`].
	pub fn start(&mut self, cfg: &EngineConfig, stats: &EngineStats) -> Vec<Effect> {
		let mut effects = Vec::new();

		if self.total_len() == 0 {
			// Degenerate empty block: a single zero-length EOB segment closes it.
			let is_red = self.red_len() > 0;
			effects.push(self.make_segment(0, 0, is_red, true, true));
			self.phase = Phase::AwaitingReports;
			return effects;
		}

		while self.next_offset < self.total_len() {
			let is_red = self.next_offset < self.red_len();
			let remaining = if is_red { self.red_len() - self.next_offset } else { self.total_len() - self.next_offset };
			let len = remaining.min(cfg.mtu_client_service_data as u64);

			let at_red_end = is_red && self.next_offset + len == self.red_len();
			let at_block_end = self.next_offset + len == self.total_len();

			self.segments_since_checkpoint += 1;
			let discretionary = cfg.checkpoint_every_nth_data_packet > 0 && self.segments_since_checkpoint >= cfg.checkpoint_every_nth_data_packet;
			let checkpoint = is_red && (at_red_end || discretionary);

			if checkpoint {
				self.segments_since_checkpoint = 0;
			}

			effects.push(self.make_segment(self.next_offset, len, is_red, checkpoint && at_red_end, at_block_end && !is_red));

			if checkpoint {
				let serial = self.next_checkpoint_serial;
				self.next_checkpoint_serial += 1;
				EngineStats::inc(&stats.checkpoints_sent);
				effects.push(Effect::ArmTimer(TimerPurpose::Checkpoint(serial), cfg.retransmission_timeout()));
			}

			self.next_offset += len;
		}

		self.phase = Phase::AwaitingReports;
		effects
	}

	fn make_segment(&self, offset: u64, len: u64, is_red: bool, checkpoint: bool, end_of_block: bool) -> Effect {
		let data = if is_red { &self.red_data } else { &self.green_data };
		let local_offset = if is_red { offset } else { offset - self.red_len() };
		let payload = data[local_offset as usize..(local_offset + len) as usize].to_vec();

		let flags = DataFlags {
			checkpoint,
			end_of_red_part: checkpoint && offset + len == self.red_len(),
			end_of_block,
		};

		let checkpoint_serials = if checkpoint {
			Some(CheckpointSerials { checkpoint_serial: self.next_checkpoint_serial, report_serial: 0 })
		} else {
			None
		};

		Effect::Send(DataSegment {
			session: self.session,
			is_red,
			flags,
			client_service_id: self.client_service_id,
			offset,
			checkpoint: checkpoint_serials,
			payload,
		})
	}

	/// Applies an incoming report segment, returning gap retransmissions and
	/// a report-ack effect if the block isn't already fully claimed.
	pub fn handle_report(&mut self, cfg: &EngineConfig, report: &ReportSegment, stats: &EngineStats) -> Vec<Effect> {
		if !matches!(self.phase, Phase::Sending | Phase::AwaitingReports) {
			return Vec::new();
		}

		for claim in &report.claims {
			self.acked.insert(claim.offset..claim.offset + claim.length);
		}

		let mut effects = Vec::new();

		if report.checkpoint_serial != 0 {
			effects.push(Effect::DisarmTimer(TimerPurpose::Checkpoint(report.checkpoint_serial)));
		}

		let gaps = self.acked.gaps(report.lower_bound..report.upper_bound);

		if gaps.is_empty() && self.acked.covers(0..self.red_len()) {
			EngineStats::inc(&stats.num_deleted_fully_claimed_pending_reports);
			// Green data has no custody transfer and is already sent in full
			// during `start`; completion follows the red-part ack regardless
			// of whether green data accompanied it.
			self.phase = Phase::Complete;
			effects.push(Effect::Complete);
			return effects;
		}

		for gap in gaps {
			let serial = self.next_checkpoint_serial;
			self.next_checkpoint_serial += 1;

			effects.extend(self.fragment_retransmit(gap, serial, report.report_serial, cfg.mtu_client_service_data as u64));

			EngineStats::inc(&stats.checkpoints_retransmitted);
			effects.push(Effect::ArmTimer(TimerPurpose::Checkpoint(serial), cfg.retransmission_timeout()));
		}

		effects
	}

	/// A checkpoint's retransmission timer fired with no report seen yet.
	pub fn handle_checkpoint_timeout(&mut self, cfg: &EngineConfig, serial: u64, retries_so_far: u32, stats: &EngineStats) -> Vec<Effect> {
		if !matches!(self.phase, Phase::Sending | Phase::AwaitingReports) {
			return Vec::new();
		}

		if retries_so_far >= cfg.max_retries_per_serial_number {
			EngineStats::inc(&stats.checkpoint_retries_exhausted);
			self.phase = Phase::Cancelled;
			return vec![Effect::SendCancel(CancelReason::RetransmitLimitExceeded), Effect::Cancelled];
		}

		EngineStats::inc(&stats.checkpoints_retransmitted);

		// A checkpoint timeout means no report arrived at all for this round,
		// so resend whatever the acked set still shows as missing rather than
		// assuming the whole red part (an earlier, unrelated report may have
		// already claimed part of it without disarming this timer).
		let gaps = self.acked.gaps(0..self.red_len());
		let ranges: Vec<Range<u64>> = if gaps.is_empty() { vec![0..self.red_len()] } else { gaps };
		let mtu = cfg.mtu_client_service_data as u64;
		let last = ranges.len() - 1;

		let mut effects = Vec::new();
		for (i, range) in ranges.into_iter().enumerate() {
			if i == last {
				effects.extend(self.fragment_retransmit(range, serial, 0, mtu));
			} else {
				effects.extend(self.fragment_plain(range, mtu));
			}
		}

		effects.push(Effect::ArmTimer(TimerPurpose::Checkpoint(serial), cfg.retransmission_timeout()));
		effects
	}

	/// Fragments `range` of the red part by `mtu`. Only the final fragment
	/// carries the checkpoint flag and `serial`/`report_serial`; earlier
	/// fragments are plain data resends, since one timer retry should only
	/// solicit one new report.
	fn fragment_retransmit(&self, range: Range<u64>, serial: u64, report_serial: u64, mtu: u64) -> Vec<Effect> {
		let offsets = Self::mtu_offsets(&range, mtu);
		let last = offsets.len().saturating_sub(1);

		offsets
			.into_iter()
			.enumerate()
			.map(|(i, (offset, len))| {
				let checkpoint = i == last;
				let at_red_end = offset + len == self.red_len();

				Effect::Send(DataSegment {
					session: self.session,
					is_red: true,
					flags: DataFlags { checkpoint, end_of_red_part: checkpoint && at_red_end, end_of_block: checkpoint && at_red_end && self.green_data.is_empty() },
					client_service_id: self.client_service_id,
					offset,
					checkpoint: checkpoint.then_some(CheckpointSerials { checkpoint_serial: serial, report_serial }),
					payload: self.red_data[offset as usize..(offset + len) as usize].to_vec(),
				})
			})
			.collect()
	}

	/// Fragments `range` by `mtu` with no checkpoint at all, for the gaps
	/// that aren't the one carrying this round's checkpoint.
	fn fragment_plain(&self, range: Range<u64>, mtu: u64) -> Vec<Effect> {
		Self::mtu_offsets(&range, mtu)
			.into_iter()
			.map(|(offset, len)| {
				Effect::Send(DataSegment {
					session: self.session,
					is_red: true,
					flags: DataFlags::default(),
					client_service_id: self.client_service_id,
					offset,
					checkpoint: None,
					payload: self.red_data[offset as usize..(offset + len) as usize].to_vec(),
				})
			})
			.collect()
	}

	fn mtu_offsets(range: &Range<u64>, mtu: u64) -> Vec<(u64, u64)> {
		let mtu = mtu.max(1);
		let mut offsets = Vec::new();
		let mut offset = range.start;
		while offset < range.end {
			let len = (range.end - offset).min(mtu);
			offsets.push((offset, len));
			offset += len;
		}
		offsets
	}

	/// Starts a local cancellation, to be confirmed by the peer's cancel-ack.
	pub fn request_cancel(&mut self, cfg: &EngineConfig, reason: CancelReason, stats: &EngineStats) -> Vec<Effect> {
		if !matches!(self.phase, Phase::Sending | Phase::AwaitingReports) {
			return Vec::new();
		}

		self.phase = Phase::CancelPending;
		self.pending_cancel_reason = reason;
		EngineStats::inc(&stats.cancel_segments_sent);

		vec![Effect::SendCancel(reason), Effect::ArmTimer(TimerPurpose::CancelAck, cfg.retransmission_timeout())]
	}

	/// The peer acknowledged a cancel we requested.
	pub fn handle_cancel_ack(&mut self) -> Vec<Effect> {
		if self.phase != Phase::CancelPending {
			return Vec::new();
		}

		self.phase = Phase::Cancelled;
		vec![Effect::DisarmTimer(TimerPurpose::CancelAck), Effect::Cancelled]
	}

	/// No cancel-ack arrived before the retransmission timer fired.
	pub fn handle_cancel_ack_timeout(&mut self, cfg: &EngineConfig, retries_so_far: u32, stats: &EngineStats) -> Vec<Effect> {
		if self.phase != Phase::CancelPending {
			return Vec::new();
		}

		if retries_so_far >= cfg.max_retries_per_serial_number {
			EngineStats::inc(&stats.cancel_ack_retries_exhausted);
			self.phase = Phase::Cancelled;
			return vec![Effect::Cancelled];
		}

		EngineStats::inc(&stats.cancel_segments_retransmitted);
		vec![Effect::SendCancel(self.pending_cancel_reason), Effect::ArmTimer(TimerPurpose::CancelAck, cfg.retransmission_timeout())]
	}

	pub fn is_complete(&self) -> bool {
		self.phase == Phase::Complete
	}

	pub fn is_cancelled(&self) -> bool {
		self.phase == Phase::Cancelled
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn session() -> SessionId {
		SessionId { originator_engine_id: 1, session_number: 1 }
	}

	fn cfg() -> EngineConfig {
		EngineConfig { mtu_client_service_data: 4, checkpoint_every_nth_data_packet: 0, ..Default::default() }
	}

	#[test]
	fn small_red_only_block_emits_single_checkpointed_segment() {
		let mut sender = SessionSender::new(session(), 1, b"ab".to_vec(), Vec::new());
		let stats = EngineStats::new();
		let effects = sender.start(&cfg(), &stats);

		let sends: Vec<_> = effects.iter().filter_map(|e| if let Effect::Send(s) = e { Some(s) } else { None }).collect();
		assert_eq!(sends.len(), 1);
		assert!(sends[0].flags.checkpoint && sends[0].flags.end_of_red_part && sends[0].flags.end_of_block);
	}

	#[test]
	fn full_claim_report_completes_red_only_session() {
		let mut sender = SessionSender::new(session(), 1, b"ab".to_vec(), Vec::new());
		let stats = EngineStats::new();
		sender.start(&cfg(), &stats);

		let report = ReportSegment {
			session: session(),
			report_serial: 1,
			checkpoint_serial: 1,
			lower_bound: 0,
			upper_bound: 2,
			claims: vec![ReceptionClaim { offset: 0, length: 2 }],
		};

		let effects = sender.handle_report(&cfg(), &report, &stats);
		assert!(effects.iter().any(|e| matches!(e, Effect::Complete)));
		assert!(sender.is_complete());
	}

	#[test]
	fn partial_claim_triggers_gap_retransmission() {
		let mut sender = SessionSender::new(session(), 1, b"abcd".to_vec(), Vec::new());
		let stats = EngineStats::new();
		sender.start(&cfg(), &stats);

		let report = ReportSegment {
			session: session(),
			report_serial: 1,
			checkpoint_serial: 1,
			lower_bound: 0,
			upper_bound: 4,
			claims: vec![ReceptionClaim { offset: 0, length: 2 }],
		};

		let effects = sender.handle_report(&cfg(), &report, &stats);
		let sends: Vec<_> = effects.iter().filter_map(|e| if let Effect::Send(s) = e { Some(s) } else { None }).collect();
		assert_eq!(sends.len(), 1);
		assert_eq!(sends[0].offset, 2);
	}

	#[test]
	fn checkpoint_timeout_fragments_a_block_larger_than_one_mtu() {
		// mtu=4, an 10-byte red block unacked end to end: a checkpoint
		// timeout must resend it as 3 mtu-sized fragments, only the last one
		// (which also happens to reach the red end) carrying the checkpoint.
		let mut sender = SessionSender::new(session(), 1, b"0123456789".to_vec(), Vec::new());
		let stats = EngineStats::new();
		sender.start(&cfg(), &stats);

		let effects = sender.handle_checkpoint_timeout(&cfg(), 99, 0, &stats);
		let sends: Vec<_> = effects.iter().filter_map(|e| if let Effect::Send(s) = e { Some(s) } else { None }).collect();

		assert_eq!(sends.len(), 3);
		assert_eq!(sends.iter().map(|s| s.payload.len()).sum::<usize>(), 10);
		assert!(sends[..2].iter().all(|s| !s.flags.checkpoint));
		assert!(sends[2].flags.checkpoint && sends[2].flags.end_of_red_part);
		assert_eq!(sends[2].checkpoint.unwrap().checkpoint_serial, 99);
	}

	#[test]
	fn checkpoint_timeout_only_resends_what_a_partial_report_left_unclaimed() {
		let mut sender = SessionSender::new(session(), 1, b"0123456789".to_vec(), Vec::new());
		let stats = EngineStats::new();
		sender.start(&cfg(), &stats);

		// An async report (checkpoint_serial 0) claims the first half without
		// disarming whatever checkpoint timer is outstanding.
		sender.handle_report(
			&cfg(),
			&ReportSegment { session: session(), report_serial: 1, checkpoint_serial: 0, lower_bound: 0, upper_bound: 5, claims: vec![ReceptionClaim { offset: 0, length: 5 }] },
			&stats,
		);

		let effects = sender.handle_checkpoint_timeout(&cfg(), 99, 0, &stats);
		let sends: Vec<_> = effects.iter().filter_map(|e| if let Effect::Send(s) = e { Some(s) } else { None }).collect();

		assert_eq!(sends.iter().map(|s| s.offset).min(), Some(5));
		assert_eq!(sends.iter().map(|s| s.payload.len()).sum::<usize>(), 5);
	}

	#[test]
	fn cancel_request_is_confirmed_only_after_an_ack() {
		let mut sender = SessionSender::new(session(), 1, b"ab".to_vec(), Vec::new());
		let stats = EngineStats::new();
		sender.start(&cfg(), &stats);

		let effects = sender.request_cancel(&cfg(), CancelReason::UserCancelled, &stats);
		assert!(effects.iter().any(|e| matches!(e, Effect::SendCancel(CancelReason::UserCancelled))));
		assert!(!sender.is_cancelled());

		let effects = sender.handle_cancel_ack();
		assert!(effects.iter().any(|e| matches!(e, Effect::Cancelled)));
		assert!(sender.is_cancelled());
	}

	#[test]
	fn cancel_ack_timeout_gives_up_after_max_retries() {
		let mut sender = SessionSender::new(session(), 1, b"ab".to_vec(), Vec::new());
		let stats = EngineStats::new();
		sender.start(&cfg(), &stats);
		sender.request_cancel(&cfg(), CancelReason::UserCancelled, &stats);

		let effects = sender.handle_cancel_ack_timeout(&cfg(), cfg().max_retries_per_serial_number, &stats);
		assert!(effects.iter().any(|e| matches!(e, Effect::Cancelled)));
		assert!(sender.is_cancelled());
	}
}
