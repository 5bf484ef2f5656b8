//! Receiver-side session state machine.
//!
//! Pure protocol logic, mirroring [`crate::sender::SessionSender`]'s split
//! between state and effects: no socket, no `Stakker` context.

use std::collections::HashMap;
use std::time::Duration;

use collections::interval::IntervalSet;

use crate::config::EngineConfig;
use crate::segment::{CancelReason, DataSegment, ReceptionClaim, ReportSegment, SessionId};
use crate::stats::EngineStats;
use crate::timer::TimerPurpose;

pub enum Effect {
	SendReport(ReportSegment),
	SendCancel(CancelReason),
	SendCancelAck,
	ArmTimer(TimerPurpose, Duration),
	DisarmTimer(TimerPurpose),
	DeliverGreen(Vec<u8>),
	DeliverRed(Vec<u8>),
	SessionClosed,
	Cancelled,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
enum Phase {
	Receiving,
	Delivered,
	CancelPending,
	Cancelled,
}

pub struct SessionReceiver {
	session: SessionId,
	client_service_id: u64,
	received: IntervalSet,
	buffer: Vec<u8>,
	red_length: Option<u64>,
	next_report_serial: u64,
	sent_reports: HashMap<u64, ReportSegment>,
	phase: Phase,
	pending_cancel_reason: CancelReason,
}

impl SessionReceiver {
	pub fn new(session: SessionId, client_service_id: u64, estimated_bytes: usize) -> Self {
		Self {
			session,
			client_service_id,
			received: IntervalSet::new(),
			buffer: vec![0u8; estimated_bytes],
			red_length: None,
			next_report_serial: 1,
			sent_reports: HashMap::new(),
			phase: Phase::Receiving,
			pending_cancel_reason: CancelReason::UserCancelled,
		}
	}

	pub fn session(&self) -> SessionId {
		self.session
	}

	fn ensure_capacity(&mut self, end: u64) {
		if end as usize > self.buffer.len() {
			self.buffer.resize(end as usize, 0);
		}
	}

	/// The session has delivered its red part and has no report still
	/// awaiting an ack from the sender; safe to tear down.
	fn fully_settled(&self) -> bool {
		self.phase == Phase::Delivered && self.sent_reports.is_empty()
	}

	/// Handles one inbound data segment, red or green.
	pub fn handle_data(&mut self, cfg: &EngineConfig, seg: &DataSegment, stats: &EngineStats) -> Vec<Effect> {
		if self.phase != Phase::Receiving {
			return Vec::new();
		}

		if !seg.is_red {
			EngineStats::add(&stats.green_bytes_received, seg.payload.len() as u64);
			return vec![Effect::DeliverGreen(seg.payload.clone())];
		}

		let end = seg.offset + seg.payload.len() as u64;

		if end > cfg.max_red_rx_bytes_per_session {
			return vec![Effect::SendCancelAck, Effect::Cancelled];
		}

		let already_had = self.received.covers(seg.offset..end);

		if !already_had {
			self.ensure_capacity(end);
			self.buffer[seg.offset as usize..end as usize].copy_from_slice(&seg.payload);
			self.received.insert(seg.offset..end);
			EngineStats::add(&stats.red_bytes_received, seg.payload.len() as u64);

			if self.is_out_of_order(seg.offset) {
				EngineStats::inc(&stats.num_gaps_filled_by_out_of_order_data_segments);
			}
		}

		if seg.flags.end_of_red_part {
			self.red_length = Some(end);
		}

		let mut effects = Vec::new();

		if seg.flags.checkpoint {
			effects.extend(self.build_report(cfg, seg.checkpoint.map(|c| c.checkpoint_serial).unwrap_or(0), stats));
		}

		if let Some(red_length) = self.red_length {
			if self.received.covers(0..red_length) {
				self.phase = Phase::Delivered;
				effects.push(Effect::DeliverRed(self.buffer[..red_length as usize].to_vec()));

				// Delivery alone doesn't end the session: the sender still
				// needs this report acked before it'll stop retransmitting.
				// Only close here if nothing's outstanding already.
				if self.fully_settled() {
					effects.push(Effect::SessionClosed);
				}
			}
		}

		effects
	}

	fn is_out_of_order(&self, offset: u64) -> bool {
		offset != 0 && !self.received.contains(offset.saturating_sub(1))
	}

	fn build_report(&mut self, cfg: &EngineConfig, checkpoint_serial: u64, stats: &EngineStats) -> Vec<Effect> {
		let upper_bound = self.red_length.unwrap_or_else(|| self.received.iter().last().map(|r| r.end).unwrap_or(0));

		let claims: Vec<ReceptionClaim> = self.received.iter().map(|r| ReceptionClaim { offset: r.start, length: r.end - r.start }).collect();

		let Some(chunks) = Self::split_claims_for_mtu(cfg.mtu_report_segment, claims, stats) else {
			return Vec::new();
		};

		let last = chunks.len() - 1;
		let mut effects = Vec::new();

		for (i, claims) in chunks.into_iter().enumerate() {
			// Each report's own bounds span just its claims, except the last,
			// which extends to the true upper bound so the sender can see a
			// genuine trailing gap rather than mistaking "not reported yet" for
			// "missing". Splitting a claim list this way never hides a real gap:
			// `received.iter()` only yields intervals actually on hand, so any
			// hole inside a chunk's own span is a byte that truly never arrived.
			let lower_bound = claims.first().map_or(0, |c| c.offset);
			let this_upper_bound = if i == last { upper_bound } else { claims.last().map_or(upper_bound, |c| c.offset + c.length) };

			let serial = self.next_report_serial;
			self.next_report_serial += 1;

			let fully_claimed = claims.len() == 1 && claims[0].offset == lower_bound && claims[0].length == this_upper_bound - lower_bound;

			if fully_claimed {
				EngineStats::inc(&stats.num_delayed_fully_claimed_primary_report_segments_sent);
			} else {
				EngineStats::inc(&stats.num_delayed_partially_claimed_primary_report_segments_sent);
			}

			EngineStats::inc(&stats.report_segments_sent);

			let report = ReportSegment { session: self.session, report_serial: serial, checkpoint_serial, lower_bound, upper_bound: this_upper_bound, claims };
			self.sent_reports.insert(serial, report.clone());

			effects.push(Effect::SendReport(report));
			effects.push(Effect::ArmTimer(TimerPurpose::ReportSegment(serial), cfg.retransmission_timeout()));
		}

		effects
	}

	/// Splits a reception claim list across as many report segments as
	/// `mtu_report_segment` demands, each sized conservatively (every SDNV
	/// field assumed worst-case length). Returns `None` if even the fixed
	/// per-report overhead can't fit, in which case nothing is reportable.
	fn split_claims_for_mtu(limit: Option<usize>, claims: Vec<ReceptionClaim>, stats: &EngineStats) -> Option<Vec<Vec<ReceptionClaim>>> {
		let Some(limit) = limit else { return Some(vec![claims]) };

		let fixed = crate::segment::report_segment_worst_case_len(0);
		if fixed > limit {
			EngineStats::inc(&stats.num_report_segments_unable_to_be_issued);
			return None;
		}

		if claims.is_empty() {
			return Some(vec![claims]);
		}

		let per_claim = crate::segment::report_segment_worst_case_len(1) - fixed;
		let max_claims_per_report = ((limit - fixed) / per_claim).max(1);

		Some(claims.chunks(max_claims_per_report).map(|c| c.to_vec()).collect())
	}

	/// A sent report's retransmission timer fired with no report-ack seen yet.
	pub fn handle_report_timeout(&mut self, cfg: &EngineConfig, serial: u64, retries_so_far: u32, stats: &EngineStats) -> Vec<Effect> {
		let Some(report) = self.sent_reports.get(&serial).cloned() else {
			return vec![Effect::DisarmTimer(TimerPurpose::ReportSegment(serial))];
		};

		if self.phase == Phase::Cancelled || retries_so_far >= cfg.max_retries_per_serial_number {
			EngineStats::inc(&stats.report_segment_retries_exhausted);
			self.sent_reports.remove(&serial);
			let mut effects = vec![Effect::DisarmTimer(TimerPurpose::ReportSegment(serial))];
			if self.fully_settled() {
				effects.push(Effect::SessionClosed);
			}
			return effects;
		}

		EngineStats::inc(&stats.report_segments_retransmitted);
		vec![Effect::SendReport(report), Effect::ArmTimer(TimerPurpose::ReportSegment(serial), cfg.retransmission_timeout())]
	}

	pub fn handle_report_ack(&mut self, serial: u64) -> Vec<Effect> {
		self.sent_reports.remove(&serial);
		let mut effects = vec![Effect::DisarmTimer(TimerPurpose::ReportSegment(serial))];
		if self.fully_settled() {
			effects.push(Effect::SessionClosed);
		}
		effects
	}

	pub fn handle_cancel(&mut self, _reason: CancelReason) -> Vec<Effect> {
		self.phase = Phase::Cancelled;
		vec![Effect::SendCancelAck, Effect::Cancelled]
	}

	/// Starts a local cancellation, to be confirmed by the peer's cancel-ack.
	pub fn request_cancel(&mut self, cfg: &EngineConfig, reason: CancelReason, stats: &EngineStats) -> Vec<Effect> {
		if self.phase != Phase::Receiving {
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

	pub fn client_service_id(&self) -> u64 {
		self.client_service_id
	}

	pub fn is_delivered(&self) -> bool {
		self.phase == Phase::Delivered
	}

	pub fn is_cancelled(&self) -> bool {
		self.phase == Phase::Cancelled
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::segment::DataFlags;

	fn session() -> SessionId {
		SessionId { originator_engine_id: 1, session_number: 7 }
	}

	fn seg(offset: u64, payload: &[u8], checkpoint: bool, eorp: bool, eob: bool) -> DataSegment {
		DataSegment {
			session: session(),
			is_red: true,
			flags: DataFlags { checkpoint, end_of_red_part: eorp, end_of_block: eob },
			client_service_id: 1,
			offset,
			checkpoint: checkpoint.then_some(crate::segment::CheckpointSerials { checkpoint_serial: 1, report_serial: 0 }),
			payload: payload.to_vec(),
		}
	}

	#[test]
	fn single_segment_eorp_eob_delivers_immediately() {
		let mut recv = SessionReceiver::new(session(), 1, 16);
		let stats = EngineStats::new();
		let effects = recv.handle_data(&EngineConfig::default(), &seg(0, b"hello", true, true, true), &stats);

		assert!(effects.iter().any(|e| matches!(e, Effect::DeliverRed(b) if b == b"hello")));
		assert!(recv.is_delivered());
	}

	#[test]
	fn delivery_with_an_outstanding_report_does_not_close_the_session_yet() {
		let mut recv = SessionReceiver::new(session(), 1, 16);
		let stats = EngineStats::new();
		let effects = recv.handle_data(&EngineConfig::default(), &seg(0, b"hello", true, true, true), &stats);

		assert!(effects.iter().any(|e| matches!(e, Effect::DeliverRed(_))));
		assert!(!effects.iter().any(|e| matches!(e, Effect::SessionClosed)));
	}

	#[test]
	fn session_closes_once_the_final_report_is_acked() {
		let mut recv = SessionReceiver::new(session(), 1, 16);
		let stats = EngineStats::new();
		recv.handle_data(&EngineConfig::default(), &seg(0, b"hello", true, true, true), &stats);

		let effects = recv.handle_report_ack(1);
		assert!(effects.iter().any(|e| matches!(e, Effect::SessionClosed)));
	}

	#[test]
	fn out_of_order_then_gap_fill_still_delivers() {
		let mut recv = SessionReceiver::new(session(), 1, 16);
		let stats = EngineStats::new();
		recv.handle_data(&EngineConfig::default(), &seg(5, b"world", true, true, true), &stats);
		assert!(!recv.is_delivered());

		let effects = recv.handle_data(&EngineConfig::default(), &seg(0, b"hello", false, false, false), &stats);
		assert!(effects.iter().any(|e| matches!(e, Effect::DeliverRed(b) if b == b"helloworld")));
	}

	#[test]
	fn cancel_marks_session_cancelled() {
		let mut recv = SessionReceiver::new(session(), 1, 16);
		let effects = recv.handle_cancel(CancelReason::UserCancelled);
		assert!(recv.is_cancelled());
		assert!(effects.iter().any(|e| matches!(e, Effect::SendCancelAck)));
	}

	#[test]
	fn local_cancel_is_confirmed_only_after_an_ack() {
		let mut recv = SessionReceiver::new(session(), 1, 16);
		let stats = EngineStats::new();
		let effects = recv.request_cancel(&EngineConfig::default(), CancelReason::UserCancelled, &stats);
		assert!(effects.iter().any(|e| matches!(e, Effect::SendCancel(_))));
		assert!(!recv.is_cancelled());

		let effects = recv.handle_cancel_ack();
		assert!(effects.iter().any(|e| matches!(e, Effect::Cancelled)));
		assert!(recv.is_cancelled());
	}
}
