//! End-to-end scenarios driving a sender and receiver session against each
//! other directly (no transport, no `Stakker` runtime — both state
//! machines are pure), mirroring the concrete scenarios used to validate
//! the protocol: a clean transfer, a red/green mix, a dropped data
//! segment, and a dropped checkpoint recovered by timer retry.

use std::time::Duration;

use ltp::config::EngineConfig;
use ltp::receiver::{self, SessionReceiver};
use ltp::segment::SessionId;
use ltp::sender::{self, SessionSender};
use ltp::stats::EngineStats;

fn session() -> SessionId {
	SessionId { originator_engine_id: 1, session_number: 42 }
}

fn cfg() -> EngineConfig {
	EngineConfig {
		mtu_client_service_data: 1,
		one_way_light_time: Duration::from_millis(250),
		one_way_margin_time: Duration::from_millis(250),
		max_retries_per_serial_number: 5,
		..Default::default()
	}
}

/// Feeds every `Send` effect from the sender to the receiver, every
/// `SendReport` effect from the receiver back to the sender (plus the
/// report-ack the engine would issue directly), looping until neither side
/// produces further reactions. `drop_nth_red` skips the zero-indexed red
/// data segment in send order exactly once.
struct Harness {
	cfg: EngineConfig,
	stats: EngineStats,
	red_segments_seen: usize,
	drop_nth_red: Option<usize>,
	reports_received_by_sender: usize,
	red_delivered: Option<Vec<u8>>,
	green_delivered: Vec<Vec<u8>>,
}

impl Harness {
	fn new(drop_nth_red: Option<usize>) -> Self {
		Self { cfg: cfg(), stats: EngineStats::new(), red_segments_seen: 0, drop_nth_red, reports_received_by_sender: 0, red_delivered: None, green_delivered: Vec::new() }
	}

	fn drive(&mut self, sender: &mut SessionSender, receiver: &mut SessionReceiver, effects: Vec<sender::Effect>) {
		let mut pending = effects;

		while !pending.is_empty() {
			let mut next = Vec::new();

			for effect in pending {
				match effect {
					sender::Effect::Send(seg) => {
						let drop_this = seg.is_red && self.drop_nth_red == Some(self.red_segments_seen);
						if seg.is_red {
							self.red_segments_seen += 1;
						}

						if drop_this {
							continue;
						}

						let recv_effects = receiver.handle_data(&self.cfg, &seg, &self.stats);
						next.extend(self.drive_receiver(sender, receiver, recv_effects));
					}
					sender::Effect::SendCancel(_) | sender::Effect::ArmTimer(..) | sender::Effect::DisarmTimer(_) | sender::Effect::Complete | sender::Effect::Cancelled => {}
				}
			}

			pending = next;
		}
	}

	fn drive_receiver(&mut self, sender: &mut SessionSender, receiver: &mut SessionReceiver, effects: Vec<receiver::Effect>) -> Vec<sender::Effect> {
		let mut bounced = Vec::new();

		for effect in effects {
			match effect {
				receiver::Effect::SendReport(report) => {
					self.reports_received_by_sender += 1;
					bounced.extend(sender.handle_report(&self.cfg, &report, &self.stats));
					receiver.handle_report_ack(report.report_serial);
				}
				receiver::Effect::DeliverRed(data) => self.red_delivered = Some(data),
				receiver::Effect::DeliverGreen(data) => self.green_delivered.push(data),
				receiver::Effect::SendCancelAck | receiver::Effect::ArmTimer(..) | receiver::Effect::DisarmTimer(_) | receiver::Effect::SessionClosed | receiver::Effect::Cancelled => {}
			}
		}

		bounced
	}

	/// Simulates a checkpoint retransmission timer firing for `serial`.
	fn checkpoint_timeout(&mut self, sender: &mut SessionSender, receiver: &mut SessionReceiver, serial: u64) {
		let effects = sender.handle_checkpoint_timeout(&self.cfg, serial, 0, &self.stats);
		self.drive(sender, receiver, effects);
	}
}

#[test]
fn clean_red_delivers_identical_bytes_and_completes() {
	let block = b"The quick brown fox jumps over the lazy dog!";
	assert_eq!(block.len(), 44);

	let mut sender = SessionSender::new(session(), 7, block.to_vec(), Vec::new());
	let mut receiver = SessionReceiver::new(session(), 7, 64);
	let mut harness = Harness::new(None);

	let start_effects = sender.start(&harness.cfg, &harness.stats);
	harness.drive(&mut sender, &mut receiver, start_effects);

	assert!(sender.is_complete());
	assert!(receiver.is_delivered());
	assert_eq!(harness.red_delivered.as_deref(), Some(block.as_slice()));
	assert_eq!(harness.reports_received_by_sender, 1);
	assert!(harness.green_delivered.is_empty());
}

#[test]
fn red_and_green_mix_delivers_red_once_and_green_per_segment() {
	let block = b"The quick brown fox jumps over the lazy dog!GGE";
	let red_len = 44;
	let red = block[..red_len].to_vec();
	let green = block[red_len..].to_vec();
	assert_eq!(green, b"GGE");

	let mut sender = SessionSender::new(session(), 3, red.clone(), green);
	let mut receiver = SessionReceiver::new(session(), 3, 64);
	let mut harness = Harness::new(None);

	let start_effects = sender.start(&harness.cfg, &harness.stats);
	harness.drive(&mut sender, &mut receiver, start_effects);

	assert!(sender.is_complete());
	assert_eq!(harness.red_delivered.as_deref(), Some(red.as_slice()));
	assert_eq!(harness.green_delivered, vec![b"G".to_vec(), b"G".to_vec(), b"E".to_vec()]);
}

#[test]
fn one_dropped_red_segment_is_recovered_by_gap_retransmission() {
	let block = b"The quick brown fox jumps over the lazy dog!";

	let mut sender = SessionSender::new(session(), 7, block.to_vec(), Vec::new());
	let mut receiver = SessionReceiver::new(session(), 7, 64);
	let mut harness = Harness::new(Some(9)); // drop the 10th red segment once

	let start_effects = sender.start(&harness.cfg, &harness.stats);
	harness.drive(&mut sender, &mut receiver, start_effects);

	assert!(sender.is_complete());
	assert!(receiver.is_delivered());
	assert_eq!(harness.red_delivered.as_deref(), Some(block.as_slice()));
	// One primary (partially-claimed, missing byte 9) report plus one
	// secondary (fully-claimed, after the gap retransmission) report.
	assert_eq!(harness.reports_received_by_sender, 2);
	assert_eq!(harness.stats.snapshot().num_delayed_partially_claimed_primary_report_segments_sent, 1);
}

#[test]
fn dropped_eob_checkpoint_recovers_via_checkpoint_timer() {
	let block = b"ab";

	let mut sender = SessionSender::new(session(), 1, block.to_vec(), Vec::new());
	let mut receiver = SessionReceiver::new(session(), 1, 16);
	let mut harness = Harness::new(Some(usize::from(block.len() - 1))); // drop only the final (checkpoint) segment

	let start_effects = sender.start(&harness.cfg, &harness.stats);
	harness.drive(&mut sender, &mut receiver, start_effects);

	// Nothing delivered yet: the one and only checkpointed segment was dropped.
	assert!(!sender.is_complete());
	assert!(!receiver.is_delivered());

	harness.checkpoint_timeout(&mut sender, &mut receiver, 1);

	assert!(sender.is_complete());
	assert!(receiver.is_delivered());
	assert_eq!(harness.red_delivered.as_deref(), Some(block.as_slice()));
	assert_eq!(harness.stats.snapshot().checkpoints_retransmitted, 1);
}

#[test]
fn report_segment_that_cannot_fit_the_mtu_is_counted_and_withheld() {
	// 15 reception claims (every other byte, worst case 2 SDNV fields each)
	// blow well past a report MTU of a handful of bytes; the receiver must
	// give up on issuing that report rather than send something oversized.
	let block: Vec<u8> = (0..30).collect();

	let mut receiver = SessionReceiver::new(session(), 1, 32);
	let mut config = cfg();
	config.mtu_report_segment = Some(8);

	let stats = EngineStats::new();
	let start_effects = SessionSender::new(session(), 1, block, Vec::new()).start(&config, &stats);

	let segments: Vec<_> = start_effects
		.into_iter()
		.filter_map(|e| if let sender::Effect::Send(seg) = e { Some(seg) } else { None })
		.collect();

	// Deliver every other byte out of order, fragmenting the receiver's
	// reception claims, then deliver the final checkpointed segment.
	for seg in segments.iter().step_by(2).rev() {
		receiver.handle_data(&config, seg, &stats);
	}
	for seg in segments.iter().skip(1).step_by(2) {
		let effects = receiver.handle_data(&config, seg, &stats);
		assert!(effects.iter().all(|e| !matches!(e, receiver::Effect::SendReport(_))));
	}

	// Local delivery is independent of the wire report: every byte was
	// buffered, so the client service still gets its data even though the
	// sender is never told so.
	assert!(receiver.is_delivered());
	assert!(stats.snapshot().num_report_segments_unable_to_be_issued > 0);
}

#[test]
fn a_report_too_big_for_the_mtu_splits_across_several_report_segments() {
	// 14 scattered one-byte claims plus a 15th formed by the final two
	// (adjacent) segments coalescing: exactly 15 reception claims once the
	// checkpoint arrives. A report MTU sized for 3 claims per segment must
	// split this into exactly 5 report segments, none of them withheld.
	let block: Vec<u8> = (0..30).collect();

	let mut receiver = SessionReceiver::new(session(), 1, 32);
	let mut config = cfg();
	config.mtu_report_segment = Some(151);

	let stats = EngineStats::new();
	let start_effects = SessionSender::new(session(), 1, block, Vec::new()).start(&config, &stats);

	let segments: Vec<_> = start_effects
		.into_iter()
		.filter_map(|e| if let sender::Effect::Send(seg) = e { Some(seg) } else { None })
		.collect();
	assert_eq!(segments.len(), 30);

	// Every even offset (0, 2, .., 28) plus the final odd one (29, the
	// checkpoint); the odd offsets in between are left as genuine gaps.
	for seg in segments.iter().step_by(2) {
		receiver.handle_data(&config, seg, &stats);
	}

	let final_effects = receiver.handle_data(&config, &segments[29], &stats);
	let reports: Vec<_> = final_effects.iter().filter(|e| matches!(e, receiver::Effect::SendReport(_))).count();

	assert_eq!(reports, 5);
	assert_eq!(stats.snapshot().num_report_segments_unable_to_be_issued, 0);
	assert_eq!(stats.snapshot().report_segments_sent, 5);
	// Real gaps at the odd offsets remain unreceived, so delivery can't happen yet.
	assert!(!receiver.is_delivered());
}
