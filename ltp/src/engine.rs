//! The `Stakker` actor that owns every session with the configured remote
//! engine, demultiplexes inbound segments, and drives the sender/receiver
//! state machines against the transport and the timer wheel.
//!
//! Generic over its transport (any [`SegmentTransport`] impl): no inheritance,
//! no shared base type, just a capability the engine drives the same way
//! regardless of whether segments travel over UDP, a Unix stream, shared
//! memory, or a port shared with other engines.

use std::collections::VecDeque;
use std::time::Duration;

use collections::bytes::Slice;
use collections::map::{Index, Key, Map};
use log::{debug, error, warn};
use stakker::{fwd, fwd_to, Fwd, CX};
use utils::error::*;

use crate::config::EngineConfig;
use crate::receiver::{self, SessionReceiver};
use crate::replay_history::ReplayHistory;
use crate::segment::{self, CancelAckSegment, CancelReason, CancelSegment, Direction, ReportAckSegment, Segment, SessionId};
use crate::sender::{self, SessionSender};
use crate::session_id;
use crate::stats::EngineStats;
use crate::store::SessionStore;
use crate::timer::{SessionTimers, TimerPurpose};
use crate::transport::SegmentTransport;

const MAX_SESSIONS: usize = 1 << 20;

/// Reason byte on the cancel segment a link-liveness ping borrows: RFC 5326
/// has no dedicated probe segment, and a cancel for a session the peer has
/// never heard of is acked unconditionally, which is exactly the round trip
/// a liveness check needs.
const PING_CANCEL_REASON: u8 = 0xfe;

struct SenderEntry {
	session: SessionId,
	state: SessionSender,
	timers: SessionTimers,
}

impl Key for SenderEntry {
	type Type = SessionId;

	fn key(&self) -> &Self::Type {
		&self.session
	}
}

struct ReceiverEntry {
	session: SessionId,
	state: SessionReceiver,
	timers: SessionTimers,
}

impl Key for ReceiverEntry {
	type Type = SessionId;

	fn key(&self) -> &Self::Type {
		&self.session
	}
}

/// A delivered red-part or green chunk, handed to whatever owns bundle
/// reassembly above LTP.
pub enum Delivery {
	Red { session: SessionId, client_service_id: u64, data: Vec<u8> },
	Green { session: SessionId, client_service_id: u64, data: Vec<u8> },
}

/// Observed state of the link to the remote engine, derived from whether the
/// last few liveness pings were acked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
	Up,
	Down,
}

struct PingState {
	session: SessionId,
	retries: u32,
}

pub struct LtpEngine<T: SegmentTransport + 'static> {
	config: EngineConfig,
	transport: T,
	senders: Map<SenderEntry, MAX_SESSIONS>,
	receivers: Map<ReceiverEntry, MAX_SESSIONS>,
	replay_history: ReplayHistory,
	store: Option<SessionStore>,
	stats: EngineStats,
	delivery: Fwd<Delivery>,
	link_status: Fwd<LinkStatus>,
	link_up: bool,
	ping: Option<PingState>,
	sender_count: usize,
	receiver_count: usize,
	send_budget_bytes: u64,
	rate_limiter_started: bool,
	pending_sends: VecDeque<Vec<u8>>,
}

impl<T: SegmentTransport + 'static> LtpEngine<T> {
	/// `make_transport` receives this engine's own inbound read forward and
	/// builds the transport from it. Transports with no reactor integration
	/// of their own (shared memory, a shared UDP port) can ignore it and
	/// instead have their companion poller actor built separately by the
	/// caller, pointed at `fwd_to!([engine], read() as (Slice))` once the
	/// `ActorOwn` this returns exists.
	pub fn init<F>(cx: CX![], config: EngineConfig, delivery: Fwd<Delivery>, link_status: Fwd<LinkStatus>, make_transport: F) -> Option<Self>
	where
		F: FnOnce(Fwd<Slice>) -> Option<T>,
	{
		if let Err(e) = config.validate() {
			error!("Refusing to start engine: {e}");
			return None;
		}

		let read_fwd = fwd_to!([cx], read() as (Slice));
		let transport = make_transport(read_fwd)?;

		let replay_history = ReplayHistory::new(config.rx_session_recreation_preventer_history_size);

		let store = match config.active_session_data_on_disk_new_file_duration {
			Some(_) => SessionStore::open(&config.active_session_data_on_disk_directory).ok_or(|err| error!("Failed to open LTP session store: {err}")),
			None => None,
		};

		let mut this = Self {
			senders: Map::default(),
			receivers: Map::default(),
			replay_history,
			store,
			stats: EngineStats::new(),
			config,
			transport,
			delivery,
			link_status,
			link_up: true,
			ping: None,
			sender_count: 0,
			receiver_count: 0,
			send_budget_bytes: 0,
			rate_limiter_started: false,
			pending_sends: VecDeque::new(),
		};

		if let Some(interval) = this.config.sender_ping_interval {
			this.schedule_ping(cx, interval);
		}

		if let Some(interval) = this.config.active_session_data_on_disk_new_file_duration {
			this.schedule_store_roll(cx, interval);
		}

		Some(this)
	}

	pub fn stats(&self) -> crate::stats::EngineStatsSnapshot {
		self.stats.snapshot()
	}

	pub fn log_stats(&mut self, _cx: CX![]) {
		log::info!("LTP engine stats: {:?}", self.stats.snapshot());
	}

	/// Writes one already-encoded segment, through the rate limiter if one is
	/// configured.
	fn send_segment(&mut self, cx: CX![], buf: Vec<u8>) {
		let Some(bits_per_sec) = self.config.max_send_rate_bits_per_sec else {
			self.transport.send(&buf);
			return;
		};

		if !self.rate_limiter_started {
			self.rate_limiter_started = true;
			self.send_budget_bytes = Self::bytes_per_window(bits_per_sec, self.config.rate_limit_precision);
			self.schedule_rate_limit_tick(cx);
		}

		if buf.len() as u64 <= self.send_budget_bytes {
			self.send_budget_bytes -= buf.len() as u64;
			self.transport.send(&buf);
		} else {
			EngineStats::inc(&self.stats.rate_limited_sends_delayed);
			self.pending_sends.push_back(buf);
		}
	}

	fn bytes_per_window(bits_per_sec: u64, precision: Duration) -> u64 {
		((bits_per_sec as f64 / 8.0) * precision.as_secs_f64()) as u64
	}

	fn schedule_rate_limit_tick(&mut self, cx: CX![]) {
		let actor = cx.access_actor().clone();
		cx.after(self.config.rate_limit_precision, move |s| actor.apply(s, move |this, cx| this.on_rate_limit_tick(cx)));
	}

	fn on_rate_limit_tick(&mut self, cx: CX![]) {
		if let Some(bits_per_sec) = self.config.max_send_rate_bits_per_sec {
			self.send_budget_bytes = Self::bytes_per_window(bits_per_sec, self.config.rate_limit_precision);
		}

		while let Some(buf) = self.pending_sends.front() {
			if buf.len() as u64 > self.send_budget_bytes {
				break;
			}

			let buf = self.pending_sends.pop_front().expect("checked non-empty above");
			self.send_budget_bytes -= buf.len() as u64;
			self.transport.send(&buf);
		}

		self.schedule_rate_limit_tick(cx);
	}

	/// Sends (or, if `delay` is set, schedules) one already-encoded segment.
	/// Used for the data-segment and report-segment deferred-sending windows,
	/// which apply before a segment ever reaches the rate limiter.
	fn dispatch_delayed(&mut self, cx: CX![], delay: Option<Duration>, buf: Vec<u8>) {
		let Some(delay) = delay else {
			self.send_segment(cx, buf);
			return;
		};

		let actor = cx.access_actor().clone();
		cx.after(delay, move |s| {
			let buf = buf.clone();
			actor.apply(s, move |this, cx| this.send_segment(cx, buf));
		});
	}

	fn schedule_store_roll(&mut self, cx: CX![], interval: Duration) {
		let actor = cx.access_actor().clone();
		cx.after(interval, move |s| actor.apply(s, move |this, cx| this.on_store_roll(cx)));
	}

	fn on_store_roll(&mut self, cx: CX![]) {
		if let Some(store) = &mut self.store {
			if let Err(e) = store.roll() {
				error!("Failed to roll LTP session store: {e}");
			}
		}

		if let Some(interval) = self.config.active_session_data_on_disk_new_file_duration {
			self.schedule_store_roll(cx, interval);
		}
	}

	/// Starts a new outbound transfer of `client_service_id`'s data, red
	/// bytes followed by green bytes, to the configured remote engine.
	pub fn send(&mut self, cx: CX![], client_service_id: u64, red_data: Vec<u8>, green_data: Vec<u8>) {
		if self.sender_count >= self.config.max_simultaneous_sessions {
			error!("Refusing new session: max_simultaneous_sessions reached");
			return;
		}

		let session = session_id::generate(self.config.this_engine_id, self.config.engine_index, self.config.force_32_bit_random_numbers);

		if let Some(store) = &mut self.store {
			if let Err(e) = store.write_block(session, &red_data) {
				error!("Failed to persist session {session:?} to disk: {e}");
			}
		}

		let mut state = SessionSender::new(session, client_service_id, red_data, green_data);
		let effects = state.start(&self.config, &self.stats);

		EngineStats::inc(&self.stats.sessions_started_as_sender);
		self.sender_count += 1;

		let slot = self.senders.insert_unique(&session);
		let idx = slot.index();
		slot.insert(SenderEntry { session, state, timers: SessionTimers::new() });

		self.apply_sender_effects(cx, idx, effects);
	}

	/// Requests cancellation of an outstanding session this engine owns,
	/// either as its sender or as its receiver. No-op if `session` isn't
	/// outstanding, or is already past the point cancellation applies.
	pub fn cancel_session(&mut self, cx: CX![], session: SessionId, reason: CancelReason) {
		if let Some(entry) = self.senders.find_entry(&session).filled() {
			let idx = entry.index();
			let effects = self.senders[idx].state.request_cancel(&self.config, reason, &self.stats);
			self.apply_sender_effects(cx, idx, effects);
			return;
		}

		if let Some(entry) = self.receivers.find_entry(&session).filled() {
			let idx = entry.index();
			let effects = self.receivers[idx].state.request_cancel(&self.config, reason, &self.stats);
			self.apply_receiver_effects(cx, idx, effects);
		}
	}

	fn apply_sender_effects(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>, effects: Vec<sender::Effect>) {
		for effect in effects {
			match effect {
				sender::Effect::Send(seg) => {
					let mut buf = Vec::new();
					segment::encode_data(&mut buf, &seg);
					EngineStats::inc(&self.stats.segments_sent);
					EngineStats::add(if seg.is_red { &self.stats.red_bytes_sent } else { &self.stats.green_bytes_sent }, seg.payload.len() as u64);
					let delay = self.config.delay_sending_of_data_segments;
					self.dispatch_delayed(cx, delay, buf);
				}
				sender::Effect::SendCancel(reason) => {
					let session = self.senders[idx].state.session();
					let mut buf = Vec::new();
					segment::encode_cancel(&mut buf, &CancelSegment { session, from_sender: true, reason });
					self.send_segment(cx, buf);
				}
				sender::Effect::ArmTimer(purpose, timeout) => self.arm_sender_timer(cx, idx, purpose, timeout),
				sender::Effect::DisarmTimer(purpose) => self.senders[idx].timers.disarm(cx, purpose),
				sender::Effect::Complete => {
					EngineStats::inc(&self.stats.sessions_completed);
					self.close_sender(cx, idx);
				}
				sender::Effect::Cancelled => {
					EngineStats::inc(&self.stats.sessions_cancelled_by_local);
					self.close_sender(cx, idx);
				}
			}
		}
	}

	fn arm_sender_timer(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>, purpose: TimerPurpose, timeout: Duration) {
		let actor = cx.access_actor().clone();
		let key = cx.after(timeout, move |s| actor.apply(s, move |this, cx| this.on_sender_timer(cx, idx, purpose)));
		self.senders[idx].timers.arm(cx, purpose, key);
	}

	fn on_sender_timer(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>, purpose: TimerPurpose) {
		let retries = self.senders[idx].timers.retries(purpose);

		let effects = match purpose {
			TimerPurpose::Checkpoint(serial) => self.senders[idx].state.handle_checkpoint_timeout(&self.config, serial, retries, &self.stats),
			TimerPurpose::CancelAck => self.senders[idx].state.handle_cancel_ack_timeout(&self.config, retries, &self.stats),
			_ => return warn!("Unexpected timer purpose on sender session"),
		};

		self.apply_sender_effects(cx, idx, effects);
	}

	fn close_sender(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>) {
		let session = self.senders[idx].session;
		self.senders[idx].timers.disarm_all(cx);
		self.senders.find_entry(&session).remove();
		self.sender_count -= 1;

		if let Some(store) = &mut self.store {
			store.close_session(session);
		}
	}

	fn schedule_ping(&mut self, cx: CX![], interval: Duration) {
		let actor = cx.access_actor().clone();
		cx.after(interval, move |s| actor.apply(s, move |this, cx| this.send_ping(cx)));
	}

	fn send_ping(&mut self, cx: CX![]) {
		if let Some(ping) = &self.ping {
			if ping.retries >= self.config.max_retries_per_serial_number {
				self.set_link_status(false);
			}
		}

		let retries = self.ping.as_ref().map(|p| p.retries + 1).unwrap_or(0);
		let session = session_id::generate(self.config.this_engine_id, self.config.engine_index, self.config.force_32_bit_random_numbers);
		self.ping = Some(PingState { session, retries });

		debug!("Sending link-liveness ping (attempt {retries})");
		let mut buf = Vec::new();
		segment::encode_cancel(&mut buf, &CancelSegment { session, from_sender: true, reason: CancelReason::Other(PING_CANCEL_REASON) });
		self.send_segment(cx, buf);

		if let Some(interval) = self.config.sender_ping_interval {
			self.schedule_ping(cx, interval);
		}
	}

	fn set_link_status(&mut self, up: bool) {
		if self.link_up != up {
			self.link_up = up;
			fwd!([self.link_status], if up { LinkStatus::Up } else { LinkStatus::Down });
		}
	}

	/// Demultiplexes one inbound segment, after confirming it actually
	/// belongs to this engine: a sender→receiver segment must have
	/// originated at the configured remote engine, and a receiver→sender
	/// segment's session number must carry this engine's own index in its
	/// low byte. Both checks matter once a port is shared by several
	/// engines; neither is redundant with the session lookups below, which
	/// would otherwise happily demux a segment meant for a different engine
	/// entirely.
	pub fn recv(&mut self, cx: CX![], buf: &[u8]) {
		EngineStats::inc(&self.stats.segments_received);

		let segment = match segment::decode(buf) {
			Ok(s) => s,
			Err(e) => {
				warn!("Dropping malformed segment: {e}");
				EngineStats::inc(&self.stats.segments_dropped_malformed);
				return;
			}
		};

		let session = segment.session();
		let belongs_to_this_engine = match segment.direction() {
			Direction::SenderToReceiver => session.originator_engine_id == self.config.remote_engine_id,
			Direction::ReceiverToSender => (session.session_number & 0xff) as u8 == self.config.engine_index,
		};

		if !belongs_to_this_engine {
			warn!("Dropping segment that doesn't demux to this engine");
			EngineStats::inc(&self.stats.segments_dropped_wrong_engine);
			return;
		}

		match segment {
			Segment::Data(seg) => self.recv_data(cx, seg),
			Segment::Report(seg) => self.recv_report(cx, seg),
			Segment::ReportAck(seg) => self.recv_report_ack(cx, seg),
			Segment::Cancel(seg) => self.recv_cancel(cx, seg),
			Segment::CancelAck(seg) => self.recv_cancel_ack(cx, seg),
		}
	}

	fn recv_data(&mut self, cx: CX![], seg: crate::segment::DataSegment) {
		let session = seg.session;

		if self.replay_history.contains(session) {
			EngineStats::inc(&self.stats.rx_session_recreations_prevented);
			return;
		}

		if self.receivers.find(&session).is_none() {
			if self.receiver_count >= self.config.max_simultaneous_sessions {
				error!("Refusing new receiver session: max_simultaneous_sessions reached");
				return;
			}

			let state = SessionReceiver::new(session, seg.client_service_id, self.config.estimated_bytes_per_session);
			EngineStats::inc(&self.stats.sessions_started_as_receiver);
			self.receiver_count += 1;
			let slot = self.receivers.insert_unique(&session);
			slot.insert(ReceiverEntry { session, state, timers: SessionTimers::new() });
		}

		let Some(entry) = self.receivers.find_entry(&session).filled() else { return };
		let idx = entry.index();

		let effects = self.receivers[idx].state.handle_data(&self.config, &seg, &self.stats);
		self.apply_receiver_effects(cx, idx, effects);
	}

	fn apply_receiver_effects(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>, effects: Vec<receiver::Effect>) {
		for effect in effects {
			match effect {
				receiver::Effect::SendReport(report) => {
					let mut buf = Vec::new();
					segment::encode_report(&mut buf, &report);
					let delay = self.config.delay_sending_of_report_segments;
					self.dispatch_delayed(cx, delay, buf);
				}
				receiver::Effect::SendCancel(reason) => {
					let session = self.receivers[idx].state.session();
					let mut buf = Vec::new();
					segment::encode_cancel(&mut buf, &CancelSegment { session, from_sender: false, reason });
					self.send_segment(cx, buf);
				}
				receiver::Effect::SendCancelAck => {
					let session = self.receivers[idx].state.session();
					self.send_cancel_ack(cx, session, false);
				}
				receiver::Effect::ArmTimer(purpose, timeout) => self.arm_receiver_timer(cx, idx, purpose, timeout),
				receiver::Effect::DisarmTimer(purpose) => self.receivers[idx].timers.disarm(cx, purpose),
				receiver::Effect::DeliverGreen(data) => {
					let entry = &self.receivers[idx];
					fwd!([self.delivery], Delivery::Green { session: entry.state.session(), client_service_id: entry.state.client_service_id(), data });
				}
				receiver::Effect::DeliverRed(data) => {
					let entry = &self.receivers[idx];
					let session = entry.state.session();
					let client_service_id = entry.state.client_service_id();

					if let Some(store) = &mut self.store {
						if let Err(e) = store.write_block(session, &data) {
							error!("Failed to persist session {session:?} to disk: {e}");
						}
					}

					// Delivery alone doesn't close the session: a report still
					// outstanding for it needs the sender's ack first, handled
					// by the separate `SessionClosed` effect below.
					fwd!([self.delivery], Delivery::Red { session, client_service_id, data });
				}
				receiver::Effect::SessionClosed => self.finish_receiver(cx, idx),
				receiver::Effect::Cancelled => {
					EngineStats::inc(&self.stats.sessions_cancelled_by_remote);
					self.finish_receiver(cx, idx);
				}
			}
		}
	}

	fn arm_receiver_timer(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>, purpose: TimerPurpose, timeout: Duration) {
		let actor = cx.access_actor().clone();
		let key = cx.after(timeout, move |s| actor.apply(s, move |this, cx| this.on_receiver_timer(cx, idx, purpose)));
		self.receivers[idx].timers.arm(cx, purpose, key);
	}

	fn on_receiver_timer(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>, purpose: TimerPurpose) {
		let retries = self.receivers[idx].timers.retries(purpose);

		let effects = match purpose {
			TimerPurpose::ReportSegment(serial) => self.receivers[idx].state.handle_report_timeout(&self.config, serial, retries, &self.stats),
			TimerPurpose::CancelAck => self.receivers[idx].state.handle_cancel_ack_timeout(&self.config, retries, &self.stats),
			_ => return warn!("Unexpected timer purpose on receiver session"),
		};

		self.apply_receiver_effects(cx, idx, effects);
	}

	fn finish_receiver(&mut self, cx: CX![], idx: Index<MAX_SESSIONS>) {
		let session = self.receivers[idx].session;
		self.receivers[idx].timers.disarm_all(cx);
		self.receivers.find_entry(&session).remove();
		self.receiver_count -= 1;
		self.replay_history.record(session);

		if let Some(store) = &mut self.store {
			store.close_session(session);
		}
	}

	fn recv_report(&mut self, cx: CX![], seg: crate::segment::ReportSegment) {
		let session = seg.session;
		let Some(entry) = self.senders.find_entry(&session).filled() else {
			warn!("Report segment for unknown session");
			return;
		};
		let idx = entry.index();

		let mut buf = Vec::new();
		segment::encode_report_ack(&mut buf, &ReportAckSegment { session, report_serial: seg.report_serial });
		self.send_segment(cx, buf);
		EngineStats::inc(&self.stats.report_acks_sent);

		let effects = self.senders[idx].state.handle_report(&self.config, &seg, &self.stats);
		self.apply_sender_effects(cx, idx, effects);
	}

	fn recv_report_ack(&mut self, cx: CX![], seg: ReportAckSegment) {
		let session = seg.session;
		let Some(entry) = self.receivers.find_entry(&session).filled() else { return };
		let idx = entry.index();
		let effects = self.receivers[idx].state.handle_report_ack(seg.report_serial);
		self.apply_receiver_effects(cx, idx, effects);
	}

	fn recv_cancel(&mut self, cx: CX![], seg: CancelSegment) {
		let session = seg.session;

		if seg.from_sender {
			if let Some(entry) = self.receivers.find_entry(&session).filled() {
				let idx = entry.index();
				let effects = self.receivers[idx].state.handle_cancel(seg.reason);
				self.apply_receiver_effects(cx, idx, effects);
			} else {
				// No session of ours matches: still ack, either because it
				// already closed or because this is a liveness ping borrowing
				// the cancel wire format.
				self.send_cancel_ack(cx, session, false);
			}
		} else if let Some(entry) = self.senders.find_entry(&session).filled() {
			let idx = entry.index();
			EngineStats::inc(&self.stats.sessions_cancelled_by_remote);
			self.close_sender(cx, idx);
			self.send_cancel_ack(cx, session, true);
		} else {
			self.send_cancel_ack(cx, session, true);
		}
	}

	fn send_cancel_ack(&mut self, cx: CX![], session: SessionId, from_sender: bool) {
		let mut buf = Vec::new();
		segment::encode_cancel_ack(&mut buf, &CancelAckSegment { session, from_sender });
		self.send_segment(cx, buf);
	}

	fn recv_cancel_ack(&mut self, cx: CX![], seg: CancelAckSegment) {
		let session = seg.session;

		if self.ping.as_ref().is_some_and(|p| p.session == session) {
			self.ping = None;
			self.set_link_status(true);
			return;
		}

		if seg.from_sender {
			let Some(entry) = self.receivers.find_entry(&session).filled() else { return };
			let idx = entry.index();
			let effects = self.receivers[idx].state.handle_cancel_ack();
			self.apply_receiver_effects(cx, idx, effects);
		} else {
			let Some(entry) = self.senders.find_entry(&session).filled() else { return };
			let idx = entry.index();
			let effects = self.senders[idx].state.handle_cancel_ack();
			self.apply_sender_effects(cx, idx, effects);
		}
	}

	fn read(&mut self, cx: CX![], buf: Slice) {
		for segment in self.transport.decode_frames(&buf) {
			self.recv(cx, &segment);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bytes_per_window_scales_with_precision() {
		let per_sec = LtpEngine::<crate::transport::Transport>::bytes_per_window(8_000, Duration::from_secs(1));
		assert_eq!(per_sec, 1000);

		let per_100ms = LtpEngine::<crate::transport::Transport>::bytes_per_window(8_000, Duration::from_millis(100));
		assert_eq!(per_100ms, 100);
	}
}
