//! LTP segment wire format (RFC 5326 section 3) and its codec.

use crate::sdnv;

/// A decode failure, distinguished by kind so callers can react differently
/// (an unsupported version is not the same problem as a corrupt packet).
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("segment is truncated or structurally invalid")]
	Malformed,
	#[error("segment header declares unsupported version {0}")]
	UnsupportedVersion(u8),
}

fn malformed<T>() -> Result<T, DecodeError> {
	Err(DecodeError::Malformed)
}

/// Which end of a session emits segments of a given type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
	SenderToReceiver,
	ReceiverToSender,
}

/// A reason code carried by cancel and cancel-ack segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
	/// Client service canceled the transmission/reception.
	UserCancelled,
	/// The destination client service id is not reachable.
	Unreachable,
	/// Retransmission limit exceeded.
	RetransmitLimitExceeded,
	/// Reserved/unrecognized code, preserved for pass-through.
	Other(u8),
}

impl CancelReason {
	fn from_byte(b: u8) -> Self {
		match b {
			0 => Self::UserCancelled,
			1 => Self::Unreachable,
			2 => Self::RetransmitLimitExceeded,
			other => Self::Other(other),
		}
	}

	fn to_byte(self) -> u8 {
		match self {
			Self::UserCancelled => 0,
			Self::Unreachable => 1,
			Self::RetransmitLimitExceeded => 2,
			Self::Other(b) => b,
		}
	}
}

/// The 4-bit segment type code (RFC 5326 Table 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum TypeCode {
	RedData = 0,
	RedDataCheckpoint = 1,
	RedDataCheckpointEorp = 2,
	RedDataCheckpointEorpEob = 3,
	GreenData = 4,
	GreenDataEob = 7,
	Report = 8,
	ReportAck = 9,
	CancelFromSender = 12,
	CancelAckFromReceiver = 13,
	CancelFromReceiver = 14,
	CancelAckFromSender = 15,
}

impl TypeCode {
	fn from_nibble(n: u8) -> Result<Self, DecodeError> {
		Ok(match n {
			0 => Self::RedData,
			1 => Self::RedDataCheckpoint,
			2 => Self::RedDataCheckpointEorp,
			3 => Self::RedDataCheckpointEorpEob,
			4 => Self::GreenData,
			7 => Self::GreenDataEob,
			8 => Self::Report,
			9 => Self::ReportAck,
			12 => Self::CancelFromSender,
			13 => Self::CancelAckFromReceiver,
			14 => Self::CancelFromReceiver,
			15 => Self::CancelAckFromSender,
			_ => return malformed(),
		})
	}

	fn direction(self) -> Direction {
		use Direction::*;
		match self {
			Self::RedData | Self::RedDataCheckpoint | Self::RedDataCheckpointEorp | Self::RedDataCheckpointEorpEob => SenderToReceiver,
			Self::GreenData | Self::GreenDataEob => SenderToReceiver,
			Self::ReportAck => SenderToReceiver,
			Self::CancelFromSender | Self::CancelAckFromSender => SenderToReceiver,
			Self::Report => ReceiverToSender,
			Self::CancelFromReceiver | Self::CancelAckFromReceiver => ReceiverToSender,
		}
	}
}

/// The identity carried by every segment header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId {
	pub originator_engine_id: u64,
	pub session_number: u64,
}

/// Flags carried by a data segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DataFlags {
	pub checkpoint: bool,
	pub end_of_red_part: bool,
	pub end_of_block: bool,
}

/// A checkpoint's own serial pair, present only when `flags.checkpoint` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointSerials {
	pub checkpoint_serial: u64,
	/// The report serial this checkpoint is responding to, or `0` for an initial checkpoint.
	pub report_serial: u64,
}

pub struct DataSegment {
	pub session: SessionId,
	pub is_red: bool,
	pub flags: DataFlags,
	pub client_service_id: u64,
	pub offset: u64,
	pub checkpoint: Option<CheckpointSerials>,
	pub payload: Vec<u8>,
}

/// A single reception claim: `[offset, offset + length)` within the report's bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceptionClaim {
	pub offset: u64,
	pub length: u64,
}

#[derive(Clone)]
pub struct ReportSegment {
	pub session: SessionId,
	pub report_serial: u64,
	/// The checkpoint serial this report responds to, or `0` for a stagnation/async report.
	pub checkpoint_serial: u64,
	pub lower_bound: u64,
	pub upper_bound: u64,
	pub claims: Vec<ReceptionClaim>,
}

pub struct ReportAckSegment {
	pub session: SessionId,
	pub report_serial: u64,
}

pub struct CancelSegment {
	pub session: SessionId,
	pub from_sender: bool,
	pub reason: CancelReason,
}

pub struct CancelAckSegment {
	pub session: SessionId,
	pub from_sender: bool,
}

pub enum Segment {
	Data(DataSegment),
	Report(ReportSegment),
	ReportAck(ReportAckSegment),
	Cancel(CancelSegment),
	CancelAck(CancelAckSegment),
}

impl Segment {
	pub fn session(&self) -> SessionId {
		match self {
			Self::Data(s) => s.session,
			Self::Report(s) => s.session,
			Self::ReportAck(s) => s.session,
			Self::Cancel(s) => s.session,
			Self::CancelAck(s) => s.session,
		}
	}

	/// Which way this (already decoded) segment travels.
	pub fn direction(&self) -> Direction {
		match self {
			Self::Data(_) => Direction::SenderToReceiver,
			Self::Report(_) => Direction::ReceiverToSender,
			Self::ReportAck(_) => Direction::SenderToReceiver,
			Self::Cancel(s) => if s.from_sender { Direction::SenderToReceiver } else { Direction::ReceiverToSender },
			Self::CancelAck(s) => if s.from_sender { Direction::SenderToReceiver } else { Direction::ReceiverToSender },
		}
	}
}

/// Reads just the session identifier from the header, without decoding the
/// rest of the segment. Used to demultiplex inbound datagrams on a port
/// shared by several engines before any one of them owns the bytes.
pub fn peek_session(buf: &[u8]) -> Result<SessionId, DecodeError> {
	let header = *buf.first().ok_or(DecodeError::Malformed)?;
	check_version(header)?;
	let mut r = Reader::new(buf);
	r.pos = 1;
	r.session()
}

/// Reads only the header byte and returns which way the segment travels,
/// without validating or decoding the rest of the packet.
pub fn peek_direction(buf: &[u8]) -> Result<Direction, DecodeError> {
	let &first = buf.first().ok_or(DecodeError::Malformed)?;
	check_version(first)?;
	Ok(TypeCode::from_nibble(first & 0x0f)?.direction())
}

fn check_version(header: u8) -> Result<(), DecodeError> {
	let version = header >> 5;
	if version != 0 {
		return Err(DecodeError::UnsupportedVersion(version));
	}
	Ok(())
}

fn header_byte(type_code: TypeCode) -> u8 {
	type_code as u8
}

fn push_session(out: &mut Vec<u8>, session: SessionId) {
	sdnv::encode(session.originator_engine_id, out);
	sdnv::encode(session.session_number, out);
	// Header/trailer extension counts; this engine never emits extensions.
	sdnv::encode(0, out);
	sdnv::encode(0, out);
}

struct Reader<'a> {
	buf: &'a [u8],
	pos: usize,
}

impl<'a> Reader<'a> {
	fn new(buf: &'a [u8]) -> Self {
		Self { buf, pos: 0 }
	}

	fn sdnv(&mut self) -> Result<u64, DecodeError> {
		let (value, n) = sdnv::decode(&self.buf[self.pos..]).ok_or(DecodeError::Malformed)?;
		self.pos += n;
		Ok(value)
	}

	fn byte(&mut self) -> Result<u8, DecodeError> {
		let b = *self.buf.get(self.pos).ok_or(DecodeError::Malformed)?;
		self.pos += 1;
		Ok(b)
	}

	fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
		let end = self.pos.checked_add(n).ok_or(DecodeError::Malformed)?;
		let slice = self.buf.get(self.pos..end).ok_or(DecodeError::Malformed)?;
		self.pos = end;
		Ok(slice)
	}

	fn session(&mut self) -> Result<SessionId, DecodeError> {
		let originator_engine_id = self.sdnv()?;
		let session_number = self.sdnv()?;
		let header_ext_count = self.sdnv()?;
		let trailer_ext_count = self.sdnv()?;

		// Header/trailer extensions are not implemented; refuse anything that uses them.
		if header_ext_count != 0 || trailer_ext_count != 0 {
			return malformed();
		}

		Ok(SessionId { originator_engine_id, session_number })
	}
}

/// Decodes a segment from `buf`. `buf` must contain exactly one segment; any
/// trailing bytes after a valid segment are treated as malformed.
pub fn decode(buf: &[u8]) -> Result<Segment, DecodeError> {
	let header = *buf.first().ok_or(DecodeError::Malformed)?;
	check_version(header)?;
	let type_code = TypeCode::from_nibble(header & 0x0f)?;

	let mut r = Reader::new(buf);
	r.pos = 1;
	let session = r.session()?;

	let segment = match type_code {
		TypeCode::RedData | TypeCode::RedDataCheckpoint | TypeCode::RedDataCheckpointEorp | TypeCode::RedDataCheckpointEorpEob => {
			decode_data(&mut r, session, true, type_code)?
		}
		TypeCode::GreenData | TypeCode::GreenDataEob => decode_data(&mut r, session, false, type_code)?,
		TypeCode::Report => decode_report(&mut r, session)?,
		TypeCode::ReportAck => Segment::ReportAck(ReportAckSegment { session, report_serial: r.sdnv()? }),
		TypeCode::CancelFromSender => Segment::Cancel(CancelSegment { session, from_sender: true, reason: CancelReason::from_byte(r.byte()?) }),
		TypeCode::CancelFromReceiver => Segment::Cancel(CancelSegment { session, from_sender: false, reason: CancelReason::from_byte(r.byte()?) }),
		TypeCode::CancelAckFromSender => Segment::CancelAck(CancelAckSegment { session, from_sender: true }),
		TypeCode::CancelAckFromReceiver => Segment::CancelAck(CancelAckSegment { session, from_sender: false }),
	};

	if r.pos != buf.len() {
		return match &segment {
			// Data segments carry a trailing payload of exactly `length` bytes; that's expected.
			Segment::Data(_) => Ok(segment),
			_ => malformed(),
		};
	}

	Ok(segment)
}

fn decode_data(r: &mut Reader, session: SessionId, is_red: bool, type_code: TypeCode) -> Result<Segment, DecodeError> {
	let client_service_id = r.sdnv()?;
	let offset = r.sdnv()?;
	let length = r.sdnv()?;

	let flags = match type_code {
		TypeCode::RedDataCheckpoint => DataFlags { checkpoint: true, end_of_red_part: false, end_of_block: false },
		TypeCode::RedDataCheckpointEorp => DataFlags { checkpoint: true, end_of_red_part: true, end_of_block: false },
		TypeCode::RedDataCheckpointEorpEob => DataFlags { checkpoint: true, end_of_red_part: true, end_of_block: true },
		TypeCode::GreenDataEob => DataFlags { checkpoint: false, end_of_red_part: false, end_of_block: true },
		_ => DataFlags::default(),
	};

	let checkpoint = if flags.checkpoint {
		Some(CheckpointSerials { checkpoint_serial: r.sdnv()?, report_serial: r.sdnv()? })
	} else {
		None
	};

	let length: usize = length.try_into().map_err(|_| DecodeError::Malformed)?;
	let payload = r.bytes(length)?.to_vec();

	Ok(Segment::Data(DataSegment { session, is_red, flags, client_service_id, offset, checkpoint, payload }))
}

fn decode_report(r: &mut Reader, session: SessionId) -> Result<Segment, DecodeError> {
	let report_serial = r.sdnv()?;
	let checkpoint_serial = r.sdnv()?;
	let upper_bound = r.sdnv()?;
	let lower_bound = r.sdnv()?;

	if lower_bound > upper_bound {
		return malformed();
	}

	let claim_count: usize = r.sdnv()?.try_into().map_err(|_| DecodeError::Malformed)?;
	let mut claims = Vec::with_capacity(claim_count);
	let mut prev_end = None;

	for _ in 0..claim_count {
		let offset = r.sdnv()?;
		let length = r.sdnv()?;

		if length == 0 {
			return malformed();
		}

		let end = offset.checked_add(length).ok_or(DecodeError::Malformed)?;

		if offset < lower_bound || end > upper_bound {
			return malformed();
		}

		if let Some(prev_end) = prev_end {
			if offset < prev_end {
				return malformed();
			}
		}

		prev_end = Some(end);
		claims.push(ReceptionClaim { offset, length });
	}

	Ok(Segment::Report(ReportSegment { session, report_serial, checkpoint_serial, lower_bound, upper_bound, claims }))
}

pub fn encode_data(out: &mut Vec<u8>, seg: &DataSegment) {
	let type_code = match (seg.is_red, seg.flags) {
		(true, DataFlags { checkpoint: false, .. }) => TypeCode::RedData,
		(true, DataFlags { checkpoint: true, end_of_red_part: false, .. }) => TypeCode::RedDataCheckpoint,
		(true, DataFlags { checkpoint: true, end_of_red_part: true, end_of_block: false }) => TypeCode::RedDataCheckpointEorp,
		(true, DataFlags { checkpoint: true, end_of_red_part: true, end_of_block: true }) => TypeCode::RedDataCheckpointEorpEob,
		(false, DataFlags { end_of_block: false, .. }) => TypeCode::GreenData,
		(false, DataFlags { end_of_block: true, .. }) => TypeCode::GreenDataEob,
	};

	out.push(header_byte(type_code));
	push_session(out, seg.session);
	sdnv::encode(seg.client_service_id, out);
	sdnv::encode(seg.offset, out);
	sdnv::encode(seg.payload.len() as u64, out);

	if let Some(cp) = seg.checkpoint {
		sdnv::encode(cp.checkpoint_serial, out);
		sdnv::encode(cp.report_serial, out);
	}

	out.extend_from_slice(&seg.payload);
}

pub fn encode_report(out: &mut Vec<u8>, seg: &ReportSegment) {
	out.push(header_byte(TypeCode::Report));
	push_session(out, seg.session);
	sdnv::encode(seg.report_serial, out);
	sdnv::encode(seg.checkpoint_serial, out);
	sdnv::encode(seg.upper_bound, out);
	sdnv::encode(seg.lower_bound, out);
	sdnv::encode(seg.claims.len() as u64, out);

	for claim in &seg.claims {
		sdnv::encode(claim.offset, out);
		sdnv::encode(claim.length, out);
	}
}

pub fn encode_report_ack(out: &mut Vec<u8>, seg: &ReportAckSegment) {
	out.push(header_byte(TypeCode::ReportAck));
	push_session(out, seg.session);
	sdnv::encode(seg.report_serial, out);
}

pub fn encode_cancel(out: &mut Vec<u8>, seg: &CancelSegment) {
	out.push(header_byte(if seg.from_sender { TypeCode::CancelFromSender } else { TypeCode::CancelFromReceiver }));
	push_session(out, seg.session);
	out.push(seg.reason.to_byte());
}

pub fn encode_cancel_ack(out: &mut Vec<u8>, seg: &CancelAckSegment) {
	out.push(header_byte(if seg.from_sender { TypeCode::CancelAckFromSender } else { TypeCode::CancelAckFromReceiver }));
	push_session(out, seg.session);
}

/// The maximum bytes a report segment with `claim_count` claims will occupy,
/// assuming every SDNV field takes its worst-case 10-byte form.
pub fn report_segment_worst_case_len(claim_count: usize) -> usize {
	1 + 4 * sdnv::MAX_LEN + 5 * sdnv::MAX_LEN + claim_count * 2 * sdnv::MAX_LEN
}

#[cfg(test)]
mod tests {
	use super::*;

	fn session() -> SessionId {
		SessionId { originator_engine_id: 7, session_number: 42 }
	}

	#[test]
	fn data_segment_roundtrips() {
		let seg = DataSegment {
			session: session(),
			is_red: true,
			flags: DataFlags { checkpoint: true, end_of_red_part: true, end_of_block: true },
			client_service_id: 1,
			offset: 100,
			checkpoint: Some(CheckpointSerials { checkpoint_serial: 3, report_serial: 0 }),
			payload: b"hello".to_vec(),
		};

		let mut buf = Vec::new();
		encode_data(&mut buf, &seg);

		let Segment::Data(decoded) = decode(&buf).unwrap() else { panic!("wrong kind") };
		assert_eq!(decoded.session, session());
		assert_eq!(decoded.offset, 100);
		assert_eq!(decoded.payload, b"hello");
		assert!(decoded.flags.checkpoint && decoded.flags.end_of_red_part && decoded.flags.end_of_block);
	}

	#[test]
	fn report_segment_roundtrips_with_claims() {
		let seg = ReportSegment {
			session: session(),
			report_serial: 1,
			checkpoint_serial: 1,
			lower_bound: 0,
			upper_bound: 100,
			claims: vec![ReceptionClaim { offset: 0, length: 10 }, ReceptionClaim { offset: 20, length: 5 }],
		};

		let mut buf = Vec::new();
		encode_report(&mut buf, &seg);

		let Segment::Report(decoded) = decode(&buf).unwrap() else { panic!("wrong kind") };
		assert_eq!(decoded.claims.len(), 2);
		assert_eq!(decoded.claims[1].offset, 20);
	}

	#[test]
	fn overlapping_claims_are_malformed() {
		let seg = ReportSegment {
			session: session(),
			report_serial: 1,
			checkpoint_serial: 1,
			lower_bound: 0,
			upper_bound: 100,
			claims: vec![ReceptionClaim { offset: 0, length: 10 }, ReceptionClaim { offset: 5, length: 5 }],
		};

		let mut buf = Vec::new();
		encode_report(&mut buf, &seg);
		assert_eq!(decode(&buf), Err(DecodeError::Malformed));
	}

	#[test]
	fn unsupported_version_is_distinguishable() {
		let buf = [0b001_0_0000];
		assert_eq!(peek_direction(&buf), Err(DecodeError::UnsupportedVersion(1)));
	}

	#[test]
	fn cancel_segment_roundtrips_reason() {
		let seg = CancelSegment { session: session(), from_sender: true, reason: CancelReason::RetransmitLimitExceeded };
		let mut buf = Vec::new();
		encode_cancel(&mut buf, &seg);

		let Segment::Cancel(decoded) = decode(&buf).unwrap() else { panic!("wrong kind") };
		assert_eq!(decoded.reason, CancelReason::RetransmitLimitExceeded);
		assert!(decoded.from_sender);
	}

	#[test]
	fn direction_is_readable_without_full_decode() {
		let seg = ReportAckSegment { session: session(), report_serial: 9 };
		let mut buf = Vec::new();
		encode_report_ack(&mut buf, &seg);
		assert_eq!(peek_direction(&buf), Ok(Direction::SenderToReceiver));
	}

	#[test]
	fn peek_session_matches_the_decoded_segment() {
		let seg = ReportAckSegment { session: session(), report_serial: 9 };
		let mut buf = Vec::new();
		encode_report_ack(&mut buf, &seg);
		assert_eq!(peek_session(&buf), Ok(session()));
	}

	#[test]
	fn decoded_cancel_direction_follows_from_sender() {
		let seg = CancelSegment { session: session(), from_sender: false, reason: CancelReason::UserCancelled };
		let mut buf = Vec::new();
		encode_cancel(&mut buf, &seg);
		assert_eq!(decode(&buf).unwrap().direction(), Direction::ReceiverToSender);
	}
}
